//! File format structures for combined-record data files
//!
//! File structure:
//! ```text
//! ┌─────────────────────────────────────────┐
//! │  Header (length-prefixed MsgPack)        │
//! │  - Magic, Version, Run metadata          │
//! ├─────────────────────────────────────────┤
//! │  Combined record 0                       │
//! │  - event_size bytes per source, in       │
//! │    source order, no framing              │
//! ├─────────────────────────────────────────┤
//! │  ...                                    │
//! ├─────────────────────────────────────────┤
//! │  Footer (fixed 64 bytes)                │
//! │  - Magic, checksum, completion flag     │
//! └─────────────────────────────────────────┘
//! ```
//!
//! Records have a fixed size given by the header, so a file whose footer is
//! missing can still be read up to its last complete record.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh64::Xxh64;

/// Magic bytes for LSTDAQ data files
pub const FILE_MAGIC: [u8; 8] = *b"LSTDAQ01";

/// Current file format version
pub const FORMAT_VERSION: u32 = 1;

/// Footer magic bytes (different from header to detect truncation)
pub const FOOTER_MAGIC: [u8; 8] = *b"LSTEND01";

/// Fixed footer size in bytes
pub const FOOTER_SIZE: usize = 64;

/// Seed of the data checksum
const CHECKSUM_SEED: u64 = 0;

/// Upper bound on the encoded header, to reject garbage length prefixes
const MAX_HEADER_LEN: usize = 16 * 1024 * 1024;

/// File header describing the run and the record layout
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileHeader {
    /// Format version
    pub version: u32,

    /// Bytes per source record
    pub event_size: u32,

    /// Source records per combined record
    pub n_sources: u32,

    /// Collector threads used for the run
    pub n_collectors: u32,

    /// Source endpoints in record order ("host:port")
    pub endpoints: Vec<String>,

    /// Records requested from each source
    pub quota: u64,

    /// Nominal input trigger frequency in Hz
    pub infreq: u32,

    /// File creation time
    pub started_at: DateTime<Utc>,

    /// Additional key-value metadata
    pub metadata: HashMap<String, String>,
}

impl FileHeader {
    /// Create a header for `endpoints.len()` sources of `event_size` bytes
    pub fn new(event_size: u32, endpoints: Vec<String>, quota: u64) -> Self {
        Self {
            version: FORMAT_VERSION,
            event_size,
            n_sources: endpoints.len() as u32,
            n_collectors: 0,
            endpoints,
            quota,
            infreq: 0,
            started_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// Bytes per combined record
    pub fn record_size(&self) -> u64 {
        self.event_size as u64 * self.n_sources as u64
    }

    /// Serialize header to bytes (with magic prefix)
    pub fn to_bytes(&self) -> Result<Vec<u8>, FileFormatError> {
        let body = rmp_serde::to_vec_named(self)?;
        let mut buf = Vec::with_capacity(12 + body.len());
        buf.extend_from_slice(&FILE_MAGIC);
        buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    /// Write header to a writer, returning the bytes written
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<usize, FileFormatError> {
        let bytes = self.to_bytes()?;
        writer.write_all(&bytes)?;
        Ok(bytes.len())
    }

    /// Read header from a reader, returning it with its encoded size
    pub fn read_from<R: Read>(reader: &mut R) -> Result<(Self, u64), FileFormatError> {
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if magic != FILE_MAGIC {
            return Err(FileFormatError::InvalidMagic);
        }

        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_HEADER_LEN {
            return Err(FileFormatError::HeaderTooLarge(len));
        }

        let mut body = vec![0u8; len];
        reader.read_exact(&mut body)?;
        let header: Self = rmp_serde::from_slice(&body)?;
        if header.version != FORMAT_VERSION {
            return Err(FileFormatError::UnsupportedVersion(header.version));
        }
        Ok((header, 12 + len as u64))
    }
}

/// File footer with checksum and completion status
///
/// Fixed 64-byte structure for easy seeking to file end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileFooter {
    /// xxHash64 of the data region (every combined record, in order)
    pub data_checksum: u64,

    /// Combined records written
    pub total_records: u64,

    /// Bytes in the data region
    pub data_bytes: u64,

    /// Trigger number of the first combined record
    pub first_trigger: u64,

    /// Trigger number of the last combined record
    pub last_trigger: u64,

    /// File end time (Unix timestamp in nanoseconds)
    pub file_end_time_ns: u64,

    /// Write completion flag (1 = complete, 0 = incomplete/crashed)
    pub write_complete: u8,
}

impl Default for FileFooter {
    fn default() -> Self {
        Self::new()
    }
}

impl FileFooter {
    pub fn new() -> Self {
        Self {
            data_checksum: 0,
            total_records: 0,
            data_bytes: 0,
            first_trigger: 0,
            last_trigger: 0,
            file_end_time_ns: 0,
            write_complete: 0,
        }
    }

    /// Mark as complete and set end time
    pub fn finalize(&mut self) {
        self.write_complete = 1;
        self.file_end_time_ns = Utc::now()
            .timestamp_nanos_opt()
            .map(|ns| ns as u64)
            .unwrap_or_default();
    }

    pub fn is_complete(&self) -> bool {
        self.write_complete == 1
    }

    /// Serialize footer to fixed 64-byte array
    pub fn to_bytes(&self) -> [u8; FOOTER_SIZE] {
        let mut buf = [0u8; FOOTER_SIZE];
        buf[0..8].copy_from_slice(&FOOTER_MAGIC);
        buf[8..16].copy_from_slice(&self.data_checksum.to_le_bytes());
        buf[16..24].copy_from_slice(&self.total_records.to_le_bytes());
        buf[24..32].copy_from_slice(&self.data_bytes.to_le_bytes());
        buf[32..40].copy_from_slice(&self.first_trigger.to_le_bytes());
        buf[40..48].copy_from_slice(&self.last_trigger.to_le_bytes());
        buf[48..56].copy_from_slice(&self.file_end_time_ns.to_le_bytes());
        buf[56] = self.write_complete;
        // 57..64 reserved
        buf
    }

    /// Deserialize footer from 64-byte array
    pub fn from_bytes(data: &[u8; FOOTER_SIZE]) -> Result<Self, FileFormatError> {
        if data[0..8] != FOOTER_MAGIC {
            return Err(FileFormatError::InvalidFooterMagic);
        }
        let word = |offset: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&data[offset..offset + 8]);
            u64::from_le_bytes(bytes)
        };
        Ok(Self {
            data_checksum: word(8),
            total_records: word(16),
            data_bytes: word(24),
            first_trigger: word(32),
            last_trigger: word(40),
            file_end_time_ns: word(48),
            write_complete: data[56],
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), FileFormatError> {
        writer.write_all(&self.to_bytes())?;
        Ok(())
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, FileFormatError> {
        let mut buf = [0u8; FOOTER_SIZE];
        reader.read_exact(&mut buf)?;
        Self::from_bytes(&buf)
    }
}

/// Streaming xxHash64 over the data region
pub struct ChecksumCalculator {
    hasher: Xxh64,
    bytes_processed: u64,
}

impl std::fmt::Debug for ChecksumCalculator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChecksumCalculator")
            .field("bytes_processed", &self.bytes_processed)
            .finish()
    }
}

impl Default for ChecksumCalculator {
    fn default() -> Self {
        Self::new()
    }
}

impl ChecksumCalculator {
    pub fn new() -> Self {
        Self {
            hasher: Xxh64::new(CHECKSUM_SEED),
            bytes_processed: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes_processed += data.len() as u64;
    }

    pub fn finalize(&self) -> u64 {
        self.hasher.digest()
    }

    pub fn bytes_processed(&self) -> u64 {
        self.bytes_processed
    }
}

/// File format errors
#[derive(Debug, thiserror::Error)]
pub enum FileFormatError {
    #[error("Header length {0} exceeds the 16 MiB limit")]
    HeaderTooLarge(usize),

    #[error("Invalid file magic bytes")]
    InvalidMagic,

    #[error("Invalid footer magic bytes")]
    InvalidFooterMagic,

    #[error("Unsupported format version {0}")]
    UnsupportedVersion(u32),

    #[error("Deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Checksum mismatch: expected {expected:016x}, got {actual:016x}")]
    ChecksumMismatch { expected: u64, actual: u64 },

    #[error("Record of {actual} bytes does not match the {expected}-byte layout")]
    RecordSize { expected: u64, actual: u64 },

    #[error("Header describes zero-byte records")]
    EmptyLayout,

    #[error("Incomplete file (footer indicates crash during write)")]
    IncompleteFile,
}

/// Result of file validation
#[derive(Debug)]
pub struct FileValidationResult {
    /// Footer present, complete, and checksum matches
    pub is_valid: bool,
    pub header: FileHeader,
    pub footer: Option<FileFooter>,
    /// Complete combined records found in the data region
    pub complete_records: u64,
    /// Bytes after the last complete record
    pub trailing_bytes: u64,
    pub errors: Vec<String>,
}

impl FileValidationResult {
    /// Check if file needs recovery (has data but is not valid)
    pub fn needs_recovery(&self) -> bool {
        !self.is_valid && self.complete_records > 0
    }
}

/// Reader for combined-record data files
pub struct CombinedFileReader<R> {
    reader: R,
    header: FileHeader,
    footer: Option<FileFooter>,
    header_size: u64,
    data_end: u64,
}

impl<R: Read + Seek> CombinedFileReader<R> {
    /// Open a data file; a missing or damaged footer is not an error here
    pub fn new(mut reader: R) -> Result<Self, FileFormatError> {
        let file_size = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(0))?;
        let (header, header_size) = FileHeader::read_from(&mut reader)?;
        if header.record_size() == 0 {
            return Err(FileFormatError::EmptyLayout);
        }

        let mut footer = None;
        if file_size >= header_size + FOOTER_SIZE as u64 {
            reader.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
            footer = FileFooter::read_from(&mut reader).ok();
        }
        let data_end = match footer {
            Some(_) => file_size - FOOTER_SIZE as u64,
            None => file_size,
        };

        Ok(Self {
            reader,
            header,
            footer,
            header_size,
            data_end,
        })
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    pub fn footer(&self) -> Option<&FileFooter> {
        self.footer.as_ref()
    }

    pub fn record_size(&self) -> u64 {
        self.header.record_size()
    }

    /// Complete combined records available in the data region
    pub fn record_count(&self) -> u64 {
        (self.data_end - self.header_size) / self.record_size()
    }

    /// Iterate over complete combined records
    pub fn records(&mut self) -> Result<RecordIterator<'_, R>, FileFormatError> {
        self.reader.seek(SeekFrom::Start(self.header_size))?;
        Ok(RecordIterator {
            remaining: self.record_count(),
            record_size: self.record_size() as usize,
            reader: &mut self.reader,
        })
    }

    /// Check footer, completion flag and checksum
    pub fn validate(&mut self) -> Result<FileValidationResult, FileFormatError> {
        let data_bytes = self.data_end - self.header_size;
        let complete_records = data_bytes / self.record_size();
        let mut result = FileValidationResult {
            is_valid: false,
            header: self.header.clone(),
            footer: self.footer,
            complete_records,
            trailing_bytes: data_bytes % self.record_size(),
            errors: Vec::new(),
        };

        let Some(footer) = self.footer else {
            result.errors.push("Missing or invalid footer".to_string());
            return Ok(result);
        };
        if !footer.is_complete() {
            result
                .errors
                .push("File incomplete (crash during write)".to_string());
        }
        if footer.data_bytes != data_bytes {
            result.errors.push(format!(
                "Footer records {} data bytes, file holds {data_bytes}",
                footer.data_bytes
            ));
        }
        if footer.total_records != complete_records {
            result.errors.push(format!(
                "Footer records {} combined records, file holds {complete_records}",
                footer.total_records
            ));
        }

        let mut calc = ChecksumCalculator::new();
        for record in self.records()? {
            calc.update(&record?);
        }
        if calc.finalize() != footer.data_checksum {
            result.errors.push(
                FileFormatError::ChecksumMismatch {
                    expected: footer.data_checksum,
                    actual: calc.finalize(),
                }
                .to_string(),
            );
        }

        result.is_valid = result.errors.is_empty();
        Ok(result)
    }
}

/// Iterator over fixed-size combined records
pub struct RecordIterator<'a, R> {
    reader: &'a mut R,
    record_size: usize,
    remaining: u64,
}

impl<R: Read> Iterator for RecordIterator<'_, R> {
    type Item = Result<Vec<u8>, FileFormatError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let mut record = vec![0u8; self.record_size];
        match self.reader.read_exact(&mut record) {
            Ok(()) => {
                self.remaining -= 1;
                Some(Ok(record))
            }
            Err(e) => {
                self.remaining = 0;
                Some(Err(FileFormatError::Io(e)))
            }
        }
    }
}
