//! Recorder - destinations for combined records
//!
//! The event builder hands every combined record to a [`RecordSink`]:
//! - [`DiscardSink`]: counts records only (saving disabled)
//! - [`MemorySink`]: keeps records in memory (tests, embedding)
//! - [`FileSink`]: writes a data file
//!
//! File naming: {prefix}infreq{F}_nColl{C}_nRB{S}.dat
//!   - F: nominal input trigger frequency in Hz
//!   - C: number of collector threads
//!   - S: number of sources (ring buffers)
//!
//! File format:
//! - Header: Magic "LSTDAQ01" + length (4 bytes LE) + MsgPack metadata
//! - Data: combined records back to back, `event_size * n_sources` bytes each
//! - Footer: Fixed 64 bytes with magic "LSTEND01", checksum, completion flag

mod format;

pub use format::{
    ChecksumCalculator, CombinedFileReader, FileFooter, FileFormatError, FileHeader,
    FileValidationResult, RecordIterator, FILE_MAGIC, FOOTER_MAGIC, FOOTER_SIZE, FORMAT_VERSION,
};

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::common::DaqResult;
use crate::record::trigger_number;

/// Consumer of combined records
pub trait RecordSink: Send {
    /// Take one combined record (`event_size * n_sources` bytes)
    fn accept(&mut self, record: &[u8]) -> DaqResult<()>;

    /// Flush and close; called once after the last record
    fn finish(&mut self) -> DaqResult<()> {
        Ok(())
    }

    /// Records accepted so far
    fn accepted(&self) -> u64;
}

/// Counts records and drops them
#[derive(Debug, Default)]
pub struct DiscardSink {
    records: u64,
    bytes: u64,
}

impl DiscardSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl RecordSink for DiscardSink {
    fn accept(&mut self, record: &[u8]) -> DaqResult<()> {
        self.records += 1;
        self.bytes += record.len() as u64;
        Ok(())
    }

    fn accepted(&self) -> u64 {
        self.records
    }
}

/// Keeps every record in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Vec<Vec<u8>>,
    finished: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &[Vec<u8>] {
        &self.records
    }

    pub fn into_records(self) -> Vec<Vec<u8>> {
        self.records
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl RecordSink for MemorySink {
    fn accept(&mut self, record: &[u8]) -> DaqResult<()> {
        self.records.push(record.to_vec());
        Ok(())
    }

    fn finish(&mut self) -> DaqResult<()> {
        self.finished = true;
        Ok(())
    }

    fn accepted(&self) -> u64 {
        self.records.len() as u64
    }
}

/// Writes combined records to a data file
pub struct FileSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    record_size: u64,
    checksum: ChecksumCalculator,
    footer: FileFooter,
}

impl FileSink {
    /// Data file name for a run
    pub fn file_name(prefix: &str, infreq: u32, n_collectors: usize, n_sources: usize) -> String {
        format!("{prefix}infreq{infreq}_nColl{n_collectors}_nRB{n_sources}.dat")
    }

    /// Create `path` (and its parent directories) and write the header
    pub fn create(path: impl AsRef<Path>, header: &FileHeader) -> DaqResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        if path.exists() {
            warn!(path = %path.display(), "Overwriting existing data file");
        }

        let file = File::create(&path)?;
        let mut writer = BufWriter::with_capacity(1024 * 1024, file);
        let header_size = header.write_to(&mut writer)?;

        info!(
            path = %path.display(),
            sources = header.n_sources,
            record_size = header.record_size(),
            header_size,
            "Opened data file"
        );

        Ok(Self {
            path,
            writer: Some(writer),
            record_size: header.record_size(),
            checksum: ChecksumCalculator::new(),
            footer: FileFooter::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RecordSink for FileSink {
    fn accept(&mut self, record: &[u8]) -> DaqResult<()> {
        if record.len() as u64 != self.record_size {
            return Err(FileFormatError::RecordSize {
                expected: self.record_size,
                actual: record.len() as u64,
            }
            .into());
        }
        let Some(writer) = self.writer.as_mut() else {
            return Err(std::io::Error::other("data file already closed").into());
        };

        writer.write_all(record)?;
        self.checksum.update(record);

        let trigger = trigger_number(record) as u64;
        if self.footer.total_records == 0 {
            self.footer.first_trigger = trigger;
        }
        self.footer.last_trigger = trigger;
        self.footer.total_records += 1;
        Ok(())
    }

    fn finish(&mut self) -> DaqResult<()> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(());
        };

        self.footer.data_checksum = self.checksum.finalize();
        self.footer.data_bytes = self.checksum.bytes_processed();
        self.footer.finalize();
        self.footer.write_to(&mut writer)?;

        writer.flush()?;
        writer.get_ref().sync_data()?;

        info!(
            path = %self.path.display(),
            records = self.footer.total_records,
            size_mb = self.footer.data_bytes as f64 / 1_000_000.0,
            checksum = format!("{:016x}", self.footer.data_checksum),
            "Closed data file"
        );
        Ok(())
    }

    fn accepted(&self) -> u64 {
        self.footer.total_records
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        if self.writer.is_some() {
            debug!(path = %self.path.display(), "Data file dropped without footer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::make_record;

    fn combined(trigger: u32) -> Vec<u8> {
        let mut record = make_record(32, trigger, trigger);
        record.extend(make_record(32, trigger, trigger));
        record
    }

    fn header() -> FileHeader {
        FileHeader::new(32, vec!["a:1".to_string(), "b:2".to_string()], 10)
    }

    #[test]
    fn test_file_name_format() {
        assert_eq!(
            FileSink::file_name("", 1000, 2, 4),
            "infreq1000_nColl2_nRB4.dat"
        );
        assert_eq!(
            FileSink::file_name("run7_", 0, 1, 1),
            "run7_infreq0_nColl1_nRB1.dat"
        );
    }

    #[test]
    fn test_discard_and_memory_sinks() {
        let mut discard = DiscardSink::new();
        discard.accept(&[0u8; 10]).unwrap();
        discard.accept(&[0u8; 10]).unwrap();
        assert_eq!(discard.accepted(), 2);
        assert_eq!(discard.bytes(), 20);

        let mut memory = MemorySink::new();
        memory.accept(&[1, 2, 3]).unwrap();
        memory.finish().unwrap();
        assert!(memory.is_finished());
        assert_eq!(memory.into_records(), vec![vec![1, 2, 3]]);
    }

    #[test]
    fn test_file_sink_writes_readable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join(FileSink::file_name("", 0, 1, 2));

        let mut sink = FileSink::create(&path, &header()).unwrap();
        for trigger in 5..9 {
            sink.accept(&combined(trigger)).unwrap();
        }
        assert_eq!(sink.accepted(), 4);
        sink.finish().unwrap();
        sink.finish().unwrap();

        let mut reader = CombinedFileReader::new(File::open(&path).unwrap()).unwrap();
        assert_eq!(reader.header().endpoints, vec!["a:1", "b:2"]);
        let footer = *reader.footer().unwrap();
        assert_eq!(footer.total_records, 4);
        assert_eq!(footer.first_trigger, 5);
        assert_eq!(footer.last_trigger, 8);

        let result = reader.validate().unwrap();
        assert!(result.is_valid, "{:?}", result.errors);

        let triggers: Vec<u32> = reader
            .records()
            .unwrap()
            .map(|r| trigger_number(&r.unwrap()))
            .collect();
        assert_eq!(triggers, vec![5, 6, 7, 8]);
    }

    #[test]
    fn test_file_sink_rejects_wrong_size() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileSink::create(dir.path().join("x.dat"), &header()).unwrap();
        assert!(sink.accept(&[0u8; 10]).is_err());
        assert_eq!(sink.accepted(), 0);
    }

    #[test]
    fn test_unfinished_file_needs_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crash.dat");
        {
            let mut sink = FileSink::create(&path, &header()).unwrap();
            sink.accept(&combined(0)).unwrap();
            sink.accept(&combined(1)).unwrap();
        }

        let mut reader = CombinedFileReader::new(File::open(&path).unwrap()).unwrap();
        let result = reader.validate().unwrap();
        assert!(result.needs_recovery());
        assert_eq!(result.complete_records, 2);
    }
}
