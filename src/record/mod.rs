//! FEB event record layout
//!
//! Each FEB sends one fixed-length record per accepted trigger. The first
//! 24 bytes are a header; the rest is the DRS4 readout payload, which the
//! DAQ never interprets.
//!
//! ```text
//! offset  len  field
//!      0    2  sync marker (0xAAAA)
//!      2    2  PPS counter
//!      4    4  10 MHz counter
//!      8    4  event counter
//!     12    4  trigger counter
//!     16    8  local 133 MHz clock
//! ```
//!
//! The FEB transmits every field most-significant byte first, which is the
//! reverse of the little-endian hosts the DAQ runs on. Every accessor below
//! performs that byte-order reversal; nothing reinterprets record memory.

use thiserror::Error;

/// Samples per gain channel read out of the DRS4
pub const READ_DEPTH: usize = 100;

/// Default record size: (depth * 2 gains + 2 header lines + flag + stop cell) * 16 bytes
pub const DEFAULT_EVENT_SIZE: usize = (READ_DEPTH * 2 + 2 + 1 + 1) * 16;

/// Expected value of the sync marker
pub const SYNC_MARKER: u16 = 0xAAAA;

pub const SYNC_OFFSET: usize = 0;
pub const SYNC_LEN: usize = 2;
pub const PPS_OFFSET: usize = SYNC_OFFSET + SYNC_LEN;
pub const PPS_LEN: usize = 2;
pub const TEN_MHZ_OFFSET: usize = PPS_OFFSET + PPS_LEN;
pub const TEN_MHZ_LEN: usize = 4;
pub const EVENT_NUMBER_OFFSET: usize = TEN_MHZ_OFFSET + TEN_MHZ_LEN;
pub const EVENT_NUMBER_LEN: usize = 4;
pub const TRIGGER_NUMBER_OFFSET: usize = EVENT_NUMBER_OFFSET + EVENT_NUMBER_LEN;
pub const TRIGGER_NUMBER_LEN: usize = 4;
pub const CLOCK_OFFSET: usize = TRIGGER_NUMBER_OFFSET + TRIGGER_NUMBER_LEN;
pub const CLOCK_LEN: usize = 8;

/// Bytes occupied by the header
pub const HEADER_LEN: usize = CLOCK_OFFSET + CLOCK_LEN;

/// Record parsing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("Record too short: {len} bytes, header needs {HEADER_LEN}")]
    TooShort { len: usize },
}

#[inline]
fn field<const N: usize>(record: &[u8], offset: usize) -> [u8; N] {
    let mut bytes = [0u8; N];
    bytes.copy_from_slice(&record[offset..offset + N]);
    bytes
}

/// Sync marker, byte-swapped from wire order.
///
/// # Panics
/// All accessors panic if `record` is shorter than [`HEADER_LEN`].
#[inline]
pub fn sync_marker(record: &[u8]) -> u16 {
    u16::from_be_bytes(field(record, SYNC_OFFSET))
}

/// PPS counter, byte-swapped from wire order
#[inline]
pub fn pps_counter(record: &[u8]) -> u16 {
    u16::from_be_bytes(field(record, PPS_OFFSET))
}

/// 10 MHz counter, byte-swapped from wire order
#[inline]
pub fn ten_mhz_counter(record: &[u8]) -> u32 {
    u32::from_be_bytes(field(record, TEN_MHZ_OFFSET))
}

/// Event counter (counts successful readouts), byte-swapped from wire order
#[inline]
pub fn event_number(record: &[u8]) -> u32 {
    u32::from_be_bytes(field(record, EVENT_NUMBER_OFFSET))
}

/// Trigger counter (counts accepted triggers), byte-swapped from wire order
#[inline]
pub fn trigger_number(record: &[u8]) -> u32 {
    u32::from_be_bytes(field(record, TRIGGER_NUMBER_OFFSET))
}

/// Local 133 MHz clock, byte-swapped from wire order
#[inline]
pub fn local_clock(record: &[u8]) -> u64 {
    u64::from_be_bytes(field(record, CLOCK_OFFSET))
}

/// Decoded record header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventHeader {
    pub sync: u16,
    pub pps: u16,
    pub ten_mhz: u32,
    pub event_number: u32,
    pub trigger_number: u32,
    pub clock: u64,
}

impl EventHeader {
    /// Decode the header of a raw record
    pub fn parse(record: &[u8]) -> Result<Self, RecordError> {
        if record.len() < HEADER_LEN {
            return Err(RecordError::TooShort { len: record.len() });
        }
        Ok(Self {
            sync: sync_marker(record),
            pps: pps_counter(record),
            ten_mhz: ten_mhz_counter(record),
            event_number: event_number(record),
            trigger_number: trigger_number(record),
            clock: local_clock(record),
        })
    }

    /// Whether the sync marker matches [`SYNC_MARKER`]
    pub fn has_valid_sync(&self) -> bool {
        self.sync == SYNC_MARKER
    }

    /// Encode into the first [`HEADER_LEN`] bytes of `record` in wire order
    ///
    /// Used by the emulator and tests to produce FEB-shaped records.
    pub fn write_to(&self, record: &mut [u8]) -> Result<(), RecordError> {
        if record.len() < HEADER_LEN {
            return Err(RecordError::TooShort { len: record.len() });
        }
        record[SYNC_OFFSET..PPS_OFFSET].copy_from_slice(&self.sync.to_be_bytes());
        record[PPS_OFFSET..TEN_MHZ_OFFSET].copy_from_slice(&self.pps.to_be_bytes());
        record[TEN_MHZ_OFFSET..EVENT_NUMBER_OFFSET].copy_from_slice(&self.ten_mhz.to_be_bytes());
        record[EVENT_NUMBER_OFFSET..TRIGGER_NUMBER_OFFSET]
            .copy_from_slice(&self.event_number.to_be_bytes());
        record[TRIGGER_NUMBER_OFFSET..CLOCK_OFFSET]
            .copy_from_slice(&self.trigger_number.to_be_bytes());
        record[CLOCK_OFFSET..HEADER_LEN].copy_from_slice(&self.clock.to_be_bytes());
        Ok(())
    }
}

/// Build a complete record of `event_size` bytes with the given counters
///
/// The payload is filled with the low byte of the trigger number so that
/// misplaced bytes are easy to spot.
pub fn make_record(event_size: usize, event_number: u32, trigger_number: u32) -> Vec<u8> {
    let mut record = vec![trigger_number as u8; event_size.max(HEADER_LEN)];
    let header = EventHeader {
        sync: SYNC_MARKER,
        event_number,
        trigger_number,
        ..Default::default()
    };
    // Length is at least HEADER_LEN, so encoding cannot fail
    let _ = header.write_to(&mut record);
    record
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_constants() {
        assert_eq!(EVENT_NUMBER_OFFSET, 8);
        assert_eq!(TRIGGER_NUMBER_OFFSET, 12);
        assert_eq!(CLOCK_OFFSET, 16);
        assert_eq!(HEADER_LEN, 24);
        assert_eq!(DEFAULT_EVENT_SIZE, 3264);
    }

    #[test]
    fn test_accessors_reverse_byte_order() {
        let mut record = vec![0u8; 32];
        record[0..2].copy_from_slice(&[0xAA, 0xAA]);
        record[8..12].copy_from_slice(&[0x00, 0x00, 0x01, 0x02]);
        record[12..16].copy_from_slice(&[0x00, 0x01, 0x00, 0x00]);
        record[16..24].copy_from_slice(&[0, 0, 0, 0, 0, 0, 0x10, 0x00]);

        assert_eq!(sync_marker(&record), SYNC_MARKER);
        assert_eq!(event_number(&record), 0x0102);
        assert_eq!(trigger_number(&record), 0x0001_0000);
        assert_eq!(local_clock(&record), 0x1000);
    }

    #[test]
    fn test_header_write_parse() {
        let header = EventHeader {
            sync: SYNC_MARKER,
            pps: 7,
            ten_mhz: 123_456,
            event_number: 41,
            trigger_number: 42,
            clock: 0xDEAD_BEEF_0000_0001,
        };
        let mut record = vec![0u8; 64];
        header.write_to(&mut record).unwrap();

        let parsed = EventHeader::parse(&record).unwrap();
        assert_eq!(parsed, header);
        assert!(parsed.has_valid_sync());
    }

    #[test]
    fn test_parse_too_short() {
        let record = [0u8; 10];
        assert_eq!(
            EventHeader::parse(&record),
            Err(RecordError::TooShort { len: 10 })
        );
    }

    #[test]
    fn test_make_record() {
        let record = make_record(100, 3, 5);
        assert_eq!(record.len(), 100);
        assert_eq!(event_number(&record), 3);
        assert_eq!(trigger_number(&record), 5);
        assert_eq!(record[99], 5);
    }
}
