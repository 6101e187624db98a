//! Fixed-capacity circular buffer of fixed-size event records
//!
//! One collector thread writes raw bytes for one FEB; the event builder
//! reads whole records back out. The buffer absorbs the timing differences
//! between FEB streams so that a slow source does not stall its peers.
//!
//! Architecture:
//! - Cursors and counters live behind one `parking_lot::Mutex`
//! - A `Condvar` lets the reader wake a writer waiting for free slots
//! - Lifetime counters are mirrored into atomics for lock-free sampling
//!
//! Writes may carry any number of bytes; partial records accumulate in the
//! current slot until the record boundary is crossed. A write is all or
//! nothing: either every byte lands, or the buffer is left untouched and
//! [`WriteOutcome::WouldOverflow`] is returned.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::common::{DaqError, DaqResult};

/// Default number of record slots per buffer
pub const DEFAULT_CAPACITY: usize = 50_000;

/// Default bound on how long a write waits for the reader to free a slot
pub const DEFAULT_OVERFLOW_WAIT: Duration = Duration::from_micros(1000);

/// Result of [`EventBuffer::write`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// All bytes were appended
    Written,
    /// Completing the chunk would overwrite unread records; nothing was written
    WouldOverflow,
}

/// Result of [`EventBuffer::read`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// One record was copied out
    Read,
    /// No complete record is available
    Empty,
}

struct Cursors {
    data: Box<[u8]>,
    /// Byte offset of the next write
    write_offset: usize,
    /// Bytes already written into the current (incomplete) slot
    partial: usize,
    /// Byte offset of the next record to read
    read_offset: usize,
    total_written: u64,
    total_read: u64,
}

impl Cursors {
    #[inline]
    fn free_for(&self, slots: u64, capacity: u64) -> bool {
        self.total_written + slots <= self.total_read + capacity
    }
}

/// Single-producer/single-consumer circular buffer of fixed-size records
///
/// Invariant: `written_count() - read_count() <= capacity()` at all times.
pub struct EventBuffer {
    event_size: usize,
    capacity: usize,
    overflow_wait: Duration,
    cursors: Mutex<Cursors>,
    space_freed: Condvar,
    written: AtomicU64,
    read: AtomicU64,
}

impl std::fmt::Debug for EventBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBuffer")
            .field("event_size", &self.event_size)
            .field("capacity", &self.capacity)
            .field("written", &self.written_count())
            .field("read", &self.read_count())
            .finish()
    }
}

impl EventBuffer {
    /// Create a buffer holding `capacity` records of `event_size` bytes
    pub fn new(capacity: usize, event_size: usize) -> DaqResult<Self> {
        if capacity == 0 {
            return Err(DaqError::config("buffer capacity must be at least one record"));
        }
        if event_size == 0 {
            return Err(DaqError::config("event size must be positive"));
        }
        let bytes = capacity.checked_mul(event_size).ok_or_else(|| {
            DaqError::config(format!(
                "buffer of {capacity} x {event_size} bytes does not fit in memory"
            ))
        })?;

        Ok(Self {
            event_size,
            capacity,
            overflow_wait: DEFAULT_OVERFLOW_WAIT,
            cursors: Mutex::new(Cursors {
                data: vec![0u8; bytes].into_boxed_slice(),
                write_offset: 0,
                partial: 0,
                read_offset: 0,
                total_written: 0,
                total_read: 0,
            }),
            space_freed: Condvar::new(),
            written: AtomicU64::new(0),
            read: AtomicU64::new(0),
        })
    }

    /// Set the bound on how long a write waits for free slots
    pub fn with_overflow_wait(mut self, wait: Duration) -> Self {
        self.overflow_wait = wait;
        self
    }

    pub fn event_size(&self) -> usize {
        self.event_size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append `chunk` to the tail of the buffer
    ///
    /// The chunk need not be a whole record. Completing a record advances
    /// `written_count()`. If the slots the chunk touches are not free, the
    /// call waits up to the overflow bound for the reader and then gives up
    /// with [`WriteOutcome::WouldOverflow`], leaving the buffer unchanged.
    /// The caller decides whether to drop the chunk or retry.
    pub fn write(&self, chunk: &[u8]) -> WriteOutcome {
        if chunk.is_empty() {
            return WriteOutcome::Written;
        }

        let capacity = self.capacity as u64;
        let mut cursors = self.cursors.lock();

        let touched = (cursors.partial + chunk.len()).div_ceil(self.event_size) as u64;
        if touched > capacity {
            return WriteOutcome::WouldOverflow;
        }

        if !cursors.free_for(touched, capacity) {
            let deadline = Instant::now() + self.overflow_wait;
            while !cursors.free_for(touched, capacity) {
                if self
                    .space_freed
                    .wait_until(&mut cursors, deadline)
                    .timed_out()
                    && !cursors.free_for(touched, capacity)
                {
                    return WriteOutcome::WouldOverflow;
                }
            }
        }

        let total_bytes = cursors.data.len();
        let mut remaining = chunk;
        while !remaining.is_empty() {
            let offset = cursors.write_offset;
            let contiguous = remaining.len().min(total_bytes - offset);
            cursors.data[offset..offset + contiguous].copy_from_slice(&remaining[..contiguous]);
            cursors.write_offset = (offset + contiguous) % total_bytes;
            remaining = &remaining[contiguous..];
        }

        let filled = cursors.partial + chunk.len();
        cursors.total_written += (filled / self.event_size) as u64;
        cursors.partial = filled % self.event_size;
        self.written.store(cursors.total_written, Ordering::Release);

        WriteOutcome::Written
    }

    /// Copy the oldest complete record into `out` without blocking
    ///
    /// # Panics
    /// Panics if `out` is shorter than `event_size()`.
    pub fn read(&self, out: &mut [u8]) -> ReadOutcome {
        let out = &mut out[..self.event_size];
        let mut cursors = self.cursors.lock();
        if cursors.total_written == cursors.total_read {
            return ReadOutcome::Empty;
        }

        let offset = cursors.read_offset;
        out.copy_from_slice(&cursors.data[offset..offset + self.event_size]);
        cursors.read_offset = (offset + self.event_size) % cursors.data.len();
        cursors.total_read += 1;
        self.read.store(cursors.total_read, Ordering::Release);
        drop(cursors);

        self.space_freed.notify_one();
        ReadOutcome::Read
    }

    /// Discard every complete unread record, returning how many were dropped
    ///
    /// A partially written record stays in place so the writer can finish it.
    pub fn drain(&self) -> u64 {
        let mut cursors = self.cursors.lock();
        let pending = cursors.total_written - cursors.total_read;
        if pending == 0 {
            return 0;
        }
        let total_bytes = cursors.data.len() as u64;
        let advance = (pending * self.event_size as u64) % total_bytes;
        cursors.read_offset = ((cursors.read_offset as u64 + advance) % total_bytes) as usize;
        cursors.total_read = cursors.total_written;
        self.read.store(cursors.total_read, Ordering::Release);
        drop(cursors);

        self.space_freed.notify_all();
        pending
    }

    /// Lifetime count of complete records written (monotonic)
    #[inline]
    pub fn written_count(&self) -> u64 {
        self.written.load(Ordering::Acquire)
    }

    /// Lifetime count of records read (monotonic)
    #[inline]
    pub fn read_count(&self) -> u64 {
        self.read.load(Ordering::Acquire)
    }

    /// Complete records waiting to be read
    pub fn pending(&self) -> u64 {
        let cursors = self.cursors.lock();
        cursors.total_written - cursors.total_read
    }

    pub fn is_empty(&self) -> bool {
        self.pending() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{make_record, trigger_number};
    use rand::prelude::*;
    use rand::rngs::StdRng;
    use std::sync::Arc;

    const EVENT_SIZE: usize = 32;

    fn buffer(capacity: usize) -> EventBuffer {
        EventBuffer::new(capacity, EVENT_SIZE)
            .unwrap()
            .with_overflow_wait(Duration::from_millis(1))
    }

    #[test]
    fn test_rejects_zero_sizes() {
        assert!(EventBuffer::new(0, EVENT_SIZE).is_err());
        assert!(EventBuffer::new(4, 0).is_err());
    }

    #[test]
    fn test_read_from_empty_buffer() {
        let buf = buffer(4);
        let mut out = [0u8; EVENT_SIZE];
        assert_eq!(buf.read(&mut out), ReadOutcome::Empty);
        assert_eq!(buf.read_count(), 0);
    }

    #[test]
    fn test_fifo_order() {
        let buf = buffer(8);
        for trg in 0..5 {
            assert_eq!(buf.write(&make_record(EVENT_SIZE, trg, trg)), WriteOutcome::Written);
        }
        assert_eq!(buf.written_count(), 5);

        let mut out = [0u8; EVENT_SIZE];
        for trg in 0..5 {
            assert_eq!(buf.read(&mut out), ReadOutcome::Read);
            assert_eq!(trigger_number(&out), trg);
        }
        assert_eq!(buf.read(&mut out), ReadOutcome::Empty);
    }

    #[test]
    fn test_partial_writes_accumulate() {
        let record = make_record(EVENT_SIZE, 9, 9);
        for split in 1..EVENT_SIZE {
            let buf = buffer(2);
            assert_eq!(buf.write(&record[..split]), WriteOutcome::Written);
            assert_eq!(buf.written_count(), 0);

            let mut out = [0u8; EVENT_SIZE];
            assert_eq!(buf.read(&mut out), ReadOutcome::Empty);

            assert_eq!(buf.write(&record[split..]), WriteOutcome::Written);
            assert_eq!(buf.written_count(), 1);
            assert_eq!(buf.read(&mut out), ReadOutcome::Read);
            assert_eq!(&out[..], &record[..]);
        }
    }

    #[test]
    fn test_chunk_spanning_record_boundary() {
        let buf = buffer(4);
        let mut stream = make_record(EVENT_SIZE, 0, 0);
        stream.extend(make_record(EVENT_SIZE, 1, 1));

        assert_eq!(buf.write(&stream[..10]), WriteOutcome::Written);
        assert_eq!(buf.write(&stream[10..50]), WriteOutcome::Written);
        assert_eq!(buf.written_count(), 1);
        assert_eq!(buf.write(&stream[50..]), WriteOutcome::Written);
        assert_eq!(buf.written_count(), 2);

        let mut out = [0u8; EVENT_SIZE];
        buf.read(&mut out);
        assert_eq!(&out[..], &stream[..EVENT_SIZE]);
        buf.read(&mut out);
        assert_eq!(&out[..], &stream[EVENT_SIZE..]);
    }

    #[test]
    fn test_wraps_at_physical_end() {
        let capacity = 4;
        let buf = buffer(capacity);
        let mut out = [0u8; EVENT_SIZE];

        for trg in 0..(capacity as u32 * 3 + 1) {
            let record = make_record(EVENT_SIZE, trg, trg);
            assert_eq!(buf.write(&record), WriteOutcome::Written);
            assert_eq!(buf.read(&mut out), ReadOutcome::Read);
            assert_eq!(&out[..], &record[..], "trigger {trg} misplaced");
        }
    }

    #[test]
    fn test_partial_record_wraps_with_full_buffer_history() {
        let buf = buffer(2);
        let mut out = [0u8; EVENT_SIZE];
        for trg in 0..2 {
            buf.write(&make_record(EVENT_SIZE, trg, trg));
        }
        buf.read(&mut out);

        // Slot 0 is free again; a split record must land there intact
        let record = make_record(EVENT_SIZE, 2, 2);
        assert_eq!(buf.write(&record[..7]), WriteOutcome::Written);
        assert_eq!(buf.write(&record[7..]), WriteOutcome::Written);

        buf.read(&mut out);
        assert_eq!(trigger_number(&out), 1);
        buf.read(&mut out);
        assert_eq!(&out[..], &record[..]);
    }

    #[test]
    fn test_overflow_backpressure() {
        let buf = buffer(2);
        buf.write(&make_record(EVENT_SIZE, 0, 0));
        buf.write(&make_record(EVENT_SIZE, 1, 1));

        let third = make_record(EVENT_SIZE, 2, 2);
        assert_eq!(buf.write(&third), WriteOutcome::WouldOverflow);
        assert_eq!(buf.write(&third[..1]), WriteOutcome::WouldOverflow);
        assert_eq!(buf.written_count(), 2);

        let mut out = [0u8; EVENT_SIZE];
        assert_eq!(buf.read(&mut out), ReadOutcome::Read);
        assert_eq!(trigger_number(&out), 0);

        assert_eq!(buf.write(&third), WriteOutcome::Written);
        buf.read(&mut out);
        assert_eq!(trigger_number(&out), 1);
        buf.read(&mut out);
        assert_eq!(trigger_number(&out), 2);
    }

    #[test]
    fn test_chunk_larger_than_buffer_is_rejected() {
        let buf = buffer(2);
        let chunk = vec![0u8; EVENT_SIZE * 2 + 1];
        assert_eq!(buf.write(&chunk), WriteOutcome::WouldOverflow);
        assert_eq!(buf.written_count(), 0);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_capacity_invariant_under_random_operations() {
        let capacity = 5;
        let buf = buffer(capacity);
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut stream = Vec::new();
        for trg in 0..200 {
            stream.extend(make_record(EVENT_SIZE, trg, trg));
        }

        let mut pos = 0;
        let mut expected_trigger = 0;
        let mut out = [0u8; EVENT_SIZE];
        while pos < stream.len() {
            if rng.gen_bool(0.6) {
                let len = rng.gen_range(1..=EVENT_SIZE * 2).min(stream.len() - pos);
                if buf.write(&stream[pos..pos + len]) == WriteOutcome::Written {
                    pos += len;
                }
            } else if buf.read(&mut out) == ReadOutcome::Read {
                assert_eq!(trigger_number(&out), expected_trigger);
                expected_trigger += 1;
            }
            assert!(buf.written_count() - buf.read_count() <= capacity as u64);
        }
        while buf.read(&mut out) == ReadOutcome::Read {
            assert_eq!(trigger_number(&out), expected_trigger);
            expected_trigger += 1;
        }
        assert_eq!(expected_trigger, 200);
    }

    #[test]
    fn test_drain_discards_complete_records_only() {
        let buf = buffer(4);
        buf.write(&make_record(EVENT_SIZE, 0, 0));
        buf.write(&make_record(EVENT_SIZE, 1, 1));
        let third = make_record(EVENT_SIZE, 2, 2);
        buf.write(&third[..5]);

        assert_eq!(buf.drain(), 2);
        assert_eq!(buf.read_count(), 2);
        assert_eq!(buf.drain(), 0);

        buf.write(&third[5..]);
        let mut out = [0u8; EVENT_SIZE];
        assert_eq!(buf.read(&mut out), ReadOutcome::Read);
        assert_eq!(&out[..], &third[..]);
    }

    #[test]
    fn test_blocked_writer_woken_by_reader() {
        let buf = Arc::new(
            EventBuffer::new(1, EVENT_SIZE)
                .unwrap()
                .with_overflow_wait(Duration::from_secs(5)),
        );
        buf.write(&make_record(EVENT_SIZE, 0, 0));

        let writer = {
            let buf = buf.clone();
            std::thread::spawn(move || buf.write(&make_record(EVENT_SIZE, 1, 1)))
        };

        std::thread::sleep(Duration::from_millis(20));
        let mut out = [0u8; EVENT_SIZE];
        assert_eq!(buf.read(&mut out), ReadOutcome::Read);
        assert_eq!(writer.join().unwrap(), WriteOutcome::Written);

        buf.read(&mut out);
        assert_eq!(trigger_number(&out), 1);
    }

    #[test]
    fn test_concurrent_producer_consumer_preserves_order() {
        let buf = Arc::new(buffer(8));
        let total = 2000u32;

        let producer = {
            let buf = buf.clone();
            std::thread::spawn(move || {
                for trg in 0..total {
                    let record = make_record(EVENT_SIZE, trg, trg);
                    let (head, tail) = record.split_at(11);
                    for part in [head, tail] {
                        while buf.write(part) == WriteOutcome::WouldOverflow {}
                    }
                }
            })
        };

        let mut out = [0u8; EVENT_SIZE];
        let mut next = 0;
        while next < total {
            if buf.read(&mut out) == ReadOutcome::Read {
                assert_eq!(trigger_number(&out), next);
                next += 1;
            } else {
                std::thread::yield_now();
            }
        }
        producer.join().unwrap();
        assert_eq!(buf.written_count(), total as u64);
    }
}
