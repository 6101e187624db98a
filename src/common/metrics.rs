//! Unified metrics framework for LSTDAQ components
//!
//! # Design Principles (KISS)
//! - Lock-free atomic counters for hot path (zero overhead on data path)
//! - Simple snapshot mechanism for reporting
//! - Rates are derived from two snapshots, never tracked live

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-source transfer counters updated by a collector thread
///
/// All operations use Relaxed ordering for maximum performance.
/// Statistics are eventually consistent, which is acceptable for monitoring.
#[derive(Debug)]
pub struct AtomicCounters {
    /// Bytes received from the transport
    pub bytes: AtomicU64,
    /// Complete records accepted by the event buffer
    pub records: AtomicU64,
    /// Complete records dropped because the buffer stayed full
    pub dropped: AtomicU64,
}

impl AtomicCounters {
    /// Create new zeroed counters
    pub fn new() -> Self {
        Self {
            bytes: AtomicU64::new(0),
            records: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Add to bytes counter
    #[inline]
    pub fn add_bytes(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
    }

    /// Increment accepted record counter
    #[inline]
    pub fn inc_records(&self) {
        self.records.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment dropped record counter, returning the new total
    #[inline]
    pub fn inc_dropped(&self) -> u64 {
        self.dropped.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Take a snapshot of current values
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            records: self.records.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for AtomicCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of counter values at a point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CounterSnapshot {
    pub records: u64,
    pub bytes: u64,
    pub dropped: u64,
}

impl CounterSnapshot {
    /// Snapshot for a plain record count of fixed-size records
    pub fn from_records(records: u64, record_size: usize) -> Self {
        Self {
            records,
            bytes: records * record_size as u64,
            dropped: 0,
        }
    }

    /// Calculate rate between two snapshots given elapsed seconds
    pub fn rate_from(&self, prev: &CounterSnapshot, elapsed_secs: f64) -> RateSnapshot {
        if elapsed_secs <= 0.0 {
            return RateSnapshot::default();
        }

        RateSnapshot {
            records_rate: (self.records.saturating_sub(prev.records)) as f64 / elapsed_secs,
            bytes_rate: (self.bytes.saturating_sub(prev.bytes)) as f64 / elapsed_secs,
        }
    }
}

/// Rate calculations from counter snapshots
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct RateSnapshot {
    /// Records per second
    pub records_rate: f64,
    /// Bytes per second
    pub bytes_rate: f64,
}

impl RateSnapshot {
    /// Throughput in megabits per second
    pub fn mbps(&self) -> f64 {
        self.bytes_rate * 8.0 / 1_000_000.0
    }

    /// Format bytes rate as human-readable string (KB/s, MB/s, etc.)
    pub fn format_bytes_rate(&self) -> String {
        if self.bytes_rate >= 1_000_000_000.0 {
            format!("{:.2} GB/s", self.bytes_rate / 1_000_000_000.0)
        } else if self.bytes_rate >= 1_000_000.0 {
            format!("{:.2} MB/s", self.bytes_rate / 1_000_000.0)
        } else if self.bytes_rate >= 1_000.0 {
            format!("{:.2} KB/s", self.bytes_rate / 1_000.0)
        } else {
            format!("{:.0} B/s", self.bytes_rate)
        }
    }

    /// Format record rate as human-readable string (K/s, M/s, etc.)
    pub fn format_records_rate(&self) -> String {
        if self.records_rate >= 1_000_000.0 {
            format!("{:.2} M/s", self.records_rate / 1_000_000.0)
        } else if self.records_rate >= 1_000.0 {
            format!("{:.2} K/s", self.records_rate / 1_000.0)
        } else {
            format!("{:.0} /s", self.records_rate)
        }
    }
}
