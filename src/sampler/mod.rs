//! Throughput sampler
//!
//! Optional thread that records the written/read counters of every event
//! buffer at a fixed interval. It takes part in the startup rendezvous like
//! the event builder: whichever of the two releases the barrier first wins.
//!
//! Sampling stops when any buffer has been read up to its quota, when
//! `max_samples` rows exist, or when the stop flag is raised.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use crate::barrier::StartupBarrier;
use crate::common::{CounterSnapshot, DaqError, DaqResult, RateSnapshot, StopFlag};
use crate::config::SamplerSettings;
use crate::ring_buffer::EventBuffer;
use crate::source::SourceRegistry;

/// Granularity of the stop check during the start delay
const DELAY_STEP: Duration = Duration::from_millis(10);

/// Counters of every buffer at one instant
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SampleRow {
    /// Microseconds since the first sample
    pub elapsed_us: u64,
    pub written: Vec<u64>,
    pub read: Vec<u64>,
}

/// Average rates of one buffer over the sampled window
#[derive(Debug, Clone, Serialize)]
pub struct BufferRate {
    pub source_id: usize,
    pub written: RateSnapshot,
    pub read: RateSnapshot,
}

/// Everything the sampler recorded
#[derive(Debug, Clone, Serialize)]
pub struct SamplerReport {
    pub interval_ms: u64,
    pub rows: Vec<SampleRow>,
    pub rates: Vec<BufferRate>,
}

impl SamplerReport {
    /// Render the whitespace-separated table written next to the data file
    pub fn write_table<W: Write>(&self, writer: &mut W, infreq: u32) -> std::io::Result<()> {
        let n = self.rates.len();
        writeln!(writer, "InFreq={infreq}")?;
        writeln!(writer, "Nw in RingBuffer      Nr in RingBuffer")?;
        write!(writer, "count")?;
        for _ in 0..2 {
            for i in 0..n {
                write!(writer, "   RB{i:02}   ")?;
            }
        }
        writeln!(writer)?;

        for (count, row) in self.rows.iter().enumerate() {
            write!(writer, "{count:5} ")?;
            for value in row.written.iter().chain(row.read.iter()) {
                write!(writer, "{value:9} ")?;
            }
            writeln!(writer)?;
        }
        Ok(())
    }

    /// Write the table to `path`
    pub fn save(&self, path: &Path, infreq: u32) -> DaqResult<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        self.write_table(&mut writer, infreq)?;
        writer.flush()?;
        info!(path = %path.display(), rows = self.rows.len(), "Sampler table written");
        Ok(())
    }
}

/// Periodic reader of the buffer counters
pub struct Sampler {
    settings: SamplerSettings,
    buffers: Vec<Arc<EventBuffer>>,
    quotas: Vec<u64>,
    event_size: usize,
}

impl Sampler {
    pub fn new(settings: SamplerSettings, registry: &SourceRegistry) -> Self {
        Self {
            settings,
            buffers: registry.buffers(),
            quotas: registry.iter().map(|g| g.quota).collect(),
            event_size: registry.event_size(),
        }
    }

    /// Sampler table name for a run
    pub fn table_file_name(infreq: u32, n_collectors: usize, n_sources: usize) -> String {
        format!("RingBufMes_infreq{infreq}_{n_collectors}to{n_sources:02}.dat")
    }

    /// Wait for the collectors, release them, and sample until done
    pub fn run(&self, barrier: &StartupBarrier, stop: &StopFlag) -> DaqResult<SamplerReport> {
        if !barrier.wait_all_ready(stop) {
            return Err(DaqError::aborted("sampler stopped before start"));
        }
        if barrier.release() {
            info!("Startup barrier released by sampler");
        }

        let start_delay = Duration::from_millis(self.settings.start_delay_ms);
        let begin = Instant::now();
        while begin.elapsed() < start_delay {
            if stop.is_requested() {
                return Ok(self.report(Vec::new()));
            }
            std::thread::sleep(DELAY_STEP.min(start_delay.saturating_sub(begin.elapsed())));
        }

        let rows = self.sample(stop);
        debug!(rows = rows.len(), "Sampling finished");
        Ok(self.report(rows))
    }

    fn sample(&self, stop: &StopFlag) -> Vec<SampleRow> {
        let interval = Duration::from_millis(self.settings.interval_ms.max(1));
        let max_rows = self.settings.max_samples.max(1);
        let mut rows = Vec::with_capacity(max_rows.min(16 * 1024));
        let start = Instant::now();
        let mut next = start;

        loop {
            let row = SampleRow {
                elapsed_us: start.elapsed().as_micros() as u64,
                written: self.buffers.iter().map(|b| b.written_count()).collect(),
                read: self.buffers.iter().map(|b| b.read_count()).collect(),
            };
            let quota_reached = row.read.iter().zip(&self.quotas).any(|(r, q)| r >= q);
            rows.push(row);

            if quota_reached || rows.len() >= max_rows || stop.is_requested() {
                return rows;
            }

            next += interval;
            let now = Instant::now();
            if next > now {
                std::thread::sleep(next - now);
            } else {
                next = now;
            }
        }
    }

    fn report(&self, rows: Vec<SampleRow>) -> SamplerReport {
        let rates = match (rows.first(), rows.last()) {
            (Some(first), Some(last)) if rows.len() > 1 => {
                let secs = (last.elapsed_us - first.elapsed_us) as f64 / 1e6;
                (0..self.buffers.len())
                    .map(|i| {
                        let rate = |a: u64, b: u64| {
                            CounterSnapshot::from_records(b, self.event_size).rate_from(
                                &CounterSnapshot::from_records(a, self.event_size),
                                secs,
                            )
                        };
                        BufferRate {
                            source_id: i,
                            written: rate(first.written[i], last.written[i]),
                            read: rate(first.read[i], last.read[i]),
                        }
                    })
                    .collect()
            }
            _ => (0..self.buffers.len())
                .map(|i| BufferRate {
                    source_id: i,
                    written: RateSnapshot::default(),
                    read: RateSnapshot::default(),
                })
                .collect(),
        };

        SamplerReport {
            interval_ms: self.settings.interval_ms,
            rows,
            rates,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::record::make_record;
    use crate::ring_buffer::ReadOutcome;

    const EVENT_SIZE: usize = 32;

    fn setup(quota: u64) -> (SourceRegistry, SamplerSettings) {
        let mut config = Config::from_connection_list("0 a 1\n0 b 2\n").unwrap();
        config.daq.event_size = EVENT_SIZE;
        config.daq.buffer_capacity = 64;
        config.daq.ndaq = quota;
        let settings = SamplerSettings {
            enabled: true,
            interval_ms: 1,
            start_delay_ms: 0,
            max_samples: 50,
            write_table: false,
        };
        (SourceRegistry::from_config(&config).unwrap(), settings)
    }

    #[test]
    fn test_table_file_name_format() {
        assert_eq!(
            Sampler::table_file_name(1000, 2, 4),
            "RingBufMes_infreq1000_2to04.dat"
        );
    }

    #[test]
    fn test_stops_at_max_samples() {
        let (registry, settings) = setup(10);
        let barrier = StartupBarrier::new(0);
        let report = Sampler::new(settings, &registry)
            .run(&barrier, &StopFlag::new())
            .unwrap();

        assert!(barrier.is_released());
        assert_eq!(report.rows.len(), 50);
        assert!(report.rows.windows(2).all(|w| w[0].elapsed_us <= w[1].elapsed_us));
        assert_eq!(report.rates.len(), 2);
    }

    #[test]
    fn test_stops_when_quota_read() {
        let (registry, settings) = setup(2);
        let buffer = &registry.get(1).unwrap().buffer;
        let mut out = vec![0u8; EVENT_SIZE];
        for t in 0..2 {
            buffer.write(&make_record(EVENT_SIZE, t, t));
            assert_eq!(buffer.read(&mut out), ReadOutcome::Read);
        }

        let report = Sampler::new(settings, &registry)
            .run(&StartupBarrier::new(0), &StopFlag::new())
            .unwrap();
        assert_eq!(report.rows.len(), 1);
        assert_eq!(report.rows[0].written, vec![0, 2]);
        assert_eq!(report.rows[0].read, vec![0, 2]);
    }

    #[test]
    fn test_stop_during_delay_returns_empty_report() {
        let (registry, mut settings) = setup(10);
        settings.start_delay_ms = 10_000;
        let stop = StopFlag::new();
        let stopper = {
            let stop = stop.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                stop.request();
            })
        };

        let report = Sampler::new(settings, &registry)
            .run(&StartupBarrier::new(0), &stop)
            .unwrap();
        stopper.join().unwrap();
        assert!(report.rows.is_empty());
    }

    #[test]
    fn test_table_layout() {
        let report = SamplerReport {
            interval_ms: 1,
            rows: vec![
                SampleRow {
                    elapsed_us: 0,
                    written: vec![1, 2],
                    read: vec![0, 1],
                },
                SampleRow {
                    elapsed_us: 1000,
                    written: vec![5, 6],
                    read: vec![4, 5],
                },
            ],
            rates: vec![
                BufferRate {
                    source_id: 0,
                    written: RateSnapshot::default(),
                    read: RateSnapshot::default(),
                },
                BufferRate {
                    source_id: 1,
                    written: RateSnapshot::default(),
                    read: RateSnapshot::default(),
                },
            ],
        };

        let mut out = Vec::new();
        report.write_table(&mut out, 1000).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], "InFreq=1000");
        assert_eq!(lines[2].matches("RB00").count(), 2);
        assert_eq!(lines.len(), 5);
        let fields: Vec<&str> = lines[4].split_whitespace().collect();
        assert_eq!(fields, vec!["1", "5", "6", "4", "5"]);
    }
}
