//! DAQ orchestrator
//!
//! Builds the source registry from a validated configuration and runs one
//! acquisition:
//! - one named OS thread per collector id
//! - one event builder thread
//! - one sampler thread (optional)
//!
//! All threads share the startup barrier and the stop flag. A failing
//! thread raises the flag, so the others leave their blocking waits and the
//! first real error is reported.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::barrier::StartupBarrier;
use crate::collector::{Collector, CollectorReport, Connector};
use crate::common::{CounterSnapshot, DaqError, DaqResult, StopFlag};
use crate::config::Config;
use crate::merger::{BuildSummary, EventBuilder};
use crate::recorder::{DiscardSink, FileHeader, FileSink, RecordSink};
use crate::sampler::{Sampler, SamplerReport};
use crate::source::SourceRegistry;

/// Everything one acquisition produced
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub n_sources: usize,
    pub n_collectors: usize,
    pub event_size: usize,
    pub build: BuildSummary,
    pub collectors: Vec<CollectorReport>,
    pub sampler: Option<SamplerReport>,
}

impl RunSummary {
    /// Write the summary as pretty JSON
    pub fn save(&self, path: &std::path::Path) -> DaqResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        info!(path = %path.display(), "Run summary written");
        Ok(())
    }
}

/// One configured acquisition
pub struct Daq {
    config: Config,
    registry: SourceRegistry,
}

impl Daq {
    /// Validate `config` and allocate the event buffers
    pub fn new(config: Config) -> DaqResult<Self> {
        config.validate()?;
        let registry = SourceRegistry::from_config(&config)?;
        info!(
            sources = registry.len(),
            collectors = registry.n_collectors(),
            event_size = config.daq.event_size,
            buffer_capacity = config.daq.buffer_capacity,
            ndaq = config.daq.ndaq,
            "DAQ configured"
        );
        Ok(Self { config, registry })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    /// Path of the combined-record data file
    pub fn data_file_path(&self) -> PathBuf {
        self.config.daq.output_dir.join(FileSink::file_name(
            &self.config.daq.file_prefix,
            self.config.daq.infreq,
            self.registry.n_collectors(),
            self.registry.len(),
        ))
    }

    /// Path of the sampler table
    pub fn sampler_table_path(&self) -> PathBuf {
        self.config.daq.output_dir.join(Sampler::table_file_name(
            self.config.daq.infreq,
            self.registry.n_collectors(),
            self.registry.len(),
        ))
    }

    /// Path of the JSON run summary
    pub fn summary_path(&self) -> PathBuf {
        self.data_file_path().with_extension("summary.json")
    }

    /// Data file header describing this run
    pub fn file_header(&self) -> FileHeader {
        let endpoints = self
            .registry
            .endpoints()
            .iter()
            .map(ToString::to_string)
            .collect();
        let mut header = FileHeader::new(
            self.config.daq.event_size as u32,
            endpoints,
            self.config.daq.ndaq,
        );
        header.n_collectors = self.registry.n_collectors() as u32;
        header.infreq = self.config.daq.infreq;
        header
    }

    /// File sink when saving is enabled, otherwise a discarding sink
    pub fn create_sink(&self) -> DaqResult<Box<dyn RecordSink>> {
        if self.config.daq.save {
            Ok(Box::new(FileSink::create(self.data_file_path(), &self.file_header())?))
        } else {
            Ok(Box::new(DiscardSink::new()))
        }
    }

    /// Run one acquisition to completion
    ///
    /// The sink is finished even when the run fails, so a data file keeps
    /// every record built before the failure.
    pub fn run(
        &self,
        connector: &dyn Connector,
        sink: &mut dyn RecordSink,
        stop: &StopFlag,
    ) -> DaqResult<RunSummary> {
        let started_at = Utc::now();
        let start = Instant::now();
        let n_collectors = self.registry.n_collectors();
        let barrier = StartupBarrier::new(n_collectors);
        let finished = AtomicUsize::new(0);
        let builder_sink: &mut dyn RecordSink = &mut *sink;

        let outcome = thread::scope(|scope| -> DaqResult<_> {
            let spawn_failed = |e: std::io::Error| {
                stop.request();
                DaqError::Io(e)
            };

            let mut collectors = Vec::with_capacity(n_collectors);
            for cid in 0..n_collectors {
                let collector = Collector::new(
                    cid,
                    self.registry.groups_for(cid),
                    self.config.daq.max_dropped,
                );
                let (barrier, finished) = (&barrier, &finished);
                let handle = thread::Builder::new()
                    .name(format!("collector-{cid}"))
                    .spawn_scoped(scope, move || {
                        let _exit = WorkerExit::new(stop).counting(finished);
                        collector.run(connector, barrier, stop)
                    })
                    .map_err(spawn_failed)?;
                collectors.push(handle);
            }

            let sampler = if self.config.sampler.enabled {
                let sampler = Sampler::new(self.config.sampler.clone(), &self.registry);
                let barrier = &barrier;
                let handle = thread::Builder::new()
                    .name("sampler".to_string())
                    .spawn_scoped(scope, move || {
                        let _exit = WorkerExit::new(stop);
                        sampler.run(barrier, stop)
                    })
                    .map_err(spawn_failed)?;
                Some(handle)
            } else {
                None
            };

            let builder = {
                let (barrier, finished, registry) = (&barrier, &finished, &self.registry);
                thread::Builder::new()
                    .name("builder".to_string())
                    .spawn_scoped(scope, move || {
                        let _exit = WorkerExit::new(stop);
                        let mut builder = EventBuilder::new(registry);
                        let mut summary = builder.run(barrier, builder_sink, stop)?;
                        summary.drained += builder.drain_until(
                            || finished.load(Ordering::Acquire) == n_collectors,
                            stop,
                        );
                        Ok::<_, DaqError>(summary)
                    })
                    .map_err(spawn_failed)?
            };

            let build = join("builder", builder, stop);
            let collectors: Vec<DaqResult<CollectorReport>> = collectors
                .into_iter()
                .enumerate()
                .map(|(cid, h)| join(&format!("collector-{cid}"), h, stop))
                .collect();
            let sampler = sampler.map(|h| join("sampler", h, stop));
            Ok((build, collectors, sampler))
        });

        let finish = sink.finish();
        let (build, collectors, sampler) = outcome?;

        let mut first_error: Option<DaqError> = None;
        let mut keep = |e: DaqError| {
            let replace = match &first_error {
                None => true,
                Some(current) => current.is_aborted() && !e.is_aborted(),
            };
            if replace {
                first_error = Some(e);
            }
        };

        let build = build.map_err(&mut keep).ok();
        let collectors: Vec<CollectorReport> = collectors
            .into_iter()
            .filter_map(|r| r.map_err(&mut keep).ok())
            .collect();
        let sampler = sampler.and_then(|r| r.map_err(&mut keep).ok());

        if let Some(e) = first_error {
            if e.is_aborted() {
                warn!(error = %e, "Acquisition aborted");
            } else {
                error!(error = %e, "Acquisition failed");
            }
            return Err(e);
        }
        finish?;
        let build = build.ok_or_else(|| DaqError::aborted("event builder produced no summary"))?;

        if let Some(report) = &sampler {
            if self.config.sampler.write_table {
                report.save(&self.sampler_table_path(), self.config.daq.infreq)?;
            }
        }

        let elapsed = start.elapsed().as_secs_f64();
        let combined_size = self.config.daq.event_size * self.registry.len();
        let rate = CounterSnapshot::from_records(build.built, combined_size)
            .rate_from(&CounterSnapshot::default(), build.elapsed_secs);
        info!(
            built = build.built,
            records_rate = %rate.format_records_rate(),
            bytes_rate = %rate.format_bytes_rate(),
            mbps = rate.mbps(),
            elapsed_secs = elapsed,
            "Acquisition complete"
        );

        let summary = RunSummary {
            started_at,
            finished_at: Utc::now(),
            n_sources: self.registry.len(),
            n_collectors,
            event_size: self.config.daq.event_size,
            build,
            collectors,
            sampler,
        };
        if self.config.daq.write_summary {
            summary.save(&self.summary_path())?;
        }
        Ok(summary)
    }
}

/// Runs when a worker closure exits, including by unwinding
///
/// A panicking worker raises `stop` so peers blocked on it give up, and a
/// counted worker is marked finished either way.
struct WorkerExit<'a> {
    stop: &'a StopFlag,
    finished: Option<&'a AtomicUsize>,
}

impl<'a> WorkerExit<'a> {
    fn new(stop: &'a StopFlag) -> Self {
        Self {
            stop,
            finished: None,
        }
    }

    fn counting(mut self, finished: &'a AtomicUsize) -> Self {
        self.finished = Some(finished);
        self
    }
}

impl Drop for WorkerExit<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            let current = thread::current();
            error!(
                thread = current.name().unwrap_or("unnamed"),
                "Worker panicked, stopping acquisition"
            );
            self.stop.request();
        }
        if let Some(finished) = self.finished {
            finished.fetch_add(1, Ordering::AcqRel);
        }
    }
}

/// Join a worker, turning a panic into an error and raising the stop flag
fn join<T>(
    name: &str,
    handle: thread::ScopedJoinHandle<'_, DaqResult<T>>,
    stop: &StopFlag,
) -> DaqResult<T> {
    match handle.join() {
        Ok(result) => {
            if matches!(&result, Err(e) if !e.is_aborted()) {
                stop.request();
            }
            result
        }
        Err(_) => {
            stop.request();
            Err(DaqError::ThreadPanic(name.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{Received, Script, ScriptedConnector, SourceTransport};
    use crate::source::SourceEndpoint;
    use crate::record::{make_record, trigger_number};
    use crate::recorder::{CombinedFileReader, MemorySink};

    const EVENT_SIZE: usize = 64;

    fn config(quotas: &[u64]) -> Config {
        let list: String = quotas
            .iter()
            .enumerate()
            .map(|(i, _)| format!("{} feb{i} 24\n", i % 2))
            .collect();
        let mut config = Config::from_connection_list(&list).unwrap();
        config.daq.event_size = EVENT_SIZE;
        config.daq.buffer_capacity = 128;
        config.sampler.enabled = false;
        for (source, quota) in config.sources.iter_mut().zip(quotas) {
            source.quota = Some(*quota);
        }
        config
    }

    fn stream(triggers: impl IntoIterator<Item = u32>) -> Vec<u8> {
        triggers
            .into_iter()
            .enumerate()
            .flat_map(|(n, t)| make_record(EVENT_SIZE, n as u32, t))
            .collect()
    }

    fn connector(config: &Config, streams: Vec<Vec<u8>>) -> ScriptedConnector {
        config
            .sources
            .iter()
            .zip(streams)
            .fold(ScriptedConnector::new(), |c, (source, bytes)| {
                let mut script = Script::new();
                for piece in bytes.chunks(100) {
                    script = script.chunk(piece.to_vec());
                }
                c.with_script(source.endpoint(), script)
            })
    }

    #[test]
    fn test_invalid_config_rejected_before_start() {
        let mut config = config(&[5]);
        config.daq.event_size = 8;
        assert!(matches!(Daq::new(config), Err(DaqError::ConfigFile(_))));
    }

    #[test]
    fn test_builds_aligned_streams() {
        let config = config(&[20, 20, 20]);
        let connector = connector(&config, vec![stream(0..20), stream(0..20), stream(0..20)]);
        let daq = Daq::new(config).unwrap();
        let mut sink = MemorySink::new();

        let summary = daq.run(&connector, &mut sink, &StopFlag::new()).unwrap();
        assert_eq!(summary.build.built, 20);
        assert_eq!(summary.collectors.len(), 2);
        assert!(sink.is_finished());
        for (n, record) in sink.records().iter().enumerate() {
            assert_eq!(record.len(), 3 * EVENT_SIZE);
            for slot in record.chunks(EVENT_SIZE) {
                assert_eq!(trigger_number(slot), n as u32);
            }
        }
    }

    #[test]
    fn test_early_quota_drains_remaining_sources() {
        let config = config(&[5, 100]);
        let connector = connector(&config, vec![stream(0..5), stream(0..100)]);
        let daq = Daq::new(config).unwrap();
        let mut sink = MemorySink::new();

        let summary = daq.run(&connector, &mut sink, &StopFlag::new()).unwrap();
        assert_eq!(summary.build.built, 5);
        assert_eq!(summary.build.drained, 95);
        assert!(daq.registry().iter().all(|g| g.buffer.is_empty()));
    }

    #[test]
    fn test_source_failure_stops_run() {
        let config = config(&[10, 10]);
        let connector = ScriptedConnector::new()
            .with_script(config.sources[0].endpoint(), Script::new().chunk(stream(0..10)))
            .with_script(
                config.sources[1].endpoint(),
                Script::new().chunk(stream(0..3)).then_close(),
            );
        let daq = Daq::new(config).unwrap();
        let stop = StopFlag::new();

        let err = daq.run(&connector, &mut MemorySink::new(), &stop).unwrap_err();
        assert!(matches!(err, DaqError::SourceClosed { source_id: 1, .. }));
        assert!(stop.is_requested());
    }

    /// Delivers `records` then panics on the next receive
    struct PanickingTransport {
        records: Vec<u8>,
    }

    impl SourceTransport for PanickingTransport {
        fn receive(&mut self, buf: &mut [u8]) -> std::io::Result<Received> {
            if self.records.is_empty() {
                panic!("transport failed hard");
            }
            let n = buf.len().min(self.records.len());
            buf[..n].copy_from_slice(&self.records[..n]);
            self.records.drain(..n);
            Ok(Received::Data(n))
        }
    }

    struct PanicOn {
        inner: ScriptedConnector,
        endpoint: SourceEndpoint,
        records: Vec<u8>,
    }

    impl Connector for PanicOn {
        fn connect(
            &self,
            endpoint: &SourceEndpoint,
        ) -> std::io::Result<Box<dyn SourceTransport>> {
            if *endpoint == self.endpoint {
                Ok(Box::new(PanickingTransport {
                    records: self.records.clone(),
                }))
            } else {
                self.inner.connect(endpoint)
            }
        }
    }

    #[test]
    fn test_collector_panic_ends_run_with_thread_panic() {
        let config = config(&[5, 100]);
        let connector = PanicOn {
            inner: connector(&config, vec![stream(0..5)]),
            endpoint: config.sources[1].endpoint(),
            records: stream(0..10),
        };
        let daq = Daq::new(config).unwrap();
        let stop = StopFlag::new();
        let mut sink = MemorySink::new();

        let err = daq.run(&connector, &mut sink, &stop).unwrap_err();
        assert!(matches!(&err, DaqError::ThreadPanic(name) if name == "collector-1"));
        assert!(stop.is_requested());
        assert!(sink.is_finished());
    }

    #[test]
    fn test_connect_failure_stops_run() {
        let config = config(&[3, 3]);
        let connector = ScriptedConnector::new()
            .with_script(config.sources[0].endpoint(), Script::new().chunk(stream(0..3)));
        let daq = Daq::new(config).unwrap();

        let err = daq
            .run(&connector, &mut MemorySink::new(), &StopFlag::new())
            .unwrap_err();
        assert!(matches!(err, DaqError::Connect { .. }));
    }

    #[test]
    fn test_saves_file_table_and_summary() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&[10, 10]);
        config.daq.save = true;
        config.daq.write_summary = true;
        config.daq.infreq = 100;
        config.daq.output_dir = dir.path().to_path_buf();
        config.sampler.enabled = true;
        config.sampler.start_delay_ms = 0;
        config.sampler.write_table = true;

        let connector = connector(&config, vec![stream(0..10), stream(0..10)]);
        let daq = Daq::new(config).unwrap();
        let mut sink = daq.create_sink().unwrap();

        let summary = daq.run(&connector, sink.as_mut(), &StopFlag::new()).unwrap();
        assert_eq!(summary.build.built, 10);
        assert!(summary.sampler.is_some());

        let path = daq.data_file_path();
        assert!(path.ends_with("infreq100_nColl2_nRB2.dat"));
        let mut reader = CombinedFileReader::new(std::fs::File::open(&path).unwrap()).unwrap();
        assert!(reader.validate().unwrap().is_valid);
        assert_eq!(reader.record_count(), 10);

        assert!(daq.sampler_table_path().exists());
        let json = std::fs::read_to_string(daq.summary_path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["build"]["built"], 10);
    }
}
