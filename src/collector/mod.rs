//! Collector - receives FEB streams and fills the event buffers
//!
//! Architecture:
//! - One OS thread per collector id, owning one or more sources
//! - Connect every source, arrive at the startup barrier, then poll the
//!   sources round-robin with a short read timeout
//! - Each source stages exactly one record; only complete records are
//!   written to its event buffer
//!
//! A source is complete once `quota` records have been accepted. Records
//! that meet a full buffer are dropped and counted; past `max_dropped` the
//! collector gives up. Any transport failure is fatal and raises the stop
//! flag so the builder and the other collectors exit.

pub mod transport;

use std::time::Instant;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::barrier::StartupBarrier;
use crate::common::{AtomicCounters, DaqError, DaqResult, StopFlag};
use crate::ring_buffer::WriteOutcome;
use crate::source::SourceGroup;

pub use transport::{Connector, Received, Script, ScriptedConnector, SourceTransport, TcpConnector};

/// Dropped records per source tolerated by default
pub const DEFAULT_MAX_DROPPED: u64 = 100_000;

/// Per-source acquisition counters
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SourceReport {
    pub source_id: usize,
    pub endpoint: String,
    /// Bytes of records written to the event buffer
    pub bytes: u64,
    /// Records written to the event buffer
    pub records: u64,
    /// Records dropped because the buffer stayed full
    pub dropped: u64,
}

/// Final report of one collector thread
#[derive(Debug, Clone, Serialize)]
pub struct CollectorReport {
    pub collector: usize,
    pub elapsed_secs: f64,
    pub sources: Vec<SourceReport>,
}

impl CollectorReport {
    pub fn total_records(&self) -> u64 {
        self.sources.iter().map(|s| s.records).sum()
    }

    pub fn total_dropped(&self) -> u64 {
        self.sources.iter().map(|s| s.dropped).sum()
    }
}

struct SourceLink {
    group: SourceGroup,
    transport: Box<dyn SourceTransport>,
    staging: Vec<u8>,
    filled: usize,
    counters: AtomicCounters,
    done: bool,
}

impl SourceLink {
    fn report(&self) -> SourceReport {
        let snap = self.counters.snapshot();
        SourceReport {
            source_id: self.group.id,
            endpoint: self.group.endpoint.to_string(),
            bytes: snap.bytes,
            records: snap.records,
            dropped: snap.dropped,
        }
    }
}

/// Receives records for the sources assigned to one collector id
pub struct Collector {
    id: usize,
    groups: Vec<SourceGroup>,
    max_dropped: u64,
}

impl Collector {
    pub fn new(id: usize, groups: Vec<SourceGroup>, max_dropped: u64) -> Self {
        Self {
            id,
            groups,
            max_dropped,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Acquire every assigned source up to its quota
    ///
    /// Raises `stop` before returning any error other than an abort.
    pub fn run(
        &self,
        connector: &dyn Connector,
        barrier: &StartupBarrier,
        stop: &StopFlag,
    ) -> DaqResult<CollectorReport> {
        let result = self.acquire(connector, barrier, stop);
        if let Err(e) = &result {
            if !e.is_aborted() {
                error!(collector = self.id, error = %e, "Collector failed");
                stop.request();
            }
        }
        result
    }

    fn acquire(
        &self,
        connector: &dyn Connector,
        barrier: &StartupBarrier,
        stop: &StopFlag,
    ) -> DaqResult<CollectorReport> {
        let mut links = Vec::with_capacity(self.groups.len());
        for group in &self.groups {
            let transport = connector
                .connect(&group.endpoint)
                .map_err(|source| DaqError::Connect {
                    endpoint: group.endpoint.to_string(),
                    source,
                })?;
            info!(
                collector = self.id,
                source = group.id,
                endpoint = %group.endpoint,
                quota = group.quota,
                "Source connected"
            );
            links.push(SourceLink {
                staging: vec![0u8; group.buffer.event_size()],
                group: group.clone(),
                transport,
                filled: 0,
                counters: AtomicCounters::new(),
                done: false,
            });
        }

        if !barrier.arrive_and_wait(stop) {
            return Err(DaqError::aborted(format!(
                "collector {} stopped before start",
                self.id
            )));
        }
        let start = Instant::now();
        debug!(collector = self.id, "Collector released");

        let mut active = links.len();
        while active > 0 {
            if stop.is_requested() {
                return Err(DaqError::aborted(format!("collector {} stopped", self.id)));
            }
            for link in links.iter_mut().filter(|l| !l.done) {
                if self.poll(link)? {
                    link.done = true;
                    active -= 1;
                    info!(
                        collector = self.id,
                        source = link.group.id,
                        records = link.group.quota,
                        dropped = link.counters.snapshot().dropped,
                        "Source complete"
                    );
                }
            }
        }

        let report = CollectorReport {
            collector: self.id,
            elapsed_secs: start.elapsed().as_secs_f64(),
            sources: links.iter().map(SourceLink::report).collect(),
        };
        info!(
            collector = self.id,
            records = report.total_records(),
            dropped = report.total_dropped(),
            elapsed_secs = report.elapsed_secs,
            "Collector finished"
        );
        Ok(report)
    }

    /// Receive once from `link`; returns true when the source reaches its quota
    fn poll(&self, link: &mut SourceLink) -> DaqResult<bool> {
        let event_size = link.staging.len();
        let received = link
            .transport
            .receive(&mut link.staging[link.filled..])
            .map_err(|error| DaqError::Transport {
                source_id: link.group.id,
                endpoint: link.group.endpoint.to_string(),
                error,
            })?;

        match received {
            Received::Idle => return Ok(false),
            Received::Closed => {
                let snap = link.counters.snapshot();
                return Err(DaqError::SourceClosed {
                    source_id: link.group.id,
                    endpoint: link.group.endpoint.to_string(),
                    bytes: snap.bytes + link.filled as u64,
                });
            }
            Received::Data(n) => link.filled += n,
        }

        if link.filled < event_size {
            return Ok(false);
        }
        link.filled = 0;

        match link.group.buffer.write(&link.staging) {
            WriteOutcome::Written => {
                link.counters.inc_records();
                link.counters.add_bytes(event_size as u64);
            }
            WriteOutcome::WouldOverflow => {
                let dropped = link.counters.inc_dropped();
                warn!(
                    collector = self.id,
                    source = link.group.id,
                    dropped,
                    "Event buffer full, record dropped"
                );
                if dropped > self.max_dropped {
                    return Err(DaqError::TooManyDrops {
                        source_id: link.group.id,
                        dropped,
                        limit: self.max_dropped,
                    });
                }
            }
        }

        Ok(link.counters.snapshot().bytes >= link.group.quota_bytes())
    }
}
