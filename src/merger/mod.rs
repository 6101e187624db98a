//! Event builder - aligns the source streams by trigger number
//!
//! Architecture:
//! - Runs on its own OS thread after releasing the startup barrier
//! - Reads one record per source per round from the event buffers
//! - Emits one combined record (source records concatenated in registry
//!   order) each time every source holds the same trigger number
//!
//! Round algorithm, with `c_trg` the trigger being built and `r_trg` the
//! highest trigger seen ahead of it:
//! - a source that is neither done nor holding the ahead record reads its
//!   next record (blocking until one arrives);
//! - behind (`t < c_trg`): keep reading until it catches up, overshoots,
//!   or reaches its quota;
//! - ahead (`t > c_trg`): it becomes the single ahead source, `r_trg = t`;
//! - after each source, `r_trg > c_trg` abandons the round with
//!   `c_trg = r_trg`; the ahead source keeps its record for the next round;
//! - at the last source with `c_trg == r_trg`, emit and advance both.
//!
//! Only one source is remembered as ahead. When another source overshoots
//! further, the previous holder re-reads in the next round.
//!
//! The run stops after the first round in which any source reached its
//! quota; whatever the other buffers still hold is then drained.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::barrier::StartupBarrier;
use crate::common::{CounterSnapshot, DaqError, DaqResult, StopFlag};
use crate::record::EventHeader;
use crate::recorder::RecordSink;
use crate::ring_buffer::{EventBuffer, ReadOutcome};
use crate::source::SourceRegistry;

/// Empty polls spent spinning before yielding
const SPIN_LIMIT: u32 = 64;
/// Empty polls spent yielding before sleeping
const YIELD_LIMIT: u32 = 128;
/// Sleep between polls once spinning and yielding gave nothing
const IDLE_SLEEP: Duration = Duration::from_micros(50);
/// Pause between drain passes while collectors are still running
const DRAIN_INTERVAL: Duration = Duration::from_millis(1);

/// Per-source alignment state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SourceState {
    /// Reads every round
    Active,
    /// Holds a record from a later trigger; skipped until the others catch up
    Ahead,
    /// Reached its quota; never read again
    Done,
}

/// Per-source statistics with trigger/event number tracking
#[derive(Debug, Default, Clone, Serialize)]
pub struct SourceStats {
    pub source_id: usize,
    pub endpoint: String,
    pub records_read: u64,
    pub last_trigger: Option<u32>,
    pub last_event: Option<u32>,
    /// Times the trigger counter jumped by more than one
    pub trigger_gaps: u64,
    /// Trigger numbers never delivered by this source
    pub missing_triggers: u64,
    /// Times the event counter jumped by more than one
    pub event_gaps: u64,
    /// Records discarded while catching up to the current trigger
    pub rereads: u64,
    /// Times this source became the ahead source
    pub times_ahead: u64,
    /// Records whose sync marker did not match
    pub sync_errors: u64,
}

impl SourceStats {
    fn new(source_id: usize, endpoint: String) -> Self {
        Self {
            source_id,
            endpoint,
            ..Default::default()
        }
    }

    fn update(&mut self, header: &EventHeader) {
        if let Some(last) = self.last_trigger {
            let expected = last.wrapping_add(1);
            if header.trigger_number > expected {
                self.trigger_gaps += 1;
                self.missing_triggers += (header.trigger_number - expected) as u64;
            }
        }
        if let Some(last) = self.last_event {
            if header.event_number > last.wrapping_add(1) {
                self.event_gaps += 1;
            }
        }
        if !header.has_valid_sync() {
            self.sync_errors += 1;
        }

        self.last_trigger = Some(header.trigger_number);
        self.last_event = Some(header.event_number);
        self.records_read += 1;
    }
}

/// Final report of one build
#[derive(Debug, Clone, Serialize)]
pub struct BuildSummary {
    /// Combined records emitted
    pub built: u64,
    pub rounds: u64,
    /// Rounds restarted because a source was ahead
    pub abandoned_rounds: u64,
    /// Records discarded after the build stopped
    pub drained: u64,
    /// Trigger number the builder was waiting for when it stopped
    pub next_trigger: u32,
    pub elapsed_secs: f64,
    pub records_rate: f64,
    pub bytes_rate: f64,
    pub sources: Vec<SourceStats>,
}

impl BuildSummary {
    /// Get summary of all trigger gaps across sources
    pub fn total_trigger_gaps(&self) -> u64 {
        self.sources.iter().map(|s| s.trigger_gaps).sum()
    }

    /// Get total missing trigger numbers across sources
    pub fn total_missing_triggers(&self) -> u64 {
        self.sources.iter().map(|s| s.missing_triggers).sum()
    }
}

struct BuilderSource {
    buffer: Arc<EventBuffer>,
    quota: u64,
    slot: Vec<u8>,
    header: EventHeader,
    state: SourceState,
    stats: SourceStats,
}

/// Trigger-aligned merger of every source stream
pub struct EventBuilder {
    sources: Vec<BuilderSource>,
    event_size: usize,
    c_trg: u32,
    r_trg: u32,
    ahead: Option<usize>,
    combined: Vec<u8>,
    built: u64,
    rounds: u64,
    abandoned_rounds: u64,
    drained: u64,
}

impl EventBuilder {
    /// Create a builder reading every buffer of `registry`
    pub fn new(registry: &SourceRegistry) -> Self {
        let event_size = registry.event_size();
        let sources: Vec<BuilderSource> = registry
            .iter()
            .map(|group| BuilderSource {
                buffer: Arc::clone(&group.buffer),
                quota: group.quota,
                slot: vec![0u8; event_size],
                header: EventHeader::default(),
                state: SourceState::Active,
                stats: SourceStats::new(group.id, group.endpoint.to_string()),
            })
            .collect();

        Self {
            combined: Vec::with_capacity(event_size * sources.len()),
            sources,
            event_size,
            c_trg: 0,
            r_trg: 0,
            ahead: None,
            built: 0,
            rounds: 0,
            abandoned_rounds: 0,
            drained: 0,
        }
    }

    /// Trigger number currently being built
    pub fn current_trigger(&self) -> u32 {
        self.c_trg
    }

    pub fn built(&self) -> u64 {
        self.built
    }

    pub fn source_state(&self, id: usize) -> Option<SourceState> {
        self.sources.get(id).map(|s| s.state)
    }

    /// Wait for the collectors, release them, and build until a quota is met
    ///
    /// Every buffer is drained once after the last round.
    pub fn run(
        &mut self,
        barrier: &StartupBarrier,
        sink: &mut dyn RecordSink,
        stop: &StopFlag,
    ) -> DaqResult<BuildSummary> {
        if !barrier.wait_all_ready(stop) {
            return Err(DaqError::aborted("event builder stopped before start"));
        }
        if barrier.release() {
            info!(collectors = barrier.parties(), "Startup barrier released by event builder");
        }

        info!(
            sources = self.sources.len(),
            event_size = self.event_size,
            "Event building started"
        );
        let start = Instant::now();
        self.build(sink, stop)?;
        let elapsed = start.elapsed().as_secs_f64();

        let drained = self.drain_all();
        if drained > 0 {
            info!(drained, "Drained leftover records");
        }

        let summary = self.summary(elapsed);
        info!(
            built = summary.built,
            rounds = summary.rounds,
            abandoned = summary.abandoned_rounds,
            trigger_gaps = summary.total_trigger_gaps(),
            missing_triggers = summary.total_missing_triggers(),
            elapsed_secs = elapsed,
            "Event building finished"
        );
        Ok(summary)
    }

    /// Run rounds until one ends with a source at its quota
    pub fn build(&mut self, sink: &mut dyn RecordSink, stop: &StopFlag) -> DaqResult<()> {
        if self.sources.is_empty() {
            return Ok(());
        }
        let last = self.sources.len() - 1;

        loop {
            self.rounds += 1;
            for i in 0..=last {
                if self.ahead != Some(i) && self.sources[i].state != SourceState::Done {
                    self.align(i, stop)?;
                }

                if self.r_trg > self.c_trg {
                    debug!(from = self.c_trg, to = self.r_trg, "Round abandoned");
                    self.c_trg = self.r_trg;
                    self.abandoned_rounds += 1;
                    break;
                }
                if self.c_trg == self.r_trg && i == last {
                    self.emit(sink)?;
                }
            }

            if self.sources.iter().any(|s| s.state == SourceState::Done) {
                return Ok(());
            }
        }
    }

    /// Bring source `i` to the current trigger or mark it ahead
    fn align(&mut self, i: usize, stop: &StopFlag) -> DaqResult<()> {
        self.read_next(i, stop)?;
        while self.sources[i].header.trigger_number < self.c_trg
            && self.sources[i].state != SourceState::Done
        {
            self.sources[i].stats.rereads += 1;
            self.read_next(i, stop)?;
        }

        let t = self.sources[i].header.trigger_number;
        if t > self.c_trg {
            if let Some(prev) = self.ahead.replace(i) {
                if self.sources[prev].state == SourceState::Ahead {
                    self.sources[prev].state = SourceState::Active;
                }
            }
            let source = &mut self.sources[i];
            if source.state != SourceState::Done {
                source.state = SourceState::Ahead;
            }
            source.stats.times_ahead += 1;
            self.r_trg = t;
        }
        Ok(())
    }

    /// Blocking read of the next record of source `i` into its slot
    fn read_next(&mut self, i: usize, stop: &StopFlag) -> DaqResult<()> {
        let source = &mut self.sources[i];
        let mut idle: u32 = 0;
        while source.buffer.read(&mut source.slot) == ReadOutcome::Empty {
            if stop.is_requested() {
                return Err(DaqError::aborted(format!(
                    "event builder stopped waiting for source {i}"
                )));
            }
            if idle < SPIN_LIMIT {
                std::hint::spin_loop();
            } else if idle < YIELD_LIMIT {
                std::thread::yield_now();
            } else {
                std::thread::sleep(IDLE_SLEEP);
            }
            idle = idle.saturating_add(1);
        }

        source.header = EventHeader::parse(&source.slot)
            .map_err(|e| DaqError::config(format!("event size too small for header: {e}")))?;
        if !source.header.has_valid_sync() {
            warn!(
                source = i,
                sync = format!("{:04x}", source.header.sync),
                trigger = source.header.trigger_number,
                "Sync marker mismatch"
            );
        }
        source.stats.update(&source.header);
        if source.stats.records_read >= source.quota {
            source.state = SourceState::Done;
            debug!(source = i, reads = source.stats.records_read, "Source reached quota");
        }
        Ok(())
    }

    fn emit(&mut self, sink: &mut dyn RecordSink) -> DaqResult<()> {
        self.combined.clear();
        for source in &self.sources {
            self.combined.extend_from_slice(&source.slot);
        }
        sink.accept(&self.combined)?;

        self.built += 1;
        self.c_trg = self.c_trg.wrapping_add(1);
        self.r_trg = self.r_trg.wrapping_add(1);
        if let Some(prev) = self.ahead.take() {
            if self.sources[prev].state == SourceState::Ahead {
                self.sources[prev].state = SourceState::Active;
            }
        }
        Ok(())
    }

    /// Discard every complete record left in the buffers
    pub fn drain_all(&mut self) -> u64 {
        let drained: u64 = self.sources.iter().map(|s| s.buffer.drain()).sum();
        self.drained += drained;
        drained
    }

    /// Keep draining until `finished` reports true or `stop` is raised
    ///
    /// Collectors still filling their quotas after the build stopped would
    /// otherwise run into full buffers.
    pub fn drain_until(&mut self, finished: impl Fn() -> bool, stop: &StopFlag) -> u64 {
        let mut drained = 0;
        loop {
            let done = finished() || stop.is_requested();
            drained += self.drain_all();
            if done {
                return drained;
            }
            std::thread::sleep(DRAIN_INTERVAL);
        }
    }

    pub fn summary(&self, elapsed_secs: f64) -> BuildSummary {
        let combined_size = self.event_size * self.sources.len();
        let rate = CounterSnapshot::from_records(self.built, combined_size)
            .rate_from(&CounterSnapshot::default(), elapsed_secs);
        BuildSummary {
            built: self.built,
            rounds: self.rounds,
            abandoned_rounds: self.abandoned_rounds,
            drained: self.drained,
            next_trigger: self.c_trg,
            elapsed_secs,
            records_rate: rate.records_rate,
            bytes_rate: rate.bytes_rate,
            sources: self.sources.iter().map(|s| s.stats.clone()).collect(),
        }
    }
}
