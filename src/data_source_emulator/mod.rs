//! FEB emulator - serves FEB-shaped record streams over TCP
//!
//! Each accepted connection receives its own stream of fixed-size records
//! with a valid header (sync marker, PPS and 10 MHz counters, event and
//! trigger counters, 133 MHz clock, all most-significant byte first).
//!
//! Architecture:
//! - Accept task: tokio `TcpListener`, one spawned task per connection
//! - Stream task: generates records and writes them in random-sized chunks
//!
//! Busy dead time is emulated by skipping triggers: the trigger counter
//! advances but no record is sent, so the event counter does not.

use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Exp};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::common::StopFlag;
use crate::record::{
    make_record, EventHeader, RecordError, DEFAULT_EVENT_SIZE, HEADER_LEN, SYNC_MARKER,
};

/// Nominal trigger spacing when no rate is configured (1 kHz)
const NOMINAL_SPACING_NS: u64 = 1_000_000;

/// How often the accept loop re-checks the stop flag
const STOP_POLL: Duration = Duration::from_millis(50);

/// Emulator configuration
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct FebEmulatorConfig {
    /// Address to listen on (e.g., "127.0.0.1:24")
    pub listen: String,
    /// Record size in bytes
    pub event_size: usize,
    /// Records per connection (0 = unlimited)
    pub events: u64,
    /// Mean trigger rate in Hz (0 = as fast as possible)
    pub rate_hz: f64,
    /// Probability that a trigger produces no record
    pub skip_probability: f64,
    /// Trigger numbers that never produce a record
    pub skip_triggers: Vec<u32>,
    /// Largest chunk per socket write (0 = whole records)
    pub max_chunk: usize,
    /// RNG seed for reproducible streams
    pub seed: Option<u64>,
}

impl Default for FebEmulatorConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:24".to_string(),
            event_size: DEFAULT_EVENT_SIZE,
            events: 0,
            rate_hz: 0.0,
            skip_probability: 0.0,
            skip_triggers: Vec::new(),
            max_chunk: 0,
            seed: None,
        }
    }
}

impl FebEmulatorConfig {
    fn validate(&self) -> Result<(), EmulatorError> {
        if self.event_size < HEADER_LEN {
            return Err(EmulatorError::InvalidConfig(format!(
                "event size {} is smaller than the {HEADER_LEN}-byte header",
                self.event_size
            )));
        }
        if !(0.0..1.0).contains(&self.skip_probability) {
            return Err(EmulatorError::InvalidConfig(format!(
                "skip probability {} must be in [0, 1)",
                self.skip_probability
            )));
        }
        if !(self.rate_hz >= 0.0 && self.rate_hz.is_finite()) {
            return Err(EmulatorError::InvalidConfig(format!(
                "trigger rate {} must be finite and non-negative",
                self.rate_hz
            )));
        }
        Ok(())
    }
}

/// Emulator errors
#[derive(Error, Debug)]
pub enum EmulatorError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid emulator configuration: {0}")]
    InvalidConfig(String),

    #[error("Record encoding error: {0}")]
    Record(#[from] RecordError),
}

/// Generates the record stream of one emulated FEB
pub struct FebGenerator {
    event_size: usize,
    next_trigger: u32,
    next_event: u32,
    time_ns: u64,
    skip_probability: f64,
    skip_triggers: HashSet<u32>,
    spacing: Option<Exp<f64>>,
    rng: StdRng,
}

impl FebGenerator {
    pub fn new(config: &FebEmulatorConfig) -> Result<Self, EmulatorError> {
        config.validate()?;
        let spacing = if config.rate_hz > 0.0 {
            Some(
                Exp::new(config.rate_hz)
                    .map_err(|e| EmulatorError::InvalidConfig(e.to_string()))?,
            )
        } else {
            None
        };
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(Self {
            event_size: config.event_size,
            next_trigger: 0,
            next_event: 0,
            time_ns: 0,
            skip_probability: config.skip_probability,
            skip_triggers: config.skip_triggers.iter().copied().collect(),
            spacing,
            rng,
        })
    }

    /// Produce the next record, advancing past skipped triggers
    ///
    /// Returns the record and the time to wait before sending it.
    pub fn next_record(&mut self) -> Result<(Vec<u8>, Duration), EmulatorError> {
        let mut wait = Duration::ZERO;
        loop {
            let trigger = self.next_trigger;
            self.next_trigger = self.next_trigger.wrapping_add(1);

            let spacing = match &self.spacing {
                Some(exp) => Duration::from_secs_f64(exp.sample(&mut self.rng)),
                None => Duration::ZERO,
            };
            wait += spacing;
            self.time_ns += match self.spacing {
                Some(_) => spacing.as_nanos() as u64,
                None => NOMINAL_SPACING_NS,
            };

            let skipped = self.skip_triggers.contains(&trigger)
                || (self.skip_probability > 0.0 && self.rng.gen_bool(self.skip_probability));
            if skipped {
                debug!(trigger, "Trigger skipped");
                continue;
            }

            let event = self.next_event;
            self.next_event = self.next_event.wrapping_add(1);
            return Ok((self.build(event, trigger)?, wait));
        }
    }

    fn build(&self, event_number: u32, trigger_number: u32) -> Result<Vec<u8>, EmulatorError> {
        let mut record = make_record(self.event_size, event_number, trigger_number);
        let header = EventHeader {
            sync: SYNC_MARKER,
            pps: (self.time_ns / 1_000_000_000) as u16,
            ten_mhz: ((self.time_ns % 1_000_000_000) / 100) as u32,
            event_number,
            trigger_number,
            clock: self.time_ns * 133 / 1000,
        };
        header.write_to(&mut record)?;
        Ok(record)
    }

    /// Random chunk length in `1..=max`, or the whole remainder when `max` is 0
    fn chunk_len(&mut self, remaining: usize, max: usize) -> usize {
        if max == 0 {
            remaining
        } else {
            self.rng.gen_range(1..=max).min(remaining)
        }
    }
}

/// TCP server emulating one or more FEBs
pub struct FebEmulator {
    config: FebEmulatorConfig,
    listener: TcpListener,
}

impl FebEmulator {
    /// Bind the listening socket
    pub async fn bind(config: FebEmulatorConfig) -> Result<Self, EmulatorError> {
        config.validate()?;
        let listener = TcpListener::bind(&config.listen).await?;
        info!(
            address = %listener.local_addr()?,
            event_size = config.event_size,
            events = config.events,
            rate_hz = config.rate_hz,
            "FEB emulator listening"
        );
        Ok(Self { config, listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `stop` is raised, serving each in its own task
    pub async fn run(self, stop: StopFlag) -> Result<(), EmulatorError> {
        while !stop.is_requested() {
            let accepted = tokio::time::timeout(STOP_POLL, self.listener.accept()).await;
            let Ok(result) = accepted else {
                continue;
            };
            let (stream, peer) = result?;
            info!(peer = %peer, "DAQ connected");

            let config = self.config.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                match serve_connection(stream, &config, &stop).await {
                    Ok(sent) => info!(peer = %peer, sent, "Stream finished"),
                    Err(e) => warn!(peer = %peer, error = %e, "Stream failed"),
                }
            });
        }
        info!("FEB emulator stopped");
        Ok(())
    }

    /// Accept exactly one connection and serve it to completion
    pub async fn serve_one(self, stop: StopFlag) -> Result<u64, EmulatorError> {
        let (stream, peer) = self.listener.accept().await?;
        debug!(peer = %peer, "DAQ connected");
        serve_connection(stream, &self.config, &stop).await
    }
}

/// Stream records to one client; returns the number of records sent
async fn serve_connection(
    mut stream: TcpStream,
    config: &FebEmulatorConfig,
    stop: &StopFlag,
) -> Result<u64, EmulatorError> {
    stream.set_nodelay(true)?;
    let mut generator = FebGenerator::new(config)?;
    let mut sent = 0u64;

    while config.events == 0 || sent < config.events {
        if stop.is_requested() {
            break;
        }
        let (record, wait) = generator.next_record()?;
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }

        let mut offset = 0;
        while offset < record.len() {
            let len = generator.chunk_len(record.len() - offset, config.max_chunk);
            match stream.write_all(&record[offset..offset + len]).await {
                Ok(()) => offset += len,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
                    ) =>
                {
                    debug!(sent, "Client disconnected");
                    return Ok(sent);
                }
                Err(e) => return Err(e.into()),
            }
        }
        sent += 1;
    }

    stream.flush().await?;
    stream.shutdown().await?;
    Ok(sent)
}
