//! CLI argument parsing for LSTDAQ binaries
//!
//! # Design Principles (KISS)
//! - Use clap's derive macro for declarative argument definition
//! - Common arguments shared via composition, not inheritance
//! - Each binary has its own Args struct that embeds CommonArgs

use clap::Parser;

/// Common arguments shared across all LSTDAQ binaries
#[derive(Parser, Debug, Clone)]
pub struct CommonArgs {
    /// Path to configuration file (TOML, or a legacy Connection.conf list)
    #[arg(short = 'f', long = "config", default_value = "config.toml")]
    pub config_file: String,
}

/// Arguments for the acquisition binary
#[derive(Parser, Debug, Clone)]
#[command(name = "lstdaq", about = "Event-building DAQ for camera front-end boards")]
pub struct DaqArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Number of records to acquire from each source
    #[arg(short = 'n', long = "ndaq")]
    pub ndaq: Option<u64>,

    /// Input trigger frequency in Hz (only used for report/file names)
    #[arg(short = 'i', long = "infreq")]
    pub infreq: Option<u32>,

    /// Save combined records to disk
    #[arg(short = 's', long = "save")]
    pub save: bool,

    /// Header (prefix) of the output data file
    #[arg(short = 'o', long = "output")]
    pub file_prefix: Option<String>,

    /// Output directory
    #[arg(short = 'd', long = "dir")]
    pub output_dir: Option<String>,

    /// Disable the throughput sampling thread
    #[arg(long = "no-sampler")]
    pub no_sampler: bool,
}

/// Arguments for the FEB emulator binary
#[derive(Parser, Debug, Clone)]
#[command(name = "emulator", about = "Emulates FEB record streams over TCP")]
pub struct EmulatorArgs {
    /// Address to listen on (repeat for several emulated FEBs)
    #[arg(short = 'l', long = "listen", action = clap::ArgAction::Append, default_value = "127.0.0.1:24")]
    pub listen: Vec<String>,

    /// Record size in bytes
    #[arg(long = "event-size")]
    pub event_size: Option<usize>,

    /// Records to send per connection (0 = unlimited)
    #[arg(short = 'n', long = "events", default_value = "0")]
    pub events: u64,

    /// Trigger rate in Hz (0 = as fast as possible)
    #[arg(short = 'r', long = "rate", default_value = "0")]
    pub rate_hz: f64,

    /// Probability that a trigger is accepted without data (trigger number skip)
    #[arg(long = "skip-probability", default_value = "0")]
    pub skip_probability: f64,

    /// Trigger number that never produces a record (repeatable)
    #[arg(long = "skip-trigger", action = clap::ArgAction::Append)]
    pub skip_triggers: Vec<u32>,

    /// Largest socket write in bytes (0 = whole records)
    #[arg(long = "max-chunk", default_value = "0")]
    pub max_chunk: usize,

    /// RNG seed for reproducible streams
    #[arg(long = "seed")]
    pub seed: Option<u64>,
}
