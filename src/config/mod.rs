//! Configuration module for the LSTDAQ system
//!
//! Supports loading configuration from:
//! - TOML files (`[daq]`, `[sampler]`, `[[sources]]`)
//! - Legacy `Connection.conf` lists: one `<collector id> <address> <port>`
//!   per line, blank lines and `#` comments ignored
//!
//! # Example
//! ```ignore
//! let config = Config::load("config.toml")?;
//! config.validate()?;
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::record::{DEFAULT_EVENT_SIZE, HEADER_LEN};
use crate::ring_buffer::DEFAULT_CAPACITY;
use crate::source::SourceEndpoint;

/// Maximum number of FEB connections one DAQ process handles
pub const MAX_CONNECTION: usize = 48;

/// Largest single event buffer the configuration may request
pub const MAX_BUFFER_BYTES: u64 = 4 * 1024 * 1024 * 1024;

/// Records acquired per source when not specified
pub const DEFAULT_NDAQ: u64 = 100_000;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Connection list line {line}: {message}")]
    ConnectionList { line: usize, message: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daq: DaqSettings,
    #[serde(default)]
    pub sampler: SamplerSettings,
    /// FEB connections, in ring-buffer order
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

impl Config {
    /// Load configuration from a file
    ///
    /// Files ending in `.toml` are parsed as TOML; anything else is read as
    /// a `Connection.conf` list with default settings.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml(&content),
            _ => Self::from_connection_list(&content),
        }
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Parse a `Connection.conf` list into a configuration with default settings
    pub fn from_connection_list(content: &str) -> Result<Self, ConfigError> {
        let mut sources = Vec::new();
        for (index, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let parse_error = |message: String| ConfigError::ConnectionList {
                line: index + 1,
                message,
            };

            let mut fields = line.split_whitespace();
            let (Some(collector), Some(address), Some(port)) =
                (fields.next(), fields.next(), fields.next())
            else {
                return Err(parse_error(format!(
                    "expected '<collector id> <address> <port>', got '{line}'"
                )));
            };

            let collector = collector
                .parse::<u16>()
                .map_err(|e| parse_error(format!("collector id '{collector}': {e}")))?;
            let port = port
                .parse::<u16>()
                .map_err(|e| parse_error(format!("port '{port}': {e}")))?;

            sources.push(SourceConfig {
                collector,
                address: address.to_string(),
                port,
                quota: None,
            });
        }

        Ok(Self {
            daq: DaqSettings::default(),
            sampler: SamplerSettings::default(),
            sources,
        })
    }

    /// Number of collector threads (collector ids are contiguous from 0)
    pub fn n_collectors(&self) -> usize {
        self.sources
            .iter()
            .map(|s| s.collector as usize + 1)
            .max()
            .unwrap_or(0)
    }

    /// Per-receive timeout for the TCP transport
    ///
    /// One collector reads its sources in turn, so a quiet source can hold
    /// up every other source on the same thread for one timeout per pass.
    /// `recv_timeout_ms` bounds a whole pass: it is split across the
    /// largest collector group, with a 1 ms floor.
    pub fn poll_timeout(&self) -> Duration {
        let busiest = (0..self.n_collectors())
            .map(|cid| {
                self.sources
                    .iter()
                    .filter(|s| s.collector as usize == cid)
                    .count()
            })
            .max()
            .unwrap_or(1)
            .max(1) as u32;
        (self.daq.recv_timeout() / busiest).max(Duration::from_millis(1))
    }

    /// Read quota for the source at `index`
    pub fn quota_for(&self, index: usize) -> u64 {
        self.sources
            .get(index)
            .and_then(|s| s.quota)
            .unwrap_or(self.daq.ndaq)
    }

    /// Check every constraint that must hold before any thread starts
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sources.is_empty() {
            return Err(ConfigError::invalid("no sources configured"));
        }
        if self.sources.len() > MAX_CONNECTION {
            return Err(ConfigError::invalid(format!(
                "{} connections exceed the limit of {MAX_CONNECTION}",
                self.sources.len()
            )));
        }

        for cid in 0..self.n_collectors() {
            if !self.sources.iter().any(|s| s.collector as usize == cid) {
                return Err(ConfigError::invalid(format!("collector id {cid} is skipped")));
            }
        }

        for (index, source) in self.sources.iter().enumerate() {
            if source.address.is_empty() {
                return Err(ConfigError::invalid(format!("source {index} has no address")));
            }
            if source.port == 0 {
                return Err(ConfigError::invalid(format!("source {index} has port 0")));
            }
            if source.quota == Some(0) {
                return Err(ConfigError::invalid(format!("source {index} has a zero quota")));
            }
        }

        if self.daq.ndaq == 0 {
            return Err(ConfigError::invalid("ndaq must be positive"));
        }
        if self.daq.event_size < HEADER_LEN {
            return Err(ConfigError::invalid(format!(
                "event size {} is smaller than the {HEADER_LEN}-byte header",
                self.daq.event_size
            )));
        }
        if self.daq.buffer_capacity == 0 {
            return Err(ConfigError::invalid("buffer capacity must be positive"));
        }
        let buffer_bytes = (self.daq.buffer_capacity as u64)
            .checked_mul(self.daq.event_size as u64)
            .unwrap_or(u64::MAX);
        if buffer_bytes > MAX_BUFFER_BYTES {
            return Err(ConfigError::invalid(format!(
                "buffer of {} records x {} bytes exceeds {MAX_BUFFER_BYTES} bytes",
                self.daq.buffer_capacity, self.daq.event_size
            )));
        }

        if self.sampler.enabled && self.sampler.interval_ms == 0 {
            return Err(ConfigError::invalid("sampler interval must be positive"));
        }

        Ok(())
    }
}

// =============================================================================
// Acquisition settings
// =============================================================================

/// Acquisition settings
#[derive(Debug, Clone, Deserialize)]
pub struct DaqSettings {
    /// Records to acquire from each source
    #[serde(default = "default_ndaq")]
    pub ndaq: u64,

    /// Size of one FEB record in bytes
    #[serde(default = "default_event_size")]
    pub event_size: usize,

    /// Record slots per event buffer
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    /// Bound on how long a collector waits for a free slot (microseconds)
    #[serde(default = "default_overflow_wait_us")]
    pub overflow_wait_us: u64,

    /// Time budget of one round-robin pass over a collector's sources (milliseconds)
    #[serde(default = "default_recv_timeout_ms")]
    pub recv_timeout_ms: u64,

    /// Dropped records per source after which acquisition fails
    #[serde(default = "default_max_dropped")]
    pub max_dropped: u64,

    /// Input trigger frequency in Hz (report and file names only)
    #[serde(default)]
    pub infreq: u32,

    /// Save combined records to disk
    #[serde(default)]
    pub save: bool,

    /// Output directory for data, sampler and summary files
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Prefix of the output data file name
    #[serde(default)]
    pub file_prefix: String,

    /// Write the run summary as JSON next to the data file
    #[serde(default)]
    pub write_summary: bool,
}

impl Default for DaqSettings {
    fn default() -> Self {
        Self {
            ndaq: default_ndaq(),
            event_size: default_event_size(),
            buffer_capacity: default_buffer_capacity(),
            overflow_wait_us: default_overflow_wait_us(),
            recv_timeout_ms: default_recv_timeout_ms(),
            max_dropped: default_max_dropped(),
            infreq: 0,
            save: false,
            output_dir: default_output_dir(),
            file_prefix: String::new(),
            write_summary: false,
        }
    }
}

impl DaqSettings {
    pub fn overflow_wait(&self) -> Duration {
        Duration::from_micros(self.overflow_wait_us)
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms.max(1))
    }
}

fn default_ndaq() -> u64 {
    DEFAULT_NDAQ
}
fn default_event_size() -> usize {
    DEFAULT_EVENT_SIZE
}
fn default_buffer_capacity() -> usize {
    DEFAULT_CAPACITY
}
fn default_overflow_wait_us() -> u64 {
    1000
}
fn default_recv_timeout_ms() -> u64 {
    10
}
fn default_max_dropped() -> u64 {
    100_000
}
fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

// =============================================================================
// Sampler settings
// =============================================================================

/// Throughput sampler settings
#[derive(Debug, Clone, Deserialize)]
pub struct SamplerSettings {
    /// Run the sampling thread
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Sampling interval in milliseconds
    #[serde(default = "default_sampler_interval_ms")]
    pub interval_ms: u64,

    /// Delay between the start of acquisition and the first sample
    #[serde(default = "default_sampler_start_delay_ms")]
    pub start_delay_ms: u64,

    /// Maximum number of samples kept
    #[serde(default = "default_max_samples")]
    pub max_samples: usize,

    /// Write the sample table into the output directory
    #[serde(default = "default_true")]
    pub write_table: bool,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_sampler_interval_ms(),
            start_delay_ms: default_sampler_start_delay_ms(),
            max_samples: default_max_samples(),
            write_table: true,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_sampler_interval_ms() -> u64 {
    1
}
fn default_sampler_start_delay_ms() -> u64 {
    1000
}
fn default_max_samples() -> usize {
    10_000
}

// =============================================================================
// Sources
// =============================================================================

/// One FEB connection
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SourceConfig {
    /// Collector thread in charge of this source
    pub collector: u16,
    /// FEB address (e.g. "192.168.10.1")
    pub address: String,
    /// FEB port
    pub port: u16,
    /// Per-source read quota (defaults to `daq.ndaq`)
    #[serde(default)]
    pub quota: Option<u64>,
}

impl SourceConfig {
    pub fn endpoint(&self) -> SourceEndpoint {
        SourceEndpoint::new(self.address.clone(), self.port)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn source(collector: u16, port: u16) -> SourceConfig {
        SourceConfig {
            collector,
            address: "192.168.10.1".to_string(),
            port,
            quota: None,
        }
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
[[sources]]
collector = 0
address = "192.168.10.1"
port = 24
"#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.daq.ndaq, DEFAULT_NDAQ);
        assert_eq!(config.daq.event_size, DEFAULT_EVENT_SIZE);
        assert_eq!(config.daq.buffer_capacity, DEFAULT_CAPACITY);
        assert!(config.sampler.enabled);
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[daq]
ndaq = 5000
event_size = 64
buffer_capacity = 128
overflow_wait_us = 500
infreq = 1000
save = true
output_dir = "/data/lst"
file_prefix = "run42_"

[sampler]
enabled = false
interval_ms = 5

[[sources]]
collector = 0
address = "192.168.10.1"
port = 24

[[sources]]
collector = 1
address = "192.168.10.2"
port = 24
quota = 10
"#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.daq.ndaq, 5000);
        assert_eq!(config.daq.overflow_wait(), Duration::from_micros(500));
        assert_eq!(config.daq.output_dir, PathBuf::from("/data/lst"));
        assert!(config.daq.save);
        assert!(!config.sampler.enabled);
        assert_eq!(config.n_collectors(), 2);
        assert_eq!(config.quota_for(0), 5000);
        assert_eq!(config.quota_for(1), 10);
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_connection_list() {
        let list = "\
# cid address port
0 192.168.10.1 24

0 192.168.10.2 24
1 192.168.10.3 24
";
        let config = Config::from_connection_list(list).unwrap();
        assert_eq!(config.sources.len(), 3);
        assert_eq!(config.sources[1].address, "192.168.10.2");
        assert_eq!(config.sources[2].collector, 1);
        assert_eq!(config.n_collectors(), 2);
        config.validate().unwrap();
    }

    #[test]
    fn test_connection_list_reports_bad_line() {
        let list = "0 192.168.10.1 24\n0 192.168.10.2\n";
        let err = Config::from_connection_list(list).unwrap_err();
        assert!(matches!(err, ConfigError::ConnectionList { line: 2, .. }));

        let list = "x 192.168.10.1 24\n";
        assert!(Config::from_connection_list(list).is_err());
    }

    #[test]
    fn test_skipped_collector_id_is_rejected() {
        let mut config = Config::from_connection_list("0 a 1\n2 b 2\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("collector id 1 is skipped"));

        config.sources.push(source(1, 3));
        config.validate().unwrap();
    }

    #[test]
    fn test_too_many_connections_rejected() {
        let mut config = Config::from_connection_list("").unwrap();
        config.sources = (0..=MAX_CONNECTION as u16).map(|i| source(0, i + 1)).collect();
        assert!(config.validate().is_err());

        config.sources.pop();
        config.validate().unwrap();
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let base = Config::from_connection_list("0 192.168.10.1 24\n").unwrap();

        let mut config = base.clone();
        config.daq.ndaq = 0;
        assert!(config.validate().is_err());

        let mut config = base.clone();
        config.daq.event_size = HEADER_LEN - 1;
        assert!(config.validate().is_err());

        let mut config = base.clone();
        config.daq.buffer_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = base.clone();
        config.daq.buffer_capacity = usize::MAX / 2;
        assert!(config.validate().is_err());

        let mut config = base.clone();
        config.sources[0].quota = Some(0);
        assert!(config.validate().is_err());

        let mut config = base;
        config.sources.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_poll_timeout_split_across_busiest_collector() {
        let mut config =
            Config::from_connection_list("0 a 1\n0 b 2\n0 c 3\n0 d 4\n1 e 5\n").unwrap();
        config.daq.recv_timeout_ms = 10;
        assert_eq!(config.poll_timeout(), Duration::from_micros(2500));

        let single = Config::from_connection_list("0 a 1\n1 b 2\n").unwrap();
        assert_eq!(single.poll_timeout(), Duration::from_millis(10));

        config.daq.recv_timeout_ms = 2;
        assert_eq!(config.poll_timeout(), Duration::from_millis(1));
    }

    #[test]
    fn test_load_by_extension() {
        let dir = tempfile::tempdir().unwrap();

        let conf = dir.path().join("Connection.conf");
        std::fs::write(&conf, "0 127.0.0.1 5001\n").unwrap();
        let config = Config::load(&conf).unwrap();
        assert_eq!(config.sources[0].port, 5001);

        let toml_path = dir.path().join("daq.toml");
        std::fs::write(
            &toml_path,
            "[daq]\nndaq = 7\n[[sources]]\ncollector = 0\naddress = \"127.0.0.1\"\nport = 5002\n",
        )
        .unwrap();
        let config = Config::load(&toml_path).unwrap();
        assert_eq!(config.daq.ndaq, 7);
        assert_eq!(config.sources[0].endpoint().to_string(), "127.0.0.1:5002");
    }
}
