//! Common error types for LSTDAQ components
//!
//! # Design Principles (KISS)
//! - One error enum shared by the acquisition threads
//! - Transient buffer conditions (full/empty) are outcomes, not errors
//! - Use thiserror for ergonomic error handling

use thiserror::Error;

use crate::config::ConfigError;
use crate::recorder::FileFormatError;

/// Errors raised by the acquisition pipeline
///
/// Variants fall in three groups: configuration errors detected before any
/// thread starts, source-level errors that stop one collector, and sink or
/// orchestration errors.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Invalid configuration (detected before steady state)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file could not be loaded
    #[error(transparent)]
    ConfigFile(#[from] ConfigError),

    /// Failed to establish a connection to a FEB
    #[error("Failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    /// Transport-level read failure from a FEB
    #[error("Transport error on source {source_id} ({endpoint}): {error}")]
    Transport {
        source_id: usize,
        endpoint: String,
        #[source]
        error: std::io::Error,
    },

    /// FEB closed the connection before delivering its quota
    #[error("Source {source_id} ({endpoint}) closed after {bytes} bytes")]
    SourceClosed {
        source_id: usize,
        endpoint: String,
        bytes: u64,
    },

    /// Too many records dropped because the buffer stayed full
    #[error("Source {source_id} dropped {dropped} records (limit {limit})")]
    TooManyDrops {
        source_id: usize,
        dropped: u64,
        limit: u64,
    },

    /// Combined-record file format error
    #[error(transparent)]
    FileFormat(#[from] FileFormatError),

    /// I/O error (file operations)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The shared stop flag was raised while waiting
    #[error("Aborted: {0}")]
    Aborted(String),

    /// A worker thread panicked
    #[error("Thread {0} panicked")]
    ThreadPanic(String),
}

impl DaqError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an aborted error
    pub fn aborted(msg: impl Into<String>) -> Self {
        Self::Aborted(msg.into())
    }

    /// Whether this error was caused by a stop request rather than a fault
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted(_))
    }
}

/// Result type alias using DaqError
pub type DaqResult<T> = Result<T, DaqError>;
