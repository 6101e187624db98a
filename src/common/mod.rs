//! Common infrastructure shared across components
//!
//! Error types, counters, CLI arguments and the stop flag used by every
//! acquisition thread.

pub mod cli;
pub mod error;
pub mod metrics;
pub mod shutdown;

pub use error::{DaqError, DaqResult};
pub use metrics::{AtomicCounters, CounterSnapshot, RateSnapshot};
pub use shutdown::{setup_shutdown, StopFlag};
