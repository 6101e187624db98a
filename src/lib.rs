//! LSTDAQ-RS: event-building DAQ for camera front-end boards (FEBs)
//!
//! Collector threads read fixed-size records from many FEBs over TCP into
//! per-source event buffers. An event builder aligns the streams on their
//! trigger numbers and emits one combined record per trigger seen by every
//! source. An optional sampler records buffer throughput.

pub mod barrier;
pub mod collector;
pub mod common;
pub mod config;
pub mod daq;
pub mod data_source_emulator;
pub mod merger;
pub mod record;
pub mod recorder;
pub mod ring_buffer;
pub mod sampler;
pub mod source;
