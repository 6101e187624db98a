//! Source registry
//!
//! One `SourceGroup` per FEB connection. The registry is built once from the
//! configuration and shared read-only between the collectors, the event
//! builder and the sampler. Group `i` always owns buffer `i`.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::common::DaqResult;
use crate::config::Config;
use crate::ring_buffer::EventBuffer;

/// Network address of a FEB
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceEndpoint {
    pub host: String,
    pub port: u16,
}

impl SourceEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for SourceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One FEB connection and its event buffer
#[derive(Debug, Clone)]
pub struct SourceGroup {
    /// Index into the registry (and merge order)
    pub id: usize,
    /// Collector thread in charge of this source
    pub collector: usize,
    pub endpoint: SourceEndpoint,
    /// Records to read from this source
    pub quota: u64,
    pub buffer: Arc<EventBuffer>,
}

impl SourceGroup {
    /// Bytes the collector must accept before the source is complete
    pub fn quota_bytes(&self) -> u64 {
        self.quota * self.buffer.event_size() as u64
    }
}

/// Indexed collection of every configured source
#[derive(Debug, Clone, Default)]
pub struct SourceRegistry {
    groups: Vec<SourceGroup>,
}

impl SourceRegistry {
    /// Allocate one event buffer per configured source
    ///
    /// Expects a configuration that already passed `Config::validate`.
    pub fn from_config(config: &Config) -> DaqResult<Self> {
        let mut groups = Vec::with_capacity(config.sources.len());
        for (id, source) in config.sources.iter().enumerate() {
            let buffer = EventBuffer::new(config.daq.buffer_capacity, config.daq.event_size)?
                .with_overflow_wait(config.daq.overflow_wait());
            groups.push(SourceGroup {
                id,
                collector: source.collector as usize,
                endpoint: source.endpoint(),
                quota: config.quota_for(id),
                buffer: Arc::new(buffer),
            });
        }
        Ok(Self { groups })
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn get(&self, id: usize) -> Option<&SourceGroup> {
        self.groups.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SourceGroup> {
        self.groups.iter()
    }

    /// Sources assigned to `collector`, in registry order
    pub fn groups_for(&self, collector: usize) -> Vec<SourceGroup> {
        self.groups
            .iter()
            .filter(|g| g.collector == collector)
            .cloned()
            .collect()
    }

    /// Number of collector threads (ids are contiguous from 0)
    pub fn n_collectors(&self) -> usize {
        self.groups
            .iter()
            .map(|g| g.collector + 1)
            .max()
            .unwrap_or(0)
    }

    /// Record size shared by every buffer
    pub fn event_size(&self) -> usize {
        self.groups
            .first()
            .map(|g| g.buffer.event_size())
            .unwrap_or(0)
    }

    pub fn buffers(&self) -> Vec<Arc<EventBuffer>> {
        self.groups.iter().map(|g| Arc::clone(&g.buffer)).collect()
    }

    pub fn endpoints(&self) -> Vec<SourceEndpoint> {
        self.groups.iter().map(|g| g.endpoint.clone()).collect()
    }
}
