//! Startup rendezvous between collectors and the releasing threads
//!
//! Every collector connects its sources, then calls
//! [`StartupBarrier::arrive_and_wait`]. The event builder (and the sampler,
//! when enabled) calls [`StartupBarrier::wait_all_ready`] followed by
//! [`StartupBarrier::release`]. Only the first release has an effect, so
//! either releasing thread may win.
//!
//! Waits poll the shared stop flag at a short interval so that a fatal
//! error elsewhere cannot leave a thread parked forever.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::common::StopFlag;

/// How often a parked thread re-checks the stop flag
const STOP_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
struct BarrierState {
    ready: usize,
    released: bool,
}

/// One-shot rendezvous with N arriving parties and any number of releasers
#[derive(Debug)]
pub struct StartupBarrier {
    parties: usize,
    state: Mutex<BarrierState>,
    /// Signalled on every arrival
    arrived: Condvar,
    /// Signalled on release
    released: Condvar,
}

impl StartupBarrier {
    /// Create a barrier expecting `parties` collectors
    pub fn new(parties: usize) -> Self {
        Self {
            parties,
            state: Mutex::new(BarrierState::default()),
            arrived: Condvar::new(),
            released: Condvar::new(),
        }
    }

    pub fn parties(&self) -> usize {
        self.parties
    }

    pub fn ready_count(&self) -> usize {
        self.state.lock().ready
    }

    pub fn is_released(&self) -> bool {
        self.state.lock().released
    }

    /// Announce readiness and block until released
    ///
    /// Returns `false` if `stop` was raised before the release.
    pub fn arrive_and_wait(&self, stop: &StopFlag) -> bool {
        let mut state = self.state.lock();
        state.ready += 1;
        debug!(ready = state.ready, parties = self.parties, "Collector ready");
        self.arrived.notify_all();

        while !state.released {
            if stop.is_requested() {
                return false;
            }
            self.released.wait_for(&mut state, STOP_POLL);
        }
        true
    }

    /// Block until every party has arrived
    ///
    /// Returns `false` if `stop` was raised first.
    pub fn wait_all_ready(&self, stop: &StopFlag) -> bool {
        let mut state = self.state.lock();
        while state.ready < self.parties {
            if stop.is_requested() {
                return false;
            }
            self.arrived.wait_for(&mut state, STOP_POLL);
        }
        true
    }

    /// Release every waiting party
    ///
    /// Returns `true` only for the call that performed the release.
    pub fn release(&self) -> bool {
        let mut state = self.state.lock();
        if state.released {
            return false;
        }
        state.released = true;
        drop(state);
        self.released.notify_all();
        true
    }
}
