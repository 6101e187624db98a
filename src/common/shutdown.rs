//! Unified shutdown handling for LSTDAQ components
//!
//! # Design Principles (KISS)
//! - Acquisition threads are plain OS threads, so the stop signal is a shared atomic flag
//! - Any thread hitting a fatal error raises the flag so blocked peers exit
//! - Binaries hook Ctrl+C onto the same flag through a tokio task

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::signal;
use tracing::info;

/// Process-wide stop request shared by every acquisition thread
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    /// Create a lowered flag
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag. Returns true if this call raised it.
    pub fn request(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    /// Check whether a stop has been requested
    #[inline]
    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Setup shutdown handling with Ctrl+C signal
///
/// Spawns a task that raises `stop` on Ctrl+C. Must be called from within a
/// tokio runtime.
///
/// # Example
/// ```ignore
/// let stop = StopFlag::new();
/// setup_shutdown(stop.clone());
/// daq.run(&TcpConnector::default(), &mut sink, &stop)?;
/// ```
pub fn setup_shutdown(stop: StopFlag) {
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received, initiating shutdown");
            stop.request();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_is_idempotent() {
        let stop = StopFlag::new();
        assert!(!stop.is_requested());
        assert!(stop.request());
        assert!(!stop.request());
        assert!(stop.is_requested());
    }

    #[test]
    fn test_clones_share_state() {
        let stop = StopFlag::new();
        let other = stop.clone();
        other.request();
        assert!(stop.is_requested());
    }

    #[tokio::test]
    async fn test_setup_shutdown_does_not_raise() {
        let stop = StopFlag::new();
        setup_shutdown(stop.clone());
        tokio::task::yield_now().await;
        assert!(!stop.is_requested());
    }
}
