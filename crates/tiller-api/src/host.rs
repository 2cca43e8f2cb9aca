//! Host control seam.
//!
//! Reboot, shutdown, and the identification blink pattern are host
//! primitives the supervisor invokes but does not implement; the daemon
//! provides the system implementation, tests use [`MockHost`].

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("host operation failed: {0}")]
pub struct HostError(pub String);

/// Host primitives. `reboot`/`shutdown` return once the host acknowledges;
/// neither is cancellable once dispatched.
#[async_trait]
pub trait HostControl: Send + Sync {
    async fn reboot(&self) -> Result<(), HostError>;

    async fn shutdown(&self) -> Result<(), HostError>;

    /// Begin the identification blink pattern.
    async fn blink_start(&self);

    /// End the identification blink pattern.
    async fn blink_stop(&self);
}

/// Recording host for tests.
#[derive(Debug, Default)]
pub struct MockHost {
    pub reboots: std::sync::atomic::AtomicU32,
    pub shutdowns: std::sync::atomic::AtomicU32,
    pub blink_starts: std::sync::atomic::AtomicU32,
    pub blink_stops: std::sync::atomic::AtomicU32,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reboot_count(&self) -> u32 {
        self.reboots.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn shutdown_count(&self) -> u32 {
        self.shutdowns.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn blink_start_count(&self) -> u32 {
        self.blink_starts.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn blink_stop_count(&self) -> u32 {
        self.blink_stops.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl HostControl for MockHost {
    async fn reboot(&self) -> Result<(), HostError> {
        self.reboots
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), HostError> {
        self.shutdowns
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    async fn blink_start(&self) {
        self.blink_starts
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }

    async fn blink_stop(&self) {
        self.blink_stops
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }
}
