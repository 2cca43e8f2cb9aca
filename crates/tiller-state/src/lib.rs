//! tiller-state — durable target state and volatile current-state cache.
//!
//! The [`StateStore`] persists target apps, the device target, per-app
//! commits, device config, and API keys in redb; it also caches the last
//! runtime-observed apps, per-service run-intent overlays, and image
//! download progress in memory. Target reads and writes are serialized via
//! the shared `target` lock.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{StateEvent, StateStore};
pub use types::*;
