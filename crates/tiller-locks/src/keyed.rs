//! Keyed in-process reader/writer locks.
//!
//! Guards are owned, so they can cross `await` points and task boundaries;
//! release happens on drop on every exit path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Key protecting the target-state read/write critical section.
pub const TARGET_KEY: &str = "target";

/// Key serializing planning+executing of one apply cycle.
pub const INFER_STEPS_KEY: &str = "infer-steps";

/// Key gating regular applies while an intermediate apply runs.
pub const PAUSE_KEY: &str = "pause";

/// A map of reader/writer locks addressed by string key.
///
/// Locks are created on first use and never reclaimed; the key space is
/// bounded (a handful of well-known keys plus one per app).
#[derive(Debug, Default)]
pub struct KeyedRwLock {
    locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl KeyedRwLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &str) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock().expect("keyed lock map poisoned");
        locks.entry(key.to_string()).or_default().clone()
    }

    /// Acquire a shared read lock on `key`. Readers may share; a writer
    /// excludes them all.
    pub async fn read(&self, key: &str) -> OwnedRwLockReadGuard<()> {
        self.entry(key).read_owned().await
    }

    /// Acquire an exclusive write lock on `key`.
    pub async fn write(&self, key: &str) -> OwnedRwLockWriteGuard<()> {
        self.entry(key).write_owned().await
    }

    /// Acquire an exclusive write lock on an app key.
    pub async fn write_app(&self, app_id: u32) -> OwnedRwLockWriteGuard<()> {
        self.write(&app_id.to_string()).await
    }

    /// True if a writer currently holds `key`. Advisory only (the answer
    /// may be stale by the time the caller acts on it); used by health
    /// probes and tests.
    pub fn is_write_locked(&self, key: &str) -> bool {
        self.entry(key).try_write().is_err()
    }
}
