//! On-host advisory update locks.
//!
//! Per `(app_id, service_name)` the supervisor takes two lock files under a
//! well-known directory; a co-resident workload that owns either file blocks
//! updates for that service. Layout:
//!
//! ```text
//! /tmp/balena-supervisor/services/<appId>/<serviceName>/updates.lock
//! /tmp/balena-supervisor/services/<appId>/<serviceName>/resin-updates.lock
//! ```
//!
//! A legacy `/tmp/resin-supervisor` tree is accepted as an alias at startup.
//! Missing directories mean "no lock to coordinate with".

use std::collections::BTreeSet;
use std::fs;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, warn};

use crate::keyed::KeyedRwLock;

/// Default advisory lock tree.
pub const BASE_DIR: &str = "/tmp/balena-supervisor/services";

/// Legacy alias, honored when present and the default tree is absent.
pub const LEGACY_BASE_DIR: &str = "/tmp/resin-supervisor/services";

/// Both filenames must be taken for full coverage (backward compatibility).
pub const LOCK_FILES: [&str; 2] = ["updates.lock", "resin-updates.lock"];

/// Result alias for advisory lock operations.
pub type LockResult<T> = Result<T, LockError>;

/// Errors surfaced by the advisory lock layer.
#[derive(Debug, Error)]
pub enum LockError {
    /// A lock file is already held by another workload.
    #[error("updates are locked for app {app_id}")]
    UpdatesLocked { app_id: u32 },

    #[error("lock file I/O error: {0}")]
    Io(String),
}

/// Options for a single lock acquisition.
#[derive(Debug, Clone, Copy, Default)]
pub struct LockOptions {
    /// Pre-unlink existing lock files before taking them.
    pub force: bool,
}

/// Advisory lock manager.
///
/// Holds the base directory, the shared in-process keyed lock, and the
/// registry of lock files this process currently owns (for exit cleanup).
pub struct UpdateLocks {
    base: PathBuf,
    keyed: Arc<KeyedRwLock>,
    held: Mutex<BTreeSet<PathBuf>>,
}

impl UpdateLocks {
    /// Create a manager over the conventional lock tree, falling back to the
    /// legacy alias when only it exists.
    pub fn new(keyed: Arc<KeyedRwLock>) -> Self {
        let base = if !Path::new(BASE_DIR).exists() && Path::new(LEGACY_BASE_DIR).exists() {
            PathBuf::from(LEGACY_BASE_DIR)
        } else {
            PathBuf::from(BASE_DIR)
        };
        Self::with_base(keyed, base)
    }

    /// Create a manager rooted at an explicit directory (tests).
    pub fn with_base(keyed: Arc<KeyedRwLock>, base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            keyed,
            held: Mutex::new(BTreeSet::new()),
        }
    }

    /// Lock directory for one app.
    pub fn app_dir(&self, app_id: u32) -> PathBuf {
        self.base.join(app_id.to_string())
    }

    /// Run `thunk` under the app's advisory locks.
    ///
    /// With `app_id == None` the thunk runs without advisory locking.
    /// Otherwise the in-process writer lock on the app key is taken first,
    /// then both lock files for every service under the app's lock
    /// directory. If any file is already locked the acquired ones are
    /// released in reverse order and the call fails with `UpdatesLocked`.
    /// The thunk's outcome propagates; files and the writer lock release on
    /// every exit path.
    pub async fn lock<T, E, F, Fut>(
        &self,
        app_id: Option<u32>,
        opts: LockOptions,
        thunk: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        let Some(app_id) = app_id else {
            return thunk().await;
        };

        let _app_guard = self.keyed.write_app(app_id).await;
        self.lock_files(app_id, opts, thunk).await
    }

    /// Files-only variant of [`UpdateLocks::lock`], for callers that already
    /// hold the in-process writer lock on the app key (the step executor
    /// serializes a whole app group under one guard). Taking the keyed lock
    /// again here would deadlock.
    pub async fn lock_files<T, E, F, Fut>(
        &self,
        app_id: u32,
        opts: LockOptions,
        thunk: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        let taken = self.take_all(app_id, opts)?;
        let outcome = thunk().await;
        self.release(&taken);
        outcome
    }

    /// Take both lock files for every service directory of the app.
    fn take_all(&self, app_id: u32, opts: LockOptions) -> LockResult<Vec<PathBuf>> {
        let dir = self.app_dir(app_id);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            // No lock directory: nothing to coordinate with.
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(LockError::Io(e.to_string())),
        };

        let mut taken: Vec<PathBuf> = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| LockError::Io(e.to_string()))?;
            let service_dir = entry.path();
            if !service_dir.is_dir() {
                continue;
            }
            for name in LOCK_FILES {
                let path = service_dir.join(name);
                match self.take_one(&path, opts) {
                    Ok(true) => taken.push(path),
                    Ok(false) => {}
                    Err(e) => {
                        // Roll back in reverse order before failing.
                        for path in taken.iter().rev() {
                            let _ = fs::remove_file(path);
                            self.held.lock().expect("held set poisoned").remove(path);
                        }
                        warn!(app_id, path = %path.display(), "update lock held by another workload");
                        return Err(e.map_locked(app_id));
                    }
                }
            }
        }

        debug!(app_id, count = taken.len(), "update locks acquired");
        Ok(taken)
    }

    /// Take one lock file. Returns false when the parent directory vanished
    /// (treated as "no lock present").
    fn take_one(&self, path: &Path, opts: LockOptions) -> LockResult<bool> {
        if opts.force {
            match fs::remove_file(path) {
                Ok(()) => debug!(path = %path.display(), "pre-unlinked existing lock file"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(LockError::Io(e.to_string())),
            }
        }
        match fs::OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(_) => {
                self.held
                    .lock()
                    .expect("held set poisoned")
                    .insert(path.to_path_buf());
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(LockError::UpdatesLocked { app_id: 0 })
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(LockError::Io(e.to_string())),
        }
    }

    fn release(&self, taken: &[PathBuf]) {
        let mut held = self.held.lock().expect("held set poisoned");
        for path in taken.iter().rev() {
            if let Err(e) = fs::remove_file(path) {
                if e.kind() != ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "failed to release lock file");
                }
            }
            held.remove(path);
        }
    }

    /// Unlink every lock file this process still holds. Called from the
    /// process exit handler; must never fail.
    pub fn cleanup_on_exit(&self) {
        let mut held = self.held.lock().expect("held set poisoned");
        for path in held.iter() {
            let _ = fs::remove_file(path);
        }
        held.clear();
    }

    /// Paths currently held by this process (tests).
    pub fn held_paths(&self) -> Vec<PathBuf> {
        self.held
            .lock()
            .expect("held set poisoned")
            .iter()
            .cloned()
            .collect()
    }
}

impl LockError {
    fn map_locked(self, app_id: u32) -> Self {
        match self {
            LockError::UpdatesLocked { .. } => LockError::UpdatesLocked { app_id },
            other => other,
        }
    }
}
