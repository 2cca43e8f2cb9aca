//! tiller-locks — lock discipline for the supervisor core.
//!
//! Two layers:
//!
//! - [`KeyedRwLock`] — in-process reader/writer locks addressed by string
//!   key, used to serialize target-state access, apply cycles, and per-app
//!   mutations.
//! - [`UpdateLocks`] — on-host advisory lock files shared with co-resident
//!   workloads. Presence of a lock file owned by a workload means "updates
//!   forbidden for this service".

pub mod keyed;
pub mod update;

pub use keyed::{KeyedRwLock, INFER_STEPS_KEY, PAUSE_KEY, TARGET_KEY};
pub use update::{LockError, LockOptions, UpdateLocks, LOCK_FILES};
