//! tiller-engine — step execution and the apply loop.
//!
//! The [`StepExecutor`] applies planned steps against the runtime under
//! the lock discipline; the [`Applier`] actor owns the reconcile cadence
//! (scheduling, debouncing, failure backoff, pause gating). Both publish
//! typed events on [`EngineEvents`] channels.

pub mod apply;
pub mod current;
pub mod error;
pub mod events;
pub mod executor;
pub mod reporter;

pub use apply::{Applier, ApplierConfig, ApplierHandle, Trigger};
pub use current::{load_current_apps, ORPHAN_APP_ID};
pub use error::{EngineError, EngineResult};
pub use events::{ApplyOutcome, EngineEvents, StepFailure};
pub use executor::{ExecOptions, ExecSummary, StepExecutor};
pub use reporter::Reporter;
