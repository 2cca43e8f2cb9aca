//! Error types for the step executor and apply loop.

use thiserror::Error;

use tiller_locks::LockError;
use tiller_planner::PlanError;
use tiller_runtime::RuntimeError;
use tiller_state::StateError;

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by step execution and apply cycles.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An advisory update lock is held and `force` was not set. Mapped to
    /// HTTP 423 by the API and retried with backoff by the apply loop.
    #[error("updates are locked")]
    UpdatesLocked,

    /// A referenced service does not exist. Mapped to HTTP 404.
    #[error("service not found: {0}")]
    NotFound(String),

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error(transparent)]
    State(#[from] StateError),

    /// Invariant violation; fatal for the cycle, retried by the loop.
    #[error("internal inconsistency: {0}")]
    Internal(String),
}

impl From<LockError> for EngineError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::UpdatesLocked { .. } => EngineError::UpdatesLocked,
            LockError::Io(msg) => EngineError::Runtime(msg),
        }
    }
}

impl From<RuntimeError> for EngineError {
    fn from(err: RuntimeError) -> Self {
        EngineError::Runtime(err.to_string())
    }
}

impl From<PlanError> for EngineError {
    fn from(err: PlanError) -> Self {
        match err {
            PlanError::ServiceNotFound(name) => EngineError::NotFound(name),
            PlanError::InternalInconsistency(msg) => EngineError::Internal(msg),
        }
    }
}
