//! Typed event channels for the supervisor core.
//!
//! One broadcast channel per event kind with a typed payload. Senders
//! ignore the no-receiver case; subscribers that lag simply miss events.

use tokio::sync::broadcast;

use tiller_planner::Step;

/// Payload for `step_error`.
#[derive(Debug, Clone)]
pub struct StepFailure {
    pub step: Step,
    pub error: String,
}

/// Payload for `apply_target_state_end`.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    /// Error message when the cycle failed.
    pub error: Option<String>,
}

/// All core event channels, cheap to clone into subsystems.
#[derive(Clone)]
pub struct EngineEvents {
    /// Device report fields changed (current-state reporter).
    pub change: broadcast::Sender<serde_json::Value>,
    pub step_completed: broadcast::Sender<Step>,
    pub step_error: broadcast::Sender<StepFailure>,
    pub apply_target_state_end: broadcast::Sender<ApplyOutcome>,
    pub shutdown: broadcast::Sender<()>,
}

impl EngineEvents {
    pub fn new() -> Self {
        let (change, _) = broadcast::channel(64);
        let (step_completed, _) = broadcast::channel(64);
        let (step_error, _) = broadcast::channel(64);
        let (apply_target_state_end, _) = broadcast::channel(16);
        let (shutdown, _) = broadcast::channel(1);
        Self {
            change,
            step_completed,
            step_error,
            apply_target_state_end,
            shutdown,
        }
    }
}

impl Default for EngineEvents {
    fn default() -> Self {
        Self::new()
    }
}
