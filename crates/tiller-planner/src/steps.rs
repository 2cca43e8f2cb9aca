//! Composition steps.
//!
//! A step is one atomic action on a service, network, volume, image, or
//! host config key, carrying enough context to execute without further
//! lookups.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use tiller_state::{AppId, Service};

/// One planned action. The executor consumes these in order within an app
/// and concurrently across apps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Step {
    /// Pull the image for a target service.
    Fetch {
        app_id: AppId,
        service_name: String,
        image_id: u32,
        image: String,
    },
    /// Force-stop a container ahead of removal.
    Kill {
        app_id: AppId,
        service_name: String,
        container_id: String,
    },
    /// Remove a container. `service_name` is absent for orphans.
    Remove {
        app_id: AppId,
        service_name: Option<String>,
        container_id: String,
    },
    /// Create (if needed) and start the container for a service. When the
    /// service carries a `container_id` the existing container is started.
    Start { app_id: AppId, service: Service },
    /// Patch labels in place; the container is not recreated.
    UpdateMetadata {
        app_id: AppId,
        service_name: String,
        container_id: String,
        labels: BTreeMap<String, String>,
    },
    /// Start the replacement, then quiesce and stop the old replica.
    Handover {
        app_id: AppId,
        old_container_id: String,
        service: Service,
    },
    /// Stop then start a service in place.
    Restart {
        app_id: AppId,
        container_id: String,
        service: Service,
    },
    Stop {
        app_id: AppId,
        service_name: String,
        container_id: String,
    },
    /// Remove all containers and volumes of an app so the next apply
    /// recreates it from scratch.
    Purge { app_id: AppId },
    CreateNetwork { app_id: AppId, name: String },
    RemoveNetwork { app_id: AppId, name: String },
    CreateVolume { app_id: AppId, name: String },
    RemoveVolume { app_id: AppId, name: String },
    /// Host-level config write; always precedes app steps in a cycle.
    SetDeviceConfig { key: String, value: String },
    Noop,
}

/// Discriminant of a step, used for lock policy and event payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepAction {
    Fetch,
    Kill,
    Remove,
    Start,
    UpdateMetadata,
    Handover,
    Restart,
    Stop,
    Purge,
    CreateNetwork,
    RemoveNetwork,
    CreateVolume,
    RemoveVolume,
    SetDeviceConfig,
    Noop,
}

impl fmt::Display for StepAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepAction::Fetch => "fetch",
            StepAction::Kill => "kill",
            StepAction::Remove => "remove",
            StepAction::Start => "start",
            StepAction::UpdateMetadata => "updateMetadata",
            StepAction::Handover => "handover",
            StepAction::Restart => "restart",
            StepAction::Stop => "stop",
            StepAction::Purge => "purge",
            StepAction::CreateNetwork => "createNetwork",
            StepAction::RemoveNetwork => "removeNetwork",
            StepAction::CreateVolume => "createVolume",
            StepAction::RemoveVolume => "removeVolume",
            StepAction::SetDeviceConfig => "setDeviceConfig",
            StepAction::Noop => "noop",
        };
        f.write_str(name)
    }
}

impl Step {
    pub fn action(&self) -> StepAction {
        match self {
            Step::Fetch { .. } => StepAction::Fetch,
            Step::Kill { .. } => StepAction::Kill,
            Step::Remove { .. } => StepAction::Remove,
            Step::Start { .. } => StepAction::Start,
            Step::UpdateMetadata { .. } => StepAction::UpdateMetadata,
            Step::Handover { .. } => StepAction::Handover,
            Step::Restart { .. } => StepAction::Restart,
            Step::Stop { .. } => StepAction::Stop,
            Step::Purge { .. } => StepAction::Purge,
            Step::CreateNetwork { .. } => StepAction::CreateNetwork,
            Step::RemoveNetwork { .. } => StepAction::RemoveNetwork,
            Step::CreateVolume { .. } => StepAction::CreateVolume,
            Step::RemoveVolume { .. } => StepAction::RemoveVolume,
            Step::SetDeviceConfig { .. } => StepAction::SetDeviceConfig,
            Step::Noop => StepAction::Noop,
        }
    }

    /// The app this step touches, if any. Device-config steps and noops are
    /// app-less and never take app locks.
    pub fn app_id(&self) -> Option<AppId> {
        match self {
            Step::Fetch { app_id, .. }
            | Step::Kill { app_id, .. }
            | Step::Remove { app_id, .. }
            | Step::Start { app_id, .. }
            | Step::UpdateMetadata { app_id, .. }
            | Step::Handover { app_id, .. }
            | Step::Restart { app_id, .. }
            | Step::Stop { app_id, .. }
            | Step::Purge { app_id, .. }
            | Step::CreateNetwork { app_id, .. }
            | Step::RemoveNetwork { app_id, .. }
            | Step::CreateVolume { app_id, .. }
            | Step::RemoveVolume { app_id, .. } => Some(*app_id),
            Step::SetDeviceConfig { .. } | Step::Noop => None,
        }
    }
}

impl StepAction {
    /// Actions on the always-lock-free list. Every other action runs inside
    /// the advisory `lock(app_id, ..)` combinator. The Control-API start
    /// bypass is decided by the executor, not here.
    pub fn is_lock_free(self) -> bool {
        matches!(
            self,
            StepAction::Fetch
                | StepAction::UpdateMetadata
                | StepAction::Noop
                | StepAction::SetDeviceConfig
        )
    }
}
