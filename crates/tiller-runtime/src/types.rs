//! Wire types for the container runtime contract.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use tiller_state::{AppId, Service, ServiceConfig, ServiceStatus};

/// Summary of one container as listed by the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerInfo {
    pub id: String,
    /// Absent on containers not managed by the supervisor (orphans).
    pub app_id: Option<AppId>,
    pub service_name: Option<String>,
    pub service_id: Option<u32>,
    pub image_id: Option<u32>,
    pub release_id: Option<u32>,
    pub image: String,
    pub status: ServiceStatus,
    /// Unix timestamp (seconds) of container creation.
    pub created_at: u64,
    pub labels: BTreeMap<String, String>,
}

/// Full view of one container, as returned by `inspect`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerDetail {
    pub info: ContainerInfo,
    pub config: ServiceConfig,
}

/// Summary of one image known to the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageInfo {
    /// Engine-side identifier (content digest).
    pub docker_image_id: String,
    /// Reference the image was pulled by.
    pub reference: String,
    pub image_id: Option<u32>,
    pub app_id: Option<AppId>,
    pub service_name: Option<String>,
}

/// Creation request handed to the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceSpec {
    pub app_id: AppId,
    pub service_name: String,
    pub service_id: u32,
    pub image_id: u32,
    pub release_id: Option<u32>,
    pub image: String,
    pub config: ServiceConfig,
}

impl ServiceSpec {
    /// Build a creation spec from a target service.
    pub fn from_service(app_id: AppId, service: &Service) -> Self {
        Self {
            app_id,
            service_name: service.service_name.clone(),
            service_id: service.service_id,
            image_id: service.image_id,
            release_id: service.release_id,
            image: service.image.clone(),
            config: service.config.clone(),
        }
    }
}

/// Engine-side lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEvent {
    ContainerStarted { id: String },
    ContainerStopped { id: String },
    ContainerRemoved { id: String },
    ImagePulled { reference: String },
}

/// Download progress callback for image pulls (0–100).
pub type ProgressSink = Arc<dyn Fn(u8) + Send + Sync>;
