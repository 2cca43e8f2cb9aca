//! Domain types for the tiller state store.
//!
//! These types model the declared target state (applications, services,
//! networks, volumes) and the runtime-observed current state. All types are
//! serializable to/from JSON for storage in redb tables and for the local
//! control API.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Numeric application identifier.
pub type AppId = u32;

/// Host-level configuration map diffed ahead of app changes.
pub type DeviceConfig = BTreeMap<String, String>;

// ── Target state ──────────────────────────────────────────────────

/// The full declared target for this device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetState {
    pub local: LocalTarget,
}

/// Target scoped to the local device: name, device config, and apps keyed
/// by their decimal `app_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocalTarget {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub config: DeviceConfig,
    pub apps: BTreeMap<String, App>,
}

impl TargetState {
    /// Parse and validate a raw JSON target.
    ///
    /// Rejections carry a human-readable message and leave no trace in the
    /// store: a missing `local` object, missing `apps`, or malformed
    /// env/device-config values.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, String> {
        let local = value
            .get("local")
            .ok_or("target state must contain a 'local' object")?;
        if !local.is_object() {
            return Err("'local' must be an object".to_string());
        }
        let apps = local
            .get("apps")
            .ok_or("local target must contain 'apps'")?;
        if !apps.is_object() {
            return Err("'apps' must be an object".to_string());
        }
        if let Some(config) = local.get("config") {
            let config = config
                .as_object()
                .ok_or("device config must be an object")?;
            for (key, value) in config {
                if !value.is_string() {
                    return Err(format!("device config value for '{key}' must be a string"));
                }
            }
        }
        for (app_key, app) in apps.as_object().expect("checked above") {
            for service in app
                .get("services")
                .and_then(|s| s.as_array())
                .into_iter()
                .flatten()
            {
                if let Some(env) = service.get("config").and_then(|c| c.get("environment")) {
                    let env = env.as_object().ok_or_else(|| {
                        format!("environment of a service in app {app_key} must be an object")
                    })?;
                    for (key, value) in env {
                        if !value.is_string() {
                            return Err(format!(
                                "environment value '{key}' in app {app_key} must be a string"
                            ));
                        }
                    }
                }
            }
        }
        serde_json::from_value(value.clone()).map_err(|e| format!("malformed target state: {e}"))
    }

    /// Target apps in ascending `app_id` order.
    pub fn apps(&self) -> Vec<&App> {
        let mut apps: Vec<&App> = self.local.apps.values().collect();
        apps.sort_by_key(|a| a.app_id);
        apps
    }
}

// ── Application ───────────────────────────────────────────────────

/// One application: a release of services plus its networks and volumes.
/// The same shape describes both a target and a current instantiation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct App {
    pub app_id: AppId,
    pub name: String,
    /// Opaque release identifier.
    #[serde(default)]
    pub commit: Option<String>,
    #[serde(default)]
    pub release_id: Option<u32>,
    /// Origin URL.
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(default)]
    pub networks: BTreeMap<String, NetworkConfig>,
    #[serde(default)]
    pub volumes: BTreeMap<String, VolumeConfig>,
}

impl App {
    /// Key for the target-apps table.
    pub fn table_key(&self) -> String {
        self.app_id.to_string()
    }

    /// Look up a service by name.
    pub fn service(&self, name: &str) -> Option<&Service> {
        self.services.iter().find(|s| s.service_name == name)
    }

    /// Look up a service by image id.
    pub fn service_by_image(&self, image_id: u32) -> Option<&Service> {
        self.services.iter().find(|s| s.image_id == image_id)
    }
}

// ── Service ───────────────────────────────────────────────────────

/// One service of an application. Keyed by `(app_id, service_name)` and
/// uniquely by `image_id` within its release.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Service {
    pub service_name: String,
    pub service_id: u32,
    pub image_id: u32,
    #[serde(default)]
    pub release_id: Option<u32>,
    /// Image reference to run.
    pub image: String,
    /// Present only when instantiated in the runtime.
    #[serde(default)]
    pub container_id: Option<String>,
    #[serde(default)]
    pub status: ServiceStatus,
    /// Runtime-observed creation time (unix seconds); used to pick the
    /// survivor among duplicate containers.
    #[serde(default)]
    pub created_at: Option<u64>,
    #[serde(default)]
    pub config: ServiceConfig,
    /// A newer replica takes over before the old one stops.
    #[serde(default)]
    pub handover: bool,
}

/// Service lifecycle status. Wire names are fixed by the status API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceStatus {
    Installing,
    Installed,
    Starting,
    Running,
    Stopping,
    Stopped,
    Dead,
    #[serde(rename = "exited")]
    Exited,
    Downloading,
}

impl Default for ServiceStatus {
    fn default() -> Self {
        ServiceStatus::Installing
    }
}

impl ServiceStatus {
    pub fn is_running(self) -> bool {
        matches!(self, ServiceStatus::Running | ServiceStatus::Starting)
    }
}

/// Container configuration for a service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceConfig {
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default)]
    pub restart: Option<String>,
    /// Target run intent. Overridden at plan time by the volatile overlay.
    #[serde(default = "default_true")]
    pub running: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            environment: BTreeMap::new(),
            labels: BTreeMap::new(),
            command: None,
            ports: Vec::new(),
            volumes: Vec::new(),
            networks: Vec::new(),
            restart: None,
            running: true,
        }
    }
}

impl ServiceConfig {
    /// True when the configs differ in anything that requires a container
    /// recreate (everything except labels).
    pub fn differs_materially(&self, other: &Self) -> bool {
        self.environment != other.environment
            || self.command != other.command
            || self.ports != other.ports
            || self.volumes != other.volumes
            || self.networks != other.networks
            || self.restart != other.restart
    }

    /// True when only the labels differ: the container can be patched in
    /// place instead of recreated.
    pub fn metadata_only_diff(&self, other: &Self) -> bool {
        !self.differs_materially(other) && self.labels != other.labels
    }
}

// ── Image ─────────────────────────────────────────────────────────

/// A release image tracked through download and deletion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Image {
    pub image_id: u32,
    pub name: String,
    pub app_id: AppId,
    pub service_name: String,
    #[serde(default)]
    pub release_id: Option<u32>,
    /// Engine-side identifier once pulled.
    #[serde(default)]
    pub docker_image_id: Option<String>,
    pub status: ImageStatus,
    /// 0–100 while downloading, absent otherwise.
    #[serde(default)]
    pub download_progress: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageStatus {
    Downloading,
    Downloaded,
    Deleting,
}

// ── Network / Volume ──────────────────────────────────────────────

/// Network configuration, compared structurally.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    #[serde(default)]
    pub driver: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

/// Volume configuration, compared structurally.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct VolumeConfig {
    #[serde(default)]
    pub driver: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub driver_opts: BTreeMap<String, String>,
}

// ── API keys ──────────────────────────────────────────────────────

/// Persisted record for one API key. The token itself is the table key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiKeyRecord {
    pub kind: ApiKeyKind,
    /// Unix timestamp (seconds) when the key was issued.
    pub created_at: u64,
}

/// Key category: the singular device-wide cloud key, or a key scoped to one
/// `(app_id, service_id)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApiKeyKind {
    Cloud,
    Scoped { app_id: AppId, service_id: u32 },
}
