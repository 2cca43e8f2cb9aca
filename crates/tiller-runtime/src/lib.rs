//! tiller-runtime — thin contract over the container runtime.
//!
//! [`ContainerRuntime`] is the only seam through which the core performs
//! runtime I/O; the planner and executor treat it as opaque. Engines are
//! selected by name; the in-process [`mock::MockEngine`] backs tests and
//! development hosts.

pub mod mock;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

pub use types::*;

/// Result alias for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors surfaced by a runtime engine.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("runtime operation failed: {0}")]
    Failed(String),
}

/// Capability surface of a container engine. All operations are
/// cancel-safe; the engine enforces its own per-operation timeouts.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    fn name(&self) -> &str;

    async fn list_containers(&self) -> RuntimeResult<Vec<ContainerInfo>>;

    async fn list_images(&self) -> RuntimeResult<Vec<ImageInfo>>;

    async fn inspect(&self, container_id: &str) -> RuntimeResult<ContainerDetail>;

    /// Create a container for the spec; returns the container id.
    async fn create(&self, spec: &ServiceSpec) -> RuntimeResult<String>;

    async fn start(&self, container_id: &str) -> RuntimeResult<()>;

    async fn stop(&self, container_id: &str, timeout: Duration) -> RuntimeResult<()>;

    async fn kill(&self, container_id: &str) -> RuntimeResult<()>;

    async fn remove(&self, container_id: &str) -> RuntimeResult<()>;

    /// Pull an image, reporting progress; returns the engine image id.
    async fn pull_image(
        &self,
        reference: &str,
        progress: Option<ProgressSink>,
    ) -> RuntimeResult<String>;

    async fn remove_image(&self, reference: &str) -> RuntimeResult<()>;

    /// Patch container labels in place (metadata-only updates).
    async fn update_metadata(
        &self,
        container_id: &str,
        labels: &std::collections::BTreeMap<String, String>,
    ) -> RuntimeResult<()>;

    async fn create_network(&self, app_id: u32, name: &str) -> RuntimeResult<()>;

    async fn remove_network(&self, app_id: u32, name: &str) -> RuntimeResult<()>;

    async fn create_volume(&self, app_id: u32, name: &str) -> RuntimeResult<()>;

    async fn remove_volume(&self, app_id: u32, name: &str) -> RuntimeResult<()>;

    /// Supervisor-managed networks as `(app_id, name)` pairs.
    async fn list_networks(&self) -> RuntimeResult<Vec<(u32, String)>>;

    /// Supervisor-managed volumes as `(app_id, name)` pairs.
    async fn list_volumes(&self) -> RuntimeResult<Vec<(u32, String)>>;

    /// Subscribe to engine lifecycle events.
    fn events(&self) -> broadcast::Receiver<RuntimeEvent>;
}

/// Select a runtime engine by name.
pub fn select_engine(name: &str) -> RuntimeResult<Arc<dyn ContainerRuntime>> {
    match name {
        "mock" => Ok(Arc::new(mock::MockEngine::new())),
        other => Err(RuntimeError::EngineUnavailable(other.to_owned())),
    }
}
