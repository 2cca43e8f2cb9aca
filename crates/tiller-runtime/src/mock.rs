//! In-memory mock engine.
//!
//! Backs the test suite and the `mock` engine selection: containers,
//! images, networks, and volumes live in a table behind a mutex. Every
//! operation is recorded so tests can assert on exactly what the executor
//! did, and any operation can be armed to fail once.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use tiller_state::{AppId, Service, ServiceConfig, ServiceStatus};

use crate::types::*;
use crate::{ContainerRuntime, RuntimeError, RuntimeResult};

struct MockContainer {
    info: ContainerInfo,
    config: ServiceConfig,
}

#[derive(Default)]
struct Inner {
    containers: BTreeMap<String, MockContainer>,
    images: Vec<ImageInfo>,
    networks: BTreeSet<(AppId, String)>,
    volumes: BTreeSet<(AppId, String)>,
    /// Recorded operations, e.g. `start mock-1` or `pull registry/main`.
    calls: Vec<String>,
    /// Operations armed to fail once, keyed by op name.
    fail_once: HashMap<String, String>,
    next_id: u64,
    clock: u64,
}

pub struct MockEngine {
    inner: Mutex<Inner>,
    events: broadcast::Sender<RuntimeEvent>,
}

impl Default for MockEngine {
    fn default() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Mutex::new(Inner::default()),
            events,
        }
    }
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("mock engine poisoned")
    }

    fn record(inner: &mut Inner, call: String) {
        inner.calls.push(call);
    }

    fn check_fail(inner: &mut Inner, op: &str) -> RuntimeResult<()> {
        if let Some(msg) = inner.fail_once.remove(op) {
            return Err(RuntimeError::Failed(msg));
        }
        Ok(())
    }

    /// Arm `op` (e.g. `"start"`, `"pull"`) to fail once with `msg`.
    pub fn fail_next(&self, op: &str, msg: &str) {
        self.lock().fail_once.insert(op.to_string(), msg.to_string());
    }

    /// All recorded calls in order.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Number of recorded calls whose op name matches `op`.
    pub fn call_count(&self, op: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.split_whitespace().next() == Some(op))
            .count()
    }

    /// Seed a container for `(app_id, service)`; returns its id.
    pub fn seed_container(&self, app_id: AppId, service: &Service, running: bool) -> String {
        let mut inner = self.lock();
        inner.next_id += 1;
        inner.clock += 1;
        let id = format!("mock-{}", inner.next_id);
        let info = ContainerInfo {
            id: id.clone(),
            app_id: Some(app_id),
            service_name: Some(service.service_name.clone()),
            service_id: Some(service.service_id),
            image_id: Some(service.image_id),
            release_id: service.release_id,
            image: service.image.clone(),
            status: if running {
                ServiceStatus::Running
            } else {
                ServiceStatus::Exited
            },
            created_at: inner.clock,
            labels: service.config.labels.clone(),
        };
        inner.containers.insert(
            id.clone(),
            MockContainer {
                info,
                config: service.config.clone(),
            },
        );
        id
    }

    /// Seed a container the supervisor does not manage.
    pub fn seed_orphan(&self, image: &str) -> String {
        let mut inner = self.lock();
        inner.next_id += 1;
        inner.clock += 1;
        let id = format!("mock-{}", inner.next_id);
        let info = ContainerInfo {
            id: id.clone(),
            app_id: None,
            service_name: None,
            service_id: None,
            image_id: None,
            release_id: None,
            image: image.to_string(),
            status: ServiceStatus::Running,
            created_at: inner.clock,
            labels: BTreeMap::new(),
        };
        inner.containers.insert(
            id.clone(),
            MockContainer {
                info,
                config: ServiceConfig::default(),
            },
        );
        id
    }

    /// Seed an already-downloaded image.
    pub fn seed_image(&self, image_id: u32, reference: &str) {
        let mut inner = self.lock();
        let digest = format!("sha256:mock-{image_id}");
        inner.images.push(ImageInfo {
            docker_image_id: digest,
            reference: reference.to_string(),
            image_id: Some(image_id),
            app_id: None,
            service_name: None,
        });
    }

    /// True while the container exists and is running.
    pub fn is_running(&self, container_id: &str) -> bool {
        self.lock()
            .containers
            .get(container_id)
            .map(|c| c.info.status.is_running())
            .unwrap_or(false)
    }

    pub fn container_count(&self) -> usize {
        self.lock().containers.len()
    }

    pub fn has_volume(&self, app_id: AppId, name: &str) -> bool {
        self.lock().volumes.contains(&(app_id, name.to_string()))
    }

    pub fn has_network(&self, app_id: AppId, name: &str) -> bool {
        self.lock().networks.contains(&(app_id, name.to_string()))
    }
}

#[async_trait]
impl ContainerRuntime for MockEngine {
    fn name(&self) -> &str {
        "mock"
    }

    async fn list_containers(&self) -> RuntimeResult<Vec<ContainerInfo>> {
        let mut inner = self.lock();
        Self::check_fail(&mut inner, "list_containers")?;
        Ok(inner.containers.values().map(|c| c.info.clone()).collect())
    }

    async fn list_images(&self) -> RuntimeResult<Vec<ImageInfo>> {
        let mut inner = self.lock();
        Self::check_fail(&mut inner, "list_images")?;
        Ok(inner.images.clone())
    }

    async fn inspect(&self, container_id: &str) -> RuntimeResult<ContainerDetail> {
        let inner = self.lock();
        inner
            .containers
            .get(container_id)
            .map(|c| ContainerDetail {
                info: c.info.clone(),
                config: c.config.clone(),
            })
            .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))
    }

    async fn create(&self, spec: &ServiceSpec) -> RuntimeResult<String> {
        let mut inner = self.lock();
        Self::check_fail(&mut inner, "create")?;
        inner.next_id += 1;
        inner.clock += 1;
        let id = format!("mock-{}", inner.next_id);
        Self::record(&mut inner, format!("create {} {}", spec.service_name, id));
        let info = ContainerInfo {
            id: id.clone(),
            app_id: Some(spec.app_id),
            service_name: Some(spec.service_name.clone()),
            service_id: Some(spec.service_id),
            image_id: Some(spec.image_id),
            release_id: spec.release_id,
            image: spec.image.clone(),
            status: ServiceStatus::Installed,
            created_at: inner.clock,
            labels: spec.config.labels.clone(),
        };
        inner.containers.insert(
            id.clone(),
            MockContainer {
                info,
                config: spec.config.clone(),
            },
        );
        Ok(id)
    }

    async fn start(&self, container_id: &str) -> RuntimeResult<()> {
        let mut inner = self.lock();
        Self::check_fail(&mut inner, "start")?;
        Self::record(&mut inner, format!("start {container_id}"));
        let container = inner
            .containers
            .get_mut(container_id)
            .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))?;
        container.info.status = ServiceStatus::Running;
        let _ = self.events.send(RuntimeEvent::ContainerStarted {
            id: container_id.to_string(),
        });
        Ok(())
    }

    async fn stop(&self, container_id: &str, _timeout: Duration) -> RuntimeResult<()> {
        let mut inner = self.lock();
        Self::check_fail(&mut inner, "stop")?;
        Self::record(&mut inner, format!("stop {container_id}"));
        let container = inner
            .containers
            .get_mut(container_id)
            .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))?;
        container.info.status = ServiceStatus::Exited;
        let _ = self.events.send(RuntimeEvent::ContainerStopped {
            id: container_id.to_string(),
        });
        Ok(())
    }

    async fn kill(&self, container_id: &str) -> RuntimeResult<()> {
        let mut inner = self.lock();
        Self::check_fail(&mut inner, "kill")?;
        Self::record(&mut inner, format!("kill {container_id}"));
        let container = inner
            .containers
            .get_mut(container_id)
            .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))?;
        container.info.status = ServiceStatus::Dead;
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> RuntimeResult<()> {
        let mut inner = self.lock();
        Self::check_fail(&mut inner, "remove")?;
        Self::record(&mut inner, format!("remove {container_id}"));
        inner
            .containers
            .remove(container_id)
            .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))?;
        let _ = self.events.send(RuntimeEvent::ContainerRemoved {
            id: container_id.to_string(),
        });
        Ok(())
    }

    async fn pull_image(
        &self,
        reference: &str,
        progress: Option<ProgressSink>,
    ) -> RuntimeResult<String> {
        {
            let mut inner = self.lock();
            Self::check_fail(&mut inner, "pull")?;
            Self::record(&mut inner, format!("pull {reference}"));
        }
        if let Some(progress) = &progress {
            progress(50);
            progress(100);
        }
        let mut inner = self.lock();
        inner.next_id += 1;
        let digest = format!("sha256:mock-{}", inner.next_id);
        inner.images.push(ImageInfo {
            docker_image_id: digest.clone(),
            reference: reference.to_string(),
            image_id: None,
            app_id: None,
            service_name: None,
        });
        let _ = self.events.send(RuntimeEvent::ImagePulled {
            reference: reference.to_string(),
        });
        Ok(digest)
    }

    async fn remove_image(&self, reference: &str) -> RuntimeResult<()> {
        let mut inner = self.lock();
        Self::check_fail(&mut inner, "remove_image")?;
        Self::record(&mut inner, format!("remove_image {reference}"));
        inner.images.retain(|i| i.reference != reference);
        Ok(())
    }

    async fn update_metadata(
        &self,
        container_id: &str,
        labels: &BTreeMap<String, String>,
    ) -> RuntimeResult<()> {
        let mut inner = self.lock();
        Self::check_fail(&mut inner, "update_metadata")?;
        Self::record(&mut inner, format!("update_metadata {container_id}"));
        let container = inner
            .containers
            .get_mut(container_id)
            .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))?;
        container.config.labels = labels.clone();
        container.info.labels = labels.clone();
        Ok(())
    }

    async fn create_network(&self, app_id: AppId, name: &str) -> RuntimeResult<()> {
        let mut inner = self.lock();
        Self::check_fail(&mut inner, "create_network")?;
        Self::record(&mut inner, format!("create_network {app_id}/{name}"));
        inner.networks.insert((app_id, name.to_string()));
        Ok(())
    }

    async fn remove_network(&self, app_id: AppId, name: &str) -> RuntimeResult<()> {
        let mut inner = self.lock();
        Self::check_fail(&mut inner, "remove_network")?;
        Self::record(&mut inner, format!("remove_network {app_id}/{name}"));
        inner.networks.remove(&(app_id, name.to_string()));
        Ok(())
    }

    async fn create_volume(&self, app_id: AppId, name: &str) -> RuntimeResult<()> {
        let mut inner = self.lock();
        Self::check_fail(&mut inner, "create_volume")?;
        Self::record(&mut inner, format!("create_volume {app_id}/{name}"));
        inner.volumes.insert((app_id, name.to_string()));
        Ok(())
    }

    async fn remove_volume(&self, app_id: AppId, name: &str) -> RuntimeResult<()> {
        let mut inner = self.lock();
        Self::check_fail(&mut inner, "remove_volume")?;
        Self::record(&mut inner, format!("remove_volume {app_id}/{name}"));
        inner.volumes.remove(&(app_id, name.to_string()));
        Ok(())
    }

    async fn list_networks(&self) -> RuntimeResult<Vec<(AppId, String)>> {
        Ok(self.lock().networks.iter().cloned().collect())
    }

    async fn list_volumes(&self) -> RuntimeResult<Vec<(AppId, String)>> {
        Ok(self.lock().volumes.iter().cloned().collect())
    }

    fn events(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_service(name: &str, image_id: u32) -> Service {
        Service {
            service_name: name.to_string(),
            service_id: 1,
            image_id,
            release_id: Some(1),
            image: format!("registry/{name}:latest"),
            container_id: None,
            status: ServiceStatus::default(),
            created_at: None,
            config: ServiceConfig::default(),
            handover: false,
        }
    }

    fn test_spec(name: &str) -> ServiceSpec {
        ServiceSpec::from_service(7, &test_service(name, 101))
    }

    #[tokio::test]
    async fn create_start_stop_remove_lifecycle() {
        let engine = MockEngine::new();
        let id = engine.create(&test_spec("main")).await.unwrap();

        engine.start(&id).await.unwrap();
        assert!(engine.is_running(&id));

        engine.stop(&id, Duration::from_secs(10)).await.unwrap();
        assert!(!engine.is_running(&id));

        engine.remove(&id).await.unwrap();
        assert_eq!(engine.container_count(), 0);

        assert_eq!(engine.call_count("create"), 1);
        assert_eq!(engine.call_count("start"), 1);
        assert_eq!(engine.call_count("stop"), 1);
        assert_eq!(engine.call_count("remove"), 1);
    }

    #[tokio::test]
    async fn start_unknown_container_is_not_found() {
        let engine = MockEngine::new();
        assert!(matches!(
            engine.start("nope").await,
            Err(RuntimeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn pull_reports_progress_and_registers_image() {
        let engine = MockEngine::new();
        let seen = std::sync::Arc::new(Mutex::new(Vec::new()));
        let sink: ProgressSink = {
            let seen = seen.clone();
            std::sync::Arc::new(move |p| seen.lock().unwrap().push(p))
        };

        let digest = engine
            .pull_image("registry/main:latest", Some(sink))
            .await
            .unwrap();
        assert!(digest.starts_with("sha256:"));
        assert_eq!(*seen.lock().unwrap(), vec![50, 100]);
        assert_eq!(engine.list_images().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn fail_next_arms_a_single_failure() {
        let engine = MockEngine::new();
        engine.fail_next("pull", "registry down");

        assert!(engine.pull_image("img", None).await.is_err());
        assert!(engine.pull_image("img", None).await.is_ok());
    }

    #[tokio::test]
    async fn seeded_containers_are_listed() {
        let engine = MockEngine::new();
        engine.seed_container(7, &test_service("main", 101), true);
        engine.seed_orphan("stray:latest");

        let containers = engine.list_containers().await.unwrap();
        assert_eq!(containers.len(), 2);
        assert!(containers.iter().any(|c| c.app_id == Some(7)));
        assert!(containers.iter().any(|c| c.app_id.is_none()));
    }

    #[tokio::test]
    async fn inspect_returns_config() {
        let engine = MockEngine::new();
        let mut service = test_service("main", 101);
        service
            .config
            .environment
            .insert("PORT".into(), "80".into());
        let id = engine.seed_container(7, &service, true);

        let detail = engine.inspect(&id).await.unwrap();
        assert_eq!(detail.config.environment["PORT"], "80");
    }

    #[tokio::test]
    async fn events_emitted_on_lifecycle() {
        let engine = MockEngine::new();
        let mut events = engine.events();
        let id = engine.create(&test_spec("main")).await.unwrap();
        engine.start(&id).await.unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            RuntimeEvent::ContainerStarted { id }
        );
    }

    #[tokio::test]
    async fn networks_and_volumes_tracked() {
        let engine = MockEngine::new();
        engine.create_network(7, "default").await.unwrap();
        engine.create_volume(7, "data").await.unwrap();
        assert!(engine.has_network(7, "default"));
        assert!(engine.has_volume(7, "data"));

        engine.remove_network(7, "default").await.unwrap();
        engine.remove_volume(7, "data").await.unwrap();
        assert!(!engine.has_network(7, "default"));
        assert!(!engine.has_volume(7, "data"));
    }
}
