//! Step executor.
//!
//! Applies planned steps against the runtime. Steps of different apps run
//! concurrently; steps of one app run serially under the app's in-process
//! writer lock, each wrapped in the advisory lock combinator unless the
//! action is on the always-lock-free list. Per-step outcomes are published
//! on the `step_completed` / `step_error` channels.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use tiller_locks::{KeyedRwLock, LockOptions, UpdateLocks};
use tiller_planner::{Step, StepAction};
use tiller_runtime::{ContainerRuntime, ProgressSink, ServiceSpec};
use tiller_state::{AppId, Image, ImageStatus, Service, StateStore};

use crate::current::load_current_apps;
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvents, StepFailure};

/// Grace period handed to the engine when stopping a container.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Execution options for one batch of steps.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecOptions {
    /// Break advisory locks held by workloads.
    pub force: bool,
    /// Bypass the per-app writer lock and advisory locks entirely
    /// (intermediate applies).
    pub skip_lock: bool,
}

/// Summary of one executed batch.
#[derive(Debug, Clone, Copy)]
pub struct ExecSummary {
    pub steps: usize,
}

/// Applies composition steps. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct StepExecutor {
    runtime: Arc<dyn ContainerRuntime>,
    store: StateStore,
    locks: Arc<KeyedRwLock>,
    update_locks: Arc<UpdateLocks>,
    events: EngineEvents,
    fetches_in_progress: Arc<AtomicU32>,
    fetch_millis: Arc<AtomicU64>,
}

impl StepExecutor {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: StateStore,
        locks: Arc<KeyedRwLock>,
        update_locks: Arc<UpdateLocks>,
        events: EngineEvents,
    ) -> Self {
        Self {
            runtime,
            store,
            locks,
            update_locks,
            events,
            fetches_in_progress: Arc::new(AtomicU32::new(0)),
            fetch_millis: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of image pulls currently in flight.
    pub fn fetches_in_progress(&self) -> u32 {
        self.fetches_in_progress.load(Ordering::SeqCst)
    }

    /// Total time spent fetching images since startup.
    pub fn time_spent_fetching(&self) -> Duration {
        Duration::from_millis(self.fetch_millis.load(Ordering::SeqCst))
    }

    /// Execute a batch of steps.
    ///
    /// Steps are grouped by `app_id`; groups run concurrently, steps within
    /// a group serially under `write(app_id)`. Failures are aggregated:
    /// `UpdatesLocked` wins over other errors so the caller can map it to
    /// 423 / info-level handling.
    pub async fn execute(&self, steps: Vec<Step>, opts: ExecOptions) -> EngineResult<ExecSummary> {
        let total = steps.len();
        let mut groups: BTreeMap<Option<AppId>, Vec<Step>> = BTreeMap::new();
        for step in steps {
            groups.entry(step.app_id()).or_default().push(step);
        }

        let mut tasks = Vec::new();
        for (app_id, group) in groups {
            let executor = self.clone();
            tasks.push(tokio::spawn(async move {
                executor.run_group(app_id, group, opts).await
            }));
        }

        let mut errors: Vec<EngineError> = Vec::new();
        for task in tasks {
            match task.await {
                Ok(mut group_errors) => errors.append(&mut group_errors),
                Err(e) => errors.push(EngineError::Internal(format!("step task panicked: {e}"))),
            }
        }

        if errors.iter().any(|e| matches!(e, EngineError::UpdatesLocked)) {
            return Err(EngineError::UpdatesLocked);
        }
        match errors.into_iter().next() {
            Some(err) => Err(err),
            None => Ok(ExecSummary { steps: total }),
        }
    }

    /// One app group: serialize against other mutations of the same app,
    /// then run each step under the advisory lock discipline.
    async fn run_group(
        &self,
        app_id: Option<AppId>,
        steps: Vec<Step>,
        opts: ExecOptions,
    ) -> Vec<EngineError> {
        let _app_guard = match app_id {
            Some(id) if !opts.skip_lock => Some(self.locks.write_app(id).await),
            _ => None,
        };

        let mut errors = Vec::new();
        for step in steps {
            let result = self.dispatch(&step, opts).await;
            match result {
                Ok(()) => {
                    debug!(action = %step.action(), "step completed");
                    let _ = self.events.step_completed.send(step);
                }
                Err(err) => {
                    warn!(action = %step.action(), error = %err, "step failed");
                    let _ = self.events.step_error.send(StepFailure {
                        step,
                        error: err.to_string(),
                    });
                    errors.push(err);
                }
            }
        }
        errors
    }

    /// Wrap one step in the advisory lock combinator when its action
    /// requires it. The caller already holds the in-process app lock, so
    /// only the lock files are taken here.
    async fn dispatch(&self, step: &Step, opts: ExecOptions) -> EngineResult<()> {
        let action = step.action();
        let needs_lock = !action.is_lock_free() && !opts.skip_lock;
        match (needs_lock, step.app_id()) {
            (true, Some(app_id)) => {
                let force = opts.force || self.store.config_bool("lockOverride");
                self.update_locks
                    .lock_files(app_id, LockOptions { force }, || self.run_step(step))
                    .await
            }
            _ => self.run_step(step).await,
        }
    }

    /// Execute a single Control-API step, waiting for completion.
    ///
    /// The API `start` action explicitly bypasses advisory locks; every
    /// other action takes the full `lock(app_id, {force}, ..)` combinator.
    /// Both paths serialize against apply cycles via the app writer lock.
    pub async fn execute_single(&self, step: Step, force: bool) -> EngineResult<()> {
        let action = step.action();
        let result = match step.app_id() {
            Some(app_id) if action.is_lock_free() || action == StepAction::Start => {
                let _guard = self.locks.write_app(app_id).await;
                self.run_step(&step).await
            }
            Some(app_id) => {
                let force = force || self.store.config_bool("lockOverride");
                self.update_locks
                    .lock(Some(app_id), LockOptions { force }, || self.run_step(&step))
                    .await
            }
            None => self.run_step(&step).await,
        };

        match &result {
            Ok(()) => {
                let _ = self.events.step_completed.send(step);
            }
            Err(err) => {
                let _ = self.events.step_error.send(StepFailure {
                    step,
                    error: err.to_string(),
                });
            }
        }
        result
    }

    /// Issue a stop for every service currently instantiated (the
    /// reboot/shutdown path).
    pub async fn stop_all(&self, opts: ExecOptions) -> EngineResult<ExecSummary> {
        let apps = load_current_apps(&self.runtime).await?;
        let mut steps = Vec::new();
        for app in &apps {
            for service in &app.services {
                if let Some(container_id) = &service.container_id {
                    if service.status.is_running() {
                        steps.push(Step::Stop {
                            app_id: app.app_id,
                            service_name: service.service_name.clone(),
                            container_id: container_id.clone(),
                        });
                    }
                }
            }
        }
        self.execute(steps, opts).await
    }

    async fn run_step(&self, step: &Step) -> EngineResult<()> {
        match step {
            Step::Fetch {
                app_id,
                service_name,
                image_id,
                image,
            } => self.fetch(*app_id, service_name, *image_id, image).await,

            Step::Start { app_id, service } => self.start_service(*app_id, service).await,

            Step::Kill { container_id, .. } => {
                self.runtime.kill(container_id).await?;
                Ok(())
            }

            Step::Remove { container_id, .. } => {
                self.runtime.remove(container_id).await?;
                Ok(())
            }

            Step::Stop { container_id, .. } => {
                self.runtime.stop(container_id, STOP_TIMEOUT).await?;
                Ok(())
            }

            Step::Restart {
                app_id,
                container_id,
                service,
            } => {
                self.runtime.stop(container_id, STOP_TIMEOUT).await?;
                self.runtime.start(container_id).await?;
                debug!(app_id, service = %service.service_name, "service restarted");
                Ok(())
            }

            Step::Handover {
                app_id,
                old_container_id,
                service,
            } => {
                // Start the new replica before the old one quiesces.
                self.start_service(*app_id, service).await?;
                self.runtime.stop(old_container_id, STOP_TIMEOUT).await?;
                self.runtime.remove(old_container_id).await?;
                Ok(())
            }

            Step::UpdateMetadata {
                container_id,
                labels,
                ..
            } => {
                self.runtime.update_metadata(container_id, labels).await?;
                Ok(())
            }

            Step::Purge { app_id } => self.purge(*app_id).await,

            Step::CreateNetwork { app_id, name } => {
                self.runtime.create_network(*app_id, name).await?;
                Ok(())
            }
            Step::RemoveNetwork { app_id, name } => {
                self.runtime.remove_network(*app_id, name).await?;
                Ok(())
            }
            Step::CreateVolume { app_id, name } => {
                self.runtime.create_volume(*app_id, name).await?;
                Ok(())
            }
            Step::RemoveVolume { app_id, name } => {
                self.runtime.remove_volume(*app_id, name).await?;
                Ok(())
            }

            Step::SetDeviceConfig { key, value } => {
                self.store.config_set(&[(key.as_str(), value.as_str())])?;
                Ok(())
            }

            Step::Noop => Ok(()),
        }
    }

    async fn fetch(
        &self,
        app_id: AppId,
        service_name: &str,
        image_id: u32,
        image: &str,
    ) -> EngineResult<()> {
        self.store.update_image(Image {
            image_id,
            name: image.to_string(),
            app_id,
            service_name: service_name.to_string(),
            release_id: None,
            docker_image_id: None,
            status: ImageStatus::Downloading,
            download_progress: Some(0),
        });

        let progress: ProgressSink = {
            let store = self.store.clone();
            let name = image.to_string();
            let service_name = service_name.to_string();
            Arc::new(move |percent| {
                store.update_image(Image {
                    image_id,
                    name: name.clone(),
                    app_id,
                    service_name: service_name.clone(),
                    release_id: None,
                    docker_image_id: None,
                    status: ImageStatus::Downloading,
                    download_progress: Some(percent),
                });
            })
        };

        self.fetches_in_progress.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();
        let result = self.runtime.pull_image(image, Some(progress)).await;
        self.fetch_millis
            .fetch_add(started.elapsed().as_millis() as u64, Ordering::SeqCst);
        self.fetches_in_progress.fetch_sub(1, Ordering::SeqCst);

        match result {
            Ok(docker_image_id) => {
                self.store.update_image(Image {
                    image_id,
                    name: image.to_string(),
                    app_id,
                    service_name: service_name.to_string(),
                    release_id: None,
                    docker_image_id: Some(docker_image_id),
                    status: ImageStatus::Downloaded,
                    download_progress: None,
                });
                Ok(())
            }
            Err(err) => {
                self.store.remove_image_state(image_id);
                Err(err.into())
            }
        }
    }

    async fn start_service(&self, app_id: AppId, service: &Service) -> EngineResult<()> {
        match &service.container_id {
            Some(container_id) => {
                self.runtime.start(container_id).await?;
            }
            None => {
                let spec = ServiceSpec::from_service(app_id, service);
                let container_id = self.runtime.create(&spec).await?;
                self.runtime.start(&container_id).await?;
            }
        }
        Ok(())
    }

    /// Remove an app's containers and volumes so the next apply recreates
    /// them from a clean slate.
    async fn purge(&self, app_id: AppId) -> EngineResult<()> {
        let apps = load_current_apps(&self.runtime).await?;
        let Some(app) = apps.into_iter().find(|a| a.app_id == app_id) else {
            return Ok(());
        };

        for service in &app.services {
            if let Some(container_id) = &service.container_id {
                if service.status.is_running() {
                    self.runtime.stop(container_id, STOP_TIMEOUT).await?;
                }
                self.runtime.remove(container_id).await?;
            }
        }
        for name in app.volumes.keys() {
            self.runtime.remove_volume(app_id, name).await?;
        }
        self.store.clear_volatile(app_id);
        Ok(())
    }
}
