//! Apply loop.
//!
//! The [`Applier`] actor owns the apply state machine: it is the only
//! writer of `apply_in_progress`, the failure counter, and the scheduled
//! apply slot. External components hold an [`ApplierHandle`] and send
//! trigger messages; they never touch the state directly.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

use tiller_locks::{KeyedRwLock, INFER_STEPS_KEY, PAUSE_KEY};
use tiller_planner::{plan, PlanInput, StepAction};
use tiller_runtime::ContainerRuntime;
use tiller_state::{StateStore, TargetState};

use crate::current::load_current_apps;
use crate::error::{EngineError, EngineResult};
use crate::events::{ApplyOutcome, EngineEvents};
use crate::executor::{ExecOptions, StepExecutor};
use crate::reporter::Reporter;

/// Delay between cycles that applied real steps.
const INTER_CYCLE_DELAY: Duration = Duration::from_millis(200);

/// Delay between cycles when the device is converged.
const NOOP_DELAY: Duration = Duration::from_secs(1);

/// Backoff ceiling for converged cycles following device-config-only work.
const MAX_NOOP_BACKOFF: Duration = Duration::from_secs(600);

/// Timing knobs for the apply loop.
#[derive(Debug, Clone, Copy)]
pub struct ApplierConfig {
    /// `appUpdatePollInterval`; also the backoff ceiling (`maxPollTime`).
    pub poll_interval: Duration,
    /// Base for the failure backoff: `min(2^failed * base, poll_interval)`.
    pub base_backoff: Duration,
}

impl Default for ApplierConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(900),
            base_backoff: Duration::from_secs(1),
        }
    }
}

/// A trigger message.
#[derive(Debug, Clone, Copy)]
pub struct Trigger {
    pub force: bool,
    pub delay: Duration,
    /// API triggers cancel a pending pre-run delay.
    pub from_api: bool,
}

/// What one successful cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleOutcome {
    /// Nothing to do: current equals target.
    Converged,
    /// Steps were executed; `device_only` when all were device-config.
    Applied { device_only: bool },
}

struct Shared {
    apply_in_progress: AtomicBool,
    shutting_down: AtomicBool,
    apply_cancelled: AtomicBool,
    failed_updates: AtomicU32,
    last_apply_start: Mutex<Option<Instant>>,
    last_successful_update: Mutex<Option<Instant>>,
    pause: watch::Sender<bool>,
    max_poll: Duration,
}

/// The apply loop actor. Spawn [`Applier::run`] once at startup.
pub struct Applier {
    executor: StepExecutor,
    store: StateStore,
    runtime: Arc<dyn ContainerRuntime>,
    locks: Arc<KeyedRwLock>,
    events: EngineEvents,
    reporter: Reporter,
    config: ApplierConfig,
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<Trigger>,
    rx: mpsc::UnboundedReceiver<Trigger>,
    /// Converged cycles since the last device-config-only apply.
    noop_streak: u32,
    prev_device_only: bool,
}

/// Cheap handle for triggering and querying the apply loop.
#[derive(Clone)]
pub struct ApplierHandle {
    tx: mpsc::UnboundedSender<Trigger>,
    shared: Arc<Shared>,
    executor: StepExecutor,
    store: StateStore,
    runtime: Arc<dyn ContainerRuntime>,
    locks: Arc<KeyedRwLock>,
}

impl Applier {
    pub fn new(
        executor: StepExecutor,
        store: StateStore,
        runtime: Arc<dyn ContainerRuntime>,
        locks: Arc<KeyedRwLock>,
        events: EngineEvents,
        reporter: Reporter,
        config: ApplierConfig,
    ) -> (Self, ApplierHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (pause, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            apply_in_progress: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            apply_cancelled: AtomicBool::new(false),
            failed_updates: AtomicU32::new(0),
            last_apply_start: Mutex::new(None),
            last_successful_update: Mutex::new(None),
            pause,
            max_poll: config.poll_interval,
        });
        let handle = ApplierHandle {
            tx: tx.clone(),
            shared: shared.clone(),
            executor: executor.clone(),
            store: store.clone(),
            runtime: runtime.clone(),
            locks: locks.clone(),
        };
        let applier = Self {
            executor,
            store,
            runtime,
            locks,
            events,
            reporter,
            config,
            shared,
            tx,
            rx,
            noop_streak: 0,
            prev_device_only: false,
        };
        (applier, handle)
    }

    /// Actor loop: coalesce triggers, honor the pre-run delay, apply.
    pub async fn run(mut self) {
        while let Some(first) = self.rx.recv().await {
            let mut pending = first;
            // Coalesce everything already queued: OR the force flags, take
            // the longest delay.
            while let Ok(next) = self.rx.try_recv() {
                pending.force |= next.force;
                pending.delay = pending.delay.max(next.delay);
                pending.from_api |= next.from_api;
            }
            self.wait_delay(&mut pending).await;
            if self.shared.shutting_down.load(Ordering::SeqCst) {
                continue;
            }
            self.run_apply(pending.force).await;
        }
    }

    /// Sleep the pre-run delay, remaining responsive to new triggers: an
    /// API trigger cancels the delay, others can only shorten it.
    async fn wait_delay(&mut self, pending: &mut Trigger) {
        let mut remaining = pending.delay;
        while !remaining.is_zero() {
            let started = Instant::now();
            let sleep = tokio::time::sleep(remaining);
            tokio::pin!(sleep);
            tokio::select! {
                _ = &mut sleep => return,
                msg = self.rx.recv() => match msg {
                    Some(next) => {
                        pending.force |= next.force;
                        if next.from_api {
                            return;
                        }
                        remaining = remaining
                            .saturating_sub(started.elapsed())
                            .min(next.delay);
                    }
                    None => return,
                }
            }
        }
    }

    async fn run_apply(&mut self, force: bool) {
        self.shared.apply_in_progress.store(true, Ordering::SeqCst);
        self.shared.apply_cancelled.store(false, Ordering::SeqCst);
        *self
            .shared
            .last_apply_start
            .lock()
            .expect("apply state poisoned") = Some(Instant::now());

        let result = self.apply_cycle(force).await;

        self.shared.apply_in_progress.store(false, Ordering::SeqCst);

        match result {
            Ok(outcome) => {
                self.shared.failed_updates.store(0, Ordering::SeqCst);
                *self
                    .shared
                    .last_successful_update
                    .lock()
                    .expect("apply state poisoned") = Some(Instant::now());
                self.reporter.report_current_state(
                    [
                        ("update_failed".to_string(), json!(false)),
                        ("update_pending".to_string(), json!(false)),
                        ("update_downloaded".to_string(), json!(false)),
                    ]
                    .into_iter()
                    .collect(),
                );
                let _ = self
                    .events
                    .apply_target_state_end
                    .send(ApplyOutcome { error: None });

                let delay = self.next_cycle_delay(outcome);
                let _ = self.tx.send(Trigger {
                    force: false,
                    delay,
                    from_api: false,
                });
            }
            Err(err) => {
                let failed = self.shared.failed_updates.fetch_add(1, Ordering::SeqCst) + 1;
                let factor = 2u64.saturating_pow(failed.min(32));
                let delay = self
                    .config
                    .base_backoff
                    .saturating_mul(factor.min(u32::MAX as u64) as u32)
                    .min(self.config.poll_interval);

                match &err {
                    EngineError::UpdatesLocked => {
                        info!(retry_in = ?delay, "apply blocked by update locks")
                    }
                    other => {
                        error!(error = %other, failed_updates = failed, retry_in = ?delay, "apply failed")
                    }
                }
                self.reporter.report_current_state(
                    [("update_failed".to_string(), json!(true))]
                        .into_iter()
                        .collect(),
                );
                let _ = self.events.apply_target_state_end.send(ApplyOutcome {
                    error: Some(err.to_string()),
                });
                let _ = self.tx.send(Trigger {
                    force,
                    delay,
                    from_api: false,
                });
            }
        }
    }

    fn next_cycle_delay(&mut self, outcome: CycleOutcome) -> Duration {
        match outcome {
            CycleOutcome::Applied { device_only } => {
                self.prev_device_only = device_only;
                self.noop_streak = 0;
                INTER_CYCLE_DELAY
            }
            CycleOutcome::Converged => {
                if self.prev_device_only {
                    // Waiting for external convergence after host config
                    // changes: back off exponentially.
                    self.noop_streak = self.noop_streak.saturating_add(1);
                    NOOP_DELAY
                        .saturating_mul(2u32.saturating_pow(self.noop_streak.min(16)))
                        .min(MAX_NOOP_BACKOFF)
                } else {
                    self.noop_streak = 0;
                    NOOP_DELAY
                }
            }
        }
    }

    async fn apply_cycle(&self, force: bool) -> EngineResult<CycleOutcome> {
        // Regular applies wait for the pause blocker before taking the
        // infer-steps lock, so a paused apply never starves the
        // intermediate apply that installed the blocker. Intermediate
        // applies go through `ApplierHandle::apply_intermediate` and skip
        // the blocker.
        let mut pause_rx = self.shared.pause.subscribe();
        while *pause_rx.borrow_and_update() {
            if pause_rx.changed().await.is_err() {
                break;
            }
        }

        let _infer = self.locks.write(INFER_STEPS_KEY).await;

        let target = self.store.get_target(false).await?;
        run_cycle(
            &self.executor,
            &self.store,
            &self.runtime,
            &target,
            ExecOptions {
                force,
                skip_lock: false,
            },
        )
        .await
    }
}

/// One plan-then-execute pass against the given target.
async fn run_cycle(
    executor: &StepExecutor,
    store: &StateStore,
    runtime: &Arc<dyn ContainerRuntime>,
    target: &TargetState,
    opts: ExecOptions,
) -> EngineResult<CycleOutcome> {
    let current = load_current_apps(runtime).await?;
    store.update_current(current.clone());

    let images = runtime.list_images().await?;
    let overlays = store.overlays();
    let target_apps: Vec<_> = target.apps().into_iter().cloned().collect();

    let config_keys: Vec<&str> = target.local.config.keys().map(String::as_str).collect();
    let current_config = store.config_get_many(&config_keys)?;

    let steps = plan(&PlanInput {
        current: &current,
        target: &target_apps,
        images: &images,
        overlays: &overlays,
        current_device_config: &current_config,
        target_device_config: &target.local.config,
    })?;

    if steps.is_empty() {
        // Fully applied: record commits for status readers.
        for app in &target_apps {
            if let Some(commit) = &app.commit {
                if store.get_commit_for_app(app.app_id)?.as_deref() != Some(commit) {
                    store.set_commit_for_app(app.app_id, commit)?;
                }
            }
        }
        return Ok(CycleOutcome::Converged);
    }

    let device_only = steps
        .iter()
        .all(|s| s.action() == StepAction::SetDeviceConfig);
    executor.execute(steps, opts).await?;
    Ok(CycleOutcome::Applied { device_only })
}

impl ApplierHandle {
    /// Request an apply. Coalesced by the actor when one is in progress.
    pub fn trigger(&self, force: bool, delay: Duration, from_api: bool) {
        let _ = self.tx.send(Trigger {
            force,
            delay,
            from_api,
        });
    }

    /// True while a cycle is between plan and execute completion.
    pub fn apply_in_progress(&self) -> bool {
        self.shared.apply_in_progress.load(Ordering::SeqCst)
    }

    pub fn failed_updates(&self) -> u32 {
        self.shared.failed_updates.load(Ordering::SeqCst)
    }

    /// Mark the supervisor as shutting down; pending applies are dropped.
    pub fn set_shutting_down(&self) {
        self.shared.shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutting_down.load(Ordering::SeqCst)
    }

    /// Guards against stuck apply cycles: healthy while no apply runs,
    /// fetches are making progress, or the current cycle is younger than
    /// twice the poll interval (fetch time excluded).
    pub fn healthcheck(&self) -> bool {
        if !self.apply_in_progress() {
            return true;
        }
        if self.executor.fetches_in_progress() > 0 {
            return true;
        }
        let started = *self
            .shared
            .last_apply_start
            .lock()
            .expect("apply state poisoned");
        let Some(started) = started else {
            return true;
        };
        let busy = started
            .elapsed()
            .saturating_sub(self.executor.time_spent_fetching());
        busy < self.shared.max_poll * 2
    }

    /// Run `thunk` while regular applies are blocked. The blocker is
    /// released on every exit path.
    pub async fn pausing_apply<T, F, Fut>(&self, thunk: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _pause_key = self.locks.write(PAUSE_KEY).await;
        let _blocker = PauseBlocker::engage(&self.shared.pause);
        thunk().await
    }

    /// Apply a short-lived intermediate target, bypassing the pause
    /// blocker and the per-app advisory locks.
    pub async fn apply_intermediate(&self, target: &TargetState) -> EngineResult<()> {
        let _infer = self.locks.write(INFER_STEPS_KEY).await;
        self.store.set_intermediate_target(Some(target.clone()));

        // Drive cycles until the intermediate target converges. The bound
        // turns a target that cannot converge into an error instead of a
        // stuck supervisor.
        let result = async {
            for _ in 0..64 {
                let outcome = run_cycle(
                    &self.executor,
                    &self.store,
                    &self.runtime,
                    target,
                    ExecOptions {
                        force: false,
                        skip_lock: true,
                    },
                )
                .await?;
                if outcome == CycleOutcome::Converged {
                    return Ok(());
                }
            }
            Err(EngineError::Internal(
                "intermediate target did not converge".to_string(),
            ))
        }
        .await;

        self.store.set_intermediate_target(None);
        result
    }
}

/// Sets the pause flag for its lifetime.
struct PauseBlocker<'a> {
    pause: &'a watch::Sender<bool>,
}

impl<'a> PauseBlocker<'a> {
    fn engage(pause: &'a watch::Sender<bool>) -> Self {
        pause.send_replace(true);
        Self { pause }
    }
}

impl Drop for PauseBlocker<'_> {
    fn drop(&mut self) {
        self.pause.send_replace(false);
    }
}
