//! tillerd — the tiller supervisor daemon.
//!
//! Single process that reconciles the declared target application state
//! against the local container runtime and serves the `/v2` control API.
//!
//! # Usage
//!
//! ```text
//! tillerd --listen-port 48484 --data-dir /var/lib/tiller
//! tillerd --engine mock --local-mode --data-dir /tmp/tiller-dev
//! ```

mod host;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::broadcast;
use tracing::info;

use tiller_api::{ApiCtx, HostControl};
use tiller_engine::{Applier, ApplierConfig, EngineEvents, Reporter, StepExecutor};
use tiller_keys::KeyStore;
use tiller_locks::{KeyedRwLock, UpdateLocks};
use tiller_state::{StateEvent, StateStore};

#[derive(Parser)]
#[command(name = "tillerd", about = "On-device application supervisor")]
struct Cli {
    /// Port for the local control API.
    #[arg(long, default_value = "48484")]
    listen_port: u16,

    /// Data directory for persistent state.
    #[arg(long, default_value = "/var/lib/tiller")]
    data_dir: PathBuf,

    /// Container engine to drive (`mock` runs in-process).
    #[arg(long, default_value = "mock")]
    engine: String,

    /// Accept target state from the local API instead of cloud polling.
    #[arg(long)]
    local_mode: bool,

    /// Target-state poll interval in seconds.
    #[arg(long, default_value = "900")]
    poll_interval: u64,

    /// Override the advisory lock directory (tests and development).
    #[arg(long)]
    lock_dir: Option<PathBuf>,

    /// LED device used by the identification blink.
    #[arg(long, default_value = "/sys/class/leds/led0/brightness")]
    led_path: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tillerd=debug,tiller=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    info!("tiller supervisor starting");

    // ── State store ────────────────────────────────────────────────
    std::fs::create_dir_all(&cli.data_dir)?;
    let db_path = cli.data_dir.join("tiller.redb");
    let locks = Arc::new(KeyedRwLock::new());
    let store = StateStore::open(&db_path, locks.clone())?;
    info!(path = ?db_path, "state store opened");

    let listen_port = cli.listen_port.to_string();
    let poll_interval_ms = (cli.poll_interval * 1000).to_string();
    store.config_set(&[
        ("localMode", if cli.local_mode { "true" } else { "false" }),
        ("listenPort", listen_port.as_str()),
        ("appUpdatePollInterval", poll_interval_ms.as_str()),
    ])?;

    // ── Advisory update locks ──────────────────────────────────────
    let update_locks = Arc::new(match &cli.lock_dir {
        Some(dir) => UpdateLocks::with_base(locks.clone(), dir),
        None => UpdateLocks::new(locks.clone()),
    });

    // ── Runtime engine ─────────────────────────────────────────────
    let runtime = tiller_runtime::select_engine(&cli.engine)?;
    info!(engine = runtime.name(), "runtime engine selected");

    // ── Core wiring ────────────────────────────────────────────────
    let events = EngineEvents::new();
    let reporter = Reporter::new(events.clone());
    let executor = StepExecutor::new(
        runtime.clone(),
        store.clone(),
        locks.clone(),
        update_locks.clone(),
        events.clone(),
    );
    let (applier, applier_handle) = Applier::new(
        executor.clone(),
        store.clone(),
        runtime.clone(),
        locks,
        events.clone(),
        reporter.clone(),
        ApplierConfig {
            poll_interval: Duration::from_secs(cli.poll_interval),
            base_backoff: Duration::from_secs(1),
        },
    );
    let applier_task = tokio::spawn(applier.run());
    info!("apply loop started");

    // Target-state writes wake the apply loop immediately; engine events
    // (container died, image pulled by hand) wake it with a short debounce.
    {
        let handle = applier_handle.clone();
        let mut store_events = store.subscribe();
        tokio::spawn(async move {
            loop {
                match store_events.recv().await {
                    Ok(StateEvent::TargetStateChanged) => {
                        handle.trigger(false, Duration::ZERO, false);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        handle.trigger(false, Duration::ZERO, false);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
    {
        let handle = applier_handle.clone();
        let mut runtime_events = runtime.events();
        tokio::spawn(async move {
            loop {
                match runtime_events.recv().await {
                    Ok(_) => handle.trigger(false, Duration::from_secs(1), false),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    // ── API keys ───────────────────────────────────────────────────
    let keys = KeyStore::new(store.clone());
    keys.ensure_cloud_key()?;

    // ── Control API ────────────────────────────────────────────────
    let system_host: Arc<dyn HostControl> = Arc::new(host::SystemHost::new(cli.led_path.clone()));
    let ctx = ApiCtx {
        store,
        keys,
        runtime,
        executor,
        applier: applier_handle.clone(),
        host: system_host,
        reporter,
        events,
    };
    let router = tiller_api::build_router(ctx);

    // Kick off the first reconcile.
    applier_handle.trigger(false, Duration::ZERO, false);

    let addr = SocketAddr::from(([0, 0, 0, 0], cli.listen_port));
    info!(%addr, "control API listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let shutdown_locks = update_locks.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install CTRL+C handler");
            info!("shutdown signal received");
        })
        .await?;

    // Never leave lock files behind.
    shutdown_locks.cleanup_on_exit();
    applier_task.abort();

    info!("tiller supervisor stopped");
    Ok(())
}
