//! tiller-api — local HTTP control API.
//!
//! Axum router over the supervisor core: state queries, privileged service
//! actions (start/stop/restart/purge), host reboot/shutdown, key
//! management, and local-mode target-state writes. Mutations travel the
//! same executor path as apply cycles and obey the same lock discipline.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/v2/device/vpn` | VPN status fields |
//! | GET | `/v2/applications/{appId}/state` | Commit + service states |
//! | GET | `/v2/state/status` | Single-app status view |
//! | POST | `/v2/applications/{appId}/start-service` | Start a service |
//! | POST | `/v2/applications/{appId}/stop-service` | Stop a service |
//! | POST | `/v2/applications/{appId}/restart-service` | Restart a service |
//! | POST | `/v2/applications/{appId}/purge` | Purge app data |
//! | POST | `/v2/applications/{appId}/restart` | Restart all services |
//! | POST | `/v2/blink` | Identification blink |
//! | POST | `/v2/regenerate-api-key` | Rotate the calling key |
//! | POST | `/v2/reboot` | Reboot the host |
//! | POST | `/v2/shutdown` | Shut the host down |
//! | GET | `/v2/healthy` | Liveness probe |
//! | GET | `/v2/local/target-state` | Read the target state |
//! | POST | `/v2/local/target-state` | Set the target (local mode) |
//! | GET | `/v2/containerId` | Container id lookup |

pub mod auth;
pub mod handlers;
pub mod host;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use tiller_engine::{ApplierHandle, EngineEvents, Reporter, StepExecutor};
use tiller_keys::KeyStore;
use tiller_runtime::ContainerRuntime;
use tiller_state::StateStore;

pub use host::{HostControl, HostError, MockHost};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiCtx {
    pub store: StateStore,
    pub keys: KeyStore,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub executor: StepExecutor,
    pub applier: ApplierHandle,
    pub host: Arc<dyn HostControl>,
    pub reporter: Reporter,
    pub events: EngineEvents,
}

/// Build the complete `/v2` router.
pub fn build_router(ctx: ApiCtx) -> Router {
    Router::new()
        .route("/v2/device/vpn", get(handlers::device_vpn))
        .route("/v2/applications/{app_id}/state", get(handlers::app_state))
        .route("/v2/state/status", get(handlers::state_status))
        .route(
            "/v2/applications/{app_id}/start-service",
            post(handlers::start_service),
        )
        .route(
            "/v2/applications/{app_id}/stop-service",
            post(handlers::stop_service),
        )
        .route(
            "/v2/applications/{app_id}/restart-service",
            post(handlers::restart_service),
        )
        .route("/v2/applications/{app_id}/purge", post(handlers::purge_app))
        .route(
            "/v2/applications/{app_id}/restart",
            post(handlers::restart_app),
        )
        .route("/v2/blink", post(handlers::blink))
        .route(
            "/v2/regenerate-api-key",
            post(handlers::regenerate_api_key),
        )
        .route("/v2/reboot", post(handlers::reboot))
        .route("/v2/shutdown", post(handlers::shutdown))
        .route("/v2/healthy", get(handlers::healthy))
        .route(
            "/v2/local/target-state",
            get(handlers::get_local_target).post(handlers::set_local_target),
        )
        .route("/v2/containerId", get(handlers::container_id))
        .with_state(ctx)
}
