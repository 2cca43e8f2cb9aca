//! Control API handlers.
//!
//! Each handler parses and validates inputs, checks the key's scope
//! against the affected app, and maps core errors onto the HTTP contract:
//! 400 validation, 401 out of scope, 404 unknown service, 409 unknown
//! app, 423 update locks, 500 anything else.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use tiller_engine::{load_current_apps, EngineError, ExecOptions};
use tiller_planner::{plan_app_restart, plan_service_action, PlanError, ServiceAction, Step};
use tiller_state::{App, AppId, ImageStatus, TargetState};

use crate::auth::{authenticate, extract_token};
use crate::ApiCtx;

/// How long the identification blink pattern runs.
const BLINK_DURATION: Duration = Duration::from_millis(15_000);

/// Body for the service-level action endpoints.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceActionBody {
    pub service_name: Option<String>,
    pub image_id: Option<u32>,
    pub force: Option<bool>,
}

/// Body for app-level and host-level actions.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ForceBody {
    pub force: Option<bool>,
}

fn parse_app_id(raw: &str) -> Result<AppId, Response> {
    raw.parse()
        .map_err(|_| (StatusCode::BAD_REQUEST, "invalid app id").into_response())
}

fn engine_error_response(err: EngineError) -> Response {
    match err {
        EngineError::UpdatesLocked => StatusCode::LOCKED.into_response(),
        EngineError::NotFound(what) => {
            (StatusCode::NOT_FOUND, format!("service not found: {what}")).into_response()
        }
        other => (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()).into_response(),
    }
}

fn internal_error(err: impl std::fmt::Display) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
}

/// Current apps straight from the runtime (the cache may be stale between
/// apply cycles).
async fn observe_current(ctx: &ApiCtx) -> Result<Vec<App>, Response> {
    load_current_apps(&ctx.runtime)
        .await
        .map_err(internal_error)
}

// ── Service actions ────────────────────────────────────────────────

async fn service_action(
    ctx: ApiCtx,
    raw_app_id: String,
    headers: HeaderMap,
    query: HashMap<String, String>,
    body: ServiceActionBody,
    action: ServiceAction,
) -> Response {
    let app_id = match parse_app_id(&raw_app_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let scope = match authenticate(&ctx, &headers, &query) {
        Ok(scope) => scope,
        Err(resp) => return resp,
    };
    if !scope.is_scoped(app_id) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if body.service_name.is_none() && body.image_id.is_none() {
        return (StatusCode::BAD_REQUEST, "serviceName or imageId required").into_response();
    }

    let target_app = match ctx.store.get_target_app(app_id).await {
        Ok(app) => app,
        Err(e) => return internal_error(e),
    };
    let current_apps = match observe_current(&ctx).await {
        Ok(apps) => apps,
        Err(resp) => return resp,
    };
    let current_app = current_apps.iter().find(|a| a.app_id == app_id);
    if target_app.is_none() && current_app.is_none() {
        return (StatusCode::CONFLICT, "unknown application").into_response();
    }

    let step = match plan_service_action(
        action,
        app_id,
        current_app,
        target_app.as_ref(),
        body.service_name.as_deref(),
        body.image_id,
    ) {
        Ok(step) => step,
        Err(PlanError::ServiceNotFound(what)) => {
            return (StatusCode::NOT_FOUND, format!("service not found: {what}"))
                .into_response()
        }
        Err(e) => return internal_error(e),
    };

    // Run-intent bookkeeping once the step lands: an explicit stop keeps
    // the service down until target state changes, an explicit start keeps
    // it up.
    let overlay = match &step {
        Step::Start { service, .. } => Some((service.service_name.clone(), true)),
        Step::Stop { service_name, .. } => Some((service_name.clone(), false)),
        _ => None,
    };

    match ctx
        .executor
        .execute_single(step, body.force.unwrap_or(false))
        .await
    {
        Ok(()) => {
            if let Some((service_name, running)) = overlay {
                ctx.store.set_volatile_running(app_id, &service_name, running);
            }
            (StatusCode::OK, "OK").into_response()
        }
        Err(err) => engine_error_response(err),
    }
}

/// POST /v2/applications/{appId}/start-service
pub async fn start_service(
    State(ctx): State<ApiCtx>,
    Path(app_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    body: Option<Json<ServiceActionBody>>,
) -> Response {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    service_action(ctx, app_id, headers, query, body, ServiceAction::Start).await
}

/// POST /v2/applications/{appId}/stop-service
pub async fn stop_service(
    State(ctx): State<ApiCtx>,
    Path(app_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    body: Option<Json<ServiceActionBody>>,
) -> Response {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    service_action(ctx, app_id, headers, query, body, ServiceAction::Stop).await
}

/// POST /v2/applications/{appId}/restart-service
pub async fn restart_service(
    State(ctx): State<ApiCtx>,
    Path(app_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    body: Option<Json<ServiceActionBody>>,
) -> Response {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    service_action(ctx, app_id, headers, query, body, ServiceAction::Restart).await
}

// ── App actions ────────────────────────────────────────────────────

/// POST /v2/applications/{appId}/purge
pub async fn purge_app(
    State(ctx): State<ApiCtx>,
    Path(app_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    body: Option<Json<ForceBody>>,
) -> Response {
    let app_id = match parse_app_id(&app_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let scope = match authenticate(&ctx, &headers, &query) {
        Ok(scope) => scope,
        Err(resp) => return resp,
    };
    if !scope.is_scoped(app_id) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let force = body.map(|Json(b)| b.force.unwrap_or(false)).unwrap_or(false);

    match ctx
        .executor
        .execute_single(Step::Purge { app_id }, force)
        .await
    {
        Ok(()) => {
            // The next apply recreates the app from target state.
            ctx.applier.trigger(false, Duration::ZERO, true);
            (StatusCode::OK, "OK").into_response()
        }
        Err(err) => engine_error_response(err),
    }
}

/// POST /v2/applications/{appId}/restart
pub async fn restart_app(
    State(ctx): State<ApiCtx>,
    Path(app_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    body: Option<Json<ForceBody>>,
) -> Response {
    let app_id = match parse_app_id(&app_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let scope = match authenticate(&ctx, &headers, &query) {
        Ok(scope) => scope,
        Err(resp) => return resp,
    };
    if !scope.is_scoped(app_id) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let force = body.map(|Json(b)| b.force.unwrap_or(false)).unwrap_or(false);

    let target_app = match ctx.store.get_target_app(app_id).await {
        Ok(app) => app,
        Err(e) => return internal_error(e),
    };
    let current_apps = match observe_current(&ctx).await {
        Ok(apps) => apps,
        Err(resp) => return resp,
    };
    let current_app = current_apps.iter().find(|a| a.app_id == app_id);

    let shape = match target_app.as_ref().or(current_app) {
        Some(app) => app.clone(),
        None => return (StatusCode::CONFLICT, "unknown application").into_response(),
    };

    let steps = plan_app_restart(app_id, current_app, &shape);
    match ctx
        .executor
        .execute(
            steps,
            ExecOptions {
                force,
                skip_lock: false,
            },
        )
        .await
    {
        Ok(_) => (StatusCode::OK, "OK").into_response(),
        Err(err) => engine_error_response(err),
    }
}

// ── State queries ──────────────────────────────────────────────────

/// GET /v2/device/vpn
pub async fn device_vpn(
    State(ctx): State<ApiCtx>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if let Err(resp) = authenticate(&ctx, &headers, &query) {
        return resp;
    }
    let enabled = ctx
        .reporter
        .get("vpn_enabled")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let connected = ctx
        .reporter
        .get("vpn_connected")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    Json(json!({
        "status": "success",
        "vpn": { "enabled": enabled, "connected": connected }
    }))
    .into_response()
}

/// GET /v2/applications/{appId}/state
pub async fn app_state(
    State(ctx): State<ApiCtx>,
    Path(app_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let app_id = match parse_app_id(&app_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let scope = match authenticate(&ctx, &headers, &query) {
        Ok(scope) => scope,
        Err(resp) => return resp,
    };
    if !scope.is_scoped(app_id) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let target_app = match ctx.store.get_target_app(app_id).await {
        Ok(app) => app,
        Err(e) => return internal_error(e),
    };
    let current_apps = match observe_current(&ctx).await {
        Ok(apps) => apps,
        Err(resp) => return resp,
    };
    let current_app = current_apps.iter().find(|a| a.app_id == app_id);
    if target_app.is_none() && current_app.is_none() {
        return (StatusCode::CONFLICT, "unknown application").into_response();
    }

    let commit = ctx
        .store
        .get_commit_for_app(app_id)
        .ok()
        .flatten();

    let mut services = serde_json::Map::new();
    if let Some(app) = current_app {
        for service in &app.services {
            services.insert(
                service.service_name.clone(),
                json!({
                    "status": service.status,
                    "releaseId": service.release_id,
                    "downloadProgress": Value::Null,
                }),
            );
        }
    }
    for image in ctx.store.images() {
        if image.app_id == app_id && image.status == ImageStatus::Downloading {
            services.insert(
                image.service_name.clone(),
                json!({
                    "status": "Downloading",
                    "releaseId": image.release_id,
                    "downloadProgress": image.download_progress,
                }),
            );
        }
    }

    let mut local = serde_json::Map::new();
    local.insert(app_id.to_string(), json!({ "services": services }));

    Json(json!({
        "commit": commit,
        "local": local,
        "dependent": {}
    }))
    .into_response()
}

/// GET /v2/state/status
///
/// Single-app view. When the key's scope does not narrow the choice, the
/// lowest `app_id` wins, for reproducibility.
pub async fn state_status(
    State(ctx): State<ApiCtx>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let scope = match authenticate(&ctx, &headers, &query) {
        Ok(scope) => scope,
        Err(resp) => return resp,
    };

    let current_apps = match observe_current(&ctx).await {
        Ok(apps) => apps,
        Err(resp) => return resp,
    };
    let target = match ctx.store.get_target(false).await {
        Ok(target) => target,
        Err(e) => return internal_error(e),
    };

    let mut candidates: BTreeSet<AppId> = current_apps.iter().map(|a| a.app_id).collect();
    candidates.extend(target.apps().iter().map(|a| a.app_id));
    let chosen = candidates.into_iter().find(|id| scope.is_scoped(*id));

    let app_state = if ctx.applier.apply_in_progress() {
        "applying"
    } else {
        "applied"
    };

    let Some(app_id) = chosen else {
        return Json(json!({
            "status": "success",
            "appState": app_state,
            "overallDownloadProgress": Value::Null,
            "containers": [],
            "images": [],
            "release": Value::Null,
        }))
        .into_response();
    };

    let containers: Vec<Value> = current_apps
        .iter()
        .filter(|a| a.app_id == app_id)
        .flat_map(|a| &a.services)
        .map(|s| {
            json!({
                "appId": app_id,
                "serviceName": s.service_name,
                "status": s.status,
                "containerId": s.container_id,
                "createdAt": s.created_at,
            })
        })
        .collect();

    let images: Vec<_> = ctx
        .store
        .images()
        .into_iter()
        .filter(|i| i.app_id == app_id)
        .collect();
    let downloading: Vec<u8> = images
        .iter()
        .filter(|i| i.status == ImageStatus::Downloading)
        .filter_map(|i| i.download_progress)
        .collect();
    let overall_progress = if downloading.is_empty() {
        Value::Null
    } else {
        let sum: u32 = downloading.iter().map(|p| *p as u32).sum();
        json!(sum / downloading.len() as u32)
    };
    let images: Vec<Value> = images
        .iter()
        .map(|i| {
            json!({
                "name": i.name,
                "appId": i.app_id,
                "serviceName": i.service_name,
                "imageId": i.image_id,
                "dockerImageId": i.docker_image_id,
                "status": i.status,
                "downloadProgress": i.download_progress,
            })
        })
        .collect();

    let release = ctx.store.get_commit_for_app(app_id).ok().flatten();

    Json(json!({
        "status": "success",
        "appState": app_state,
        "overallDownloadProgress": overall_progress,
        "containers": containers,
        "images": images,
        "release": release,
    }))
    .into_response()
}

/// GET /v2/containerId
pub async fn container_id(
    State(ctx): State<ApiCtx>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let scope = match authenticate(&ctx, &headers, &query) {
        Ok(scope) => scope,
        Err(resp) => return resp,
    };
    let current_apps = match observe_current(&ctx).await {
        Ok(apps) => apps,
        Err(resp) => return resp,
    };

    let mut services: BTreeMap<String, String> = BTreeMap::new();
    for app in current_apps.iter().filter(|a| scope.is_scoped(a.app_id)) {
        for service in &app.services {
            if let Some(container_id) = &service.container_id {
                services.insert(service.service_name.clone(), container_id.clone());
            }
        }
    }

    let wanted = query.get("serviceName").or_else(|| query.get("service"));
    match wanted {
        Some(name) => match services.get(name) {
            Some(container_id) => Json(json!({
                "status": "success",
                "containerId": container_id,
            }))
            .into_response(),
            None => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "failed",
                    "message": "service not found",
                })),
            )
                .into_response(),
        },
        None => Json(json!({
            "status": "success",
            "services": services,
        }))
        .into_response(),
    }
}

// ── Local mode target state ────────────────────────────────────────

/// GET /v2/local/target-state
pub async fn get_local_target(
    State(ctx): State<ApiCtx>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if let Err(resp) = authenticate(&ctx, &headers, &query) {
        return resp;
    }
    match ctx.store.get_target(false).await {
        Ok(state) => Json(json!({ "status": "success", "state": state })).into_response(),
        Err(e) => internal_error(e),
    }
}

/// POST /v2/local/target-state
pub async fn set_local_target(
    State(ctx): State<ApiCtx>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    body: Option<Json<Value>>,
) -> Response {
    if let Err(resp) = authenticate(&ctx, &headers, &query) {
        return resp;
    }
    if !ctx.store.config_bool("localMode") {
        return (
            StatusCode::BAD_REQUEST,
            "target state can only be set in local mode",
        )
            .into_response();
    }
    let Some(Json(value)) = body else {
        return (StatusCode::BAD_REQUEST, "target state body required").into_response();
    };

    let target = match TargetState::from_json(&value) {
        Ok(target) => target,
        Err(message) => return (StatusCode::BAD_REQUEST, message).into_response(),
    };
    if let Err(e) = ctx.store.set_target(&target).await {
        return internal_error(e);
    }
    ctx.applier.trigger(false, Duration::ZERO, true);
    Json(json!({ "status": "success" })).into_response()
}

// ── Host actions ───────────────────────────────────────────────────

async fn host_action(ctx: ApiCtx, force: bool, reboot: bool) -> Response {
    // Every service stops under the update-lock discipline before the host
    // primitive runs.
    match ctx
        .executor
        .stop_all(ExecOptions {
            force,
            skip_lock: false,
        })
        .await
    {
        Err(EngineError::UpdatesLocked) => return StatusCode::LOCKED.into_response(),
        Err(e) => return internal_error(e),
        Ok(_) => {}
    }

    if reboot {
        info!("rebooting host");
    } else {
        info!("shutting down host");
    }
    let result = if reboot {
        ctx.host.reboot().await
    } else {
        ctx.host.shutdown().await
    };
    match result {
        Ok(()) => {
            ctx.applier.set_shutting_down();
            let _ = ctx.events.shutdown.send(());
            (
                StatusCode::ACCEPTED,
                Json(json!({ "Data": "OK", "Error": null })),
            )
                .into_response()
        }
        Err(e) => {
            warn!(error = %e, "host primitive failed");
            internal_error(e)
        }
    }
}

/// POST /v2/reboot
pub async fn reboot(
    State(ctx): State<ApiCtx>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    body: Option<Json<ForceBody>>,
) -> Response {
    if let Err(resp) = authenticate(&ctx, &headers, &query) {
        return resp;
    }
    let force = body.map(|Json(b)| b.force.unwrap_or(false)).unwrap_or(false);
    host_action(ctx, force, true).await
}

/// POST /v2/shutdown
pub async fn shutdown(
    State(ctx): State<ApiCtx>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    body: Option<Json<ForceBody>>,
) -> Response {
    if let Err(resp) = authenticate(&ctx, &headers, &query) {
        return resp;
    }
    let force = body.map(|Json(b)| b.force.unwrap_or(false)).unwrap_or(false);
    host_action(ctx, force, false).await
}

// ── Misc ───────────────────────────────────────────────────────────

/// POST /v2/blink
pub async fn blink(
    State(ctx): State<ApiCtx>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if let Err(resp) = authenticate(&ctx, &headers, &query) {
        return resp;
    }
    ctx.host.blink_start().await;
    let host = ctx.host.clone();
    tokio::spawn(async move {
        tokio::time::sleep(BLINK_DURATION).await;
        host.blink_stop().await;
    });
    StatusCode::OK.into_response()
}

/// POST /v2/regenerate-api-key
pub async fn regenerate_api_key(
    State(ctx): State<ApiCtx>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if let Err(resp) = authenticate(&ctx, &headers, &query) {
        return resp;
    }

    // Local mode carries no token: rotate the cloud key.
    let token = match extract_token(&headers, &query) {
        Some(token) => token,
        None => match ctx.keys.cloud_key() {
            Ok(Some(token)) => token,
            Ok(None) => return internal_error("no cloud key present"),
            Err(e) => return internal_error(e),
        },
    };

    let was_cloud = ctx.keys.is_cloud_key(&token).unwrap_or(false);
    match ctx.keys.regenerate(&token) {
        Ok(new_token) => {
            if was_cloud {
                // The cloud must learn the new key through the state
                // report channel.
                ctx.reporter.report_current_state(
                    [("api_key".to_string(), json!(new_token.clone()))]
                        .into_iter()
                        .collect(),
                );
            }
            (StatusCode::OK, new_token).into_response()
        }
        Err(e) => internal_error(e),
    }
}

/// GET /v2/healthy
pub async fn healthy(State(ctx): State<ApiCtx>) -> Response {
    if ctx.applier.healthcheck() && !ctx.applier.is_shutting_down() {
        (StatusCode::OK, "OK").into_response()
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "Unhealthy").into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Arc;

    use axum::http::header::AUTHORIZATION;

    use tiller_engine::{Applier, ApplierConfig, EngineEvents, Reporter, StepExecutor};
    use tiller_keys::KeyStore;
    use tiller_locks::{KeyedRwLock, UpdateLocks};
    use tiller_runtime::mock::MockEngine;
    use tiller_runtime::ContainerRuntime;
    use tiller_state::{
        LocalTarget, Service, ServiceConfig, ServiceStatus, StateStore,
    };

    use crate::host::MockHost;

    struct Harness {
        ctx: ApiCtx,
        engine: Arc<MockEngine>,
        host: Arc<MockHost>,
        cloud_key: String,
        lockdir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let locks = Arc::new(KeyedRwLock::new());
        let lockdir = tempfile::tempdir().unwrap();
        let update_locks = Arc::new(UpdateLocks::with_base(locks.clone(), lockdir.path()));
        let store = StateStore::open_in_memory(locks.clone()).unwrap();
        let engine = Arc::new(MockEngine::new());
        let runtime: Arc<dyn ContainerRuntime> = engine.clone();
        let events = EngineEvents::new();
        let reporter = Reporter::new(events.clone());
        let executor = StepExecutor::new(
            runtime.clone(),
            store.clone(),
            locks.clone(),
            update_locks,
            events.clone(),
        );
        // The applier actor stays unspawned: handlers must work through the
        // handle alone.
        let (_applier, applier) = Applier::new(
            executor.clone(),
            store.clone(),
            runtime.clone(),
            locks,
            events.clone(),
            reporter.clone(),
            ApplierConfig::default(),
        );
        let keys = KeyStore::new(store.clone());
        let cloud_key = keys.ensure_cloud_key().unwrap();
        let host = Arc::new(MockHost::new());

        let ctx = ApiCtx {
            store,
            keys,
            runtime,
            executor,
            applier,
            host: host.clone(),
            reporter,
            events,
        };
        Harness {
            ctx,
            engine,
            host,
            cloud_key,
            lockdir,
        }
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, format!("Bearer {token}").parse().unwrap());
        headers
    }

    fn service(name: &str, image_id: u32) -> Service {
        Service {
            service_name: name.to_string(),
            service_id: 640681,
            image_id,
            release_id: Some(1),
            image: format!("registry/{name}:{image_id}"),
            container_id: None,
            status: ServiceStatus::Installing,
            created_at: None,
            config: ServiceConfig::default(),
            handover: false,
        }
    }

    fn app(app_id: AppId, services: Vec<Service>) -> App {
        App {
            app_id,
            name: format!("app-{app_id}"),
            commit: Some("abc123".to_string()),
            release_id: Some(1),
            source: None,
            services,
            networks: BTreeMap::new(),
            volumes: BTreeMap::new(),
        }
    }

    async fn set_target(h: &Harness, apps: Vec<App>) {
        let target = TargetState {
            local: LocalTarget {
                name: Some("device".into()),
                config: BTreeMap::new(),
                apps: apps
                    .into_iter()
                    .map(|a| (a.app_id.to_string(), a))
                    .collect(),
            },
        };
        h.ctx.store.set_target(&target).await.unwrap();
    }

    fn hold_workload_lock(h: &Harness, app_id: AppId, service: &str) {
        let dir = h.lockdir.path().join(app_id.to_string()).join(service);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("updates.lock"), b"").unwrap();
    }

    async fn body_string(resp: Response) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn body_json(resp: Response) -> Value {
        serde_json::from_str(&body_string(resp).await).unwrap()
    }

    fn action_body(name: &str, force: bool) -> Option<Json<ServiceActionBody>> {
        Some(Json(ServiceActionBody {
            service_name: Some(name.to_string()),
            image_id: None,
            force: Some(force),
        }))
    }

    // ── Service actions ────────────────────────────────────────────

    #[tokio::test]
    async fn start_known_service_bypasses_locks() {
        let h = harness();
        set_target(&h, vec![app(1658654, vec![service("main", 101)])]).await;
        let key = h.ctx.keys.generate_scoped_key(1658654, 640681).unwrap();
        // A workload lock must not matter for the API start action.
        hold_workload_lock(&h, 1658654, "main");

        let resp = start_service(
            State(h.ctx.clone()),
            Path("1658654".to_string()),
            bearer(&key),
            Query(HashMap::new()),
            action_body("main", false),
        )
        .await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_string(resp).await, "OK");
        assert_eq!(h.engine.call_count("start"), 1);
        // Start keeps the service biased to running.
        assert_eq!(h.ctx.store.volatile_running(1658654, "main"), Some(true));
    }

    #[tokio::test]
    async fn start_unknown_service_is_404_without_executor() {
        let h = harness();
        set_target(&h, vec![app(1658654, vec![service("main", 101)])]).await;
        let key = h.ctx.keys.generate_scoped_key(1658654, 640681).unwrap();

        let resp = start_service(
            State(h.ctx.clone()),
            Path("1658654".to_string()),
            bearer(&key),
            Query(HashMap::new()),
            action_body("unknown", false),
        )
        .await;

        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(h.engine.calls().is_empty(), "executor must not run");
    }

    #[tokio::test]
    async fn stop_service_sets_not_running_overlay() {
        let h = harness();
        let id = h.engine.seed_container(1658654, &service("main", 101), true);
        set_target(&h, vec![app(1658654, vec![service("main", 101)])]).await;
        let key = h.ctx.keys.generate_scoped_key(1658654, 640681).unwrap();

        let resp = stop_service(
            State(h.ctx.clone()),
            Path("1658654".to_string()),
            bearer(&key),
            Query(HashMap::new()),
            action_body("main", false),
        )
        .await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert!(!h.engine.is_running(&id));
        assert_eq!(h.ctx.store.volatile_running(1658654, "main"), Some(false));
    }

    #[tokio::test]
    async fn restart_under_lock_without_force_is_423() {
        let h = harness();
        let svc = service("main", 101);
        let id = h.engine.seed_container(1658654, &svc, true);
        set_target(&h, vec![app(1658654, vec![service("main", 101)])]).await;
        let key = h.ctx.keys.generate_scoped_key(1658654, 640681).unwrap();
        hold_workload_lock(&h, 1658654, "main");

        let resp = restart_service(
            State(h.ctx.clone()),
            Path("1658654".to_string()),
            bearer(&key),
            Query(HashMap::new()),
            action_body("main", false),
        )
        .await;

        assert_eq!(resp.status(), StatusCode::LOCKED);
        // The error surfaced from inside the executor: no engine mutation.
        assert!(h.engine.is_running(&id));
        assert_eq!(h.engine.call_count("stop"), 0);
    }

    #[tokio::test]
    async fn restart_under_lock_with_force_succeeds() {
        let h = harness();
        let svc = service("main", 101);
        let id = h.engine.seed_container(1658654, &svc, true);
        set_target(&h, vec![app(1658654, vec![service("main", 101)])]).await;
        let key = h.ctx.keys.generate_scoped_key(1658654, 640681).unwrap();
        hold_workload_lock(&h, 1658654, "main");

        let resp = restart_service(
            State(h.ctx.clone()),
            Path("1658654".to_string()),
            bearer(&key),
            Query(HashMap::new()),
            action_body("main", true),
        )
        .await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(h.engine.call_count("stop"), 1);
        assert_eq!(h.engine.call_count("start"), 1);
        assert!(h.engine.is_running(&id));
    }

    #[tokio::test]
    async fn scoped_key_cannot_touch_other_apps() {
        let h = harness();
        set_target(&h, vec![app(1658654, vec![service("main", 101)])]).await;
        let foreign = h.ctx.keys.generate_scoped_key(222222, 1).unwrap();

        let resp = start_service(
            State(h.ctx.clone()),
            Path("1658654".to_string()),
            bearer(&foreign),
            Query(HashMap::new()),
            action_body("main", false),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn invalid_app_id_is_400() {
        let h = harness();
        let resp = start_service(
            State(h.ctx.clone()),
            Path("123invalid".to_string()),
            bearer(&h.cloud_key),
            Query(HashMap::new()),
            action_body("main", false),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_app_is_409() {
        let h = harness();
        let resp = start_service(
            State(h.ctx.clone()),
            Path("9000".to_string()),
            bearer(&h.cloud_key),
            Query(HashMap::new()),
            action_body("main", false),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn missing_credentials_are_401() {
        let h = harness();
        set_target(&h, vec![app(1658654, vec![service("main", 101)])]).await;
        let resp = start_service(
            State(h.ctx.clone()),
            Path("1658654".to_string()),
            HeaderMap::new(),
            Query(HashMap::new()),
            action_body("main", false),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    // ── App actions ────────────────────────────────────────────────

    #[tokio::test]
    async fn restart_app_restarts_every_service() {
        let h = harness();
        h.engine.seed_container(7, &service("main", 101), true);
        h.engine.seed_container(7, &service("side", 102), true);
        set_target(
            &h,
            vec![app(7, vec![service("main", 101), service("side", 102)])],
        )
        .await;

        let resp = restart_app(
            State(h.ctx.clone()),
            Path("7".to_string()),
            bearer(&h.cloud_key),
            Query(HashMap::new()),
            None,
        )
        .await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(h.engine.call_count("stop"), 2);
        assert_eq!(h.engine.call_count("start"), 2);
    }

    #[tokio::test]
    async fn purge_removes_app_data() {
        let h = harness();
        h.engine.seed_container(7, &service("main", 101), true);
        h.engine.create_volume(7, "data").await.unwrap();
        set_target(&h, vec![app(7, vec![service("main", 101)])]).await;

        let resp = purge_app(
            State(h.ctx.clone()),
            Path("7".to_string()),
            bearer(&h.cloud_key),
            Query(HashMap::new()),
            None,
        )
        .await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(h.engine.container_count(), 0);
        assert!(!h.engine.has_volume(7, "data"));
    }

    #[tokio::test]
    async fn purge_under_lock_is_423() {
        let h = harness();
        h.engine.seed_container(7, &service("main", 101), true);
        hold_workload_lock(&h, 7, "main");

        let resp = purge_app(
            State(h.ctx.clone()),
            Path("7".to_string()),
            bearer(&h.cloud_key),
            Query(HashMap::new()),
            None,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::LOCKED);
        assert_eq!(h.engine.container_count(), 1);
    }

    // ── Reboot / shutdown ──────────────────────────────────────────

    #[tokio::test]
    async fn reboot_under_lock_without_force_is_423() {
        let h = harness();
        h.engine.seed_container(1658654, &service("main", 101), true);
        hold_workload_lock(&h, 1658654, "main");

        let resp = reboot(
            State(h.ctx.clone()),
            bearer(&h.cloud_key),
            Query(HashMap::new()),
            None,
        )
        .await;

        assert_eq!(resp.status(), StatusCode::LOCKED);
        assert_eq!(h.host.reboot_count(), 0, "host must not reboot");
    }

    #[tokio::test]
    async fn reboot_with_force_stops_all_then_reboots() {
        let h = harness();
        let id = h.engine.seed_container(1658654, &service("main", 101), true);
        hold_workload_lock(&h, 1658654, "main");
        let mut shutdown_rx = h.ctx.events.shutdown.subscribe();

        let resp = reboot(
            State(h.ctx.clone()),
            bearer(&h.cloud_key),
            Query(HashMap::new()),
            Some(Json(ForceBody { force: Some(true) })),
        )
        .await;

        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let body = body_json(resp).await;
        assert_eq!(body, json!({ "Data": "OK", "Error": null }));

        assert!(!h.engine.is_running(&id), "stopAll ran before reboot");
        assert_eq!(h.host.reboot_count(), 1);
        assert!(h.ctx.applier.is_shutting_down());
        shutdown_rx.recv().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_mirrors_reboot() {
        let h = harness();
        let resp = shutdown(
            State(h.ctx.clone()),
            bearer(&h.cloud_key),
            Query(HashMap::new()),
            Some(Json(ForceBody { force: Some(true) })),
        )
        .await;

        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(h.host.shutdown_count(), 1);
        assert_eq!(h.host.reboot_count(), 0);
    }

    // ── State queries ──────────────────────────────────────────────

    #[tokio::test]
    async fn state_status_scoped_to_one_app() {
        let h = harness();
        h.engine.seed_container(1658654, &service("main", 101), true);
        h.engine.seed_container(222222, &service("other", 201), true);
        h.ctx.store.set_commit_for_app(1658654, "abc123").unwrap();
        let key = h.ctx.keys.generate_scoped_key(1658654, 640681).unwrap();

        let resp = state_status(
            State(h.ctx.clone()),
            bearer(&key),
            Query(HashMap::new()),
        )
        .await;

        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "success");
        assert_eq!(body["appState"], "applied");
        assert_eq!(body["release"], "abc123");
        let containers = body["containers"].as_array().unwrap();
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0]["appId"], 1658654);
    }

    #[tokio::test]
    async fn state_status_unscoped_picks_lowest_app_id() {
        let h = harness();
        h.engine.seed_container(1658654, &service("main", 101), true);
        h.engine.seed_container(222222, &service("other", 201), true);

        let resp = state_status(
            State(h.ctx.clone()),
            bearer(&h.cloud_key),
            Query(HashMap::new()),
        )
        .await;
        let body = body_json(resp).await;
        assert_eq!(body["containers"][0]["appId"], 222222);
    }

    #[tokio::test]
    async fn app_state_reports_commit_and_services() {
        let h = harness();
        h.engine.seed_container(1658654, &service("main", 101), true);
        set_target(&h, vec![app(1658654, vec![service("main", 101)])]).await;
        h.ctx.store.set_commit_for_app(1658654, "abc123").unwrap();

        let resp = app_state(
            State(h.ctx.clone()),
            Path("1658654".to_string()),
            bearer(&h.cloud_key),
            Query(HashMap::new()),
        )
        .await;

        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["commit"], "abc123");
        assert_eq!(
            body["local"]["1658654"]["services"]["main"]["status"],
            "Running"
        );
        assert_eq!(body["dependent"], json!({}));
    }

    #[tokio::test]
    async fn app_state_invalid_id_and_unknown_app() {
        let h = harness();
        let resp = app_state(
            State(h.ctx.clone()),
            Path("123invalid".to_string()),
            bearer(&h.cloud_key),
            Query(HashMap::new()),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app_state(
            State(h.ctx.clone()),
            Path("9000".to_string()),
            bearer(&h.cloud_key),
            Query(HashMap::new()),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn container_id_lookup() {
        let h = harness();
        let id = h.engine.seed_container(7, &service("main", 101), true);

        let query = HashMap::from([("serviceName".to_string(), "main".to_string())]);
        let resp = container_id(
            State(h.ctx.clone()),
            bearer(&h.cloud_key),
            Query(query),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["containerId"], json!(id));

        let query = HashMap::from([("serviceName".to_string(), "missing".to_string())]);
        let resp = container_id(
            State(h.ctx.clone()),
            bearer(&h.cloud_key),
            Query(query),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        // No query: the full service map.
        let resp = container_id(
            State(h.ctx.clone()),
            bearer(&h.cloud_key),
            Query(HashMap::new()),
        )
        .await;
        let body = body_json(resp).await;
        assert_eq!(body["services"]["main"], json!(id));
    }

    #[tokio::test]
    async fn device_vpn_reports_reporter_fields() {
        let h = harness();
        h.ctx.reporter.report_current_state(
            [
                ("vpn_enabled".to_string(), json!(true)),
                ("vpn_connected".to_string(), json!(false)),
            ]
            .into_iter()
            .collect(),
        );

        let resp = device_vpn(
            State(h.ctx.clone()),
            bearer(&h.cloud_key),
            Query(HashMap::new()),
        )
        .await;
        let body = body_json(resp).await;
        assert_eq!(body["vpn"]["enabled"], json!(true));
        assert_eq!(body["vpn"]["connected"], json!(false));
    }

    // ── Local mode ─────────────────────────────────────────────────

    #[tokio::test]
    async fn local_target_rejected_outside_local_mode() {
        let h = harness();
        let resp = set_local_target(
            State(h.ctx.clone()),
            bearer(&h.cloud_key),
            Query(HashMap::new()),
            Some(Json(json!({"local": {"apps": {}}}))),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn local_target_roundtrip_in_local_mode() {
        let h = harness();
        h.ctx.store.config_set(&[("localMode", "true")]).unwrap();

        let target = json!({
            "local": {
                "name": "dev-device",
                "config": {},
                "apps": {
                    "1658654": {
                        "app_id": 1658654,
                        "name": "main-app",
                        "commit": "abc123",
                        "services": [{
                            "service_name": "main",
                            "service_id": 640681,
                            "image_id": 101,
                            "image": "registry/main:abc123"
                        }]
                    }
                }
            }
        });

        // Local mode bypasses auth entirely.
        let resp = set_local_target(
            State(h.ctx.clone()),
            HeaderMap::new(),
            Query(HashMap::new()),
            Some(Json(target)),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = get_local_target(
            State(h.ctx.clone()),
            HeaderMap::new(),
            Query(HashMap::new()),
        )
        .await;
        let body = body_json(resp).await;
        assert_eq!(body["status"], "success");
        assert_eq!(
            body["state"]["local"]["apps"]["1658654"]["name"],
            "main-app"
        );
    }

    #[tokio::test]
    async fn malformed_local_target_is_400_with_message() {
        let h = harness();
        h.ctx.store.config_set(&[("localMode", "true")]).unwrap();

        let resp = set_local_target(
            State(h.ctx.clone()),
            HeaderMap::new(),
            Query(HashMap::new()),
            Some(Json(json!({"apps": {}}))),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_string(resp).await.contains("local"));
    }

    // ── Keys, blink, health ────────────────────────────────────────

    #[tokio::test]
    async fn regenerate_api_key_revokes_old_token() {
        let h = harness();
        set_target(&h, vec![app(1658654, vec![service("main", 101)])]).await;
        let mut change_rx = h.ctx.events.change.subscribe();

        let resp = regenerate_api_key(
            State(h.ctx.clone()),
            bearer(&h.cloud_key),
            Query(HashMap::new()),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let new_key = body_string(resp).await;
        assert_ne!(new_key, h.cloud_key);

        // The very next request with the old key is rejected.
        let resp = device_vpn(
            State(h.ctx.clone()),
            bearer(&h.cloud_key),
            Query(HashMap::new()),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        // The new key is accepted.
        let resp = device_vpn(
            State(h.ctx.clone()),
            bearer(&new_key),
            Query(HashMap::new()),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        // The cloud key change was reported on the state channel.
        let change = change_rx.recv().await.unwrap();
        assert_eq!(change["api_key"], json!(new_key));
    }

    #[tokio::test(start_paused = true)]
    async fn blink_runs_pattern_for_fifteen_seconds() {
        let h = harness();
        let resp = blink(
            State(h.ctx.clone()),
            bearer(&h.cloud_key),
            Query(HashMap::new()),
        )
        .await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_string(resp).await, "");
        assert_eq!(h.host.blink_start_count(), 1);
        assert_eq!(h.host.blink_stop_count(), 0);

        tokio::time::sleep(Duration::from_millis(15_100)).await;
        assert_eq!(h.host.blink_stop_count(), 1);
    }

    #[tokio::test]
    async fn healthy_endpoint_reflects_probes() {
        let h = harness();
        let resp = healthy(State(h.ctx.clone())).await;
        assert_eq!(resp.status(), StatusCode::OK);

        h.ctx.applier.set_shutting_down();
        let resp = healthy(State(h.ctx.clone())).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_string(resp).await, "Unhealthy");
    }
}
