//! tiller-planner — pure current→target step planning.
//!
//! [`plan`] produces the ordered composition steps for one apply cycle.
//! It performs no I/O: current apps, target apps, available images, and
//! run-intent overlays are inputs; the output is a step list the executor
//! can apply verbatim. An empty list means the device has converged.

pub mod steps;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use thiserror::Error;
use tracing::debug;

use tiller_runtime::ImageInfo;
use tiller_state::{App, AppId, DeviceConfig, Service};

pub use steps::{Step, StepAction};

/// Result alias for planner operations.
pub type PlanResult<T> = Result<T, PlanError>;

/// Planner failures.
#[derive(Debug, Error)]
pub enum PlanError {
    /// A Control-API mutation referenced a service the app does not have.
    #[error("service not found: {0}")]
    ServiceNotFound(String),

    /// An invariant does not hold; fatal for the cycle, retried by the
    /// apply loop.
    #[error("internal inconsistency: {0}")]
    InternalInconsistency(String),
}

/// Inputs for one planning pass.
pub struct PlanInput<'a> {
    pub current: &'a [App],
    pub target: &'a [App],
    /// Images known to the engine.
    pub images: &'a [ImageInfo],
    /// Control-API run-intent overlays keyed by `(app_id, service_name)`.
    pub overlays: &'a HashMap<(AppId, String), bool>,
    pub current_device_config: &'a DeviceConfig,
    pub target_device_config: &'a DeviceConfig,
}

/// Plan the steps for one apply cycle.
///
/// Device-config steps come first: when any are needed they are emitted
/// alone and app steps wait for the next cycle. Apps are processed in
/// ascending `app_id`; within an app, service steps follow target
/// declaration order, prerequisites (volumes, networks, fetches) precede
/// dependents, and stop precedes remove precedes the replacement start.
pub fn plan(input: &PlanInput<'_>) -> PlanResult<Vec<Step>> {
    let device_steps = device_config_steps(input.current_device_config, input.target_device_config);
    if !device_steps.is_empty() {
        debug!(steps = device_steps.len(), "device config changes pending");
        return Ok(device_steps);
    }

    let current: BTreeMap<AppId, &App> = input.current.iter().map(|a| (a.app_id, a)).collect();
    let target: BTreeMap<AppId, &App> = input.target.iter().map(|a| (a.app_id, a)).collect();

    let mut app_ids: BTreeSet<AppId> = current.keys().copied().collect();
    app_ids.extend(target.keys().copied());

    let mut steps = Vec::new();
    for app_id in app_ids {
        plan_app(
            app_id,
            current.get(&app_id).copied(),
            target.get(&app_id).copied(),
            input,
            &mut steps,
        )?;
    }
    Ok(steps)
}

/// Diff host config: one step per key whose target value differs.
fn device_config_steps(current: &DeviceConfig, target: &DeviceConfig) -> Vec<Step> {
    target
        .iter()
        .filter(|(key, value)| current.get(*key) != Some(value))
        .map(|(key, value)| Step::SetDeviceConfig {
            key: key.clone(),
            value: value.clone(),
        })
        .collect()
}

fn plan_app(
    app_id: AppId,
    current: Option<&App>,
    target: Option<&App>,
    input: &PlanInput<'_>,
    steps: &mut Vec<Step>,
) -> PlanResult<()> {
    let empty = Vec::new();
    let current_services = current.map(|a| &a.services).unwrap_or(&empty);
    let target_services = target.map(|a| &a.services).unwrap_or(&empty);

    // Duplicate containers for one service: keep the newest, repair the rest.
    let (current_by_name, duplicate_steps) = dedupe_current(app_id, current_services);
    steps.extend(duplicate_steps);

    // Volumes and networks before the services that mount them.
    for name in target.map(volume_names).unwrap_or_default() {
        if current.map_or(true, |c| !c.volumes.contains_key(&name)) {
            steps.push(Step::CreateVolume {
                app_id,
                name: name.clone(),
            });
        }
    }
    for name in target.map(network_names).unwrap_or_default() {
        if current.map_or(true, |c| !c.networks.contains_key(&name)) {
            steps.push(Step::CreateNetwork {
                app_id,
                name: name.clone(),
            });
        }
    }

    // Services gone from the target: stop then remove.
    let target_names: BTreeSet<&str> = target_services
        .iter()
        .map(|s| s.service_name.as_str())
        .collect();
    for service in current_by_name.values() {
        if target_names.contains(service.service_name.as_str()) {
            continue;
        }
        if let Some(container_id) = &service.container_id {
            if service.status.is_running() {
                steps.push(Step::Stop {
                    app_id,
                    service_name: service.service_name.clone(),
                    container_id: container_id.clone(),
                });
            }
            steps.push(Step::Remove {
                app_id,
                service_name: Some(service.service_name.clone()),
                container_id: container_id.clone(),
            });
        }
    }

    // Target services, in declaration order.
    for tgt in target_services {
        let cur = current_by_name.get(tgt.service_name.as_str()).copied();
        plan_service(app_id, cur, tgt, input, steps);
    }

    // Orphan networks and volumes after their services stop. A volume is
    // removed only when no in-scope target app references it.
    if let Some(current) = current {
        for name in current.networks.keys() {
            if target.map_or(true, |t| !t.networks.contains_key(name)) {
                steps.push(Step::RemoveNetwork {
                    app_id,
                    name: name.clone(),
                });
            }
        }
        for name in current.volumes.keys() {
            let referenced = input
                .target
                .iter()
                .any(|t| t.app_id == app_id && t.volumes.contains_key(name));
            if !referenced {
                steps.push(Step::RemoveVolume {
                    app_id,
                    name: name.clone(),
                });
            }
        }
    }

    Ok(())
}

fn volume_names(app: &App) -> Vec<String> {
    app.volumes.keys().cloned().collect()
}

fn network_names(app: &App) -> Vec<String> {
    app.networks.keys().cloned().collect()
}

/// Keep the newest container per service name; emit kill+remove for the
/// rest. Returns the surviving view keyed by service name.
fn dedupe_current<'a>(
    app_id: AppId,
    services: &'a [Service],
) -> (BTreeMap<&'a str, &'a Service>, Vec<Step>) {
    let mut survivors: BTreeMap<&str, &Service> = BTreeMap::new();
    let mut steps = Vec::new();

    for service in services {
        match survivors.get(service.service_name.as_str()) {
            None => {
                survivors.insert(&service.service_name, service);
            }
            Some(existing) => {
                let (keep, drop) =
                    if service.created_at.unwrap_or(0) > existing.created_at.unwrap_or(0) {
                        (service, *existing)
                    } else {
                        (*existing, service)
                    };
                survivors.insert(&keep.service_name, keep);
                if let Some(container_id) = &drop.container_id {
                    steps.push(Step::Kill {
                        app_id,
                        service_name: drop.service_name.clone(),
                        container_id: container_id.clone(),
                    });
                    steps.push(Step::Remove {
                        app_id,
                        service_name: Some(drop.service_name.clone()),
                        container_id: container_id.clone(),
                    });
                }
            }
        }
    }
    (survivors, steps)
}

fn image_available(images: &[ImageInfo], service: &Service) -> bool {
    images
        .iter()
        .any(|i| i.image_id == Some(service.image_id) || i.reference == service.image)
}

/// Effective run intent: the volatile overlay wins over the stored target.
fn effective_running(input: &PlanInput<'_>, app_id: AppId, service: &Service) -> bool {
    input
        .overlays
        .get(&(app_id, service.service_name.clone()))
        .copied()
        .unwrap_or(service.config.running)
}

fn plan_service(
    app_id: AppId,
    current: Option<&Service>,
    target: &Service,
    input: &PlanInput<'_>,
    steps: &mut Vec<Step>,
) {
    let wants_running = effective_running(input, app_id, target);

    let Some(current) = current else {
        // Target-only: fetch the image first, start once it is available.
        if !image_available(input.images, target) {
            steps.push(Step::Fetch {
                app_id,
                service_name: target.service_name.clone(),
                image_id: target.image_id,
                image: target.image.clone(),
            });
        } else if wants_running {
            steps.push(Step::Start {
                app_id,
                service: target.clone(),
            });
        }
        return;
    };

    if current.image_id != target.image_id {
        // Release update for this service.
        if !image_available(input.images, target) {
            steps.push(Step::Fetch {
                app_id,
                service_name: target.service_name.clone(),
                image_id: target.image_id,
                image: target.image.clone(),
            });
            return;
        }
        match (&current.container_id, target.handover) {
            (Some(old), true) => steps.push(Step::Handover {
                app_id,
                old_container_id: old.clone(),
                service: target.clone(),
            }),
            (Some(old), false) => {
                steps.push(Step::Kill {
                    app_id,
                    service_name: current.service_name.clone(),
                    container_id: old.clone(),
                });
                steps.push(Step::Remove {
                    app_id,
                    service_name: Some(current.service_name.clone()),
                    container_id: old.clone(),
                });
                steps.push(Step::Start {
                    app_id,
                    service: target.clone(),
                });
            }
            (None, _) => steps.push(Step::Start {
                app_id,
                service: target.clone(),
            }),
        }
        return;
    }

    // Same release: compare configs.
    if current.config.differs_materially(&target.config) {
        if let Some(old) = &current.container_id {
            steps.push(Step::Kill {
                app_id,
                service_name: current.service_name.clone(),
                container_id: old.clone(),
            });
            steps.push(Step::Remove {
                app_id,
                service_name: Some(current.service_name.clone()),
                container_id: old.clone(),
            });
        }
        steps.push(Step::Start {
            app_id,
            service: target.clone(),
        });
        return;
    }

    if current.config.metadata_only_diff(&target.config) {
        if let Some(container_id) = &current.container_id {
            steps.push(Step::UpdateMetadata {
                app_id,
                service_name: target.service_name.clone(),
                container_id: container_id.clone(),
                labels: target.config.labels.clone(),
            });
        }
        return;
    }

    // Equal: reconcile run state with the effective intent.
    let is_running = current.status.is_running();
    if is_running && !wants_running {
        if let Some(container_id) = &current.container_id {
            steps.push(Step::Stop {
                app_id,
                service_name: current.service_name.clone(),
                container_id: container_id.clone(),
            });
        }
    } else if !is_running && wants_running {
        let mut service = target.clone();
        service.container_id = current.container_id.clone();
        steps.push(Step::Start { app_id, service });
    }
}

// ── Control-API single-step planning ─────────────────────────────

/// Service-level actions the Control API plans through the same model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    Start,
    Stop,
    Restart,
}

/// Resolve a service by `image_id` (preferred when both are supplied) or
/// by name, against the current instantiation falling back to the target.
fn resolve_service<'a>(
    current: Option<&'a App>,
    target: Option<&'a App>,
    service_name: Option<&str>,
    image_id: Option<u32>,
) -> Option<(&'a Service, Option<&'a Service>)> {
    let find = |app: Option<&'a App>| -> Option<&'a Service> {
        let app = app?;
        if let Some(image_id) = image_id {
            app.service_by_image(image_id)
        } else {
            app.service(service_name?)
        }
    };
    let cur = find(current);
    let tgt = find(target);
    match (cur, tgt) {
        (Some(c), t) => Some((c, t)),
        (None, Some(t)) => Some((t, Some(t))),
        (None, None) => None,
    }
}

/// Build the single step for a Control-API service mutation.
///
/// An unknown service is a planner error the API surfaces as 404.
pub fn plan_service_action(
    action: ServiceAction,
    app_id: AppId,
    current: Option<&App>,
    target: Option<&App>,
    service_name: Option<&str>,
    image_id: Option<u32>,
) -> PlanResult<Step> {
    let descriptor = service_name
        .map(str::to_string)
        .or_else(|| image_id.map(|i| format!("imageId {i}")))
        .unwrap_or_else(|| "<unspecified>".to_string());
    let (service, _) = resolve_service(current, target, service_name, image_id)
        .ok_or(PlanError::ServiceNotFound(descriptor))?;

    Ok(match action {
        ServiceAction::Start => Step::Start {
            app_id,
            service: service.clone(),
        },
        ServiceAction::Stop => match &service.container_id {
            Some(container_id) => Step::Stop {
                app_id,
                service_name: service.service_name.clone(),
                container_id: container_id.clone(),
            },
            None => Step::Noop,
        },
        ServiceAction::Restart => match &service.container_id {
            Some(container_id) => Step::Restart {
                app_id,
                container_id: container_id.clone(),
                service: service.clone(),
            },
            None => Step::Start {
                app_id,
                service: service.clone(),
            },
        },
    })
}

/// Steps restarting every service of an app (Control-API app restart).
pub fn plan_app_restart(app_id: AppId, current: Option<&App>, target: &App) -> Vec<Step> {
    target
        .services
        .iter()
        .map(|service| {
            let container = current
                .and_then(|c| c.service(&service.service_name))
                .and_then(|s| s.container_id.clone());
            match container {
                Some(container_id) => Step::Restart {
                    app_id,
                    container_id,
                    service: service.clone(),
                },
                None => Step::Start {
                    app_id,
                    service: service.clone(),
                },
            }
        })
        .collect()
}
