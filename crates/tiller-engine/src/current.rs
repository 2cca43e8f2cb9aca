//! Current-state assembly.
//!
//! Joins engine snapshots (containers, networks, volumes) into the same
//! `App` shape the target uses, so the planner diffs like against like.
//! Containers the supervisor does not manage are grouped under app id 0
//! and end up scheduled for removal as orphans.

use std::collections::BTreeMap;
use std::sync::Arc;

use tiller_runtime::{ContainerRuntime, RuntimeResult};
use tiller_state::{App, AppId, NetworkConfig, Service, VolumeConfig};

/// App id under which unmanaged containers are grouped.
pub const ORPHAN_APP_ID: AppId = 0;

/// Observe the runtime and assemble the current apps, ascending `app_id`.
pub async fn load_current_apps(runtime: &Arc<dyn ContainerRuntime>) -> RuntimeResult<Vec<App>> {
    let containers = runtime.list_containers().await?;
    let networks = runtime.list_networks().await?;
    let volumes = runtime.list_volumes().await?;

    let mut apps: BTreeMap<AppId, App> = BTreeMap::new();
    let entry = |app_id: AppId, apps: &mut BTreeMap<AppId, App>| {
        apps.entry(app_id).or_insert_with(|| App {
            app_id,
            name: format!("app-{app_id}"),
            commit: None,
            release_id: None,
            source: None,
            services: Vec::new(),
            networks: BTreeMap::new(),
            volumes: BTreeMap::new(),
        });
    };

    for info in containers {
        let app_id = info.app_id.unwrap_or(ORPHAN_APP_ID);
        entry(app_id, &mut apps);

        // The list view lacks the container config; inspect fills it in. A
        // container that vanished between list and inspect is skipped.
        let config = match runtime.inspect(&info.id).await {
            Ok(detail) => detail.config,
            Err(_) => continue,
        };

        let service = Service {
            service_name: info
                .service_name
                .clone()
                .unwrap_or_else(|| format!("orphan-{}", info.id)),
            service_id: info.service_id.unwrap_or(0),
            image_id: info.image_id.unwrap_or(0),
            release_id: info.release_id,
            image: info.image.clone(),
            container_id: Some(info.id.clone()),
            status: info.status,
            created_at: Some(info.created_at),
            config,
            handover: false,
        };
        apps.get_mut(&app_id)
            .expect("entry inserted above")
            .services
            .push(service);
    }

    for (app_id, name) in networks {
        entry(app_id, &mut apps);
        apps.get_mut(&app_id)
            .expect("entry inserted above")
            .networks
            .insert(name, NetworkConfig::default());
    }
    for (app_id, name) in volumes {
        entry(app_id, &mut apps);
        apps.get_mut(&app_id)
            .expect("entry inserted above")
            .volumes
            .insert(name, VolumeConfig::default());
    }

    Ok(apps.into_values().collect())
}
