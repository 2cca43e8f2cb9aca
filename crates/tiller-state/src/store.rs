//! StateStore — redb-backed persistence for the supervisor core.
//!
//! Durable state (target apps, device target, commits, device config, API
//! keys) is JSON-serialized into redb's `&[u8]` value columns. Volatile
//! state (last runtime-observed apps, per-service run-intent overlays,
//! image download progress, the intermediate target) lives beside the
//! database and is rebuilt on restart. The store supports both on-disk and
//! in-memory backends (the latter for testing).

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, RwLock};

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

use tiller_locks::{KeyedRwLock, TARGET_KEY};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Change notifications published by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateEvent {
    /// A new target was persisted.
    TargetStateChanged,
    /// One device-config key changed.
    ConfigChanged { key: String },
}

/// Singleton row persisted in the `target_device` table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DeviceTarget {
    name: Option<String>,
    config: DeviceConfig,
}

#[derive(Default)]
struct Volatile {
    current_apps: Vec<App>,
    /// Run-intent overlays keyed by `(app_id, service_name)`.
    overlays: HashMap<(AppId, String), bool>,
    /// Image states tracked through fetch steps.
    images: HashMap<u32, Image>,
    /// Short-lived target installed by a phased apply.
    intermediate: Option<TargetState>,
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    locks: Arc<KeyedRwLock>,
    volatile: Arc<RwLock<Volatile>>,
    events: broadcast::Sender<StateEvent>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path, locks: Arc<KeyedRwLock>) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_db(db, locks)?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory(locks: Arc<KeyedRwLock>) -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_db(db, locks)?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn from_db(db: Database, locks: Arc<KeyedRwLock>) -> StateResult<Self> {
        let (events, _) = broadcast::channel(64);
        let store = Self {
            db: Arc::new(db),
            locks,
            volatile: Arc::new(RwLock::new(Volatile::default())),
            events,
        };
        store.ensure_tables()?;
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(TARGET_APPS).map_err(map_err!(Table))?;
        txn.open_table(TARGET_DEVICE).map_err(map_err!(Table))?;
        txn.open_table(COMMITS).map_err(map_err!(Table))?;
        txn.open_table(DEVICE_CONFIG).map_err(map_err!(Table))?;
        txn.open_table(API_KEYS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Subscribe to store change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }

    // ── Target state ───────────────────────────────────────────────

    /// Persist the full target in one transaction and notify subscribers.
    ///
    /// Run-intent overlays are cleared for every app whose target changed
    /// (including apps the new target no longer carries).
    pub async fn set_target(&self, target: &TargetState) -> StateResult<()> {
        let _guard = self.locks.write(TARGET_KEY).await;

        let old_apps = self.read_target_apps()?;

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(TARGET_APPS).map_err(map_err!(Table))?;
            for key in old_apps.keys() {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            for app in target.local.apps.values() {
                let value = serde_json::to_vec(app).map_err(map_err!(Serialize))?;
                table
                    .insert(app.table_key().as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        {
            let mut table = txn.open_table(TARGET_DEVICE).map_err(map_err!(Table))?;
            let device = DeviceTarget {
                name: target.local.name.clone(),
                config: target.local.config.clone(),
            };
            let value = serde_json::to_vec(&device).map_err(map_err!(Serialize))?;
            table
                .insert("local", value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;

        // Clear overlays for changed and removed apps.
        {
            let mut volatile = self.volatile.write().expect("volatile state poisoned");
            let new_apps: HashMap<AppId, &App> = target
                .local
                .apps
                .values()
                .map(|a| (a.app_id, a))
                .collect();
            volatile.overlays.retain(|(app_id, _), _| {
                match (old_apps.get(&app_id.to_string()), new_apps.get(app_id)) {
                    (Some(old), Some(new)) => old == *new,
                    _ => false,
                }
            });
        }

        info!(apps = target.local.apps.len(), "target state stored");
        let _ = self.events.send(StateEvent::TargetStateChanged);
        Ok(())
    }

    /// Return the instantiated target; with `intermediate`, the currently
    /// installed intermediate target instead (phased applies).
    pub async fn get_target(&self, intermediate: bool) -> StateResult<TargetState> {
        let _guard = self.locks.read(TARGET_KEY).await;

        if intermediate {
            let volatile = self.volatile.read().expect("volatile state poisoned");
            if let Some(target) = &volatile.intermediate {
                return Ok(target.clone());
            }
        }

        let apps = self.read_target_apps()?;
        let device = self.read_device_target()?;
        Ok(TargetState {
            local: LocalTarget {
                name: device.name,
                config: device.config,
                apps,
            },
        })
    }

    /// Stored target row for one app.
    pub async fn get_target_app(&self, app_id: AppId) -> StateResult<Option<App>> {
        let _guard = self.locks.read(TARGET_KEY).await;
        let apps = self.read_target_apps()?;
        Ok(apps.get(&app_id.to_string()).cloned())
    }

    fn read_target_apps(&self) -> StateResult<BTreeMap<String, App>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TARGET_APPS).map_err(map_err!(Table))?;
        let mut apps = BTreeMap::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            let app: App =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            apps.insert(key.value().to_string(), app);
        }
        Ok(apps)
    }

    fn read_device_target(&self) -> StateResult<DeviceTarget> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TARGET_DEVICE).map_err(map_err!(Table))?;
        match table.get("local").map_err(map_err!(Read))? {
            Some(guard) => {
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))
            }
            None => Ok(DeviceTarget::default()),
        }
    }

    /// Install (or clear) the intermediate target used by phased applies.
    pub fn set_intermediate_target(&self, target: Option<TargetState>) {
        let mut volatile = self.volatile.write().expect("volatile state poisoned");
        volatile.intermediate = target;
    }

    // ── Commits ────────────────────────────────────────────────────

    /// Commit of the last fully-applied release for an app.
    pub fn get_commit_for_app(&self, app_id: AppId) -> StateResult<Option<String>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(COMMITS).map_err(map_err!(Table))?;
        match table
            .get(app_id.to_string().as_str())
            .map_err(map_err!(Read))?
        {
            Some(guard) => {
                let commit: String =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(commit))
            }
            None => Ok(None),
        }
    }

    pub fn set_commit_for_app(&self, app_id: AppId, commit: &str) -> StateResult<()> {
        let value = serde_json::to_vec(commit).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(COMMITS).map_err(map_err!(Table))?;
            table
                .insert(app_id.to_string().as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(app_id, commit, "commit recorded");
        Ok(())
    }

    // ── Device config ──────────────────────────────────────────────

    pub fn config_get(&self, key: &str) -> StateResult<Option<String>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEVICE_CONFIG).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value: String =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub fn config_get_many(&self, keys: &[&str]) -> StateResult<BTreeMap<String, String>> {
        let mut out = BTreeMap::new();
        for key in keys {
            if let Some(value) = self.config_get(key)? {
                out.insert((*key).to_string(), value);
            }
        }
        Ok(out)
    }

    /// Write a partial config update; one notification per changed key.
    pub fn config_set(&self, pairs: &[(&str, &str)]) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(DEVICE_CONFIG).map_err(map_err!(Table))?;
            for (key, value) in pairs {
                let value = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
                table
                    .insert(*key, value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        for (key, _) in pairs {
            let _ = self.events.send(StateEvent::ConfigChanged {
                key: (*key).to_string(),
            });
        }
        Ok(())
    }

    /// Boolean config key; absent or unparsable means false.
    pub fn config_bool(&self, key: &str) -> bool {
        matches!(
            self.config_get(key).ok().flatten().as_deref(),
            Some("true") | Some("1")
        )
    }

    /// Numeric config key with a default.
    pub fn config_u64(&self, key: &str, default: u64) -> u64 {
        self.config_get(key)
            .ok()
            .flatten()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    // ── Current state cache ────────────────────────────────────────

    /// Replace the cached runtime-observed apps.
    pub fn update_current(&self, apps: Vec<App>) {
        let mut volatile = self.volatile.write().expect("volatile state poisoned");
        volatile.current_apps = apps;
    }

    /// Last runtime-observed apps, ascending `app_id`.
    pub fn get_current_apps(&self) -> Vec<App> {
        let volatile = self.volatile.read().expect("volatile state poisoned");
        let mut apps = volatile.current_apps.clone();
        apps.sort_by_key(|a| a.app_id);
        apps
    }

    // ── Volatile overlays ──────────────────────────────────────────

    /// Record Control-API run intent for one service.
    pub fn set_volatile_running(&self, app_id: AppId, service_name: &str, running: bool) {
        let mut volatile = self.volatile.write().expect("volatile state poisoned");
        volatile
            .overlays
            .insert((app_id, service_name.to_string()), running);
    }

    pub fn volatile_running(&self, app_id: AppId, service_name: &str) -> Option<bool> {
        let volatile = self.volatile.read().expect("volatile state poisoned");
        volatile
            .overlays
            .get(&(app_id, service_name.to_string()))
            .copied()
    }

    pub fn clear_volatile(&self, app_id: AppId) {
        let mut volatile = self.volatile.write().expect("volatile state poisoned");
        volatile.overlays.retain(|(id, _), _| *id != app_id);
    }

    /// Snapshot of all overlays for the planner.
    pub fn overlays(&self) -> HashMap<(AppId, String), bool> {
        let volatile = self.volatile.read().expect("volatile state poisoned");
        volatile.overlays.clone()
    }

    // ── Image tracking ─────────────────────────────────────────────

    pub fn update_image(&self, image: Image) {
        let mut volatile = self.volatile.write().expect("volatile state poisoned");
        volatile.images.insert(image.image_id, image);
    }

    pub fn remove_image_state(&self, image_id: u32) {
        let mut volatile = self.volatile.write().expect("volatile state poisoned");
        volatile.images.remove(&image_id);
    }

    /// Tracked image states, ascending `image_id`.
    pub fn images(&self) -> Vec<Image> {
        let volatile = self.volatile.read().expect("volatile state poisoned");
        let mut images: Vec<Image> = volatile.images.values().cloned().collect();
        images.sort_by_key(|i| i.image_id);
        images
    }

    // ── API keys ───────────────────────────────────────────────────

    pub fn put_api_key(&self, token: &str, record: &ApiKeyRecord) -> StateResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(API_KEYS).map_err(map_err!(Table))?;
            table
                .insert(token, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    pub fn get_api_key(&self, token: &str) -> StateResult<Option<ApiKeyRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(API_KEYS).map_err(map_err!(Table))?;
        match table.get(token).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: ApiKeyRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Delete a key. Returns true if it existed.
    pub fn delete_api_key(&self, token: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(API_KEYS).map_err(map_err!(Table))?;
            existed = table.remove(token).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    pub fn list_api_keys(&self) -> StateResult<Vec<(String, ApiKeyRecord)>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(API_KEYS).map_err(map_err!(Table))?;
        let mut keys = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (token, value) = entry.map_err(map_err!(Read))?;
            let record: ApiKeyRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            keys.push((token.value().to_string(), record));
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> StateStore {
        StateStore::open_in_memory(Arc::new(KeyedRwLock::new())).unwrap()
    }

    fn test_service(name: &str, image_id: u32) -> Service {
        Service {
            service_name: name.to_string(),
            service_id: 640681,
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

    fn test_app(app_id: AppId, commit: &str) -> App {
        App {
            app_id,
            name: format!("app-{app_id}"),
            commit: Some(commit.to_string()),
            release_id: Some(1),
            source: None,
            services: vec![test_service("main", 101)],
            networks: BTreeMap::new(),
            volumes: BTreeMap::new(),
        }
    }

    fn test_target(apps: Vec<App>) -> TargetState {
        TargetState {
            local: LocalTarget {
                name: Some("device".to_string()),
                config: DeviceConfig::new(),
                apps: apps
                    .into_iter()
                    .map(|a| (a.app_id.to_string(), a))
                    .collect(),
            },
        }
    }

    #[tokio::test]
    async fn target_roundtrip() {
        let store = test_store();
        let target = test_target(vec![test_app(1658654, "abc")]);

        store.set_target(&target).await.unwrap();
        let loaded = store.get_target(false).await.unwrap();
        assert_eq!(loaded, target);
    }

    #[tokio::test]
    async fn set_target_replaces_previous_apps() {
        let store = test_store();
        store
            .set_target(&test_target(vec![test_app(1, "a"), test_app(2, "b")]))
            .await
            .unwrap();
        store
            .set_target(&test_target(vec![test_app(2, "b2")]))
            .await
            .unwrap();

        let loaded = store.get_target(false).await.unwrap();
        assert_eq!(loaded.apps().len(), 1);
        assert_eq!(loaded.apps()[0].app_id, 2);
        assert!(store.get_target_app(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn set_target_emits_change() {
        let store = test_store();
        let mut rx = store.subscribe();
        store
            .set_target(&test_target(vec![test_app(1, "a")]))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), StateEvent::TargetStateChanged);
    }

    #[tokio::test]
    async fn target_change_clears_overlay_for_changed_app() {
        let store = test_store();
        store
            .set_target(&test_target(vec![test_app(1, "a"), test_app(2, "b")]))
            .await
            .unwrap();

        store.set_volatile_running(1, "main", false);
        store.set_volatile_running(2, "main", false);

        // App 1 changes commit; app 2 is untouched.
        let mut changed = test_app(1, "a2");
        changed.commit = Some("a2".to_string());
        store
            .set_target(&test_target(vec![changed, test_app(2, "b")]))
            .await
            .unwrap();

        assert_eq!(store.volatile_running(1, "main"), None);
        assert_eq!(store.volatile_running(2, "main"), Some(false));
    }

    #[tokio::test]
    async fn removed_app_loses_overlay() {
        let store = test_store();
        store
            .set_target(&test_target(vec![test_app(1, "a")]))
            .await
            .unwrap();
        store.set_volatile_running(1, "main", false);

        store.set_target(&test_target(vec![])).await.unwrap();
        assert_eq!(store.volatile_running(1, "main"), None);
    }

    #[tokio::test]
    async fn intermediate_target_shadowing() {
        let store = test_store();
        let regular = test_target(vec![test_app(1, "a")]);
        let phased = test_target(vec![test_app(1, "phase-1")]);
        store.set_target(&regular).await.unwrap();

        store.set_intermediate_target(Some(phased.clone()));
        assert_eq!(store.get_target(true).await.unwrap(), phased);
        // A regular read is unaffected.
        assert_eq!(store.get_target(false).await.unwrap(), regular);

        store.set_intermediate_target(None);
        assert_eq!(store.get_target(true).await.unwrap(), regular);
    }

    #[tokio::test]
    async fn commits_roundtrip() {
        let store = test_store();
        assert!(store.get_commit_for_app(1).unwrap().is_none());

        store.set_commit_for_app(1, "abc123").unwrap();
        assert_eq!(store.get_commit_for_app(1).unwrap().unwrap(), "abc123");

        store.set_commit_for_app(1, "def456").unwrap();
        assert_eq!(store.get_commit_for_app(1).unwrap().unwrap(), "def456");
    }

    #[tokio::test]
    async fn config_set_get_and_notify() {
        let store = test_store();
        let mut rx = store.subscribe();

        store
            .config_set(&[("localMode", "true"), ("listenPort", "48484")])
            .unwrap();

        assert!(store.config_bool("localMode"));
        assert_eq!(store.config_u64("listenPort", 0), 48484);
        assert_eq!(
            store.config_get_many(&["localMode", "missing"]).unwrap().len(),
            1
        );

        assert_eq!(
            rx.recv().await.unwrap(),
            StateEvent::ConfigChanged {
                key: "localMode".to_string()
            }
        );
    }

    #[tokio::test]
    async fn config_bool_defaults_false() {
        let store = test_store();
        assert!(!store.config_bool("lockOverride"));
        store.config_set(&[("lockOverride", "1")]).unwrap();
        assert!(store.config_bool("lockOverride"));
    }

    #[tokio::test]
    async fn current_apps_cache() {
        let store = test_store();
        assert!(store.get_current_apps().is_empty());

        store.update_current(vec![test_app(2, "b"), test_app(1, "a")]);
        let apps = store.get_current_apps();
        assert_eq!(apps.len(), 2);
        // Sorted ascending by app id.
        assert_eq!(apps[0].app_id, 1);
    }

    #[tokio::test]
    async fn image_tracking() {
        let store = test_store();
        store.update_image(Image {
            image_id: 101,
            name: "registry/main".to_string(),
            app_id: 1,
            service_name: "main".to_string(),
            release_id: Some(1),
            docker_image_id: None,
            status: ImageStatus::Downloading,
            download_progress: Some(40),
        });

        assert_eq!(store.images().len(), 1);
        assert_eq!(store.images()[0].download_progress, Some(40));

        store.remove_image_state(101);
        assert!(store.images().is_empty());
    }

    #[tokio::test]
    async fn api_key_crud() {
        let store = test_store();
        let record = ApiKeyRecord {
            kind: ApiKeyKind::Cloud,
            created_at: 1000,
        };

        store.put_api_key("tok-1", &record).unwrap();
        assert_eq!(store.get_api_key("tok-1").unwrap(), Some(record));
        assert_eq!(store.list_api_keys().unwrap().len(), 1);

        assert!(store.delete_api_key("tok-1").unwrap());
        assert!(!store.delete_api_key("tok-1").unwrap());
        assert!(store.get_api_key("tok-1").unwrap().is_none());
    }

    #[tokio::test]
    async fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("tiller.redb");
        let locks = Arc::new(KeyedRwLock::new());

        {
            let store = StateStore::open(&db_path, locks.clone()).unwrap();
            store
                .set_target(&test_target(vec![test_app(1658654, "abc")]))
                .await
                .unwrap();
            store.set_commit_for_app(1658654, "abc").unwrap();
        }

        let store = StateStore::open(&db_path, locks).unwrap();
        let target = store.get_target(false).await.unwrap();
        assert_eq!(target.apps()[0].app_id, 1658654);
        assert_eq!(
            store.get_commit_for_app(1658654).unwrap().unwrap(),
            "abc"
        );
    }
}
