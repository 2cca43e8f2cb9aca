//! tiller-keys — API key issuance and validation.
//!
//! Two key categories: the singular device-wide *cloud* key and *scoped*
//! keys bound to one `(app_id, service_id)` pair. Keys are persisted in
//! the state store so they survive restart; validation resolves a token to
//! a [`Scope`] the Control API checks against the affected app.

use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::info;

use tiller_state::{ApiKeyKind, ApiKeyRecord, AppId, StateError, StateStore};

/// Result alias for key store operations.
pub type KeyResult<T> = Result<T, KeyError>;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error("failed to gather key entropy: {0}")]
    Entropy(String),
}

/// The set of app ids a key may mutate or observe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// The cloud key: every app.
    All,
    Apps(BTreeSet<AppId>),
}

impl Scope {
    /// True iff the scope covers `app_id`.
    pub fn is_scoped(&self, app_id: AppId) -> bool {
        match self {
            Scope::All => true,
            Scope::Apps(apps) => apps.contains(&app_id),
        }
    }
}

/// Issues and validates API keys on top of the state store.
#[derive(Clone)]
pub struct KeyStore {
    store: StateStore,
}

impl KeyStore {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Return the cloud key, generating and persisting one on first boot.
    pub fn ensure_cloud_key(&self) -> KeyResult<String> {
        if let Some(token) = self.cloud_key()? {
            return Ok(token);
        }
        let token = generate_token()?;
        self.store.put_api_key(
            &token,
            &ApiKeyRecord {
                kind: ApiKeyKind::Cloud,
                created_at: epoch_secs(),
            },
        )?;
        info!("cloud API key generated");
        Ok(token)
    }

    /// The current cloud key, if one exists.
    pub fn cloud_key(&self) -> KeyResult<Option<String>> {
        Ok(self
            .store
            .list_api_keys()?
            .into_iter()
            .find(|(_, record)| record.kind == ApiKeyKind::Cloud)
            .map(|(token, _)| token))
    }

    /// Issue a key bound to `(app_id, service_id)`.
    pub fn generate_scoped_key(&self, app_id: AppId, service_id: u32) -> KeyResult<String> {
        let token = generate_token()?;
        self.store.put_api_key(
            &token,
            &ApiKeyRecord {
                kind: ApiKeyKind::Scoped { app_id, service_id },
                created_at: epoch_secs(),
            },
        )?;
        info!(app_id, service_id, "scoped API key generated");
        Ok(token)
    }

    /// Resolve a token to its scope. Unknown tokens yield `None`.
    pub fn validate(&self, token: &str) -> KeyResult<Option<Scope>> {
        Ok(self.store.get_api_key(token)?.map(|record| match record.kind {
            ApiKeyKind::Cloud => Scope::All,
            ApiKeyKind::Scoped { app_id, .. } => Scope::Apps(BTreeSet::from([app_id])),
        }))
    }

    /// True when the token is the cloud key.
    pub fn is_cloud_key(&self, token: &str) -> KeyResult<bool> {
        Ok(self
            .store
            .get_api_key(token)?
            .map(|record| record.kind == ApiKeyKind::Cloud)
            .unwrap_or(false))
    }

    /// Replace the key behind `token` with a fresh random token of the same
    /// kind. The old token is revoked before the new one is returned, so
    /// the very next request with it fails validation.
    pub fn regenerate(&self, token: &str) -> KeyResult<String> {
        let record = self
            .store
            .get_api_key(token)?
            .ok_or_else(|| StateError::NotFound("api key".to_string()))?;

        self.store.delete_api_key(token)?;
        let new_token = generate_token()?;
        self.store.put_api_key(
            &new_token,
            &ApiKeyRecord {
                kind: record.kind,
                created_at: epoch_secs(),
            },
        )?;
        info!("API key regenerated");
        Ok(new_token)
    }
}

/// 32 random bytes, hex-encoded.
fn generate_token() -> KeyResult<String> {
    let mut buf = [0u8; 32];
    getrandom::getrandom(&mut buf).map_err(|e| KeyError::Entropy(e.to_string()))?;
    Ok(hex::encode(buf))
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
