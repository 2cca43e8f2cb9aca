//! redb table definitions for the tiller state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). App-keyed tables use the decimal `app_id` as key.

use redb::TableDefinition;

/// Target apps keyed by decimal `app_id`.
pub const TARGET_APPS: TableDefinition<&str, &[u8]> = TableDefinition::new("target_apps");

/// Singleton device-level target (name + device config) under key `local`.
pub const TARGET_DEVICE: TableDefinition<&str, &[u8]> = TableDefinition::new("target_device");

/// Last fully-applied commit keyed by decimal `app_id`.
pub const COMMITS: TableDefinition<&str, &[u8]> = TableDefinition::new("commits");

/// Runtime-mutable configuration keyed by config name.
pub const DEVICE_CONFIG: TableDefinition<&str, &[u8]> = TableDefinition::new("device_config");

/// API key records keyed by the token itself.
pub const API_KEYS: TableDefinition<&str, &[u8]> = TableDefinition::new("api_keys");
