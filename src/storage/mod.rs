//! Persistent key-value contract (C3) and an in-memory default tier.
//!
//! Namespace `cf_` per spec §6: `cf_current_session`, `cf_last_app_start`,
//! `cf_background_timestamp`, the config cache map, and settings metadata
//! all live under keys in this namespace.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::time::Instant;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn put(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
        persist: bool,
    ) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError>;

    async fn remove(&self, key: &str) -> Result<(), StoreError>;
}

struct Entry {
    value: serde_json::Value,
    expires_at: Option<Instant>,
}

/// Default [`KeyValueStore`]: a single in-memory tier used for both the
/// "memory tier" and "durable tier" spoken of in §3 — a host embedding a
/// real durable backend swaps this out wholesale; it never needs to layer
/// on top of it.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn put(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
        _persist: bool,
    ) -> Result<(), StoreError> {
        let expires_at = ttl.map(|d| Instant::now() + d);
        self.entries
            .write()
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get(key) {
            if let Some(expires_at) = entry.expires_at {
                if Instant::now() >= expires_at {
                    entries.remove(key);
                    return Ok(None);
                }
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries.write().remove(key);
        Ok(())
    }
}

pub const KEY_CURRENT_SESSION: &str = "cf_current_session";
pub const KEY_LAST_APP_START: &str = "cf_last_app_start";
pub const KEY_BACKGROUND_TIMESTAMP: &str = "cf_background_timestamp";
pub const KEY_CONFIG_CACHE: &str = "cf_config_cache";
pub const KEY_SETTINGS_METADATA: &str = "cf_settings_metadata";

pub const SESSION_TTL: Duration = Duration::from_secs(30 * 24 * 3600);
pub const LAST_APP_START_TTL: Duration = Duration::from_secs(365 * 24 * 3600);
pub const BACKGROUND_TIMESTAMP_TTL: Duration = Duration::from_secs(24 * 3600);
pub const CONFIG_CACHE_TTL: Duration = Duration::from_secs(30 * 24 * 3600);
