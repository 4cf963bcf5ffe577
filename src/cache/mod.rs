//! Config Cache & Evaluator (C6): the authoritative flag map, typed
//! accessors, change detection, and listener dispatch.

use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::RwLock;
use tracing::{instrument, warn};

use crate::storage::{KeyValueStore, CONFIG_CACHE_TTL, KEY_CONFIG_CACHE};

/// Sum type backing typed accessors (REDESIGN FLAGS: dynamic per-key value
/// types modeled as a `Value` sum type).
#[derive(Debug, Clone, PartialEq)]
pub enum FlagValue {
    Bool(bool),
    String(String),
    Number(f64),
    Json(serde_json::Value),
}

impl FlagValue {
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Bool(b) => FlagValue::Bool(*b),
            serde_json::Value::String(s) => FlagValue::String(s.clone()),
            serde_json::Value::Number(n) => {
                FlagValue::Number(n.as_f64().unwrap_or(f64::NAN))
            }
            other => FlagValue::Json(other.clone()),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FlagValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FlagValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            FlagValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_json(&self) -> serde_json::Value {
        match self {
            FlagValue::Bool(b) => serde_json::Value::Bool(*b),
            FlagValue::String(s) => serde_json::Value::String(s.clone()),
            FlagValue::Number(n) => serde_json::json!(n),
            FlagValue::Json(v) => v.clone(),
        }
    }
}

/// Experiment metadata carried alongside a flag's variation. All fields
/// besides `variation` are optional per spec §3 shape (a).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlagMetadata {
    pub config_id: Option<String>,
    pub variation_id: Option<String>,
    pub experience_id: Option<String>,
    pub version: Option<String>,
    pub behaviour_id: Option<String>,
    pub rule_id: Option<String>,
    pub user_id: Option<String>,
}

/// A single flag's normalized record: `{variation, metadata}`. Accepts both
/// observed input shapes (§3): an object carrying `variation` plus metadata,
/// or a raw scalar/object value with no wrapper (metadata left default).
#[derive(Debug, Clone, PartialEq)]
pub struct FlagRecord {
    pub variation: FlagValue,
    pub metadata: FlagMetadata,
}

impl FlagRecord {
    pub fn from_json(value: &serde_json::Value) -> Self {
        if let Some(obj) = value.as_object() {
            if let Some(variation) = obj.get("variation") {
                return FlagRecord {
                    variation: FlagValue::from_json(variation),
                    metadata: FlagMetadata {
                        config_id: str_field(obj, "config_id"),
                        variation_id: str_field(obj, "variation_id"),
                        experience_id: str_field(obj, "experience_id"),
                        version: str_field(obj, "version"),
                        behaviour_id: str_field(obj, "behaviour_id"),
                        rule_id: str_field(obj, "rule_id"),
                        user_id: str_field(obj, "user_id"),
                    },
                };
            }
        }
        FlagRecord {
            variation: FlagValue::from_json(value),
            metadata: FlagMetadata::default(),
        }
    }

    fn has_complete_summary_metadata(&self) -> bool {
        self.metadata.experience_id.is_some()
            && self.metadata.config_id.is_some()
            && self.metadata.variation_id.is_some()
            && self.metadata.version.is_some()
    }

    /// Inverse of [`FlagRecord::from_json`]'s wrapped-object shape, used to
    /// persist the map for cold-start restore.
    fn to_json(&self) -> serde_json::Value {
        let mut obj = serde_json::Map::new();
        obj.insert("variation".to_string(), self.variation.as_json());
        if let Some(v) = &self.metadata.config_id {
            obj.insert("config_id".to_string(), serde_json::Value::String(v.clone()));
        }
        if let Some(v) = &self.metadata.variation_id {
            obj.insert("variation_id".to_string(), serde_json::Value::String(v.clone()));
        }
        if let Some(v) = &self.metadata.experience_id {
            obj.insert("experience_id".to_string(), serde_json::Value::String(v.clone()));
        }
        if let Some(v) = &self.metadata.version {
            obj.insert("version".to_string(), serde_json::Value::String(v.clone()));
        }
        if let Some(v) = &self.metadata.behaviour_id {
            obj.insert("behaviour_id".to_string(), serde_json::Value::String(v.clone()));
        }
        if let Some(v) = &self.metadata.rule_id {
            obj.insert("rule_id".to_string(), serde_json::Value::String(v.clone()));
        }
        if let Some(v) = &self.metadata.user_id {
            obj.insert("user_id".to_string(), serde_json::Value::String(v.clone()));
        }
        serde_json::Value::Object(obj)
    }
}

fn config_map_to_json(map: &ConfigMap) -> serde_json::Value {
    serde_json::Value::Object(map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
}

fn config_map_from_json(value: serde_json::Value) -> ConfigMap {
    let mut map = ConfigMap::new();
    if let serde_json::Value::Object(obj) = value {
        for (key, entry) in obj {
            map.insert(key, FlagRecord::from_json(&entry));
        }
    }
    map
}

fn str_field(obj: &serde_json::Map<String, serde_json::Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(|v| match v {
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    })
}

/// Ordered-by-insertion flag map. The authoritative current state.
pub type ConfigMap = IndexMap<String, FlagRecord>;

/// Receives exposure pushes from [`ConfigCache::get`]-family accessors.
/// Implemented by [`crate::summary::SummaryManager`]; kept as a trait here
/// so the cache never depends on the summary module's internals.
#[async_trait]
pub trait ExposureSink: Send + Sync {
    async fn push_summary(&self, key: &str, metadata: &FlagMetadata);
}

type KeyListener = Arc<dyn Fn(&FlagValue, &FlagValue) + Send + Sync>;
type AllFlagsListener = Arc<dyn Fn(&ConfigMap, &ConfigMap) + Send + Sync>;

struct ListenerRegistry {
    per_key: RwLock<IndexMap<String, Vec<KeyListener>>>,
    all_flags: RwLock<Vec<AllFlagsListener>>,
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self {
            per_key: RwLock::new(IndexMap::new()),
            all_flags: RwLock::new(Vec::new()),
        }
    }
}

/// The authoritative flag map plus the machinery to evaluate and notify.
pub struct ConfigCache {
    current: RwLock<Arc<ConfigMap>>,
    listeners: ListenerRegistry,
    exposure_sink: Arc<dyn ExposureSink>,
    kv: Arc<dyn KeyValueStore>,
}

impl ConfigCache {
    pub fn new(exposure_sink: Arc<dyn ExposureSink>, kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            current: RwLock::new(Arc::new(ConfigMap::new())),
            listeners: ListenerRegistry::default(),
            exposure_sink,
            kv,
        }
    }

    /// Loads the last persisted flag map from storage, so a cold start can
    /// serve last-known-good values before the first fetch cycle completes.
    /// Bypasses listener dispatch: this seeds initial state, it isn't a
    /// change.
    pub async fn restore_from_storage(&self) {
        let Ok(Some(value)) = self.kv.get(KEY_CONFIG_CACHE).await else {
            return;
        };
        *self.current.write() = Arc::new(config_map_from_json(value));
    }

    pub fn add_key_listener(&self, key: impl Into<String>, listener: KeyListener) {
        self.listeners
            .per_key
            .write()
            .entry(key.into())
            .or_default()
            .push(listener);
    }

    pub fn add_all_flags_listener(&self, listener: AllFlagsListener) {
        self.listeners.all_flags.write().push(listener);
    }

    /// A read-only snapshot of the current map.
    pub fn dump_config_map(&self) -> Arc<ConfigMap> {
        self.current.read().clone()
    }

    async fn get(&self, key: &str) -> Option<FlagRecord> {
        let snapshot = self.current.read().clone();
        let record = snapshot.get(key).cloned();
        if let Some(record) = &record {
            if record.has_complete_summary_metadata() {
                self.exposure_sink.push_summary(key, &record.metadata).await;
            }
        }
        record
    }

    pub async fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key).await {
            Some(record) => record.variation.as_bool().unwrap_or(default),
            None => default,
        }
    }

    pub async fn get_string(&self, key: &str, default: &str) -> String {
        match self.get(key).await {
            Some(record) => record
                .variation
                .as_str()
                .map(|s| s.to_string())
                .unwrap_or_else(|| default.to_string()),
            None => default.to_string(),
        }
    }

    pub async fn get_number(&self, key: &str, default: f64) -> f64 {
        match self.get(key).await {
            Some(record) => record.variation.as_number().unwrap_or(default),
            None => default,
        }
    }

    pub async fn get_json(&self, key: &str, default: serde_json::Value) -> serde_json::Value {
        match self.get(key).await {
            Some(record) => record.variation.as_json(),
            None => default,
        }
    }

    /// Replaces the flag map wholesale, diffing against the previous map and
    /// dispatching listeners: per-key listeners in registration order, then
    /// the all-flags listeners, after per-key notifications complete.
    #[instrument(skip(self, new_map))]
    pub async fn replace(&self, new_map: ConfigMap) {
        let old = {
            let mut guard = self.current.write();
            let old = guard.clone();
            *guard = Arc::new(new_map);
            old
        };
        let new = self.current.read().clone();

        let _ = self
            .kv
            .put(KEY_CONFIG_CACHE, config_map_to_json(&new), Some(CONFIG_CACHE_TTL), true)
            .await;

        let mut changed_keys: Vec<String> = Vec::new();
        for key in old.keys().chain(new.keys()) {
            if changed_keys.contains(key) {
                continue;
            }
            let changed = match (old.get(key), new.get(key)) {
                (Some(a), Some(b)) => a.variation != b.variation || a.metadata != b.metadata,
                (None, None) => false,
                _ => true,
            };
            if changed {
                changed_keys.push(key.clone());
            }
        }

        let per_key_snapshot = self.listeners.per_key.read().clone();
        for key in &changed_keys {
            if let Some(callbacks) = per_key_snapshot.get(key) {
                let old_value = old
                    .get(key)
                    .map(|r| r.variation.clone())
                    .unwrap_or(FlagValue::Json(serde_json::Value::Null));
                let new_value = new
                    .get(key)
                    .map(|r| r.variation.clone())
                    .unwrap_or(FlagValue::Json(serde_json::Value::Null));
                for callback in callbacks {
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        callback(&old_value, &new_value);
                    }));
                    if result.is_err() {
                        warn!(key, "per-key listener panicked");
                    }
                }
            }
        }

        if !changed_keys.is_empty() {
            let all_flags_snapshot = self.listeners.all_flags.read().clone();
            for callback in all_flags_snapshot {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    callback(&old, &new);
                }));
                if result.is_err() {
                    warn!("all-flags listener panicked");
                }
            }
        }
    }
}
