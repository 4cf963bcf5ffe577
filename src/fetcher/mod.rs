//! Config Fetcher (C5): a two-tier conditional poll against SDK-settings
//! gates the user-config POST, normalizing the response into the cache's
//! [`ConfigMap`]. The settings endpoint is HEADed first; GET is only used as
//! a fallback when HEAD fails or returns a non-2xx status other than 404.
//! HEAD carries no body, so `cf_account_enabled`/`cf_skip_sdk` (read off the
//! settings body) only update on a cycle that actually took the GET
//! fallback; the [`Coordinator`](crate::coordinator::Coordinator) consults
//! the resulting flag to pause polling without tearing the fetcher down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, Notify};
use tokio::time::timeout;
use tracing::{instrument, warn};

use crate::cache::{ConfigCache, ConfigMap, FlagRecord};
use crate::config::CfConfigHandle;
use crate::error::CfError;
use crate::resilience::{CircuitBreaker, RetryPolicy};
use crate::storage::{KeyValueStore, CONFIG_CACHE_TTL, KEY_SETTINGS_METADATA};
use crate::transport::{HeaderMap, HttpTransport};
use crate::user::CFUser;

const OUTER_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const SINGLE_FLIGHT_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Skipped,
    Unchanged,
    NoSettings,
    Updated,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
struct SettingsMetadata {
    last_modified: Option<String>,
    etag: Option<String>,
}

pub struct ConfigFetcher {
    transport: Arc<dyn HttpTransport>,
    config: Arc<CfConfigHandle>,
    cache: Arc<ConfigCache>,
    kv: Arc<dyn KeyValueStore>,
    circuit_breaker: CircuitBreaker,
    retry_policy: RetryPolicy,
    in_flight: Mutex<()>,
    completed: Notify,
    account_enabled: AtomicBool,
    sdk_paused: Arc<AtomicBool>,
}

impl ConfigFetcher {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        config: Arc<CfConfigHandle>,
        cache: Arc<ConfigCache>,
        kv: Arc<dyn KeyValueStore>,
    ) -> Self {
        Self::with_sdk_paused_flag(transport, config, cache, kv, Arc::new(AtomicBool::new(false)))
    }

    /// Builds a fetcher sharing its `cf_skip_sdk` flag with other
    /// collaborators (the summary and event managers also suppress their
    /// outbound flush while paused).
    pub fn with_sdk_paused_flag(
        transport: Arc<dyn HttpTransport>,
        config: Arc<CfConfigHandle>,
        cache: Arc<ConfigCache>,
        kv: Arc<dyn KeyValueStore>,
        sdk_paused: Arc<AtomicBool>,
    ) -> Self {
        let c = config.current();
        Self {
            transport,
            circuit_breaker: CircuitBreaker::with_defaults(),
            retry_policy: RetryPolicy::new(
                c.max_retry_attempts,
                c.retry_initial_delay_ms,
                c.retry_max_delay_ms,
                c.retry_backoff_multiplier,
            ),
            config,
            cache,
            kv,
            in_flight: Mutex::new(()),
            completed: Notify::new(),
            account_enabled: AtomicBool::new(true),
            sdk_paused,
        }
    }

    /// True once the most recently fetched settings document set
    /// `cf_skip_sdk: true` (or `cf_account_enabled: false`). The coordinator
    /// checks this before each poll, and the summary/event managers check it
    /// before flushing.
    pub fn is_sdk_paused(&self) -> bool {
        self.sdk_paused.load(Ordering::Relaxed)
    }

    /// Mirrors the settings document's `cf_account_enabled` flag.
    pub fn is_account_enabled(&self) -> bool {
        self.account_enabled.load(Ordering::Relaxed)
    }

    fn settings_url(&self, config: &crate::config::CfConfig) -> String {
        format!(
            "{}/{}/cf-sdk-settings.json",
            config.settings_base,
            config.client_key.dimension_or_default()
        )
    }

    fn user_configs_url(&self, config: &crate::config::CfConfig) -> String {
        format!(
            "{}/users/configs?cfenc={}",
            config.api_base,
            config.client_key.as_str()
        )
    }

    /// Runs one fetch cycle. Only one cycle runs at a time; a second caller
    /// waits up to 5s for the in-flight one, then proceeds independently.
    #[instrument(skip(self, user))]
    pub async fn fetch_cycle(&self, user: &CFUser) -> Result<FetchOutcome, CfError> {
        let config = self.config.current();
        if config.offline_mode {
            return Ok(FetchOutcome::Skipped);
        }

        let _permit = match self.in_flight.try_lock() {
            Ok(permit) => permit,
            Err(_) => {
                let _ = timeout(SINGLE_FLIGHT_WAIT, self.completed.notified()).await;
                self.in_flight.lock().await
            }
        };

        let result = timeout(OUTER_FETCH_TIMEOUT, self.run_cycle(&config, user)).await;
        self.completed.notify_waiters();

        match result {
            Ok(outcome) => outcome,
            Err(_) => Err(CfError::Timeout("fetch_cycle exceeded 10s".to_string())),
        }
    }

    async fn run_cycle(
        &self,
        config: &crate::config::CfConfig,
        user: &CFUser,
    ) -> Result<FetchOutcome, CfError> {
        let stored: SettingsMetadata = self
            .kv
            .get(KEY_SETTINGS_METADATA)
            .await
            .ok()
            .flatten()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        let settings_url = self.settings_url(config);
        let headers = self.conditional_headers(&stored);
        let timeout_duration = Duration::from_millis(config.network_connection_timeout_ms);

        let head_outcome = self
            .with_resilience(|| {
                let transport = self.transport.clone();
                let url = settings_url.clone();
                let headers = headers.clone();
                async move { transport.head(&url, headers, timeout_duration).await }
            })
            .await;

        // HEAD is the steady-state check; a 304/404 from HEAD is trusted
        // as-is. Fall back to GET only when HEAD itself failed or came back
        // with a status that is neither 2xx, 304, nor 404.
        let (response, body_fetched) = match head_outcome {
            Ok(response)
                if response.is_success() || response.is_not_modified() || response.is_not_found() =>
            {
                (response, false)
            }
            _ => {
                let response = self
                    .with_resilience(|| {
                        let transport = self.transport.clone();
                        let url = settings_url.clone();
                        let headers = headers.clone();
                        async move { transport.get(&url, headers, timeout_duration).await }
                    })
                    .await?;
                (response, true)
            }
        };

        if response.is_not_modified() {
            return Ok(FetchOutcome::Unchanged);
        }
        if response.is_not_found() {
            return Ok(FetchOutcome::NoSettings);
        }
        if !response.is_success() {
            return Err(CfError::Network(format!(
                "settings fetch failed with status {}",
                response.status
            )));
        }

        let metadata = self.extract_metadata(&response);
        if body_fetched {
            if let Ok(body) = response.body_as_json() {
                self.apply_settings_flags(&body);
            }
        }

        if metadata == stored {
            return Ok(FetchOutcome::Unchanged);
        }

        let outcome = if self.sdk_paused.load(Ordering::Relaxed) {
            FetchOutcome::Skipped
        } else {
            self.fetch_user_configs(config, user, &metadata).await?
        };

        let _ = self
            .kv
            .put(
                KEY_SETTINGS_METADATA,
                serde_json::to_value(&metadata).unwrap_or(Value::Null),
                Some(CONFIG_CACHE_TTL),
                true,
            )
            .await;

        Ok(outcome)
    }

    /// Reads `cf_account_enabled`/`cf_skip_sdk` off the settings body.
    /// Absent fields default to enabled and not-skipped.
    pub(crate) fn apply_settings_flags(&self, body: &Value) {
        let account_enabled = body
            .get("cf_account_enabled")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let skip_sdk = body.get("cf_skip_sdk").and_then(Value::as_bool).unwrap_or(false);
        self.account_enabled.store(account_enabled, Ordering::Relaxed);
        self.sdk_paused.store(skip_sdk || !account_enabled, Ordering::Relaxed);
    }

    async fn fetch_user_configs(
        &self,
        config: &crate::config::CfConfig,
        user: &CFUser,
        metadata: &SettingsMetadata,
    ) -> Result<FetchOutcome, CfError> {
        let url = self.user_configs_url(config);
        let body = serde_json::json!({
            "user": user.to_wire(),
            "include_only_features_flags": true,
        });

        let mut headers = HeaderMap::new();
        if let Some(last_modified) = &metadata.last_modified {
            headers.insert("If-Modified-Since".to_string(), last_modified.clone());
        }

        let response = self
            .with_resilience(|| {
                let transport = self.transport.clone();
                let url = url.clone();
                let body = body.clone();
                let headers = headers.clone();
                let timeout_duration = Duration::from_millis(config.network_read_timeout_ms);
                async move { transport.post(&url, body, headers, timeout_duration).await }
            })
            .await
            .map_err(|e| CfError::Network(e.to_string()))?;

        if response.is_not_modified() {
            return Ok(FetchOutcome::Unchanged);
        }
        if !response.is_success() {
            return Err(CfError::Network(format!(
                "user-configs fetch failed with status {}",
                response.status
            )));
        }
        if response.body.is_empty() {
            return Err(CfError::Network("empty body on user-configs response".to_string()));
        }

        let parsed: Value = response
            .body_as_json()
            .map_err(|e| CfError::Serialization(e.to_string()))?;
        let configs = parsed
            .get("configs")
            .and_then(|v| v.as_object())
            .ok_or_else(|| CfError::Serialization("missing configs object".to_string()))?;

        let mut map = ConfigMap::new();
        for (key, value) in configs {
            let Some(obj) = value.as_object() else {
                warn!(key, "skipping non-object config entry");
                continue;
            };
            let normalized = normalize_entry(obj);
            map.insert(key.clone(), FlagRecord::from_json(&normalized));
        }

        self.cache.replace(map).await;
        Ok(FetchOutcome::Updated)
    }

    fn extract_metadata(&self, response: &crate::transport::TransportResponse) -> SettingsMetadata {
        SettingsMetadata {
            last_modified: response.header("Last-Modified").map(|s| s.to_string()),
            etag: response.header("ETag").map(|s| s.to_string()),
        }
    }

    fn conditional_headers(&self, stored: &SettingsMetadata) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(last_modified) = &stored.last_modified {
            headers.insert("If-Modified-Since".to_string(), last_modified.clone());
        }
        if let Some(etag) = &stored.etag {
            headers.insert("If-None-Match".to_string(), etag.clone());
        }
        headers
    }

    async fn with_resilience<F, Fut>(
        &self,
        operation: F,
    ) -> Result<crate::transport::TransportResponse, CfError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = crate::transport::TransportResult>,
    {
        crate::resilience::execute_with_resilience(&self.circuit_breaker, &self.retry_policy, || {
            let fut = operation();
            async move { fut.await.map_err(|e| CfError::Network(e.to_string())) }
        })
        .await
    }
}

/// Merges a nested `experience_behaviour_response` object into the parent
/// level and drops `null` values. On key collision, the nested field wins
/// (it is merged last); callers should treat this as a recorded open
/// question resolution, not an accident.
fn normalize_entry(obj: &serde_json::Map<String, Value>) -> Value {
    let mut flattened = serde_json::Map::new();
    for (key, value) in obj {
        if key == "experience_behaviour_response" {
            continue;
        }
        if !value.is_null() {
            flattened.insert(key.clone(), value.clone());
        }
    }
    if let Some(nested) = obj.get("experience_behaviour_response").and_then(|v| v.as_object()) {
        for (key, value) in nested {
            if value.is_null() {
                continue;
            }
            if flattened.contains_key(key) {
                warn!(key, "experience_behaviour_response collides with top-level field, nested wins");
            }
            flattened.insert(key.clone(), value.clone());
        }
    }
    Value::Object(flattened)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ConfigCache;
    use crate::client_key::ClientKey;
    use crate::config::{CfConfig, CfConfigHandle};
    use crate::storage::InMemoryStore;

    struct NullSink;
    #[async_trait::async_trait]
    impl crate::cache::ExposureSink for NullSink {
        async fn push_summary(&self, _key: &str, _metadata: &crate::cache::FlagMetadata) {}
    }

    fn make_fetcher() -> ConfigFetcher {
        let config = Arc::new(CfConfigHandle::new(CfConfig::new(ClientKey::parse("k"))));
        let kv: Arc<dyn KeyValueStore> = Arc::new(InMemoryStore::new());
        let cache = Arc::new(ConfigCache::new(Arc::new(NullSink), kv.clone()));
        let transport: Arc<dyn HttpTransport> = Arc::new(crate::transport::ReqwestTransport::new());
        ConfigFetcher::new(transport, config, cache, kv)
    }

    #[test]
    fn cf_skip_sdk_true_pauses_the_fetcher() {
        let fetcher = make_fetcher();
        assert!(!fetcher.is_sdk_paused());
        fetcher.apply_settings_flags(&serde_json::json!({"cf_skip_sdk": true}));
        assert!(fetcher.is_sdk_paused());
    }

    #[test]
    fn cf_account_disabled_also_pauses_the_fetcher() {
        let fetcher = make_fetcher();
        fetcher.apply_settings_flags(&serde_json::json!({"cf_account_enabled": false}));
        assert!(fetcher.is_sdk_paused());
        assert!(!fetcher.is_account_enabled());
    }

    #[test]
    fn missing_flags_default_to_enabled_and_unpaused() {
        let fetcher = make_fetcher();
        fetcher.apply_settings_flags(&serde_json::json!({}));
        assert!(!fetcher.is_sdk_paused());
        assert!(fetcher.is_account_enabled());
    }

    #[test]
    fn normalize_flattens_nested_experience_behaviour_response() {
        let obj = serde_json::json!({
            "variation": "A",
            "config_id": "c1",
            "experience_behaviour_response": {
                "variation_id": "v1",
                "experience_id": "e1",
            }
        });
        let flattened = normalize_entry(obj.as_object().unwrap());
        assert_eq!(flattened.get("variation_id"), Some(&serde_json::json!("v1")));
        assert!(flattened.get("experience_behaviour_response").is_none());
    }

    #[test]
    fn normalize_drops_null_values() {
        let obj = serde_json::json!({"variation": "A", "behaviour_id": null});
        let flattened = normalize_entry(obj.as_object().unwrap());
        assert!(flattened.get("behaviour_id").is_none());
    }

    #[test]
    fn normalize_nested_field_wins_on_collision() {
        let obj = serde_json::json!({
            "variation": "A",
            "rule_id": "top-level",
            "experience_behaviour_response": {"rule_id": "nested"}
        });
        let flattened = normalize_entry(obj.as_object().unwrap());
        assert_eq!(flattened.get("rule_id"), Some(&serde_json::json!("nested")));
    }
}
