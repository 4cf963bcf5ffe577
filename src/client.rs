//! The engine struct wiring C1–C9 together. This is the crate's entire
//! public surface — there is no global singleton layered on top; a host
//! embeds `CfClient` as an ordinary owned or `Arc`-shared value.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::instrument;

use crate::cache::{ConfigCache, ConfigMap, FlagValue};
use crate::config::{CfConfig, CfConfigHandle};
use crate::coordinator::{AppStateMonitor, BatteryMonitor, Coordinator, ConnectionStatus, NetworkMonitor};
use crate::error::CfError;
use crate::event::EventTracker;
use crate::fetcher::{ConfigFetcher, FetchOutcome};
use crate::session::{SessionEvent, SessionManager};
use crate::storage::{InMemoryStore, KeyValueStore};
use crate::summary::SummaryManager;
use crate::transport::{HttpTransport, ReqwestTransport};
use crate::user::CFUser;

/// Builds a [`CfClient`], letting a host override the HTTP transport and
/// persistent store before construction (their trait-only contracts are
/// out of scope of the core per the specification's external
/// collaborators list).
pub struct CfClientBuilder {
    config: CfConfig,
    user: CFUser,
    transport: Option<Arc<dyn HttpTransport>>,
    kv: Option<Arc<dyn KeyValueStore>>,
    app_monitor: Option<Arc<dyn AppStateMonitor>>,
    battery_monitor: Option<Arc<dyn BatteryMonitor>>,
    network_monitor: Option<Arc<dyn NetworkMonitor>>,
}

impl CfClientBuilder {
    pub fn new(config: CfConfig, user: CFUser) -> Self {
        Self {
            config,
            user,
            transport: None,
            kv: None,
            app_monitor: None,
            battery_monitor: None,
            network_monitor: None,
        }
    }

    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn key_value_store(mut self, kv: Arc<dyn KeyValueStore>) -> Self {
        self.kv = Some(kv);
        self
    }

    pub fn app_state_monitor(mut self, monitor: Arc<dyn AppStateMonitor>) -> Self {
        self.app_monitor = Some(monitor);
        self
    }

    pub fn battery_monitor(mut self, monitor: Arc<dyn BatteryMonitor>) -> Self {
        self.battery_monitor = Some(monitor);
        self
    }

    pub fn network_monitor(mut self, monitor: Arc<dyn NetworkMonitor>) -> Self {
        self.network_monitor = Some(monitor);
        self
    }

    pub async fn build(self) -> Arc<CfClient> {
        let transport = self.transport.unwrap_or_else(|| Arc::new(ReqwestTransport::new()));
        let kv = self.kv.unwrap_or_else(|| Arc::new(InMemoryStore::new()));

        let config = Arc::new(CfConfigHandle::new(self.config));
        let user = Arc::new(RwLock::new(self.user));
        let session = Arc::new(SessionManager::new(kv.clone(), config.clone()));
        let sdk_paused = Arc::new(AtomicBool::new(false));

        let summary = SummaryManager::new_arc_with_sdk_paused_flag(
            config.clone(),
            session.clone(),
            user.clone(),
            transport.clone(),
            sdk_paused.clone(),
        );

        let cache = Arc::new(ConfigCache::new(summary.clone(), kv.clone()));
        cache.restore_from_storage().await;

        let fetcher = Arc::new(ConfigFetcher::with_sdk_paused_flag(
            transport.clone(),
            config.clone(),
            cache.clone(),
            kv.clone(),
            sdk_paused.clone(),
        ));

        let events = Arc::new(EventTracker::with_sdk_paused_flag(
            config.clone(),
            session.clone(),
            user.clone(),
            transport.clone(),
            summary.clone(),
            sdk_paused,
        ));

        let mut coordinator = Coordinator::new(config.clone(), fetcher.clone(), session.clone(), user.clone());
        if let Some(monitor) = self.app_monitor {
            coordinator = coordinator.with_app_state_monitor(monitor);
        }
        if let Some(monitor) = self.battery_monitor {
            coordinator = coordinator.with_battery_monitor(monitor);
        }
        if let Some(monitor) = self.network_monitor {
            coordinator = coordinator.with_network_monitor(monitor);
        }
        let coordinator = Arc::new(coordinator);

        session.initialize().await;

        let client = Arc::new(CfClient {
            config,
            user,
            session,
            cache,
            fetcher,
            summary,
            events,
            coordinator,
        });

        client.summary.clone().start_flush_timer().await;
        client.events.clone().start_flush_timer().await;
        client.coordinator.clone().start().await;

        client
    }
}

pub struct CfClient {
    config: Arc<CfConfigHandle>,
    user: Arc<RwLock<CFUser>>,
    session: Arc<SessionManager>,
    cache: Arc<ConfigCache>,
    fetcher: Arc<ConfigFetcher>,
    summary: Arc<SummaryManager>,
    events: Arc<EventTracker>,
    coordinator: Arc<Coordinator>,
}

impl CfClient {
    pub fn builder(config: CfConfig, user: CFUser) -> CfClientBuilder {
        CfClientBuilder::new(config, user)
    }

    pub async fn get_bool(&self, key: &str, default: bool) -> bool {
        self.cache.get_bool(key, default).await
    }

    pub async fn get_string(&self, key: &str, default: &str) -> String {
        self.cache.get_string(key, default).await
    }

    pub async fn get_number(&self, key: &str, default: f64) -> f64 {
        self.cache.get_number(key, default).await
    }

    pub async fn get_json(&self, key: &str, default: serde_json::Value) -> serde_json::Value {
        self.cache.get_json(key, default).await
    }

    pub fn dump_config_map(&self) -> Arc<ConfigMap> {
        self.cache.dump_config_map()
    }

    pub fn add_key_listener(
        &self,
        key: impl Into<String>,
        listener: Arc<dyn Fn(&FlagValue, &FlagValue) + Send + Sync>,
    ) {
        self.cache.add_key_listener(key, listener);
    }

    pub fn add_all_flags_listener(
        &self,
        listener: Arc<dyn Fn(&ConfigMap, &ConfigMap) + Send + Sync>,
    ) {
        self.cache.add_all_flags_listener(listener);
    }

    pub fn add_connection_status_listener(&self, listener: Arc<dyn Fn(ConnectionStatus) + Send + Sync>) {
        self.coordinator.add_connection_listener(listener);
    }

    pub async fn add_session_rotation_listener(&self, listener: Arc<dyn Fn(&SessionEvent) + Send + Sync>) {
        self.session.add_listener(listener).await;
    }

    #[instrument(skip(self, properties))]
    pub async fn track(
        &self,
        name: &str,
        properties: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), CfError> {
        self.events.track(name, properties).await
    }

    pub fn set_offline(&self, offline: bool) {
        self.coordinator.set_offline(offline);
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.coordinator.connection_status()
    }

    /// True while the most recently fetched settings document set
    /// `cf_skip_sdk` (or disabled the account). Polling and summary/event
    /// flush are suppressed; `track`/flag reads keep working against the
    /// last known config map.
    pub fn is_sdk_paused(&self) -> bool {
        self.fetcher.is_sdk_paused()
    }

    /// Forces a fetch cycle outside the normal polling cadence.
    pub async fn force_refresh(&self) -> Result<FetchOutcome, CfError> {
        let user = self.user.read().await.clone();
        self.fetcher.fetch_cycle(&user).await
    }

    pub async fn flush_events(&self) -> Result<usize, CfError> {
        self.events.flush_events().await
    }

    pub async fn flush_summaries(&self) -> Result<usize, CfError> {
        self.summary.flush_summaries().await
    }

    pub async fn add_user_property(&self, key: impl Into<String>, value: serde_json::Value) {
        let mut guard = self.user.write().await;
        *guard = guard.with_property(key, value);
    }

    pub async fn update_user(&self, user: CFUser) {
        *self.user.write().await = user;
        self.session.on_auth_change(None).await;
    }

    /// Cancels timers, drains pending flushes best-effort, then rejects
    /// subsequent calls implicitly by virtue of the host dropping this
    /// client (there is no reject-after-shutdown gate in-process; the host
    /// is expected to stop calling a shut-down client).
    pub async fn shutdown(&self) {
        self.coordinator.shutdown().await;
        self.summary.stop_flush_timer().await;
        self.events.stop_flush_timer().await;

        let _ = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            let _ = self.summary.flush_summaries().await;
            let _ = self.events.flush_events().await;
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_key::ClientKey;
    use crate::transport::{TransportResponse, TransportResult};

    struct AlwaysNotFound;

    #[async_trait::async_trait]
    impl HttpTransport for AlwaysNotFound {
        async fn post(&self, _url: &str, _body: serde_json::Value, _headers: crate::transport::HeaderMap, _timeout: std::time::Duration) -> TransportResult {
            Ok(TransportResponse { status: 404, body: Vec::new(), headers: Default::default() })
        }
        async fn get(&self, _url: &str, _headers: crate::transport::HeaderMap, _timeout: std::time::Duration) -> TransportResult {
            Ok(TransportResponse { status: 404, body: Vec::new(), headers: Default::default() })
        }
        async fn head(&self, _url: &str, _headers: crate::transport::HeaderMap, _timeout: std::time::Duration) -> TransportResult {
            Ok(TransportResponse { status: 404, body: Vec::new(), headers: Default::default() })
        }
    }

    async fn make_client() -> Arc<CfClient> {
        let config = CfConfig::new(ClientKey::parse("k"));
        CfClient::builder(config, CFUser::anonymous())
            .transport(Arc::new(AlwaysNotFound))
            .key_value_store(Arc::new(InMemoryStore::new()))
            .build()
            .await
    }

    #[tokio::test]
    async fn missing_flag_returns_default() {
        let client = make_client().await;
        assert!(!client.get_bool("missing", false).await);
        client.shutdown().await;
    }

    #[tokio::test]
    async fn add_user_property_updates_without_losing_anonymity() {
        let client = make_client().await;
        client.add_user_property("plan", serde_json::json!("pro")).await;
        let user = client.user.read().await;
        assert_eq!(user.properties.get("plan"), Some(&serde_json::json!("pro")));
        assert!(user.anonymous);
        drop(user);
        client.shutdown().await;
    }
}
