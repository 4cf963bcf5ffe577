//! Lifecycle / Battery / Network Coordinator (C9): drives polling cadence
//! from app-foreground and battery state, and tracks [`ConnectionStatus`].

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock as SyncRwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::config::CfConfigHandle;
use crate::fetcher::{ConfigFetcher, FetchOutcome};
use crate::session::SessionManager;
use crate::user::CFUser;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Foreground,
    Background,
    Inactive,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatteryState {
    pub level: f32,
    pub is_low: bool,
    pub is_charging: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
    Connected,
    Disconnected,
}

/// `{connected, connecting, disconnected, offline}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Offline,
}

/// Specialization of the teacher's `EcosystemAdapter` trait
/// (`connect`/`health_check`/`disconnect`) to a push/subscribe contract,
/// since platform monitors are push collaborators, not pull adapters.
#[async_trait]
pub trait AppStateMonitor: Send + Sync {
    async fn subscribe(&self) -> mpsc::Receiver<AppState>;
}

#[async_trait]
pub trait BatteryMonitor: Send + Sync {
    async fn subscribe(&self) -> mpsc::Receiver<BatteryState>;
}

#[async_trait]
pub trait NetworkMonitor: Send + Sync {
    async fn subscribe(&self) -> mpsc::Receiver<NetworkState>;
}

type ConnectionListener = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;

struct Handles {
    poll_timer: Option<JoinHandle<()>>,
    app_state: Option<JoinHandle<()>>,
    battery: Option<JoinHandle<()>>,
    network: Option<JoinHandle<()>>,
}

pub struct Coordinator {
    config: Arc<CfConfigHandle>,
    fetcher: Arc<ConfigFetcher>,
    session: Arc<SessionManager>,
    user: Arc<tokio::sync::RwLock<CFUser>>,
    app_monitor: Option<Arc<dyn AppStateMonitor>>,
    battery_monitor: Option<Arc<dyn BatteryMonitor>>,
    network_monitor: Option<Arc<dyn NetworkMonitor>>,
    status: SyncRwLock<ConnectionStatus>,
    listeners: SyncRwLock<Vec<ConnectionListener>>,
    app_state: SyncRwLock<AppState>,
    battery_state: SyncRwLock<Option<BatteryState>>,
    handles: tokio::sync::Mutex<Handles>,
}

impl Coordinator {
    pub fn new(
        config: Arc<CfConfigHandle>,
        fetcher: Arc<ConfigFetcher>,
        session: Arc<SessionManager>,
        user: Arc<tokio::sync::RwLock<CFUser>>,
    ) -> Self {
        let initial_status = if config.current().offline_mode {
            ConnectionStatus::Offline
        } else {
            ConnectionStatus::Connecting
        };
        Self {
            config,
            fetcher,
            session,
            user,
            app_monitor: None,
            battery_monitor: None,
            network_monitor: None,
            status: SyncRwLock::new(initial_status),
            listeners: SyncRwLock::new(Vec::new()),
            app_state: SyncRwLock::new(AppState::Foreground),
            battery_state: SyncRwLock::new(None),
            handles: tokio::sync::Mutex::new(Handles {
                poll_timer: None,
                app_state: None,
                battery: None,
                network: None,
            }),
        }
    }

    pub fn with_app_state_monitor(mut self, monitor: Arc<dyn AppStateMonitor>) -> Self {
        self.app_monitor = Some(monitor);
        self
    }

    pub fn with_battery_monitor(mut self, monitor: Arc<dyn BatteryMonitor>) -> Self {
        self.battery_monitor = Some(monitor);
        self
    }

    pub fn with_network_monitor(mut self, monitor: Arc<dyn NetworkMonitor>) -> Self {
        self.network_monitor = Some(monitor);
        self
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        *self.status.read()
    }

    pub fn add_connection_listener(&self, listener: ConnectionListener) {
        self.listeners.write().push(listener);
    }

    fn set_status(&self, status: ConnectionStatus) {
        let changed = {
            let mut guard = self.status.write();
            if *guard == status {
                false
            } else {
                *guard = status;
                true
            }
        };
        if changed {
            let listeners = self.listeners.read().clone();
            for listener in listeners {
                listener(status);
            }
        }
    }

    /// Polling interval selected per §4.7: background interval when
    /// backgrounded (unless disabled), reduced interval when battery is low
    /// and not charging (if enabled), else the default SDK-settings cadence.
    fn current_polling_interval_ms(&self) -> u64 {
        let config = self.config.current();
        let app_state = *self.app_state.read();
        let battery = *self.battery_state.read();

        if !config.disable_background_polling && app_state == AppState::Background {
            return config.background_polling_interval_ms;
        }
        if config.use_reduced_polling_when_battery_low {
            if let Some(battery) = battery {
                if battery.is_low && !battery.is_charging {
                    return config.reduced_polling_interval_ms;
                }
            }
        }
        config.sdk_settings_check_interval_ms
    }

    /// Starts all subscription loops and the polling-cadence timer. Owned
    /// `JoinHandle`s are cancelled as a unit on [`Coordinator::shutdown`].
    pub async fn start(self: &Arc<Self>) {
        if self.config.current().offline_mode {
            self.set_status(ConnectionStatus::Offline);
        }

        let mut handles = self.handles.lock().await;

        let coordinator = self.clone();
        handles.poll_timer = Some(tokio::spawn(async move {
            coordinator.poll_loop().await;
        }));

        if let Some(monitor) = self.app_monitor.clone() {
            let coordinator = self.clone();
            handles.app_state = Some(tokio::spawn(async move {
                let mut rx = monitor.subscribe().await;
                while let Some(state) = rx.recv().await {
                    coordinator.handle_app_state(state).await;
                }
            }));
        }

        if let Some(monitor) = self.battery_monitor.clone() {
            let coordinator = self.clone();
            handles.battery = Some(tokio::spawn(async move {
                let mut rx = monitor.subscribe().await;
                while let Some(state) = rx.recv().await {
                    *coordinator.battery_state.write() = Some(state);
                }
            }));
        }

        if let Some(monitor) = self.network_monitor.clone() {
            let coordinator = self.clone();
            handles.network = Some(tokio::spawn(async move {
                let mut rx = monitor.subscribe().await;
                while let Some(state) = rx.recv().await {
                    coordinator.handle_network_change(state).await;
                }
            }));
        }
    }

    async fn poll_loop(self: Arc<Self>) {
        loop {
            if self.config.current().offline_mode {
                tokio::time::sleep(std::time::Duration::from_millis(1000)).await;
                continue;
            }
            self.poll_once().await;
            let interval = self.current_polling_interval_ms();
            tokio::time::sleep(std::time::Duration::from_millis(interval)).await;
        }
    }

    #[instrument(skip(self))]
    async fn poll_once(&self) {
        if self.config.current().offline_mode {
            self.set_status(ConnectionStatus::Offline);
            return;
        }
        if self.fetcher.is_sdk_paused() {
            return;
        }
        let user = self.user.read().await.clone();
        match self.fetcher.fetch_cycle(&user).await {
            Ok(FetchOutcome::Updated) | Ok(FetchOutcome::Unchanged) | Ok(FetchOutcome::NoSettings) => {
                self.set_status(ConnectionStatus::Connected);
            }
            Ok(FetchOutcome::Skipped) => {}
            Err(err) => {
                warn!(%err, "fetch cycle failed");
                self.set_status(ConnectionStatus::Disconnected);
            }
        }
    }

    async fn handle_app_state(&self, state: AppState) {
        *self.app_state.write() = state;
        match state {
            AppState::Background => self.session.on_background().await,
            AppState::Foreground => self.session.on_foreground().await,
            AppState::Inactive => {}
        }
    }

    async fn handle_network_change(&self, state: NetworkState) {
        self.session.on_network_change().await;
        if self.config.current().offline_mode {
            return;
        }
        match state {
            NetworkState::Disconnected => self.set_status(ConnectionStatus::Disconnected),
            NetworkState::Connected => self.set_status(ConnectionStatus::Connecting),
        }
    }

    /// Toggles offline mode. Idempotent: repeated calls with the same value
    /// are a no-op after the first.
    pub fn set_offline(&self, offline: bool) {
        if self.config.current().offline_mode == offline {
            return;
        }
        let _ = self.config.set_offline_mode(offline);
        if offline {
            self.set_status(ConnectionStatus::Offline);
        } else {
            self.set_status(ConnectionStatus::Connecting);
        }
    }

    /// Cancels all timers and subscription loops. Subsequent polling stops;
    /// in-flight work is not force-aborted beyond task cancellation.
    pub async fn shutdown(&self) {
        let mut handles = self.handles.lock().await;
        if let Some(h) = handles.poll_timer.take() {
            h.abort();
        }
        if let Some(h) = handles.app_state.take() {
            h.abort();
        }
        if let Some(h) = handles.battery.take() {
            h.abort();
        }
        if let Some(h) = handles.network.take() {
            h.abort();
        }
        info!("coordinator shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_key::ClientKey;
    use crate::config::CfConfig;
    use crate::storage::InMemoryStore;
    use crate::transport::{HttpTransport, TransportResponse, TransportResult};

    struct AlwaysNotFound;

    #[async_trait]
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

    fn make_coordinator() -> Arc<Coordinator> {
        let kv: Arc<dyn crate::storage::KeyValueStore> = Arc::new(InMemoryStore::new());
        let config = Arc::new(CfConfigHandle::new(CfConfig::new(ClientKey::parse("k"))));
        let cache = Arc::new(crate::cache::ConfigCache::new(Arc::new(NullSink), kv.clone()));
        let transport: Arc<dyn HttpTransport> = Arc::new(AlwaysNotFound);
        let fetcher = Arc::new(ConfigFetcher::new(transport, config.clone(), cache, kv.clone()));
        let session = Arc::new(SessionManager::new(kv, config.clone()));
        let user = Arc::new(tokio::sync::RwLock::new(CFUser::anonymous()));
        Arc::new(Coordinator::new(config, fetcher, session, user))
    }

    struct NullSink;

    #[async_trait]
    impl crate::cache::ExposureSink for NullSink {
        async fn push_summary(&self, _key: &str, _metadata: &crate::cache::FlagMetadata) {}
    }

    #[test]
    fn background_interval_used_when_backgrounded() {
        let coordinator = make_coordinator();
        *coordinator.app_state.write() = AppState::Background;
        assert_eq!(
            coordinator.current_polling_interval_ms(),
            coordinator.config.current().background_polling_interval_ms
        );
    }

    #[test]
    fn reduced_interval_used_when_battery_low_and_not_charging() {
        let coordinator = make_coordinator();
        *coordinator.battery_state.write() = Some(BatteryState { level: 0.1, is_low: true, is_charging: false });
        assert_eq!(
            coordinator.current_polling_interval_ms(),
            coordinator.config.current().reduced_polling_interval_ms
        );
    }

    #[tokio::test]
    async fn poll_once_skips_fetch_while_sdk_paused() {
        let coordinator = make_coordinator();
        coordinator.fetcher.apply_settings_flags(&serde_json::json!({"cf_skip_sdk": true}));
        assert_eq!(coordinator.connection_status(), ConnectionStatus::Connecting);
        coordinator.poll_once().await;
        assert_eq!(coordinator.connection_status(), ConnectionStatus::Connecting);
    }

    #[test]
    fn set_offline_twice_is_idempotent() {
        let coordinator = make_coordinator();
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let calls_clone = calls.clone();
        coordinator.add_connection_listener(Arc::new(move |_| {
            calls_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }));

        coordinator.set_offline(true);
        coordinator.set_offline(true);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(coordinator.connection_status(), ConnectionStatus::Offline);
    }
}
