//! Runtime configuration and the mutable wrapper that propagates changes to
//! subscribers (§4.1).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::error;

use crate::client_key::ClientKey;
use crate::error::{CfError, Result};

/// Log level accepted by [`CfConfigHandle::set_log_level`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "off" => Some(LogLevel::Off),
            "error" => Some(LogLevel::Error),
            "warn" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            "trace" => Some(LogLevel::Trace),
            _ => None,
        }
    }
}

/// Immutable configuration record. Replaced wholesale (never mutated in
/// place) by [`CfConfigHandle`] setters.
#[derive(Debug, Clone)]
pub struct CfConfig {
    pub client_key: ClientKey,

    pub api_base: String,
    pub settings_base: String,

    pub events_queue_size: usize,
    pub events_flush_interval_ms: u64,
    pub events_flush_time_seconds: u64,

    pub summaries_queue_size: usize,
    pub summaries_flush_interval_ms: u64,

    pub sdk_settings_check_interval_ms: u64,
    pub background_polling_interval_ms: u64,
    pub reduced_polling_interval_ms: u64,
    pub disable_background_polling: bool,
    pub use_reduced_polling_when_battery_low: bool,

    pub network_connection_timeout_ms: u64,
    pub network_read_timeout_ms: u64,

    pub max_retry_attempts: usize,
    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_backoff_multiplier: f64,

    pub offline_mode: bool,
    pub max_stored_events: usize,

    pub log_level: LogLevel,
    pub auto_env_attributes_enabled: bool,

    /// Session rotation knobs, grouped here rather than a separate struct
    /// since they are all runtime-tunable via the same setter contract.
    pub min_session_duration_ms: u64,
    pub max_session_duration_ms: u64,
    pub background_threshold_ms: u64,
    pub rotate_on_app_restart: bool,
    pub enable_time_based_rotation: bool,
    pub rotate_on_auth_change: bool,
    pub session_id_prefix: String,

    /// Open question resolution (SPEC_FULL §9): never clear the summary
    /// dedup set unless the host opts in here.
    pub clear_summary_dedup_on_session_rotation: bool,

    pub cf_client_sdk_version: String,
}

impl CfConfig {
    pub fn new(client_key: ClientKey) -> Self {
        Self {
            client_key,
            api_base: "https://api.customfit.ai".to_string(),
            settings_base: "https://settings.customfit.ai".to_string(),
            events_queue_size: 100,
            events_flush_interval_ms: 30_000,
            events_flush_time_seconds: 60,
            summaries_queue_size: 100,
            summaries_flush_interval_ms: 30_000,
            sdk_settings_check_interval_ms: 300_000,
            background_polling_interval_ms: 900_000,
            reduced_polling_interval_ms: 1_800_000,
            disable_background_polling: false,
            use_reduced_polling_when_battery_low: true,
            network_connection_timeout_ms: 10_000,
            network_read_timeout_ms: 10_000,
            max_retry_attempts: 3,
            retry_initial_delay_ms: 100,
            retry_max_delay_ms: 30_000,
            retry_backoff_multiplier: 2.0,
            offline_mode: false,
            max_stored_events: 1000,
            log_level: LogLevel::Info,
            auto_env_attributes_enabled: false,
            min_session_duration_ms: 300_000,
            max_session_duration_ms: 3_600_000,
            background_threshold_ms: 900_000,
            rotate_on_app_restart: true,
            enable_time_based_rotation: true,
            rotate_on_auth_change: true,
            session_id_prefix: "cf_session".to_string(),
            clear_summary_dedup_on_session_rotation: false,
            cf_client_sdk_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Reads overrides from `CF_*` environment variables, mirroring the
    /// teacher's `XxxConfig::from_env()` associated functions. Unset
    /// variables fall back to [`CfConfig::new`]'s defaults.
    pub fn from_env(client_key: ClientKey) -> Self {
        let mut config = Self::new(client_key);

        if let Ok(v) = std::env::var("CF_API_BASE") {
            config.api_base = v;
        }
        if let Ok(v) = std::env::var("CF_SETTINGS_BASE") {
            config.settings_base = v;
        }
        if let Ok(v) = std::env::var("CF_OFFLINE_MODE") {
            config.offline_mode = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("CF_LOG_LEVEL") {
            if let Some(level) = LogLevel::parse(&v) {
                config.log_level = level;
            }
        }
        if let Ok(v) = std::env::var("CF_SDK_SETTINGS_CHECK_MS") {
            if let Ok(n) = v.parse() {
                config.sdk_settings_check_interval_ms = n;
            }
        }

        config
    }
}

type ConfigListener = Arc<dyn Fn(&CfConfig, &CfConfig) + Send + Sync>;

/// Mutable wrapper around [`CfConfig`]. Setters validate, atomically swap
/// the record under a lock, then notify listeners with `(old, new)` after
/// the lock is released.
pub struct CfConfigHandle {
    current: RwLock<Arc<CfConfig>>,
    listeners: RwLock<Vec<ConfigListener>>,
}

impl CfConfigHandle {
    pub fn new(config: CfConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn current(&self) -> Arc<CfConfig> {
        self.current.read().clone()
    }

    pub fn add_listener(&self, listener: ConfigListener) {
        self.listeners.write().push(listener);
    }

    fn swap(&self, mutate: impl FnOnce(&mut CfConfig)) {
        let (old, new) = {
            let mut guard = self.current.write();
            let old = guard.clone();
            let mut next = (*old).clone();
            mutate(&mut next);
            let new = Arc::new(next);
            *guard = new.clone();
            (old, new)
        };

        let listeners = self.listeners.read().clone();
        for listener in listeners {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                listener(&old, &new);
            }));
            if result.is_err() {
                error!("config change listener panicked");
            }
        }
    }

    pub fn set_events_flush_interval_ms(&self, value_ms: u64) -> Result<()> {
        self.set_positive_duration(value_ms, |c| &mut c.events_flush_interval_ms)
    }

    pub fn set_summaries_flush_interval_ms(&self, value_ms: u64) -> Result<()> {
        self.set_positive_duration(value_ms, |c| &mut c.summaries_flush_interval_ms)
    }

    pub fn set_sdk_settings_check_interval_ms(&self, value_ms: u64) -> Result<()> {
        self.set_positive_duration(value_ms, |c| &mut c.sdk_settings_check_interval_ms)
    }

    pub fn set_background_polling_interval_ms(&self, value_ms: u64) -> Result<()> {
        self.set_positive_duration(value_ms, |c| &mut c.background_polling_interval_ms)
    }

    pub fn set_reduced_polling_interval_ms(&self, value_ms: u64) -> Result<()> {
        self.set_positive_duration(value_ms, |c| &mut c.reduced_polling_interval_ms)
    }

    pub fn set_max_stored_events(&self, value: usize) -> Result<()> {
        if value == 0 {
            return Err(CfError::Validation("max_stored_events must be > 0".to_string()));
        }
        if self.current().max_stored_events == value {
            return Ok(());
        }
        self.swap(|c| c.max_stored_events = value);
        Ok(())
    }

    pub fn set_offline_mode(&self, offline: bool) -> Result<()> {
        if self.current().offline_mode == offline {
            return Ok(());
        }
        self.swap(|c| c.offline_mode = offline);
        Ok(())
    }

    pub fn set_use_reduced_when_battery_low(&self, value: bool) -> Result<()> {
        if self.current().use_reduced_polling_when_battery_low == value {
            return Ok(());
        }
        self.swap(|c| c.use_reduced_polling_when_battery_low = value);
        Ok(())
    }

    pub fn set_log_level(&self, level: &str) -> Result<()> {
        let parsed = LogLevel::parse(level)
            .ok_or_else(|| CfError::Validation(format!("unknown log level: {level}")))?;
        if self.current().log_level == parsed {
            return Ok(());
        }
        self.swap(|c| c.log_level = parsed);
        Ok(())
    }

    fn set_positive_duration(
        &self,
        value_ms: u64,
        field: impl Fn(&mut CfConfig) -> &mut u64,
    ) -> Result<()> {
        if value_ms == 0 {
            return Err(CfError::Validation("duration must be > 0".to_string()));
        }
        self.swap(|c| {
            *field(c) = value_ms;
        });
        Ok(())
    }
}

/// JSON-compatible property map shared by [`crate::user::CFUser`] and
/// [`crate::user::EvaluationContext`].
pub type PropertyMap = HashMap<String, serde_json::Value>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use test_case::test_case;

    fn test_key() -> ClientKey {
        ClientKey::parse("test-key")
    }

    #[test_case("off", Some(LogLevel::Off))]
    #[test_case("ERROR", Some(LogLevel::Error))]
    #[test_case("Warn", Some(LogLevel::Warn))]
    #[test_case("info", Some(LogLevel::Info))]
    #[test_case("debug", Some(LogLevel::Debug))]
    #[test_case("trace", Some(LogLevel::Trace))]
    #[test_case("nonsense", None)]
    fn log_level_parse_is_case_insensitive(input: &str, expected: Option<LogLevel>) {
        assert_eq!(LogLevel::parse(input), expected);
    }

    #[test]
    fn setter_rejects_zero_duration() {
        let handle = CfConfigHandle::new(CfConfig::new(test_key()));
        assert!(handle.set_events_flush_interval_ms(0).is_err());
    }

    #[test]
    fn setter_is_idempotent_and_skips_notification() {
        let handle = CfConfigHandle::new(CfConfig::new(test_key()));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        handle.add_listener(Arc::new(move |_, _| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        }));

        let current = handle.current().offline_mode;
        handle.set_offline_mode(current).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        handle.set_offline_mode(!current).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_panic_does_not_roll_back_change() {
        let handle = CfConfigHandle::new(CfConfig::new(test_key()));
        handle.add_listener(Arc::new(|_, _| panic!("boom")));

        handle.set_offline_mode(true).unwrap();
        assert!(handle.current().offline_mode);
    }
}
