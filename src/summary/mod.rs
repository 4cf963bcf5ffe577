//! Summary Manager (C7): deduplicated exposure aggregation with a bounded
//! queue and periodic background flush.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{instrument, warn};

use crate::cache::{ExposureSink, FlagMetadata};
use crate::config::CfConfigHandle;
use crate::error::{CfError, ErrorSeverity, RateLimitedLogger};
use crate::resilience::{CircuitBreaker, RetryPolicy};
use crate::session::SessionManager;
use crate::transport::HttpTransport;
use crate::user::CFUser;

/// `{config_id, version, user_id?, requested_time, variation_id,
/// user_customer_id, session_id, behaviour_id?, experience_id, rule_id?}`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ExposureSummary {
    pub config_id: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub requested_time: String,
    pub variation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_customer_id: Option<String>,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub behaviour_id: Option<String>,
    pub experience_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
}

/// Renders `"yyyy-MM-dd HH:mm:ss.SSSX"` from the current UTC instant.
pub fn format_requested_time() -> String {
    let now = Utc::now();
    let base = now.format("%Y-%m-%d %H:%M:%S%.3f").to_string();
    format!("{base}Z")
}

struct QueueState {
    queue: VecDeque<ExposureSummary>,
    dedup: HashSet<String>,
}

pub struct SummaryManager {
    state: Arc<Mutex<QueueState>>,
    config: Arc<CfConfigHandle>,
    session: Arc<SessionManager>,
    user: Arc<tokio::sync::RwLock<CFUser>>,
    transport: Arc<dyn HttpTransport>,
    circuit_breaker: CircuitBreaker,
    retry_policy: RetryPolicy,
    rate_limiter: RateLimitedLogger,
    flush_timer: Mutex<Option<JoinHandle<()>>>,
    sdk_paused: Arc<AtomicBool>,
    self_ref: OnceLock<Weak<SummaryManager>>,
}

impl SummaryManager {
    pub fn new(
        config: Arc<CfConfigHandle>,
        session: Arc<SessionManager>,
        user: Arc<tokio::sync::RwLock<CFUser>>,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        Self::with_sdk_paused_flag(config, session, user, transport, Arc::new(AtomicBool::new(false)))
    }

    /// Builds a manager sharing its `cf_skip_sdk` flag with the config
    /// fetcher: summaries keep queuing while paused, but the periodic flush
    /// suppresses the outbound POST.
    pub fn with_sdk_paused_flag(
        config: Arc<CfConfigHandle>,
        session: Arc<SessionManager>,
        user: Arc<tokio::sync::RwLock<CFUser>>,
        transport: Arc<dyn HttpTransport>,
        sdk_paused: Arc<AtomicBool>,
    ) -> Self {
        let c = config.current();
        Self {
            state: Arc::new(Mutex::new(QueueState {
                queue: VecDeque::new(),
                dedup: HashSet::new(),
            })),
            circuit_breaker: CircuitBreaker::with_defaults(),
            retry_policy: RetryPolicy::new(
                c.max_retry_attempts,
                c.retry_initial_delay_ms,
                c.retry_max_delay_ms,
                c.retry_backoff_multiplier,
            ),
            config,
            session,
            user,
            transport,
            rate_limiter: RateLimitedLogger::new(),
            flush_timer: Mutex::new(None),
            sdk_paused,
            self_ref: OnceLock::new(),
        }
    }

    /// Builds a manager already wrapped in its own `Arc`, recording a `Weak`
    /// self-reference so `push` can spawn its capacity-triggered flush
    /// instead of awaiting it inline (§4.5 fire-and-forget).
    pub fn new_arc(
        config: Arc<CfConfigHandle>,
        session: Arc<SessionManager>,
        user: Arc<tokio::sync::RwLock<CFUser>>,
        transport: Arc<dyn HttpTransport>,
    ) -> Arc<Self> {
        Self::new_arc_with_sdk_paused_flag(
            config,
            session,
            user,
            transport,
            Arc::new(AtomicBool::new(false)),
        )
    }

    pub fn new_arc_with_sdk_paused_flag(
        config: Arc<CfConfigHandle>,
        session: Arc<SessionManager>,
        user: Arc<tokio::sync::RwLock<CFUser>>,
        transport: Arc<dyn HttpTransport>,
        sdk_paused: Arc<AtomicBool>,
    ) -> Arc<Self> {
        let manager = Arc::new(Self::with_sdk_paused_flag(
            config, session, user, transport, sdk_paused,
        ));
        let _ = manager.self_ref.set(Arc::downgrade(&manager));
        manager
    }

    /// Starts the periodic flush timer, cancelling and replacing any
    /// existing one atomically under `flush_timer`'s lock.
    pub async fn start_flush_timer(self: &Arc<Self>) {
        let interval_ms = self.config.current().summaries_flush_interval_ms;
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_millis(interval_ms));
            loop {
                ticker.tick().await;
                let _ = manager.flush_summaries().await;
            }
        });
        let mut guard = self.flush_timer.lock().await;
        if let Some(old) = guard.take() {
            old.abort();
        }
        *guard = Some(handle);
    }

    pub async fn stop_flush_timer(&self) {
        if let Some(handle) = self.flush_timer.lock().await.take() {
            handle.abort();
        }
    }

    async fn push(&self, summary: ExposureSummary) -> Result<(), CfError> {
        let capacity = self.config.current().summaries_queue_size;

        let full_before = self.state.lock().await.queue.len() >= capacity;
        if full_before {
            self.flush_summaries().await?;
            let mut state = self.state.lock().await;
            if state.queue.len() >= capacity {
                return Err(CfError::Internal("summary queue still full after flush".to_string()));
            }
            state.queue.push_back(summary);
            return Ok(());
        }

        let reached_capacity = {
            let mut state = self.state.lock().await;
            state.queue.push_back(summary);
            state.queue.len() >= capacity
        };

        if reached_capacity {
            self.spawn_flush();
        }
        Ok(())
    }

    /// Fire-and-forget flush at capacity (§4.5): spawned against an `Arc`
    /// clone so a flag read never blocks on the outbound POST. Only
    /// reachable when the manager was built through [`SummaryManager::new_arc`]
    /// or [`SummaryManager::new_arc_with_sdk_paused_flag`]; a bare manager
    /// (as constructed directly in tests) has no self-reference to spawn
    /// against and logs instead.
    fn spawn_flush(&self) {
        match self.self_ref.get().and_then(Weak::upgrade) {
            Some(manager) => {
                tokio::spawn(async move {
                    let _ = manager.flush_summaries().await;
                });
            }
            None => {
                warn!("summary manager has no Arc self-reference, skipping capacity-triggered flush");
            }
        }
    }

    #[instrument(skip(self, metadata))]
    async fn push_summary_internal(&self, key: &str, metadata: &FlagMetadata) {
        let (Some(config_id), Some(variation_id), Some(experience_id), Some(version)) = (
            metadata.config_id.clone(),
            metadata.variation_id.clone(),
            metadata.experience_id.clone(),
            metadata.version.clone(),
        ) else {
            self.rate_limiter.log(
                ErrorSeverity::Medium,
                "validation",
                "summary_manager",
                &format!("missing required summary fields for key {key}"),
            );
            return;
        };

        {
            let mut state = self.state.lock().await;
            if state.dedup.contains(&experience_id) {
                return;
            }
            state.dedup.insert(experience_id.clone());
        }

        let user = self.user.read().await;
        let summary = ExposureSummary {
            config_id,
            version,
            user_id: metadata.user_id.clone(),
            requested_time: format_requested_time(),
            variation_id,
            user_customer_id: user.customer_id.clone(),
            session_id: self.session.current_session_id().await,
            behaviour_id: metadata.behaviour_id.clone(),
            experience_id,
            rule_id: metadata.rule_id.clone(),
        };
        drop(user);

        if let Err(err) = self.push(summary).await {
            warn!(%err, "failed to enqueue exposure summary");
        }
    }

    /// Drains the queue and POSTs a batch. Returns the count flushed.
    #[instrument(skip(self))]
    pub async fn flush_summaries(&self) -> Result<usize, CfError> {
        let config = self.config.current();
        if config.offline_mode || self.sdk_paused.load(Ordering::Relaxed) {
            return Ok(0);
        }

        let batch: Vec<ExposureSummary> = {
            let mut state = self.state.lock().await;
            state.queue.drain(..).collect()
        };
        if batch.is_empty() {
            return Ok(0);
        }

        let user = self.user.read().await.to_wire();
        let url = format!(
            "{}/config/request/summary?cfenc={}",
            config.api_base,
            config.client_key.as_str()
        );
        let body = serde_json::json!({
            "user": user,
            "summaries": batch,
            "cf_client_sdk_version": config.cf_client_sdk_version,
        });

        let result = crate::resilience::execute_with_resilience(
            &self.circuit_breaker,
            &self.retry_policy,
            || {
                let transport = self.transport.clone();
                let url = url.clone();
                let body = body.clone();
                let timeout = std::time::Duration::from_millis(config.network_read_timeout_ms);
                async move {
                    transport
                        .post(&url, body, Default::default(), timeout)
                        .await
                        .map_err(|e| CfError::Network(e.to_string()))
                        .and_then(|response| {
                            if response.is_success() {
                                Ok(())
                            } else {
                                Err(CfError::Network(format!(
                                    "summary flush failed with status {}",
                                    response.status
                                )))
                            }
                        })
                }
            },
        )
        .await;

        match result {
            Ok(()) => Ok(batch.len()),
            Err(err) => {
                let mut state = self.state.lock().await;
                let capacity = self.config.current().summaries_queue_size;
                let mut dropped = 0;
                for summary in batch {
                    if state.queue.len() >= capacity {
                        dropped += 1;
                        continue;
                    }
                    state.queue.push_back(summary);
                }
                if dropped > 0 {
                    self.rate_limiter.log(
                        ErrorSeverity::High,
                        "internal",
                        "summary_manager",
                        &format!("dropped {dropped} summaries on re-enqueue after failed flush"),
                    );
                }
                Err(err)
            }
        }
    }

    pub async fn queue_len(&self) -> usize {
        self.state.lock().await.queue.len()
    }
}

#[async_trait]
impl ExposureSink for SummaryManager {
    async fn push_summary(&self, key: &str, metadata: &FlagMetadata) {
        self.push_summary_internal(key, metadata).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_key::ClientKey;
    use crate::config::CfConfig;
    use crate::storage::InMemoryStore;
    use crate::transport::{TransportResponse, TransportResult};

    struct StubTransport {
        succeed: bool,
    }

    #[async_trait]
    impl HttpTransport for StubTransport {
        async fn post(
            &self,
            _url: &str,
            _body: serde_json::Value,
            _headers: crate::transport::HeaderMap,
            _timeout: std::time::Duration,
        ) -> TransportResult {
            if self.succeed {
                Ok(TransportResponse {
                    status: 200,
                    body: b"{}".to_vec(),
                    headers: Default::default(),
                })
            } else {
                Err(crate::transport::TransportError::Request("boom".to_string()))
            }
        }

        async fn get(
            &self,
            _url: &str,
            _headers: crate::transport::HeaderMap,
            _timeout: std::time::Duration,
        ) -> TransportResult {
            unreachable!()
        }

        async fn head(
            &self,
            _url: &str,
            _headers: crate::transport::HeaderMap,
            _timeout: std::time::Duration,
        ) -> TransportResult {
            unreachable!()
        }
    }

    fn make_manager(succeed: bool) -> SummaryManager {
        let kv: Arc<dyn crate::storage::KeyValueStore> = Arc::new(InMemoryStore::new());
        let config = Arc::new(CfConfigHandle::new(CfConfig::new(ClientKey::parse("k"))));
        let session = Arc::new(SessionManager::new(kv, config.clone()));
        let user = Arc::new(tokio::sync::RwLock::new(CFUser::anonymous()));
        let transport: Arc<dyn HttpTransport> = Arc::new(StubTransport { succeed });
        SummaryManager::new(config, session, user, transport)
    }

    fn metadata(experience_id: &str) -> FlagMetadata {
        FlagMetadata {
            config_id: Some("c1".to_string()),
            variation_id: Some("v1".to_string()),
            experience_id: Some(experience_id.to_string()),
            version: Some("1".to_string()),
            behaviour_id: None,
            rule_id: None,
            user_id: None,
        }
    }

    #[tokio::test]
    async fn missing_required_fields_never_queued() {
        let manager = make_manager(true);
        let incomplete = FlagMetadata::default();
        manager.push_summary("flag", &incomplete).await;
        assert_eq!(manager.queue_len().await, 0);
    }

    #[tokio::test]
    async fn dedup_prevents_second_enqueue_for_same_experience() {
        let manager = make_manager(true);
        manager.push_summary("flag", &metadata("e1")).await;
        manager.push_summary("flag", &metadata("e1")).await;
        assert_eq!(manager.queue_len().await, 1);
    }

    #[tokio::test]
    async fn successful_flush_empties_queue() {
        let manager = make_manager(true);
        manager.push_summary("flag", &metadata("e1")).await;
        let flushed = manager.flush_summaries().await.unwrap();
        assert_eq!(flushed, 1);
        assert_eq!(manager.queue_len().await, 0);
    }

    #[tokio::test]
    async fn failed_flush_reenqueues_batch() {
        let manager = make_manager(false);
        manager.push_summary("flag", &metadata("e1")).await;
        let result = manager.flush_summaries().await;
        assert!(result.is_err());
        assert_eq!(manager.queue_len().await, 1);
    }

    #[tokio::test]
    async fn capacity_triggered_flush_is_spawned_not_awaited_inline() {
        let kv: Arc<dyn crate::storage::KeyValueStore> = Arc::new(InMemoryStore::new());
        let mut raw_config = CfConfig::new(ClientKey::parse("k"));
        raw_config.summaries_queue_size = 1;
        let config = Arc::new(CfConfigHandle::new(raw_config));
        let session = Arc::new(SessionManager::new(kv, config.clone()));
        let user = Arc::new(tokio::sync::RwLock::new(CFUser::anonymous()));
        let transport: Arc<dyn HttpTransport> = Arc::new(StubTransport { succeed: true });
        let manager = SummaryManager::new_arc(config, session, user, transport);

        // `push_summary` returns as soon as the spawned flush is kicked off;
        // it does not wait for the POST to complete.
        manager.push_summary("flag", &metadata("e1")).await;

        for _ in 0..50 {
            if manager.queue_len().await == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(manager.queue_len().await, 0);
    }

    #[tokio::test]
    async fn sdk_paused_suppresses_flush_without_dropping_queue() {
        let kv: Arc<dyn crate::storage::KeyValueStore> = Arc::new(InMemoryStore::new());
        let config = Arc::new(CfConfigHandle::new(CfConfig::new(ClientKey::parse("k"))));
        let session = Arc::new(SessionManager::new(kv, config.clone()));
        let user = Arc::new(tokio::sync::RwLock::new(CFUser::anonymous()));
        let transport: Arc<dyn HttpTransport> = Arc::new(StubTransport { succeed: true });
        let paused = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let manager = SummaryManager::with_sdk_paused_flag(config, session, user, transport, paused);

        manager.push_summary("flag", &metadata("e1")).await;
        let flushed = manager.flush_summaries().await.unwrap();
        assert_eq!(flushed, 0);
        assert_eq!(manager.queue_len().await, 1);
    }
}
