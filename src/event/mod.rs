//! Event Tracker (C8): bounded event queue, time/size flush,
//! `flush_summaries` before `flush_events`, re-queue on failure.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::config::CfConfigHandle;
use crate::error::{CfError, ErrorSeverity, RateLimitedLogger};
use crate::resilience::{CircuitBreaker, RetryPolicy};
use crate::session::SessionManager;
use crate::summary::SummaryManager;
use crate::transport::HttpTransport;
use crate::user::CFUser;

const MAX_PROPERTIES_WARNING_THRESHOLD: usize = 50;

/// `{event_customer_id (name), event_type, properties, event_timestamp,
/// session_id, insert_id}`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EventRecord {
    pub event_customer_id: String,
    pub event_type: &'static str,
    pub properties: serde_json::Map<String, serde_json::Value>,
    pub event_timestamp: DateTime<Utc>,
    pub session_id: String,
    pub insert_id: String,
}

struct QueueState {
    queue: VecDeque<EventRecord>,
}

#[async_trait]
pub trait EventFlushSink: Send + Sync {
    async fn flush_summaries(&self) -> Result<usize, CfError>;
}

#[async_trait]
impl EventFlushSink for SummaryManager {
    async fn flush_summaries(&self) -> Result<usize, CfError> {
        SummaryManager::flush_summaries(self).await
    }
}

pub struct EventTracker {
    state: Arc<Mutex<QueueState>>,
    config: Arc<CfConfigHandle>,
    session: Arc<SessionManager>,
    user: Arc<tokio::sync::RwLock<CFUser>>,
    transport: Arc<dyn HttpTransport>,
    summary_sink: Arc<dyn EventFlushSink>,
    circuit_breaker: CircuitBreaker,
    retry_policy: RetryPolicy,
    rate_limiter: RateLimitedLogger,
    flush_timer: Mutex<Option<JoinHandle<()>>>,
    sdk_paused: Arc<AtomicBool>,
}

impl EventTracker {
    pub fn new(
        config: Arc<CfConfigHandle>,
        session: Arc<SessionManager>,
        user: Arc<tokio::sync::RwLock<CFUser>>,
        transport: Arc<dyn HttpTransport>,
        summary_sink: Arc<dyn EventFlushSink>,
    ) -> Self {
        Self::with_sdk_paused_flag(
            config,
            session,
            user,
            transport,
            summary_sink,
            Arc::new(AtomicBool::new(false)),
        )
    }

    /// Builds a tracker sharing its `cf_skip_sdk` flag with the config
    /// fetcher and summary manager: events keep queuing while paused, but
    /// the flush suppresses the outbound POST.
    pub fn with_sdk_paused_flag(
        config: Arc<CfConfigHandle>,
        session: Arc<SessionManager>,
        user: Arc<tokio::sync::RwLock<CFUser>>,
        transport: Arc<dyn HttpTransport>,
        summary_sink: Arc<dyn EventFlushSink>,
        sdk_paused: Arc<AtomicBool>,
    ) -> Self {
        let c = config.current();
        Self {
            state: Arc::new(Mutex::new(QueueState {
                queue: VecDeque::new(),
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
            summary_sink,
            rate_limiter: RateLimitedLogger::new(),
            flush_timer: Mutex::new(None),
            sdk_paused,
        }
    }

    pub async fn start_flush_timer(self: &Arc<Self>) {
        let interval_ms = self.config.current().events_flush_interval_ms;
        let flush_after = self.config.current().events_flush_time_seconds as i64;
        let tracker = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_millis(interval_ms));
            loop {
                ticker.tick().await;
                let oldest_age = tracker.state.lock().await.queue.front().map(|e| {
                    (Utc::now() - e.event_timestamp).num_seconds()
                });
                if matches!(oldest_age, Some(age) if age > flush_after) {
                    let _ = tracker.flush_events().await;
                }
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

    /// Rejects blank names, drops null-valued properties (warning past 50
    /// remaining), stamps `insert_id`/`event_timestamp`/`session_id` at
    /// enqueue time, and tail-drops the oldest event when the queue is full.
    #[instrument(skip(self, properties))]
    pub async fn track(
        &self,
        name: &str,
        properties: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), CfError> {
        if name.trim().is_empty() {
            return Err(CfError::Validation("event name must not be blank".to_string()));
        }

        let filtered: serde_json::Map<String, serde_json::Value> = properties
            .into_iter()
            .filter(|(_, v)| !v.is_null())
            .collect();
        if filtered.len() > MAX_PROPERTIES_WARNING_THRESHOLD {
            warn!(count = filtered.len(), "event has more than 50 properties");
        }

        let record = EventRecord {
            event_customer_id: name.to_string(),
            event_type: "TRACK",
            properties: filtered,
            event_timestamp: Utc::now(),
            session_id: self.session.current_session_id().await,
            insert_id: Uuid::new_v4().to_string(),
        };

        let capacity = self.config.current().events_queue_size;
        let mut state = self.state.lock().await;
        if state.queue.len() >= capacity {
            state.queue.pop_front();
            warn!("event queue at capacity, dropping oldest event");
        }
        state.queue.push_back(record);
        let should_flush = state.queue.len() >= capacity;
        drop(state);

        if should_flush {
            let _ = self.flush_events().await;
        }
        Ok(())
    }

    /// Flushes summaries first (events always trail summaries on the wire),
    /// then drains and POSTs the event batch.
    #[instrument(skip(self))]
    pub async fn flush_events(&self) -> Result<usize, CfError> {
        let config = self.config.current();
        if config.offline_mode || self.sdk_paused.load(Ordering::Relaxed) {
            return Ok(0);
        }

        self.summary_sink.flush_summaries().await?;

        let batch: Vec<EventRecord> = {
            let mut state = self.state.lock().await;
            state.queue.drain(..).collect()
        };
        if batch.is_empty() {
            return Ok(0);
        }

        let user = self.user.read().await.to_wire();
        let url = format!("{}/cfe?cfenc={}", config.api_base, config.client_key.as_str());
        let body = serde_json::json!({
            "events": batch,
            "user": user,
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
                                    "event flush failed with status {}",
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
                let capacity = self.config.current().events_queue_size;
                let mut dropped = 0;
                for record in batch {
                    if state.queue.len() >= capacity {
                        dropped += 1;
                        continue;
                    }
                    state.queue.push_back(record);
                }
                if dropped > 0 {
                    self.rate_limiter.log(
                        ErrorSeverity::High,
                        "internal",
                        "event_tracker",
                        &format!("dropped {dropped} events on re-enqueue after failed flush"),
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
