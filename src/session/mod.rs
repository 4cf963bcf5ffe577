//! Session Manager (C4): owns the current session identifier, rotating by
//! time, restart, background-return, or auth change.

use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{OnceCell, RwLock};
use tracing::{info, warn};

use crate::config::CfConfigHandle;
use crate::storage::{
    KeyValueStore, BACKGROUND_TIMESTAMP_TTL, KEY_BACKGROUND_TIMESTAMP, KEY_CURRENT_SESSION,
    KEY_LAST_APP_START, LAST_APP_START_TTL, SESSION_TTL,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RotationReason {
    AppStart,
    MaxDurationExceeded,
    BackgroundTimeout,
    AuthChange,
    ManualRotation,
}

/// `{session_id, created_at, last_active_at, app_start_time, rotation_reason?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionData {
    pub session_id: String,
    pub created_at: i64,
    pub last_active_at: i64,
    pub app_start_time: i64,
    pub rotation_reason: Option<RotationReason>,
}

impl SessionData {
    fn new(prefix: &str, now_ms: i64, app_start_time: i64, reason: Option<RotationReason>) -> Self {
        let suffix: u32 = rand::thread_rng().gen_range(0..0xFFFF_FFFFu32);
        Self {
            session_id: format!("{prefix}_{now_ms}_{suffix:08x}"),
            created_at: now_ms,
            last_active_at: now_ms,
            app_start_time,
            rotation_reason: reason,
        }
    }
}

/// Tagged-variant session-rotation listener callback (REDESIGN FLAGS).
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Rotated(SessionData),
    Restored(String),
    Error(String),
}

type SessionListener = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Builds the next rotated `SessionData` in place and returns a copy of it.
/// `data.app_start_time` is carried over unless it is still the zero
/// placeholder, in which case `now` seeds it.
fn apply_rotation(data: &mut SessionData, prefix: &str, now: i64, reason: RotationReason) -> SessionData {
    let app_start_time = if data.app_start_time == 0 { now } else { data.app_start_time };
    let session = SessionData::new(prefix, now, app_start_time, Some(reason));
    *data = session.clone();
    session
}

/// Session data and the listener list behind one lock: a caller deciding
/// whether to rotate reads and mutates `data` under a single acquisition,
/// so no other task can observe or act on a half-updated session.
struct Inner {
    data: SessionData,
    listeners: Vec<SessionListener>,
}

/// All public methods serialize on a single mutex; listener dispatch
/// snapshots the listener list, releases the lock, then invokes.
pub struct SessionManager {
    kv: Arc<dyn KeyValueStore>,
    config: Arc<CfConfigHandle>,
    initialized: OnceCell<()>,
    inner: RwLock<Inner>,
}

impl SessionManager {
    pub fn new(kv: Arc<dyn KeyValueStore>, config: Arc<CfConfigHandle>) -> Self {
        let placeholder = SessionData::new("cf_session", 0, 0, None);
        Self {
            kv,
            config,
            initialized: OnceCell::new(),
            inner: RwLock::new(Inner {
                data: placeholder,
                listeners: Vec::new(),
            }),
        }
    }

    pub async fn add_listener(&self, listener: SessionListener) {
        self.inner.write().await.listeners.push(listener);
    }

    pub async fn current_session_id(&self) -> String {
        self.inner.read().await.data.session_id.clone()
    }

    /// Runs the cold-start algorithm exactly once; concurrent callers all
    /// observe the same single construction via `OnceCell`.
    pub async fn initialize(&self) {
        let manager = self;
        self.initialized
            .get_or_init(|| async move { manager.do_initialize().await })
            .await;
    }

    async fn do_initialize(&self) {
        let config = self.config.current();
        let now = now_ms();

        let last_app_start = self
            .kv
            .get(KEY_LAST_APP_START)
            .await
            .ok()
            .flatten()
            .and_then(|v| v.as_i64());

        let should_rotate_for_restart = match last_app_start {
            None => config.rotate_on_app_restart,
            Some(last) => {
                config.rotate_on_app_restart
                    && (now - last) > config.min_session_duration_ms as i64
            }
        };

        if should_rotate_for_restart {
            self.rotate(RotationReason::AppStart, now).await;
            let _ = self
                .kv
                .put(
                    KEY_LAST_APP_START,
                    serde_json::json!(now),
                    Some(LAST_APP_START_TTL),
                    true,
                )
                .await;
            return;
        }

        let persisted = self
            .kv
            .get(KEY_CURRENT_SESSION)
            .await
            .ok()
            .flatten()
            .and_then(|v| serde_json::from_value::<SessionData>(v).ok());

        match persisted {
            Some(session) => {
                let age = now - session.created_at;
                let idle = now - session.last_active_at;
                let valid = age < config.max_session_duration_ms as i64
                    && idle < config.background_threshold_ms as i64;

                if valid {
                    let session_id = session.session_id.clone();
                    let mut next = session;
                    next.last_active_at = now;
                    self.persist_and_adopt(next).await;
                    self.notify(SessionEvent::Restored(session_id)).await;
                } else {
                    self.rotate(RotationReason::AppStart, now).await;
                }
            }
            None => {
                self.rotate(RotationReason::AppStart, now).await;
            }
        }
    }

    /// `update_activity`: rotates on `MAX_DURATION_EXCEEDED` if time-based
    /// rotation is enabled and the session has exceeded its max duration;
    /// otherwise advances `last_active_at` and persists. The decision and
    /// the mutation happen under one write-lock acquisition so a
    /// concurrent caller can't observe the pre-decision state.
    pub async fn update_activity(&self) {
        let config = self.config.current();
        let now = now_ms();

        enum Transition {
            Rotated(SessionData),
            Touched(SessionData),
        }

        let transition = {
            let mut guard = self.inner.write().await;
            if config.enable_time_based_rotation
                && (now - guard.data.created_at) >= config.max_session_duration_ms as i64
            {
                Transition::Rotated(apply_rotation(
                    &mut guard.data,
                    &config.session_id_prefix,
                    now,
                    RotationReason::MaxDurationExceeded,
                ))
            } else {
                guard.data.last_active_at = now;
                Transition::Touched(guard.data.clone())
            }
        };

        match transition {
            Transition::Rotated(session) => {
                info!(session_id = %session.session_id, "session rotated");
                self.persist(&session).await;
                self.notify(SessionEvent::Rotated(session)).await;
            }
            Transition::Touched(session) => self.persist(&session).await,
        }
    }

    pub async fn on_background(&self) {
        let now = now_ms();
        let _ = self
            .kv
            .put(
                KEY_BACKGROUND_TIMESTAMP,
                serde_json::json!(now),
                Some(BACKGROUND_TIMESTAMP_TTL),
                false,
            )
            .await;
    }

    /// `on_foreground`: rotates on `BACKGROUND_TIMEOUT` if the background
    /// duration strictly exceeds `background_threshold_ms`; otherwise just
    /// `update_activity`. Duration exactly equal to the threshold does not
    /// rotate.
    pub async fn on_foreground(&self) {
        let config = self.config.current();
        let now = now_ms();
        let background_ts = self
            .kv
            .get(KEY_BACKGROUND_TIMESTAMP)
            .await
            .ok()
            .flatten()
            .and_then(|v| v.as_i64());

        match background_ts {
            Some(ts) if (now - ts) > config.background_threshold_ms as i64 => {
                self.rotate(RotationReason::BackgroundTimeout, now).await;
            }
            _ => self.update_activity().await,
        }
    }

    pub async fn on_auth_change(&self, _user_id: Option<String>) {
        if self.config.current().rotate_on_auth_change {
            self.rotate(RotationReason::AuthChange, now_ms()).await;
        }
    }

    pub async fn on_network_change(&self) {}

    pub async fn force_rotation(&self) {
        self.rotate(RotationReason::ManualRotation, now_ms()).await;
    }

    async fn rotate(&self, reason: RotationReason, now: i64) {
        let config = self.config.current();
        let session = {
            let mut guard = self.inner.write().await;
            apply_rotation(&mut guard.data, &config.session_id_prefix, now, reason)
        };
        info!(session_id = %session.session_id, ?reason, "session rotated");
        self.persist(&session).await;
        self.notify(SessionEvent::Rotated(session)).await;
    }

    async fn persist_and_adopt(&self, session: SessionData) {
        {
            let mut guard = self.inner.write().await;
            guard.data = session.clone();
        }
        self.persist(&session).await;
    }

    async fn persist(&self, session: &SessionData) {
        if let Err(err) = self
            .kv
            .put(
                KEY_CURRENT_SESSION,
                serde_json::to_value(session).unwrap_or(serde_json::Value::Null),
                Some(SESSION_TTL),
                true,
            )
            .await
        {
            warn!(%err, "failed to persist session state");
            self.notify(SessionEvent::Error(err.to_string())).await;
        }
    }

    async fn notify(&self, event: SessionEvent) {
        let listeners = self.inner.read().await.listeners.clone();
        for listener in listeners {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| listener(&event)));
            if result.is_err() {
                warn!("session listener panicked");
            }
        }
    }
}
