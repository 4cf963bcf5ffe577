//! Error taxonomy shared across the engine.
//!
//! Categories are deliberately coarse — they exist so collaborators can log
//! and rate-limit consistently, not to let callers match on fine-grained
//! failure modes. Typed accessors never propagate these; they fall back to
//! the caller-supplied default and log at [`ErrorSeverity::Medium`].

use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;
use tracing::warn;

/// Severity of a logged or surfaced error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Error categories from spec §7. Not exhaustive of Rust's `std::error::Error`
/// zoo by design — these are the buckets the host and the rate limiter key on.
#[derive(Debug, thiserror::Error)]
pub enum CfError {
    #[error("network error: {0}")]
    Network(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("permission error: {0}")]
    Permission(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("invalid state: {0}")]
    State(String),

    #[error("unknown error: {0}")]
    Unknown(String),
}

impl CfError {
    pub fn category(&self) -> &'static str {
        match self {
            CfError::Network(_) => "network",
            CfError::Serialization(_) => "serialization",
            CfError::Validation(_) => "validation",
            CfError::Permission(_) => "permission",
            CfError::Timeout(_) => "timeout",
            CfError::Internal(_) => "internal",
            CfError::State(_) => "state",
            CfError::Unknown(_) => "unknown",
        }
    }
}

pub type Result<T> = std::result::Result<T, CfError>;

/// Logs identical `(category, source, message)` tuples at most 10 times per
/// process lifetime; the 11th occurrence logs a one-time rate-limit marker.
///
/// Grounded on the teacher's use of `dashmap::DashMap` for concurrent shared
/// state (`Cargo.toml` already pulls in `dashmap` for exactly this kind of
/// lock-free counter table).
#[derive(Debug, Default)]
pub struct RateLimitedLogger {
    counts: DashMap<(String, &'static str, String), AtomicU32>,
}

const RATE_LIMIT_THRESHOLD: u32 = 10;

impl RateLimitedLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Logs `message` tagged with `category`/`source`, suppressing repeats
    /// past the threshold and emitting a single rate-limit marker on the
    /// 11th occurrence of a given tuple.
    pub fn log(&self, severity: ErrorSeverity, category: &'static str, source: &str, message: &str) {
        let key = (source.to_string(), category, message.to_string());
        let counter = self
            .counts
            .entry(key)
            .or_insert_with(|| AtomicU32::new(0));
        let seen = counter.fetch_add(1, Ordering::Relaxed) + 1;

        if seen <= RATE_LIMIT_THRESHOLD {
            emit(severity, category, source, message);
        } else if seen == RATE_LIMIT_THRESHOLD + 1 {
            warn!(category, source, "rate-limiting further occurrences of this error");
        }
    }
}

fn emit(severity: ErrorSeverity, category: &'static str, source: &str, message: &str) {
    match severity {
        ErrorSeverity::Low => tracing::debug!(category, source, message),
        ErrorSeverity::Medium => tracing::warn!(category, source, message),
        ErrorSeverity::High | ErrorSeverity::Critical => tracing::error!(category, source, message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limits_after_threshold() {
        let logger = RateLimitedLogger::new();
        for _ in 0..15 {
            logger.log(ErrorSeverity::Medium, "network", "fetcher", "boom");
        }
        let key = ("fetcher".to_string(), "network", "boom".to_string());
        assert_eq!(
            logger.counts.get(&key).unwrap().load(Ordering::Relaxed),
            15
        );
    }

    #[test]
    fn distinct_tuples_counted_independently() {
        let logger = RateLimitedLogger::new();
        logger.log(ErrorSeverity::Low, "network", "fetcher", "a");
        logger.log(ErrorSeverity::Low, "network", "fetcher", "b");
        assert_eq!(logger.counts.len(), 2);
    }
}
