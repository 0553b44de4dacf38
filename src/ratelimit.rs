//! Persistent Rate Limiter (spec §4.5).
//!
//! Primary storage is the `rate_limits` table via `Database::rate_limit_check`,
//! which already runs under an IMMEDIATE transaction. This layer adds the
//! busy/locked retry policy and the in-memory fallback for any other storage
//! error, upgrading back to persistent storage transparently once it stops
//! erroring.

use crate::db::Database;
use crate::types::RateLimitOutcome;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::time::{Duration, sleep};

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("rate limited, resets at {reset_at_ms}")]
    Limited { reset_at_ms: i64, remaining: u32 },
    #[error("rate limiter unavailable")]
    Unavailable,
}

const RETRY_BASE_MS: u64 = 25;
const MAX_RETRIES: u32 = 3;

struct FallbackEntry {
    count: u32,
    window_start_ms: i64,
}

pub struct RateLimiter {
    db: Database,
    fallback: Mutex<HashMap<(String, String), FallbackEntry>>,
}

pub struct LimitSpec {
    pub window_ms: i64,
    pub max_attempts: u32,
    pub bucket: &'static str,
}

impl RateLimiter {
    pub fn new(db: Database) -> Self {
        Self { db, fallback: Mutex::new(HashMap::new()) }
    }

    /// Returns `Ok(outcome)` when the identifier is still within its quota,
    /// `Err(RateLimitError::Limited)` otherwise (spec §4.5 `checkLimit`).
    pub async fn check_limit(&self, identifier: &str, spec: &LimitSpec) -> Result<RateLimitOutcome, RateLimitError> {
        let outcome = match self.check_persistent(identifier, spec).await {
            Ok(outcome) => outcome,
            Err(_) => self.check_fallback(identifier, spec),
        };

        if outcome.allowed {
            Ok(outcome)
        } else {
            Err(RateLimitError::Limited { reset_at_ms: outcome.reset_at_ms, remaining: outcome.remaining })
        }
    }

    async fn check_persistent(&self, identifier: &str, spec: &LimitSpec) -> Result<RateLimitOutcome, RateLimitError> {
        let mut attempt = 0;
        loop {
            match self.db.rate_limit_check(identifier, spec.bucket, spec.window_ms, spec.max_attempts) {
                Ok(outcome) => return Ok(outcome),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::DatabaseBusy || e.code == rusqlite::ErrorCode::DatabaseLocked =>
                {
                    if attempt >= MAX_RETRIES {
                        return Err(RateLimitError::Unavailable);
                    }
                    sleep(Duration::from_millis(RETRY_BASE_MS * 2u64.pow(attempt))).await;
                    attempt += 1;
                }
                Err(_) => return Err(RateLimitError::Unavailable),
            }
        }
    }

    /// In-memory degraded mode: identical window semantics, not shared
    /// across processes (spec §4.5 "Contention handling").
    fn check_fallback(&self, identifier: &str, spec: &LimitSpec) -> RateLimitOutcome {
        let now = Utc::now().timestamp_millis();
        let mut fallback = self.fallback.lock();
        let key = (identifier.to_string(), spec.bucket.to_string());
        let entry = fallback.entry(key).or_insert(FallbackEntry { count: 0, window_start_ms: now });

        if entry.window_start_ms <= now - spec.window_ms {
            entry.count = 0;
            entry.window_start_ms = now;
        }
        entry.count += 1;

        let allowed = entry.count <= spec.max_attempts;
        let remaining = spec.max_attempts.saturating_sub(entry.count);
        RateLimitOutcome {
            allowed,
            count: entry.count,
            remaining,
            reset_at_ms: entry.window_start_ms + spec.window_ms,
        }
    }

    /// Hourly background cleanup: drop rows untouched for 24h (spec §4.5).
    pub async fn run_cleanup_loop(&self) {
        let mut interval = tokio::time::interval(Duration::from_secs(3600));
        loop {
            interval.tick().await;
            if let Err(err) = self.db.cleanup_rate_limits(24 * 3_600_000) {
                tracing::warn!(%err, "rate limit cleanup failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_limiter() -> RateLimiter {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("signer.sqlite")).unwrap();
        RateLimiter::new(db)
    }

    #[tokio::test]
    async fn s6_window_allows_up_to_max_then_blocks() {
        let limiter = temp_limiter();
        let spec = LimitSpec { window_ms: 60_000, max_attempts: 5, bucket: "auth" };

        for _ in 0..5 {
            assert!(limiter.check_limit("1.2.3.4", &spec).await.is_ok());
        }
        let sixth = limiter.check_limit("1.2.3.4", &spec).await;
        assert!(matches!(sixth, Err(RateLimitError::Limited { .. })));
    }

    #[tokio::test]
    async fn separate_identifiers_have_independent_windows() {
        let limiter = temp_limiter();
        let spec = LimitSpec { window_ms: 60_000, max_attempts: 1, bucket: "auth" };

        assert!(limiter.check_limit("a", &spec).await.is_ok());
        assert!(limiter.check_limit("b", &spec).await.is_ok());
    }
}
