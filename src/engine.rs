use axum::http::{HeaderMap, HeaderName, HeaderValue};
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::{sync::Arc, time::Duration, time::Instant};
use tracing::{debug, warn};

use crate::{
    error::Result,
    metrics::Metrics,
    rules::{RateLimitKey, RateLimitRule},
    store::CounterStore,
    utils::{add_duration, seconds_until, Clock, SystemClock},
};

pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
pub const HEADER_RESET: &str = "x-ratelimit-reset";
pub const HEADER_WINDOW: &str = "x-ratelimit-window";

/// Quota state derived from a counter at check time
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitInfo {
    pub limit: u64,
    /// `limit - count`; negative once the window is over quota
    pub remaining: i64,
    #[serde(serialize_with = "serialize_timestamp")]
    pub reset: DateTime<Utc>,
    #[serde(rename = "reset_after_secs", serialize_with = "serialize_secs")]
    pub reset_after: Duration,
    #[serde(rename = "window_secs", serialize_with = "serialize_secs")]
    pub window: Duration,
    /// Synthesised while the store was unavailable
    pub degraded: bool,
}

fn serialize_timestamp<S: Serializer>(at: &DateTime<Utc>, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_i64(at.timestamp())
}

fn serialize_secs<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_secs())
}

impl RateLimitInfo {
    fn from_count(limit: u64, count: u64, ttl: Option<Duration>, window: Duration, now: DateTime<Utc>) -> Self {
        let reset_after = ttl.unwrap_or(window);
        Self {
            limit,
            remaining: limit as i64 - count as i64,
            reset: add_duration(now, reset_after),
            reset_after,
            window,
            degraded: false,
        }
    }

    fn degraded(limit: u64, window: Duration, now: DateTime<Utc>) -> Self {
        Self {
            degraded: true,
            ..Self::from_count(limit, 0, None, window, now)
        }
    }

    /// Remaining quota as exposed to callers, never below zero
    pub fn clamped_remaining(&self) -> u64 {
        self.remaining.max(0) as u64
    }

    /// Seconds until the window resets, rounded up
    pub fn retry_after_secs(&self) -> u64 {
        let millis = self.reset_after.as_millis() as u64;
        (millis + 999) / 1000
    }

    /// Seconds from `now` until the absolute reset time
    pub fn seconds_until_reset(&self, now: DateTime<Utc>) -> u64 {
        seconds_until(now, self.reset)
    }

    /// Stamp the standard rate limit headers onto a response
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        let values = [
            (HEADER_LIMIT, self.limit.to_string()),
            (HEADER_REMAINING, self.clamped_remaining().to_string()),
            (HEADER_RESET, self.reset.timestamp().to_string()),
            (HEADER_WINDOW, self.window.as_secs().to_string()),
        ];
        for (name, value) in values {
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.insert(HeaderName::from_static(name), value);
            }
        }
    }
}

/// Result of one admission check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub admitted: bool,
    pub info: RateLimitInfo,
}

/// Fixed-window counter over a shared store.
///
/// Each check is one atomic create-or-increment, and the decision comes from
/// the returned count. Rejected checks still count against the window, and
/// store failures fail open. Holds no counter state of its own.
#[derive(Clone)]
pub struct AdmissionEngine {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
}

impl AdmissionEngine {
    pub fn new(store: Arc<dyn CounterStore>, metrics: Arc<Metrics>) -> Self {
        Self::with_clock(store, metrics, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(store: Arc<dyn CounterStore>, metrics: Arc<Metrics>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock, metrics }
    }

    /// Count one request against `key` and decide admit/reject.
    ///
    /// Never fails: a store error admits the request with degraded info.
    pub async fn check(&self, key: &RateLimitKey, limit: u64, window: Duration) -> Admission {
        let started = Instant::now();
        let result = self.store.increment_with_expiry(key.as_str(), window).await;
        self.metrics
            .record_store_operation_duration("increment", started.elapsed().as_secs_f64());
        let now = self.clock.now();

        match result {
            Ok(snapshot) => {
                let info = RateLimitInfo::from_count(limit, snapshot.count, snapshot.ttl, window, now);
                let admitted = snapshot.count <= limit;
                debug!(
                    key = %key,
                    count = snapshot.count,
                    limit,
                    admitted,
                    "Admission check"
                );
                Admission { admitted, info }
            }
            Err(e) => {
                self.metrics.record_store_failure("increment");
                warn!(
                    key = %key,
                    error = %e,
                    "Counter store unavailable, failing open"
                );
                Admission {
                    admitted: true,
                    info: RateLimitInfo::degraded(limit, window, now),
                }
            }
        }
    }

    /// Check a rule's counter for one key, recording the outcome per rule
    pub async fn check_rule(&self, rule: &RateLimitRule, key: &RateLimitKey) -> Admission {
        let admission = self.check(key, rule.requests_allowed(), rule.window()).await;
        let outcome = if admission.info.degraded {
            "fail_open"
        } else if admission.admitted {
            "admitted"
        } else {
            "rejected"
        };
        self.metrics.record_check(rule.name(), outcome);
        admission
    }

    /// Current quota for `key` without consuming any
    pub async fn peek(&self, key: &RateLimitKey, limit: u64, window: Duration) -> Result<RateLimitInfo> {
        let count = self.store.get(key.as_str()).await.map_err(|e| {
            self.metrics.record_store_failure("get");
            e
        })?;
        let ttl = match count {
            Some(_) => self.store.ttl(key.as_str()).await.map_err(|e| {
                self.metrics.record_store_failure("ttl");
                e
            })?,
            None => None,
        };

        Ok(RateLimitInfo::from_count(
            limit,
            count.unwrap_or(0),
            ttl,
            window,
            self.clock.now(),
        ))
    }

    /// Reset the counter for `key`
    pub async fn clear(&self, key: &RateLimitKey) -> Result<()> {
        self.store.delete(key.as_str()).await.map_err(|e| {
            self.metrics.record_store_failure("delete");
            e
        })?;
        debug!(key = %key, "Counter cleared");
        Ok(())
    }

    /// Drop counters whose window has ended
    pub async fn purge_expired(&self) -> Result<usize> {
        let purged = self.store.purge_expired().await.map_err(|e| {
            self.metrics.record_store_failure("purge");
            e
        })?;
        debug!(purged, "Purged expired counters");
        Ok(purged)
    }

    pub async fn health_check(&self) -> Result<()> {
        self.store.health_check().await
    }
}
