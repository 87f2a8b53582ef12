use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::warn;

use crate::{
    error::Result,
    utils::{add_duration, Clock, SystemClock},
};

/// Counter value and remaining time-to-live right after an increment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub count: u64,
    pub ttl: Option<Duration>,
}

/// Narrow contract the core needs from the shared key-value service.
///
/// The admission engine only talks to the store through this trait, and
/// nothing above it caches counts between requests.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment a counter, creating it at 1 (without expiry) if absent
    async fn increment(&self, key: &str) -> Result<u64>;

    /// Create `key = value` with the given TTL only if the key does not exist.
    /// Exactly one concurrent caller may win.
    async fn set_with_expiry_if_absent(&self, key: &str, value: u64, ttl: Duration) -> Result<bool>;

    /// Remaining time-to-live; `None` when the key is missing or never expires
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;

    /// Current counter value without modifying it
    async fn get(&self, key: &str) -> Result<Option<u64>>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Atomically create-or-increment a counter whose first write sets a TTL
    /// of `window`.
    ///
    /// Stores with a server-side atomic primitive override this. The provided
    /// version composes `set_with_expiry_if_absent` and `increment`: creation
    /// has a single winner, but if the key expires between the two calls the
    /// increment recreates it without a TTL. That case is logged rather than
    /// repaired because the contract has no standalone expire operation.
    async fn increment_with_expiry(&self, key: &str, window: Duration) -> Result<CounterSnapshot> {
        let count = if self.set_with_expiry_if_absent(key, 1, window).await? {
            1
        } else {
            self.increment(key).await?
        };

        let ttl = self.ttl(key).await?;
        if ttl.is_none() {
            warn!(key, count, "Counter has no expiry after increment; window will not reset on its own");
        }

        Ok(CounterSnapshot { count, ttl })
    }

    /// Drop counters whose window has ended and return how many went.
    /// Stores that expire keys server-side keep the default.
    async fn purge_expired(&self) -> Result<usize> {
        Ok(0)
    }

    /// Check that the store is reachable
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct MemoryEntry {
    count: u64,
    expires_at: Option<DateTime<Utc>>,
}

impl MemoryEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }

    fn ttl(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.expires_at.and_then(|at| (at - now).to_std().ok())
    }
}

/// In-process counter store.
///
/// Every operation runs under one mutex, which gives the same per-key
/// atomicity the Redis script provides. Suitable for a single process and
/// for tests; multi-process deployments need the Redis store.
pub struct MemoryCounterStore {
    entries: Mutex<HashMap<String, MemoryEntry>>,
    clock: Arc<dyn Clock>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Number of live counters
    pub async fn len(&self) -> usize {
        let now = self.clock.now();
        let entries = self.entries.lock().await;
        entries.values().filter(|e| !e.is_expired(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn live<'a>(
        entries: &'a mut HashMap<String, MemoryEntry>,
        key: &str,
        now: DateTime<Utc>,
    ) -> Option<&'a mut MemoryEntry> {
        if entries.get(key).map(|e| e.is_expired(now)).unwrap_or(false) {
            entries.remove(key);
        }
        entries.get_mut(key)
    }
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, key: &str) -> Result<u64> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        match Self::live(&mut entries, key, now) {
            Some(entry) => {
                entry.count += 1;
                Ok(entry.count)
            }
            None => {
                entries.insert(key.to_string(), MemoryEntry { count: 1, expires_at: None });
                Ok(1)
            }
        }
    }

    async fn set_with_expiry_if_absent(&self, key: &str, value: u64, ttl: Duration) -> Result<bool> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        if Self::live(&mut entries, key, now).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            MemoryEntry {
                count: value,
                expires_at: Some(add_duration(now, ttl)),
            },
        );
        Ok(true)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        Ok(Self::live(&mut entries, key, now).and_then(|e| e.ttl(now)))
    }

    async fn get(&self, key: &str) -> Result<Option<u64>> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        Ok(Self::live(&mut entries, key, now).map(|e| e.count))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        Ok(before - entries.len())
    }

    async fn increment_with_expiry(&self, key: &str, window: Duration) -> Result<CounterSnapshot> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        let entry = match Self::live(&mut entries, key, now) {
            Some(entry) => {
                entry.count += 1;
                if entry.expires_at.is_none() {
                    entry.expires_at = Some(add_duration(now, window));
                }
                *entry
            }
            None => {
                let entry = MemoryEntry {
                    count: 1,
                    expires_at: Some(add_duration(now, window)),
                };
                entries.insert(key.to_string(), entry);
                entry
            }
        };

        Ok(CounterSnapshot {
            count: entry.count,
            ttl: entry.ttl(now),
        })
    }
}
