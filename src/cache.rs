//! In-process TTL cache.
//!
//! One `CacheService` is built at startup and handed to everything that
//! caches. It is an optimization only: a miss always means "recompute from
//! the store", and no caller relies on it for uniqueness.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

struct CacheEntry {
    value: serde_json::Value,
    created_at: Instant,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Snapshot of cache occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub total: usize,
    pub expired: usize,
    pub active: usize,
}

/// TTL key/value map with serialized mutation.
pub struct CacheService {
    entries: Mutex<HashMap<String, CacheEntry>>,
    default_ttl: Option<Duration>,
}

impl CacheService {
    /// `default_ttl` applies to `set` calls without an explicit TTL;
    /// `None` keeps such entries until deleted.
    pub fn new(default_ttl: Option<Duration>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            default_ttl,
        }
    }

    /// Value for `key`, or `None` when absent or expired. Expired entries
    /// are dropped on read.
    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }

    pub async fn set(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) {
        let now = Instant::now();
        let ttl = ttl.or(self.default_ttl);
        let entry = CacheEntry {
            value,
            created_at: now,
            expires_at: ttl.map(|t| now + t),
        };
        self.entries.lock().await.insert(key.to_string(), entry);
    }

    /// Remove `key`. Returns whether an entry was present.
    pub async fn delete(&self, key: &str) -> bool {
        self.entries.lock().await.remove(key).is_some()
    }

    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }

    /// Cached value, or the factory's value which is then cached.
    ///
    /// The lock is not held while the factory runs, so two concurrent misses
    /// may both compute; the later write wins.
    pub async fn get_or_set<F, Fut, E>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        factory: F,
    ) -> Result<serde_json::Value, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<serde_json::Value, E>>,
    {
        if let Some(hit) = self.get(key).await {
            return Ok(hit);
        }
        let value = factory().await?;
        self.set(key, value.clone(), ttl).await;
        Ok(value)
    }

    /// Typed read. A value that no longer deserializes is treated as a miss.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key).await?;
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(key, error = %e, "Dropping undecodable cache entry");
                self.delete(key).await;
                None
            }
        }
    }

    /// Typed write. Serialization failures skip caching.
    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        match serde_json::to_value(value) {
            Ok(v) => self.set(key, v, ttl).await,
            Err(e) => warn!(key, error = %e, "Skipping cache write"),
        }
    }

    /// Drop every expired entry. Returns how many were removed.
    pub async fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        before - entries.len()
    }

    pub async fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        let expired = entries.values().filter(|e| e.is_expired(now)).count();
        CacheStats {
            total: entries.len(),
            expired,
            active: entries.len() - expired,
        }
    }

    /// Age of the entry under `key`, if present.
    pub async fn age(&self, key: &str) -> Option<Duration> {
        let entries = self.entries.lock().await;
        entries.get(key).map(|e| e.created_at.elapsed())
    }
}

/// Spawn a background task that periodically sweeps expired entries.
pub fn spawn_cleanup_task(
    cache: Arc<CacheService>,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // First tick fires immediately; nothing to sweep yet.
        interval.tick().await;
        loop {
            interval.tick().await;
            let removed = cache.cleanup_expired().await;
            if removed > 0 {
                debug!(removed, "Swept expired cache entries");
            }
        }
    })
}

// ── Key builders ────────────────────────────────────────────────────

pub fn customer_key(platform: &str, platform_user_id: &str) -> String {
    format!("customer:{platform}:{platform_user_id}")
}

pub fn conversation_key(platform: &str, platform_message_id: &str) -> String {
    format!("conversation:{platform}:{platform_message_id}")
}

pub fn history_key(customer_id: i64, limit: usize) -> String {
    format!("conversation_history:{customer_id}:{limit}")
}
