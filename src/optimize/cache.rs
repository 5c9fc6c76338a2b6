//! TTL cache for introspected table schemas.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use sync_core::TableSchema;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Default schema TTL: introspection is cheap relative to transfer, but not
/// free, and source DDL rarely changes mid-run.
pub const DEFAULT_SCHEMA_TTL: Duration = Duration::from_secs(300);

struct Entry<V> {
    value: V,
    created_at: Instant,
    expires_at: Instant,
    last_access: Instant,
}

/// String-keyed TTL map with prefix invalidation.
pub struct TtlCache<V> {
    ttl: Duration,
    entries: Mutex<HashMap<String, Entry<V>>>,
}

/// Cache of `(endpoint id, table)` to [`TableSchema`].
pub type SchemaCache = TtlCache<TableSchema>;

/// Cache key for one table under one endpoint.
pub fn schema_key(endpoint_id: &str, table: &str) -> String {
    format!("{endpoint_id}/{table}")
}

impl<V: Clone> TtlCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Fresh cached value for `key`, if present. Stamps last-access.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        match entries.get_mut(key) {
            Some(entry) if entry.expires_at > now => {
                entry.last_access = now;
                Some(entry.value.clone())
            }
            _ => None,
        }
    }

    pub fn insert(&self, key: String, value: V) {
        let now = Instant::now();
        self.entries.lock().unwrap().insert(
            key,
            Entry {
                value,
                created_at: now,
                expires_at: now + self.ttl,
                last_access: now,
            },
        );
    }

    /// Cached value if fresh, else `fetch` and cache the result.
    ///
    /// Concurrent misses on the same key may fetch more than once; the last
    /// insert wins, which is harmless for idempotent introspection.
    pub async fn get_or_fetch<F, Fut>(&self, key: &str, fetch: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }

        let value = fetch().await?;
        self.insert(key.to_string(), value.clone());
        Ok(value)
    }

    /// Drop every entry whose key starts with `prefix`.
    ///
    /// Used when an endpoint is reconfigured and all its cached schemas may
    /// be stale.
    pub fn invalidate_prefix(&self, prefix: &str) {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        let dropped = before - entries.len();
        if dropped > 0 {
            debug!(prefix, dropped, "invalidated cached schemas");
        }
    }

    /// Remove expired entries. Called by the sweeper; exposed for tests.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.entries
            .lock()
            .unwrap()
            .retain(|_, entry| entry.expires_at > now);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    /// Age of the entry under `key`, if cached.
    pub fn entry_age(&self, key: &str) -> Option<Duration> {
        self.entries
            .lock()
            .unwrap()
            .get(key)
            .map(|e| e.created_at.elapsed())
    }

    /// Time since the entry under `key` was last read.
    pub fn idle_for(&self, key: &str) -> Option<Duration> {
        self.entries
            .lock()
            .unwrap()
            .get(key)
            .map(|e| e.last_access.elapsed())
    }
}

/// Spawn the minute-interval expiry sweeper for `cache`.
pub fn spawn_sweeper<V: Clone + Send + 'static>(
    cache: Arc<TtlCache<V>>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = interval.tick() => cache.sweep(),
            }
        }
    })
}
