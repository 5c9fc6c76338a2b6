//! Endpoint-keyed connection pool with TTL-based reaping.
//!
//! The pool is generic over the connection type so the bookkeeping can be
//! exercised without a database server; the driver binding lives in
//! [`crate::mysql`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sync_core::ConnectionDescriptor;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How often the background sweeper scans for expired idle connections.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Default cap on connections per endpoint key.
pub const DEFAULT_MAX_PER_KEY: usize = 8;

/// Default idle TTL.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// A connection the pool can health-check and close.
#[async_trait]
pub trait PooledConn: Send + 'static {
    /// Lightweight liveness round-trip.
    async fn ping(&mut self) -> Result<()>;
    async fn close(self) -> Result<()>;
}

/// Opens new connections for the pool.
#[async_trait]
pub trait ConnectionFactory<C: PooledConn>: Send + Sync + 'static {
    /// Open a connection to `descriptor`, bound to `database` when given
    /// (admin connections pass `None` and stay schema-less).
    async fn connect(&self, descriptor: &ConnectionDescriptor, database: Option<&str>)
        -> Result<C>;
}

/// Pool key: one bucket per (host, port, username, database).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointKey {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub database: Option<String>,
}

impl EndpointKey {
    pub fn new(descriptor: &ConnectionDescriptor, database: Option<&str>) -> Self {
        Self {
            host: descriptor.host.clone(),
            port: descriptor.port,
            username: descriptor.username.clone(),
            database: database.map(str::to_string),
        }
    }
}

impl std::fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}@{}:{}/{}",
            self.username,
            self.host,
            self.port,
            self.database.as_deref().unwrap_or("")
        )
    }
}

struct IdleEntry<C> {
    conn: C,
    last_used: Instant,
}

struct PoolState<C> {
    idle: HashMap<EndpointKey, Vec<IdleEntry<C>>>,
    in_use: HashMap<EndpointKey, usize>,
}

/// Connection pool keyed by endpoint.
///
/// A checked-out connection is owned by its caller until [`release`]d, so
/// it can never be handed to a second caller. Idle entries are ping-checked
/// before reuse; dead or expired ones are closed and replaced.
///
/// [`release`]: ConnectionPool::release
pub struct ConnectionPool<C: PooledConn, F: ConnectionFactory<C>> {
    factory: F,
    max_per_key: usize,
    ttl: Duration,
    state: Mutex<PoolState<C>>,
}

impl<C: PooledConn, F: ConnectionFactory<C>> ConnectionPool<C, F> {
    pub fn new(factory: F, max_per_key: usize, ttl: Duration) -> Self {
        Self {
            factory,
            max_per_key,
            ttl,
            state: Mutex::new(PoolState {
                idle: HashMap::new(),
                in_use: HashMap::new(),
            }),
        }
    }

    pub fn with_defaults(factory: F) -> Self {
        Self::new(factory, DEFAULT_MAX_PER_KEY, DEFAULT_TTL)
    }

    /// Check out a connection for `descriptor` bound to `database`.
    ///
    /// Reuses a healthy idle connection under the key when one exists,
    /// otherwise opens a new one while the key is under its cap.
    pub async fn get(
        &self,
        token: &CancellationToken,
        descriptor: &ConnectionDescriptor,
        database: Option<&str>,
    ) -> Result<(EndpointKey, C)> {
        let key = EndpointKey::new(descriptor, database);

        // Try idle entries one at a time; the lock is never held across an
        // await, so each candidate is popped, then checked outside the lock.
        loop {
            let candidate = {
                let mut state = self.state.lock().unwrap();
                state.idle.get_mut(&key).and_then(Vec::pop)
            };

            let Some(entry) = candidate else { break };

            if entry.last_used.elapsed() > self.ttl {
                debug!(endpoint = %key, "closing expired idle connection");
                let _ = entry.conn.close().await;
                continue;
            }

            let mut conn = entry.conn;
            match conn.ping().await {
                Ok(()) => {
                    let mut state = self.state.lock().unwrap();
                    *state.in_use.entry(key.clone()).or_insert(0) += 1;
                    return Ok((key, conn));
                }
                Err(e) => {
                    debug!(endpoint = %key, "discarding dead pooled connection: {e:#}");
                    let _ = conn.close().await;
                }
            }
        }

        // No reusable idle connection: reserve a slot and dial.
        {
            let mut state = self.state.lock().unwrap();
            let used = state.in_use.get(&key).copied().unwrap_or(0);
            if used >= self.max_per_key {
                bail!("connection pool exhausted for {key}");
            }
            *state.in_use.entry(key.clone()).or_insert(0) += 1;
        }

        let connected = tokio::select! {
            _ = token.cancelled() => Err(anyhow::anyhow!("connection acquisition cancelled")),
            result = self.factory.connect(descriptor, database) => result,
        };

        match connected {
            Ok(conn) => Ok((key, conn)),
            Err(e) => {
                let mut state = self.state.lock().unwrap();
                if let Some(count) = state.in_use.get_mut(&key) {
                    *count = count.saturating_sub(1);
                }
                Err(e).with_context(|| format!("failed to connect to {key}"))
            }
        }
    }

    /// Return a connection to the idle set and stamp its last-used time.
    pub fn release(&self, key: &EndpointKey, conn: C) {
        let mut state = self.state.lock().unwrap();
        if let Some(count) = state.in_use.get_mut(key) {
            *count = count.saturating_sub(1);
        }
        state
            .idle
            .entry(key.clone())
            .or_default()
            .push(IdleEntry {
                conn,
                last_used: Instant::now(),
            });
    }

    /// Drop a connection that should not be reused (caller observed it
    /// failing). The slot is freed without returning the handle.
    pub async fn discard(&self, key: &EndpointKey, conn: C) {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(count) = state.in_use.get_mut(key) {
                *count = count.saturating_sub(1);
            }
        }
        let _ = conn.close().await;
    }

    /// Close idle entries whose last use is older than the TTL.
    ///
    /// Called by the background sweeper; exposed for tests.
    pub async fn sweep_idle(&self) {
        let expired: Vec<C> = {
            let mut state = self.state.lock().unwrap();
            let mut out = Vec::new();
            for entries in state.idle.values_mut() {
                let mut keep = Vec::with_capacity(entries.len());
                for entry in entries.drain(..) {
                    if entry.last_used.elapsed() > self.ttl {
                        out.push(entry.conn);
                    } else {
                        keep.push(entry);
                    }
                }
                *entries = keep;
            }
            out
        };

        if !expired.is_empty() {
            debug!(count = expired.len(), "sweeping expired idle connections");
        }
        for conn in expired {
            let _ = conn.close().await;
        }
    }

    /// Idle connection count across all keys.
    pub fn idle_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.idle.values().map(Vec::len).sum()
    }

    /// Checked-out connection count across all keys.
    pub fn in_use_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.in_use.values().sum()
    }

    /// Close every idle connection. In-flight ones close when discarded.
    pub async fn shutdown(&self) {
        let all: Vec<C> = {
            let mut state = self.state.lock().unwrap();
            state
                .idle
                .drain()
                .flat_map(|(_, entries)| entries.into_iter().map(|e| e.conn))
                .collect()
        };
        for conn in all {
            let _ = conn.close().await;
        }
    }
}

/// Spawn the minute-interval sweeper for `pool`.
pub fn spawn_sweeper<C, F>(
    pool: Arc<ConnectionPool<C, F>>,
    token: CancellationToken,
) -> JoinHandle<()>
where
    C: PooledConn,
    F: ConnectionFactory<C>,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    pool.shutdown().await;
                    return;
                }
                _ = interval.tick() => pool.sweep_idle().await,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Debug)]
    struct FakeConn {
        id: usize,
        healthy: Arc<AtomicBool>,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PooledConn for FakeConn {
        async fn ping(&mut self) -> Result<()> {
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                bail!("connection reset by peer")
            }
        }

        async fn close(self) -> Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeFactory {
        dialed: AtomicUsize,
        healthy: Arc<AtomicBool>,
        closed: Arc<AtomicUsize>,
    }

    impl FakeFactory {
        fn new() -> Self {
            Self {
                dialed: AtomicUsize::new(0),
                healthy: Arc::new(AtomicBool::new(true)),
                closed: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl ConnectionFactory<FakeConn> for Arc<FakeFactory> {
        async fn connect(
            &self,
            _descriptor: &ConnectionDescriptor,
            _database: Option<&str>,
        ) -> Result<FakeConn> {
            Ok(FakeConn {
                id: self.dialed.fetch_add(1, Ordering::SeqCst),
                healthy: self.healthy.clone(),
                closed: self.closed.clone(),
            })
        }
    }

    fn descriptor() -> ConnectionDescriptor {
        ConnectionDescriptor {
            id: "src".to_string(),
            host: "db.example".to_string(),
            port: 3306,
            username: "sync".to_string(),
            password: "secret".to_string(),
            database: "appdb".to_string(),
            use_tls: false,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_reuses_released_connection() {
        let factory = Arc::new(FakeFactory::new());
        let pool = ConnectionPool::new(factory.clone(), 4, DEFAULT_TTL);
        let token = CancellationToken::new();

        let (key, conn) = pool.get(&token, &descriptor(), Some("appdb")).await.unwrap();
        let first_id = conn.id;
        pool.release(&key, conn);

        let (_, conn) = pool.get(&token, &descriptor(), Some("appdb")).await.unwrap();
        assert_eq!(conn.id, first_id);
        assert_eq!(factory.dialed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_separate_databases_get_separate_keys() {
        let factory = Arc::new(FakeFactory::new());
        let pool = ConnectionPool::new(factory.clone(), 4, DEFAULT_TTL);
        let token = CancellationToken::new();

        let (key_a, conn_a) = pool.get(&token, &descriptor(), Some("a")).await.unwrap();
        let (key_b, conn_b) = pool.get(&token, &descriptor(), Some("b")).await.unwrap();
        assert_ne!(key_a, key_b);
        assert_eq!(factory.dialed.load(Ordering::SeqCst), 2);

        pool.release(&key_a, conn_a);
        pool.release(&key_b, conn_b);
        assert_eq!(pool.idle_count(), 2);
    }

    #[tokio::test]
    async fn test_dead_idle_connection_is_replaced() {
        let factory = Arc::new(FakeFactory::new());
        let pool = ConnectionPool::new(factory.clone(), 4, DEFAULT_TTL);
        let token = CancellationToken::new();

        let (key, conn) = pool.get(&token, &descriptor(), Some("appdb")).await.unwrap();
        pool.release(&key, conn);

        // The idle connection dies; the next get dials a fresh one.
        factory.healthy.store(false, Ordering::SeqCst);
        let (_, conn) = pool.get(&token, &descriptor(), Some("appdb")).await.unwrap();
        assert_eq!(conn.id, 1);
        assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_capacity_is_enforced() {
        let factory = Arc::new(FakeFactory::new());
        let pool = ConnectionPool::new(factory.clone(), 2, DEFAULT_TTL);
        let token = CancellationToken::new();

        let a = pool.get(&token, &descriptor(), Some("appdb")).await.unwrap();
        let _b = pool.get(&token, &descriptor(), Some("appdb")).await.unwrap();
        let err = pool
            .get(&token, &descriptor(), Some("appdb"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("pool exhausted"));

        // Releasing frees the slot again.
        pool.release(&a.0, a.1);
        assert!(pool.get(&token, &descriptor(), Some("appdb")).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_closes_expired_idle() {
        let factory = Arc::new(FakeFactory::new());
        let pool = ConnectionPool::new(factory.clone(), 4, Duration::from_secs(60));
        let token = CancellationToken::new();

        let (key, conn) = pool.get(&token, &descriptor(), Some("appdb")).await.unwrap();
        pool.release(&key, conn);
        assert_eq!(pool.idle_count(), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        pool.sweep_idle().await;

        assert_eq!(pool.idle_count(), 0);
        assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_idle_survives_sweep() {
        let factory = Arc::new(FakeFactory::new());
        let pool = ConnectionPool::new(factory.clone(), 4, Duration::from_secs(60));
        let token = CancellationToken::new();

        let (key, conn) = pool.get(&token, &descriptor(), Some("appdb")).await.unwrap();
        pool.release(&key, conn);

        tokio::time::advance(Duration::from_secs(30)).await;
        pool.sweep_idle().await;
        assert_eq!(pool.idle_count(), 1);
    }
}
