use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use super::connection::{ClientConnection, ConnectionOptions};
use crate::error::HttpError;
use crate::message::Request;
use crate::metrics;
use crate::settings::ClientSettings;
use crate::tls::LazyClientConfig;
use crate::transaction_log::TransactionLog;
use crate::transport::{Transport, connect_tcp, tls_handshake};
use crate::util::{ShutdownTrigger, shutdown_channel, spawn_sweeper};

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct PoolKey {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl PoolKey {
    pub fn new(host: impl Into<String>, port: u16, tls: bool) -> Self {
        Self {
            host: host.into(),
            port,
            tls,
        }
    }

    pub fn from_request(request: &Request) -> Self {
        Self::new(request.host(), request.port(), request.is_secure())
    }
}

impl std::fmt::Display for PoolKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = if self.tls { "https" } else { "http" };
        write!(f, "{scheme}://{}:{}", self.host, self.port)
    }
}

/// A connection handed out by a pool. `reused` is true when it served an earlier exchange.
#[derive(Debug, Clone)]
pub struct PooledConnection {
    pub key: PoolKey,
    pub connection: ClientConnection,
    pub reused: bool,
}

/// Supplies and recycles client connections keyed by host, port and TLS flag.
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    async fn acquire(&self, key: &PoolKey) -> Result<PooledConnection, HttpError>;

    /// Returns a connection once its exchanges completed. Connections that can no longer
    /// carry requests are closed instead of kept.
    fn release(&self, connection: PooledConnection);

    fn idle_count(&self) -> usize;

    fn active_count(&self) -> usize;

    /// Closes every idle connection and stops background maintenance.
    fn close(&self);
}

#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_life: Duration,
    pub max_idle: NonZeroUsize,
    pub connection: ConnectionOptions,
}

impl PoolOptions {
    pub fn from_settings(settings: &ClientSettings, transaction_log: Arc<TransactionLog>) -> Self {
        Self {
            connect_timeout: settings.connect_timeout(),
            idle_timeout: settings.pooled_idle_timeout(),
            max_life: settings.pooled_max_life(),
            max_idle: settings.max_idle_connections_nonzero(),
            connection: ConnectionOptions::from_settings(settings, transaction_log),
        }
    }
}

struct IdleEntry {
    key: PoolKey,
    connection: ClientConnection,
    idle_since: Instant,
}

struct PoolInner {
    options: PoolOptions,
    idle: Mutex<LruCache<u64, IdleEntry>>,
    active: AtomicUsize,
    tls: Arc<LazyClientConfig>,
}

/// Default pool: opens TCP connections, optionally wrapped in TLS, and keeps an LRU of idle
/// ones bounded by `max_idle`, the idle timeout and the maximum connection life.
pub struct TcpConnectionPool {
    inner: Arc<PoolInner>,
    shutdown: ShutdownTrigger,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl TcpConnectionPool {
    pub fn new(options: PoolOptions, tls: Arc<LazyClientConfig>) -> Self {
        let (shutdown, signal) = shutdown_channel();
        let inner = Arc::new(PoolInner {
            idle: Mutex::new(LruCache::new(options.max_idle)),
            active: AtomicUsize::new(0),
            options,
            tls,
        });
        let sweep_interval = (inner.options.idle_timeout / 2).max(Duration::from_millis(100));
        let weak: Weak<PoolInner> = Arc::downgrade(&inner);
        let sweeper = spawn_sweeper("connection_pool", sweep_interval, signal, move || {
            if let Some(inner) = weak.upgrade() {
                inner.evict_expired();
            }
        });
        Self {
            inner,
            shutdown,
            sweeper: Mutex::new(sweeper),
        }
    }

    pub fn options(&self) -> &PoolOptions {
        &self.inner.options
    }

    /// Opens a fresh connection for `key`, bypassing the idle set.
    pub async fn open(&self, key: &PoolKey) -> Result<ClientConnection, HttpError> {
        self.inner.open(key).await
    }
}

impl PoolInner {
    async fn open(&self, key: &PoolKey) -> Result<ClientConnection, HttpError> {
        let stream = connect_tcp(&key.host, key.port, self.options.connect_timeout).await?;
        let transport = if key.tls {
            let config = self.tls.get()?;
            Transport::Tls(Box::new(tls_handshake(config, &key.host, stream).await?))
        } else {
            Transport::Plain(stream)
        };
        debug!(pool_key = %key, tls = transport.is_tls(), "opened pooled connection");
        Ok(ClientConnection::new(
            transport,
            format!("{}:{}", key.host, key.port),
            self.options.connection.clone(),
        ))
    }

    fn is_fresh(&self, entry: &IdleEntry, now: Instant) -> bool {
        let idle_limit = entry
            .connection
            .peer_idle_timeout()
            .map_or(self.options.idle_timeout, |peer| {
                peer.min(self.options.idle_timeout)
            });
        entry.connection.is_reusable()
            && now.duration_since(entry.idle_since) < idle_limit
            && entry.connection.age() < self.options.max_life
    }

    fn take_idle(&self, key: &PoolKey) -> Option<ClientConnection> {
        let now = Instant::now();
        let mut idle = self.idle.lock();
        loop {
            let id = idle
                .iter()
                .find(|(_, entry)| entry.key == *key)
                .map(|(id, _)| *id)?;
            let entry = idle.pop(&id)?;
            if self.is_fresh(&entry, now) {
                return Some(entry.connection);
            }
            metrics::record_pool_eviction("stale");
            entry.connection.close("stale pooled connection");
        }
    }

    fn evict_expired(&self) {
        let now = Instant::now();
        let expired: Vec<IdleEntry> = {
            let mut idle = self.idle.lock();
            let ids: Vec<u64> = idle
                .iter()
                .filter(|(_, entry)| !self.is_fresh(entry, now))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| idle.pop(&id)).collect()
        };
        for entry in &expired {
            metrics::record_pool_eviction("expired");
            entry.connection.close("idle connection expired");
        }
        if !expired.is_empty() {
            debug!(evicted = expired.len(), "evicted expired pooled connections");
        }
        self.publish_counts();
    }

    fn publish_counts(&self) {
        metrics::set_pool_counts(self.idle.lock().len(), self.active.load(Ordering::Relaxed));
    }
}

#[async_trait]
impl ConnectionPool for TcpConnectionPool {
    async fn acquire(&self, key: &PoolKey) -> Result<PooledConnection, HttpError> {
        let (connection, reused) = match self.inner.take_idle(key) {
            Some(connection) => (connection, true),
            None => (self.inner.open(key).await?, false),
        };
        metrics::record_pool_reuse(reused);
        self.inner.active.fetch_add(1, Ordering::Relaxed);
        self.inner.publish_counts();
        Ok(PooledConnection {
            key: key.clone(),
            connection,
            reused,
        })
    }

    fn release(&self, pooled: PooledConnection) {
        let _ = self
            .inner
            .active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |active| {
                active.checked_sub(1)
            });
        let PooledConnection {
            key, connection, ..
        } = pooled;
        if self.shutdown.is_triggered() || !connection.is_reusable() {
            connection.close("connection not reusable");
        } else {
            let evicted = self.inner.idle.lock().push(
                connection.id(),
                IdleEntry {
                    key,
                    connection,
                    idle_since: Instant::now(),
                },
            );
            if let Some((_, evicted)) = evicted {
                metrics::record_pool_eviction("capacity");
                evicted.connection.close("idle pool full");
            }
        }
        self.inner.publish_counts();
    }

    fn idle_count(&self) -> usize {
        self.inner.idle.lock().len()
    }

    fn active_count(&self) -> usize {
        self.inner.active.load(Ordering::Relaxed)
    }

    fn close(&self) {
        self.shutdown.trigger();
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
        let drained: Vec<IdleEntry> = {
            let mut idle = self.inner.idle.lock();
            let mut drained = Vec::with_capacity(idle.len());
            while let Some((_, entry)) = idle.pop_lru() {
                drained.push(entry);
            }
            drained
        };
        for entry in drained {
            entry.connection.close("pool closed");
        }
        self.inner.publish_counts();
    }
}

impl Drop for TcpConnectionPool {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

impl std::fmt::Debug for TcpConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnectionPool")
            .field("idle", &self.idle_count())
            .field("active", &self.active_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    fn pool(idle_timeout: Duration, max_idle: usize) -> TcpConnectionPool {
        let settings = ClientSettings::default();
        let mut options =
            PoolOptions::from_settings(&settings, Arc::new(TransactionLog::new(0)));
        options.idle_timeout = idle_timeout;
        options.max_idle = NonZeroUsize::new(max_idle).unwrap();
        TcpConnectionPool::new(options, Arc::new(LazyClientConfig::new()))
    }

    /// Accepts connections and answers every request with an empty 200.
    async fn spawn_upstream() -> (u16, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut reader = BufReader::new(stream);
                    let mut line = String::new();
                    loop {
                        line.clear();
                        match reader.read_line(&mut line).await {
                            Ok(0) | Err(_) => return,
                            Ok(_) if line == "\r\n" => {
                                let _ = reader
                                    .get_mut()
                                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
                                    .await;
                            }
                            Ok(_) => {}
                        }
                    }
                });
            }
        });
        (port, accepted)
    }

    #[tokio::test]
    async fn released_connection_is_reused() {
        let (port, accepted) = spawn_upstream().await;
        let pool = pool(Duration::from_secs(30), 4);
        let key = PoolKey::new("127.0.0.1", port, false);

        let first = pool.acquire(&key).await.unwrap();
        assert!(!first.reused);
        assert_eq!(pool.active_count(), 1);
        let url = format!("http://127.0.0.1:{port}/");
        first
            .connection
            .send(Request::get(&url).unwrap())
            .await
            .unwrap();
        first.connection.wait_idle().await;
        pool.release(first);
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.active_count(), 0);

        let second = pool.acquire(&key).await.unwrap();
        assert!(second.reused);
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        pool.release(second);
        pool.close();
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn keys_do_not_share_connections() {
        let (port, _) = spawn_upstream().await;
        let pool = pool(Duration::from_secs(30), 4);
        let plain = pool
            .acquire(&PoolKey::new("127.0.0.1", port, false))
            .await
            .unwrap();
        pool.release(plain);

        let other = pool
            .acquire(&PoolKey::new("localhost", port, false))
            .await
            .unwrap();
        assert!(!other.reused);
    }

    #[tokio::test]
    async fn stale_idle_connection_is_replaced() {
        let (port, accepted) = spawn_upstream().await;
        let pool = pool(Duration::from_millis(50), 4);
        let key = PoolKey::new("127.0.0.1", port, false);
        let first = pool.acquire(&key).await.unwrap();
        pool.release(first);
        tokio::time::sleep(Duration::from_millis(120)).await;

        let second = pool.acquire(&key).await.unwrap();
        assert!(!second.reused);
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn idle_set_is_bounded() {
        let (port, _) = spawn_upstream().await;
        let pool = pool(Duration::from_secs(30), 1);
        let key = PoolKey::new("127.0.0.1", port, false);
        let first = pool.acquire(&key).await.unwrap();
        let second = pool.acquire(&key).await.unwrap();
        let evicted = first.connection.clone();
        pool.release(first);
        pool.release(second);
        assert_eq!(pool.idle_count(), 1);
        assert!(!evicted.is_open());
    }

    #[tokio::test]
    async fn refused_connect_is_a_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let pool = pool(Duration::from_secs(30), 4);
        let err = pool
            .acquire(&PoolKey::new("127.0.0.1", port, false))
            .await
            .unwrap_err();
        assert!(matches!(err, HttpError::Connect { .. }));
        assert_eq!(pool.active_count(), 0);
    }
}
