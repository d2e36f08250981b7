//! HTTP/1.1 client: pooled connections behind an ordered chain of request handlers.

pub mod cache;
pub mod chain;
pub mod connection;
pub mod cookies;
pub mod dispatch;
mod pending;
pub mod pool;
pub mod proxy;
pub mod redirect;
pub mod retry;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use parking_lot::{Mutex, RwLock};
use rustls::client::ClientConfig;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::cookie::CookieJar;
use crate::error::{HttpError, log_exchange_error};
use crate::message::{Request, Response};
use crate::metrics;
use crate::settings::{ClientSettings, FollowRedirects};
use crate::tls::LazyClientConfig;
use crate::transaction_log::TransactionLog;

pub use cache::{CacheHandler, HttpCache};
use chain::HandlerSnapshot;

pub use chain::{
    Capabilities, Exchange, HandlerChain, HandlerSlot, Next, Replayer, RequestHandler,
};
pub use connection::{ClientConnection, ConnectionOptions};
pub use cookies::CookieHandler;
pub use dispatch::{Dispatch, NetworkDispatcher};
pub use pool::{ConnectionPool, PoolKey, PoolOptions, PooledConnection, TcpConnectionPool};
pub use proxy::{ProxyHandler, ProxySettings};
pub use redirect::RedirectHandler;
pub use retry::RetryHandler;

struct ClientInner {
    settings: RwLock<ClientSettings>,
    chain: HandlerChain,
    dispatcher: Arc<dyn Dispatch>,
    pool: Arc<dyn ConnectionPool>,
    cookies: Mutex<Option<Arc<CookieHandler>>>,
    cache: Mutex<Option<Arc<dyn HttpCache>>>,
    tls: Arc<LazyClientConfig>,
    transaction_log: Arc<TransactionLog>,
    closed: AtomicBool,
}

/// Cheaply cloneable handle to a client. Every clone shares the pool, the cookie jar and
/// the handler chain.
#[derive(Clone)]
pub struct HttpClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("handlers", &self.handler_names())
            .field("active", &self.active_count())
            .field("idle", &self.idle_count())
            .finish()
    }
}

impl HttpClient {
    /// Builds a client with the default TCP/TLS pool. Must be called inside a Tokio runtime.
    pub fn new(settings: ClientSettings) -> Result<Self> {
        Self::build(settings, Arc::new(LazyClientConfig::new()), None)
    }

    /// Builds a client that uses `config` for TLS instead of the platform trust store.
    pub fn with_tls_config(settings: ClientSettings, config: Arc<ClientConfig>) -> Result<Self> {
        Self::build(settings, Arc::new(LazyClientConfig::with_config(config)), None)
    }

    /// Builds a client on top of a caller-supplied connection pool.
    pub fn with_pool(settings: ClientSettings, pool: Arc<dyn ConnectionPool>) -> Result<Self> {
        Self::build(settings, Arc::new(LazyClientConfig::new()), Some(pool))
    }

    fn build(
        settings: ClientSettings,
        tls: Arc<LazyClientConfig>,
        pool: Option<Arc<dyn ConnectionPool>>,
    ) -> Result<Self> {
        settings.validate()?;
        let transaction_log = Arc::new(TransactionLog::new(settings.transaction_log_size));
        let pool = pool.unwrap_or_else(|| {
            Arc::new(TcpConnectionPool::new(
                PoolOptions::from_settings(&settings, transaction_log.clone()),
                tls.clone(),
            ))
        });
        let client = Self {
            inner: Arc::new(ClientInner {
                dispatcher: Arc::new(NetworkDispatcher::new(pool.clone())),
                pool,
                chain: HandlerChain::new(),
                cookies: Mutex::new(None),
                cache: Mutex::new(None),
                tls,
                transaction_log,
                closed: AtomicBool::new(false),
                settings: RwLock::new(settings),
            }),
        };
        client.install_cookies();
        client.install_redirect();
        client.install_retry();
        client.install_proxy();
        debug!(handlers = ?client.handler_names(), "http client ready");
        Ok(client)
    }

    pub fn settings(&self) -> ClientSettings {
        self.inner.settings.read().clone()
    }

    /// Runs `request` through the handler chain and returns the response once its head
    /// arrived. The body streams on [`Response::body`].
    pub async fn send(&self, request: Request) -> Result<Response, HttpError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(HttpError::closed("client closed"));
        }
        let host = request.host().to_string();
        let method = request.method.clone();
        let started = Instant::now();
        let result = self.execute(request, self.chain_snapshot()).await;
        match &result {
            Ok(response) => {
                metrics::record_exchange("client", "completed", Some(response.status), started.elapsed())
            }
            Err(err) => {
                log_exchange_error(&host, &method, err);
                metrics::record_exchange("client", err.kind().as_label(), None, started.elapsed());
            }
        }
        result
    }

    pub async fn get(&self, url: &str) -> Result<Response, HttpError> {
        self.send(Request::get(url)?).await
    }

    async fn execute(
        &self,
        request: Request,
        handlers: HandlerSnapshot,
    ) -> Result<Response, HttpError> {
        let next = Next::start(handlers.clone(), self.inner.dispatcher.clone());
        next.run(Exchange::with_handlers(request, self.clone(), handlers)).await
    }

    /// Runs a follow-up request of an exchange through `handlers` on a fresh task.
    pub(crate) async fn replay(
        &self,
        request: Request,
        handlers: HandlerSnapshot,
    ) -> Result<Response, HttpError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(HttpError::closed("client closed"));
        }
        let client = self.clone();
        match tokio::spawn(async move { client.execute(request, handlers).await }).await {
            Ok(result) => result,
            Err(err) => Err(HttpError::Internal(format!("replay task failed: {err}"))),
        }
    }

    pub(crate) fn chain_snapshot(&self) -> HandlerSnapshot {
        self.inner.chain.snapshot()
    }

    pub fn set_follow_redirects(&self, mode: FollowRedirects) {
        self.inner.settings.write().follow_redirects = mode;
        self.install_redirect();
    }

    pub fn set_max_redirects(&self, max: u32) {
        self.inner.settings.write().max_redirects = max;
        self.install_redirect();
    }

    pub fn set_treat_302_as_303(&self, enabled: bool) {
        self.inner.settings.write().treat_302_as_303 = enabled;
        self.install_redirect();
    }

    pub fn set_max_retries(&self, max: u32) {
        self.inner.settings.write().max_retries = max;
        self.install_retry();
    }

    pub fn set_auto_handle_cookies(&self, enabled: bool) {
        self.inner.settings.write().auto_handle_cookies = enabled;
        self.install_cookies();
    }

    /// Routes every request through `proxy`, or directly when `None`.
    pub fn set_proxy(&self, proxy: Option<ProxySettings>) -> Result<()> {
        if let Some(proxy) = &proxy {
            proxy.validate()?;
        }
        self.inner.settings.write().proxy = proxy;
        self.install_proxy();
        Ok(())
    }

    pub fn set_cache(&self, cache: Option<Arc<dyn HttpCache>>) {
        *self.inner.cache.lock() = cache.clone();
        let handler = cache.map(|cache| Arc::new(CacheHandler::new(cache)) as Arc<dyn RequestHandler>);
        self.inner.chain.set(HandlerSlot::Cache, handler);
    }

    /// Adds a handler between the retry and proxy handlers.
    pub fn add_handler(&self, handler: Arc<dyn RequestHandler>) {
        self.inner.chain.add_user_handler(handler);
    }

    pub fn handler_names(&self) -> Vec<&'static str> {
        self.inner.chain.names()
    }

    /// The cookie jar, while automatic cookie handling is on.
    pub fn cookies(&self) -> Option<Arc<CookieJar>> {
        self.inner
            .cookies
            .lock()
            .as_ref()
            .map(|handler| handler.jar().clone())
    }

    pub fn active_count(&self) -> usize {
        self.inner.pool.active_count()
    }

    pub fn idle_count(&self) -> usize {
        self.inner.pool.idle_count()
    }

    pub fn transaction_log(&self) -> &Arc<TransactionLog> {
        &self.inner.transaction_log
    }

    /// Stops background sweeps, destroys the handlers and closes pooled connections. Later
    /// sends fail with [`HttpError::Closed`].
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.cookies.lock().take();
        self.inner.chain.close();
        self.inner.pool.close();
        info!("http client closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn install_cookies(&self) {
        let enabled = self.inner.settings.read().auto_handle_cookies;
        let mut current = self.inner.cookies.lock();
        match (enabled, current.is_some()) {
            (true, false) => {
                let sweep = self.inner.settings.read().cookie_sweep_interval();
                let handler = Arc::new(CookieHandler::new(sweep));
                *current = Some(handler.clone());
                drop(current);
                self.inner.chain.set(HandlerSlot::Cookie, Some(handler));
            }
            (false, true) => {
                current.take();
                drop(current);
                self.inner.chain.set(HandlerSlot::Cookie, None);
            }
            _ => {}
        }
    }

    fn install_redirect(&self) {
        let handler = {
            let settings = self.inner.settings.read();
            (settings.follow_redirects != FollowRedirects::Off).then(|| {
                Arc::new(RedirectHandler::new(
                    settings.follow_redirects,
                    settings.max_redirects,
                    settings.treat_302_as_303,
                    settings.max_replay_buffer_size,
                )) as Arc<dyn RequestHandler>
            })
        };
        self.inner.chain.set(HandlerSlot::Redirect, handler);
    }

    fn install_retry(&self) {
        let handler = {
            let settings = self.inner.settings.read();
            (settings.max_retries > 0).then(|| {
                Arc::new(RetryHandler::new(
                    settings.max_retries,
                    settings.max_replay_buffer_size,
                )) as Arc<dyn RequestHandler>
            })
        };
        self.inner.chain.set(HandlerSlot::Retry, handler);
    }

    fn install_proxy(&self) {
        let handler = {
            let settings = self.inner.settings.read();
            settings.proxy.clone().map(|proxy| {
                Arc::new(ProxyHandler::new(
                    proxy,
                    settings.connect_timeout(),
                    ConnectionOptions::from_settings(&settings, self.inner.transaction_log.clone()),
                    self.inner.tls.clone(),
                )) as Arc<dyn RequestHandler>
            })
        };
        self.inner.chain.set(HandlerSlot::Proxy, handler);
    }
}
