//! HTTP/1.x server: accept loop, per-connection request serving and sessions.

mod compress;
mod connection;
mod exchange;
pub mod session;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::HttpError;
use crate::message::Response;
use crate::settings::ServerSettings;
use crate::transaction_log::TransactionLog;
use crate::util::{ShutdownSignal, ShutdownTrigger, shutdown_channel};
use connection::{ServerContext, serve_connection};
use exchange::SessionConfig;

pub use connection::ContinueTrigger;
pub use exchange::ServerExchange;
pub use session::{InMemorySessionStore, Session, SessionError, SessionManager, SessionStats};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Application logic answering requests.
///
/// An `Err` is answered with an error status (400 for invalid requests, 500 otherwise) and,
/// with `close_on_error`, closes the connection.
#[async_trait]
pub trait ServerHandler: Send + Sync {
    async fn handle(&self, exchange: &mut ServerExchange) -> Result<Response, HttpError>;
}

/// Observes connections as they are accepted and closed.
pub trait ConnectionHandler: Send + Sync {
    /// Returning false closes the connection before any request is read.
    fn on_connect(&self, _peer: SocketAddr, _connection_id: u64) -> bool {
        true
    }

    fn on_disconnect(&self, _peer: SocketAddr, _connection_id: u64) {}
}

pub struct ServerBuilder {
    settings: ServerSettings,
    handler: Arc<dyn ServerHandler>,
    connection_handler: Option<Arc<dyn ConnectionHandler>>,
    sessions: Option<Arc<dyn SessionManager>>,
}

impl ServerBuilder {
    pub fn connection_handler(mut self, handler: Arc<dyn ConnectionHandler>) -> Self {
        self.connection_handler = Some(handler);
        self
    }

    /// Replaces the default [`InMemorySessionStore`].
    pub fn session_manager(mut self, sessions: Arc<dyn SessionManager>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub async fn bind(self) -> Result<HttpServer> {
        let ServerBuilder {
            settings,
            handler,
            connection_handler,
            sessions,
        } = self;
        settings.validate()?;

        let bind_addr = settings.listen;
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("failed to bind listener on {bind_addr}"))?;
        let local_addr = listener.local_addr().unwrap_or(bind_addr);

        let sessions = sessions.unwrap_or_else(|| {
            Arc::new(InMemorySessionStore::new(
                settings.session_max_inactive(),
                settings.session_sweep_interval(),
            ))
        });
        let ctx = Arc::new(ServerContext {
            sessions: SessionConfig {
                manager: sessions,
                cookie_name: settings.session_cookie_name.clone(),
                prefix: settings.session_prefix.clone(),
            },
            transaction_log: Arc::new(TransactionLog::new(settings.transaction_log_size)),
            handler,
            settings,
        });

        let (shutdown, signal) = shutdown_channel();
        let open_connections = Arc::new(AtomicUsize::new(0));
        info!(address = %local_addr, "http server listening");
        let accept_task = tokio::spawn(accept_loop(
            listener,
            local_addr,
            ctx.clone(),
            connection_handler,
            open_connections.clone(),
            signal,
        ));

        Ok(HttpServer {
            local_addr,
            ctx,
            open_connections,
            shutdown,
            accept_task,
        })
    }
}

/// A bound, running server. Dropping it stops accepting and closes idle connections.
pub struct HttpServer {
    local_addr: SocketAddr,
    ctx: Arc<ServerContext>,
    open_connections: Arc<AtomicUsize>,
    shutdown: ShutdownTrigger,
    accept_task: JoinHandle<()>,
}

impl HttpServer {
    pub fn builder(settings: ServerSettings, handler: Arc<dyn ServerHandler>) -> ServerBuilder {
        ServerBuilder {
            settings,
            handler,
            connection_handler: None,
            sessions: None,
        }
    }

    pub async fn bind(settings: ServerSettings, handler: Arc<dyn ServerHandler>) -> Result<Self> {
        Self::builder(settings, handler).bind().await
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.ctx.settings
    }

    pub fn sessions(&self) -> Arc<dyn SessionManager> {
        self.ctx.sessions.manager.clone()
    }

    pub fn transaction_log(&self) -> &TransactionLog {
        &self.ctx.transaction_log
    }

    pub fn open_connections(&self) -> usize {
        self.open_connections.load(Ordering::Relaxed)
    }

    /// Stops accepting, lets in-flight exchanges finish with `Connection: close`, and
    /// invalidates every session.
    pub fn shutdown(&self) {
        if self.shutdown.is_triggered() {
            return;
        }
        self.shutdown.trigger();
        self.ctx.sessions.manager.close();
        info!(address = %self.local_addr, "http server shutting down");
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_triggered() && !self.accept_task.is_finished()
    }
}

impl Drop for HttpServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServer")
            .field("local_addr", &self.local_addr)
            .field("open_connections", &self.open_connections())
            .finish()
    }
}

async fn accept_loop(
    listener: TcpListener,
    local_addr: SocketAddr,
    ctx: Arc<ServerContext>,
    connection_handler: Option<Arc<dyn ConnectionHandler>>,
    open_connections: Arc<AtomicUsize>,
    mut shutdown: ShutdownSignal,
) {
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    error!(error = %err, "failed to accept incoming connection");
                    continue;
                }
            },
            _ = shutdown.wait() => break,
        };
        let connection_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        debug!(peer = %peer, connection_id, "accepted connection");
        if let Err(err) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %err, "failed to set TCP_NODELAY on accepted stream");
        }
        if let Some(handler) = &connection_handler
            && !handler.on_connect(peer, connection_id)
        {
            debug!(peer = %peer, connection_id, "connection rejected by connection handler");
            continue;
        }

        let ctx = ctx.clone();
        let connection_handler = connection_handler.clone();
        let open_connections = open_connections.clone();
        let signal = shutdown.clone();
        open_connections.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            serve_connection(stream, peer, local_addr, connection_id, ctx, signal).await;
            open_connections.fetch_sub(1, Ordering::Relaxed);
            if let Some(handler) = connection_handler {
                handler.on_disconnect(peer, connection_id);
            }
        });
    }
    info!(address = %local_addr, "http server stopped accepting");
}
