use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace};

use super::chain::{Exchange, RequestHandler};
use super::pool::{ConnectionPool, PoolKey};
use crate::error::HttpError;
use crate::message::{ProxyRoute, Response};

/// Final step of the handler chain: puts the exchange on a connection.
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn dispatch(
        &self,
        exchange: Exchange,
        handlers: &[Arc<dyn RequestHandler>],
    ) -> Result<Response, HttpError>;
}

/// Sends exchanges over pooled connections, or over a connection supplied by a
/// connect-capable handler.
pub struct NetworkDispatcher {
    pool: Arc<dyn ConnectionPool>,
}

impl NetworkDispatcher {
    pub fn new(pool: Arc<dyn ConnectionPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Dispatch for NetworkDispatcher {
    async fn dispatch(
        &self,
        exchange: Exchange,
        handlers: &[Arc<dyn RequestHandler>],
    ) -> Result<Response, HttpError> {
        for handler in handlers.iter().filter(|handler| handler.capabilities().connect) {
            if let Some(connection) = handler.connect(&exchange).await {
                let connection = connection?;
                trace!(
                    handler = handler.name(),
                    connection_id = connection.id(),
                    "exchange uses handler-supplied connection"
                );
                let (request, _) = exchange.into_parts();
                return connection.send(request).await;
            }
        }

        let (request, _) = exchange.into_parts();
        let key = match request.extensions.get::<ProxyRoute>() {
            Some(route) => PoolKey::new(route.host.clone(), route.port, false),
            None => PoolKey::from_request(&request),
        };
        let pooled = self.pool.acquire(&key).await?;
        debug!(
            pool_key = %key,
            connection_id = pooled.connection.id(),
            reused = pooled.reused,
            method = %request.method,
            "dispatching request"
        );
        let result = pooled.connection.send(request).await;
        let pool = self.pool.clone();
        tokio::spawn(async move {
            pooled.connection.wait_idle().await;
            pool.release(pooled);
        });
        result
    }
}
