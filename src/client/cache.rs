use std::sync::Arc;

use async_trait::async_trait;
use http::Method;
use tracing::trace;

use super::chain::{Exchange, Next, RequestHandler};
use crate::error::HttpError;
use crate::message::{Request, Response};

/// Pluggable response cache. The engine only provides the hook; freshness and validation
/// rules belong to the implementation.
#[async_trait]
pub trait HttpCache: Send + Sync {
    /// A stored response able to answer `request`, if any.
    async fn lookup(&self, request: &Request) -> Option<Response>;

    /// Offered every network response to a cacheable request. Returns the response to hand
    /// to the caller, which may be a copy the cache kept a duplicate of.
    async fn store(&self, request: &Request, response: Response) -> Response;
}

/// Chain slot between redirect and retry that consults an [`HttpCache`] for GET requests.
pub struct CacheHandler {
    cache: Arc<dyn HttpCache>,
}

impl CacheHandler {
    pub fn new(cache: Arc<dyn HttpCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl RequestHandler for CacheHandler {
    fn name(&self) -> &'static str {
        "cache"
    }

    async fn on_request(&self, exchange: Exchange, next: Next) -> Result<Response, HttpError> {
        if exchange.request.method != Method::GET {
            return next.run(exchange).await;
        }
        if let Some(hit) = self.cache.lookup(&exchange.request).await {
            trace!(url = %exchange.request.url, "answered from cache");
            return Ok(hit);
        }
        let head = exchange.request.clone_head();
        let response = next.run(exchange).await?;
        Ok(self.cache.store(&head, response).await)
    }
}
