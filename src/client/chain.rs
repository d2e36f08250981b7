use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use super::HttpClient;
use super::connection::ClientConnection;
use super::dispatch::Dispatch;
use crate::error::HttpError;
use crate::message::{Request, Response};

/// What a handler takes part in. The chain only calls the hooks a handler advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// `on_request` is called for every exchange.
    pub request: bool,
    /// `connect` may supply the connection an exchange is sent on.
    pub connect: bool,
    /// `on_init` and `on_destroy` are called on install and shutdown.
    pub lifecycle: bool,
}

impl Capabilities {
    pub const REQUEST: Capabilities = Capabilities {
        request: true,
        connect: false,
        lifecycle: false,
    };
}

/// One request interceptor in a [`HandlerChain`].
#[async_trait]
pub trait RequestHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities {
        Capabilities::REQUEST
    }

    /// Handles the exchange: pass it on with `next.run`, answer it locally, or post-process
    /// the response `next` returns.
    async fn on_request(&self, exchange: Exchange, next: Next) -> Result<Response, HttpError> {
        next.run(exchange).await
    }

    /// Supplies a dedicated connection for the exchange, or `None` to use the pool.
    async fn connect(&self, _exchange: &Exchange) -> Option<Result<ClientConnection, HttpError>> {
        None
    }

    fn on_init(&self) {}

    fn on_destroy(&self) {}
}

/// A request travelling through the chain together with the client that issued it.
pub struct Exchange {
    pub request: Request,
    client: HttpClient,
    handlers: HandlerSnapshot,
}

impl Exchange {
    /// Starts an exchange on the client's current handler chain.
    pub fn new(request: Request, client: HttpClient) -> Self {
        let handlers = client.chain_snapshot();
        Self::with_handlers(request, client, handlers)
    }

    pub(crate) fn with_handlers(
        request: Request,
        client: HttpClient,
        handlers: HandlerSnapshot,
    ) -> Self {
        Self {
            request,
            client,
            handlers,
        }
    }

    pub fn client(&self) -> &HttpClient {
        &self.client
    }

    pub fn into_parts(self) -> (Request, HttpClient) {
        (self.request, self.client)
    }

    /// Handle that re-sends requests through the handlers this exchange started with.
    pub fn replayer(&self) -> Replayer {
        Replayer {
            client: self.client.clone(),
            handlers: self.handlers.clone(),
        }
    }

    pub async fn replay(&self, request: Request) -> Result<Response, HttpError> {
        self.replayer().send(request).await
    }
}

/// Sends follow-up requests (redirect hops, retries) of one exchange.
///
/// Follow-ups run on a fresh task, so a handler never waits on a nested exchange from
/// inside its own call stack. They use the handler snapshot of the originating exchange
/// and are not counted as exchanges of their own.
#[derive(Clone)]
pub struct Replayer {
    client: HttpClient,
    handlers: HandlerSnapshot,
}

impl Replayer {
    pub async fn send(&self, request: Request) -> Result<Response, HttpError> {
        self.client.replay(request, self.handlers.clone()).await
    }
}

pub(crate) type HandlerSnapshot = Arc<[Arc<dyn RequestHandler>]>;

/// Continuation of the chain behind the current handler.
pub struct Next {
    handlers: HandlerSnapshot,
    index: usize,
    dispatcher: Arc<dyn Dispatch>,
}

impl Next {
    pub(crate) fn start(handlers: HandlerSnapshot, dispatcher: Arc<dyn Dispatch>) -> Self {
        Self {
            handlers,
            index: 0,
            dispatcher,
        }
    }

    pub async fn run(self, exchange: Exchange) -> Result<Response, HttpError> {
        let mut index = self.index;
        while let Some(handler) = self.handlers.get(index) {
            if handler.capabilities().request {
                let next = Next {
                    handlers: self.handlers.clone(),
                    index: index + 1,
                    dispatcher: self.dispatcher.clone(),
                };
                return handler.on_request(exchange, next).await;
            }
            index += 1;
        }
        self.dispatcher.dispatch(exchange, &self.handlers).await
    }
}

#[cfg(test)]
struct UnreachableDispatch;

#[cfg(test)]
#[async_trait]
impl Dispatch for UnreachableDispatch {
    async fn dispatch(
        &self,
        _exchange: Exchange,
        _handlers: &[Arc<dyn RequestHandler>],
    ) -> Result<Response, HttpError> {
        Err(HttpError::Internal("no network in this test".to_string()))
    }
}

#[cfg(test)]
impl Next {
    /// Chain over `handlers` whose end fails instead of touching the network.
    pub(crate) fn for_test(handlers: Vec<Arc<dyn RequestHandler>>) -> Self {
        Self::start(Arc::from(handlers), Arc::new(UnreachableDispatch))
    }
}

/// Fixed positions of the built-in handlers. User handlers sit between retry and proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerSlot {
    Cookie,
    Redirect,
    Cache,
    Retry,
    Proxy,
}

#[derive(Default, Clone)]
struct ChainSlots {
    cookie: Option<Arc<dyn RequestHandler>>,
    redirect: Option<Arc<dyn RequestHandler>>,
    cache: Option<Arc<dyn RequestHandler>>,
    retry: Option<Arc<dyn RequestHandler>>,
    user: Vec<Arc<dyn RequestHandler>>,
    proxy: Option<Arc<dyn RequestHandler>>,
}

impl ChainSlots {
    fn slot_mut(&mut self, slot: HandlerSlot) -> &mut Option<Arc<dyn RequestHandler>> {
        match slot {
            HandlerSlot::Cookie => &mut self.cookie,
            HandlerSlot::Redirect => &mut self.redirect,
            HandlerSlot::Cache => &mut self.cache,
            HandlerSlot::Retry => &mut self.retry,
            HandlerSlot::Proxy => &mut self.proxy,
        }
    }

    fn ordered(&self) -> Vec<Arc<dyn RequestHandler>> {
        let mut handlers = Vec::with_capacity(5 + self.user.len());
        handlers.extend(self.cookie.iter().cloned());
        handlers.extend(self.redirect.iter().cloned());
        handlers.extend(self.cache.iter().cloned());
        handlers.extend(self.retry.iter().cloned());
        handlers.extend(self.user.iter().cloned());
        handlers.extend(self.proxy.iter().cloned());
        handlers
    }
}

/// Ordered request handlers: cookie, redirect, cache, retry, user handlers, proxy.
///
/// Every change publishes a new immutable snapshot. Exchanges already running keep the
/// snapshot they started with.
pub struct HandlerChain {
    slots: Mutex<ChainSlots>,
    snapshot: RwLock<HandlerSnapshot>,
}

impl Default for HandlerChain {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerChain {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(ChainSlots::default()),
            snapshot: RwLock::new(Arc::from(Vec::new())),
        }
    }

    pub fn snapshot(&self) -> HandlerSnapshot {
        self.snapshot.read().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.snapshot().iter().map(|handler| handler.name()).collect()
    }

    pub fn is_installed(&self, slot: HandlerSlot) -> bool {
        self.slots.lock().slot_mut(slot).is_some()
    }

    /// Installs or removes the handler in `slot`, replacing any previous one.
    pub fn set(&self, slot: HandlerSlot, handler: Option<Arc<dyn RequestHandler>>) {
        let (removed, added) = {
            let mut slots = self.slots.lock();
            let entry = slots.slot_mut(slot);
            let removed = std::mem::replace(entry, handler.clone());
            self.publish(&slots);
            (removed, handler)
        };
        if let Some(removed) = removed {
            debug!(handler = removed.name(), "request handler removed");
            destroy(&removed);
        }
        if let Some(added) = added {
            debug!(handler = added.name(), ?slot, "request handler installed");
            init(&added);
        }
    }

    pub fn add_user_handler(&self, handler: Arc<dyn RequestHandler>) {
        {
            let mut slots = self.slots.lock();
            slots.user.push(handler.clone());
            self.publish(&slots);
        }
        debug!(handler = handler.name(), "user request handler installed");
        init(&handler);
    }

    /// Calls `on_destroy` on every lifecycle handler and empties the chain.
    pub fn close(&self) {
        let handlers = {
            let mut slots = self.slots.lock();
            let handlers = slots.ordered();
            *slots = ChainSlots::default();
            self.publish(&slots);
            handlers
        };
        for handler in &handlers {
            destroy(handler);
        }
    }

    fn publish(&self, slots: &ChainSlots) {
        *self.snapshot.write() = Arc::from(slots.ordered());
    }
}

fn init(handler: &Arc<dyn RequestHandler>) {
    if handler.capabilities().lifecycle {
        handler.on_init();
    }
}

fn destroy(handler: &Arc<dyn RequestHandler>) {
    if handler.capabilities().lifecycle {
        handler.on_destroy();
    }
}

impl std::fmt::Debug for HandlerChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerChain")
            .field("handlers", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Named {
        name: &'static str,
        inits: AtomicUsize,
        destroys: AtomicUsize,
    }

    impl Named {
        fn new(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                inits: AtomicUsize::new(0),
                destroys: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl RequestHandler for Named {
        fn name(&self) -> &'static str {
            self.name
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities {
                request: true,
                connect: false,
                lifecycle: true,
            }
        }

        fn on_init(&self) {
            self.inits.fetch_add(1, Ordering::SeqCst);
        }

        fn on_destroy(&self) {
            self.destroys.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn handlers_are_kept_in_fixed_order() {
        let chain = HandlerChain::new();
        chain.set(HandlerSlot::Proxy, Some(Named::new("proxy")));
        chain.add_user_handler(Named::new("user"));
        chain.set(HandlerSlot::Retry, Some(Named::new("retry")));
        chain.set(HandlerSlot::Cookie, Some(Named::new("cookie")));
        chain.set(HandlerSlot::Cache, Some(Named::new("cache")));
        chain.set(HandlerSlot::Redirect, Some(Named::new("redirect")));
        assert_eq!(
            chain.names(),
            vec!["cookie", "redirect", "cache", "retry", "user", "proxy"]
        );
    }

    #[test]
    fn old_snapshot_survives_rebuild() {
        let chain = HandlerChain::new();
        chain.set(HandlerSlot::Retry, Some(Named::new("retry")));
        let before = chain.snapshot();
        chain.set(HandlerSlot::Retry, None);
        assert_eq!(before.len(), 1);
        assert!(chain.snapshot().is_empty());
        assert!(!chain.is_installed(HandlerSlot::Retry));
    }

    #[test]
    fn lifecycle_hooks_run_on_install_replace_and_close() {
        let chain = HandlerChain::new();
        let first = Named::new("cookie");
        let second = Named::new("cookie");
        chain.set(HandlerSlot::Cookie, Some(first.clone()));
        chain.set(HandlerSlot::Cookie, Some(second.clone()));
        assert_eq!(first.inits.load(Ordering::SeqCst), 1);
        assert_eq!(first.destroys.load(Ordering::SeqCst), 1);
        chain.close();
        assert_eq!(second.destroys.load(Ordering::SeqCst), 1);
        assert!(chain.names().is_empty());
    }
}
