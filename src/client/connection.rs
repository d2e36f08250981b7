use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use http::header::{CONNECTION, EXPECT, HOST, HeaderValue, USER_AGENT};
use http::{Extensions, StatusCode, Version};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::{Notify, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::pending::{ContinueDecision, ContinueGate, PendingEntry, PendingResponseQueue};
use crate::body::{Body, BodySender};
use crate::codec::{
    AfterStatus, BodyPlan, ResponseHead, determine_response_body_plan, encode_request_head,
    read_body, read_response_head, write_body,
};
use crate::error::{BodyError, HttpError, TimeoutKind};
use crate::logging::{Role, TransactionRecordBuilder};
use crate::message::{ContinueOutcome, Request, Response};
use crate::metrics;
use crate::settings::ClientSettings;
use crate::transaction_log::{ExchangeState, TransactionLog};
use crate::transport::{AsyncIo, BoxedIo};
use crate::util::{ShutdownSignal, ShutdownTrigger, shutdown_channel, watchdog_period};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Per-connection behaviour, usually derived from [`ClientSettings`].
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub response_timeout: Option<Duration>,
    pub body_receive_timeout: Option<Duration>,
    pub continue_timeout: Duration,
    pub close_on_5xx: bool,
    pub max_header_size: usize,
    pub user_agent: Option<String>,
    /// Close after the first response, as done for proxy tunnels.
    pub auto_close: bool,
    pub transaction_log: Arc<TransactionLog>,
}

impl ConnectionOptions {
    pub fn from_settings(settings: &ClientSettings, transaction_log: Arc<TransactionLog>) -> Self {
        Self {
            response_timeout: settings.response_timeout(),
            body_receive_timeout: settings.body_receive_timeout(),
            continue_timeout: settings.continue_timeout(),
            close_on_5xx: settings.close_on_5xx,
            max_header_size: settings.max_header_size,
            user_agent: Some(settings.user_agent.clone()).filter(|agent| !agent.is_empty()),
            auto_close: false,
            transaction_log,
        }
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self::from_settings(
            &ClientSettings::default(),
            Arc::new(TransactionLog::new(0)),
        )
    }
}

struct ConnectionState {
    pending: PendingResponseQueue,
    open: bool,
    persistent: bool,
    /// Exchanges written whose response body has not been fully read yet.
    open_transactions: usize,
    completed: u64,
    idle_timeout: Option<Duration>,
    last_used: Instant,
}

struct ConnectionShared {
    id: u64,
    peer: String,
    writer: Arc<tokio::sync::Mutex<WriteHalf<BoxedIo>>>,
    state: Mutex<ConnectionState>,
    options: ConnectionOptions,
    shutdown: ShutdownTrigger,
    idle: Notify,
    created: Instant,
}

/// Keeps the connection alive while any [`ClientConnection`] clone exists.
struct ConnectionHandle {
    shared: Arc<ConnectionShared>,
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.shared.close_when_idle("connection handle dropped");
    }
}

/// One HTTP/1.1 client connection. Requests may be pipelined: each is written in order and
/// responses are matched to them first in, first out.
#[derive(Clone)]
pub struct ClientConnection {
    handle: Arc<ConnectionHandle>,
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = &self.handle.shared;
        f.debug_struct("ClientConnection")
            .field("id", &shared.id)
            .field("peer", &shared.peer)
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl ClientConnection {
    /// Takes ownership of `io` and starts the response reader. Must be called inside a Tokio
    /// runtime.
    pub fn new<T: AsyncIo>(io: T, peer: impl Into<String>, options: ConnectionOptions) -> Self {
        let boxed: BoxedIo = Box::new(io);
        let (read_half, write_half) = tokio::io::split(boxed);
        let (shutdown, signal) = shutdown_channel();
        let response_timeout = options.response_timeout;
        let shared = Arc::new(ConnectionShared {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer: peer.into(),
            writer: Arc::new(tokio::sync::Mutex::new(write_half)),
            state: Mutex::new(ConnectionState {
                pending: PendingResponseQueue::default(),
                open: true,
                persistent: true,
                open_transactions: 0,
                completed: 0,
                idle_timeout: None,
                last_used: Instant::now(),
            }),
            options,
            shutdown,
            idle: Notify::new(),
            created: Instant::now(),
        });
        metrics::record_connection_opened(Role::Client.as_label());
        debug!(connection_id = shared.id, peer = %shared.peer, "client connection opened");

        tokio::spawn(read_loop(
            shared.clone(),
            BufReader::new(read_half),
            signal.clone(),
        ));
        if let Some(timeout) = response_timeout {
            tokio::spawn(watchdog(Arc::downgrade(&shared), timeout, signal));
        }

        Self {
            handle: Arc::new(ConnectionHandle { shared }),
        }
    }

    pub fn id(&self) -> u64 {
        self.handle.shared.id
    }

    pub fn peer(&self) -> &str {
        &self.handle.shared.peer
    }

    pub fn age(&self) -> Duration {
        self.handle.shared.created.elapsed()
    }

    pub fn is_open(&self) -> bool {
        self.handle.shared.state.lock().open
    }

    /// False once the peer or a request asked for the connection to close after the current
    /// exchanges.
    pub fn is_persistent(&self) -> bool {
        let state = self.handle.shared.state.lock();
        state.open && state.persistent
    }

    pub fn pending_count(&self) -> usize {
        self.handle.shared.state.lock().pending.len()
    }

    pub fn completed_count(&self) -> u64 {
        self.handle.shared.state.lock().completed
    }

    /// Idle timeout announced by the peer through `Keep-Alive: timeout=`.
    pub fn peer_idle_timeout(&self) -> Option<Duration> {
        self.handle.shared.state.lock().idle_timeout
    }

    /// True when the connection is open, persistent and has no exchange in flight.
    pub fn is_reusable(&self) -> bool {
        let state = self.handle.shared.state.lock();
        let expired = state
            .idle_timeout
            .is_some_and(|timeout| state.last_used.elapsed() >= timeout);
        state.open
            && state.persistent
            && state.open_transactions == 0
            && state.pending.is_empty()
            && !expired
    }

    /// Resolves once every exchange written so far has been fully received, or the connection
    /// closed.
    pub async fn wait_idle(&self) {
        let shared = &self.handle.shared;
        loop {
            let notified = shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = shared.state.lock();
                if !state.open || state.open_transactions == 0 {
                    return;
                }
            }
            notified.await;
        }
    }

    pub fn close(&self, reason: &str) {
        self.handle.shared.destroy(reason);
    }

    /// Writes `request` and waits for its response head. The response body streams in the
    /// background; the connection accepts further requests before it completes.
    pub async fn send(&self, mut request: Request) -> Result<Response, HttpError> {
        let shared = self.handle.shared.clone();
        prepare_headers(&mut request, shared.options.user_agent.as_deref())?;

        let plan = BodyPlan::for_outgoing(&request.body, request.version).ok_or_else(|| {
            HttpError::InvalidRequest(
                "HTTP/1.0 request bodies need a known content length".to_string(),
            )
        })?;
        let expects_continue = request
            .headers
            .get(EXPECT)
            .is_some_and(|value| value.as_bytes().eq_ignore_ascii_case(b"100-continue"));
        if expects_continue && plan.is_empty() {
            request.headers.remove(EXPECT);
        }
        let gate = (expects_continue && !plan.is_empty()).then(ContinueGate::new);
        let request_keeps_alive = match request.version {
            Version::HTTP_10 => has_connection_token(&request, "keep-alive"),
            _ => !has_connection_token(&request, "close"),
        };

        let target = request.request_target();
        let head = encode_request_head(
            &request.method,
            &target,
            request.version,
            &request.headers,
            plan,
        );
        let body = std::mem::take(&mut request.body);

        let mut writer = shared.writer.clone().lock_owned().await;

        let (responder, response_rx) = oneshot::channel();
        let log = &shared.options.transaction_log;
        let log_id = log.begin(
            TransactionRecordBuilder::new(Role::Client, shared.id)
                .peer(shared.peer.clone())
                .method(&request.method)
                .target(target.clone())
                .version(request.version),
        );
        {
            let mut state = shared.state.lock();
            if !state.open || !state.persistent {
                drop(state);
                log.finish(log_id, ExchangeState::Failed, Some("connection not reusable"));
                return Err(HttpError::closed("connection no longer accepts requests"));
            }
            state.pending.push(PendingEntry {
                method: request.method.clone(),
                deadline: shared
                    .options
                    .response_timeout
                    .map(|timeout| Instant::now() + timeout),
                responder,
                gate: gate.clone(),
                log_id,
            });
            state.open_transactions += 1;
            state.last_used = Instant::now();
            if !request_keeps_alive {
                state.persistent = false;
            }
        }
        trace!(
            connection_id = shared.id,
            method = %request.method,
            target = %target,
            "writing request head"
        );

        let written = async {
            writer.write_all(&head).await?;
            writer.flush().await
        }
        .await;
        if let Err(err) = written {
            drop(writer);
            shared.destroy(&format!("writing request head failed: {err}"));
        } else if plan.is_empty() {
            drop(writer);
        } else {
            let continue_timeout = shared.options.continue_timeout;
            let mut shutdown = shared.shutdown.signal();
            let body_shared = shared.clone();
            tokio::spawn(async move {
                if let Some(gate) = gate {
                    if gate.wait(continue_timeout).await == ContinueDecision::Skip {
                        drop(writer);
                        body_shared.mark_not_persistent("final response arrived before 100 Continue");
                        return;
                    }
                }
                let outcome = tokio::select! {
                    result = write_body(&mut *writer, body, plan) => result,
                    _ = shutdown.wait() => return,
                };
                drop(writer);
                if let Err(err) = outcome {
                    match err.downcast_ref::<BodyError>() {
                        Some(body_err) => {
                            debug!(connection_id = body_shared.id, error = %body_err, "request body failed");
                        }
                        None => {
                            debug!(connection_id = body_shared.id, error = %err, "writing request body failed");
                        }
                    }
                    body_shared.destroy(&format!("request body not sent: {err:#}"));
                }
            });
        }

        match response_rx.await {
            Ok(result) => result,
            Err(_) => Err(HttpError::closed("connection dropped the exchange")),
        }
    }
}

fn prepare_headers(request: &mut Request, user_agent: Option<&str>) -> Result<(), HttpError> {
    if !request.headers.contains_key(HOST) {
        let host = HeaderValue::from_str(&request.authority())
            .map_err(|_| HttpError::InvalidRequest(format!("invalid host {}", request.host())))?;
        request.headers.insert(HOST, host);
    }
    if let Some(agent) = user_agent
        && !request.headers.contains_key(USER_AGENT)
        && let Ok(value) = HeaderValue::from_str(agent)
    {
        request.headers.insert(USER_AGENT, value);
    }
    Ok(())
}

fn has_connection_token(request: &Request, token: &str) -> bool {
    request.headers.get_all(CONNECTION).iter().any(|value| {
        value.to_str().is_ok_and(|value| {
            value
                .split(',')
                .any(|item| item.trim().eq_ignore_ascii_case(token))
        })
    })
}

impl ConnectionShared {
    fn mark_not_persistent(&self, reason: &str) {
        let close_now = {
            let mut state = self.state.lock();
            state.persistent = false;
            state.open_transactions == 0
        };
        debug!(connection_id = self.id, reason, "connection no longer persistent");
        if close_now {
            self.destroy(reason);
        }
    }

    fn close_when_idle(&self, reason: &str) {
        let idle = {
            let mut state = self.state.lock();
            state.persistent = false;
            state.open_transactions == 0 && state.pending.is_empty()
        };
        if idle {
            self.destroy(reason);
        }
    }

    /// Closes the connection and fails every exchange still waiting for a response head.
    fn destroy(&self, reason: &str) {
        let entries = {
            let mut state = self.state.lock();
            if !state.open {
                return;
            }
            state.open = false;
            state.persistent = false;
            state.pending.take_all()
        };
        self.shutdown.trigger();
        debug!(
            connection_id = self.id,
            peer = %self.peer,
            reason,
            failed_pending = entries.len(),
            "client connection closed"
        );
        for entry in entries {
            self.fail_entry(entry, HttpError::closed(reason.to_string()));
        }
        self.idle.notify_waiters();

        let writer = self.writer.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                let mut writer = writer.lock().await;
                let _ = writer.shutdown().await;
            });
        }
    }

    fn fail_entry(&self, entry: PendingEntry, err: HttpError) {
        if let Some(gate) = &entry.gate {
            gate.on_final_response();
        }
        self.options
            .transaction_log
            .finish(entry.log_id, ExchangeState::Failed, Some(&err.to_string()));
        let _ = entry.responder.send(Err(err));
    }

    fn expire_pending(&self, timeout: Duration) -> bool {
        let expired = {
            let mut state = self.state.lock();
            if !state.pending.has_expired(Instant::now()) {
                return false;
            }
            state.pending.take_all()
        };
        warn!(
            connection_id = self.id,
            peer = %self.peer,
            timeout_ms = timeout.as_millis() as u64,
            "response timeout reached"
        );
        for entry in expired {
            self.fail_entry(
                entry,
                HttpError::Timeout {
                    kind: TimeoutKind::Response,
                    timeout,
                },
            );
        }
        self.destroy("response timeout");
        true
    }

    /// Applies the lifecycle rules of a final response head to the connection state.
    fn apply_response_lifecycle(&self, head: &ResponseHead, plan: BodyPlan) {
        let mut persistent = head.is_persistent();
        if self.options.close_on_5xx && head.status.is_server_error() {
            persistent = false;
        }
        if plan == BodyPlan::UntilClose || self.options.auto_close {
            persistent = false;
        }
        let keep_alive = head.framing.keep_alive;
        if keep_alive.max == Some(0) {
            persistent = false;
        }

        let mut state = self.state.lock();
        if keep_alive.timeout.is_some() {
            state.idle_timeout = keep_alive.timeout;
        }
        if !persistent {
            state.persistent = false;
        }
    }

    /// Marks one exchange fully received. Returns true when the connection should close now.
    fn complete_transaction(&self) -> bool {
        let close = {
            let mut state = self.state.lock();
            state.open_transactions = state.open_transactions.saturating_sub(1);
            state.completed += 1;
            state.last_used = Instant::now();
            !state.persistent && state.open_transactions == 0
        };
        self.idle.notify_waiters();
        close
    }
}

async fn read_loop(
    shared: Arc<ConnectionShared>,
    mut reader: BufReader<ReadHalf<BoxedIo>>,
    mut shutdown: ShutdownSignal,
) {
    let mut sink: Option<BodySender> = None;
    let outcome = tokio::select! {
        result = read_responses(&shared, &mut reader, &mut sink) => result,
        _ = shutdown.wait() => Err(anyhow!("connection shut down")),
    };
    if let Some(tx) = sink.take() {
        let reason = match &outcome {
            Ok(()) => "connection closed".to_string(),
            Err(err) => format!("{err:#}"),
        };
        tx.abort(BodyError::Io(reason)).await;
    }
    match outcome {
        Ok(()) => shared.destroy("connection finished"),
        Err(err) => shared.destroy(&format!("{err:#}")),
    }
}

async fn read_responses(
    shared: &Arc<ConnectionShared>,
    reader: &mut BufReader<ReadHalf<BoxedIo>>,
    sink: &mut Option<BodySender>,
) -> Result<()> {
    loop {
        let available = reader
            .fill_buf()
            .await
            .context("waiting for response data")?;
        if available.is_empty() {
            let idle = shared.state.lock().pending.is_empty();
            if idle {
                return Ok(());
            }
            bail!("peer closed connection");
        }

        let head = match read_response_head(reader, shared.options.max_header_size, None).await
        {
            Ok(head) => head,
            Err(err) => {
                let failure = match err.downcast_ref::<AfterStatus>() {
                    Some(AfterStatus(status)) => {
                        HttpError::framing_with_status(anyhow!("{err:#}"), *status)
                    }
                    None => HttpError::framing(anyhow!("{err:#}")),
                };
                fail_front(shared, failure);
                return Err(err);
            }
        };

        if head.is_interim() {
            trace!(connection_id = shared.id, status = head.status.as_u16(), "interim response");
            if head.status == StatusCode::CONTINUE
                && let Some(gate) = shared
                    .state
                    .lock()
                    .pending
                    .front()
                    .and_then(|entry| entry.gate.clone())
            {
                gate.mark_received();
            }
            continue;
        }

        let entry = shared.state.lock().pending.pop_front();
        let Some(entry) = entry else {
            bail!("unsolicited {} response with no pending request", head.status);
        };

        let continue_outcome = entry
            .gate
            .as_ref()
            .and_then(|gate| gate.on_final_response());
        let plan = determine_response_body_plan(&entry.method, &head);
        shared.apply_response_lifecycle(&head, plan);

        let log = &shared.options.transaction_log;
        let status = head.status;
        log.update(entry.log_id, |record| {
            record.status = Some(status.as_u16());
            record.continue_sent = continue_outcome.map(|outcome| match outcome {
                ContinueOutcome::Received => "received".to_string(),
                ContinueOutcome::Synthetic => "synthetic".to_string(),
            });
        });
        log.transition(entry.log_id, ExchangeState::HeaderReceived);

        let (body_tx, body) = match plan {
            BodyPlan::Empty => (None, Body::empty()),
            BodyPlan::Fixed(length) => {
                let (tx, body) = Body::channel(Some(length));
                (Some(tx), body)
            }
            BodyPlan::Chunked | BodyPlan::UntilClose => {
                let (tx, body) = Body::channel(None);
                (Some(tx), body)
            }
        };
        let mut extensions = Extensions::new();
        if let Some(outcome) = continue_outcome {
            extensions.insert(outcome);
        }
        let response = Response {
            status,
            reason: Some(head.reason).filter(|reason| !reason.is_empty()),
            version: head.version,
            headers: head.headers,
            body,
            extensions,
        };
        if entry.responder.send(Ok(response)).is_err() {
            trace!(connection_id = shared.id, "response receiver gone, draining body");
        }

        *sink = body_tx;
        match read_body(reader, plan, sink, shared.options.body_receive_timeout).await {
            Ok(received) => {
                *sink = None;
                log.update(entry.log_id, |record| record.bytes_received = received);
                log.finish(entry.log_id, ExchangeState::Complete, None);
            }
            Err(err) => {
                let detail = format!("{err:#}");
                if let Some(tx) = sink.take() {
                    tx.abort(BodyError::Io(detail.clone())).await;
                }
                log.finish(entry.log_id, ExchangeState::BodyFailed, Some(&detail));
                return Err(err.context("reading response body"));
            }
        }

        if shared.complete_transaction() || plan == BodyPlan::UntilClose {
            return Ok(());
        }
    }
}

fn fail_front(shared: &ConnectionShared, err: HttpError) {
    let entry = shared.state.lock().pending.pop_front();
    if let Some(entry) = entry {
        shared.fail_entry(entry, err);
    }
}

async fn watchdog(
    shared: std::sync::Weak<ConnectionShared>,
    timeout: Duration,
    mut shutdown: ShutdownSignal,
) {
    let mut ticker = tokio::time::interval(watchdog_period(timeout));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.wait() => return,
        }
        let Some(shared) = shared.upgrade() else {
            return;
        };
        if shared.expire_pending(timeout) {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::Method;
    use tokio::io::{AsyncReadExt, DuplexStream};

    fn options() -> ConnectionOptions {
        ConnectionOptions {
            user_agent: None,
            ..ConnectionOptions::default()
        }
    }

    fn connect(options: ConnectionOptions) -> (ClientConnection, BufReader<DuplexStream>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        (
            ClientConnection::new(client, "test-peer", options),
            BufReader::new(server),
        )
    }

    async fn read_head(server: &mut BufReader<DuplexStream>) -> String {
        let mut head = String::new();
        loop {
            let mut line = String::new();
            let read = server.read_line(&mut line).await.unwrap();
            assert!(read > 0, "client closed before finishing the head");
            head.push_str(&line);
            if line == "\r\n" {
                return head;
            }
        }
    }

    async fn write(server: &mut BufReader<DuplexStream>, raw: &str) {
        server.get_mut().write_all(raw.as_bytes()).await.unwrap();
    }

    #[tokio::test]
    async fn pipelined_responses_match_requests_in_order() {
        let (conn, mut server) = connect(options());
        let first = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send(Request::get("http://example.com/a").unwrap()).await }
        });
        let head = read_head(&mut server).await;
        assert!(head.starts_with("GET /a HTTP/1.1\r\n"));
        assert!(head.contains("host: example.com\r\n"));

        let second = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send(Request::get("http://example.com/b").unwrap()).await }
        });
        let head = read_head(&mut server).await;
        assert!(head.starts_with("GET /b HTTP/1.1\r\n"));
        assert_eq!(conn.pending_count(), 2);

        write(
            &mut server,
            "HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nfirstHTTP/1.1 201 Created\r\nContent-Length: 6\r\n\r\nsecond",
        )
        .await;

        let first = first.await.unwrap().unwrap();
        assert_eq!(first.status, StatusCode::OK);
        assert_eq!(first.body.collect().await.unwrap(), Bytes::from_static(b"first"));
        let second = second.await.unwrap().unwrap();
        assert_eq!(second.status, StatusCode::CREATED);
        assert_eq!(second.body.collect().await.unwrap(), Bytes::from_static(b"second"));

        conn.wait_idle().await;
        assert!(conn.is_reusable());
        assert_eq!(conn.completed_count(), 2);
    }

    #[tokio::test]
    async fn interim_responses_are_skipped() {
        let (conn, mut server) = connect(options());
        let exchange = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send(Request::get("http://example.com/").unwrap()).await }
        });
        read_head(&mut server).await;
        write(
            &mut server,
            "HTTP/1.1 102 Processing\r\n\r\nHTTP/1.1 103 Early Hints\r\nLink: </s.css>\r\n\r\nHTTP/1.1 204 No Content\r\n\r\n",
        )
        .await;
        let response = exchange.await.unwrap().unwrap();
        assert_eq!(response.status, StatusCode::NO_CONTENT);
        assert_eq!(response.continue_outcome(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn body_is_sent_after_synthetic_continue() {
        let (conn, mut server) = connect(options());
        let request = Request::put("http://example.com/upload", "payload")
            .unwrap()
            .with_header(EXPECT, HeaderValue::from_static("100-continue"));
        let exchange = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send(request).await }
        });
        let head = read_head(&mut server).await;
        assert!(head.contains("expect: 100-continue\r\n"));

        let started = Instant::now();
        let mut body = [0u8; 7];
        server.read_exact(&mut body).await.unwrap();
        assert_eq!(&body, b"payload");
        assert!(started.elapsed() >= Duration::from_millis(3000));

        write(&mut server, "HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;
        let response = exchange.await.unwrap().unwrap();
        assert_eq!(response.continue_outcome(), Some(ContinueOutcome::Synthetic));
    }

    #[tokio::test]
    async fn real_continue_releases_body() {
        let (conn, mut server) = connect(options());
        let request = Request::put("http://example.com/upload", "data")
            .unwrap()
            .with_header(EXPECT, HeaderValue::from_static("100-continue"));
        let exchange = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send(request).await }
        });
        read_head(&mut server).await;
        write(&mut server, "HTTP/1.1 100 Continue\r\n\r\n").await;
        let mut body = [0u8; 4];
        server.read_exact(&mut body).await.unwrap();
        assert_eq!(&body, b"data");
        write(&mut server, "HTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n").await;

        let response = exchange.await.unwrap().unwrap();
        assert_eq!(response.status, StatusCode::CREATED);
        assert_eq!(response.continue_outcome(), Some(ContinueOutcome::Received));
        conn.wait_idle().await;
        assert!(conn.is_reusable());
    }

    #[tokio::test]
    async fn final_response_before_continue_skips_body() {
        let (conn, mut server) = connect(options());
        let request = Request::put("http://example.com/upload", "never sent")
            .unwrap()
            .with_header(EXPECT, HeaderValue::from_static("100-continue"));
        let exchange = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send(request).await }
        });
        read_head(&mut server).await;
        write(
            &mut server,
            "HTTP/1.1 417 Expectation Failed\r\nContent-Length: 0\r\n\r\n",
        )
        .await;
        let response = exchange.await.unwrap().unwrap();
        assert_eq!(response.status, StatusCode::EXPECTATION_FAILED);
        assert_eq!(response.continue_outcome(), None);

        let mut rest = Vec::new();
        server.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert!(!conn.is_open());
    }

    #[tokio::test]
    async fn server_error_closes_connection() {
        let (conn, mut server) = connect(options());
        let exchange = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send(Request::get("http://example.com/").unwrap()).await }
        });
        read_head(&mut server).await;
        write(
            &mut server,
            "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 4\r\n\r\nbusy",
        )
        .await;
        let response = exchange.await.unwrap().unwrap();
        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.body.collect().await.unwrap(), Bytes::from_static(b"busy"));
        conn.wait_idle().await;
        assert!(!conn.is_reusable());
        let err = conn
            .send(Request::get("http://example.com/").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, HttpError::Closed(_)));
    }

    #[tokio::test]
    async fn keep_alive_parameters_are_honoured() {
        let (conn, mut server) = connect(options());
        let exchange = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send(Request::get("http://example.com/").unwrap()).await }
        });
        read_head(&mut server).await;
        write(
            &mut server,
            "HTTP/1.1 200 OK\r\nKeep-Alive: timeout=5, max=1\r\nContent-Length: 0\r\n\r\n",
        )
        .await;
        exchange.await.unwrap().unwrap();
        conn.wait_idle().await;
        assert_eq!(conn.peer_idle_timeout(), Some(Duration::from_secs(5)));
        assert!(conn.is_reusable(), "max=1 still allows one more request");
    }

    #[tokio::test]
    async fn keep_alive_max_counts_remaining_requests() {
        let (conn, mut server) = connect(options());
        for remaining in [2, 1, 0] {
            let exchange = tokio::spawn({
                let conn = conn.clone();
                async move { conn.send(Request::get("http://example.com/").unwrap()).await }
            });
            read_head(&mut server).await;
            write(
                &mut server,
                &format!("HTTP/1.1 200 OK\r\nKeep-Alive: timeout=5, max={remaining}\r\nContent-Length: 2\r\n\r\nok"),
            )
            .await;
            let response = exchange.await.unwrap().unwrap();
            assert_eq!(response.body.collect().await.unwrap(), Bytes::from_static(b"ok"));
            conn.wait_idle().await;
            assert_eq!(conn.is_reusable(), remaining > 0, "after max={remaining}");
        }
    }

    #[tokio::test]
    async fn malformed_head_after_error_status_is_final() {
        let (conn, mut server) = connect(options());
        let exchange = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send(Request::get("http://example.com/").unwrap()).await }
        });
        read_head(&mut server).await;
        write(
            &mut server,
            "HTTP/1.1 502 Bad Gateway\r\nContent-Length: 4\r\nContent-Length: 5\r\n\r\n",
        )
        .await;
        let err = exchange.await.unwrap().unwrap_err();
        match &err {
            HttpError::Framing { status, .. } => assert_eq!(*status, Some(StatusCode::BAD_GATEWAY)),
            other => panic!("unexpected error {other}"),
        }
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn malformed_status_line_stays_retryable() {
        let (conn, mut server) = connect(options());
        let exchange = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send(Request::get("http://example.com/").unwrap()).await }
        });
        read_head(&mut server).await;
        write(&mut server, "HTTP/1.1 two-hundred OK\r\n\r\n").await;
        let err = exchange.await.unwrap().unwrap_err();
        assert!(matches!(err, HttpError::Framing { status: None, .. }), "{err}");
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn http10_response_without_keep_alive_is_read_until_close() {
        let (conn, mut server) = connect(options());
        let exchange = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send(Request::get("http://example.com/").unwrap()).await }
        });
        read_head(&mut server).await;
        write(&mut server, "HTTP/1.0 200 OK\r\n\r\nstreamed until close").await;
        drop(server);
        let response = exchange.await.unwrap().unwrap();
        assert_eq!(response.version, Version::HTTP_10);
        assert_eq!(
            response.body.collect().await.unwrap(),
            Bytes::from_static(b"streamed until close")
        );
        conn.wait_idle().await;
        assert!(!conn.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn response_timeout_fails_exchange() {
        let (conn, mut server) = connect(ConnectionOptions {
            response_timeout: Some(Duration::from_secs(1)),
            ..options()
        });
        let exchange = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send(Request::get("http://example.com/slow").unwrap()).await }
        });
        read_head(&mut server).await;
        let err = exchange.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            HttpError::Timeout {
                kind: TimeoutKind::Response,
                ..
            }
        ));
        assert!(!err.is_retryable());
        assert!(!conn.is_open());
    }

    #[tokio::test]
    async fn disconnect_fails_every_pending_exchange() {
        let (conn, mut server) = connect(options());
        let first = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send(Request::get("http://example.com/1").unwrap()).await }
        });
        read_head(&mut server).await;
        let second = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send(Request::get("http://example.com/2").unwrap()).await }
        });
        read_head(&mut server).await;
        drop(server);

        for exchange in [first, second] {
            let err = exchange.await.unwrap().unwrap_err();
            assert!(matches!(err, HttpError::Closed(_)), "{err:?}");
            assert!(err.is_retryable());
        }
    }

    #[tokio::test]
    async fn truncated_body_surfaces_on_the_body() {
        let (conn, mut server) = connect(options());
        let exchange = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send(Request::get("http://example.com/").unwrap()).await }
        });
        read_head(&mut server).await;
        write(&mut server, "HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc").await;
        let response = exchange.await.unwrap().unwrap();
        drop(server);
        let err = response.body.collect().await.unwrap_err();
        assert!(matches!(err, BodyError::Io(_)));
    }

    #[tokio::test]
    async fn http10_request_with_streaming_body_is_rejected() {
        let (conn, _server) = connect(options());
        let (_tx, body) = Body::channel(None);
        let request = Request::new(Method::POST, "http://example.com/".parse().unwrap())
            .with_version(Version::HTTP_10)
            .with_body(body);
        let err = conn.send(request).await.unwrap_err();
        assert!(matches!(err, HttpError::InvalidRequest(_)));
    }
}
