use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use http::header::{CONNECTION, HOST};
use http::{HeaderMap, Method, StatusCode, Version};
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use url::Url;

use super::ServerHandler;
use super::compress;
use super::exchange::{ServerExchange, SessionConfig};
use crate::body::{Body, BodySender};
use crate::codec::{
    BodyPlan, ConnectionDirective, RequestHead, encode_response_head, read_body,
    read_request_head, write_body,
};
use crate::error::{BodyError, HttpError};
use crate::logging::{Role, TransactionRecordBuilder};
use crate::message::{Request, Response};
use crate::metrics;
use crate::settings::ServerSettings;
use crate::transaction_log::{ExchangeState, TransactionLog};
use crate::transport::AsyncIo;
use crate::util::ShutdownSignal;

const CONTINUE_RESPONSE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// What released the `100 Continue` of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinueTrigger {
    /// The handler started reading the request body.
    BodyRead,
    /// The handler called [`ServerExchange::send_continue`].
    Explicit,
    /// The continue timeout elapsed first; the 100 was generated automatically.
    Timeout,
}

impl ContinueTrigger {
    pub fn as_label(&self) -> &'static str {
        match self {
            ContinueTrigger::BodyRead => "body_read",
            ContinueTrigger::Explicit => "explicit",
            ContinueTrigger::Timeout => "auto",
        }
    }
}

/// State shared by every connection of one server.
pub(crate) struct ServerContext {
    pub settings: ServerSettings,
    pub handler: Arc<dyn ServerHandler>,
    pub sessions: SessionConfig,
    pub transaction_log: Arc<TransactionLog>,
}

/// Holds back the request body of an `Expect: 100-continue` request until the handler wants
/// it, the continue timeout fires, or the final response makes the body moot.
struct ContinueGate {
    first_read: oneshot::Receiver<()>,
    explicit: oneshot::Receiver<()>,
    cancel: oneshot::Receiver<()>,
    timeout: Duration,
    sent: Arc<OnceLock<ContinueTrigger>>,
}

impl ContinueGate {
    /// Returns `None` when the gate was cancelled before a 100 was due.
    async fn open(self) -> Option<ContinueTrigger> {
        let ContinueGate {
            first_read,
            explicit,
            cancel,
            timeout,
            sent,
        } = self;
        let trigger = tokio::select! {
            biased;
            Ok(()) = cancel => return None,
            Ok(()) = first_read => ContinueTrigger::BodyRead,
            Ok(()) = explicit => ContinueTrigger::Explicit,
            _ = tokio::time::sleep(timeout) => ContinueTrigger::Timeout,
        };
        let _ = sent.set(trigger);
        Some(trigger)
    }
}

/// Reads one request body into `sink`, sending the `100 Continue` first when gated.
async fn pump_body<R, W>(
    reader: &mut R,
    writer: &Mutex<&mut W>,
    plan: BodyPlan,
    sink: Option<BodySender>,
    gate: Option<ContinueGate>,
    timeout: Option<Duration>,
) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut sink = sink;
    if sink.is_none() {
        return Ok(0);
    }
    if let Some(gate) = gate {
        let Some(trigger) = gate.open().await else {
            if let Some(tx) = sink.take() {
                tx.abort(BodyError::Aborted(
                    "final response sent before 100 Continue".to_string(),
                ))
                .await;
            }
            return Ok(0);
        };
        let mut writer = writer.lock().await;
        writer
            .write_all(CONTINUE_RESPONSE)
            .await
            .context("writing 100 Continue")?;
        writer.flush().await.context("flushing 100 Continue")?;
        trace!(trigger = trigger.as_label(), "sent 100 Continue");
    }
    match read_body(reader, plan, &mut sink, timeout).await {
        Ok(read) => Ok(read),
        Err(err) => {
            if let Some(tx) = sink.take() {
                tx.abort(BodyError::Io(format!("{err:#}"))).await;
            }
            Err(err)
        }
    }
}

/// Wire framing chosen for a response body.
struct Framed {
    plan: BodyPlan,
    declared: Option<u64>,
    /// Bytes already taken from `body` while deciding how to frame it.
    prefix: Option<Bytes>,
    body: Body,
}

impl Framed {
    fn new(plan: BodyPlan, body: Body) -> Self {
        Self {
            plan,
            declared: None,
            prefix: None,
            body,
        }
    }
}

fn status_allows_body(status: StatusCode) -> bool {
    !(status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED)
}

/// HTTP/1.0 peers cannot receive chunked data: a body of unknown length is buffered up to
/// `limit` and sent with a length, or sent close-delimited when it is larger.
async fn downgrade(mut body: Body, limit: usize) -> Result<Framed, BodyError> {
    let mut buffered = BytesMut::new();
    while let Some(chunk) = body.chunk().await {
        buffered.extend_from_slice(&chunk?);
        if buffered.len() > limit {
            debug!(limit, "response exceeds downgrade buffer, sending until close");
            return Ok(Framed {
                plan: BodyPlan::UntilClose,
                declared: None,
                prefix: Some(buffered.freeze()),
                body,
            });
        }
    }
    let data = buffered.freeze();
    let plan = if data.is_empty() {
        BodyPlan::Empty
    } else {
        BodyPlan::Fixed(data.len() as u64)
    };
    Ok(Framed::new(plan, Body::full(data)))
}

async fn frame_body(
    body: Body,
    version: Version,
    method: &Method,
    status: StatusCode,
    downgrade_limit: usize,
) -> Result<Framed, BodyError> {
    if *method == Method::HEAD {
        let declared = body.content_length();
        let mut framed = Framed::new(BodyPlan::Empty, Body::empty());
        framed.declared = declared;
        return Ok(framed);
    }
    if !status_allows_body(status) {
        return Ok(Framed::new(BodyPlan::Empty, Body::empty()));
    }
    match BodyPlan::for_outgoing(&body, version) {
        Some(plan) => Ok(Framed::new(plan, body)),
        None => downgrade(body, downgrade_limit).await,
    }
}

fn error_body(status: StatusCode) -> Body {
    Body::from(format!(
        "{} {}\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    ))
}

fn error_response(err: &HttpError) -> Response {
    let status = match err {
        HttpError::InvalidRequest(_) | HttpError::Body(_) => StatusCode::BAD_REQUEST,
        HttpError::Framing { status, .. } => status.unwrap_or(StatusCode::BAD_REQUEST),
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    Response::new(status).with_body(error_body(status))
}

fn has_connection_token(headers: &HeaderMap, token: &str) -> bool {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|item| item.trim().eq_ignore_ascii_case(token))
}

/// Writes a bodyless-request error and closes; used before an exchange exists.
async fn write_error<W>(writer: &mut W, version: Version, status: StatusCode) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let reason = status.canonical_reason().unwrap_or("");
    let body = format!("{} {reason}\n", status.as_u16());
    let head = encode_response_head(
        version,
        status,
        reason,
        &HeaderMap::new(),
        BodyPlan::Fixed(body.len() as u64),
        None,
        ConnectionDirective::Close,
    );
    writer.write_all(&head).await.context("writing error head")?;
    writer
        .write_all(body.as_bytes())
        .await
        .context("writing error body")?;
    writer.flush().await.context("flushing error response")?;
    Ok(())
}

fn request_url(head: &RequestHead, local: SocketAddr) -> Result<Url, String> {
    let target = head.target.as_str();
    if target.starts_with("http://") || target.starts_with("https://") {
        return Url::parse(target).map_err(|err| format!("invalid request target {target}: {err}"));
    }
    let path = match target {
        "*" => "/",
        path if path.starts_with('/') => path,
        other => return Err(format!("unsupported request target {other}")),
    };
    let host = match head.headers.get(HOST) {
        Some(value) => value
            .to_str()
            .map_err(|_| "Host header is not valid text".to_string())?
            .to_string(),
        None if head.version == Version::HTTP_10 => local.to_string(),
        None => return Err("HTTP/1.1 request without Host header".to_string()),
    };
    Url::parse(&format!("http://{host}{path}"))
        .map_err(|err| format!("invalid request URL for host {host}: {err}"))
}

struct Outgoing {
    version: Version,
    method: Method,
    response: Response,
    close: bool,
    keep_alive_max: Option<u32>,
    keep_alive_timeout: Option<Duration>,
    downgrade_limit: usize,
    compress_threshold: Option<usize>,
}

/// Writes the response head and body. Returns the status actually sent and whether the
/// connection has to close afterwards.
async fn send_response<W>(writer: &Mutex<&mut W>, outgoing: Outgoing) -> Result<(StatusCode, bool)>
where
    W: AsyncWrite + Unpin,
{
    let Outgoing {
        version,
        method,
        mut response,
        close,
        keep_alive_max,
        keep_alive_timeout,
        downgrade_limit,
        compress_threshold,
    } = outgoing;
    let body = std::mem::take(&mut response.body);
    let body = match compress_threshold {
        Some(threshold) if compress::is_eligible(version, &method, &response) => {
            compress::auto_compress(&mut response.headers, body, threshold).await
        }
        _ => Ok(body),
    };
    let framed = match body {
        Ok(body) => frame_body(body, version, &method, response.status, downgrade_limit).await,
        Err(err) => Err(err),
    };
    let (framed, close) = match framed {
        Ok(framed) => {
            let close = close || framed.plan == BodyPlan::UntilClose;
            (framed, close)
        }
        Err(err) => {
            warn!(error = %err, "response body failed before the head was sent");
            response = Response::new(StatusCode::INTERNAL_SERVER_ERROR);
            let body = error_body(response.status);
            let plan = BodyPlan::for_outgoing(&body, version).unwrap_or(BodyPlan::Empty);
            (Framed::new(plan, body), true)
        }
    };

    let directive = if close {
        ConnectionDirective::Close
    } else {
        ConnectionDirective::KeepAlive {
            explicit: version == Version::HTTP_10,
            max: keep_alive_max,
            timeout: keep_alive_timeout,
        }
    };
    let head = encode_response_head(
        version,
        response.status,
        response.reason_phrase(),
        &response.headers,
        framed.plan,
        framed.declared,
        directive,
    );

    let mut writer = writer.lock().await;
    writer
        .write_all(&head)
        .await
        .context("writing response head")?;
    if let Some(prefix) = framed.prefix {
        writer
            .write_all(&prefix)
            .await
            .context("writing buffered response body")?;
    }
    write_body(&mut **writer, framed.body, framed.plan).await?;
    Ok((response.status, close))
}

struct ServerConnection<T: AsyncIo> {
    id: u64,
    peer: SocketAddr,
    local: SocketAddr,
    reader: BufReader<ReadHalf<T>>,
    writer: WriteHalf<T>,
    ctx: Arc<ServerContext>,
    served: u32,
}

impl<T: AsyncIo> ServerConnection<T> {
    fn keep_alive_max(&self) -> Option<u32> {
        self.ctx
            .settings
            .max_transactions
            .map(|max| max.saturating_sub(self.served))
    }

    fn limit_reached(&self) -> bool {
        self.ctx
            .settings
            .max_transactions
            .is_some_and(|max| self.served >= max)
    }

    /// Serves one exchange. Returns whether the connection stays open for the next request.
    async fn serve_exchange(&mut self, head: RequestHead, draining: bool) -> Result<bool> {
        let ctx = self.ctx.clone();
        let settings = &ctx.settings;
        let log = &ctx.transaction_log;
        let started = Instant::now();
        self.served += 1;
        let keep_alive_max = self.keep_alive_max();
        let limit_reached = self.limit_reached();

        let log_id = log.begin(
            TransactionRecordBuilder::new(Role::Server, self.id)
                .peer(self.peer.to_string())
                .method(&head.method)
                .target(head.target.clone())
                .version(head.version),
        );
        log.transition(log_id, ExchangeState::HeaderReceived);

        let url = match request_url(&head, self.local) {
            Ok(url) => url,
            Err(reason) => {
                debug!(connection_id = self.id, peer = %self.peer, error = %reason, "rejecting request");
                write_error(&mut self.writer, head.version, StatusCode::BAD_REQUEST).await?;
                log.update(log_id, |record| record.status = Some(400));
                log.finish(log_id, ExchangeState::Failed, Some(&reason));
                metrics::record_exchange(
                    Role::Server.as_label(),
                    "rejected",
                    Some(StatusCode::BAD_REQUEST),
                    started.elapsed(),
                );
                return Ok(false);
            }
        };

        let plan = head.body_plan();
        let version = head.version;
        let method = head.method.clone();
        let client_persistent = head.is_persistent();
        let compress_threshold = settings
            .auto_compress_threshold
            .filter(|_| compress::accepts_gzip(&head.headers));
        let expects_continue =
            head.framing.expect_continue && version == Version::HTTP_11 && !plan.is_empty();

        let mut request = Request::new(head.method, url);
        request.version = version;
        request.headers = head.headers;

        let continue_sent = Arc::new(OnceLock::new());
        let mut sink = None;
        let mut gate = None;
        let mut trigger = None;
        let mut cancel = None;
        if !plan.is_empty() {
            let length = match plan {
                BodyPlan::Fixed(length) => Some(length),
                _ => None,
            };
            let (tx, body) = Body::channel(length);
            sink = Some(tx);
            request.body = body;
            if expects_continue {
                let (body, first_read) = std::mem::take(&mut request.body).with_read_notify();
                request.body = body;
                let (explicit_tx, explicit_rx) = oneshot::channel();
                let (cancel_tx, cancel_rx) = oneshot::channel();
                trigger = Some(explicit_tx);
                cancel = Some(cancel_tx);
                gate = Some(ContinueGate {
                    first_read,
                    explicit: explicit_rx,
                    cancel: cancel_rx,
                    timeout: settings.continue_timeout(),
                    sent: continue_sent.clone(),
                });
            }
        }

        let mut exchange = ServerExchange::new(
            request,
            self.peer,
            self.id,
            ctx.sessions.clone(),
            trigger,
            continue_sent.clone(),
        );

        let writer = Mutex::new(&mut self.writer);
        let pump = pump_body(
            &mut self.reader,
            &writer,
            plan,
            sink,
            gate,
            settings.request_timeout(),
        );
        tokio::pin!(pump);
        let mut pumped: Option<Result<u64>> = None;

        let handled = {
            let handling = ctx.handler.handle(&mut exchange);
            tokio::pin!(handling);
            loop {
                tokio::select! {
                    handled = &mut handling => break handled,
                    result = &mut pump, if pumped.is_none() => pumped = Some(result),
                }
            }
        };
        drop(exchange.take_body());

        let continue_skipped = expects_continue && continue_sent.get().is_none();
        if continue_skipped && let Some(cancel) = cancel {
            let _ = cancel.send(());
        }

        let (mut response, handler_failed) = match handled {
            Ok(response) => (response, false),
            Err(err) => {
                warn!(
                    connection_id = self.id,
                    peer = %self.peer,
                    method = %method,
                    error = %err,
                    "handler failed"
                );
                (error_response(&err), true)
            }
        };
        let cookies = exchange.finish().await;
        ServerExchange::apply_cookies(&mut response.headers, cookies);

        let status = response.status;
        let close = draining
            || !client_persistent
            || continue_skipped
            || has_connection_token(&response.headers, "close")
            || (settings.close_on_error && (handler_failed || status.is_server_error()))
            || limit_reached;
        let outgoing = Outgoing {
            version,
            method: method.clone(),
            response,
            close,
            keep_alive_max,
            keep_alive_timeout: settings.idle_timeout(),
            downgrade_limit: settings.max_downgrade_buffer,
            compress_threshold,
        };

        let sending = send_response(&writer, outgoing);
        let (sent, pumped) = match pumped {
            Some(result) => (sending.await, result),
            None => tokio::join!(sending, &mut pump),
        };

        let continue_label = continue_sent.get().map(|trigger| trigger.as_label().to_string());
        let received = pumped.as_ref().map_or(0, |read| *read);
        log.update(log_id, |record| {
            record.continue_sent = continue_label;
            record.bytes_received = received;
        });

        let (status, closing) = match sent {
            Ok(sent) => sent,
            Err(err) => {
                let detail = format!("{err:#}");
                debug!(connection_id = self.id, peer = %self.peer, error = %detail, "writing response failed");
                log.finish(log_id, ExchangeState::Failed, Some(&detail));
                metrics::record_exchange(Role::Server.as_label(), "failed", None, started.elapsed());
                return Err(err);
            }
        };
        log.update(log_id, |record| record.status = Some(status.as_u16()));

        match pumped {
            Ok(_) => {
                log.finish(log_id, ExchangeState::Complete, None);
                metrics::record_exchange(
                    Role::Server.as_label(),
                    "complete",
                    Some(status),
                    started.elapsed(),
                );
                Ok(!closing)
            }
            Err(err) => {
                let detail = format!("{err:#}");
                debug!(connection_id = self.id, peer = %self.peer, error = %detail, "request body failed");
                log.finish(log_id, ExchangeState::BodyFailed, Some(&detail));
                metrics::record_exchange(
                    Role::Server.as_label(),
                    "body_failed",
                    Some(status),
                    started.elapsed(),
                );
                Ok(false)
            }
        }
    }
}

/// Serves requests arriving on `io` until the peer closes, the connection stops being
/// persistent, or `shutdown` fires.
pub(crate) async fn serve_connection<T: AsyncIo>(
    io: T,
    peer: SocketAddr,
    local: SocketAddr,
    connection_id: u64,
    ctx: Arc<ServerContext>,
    mut shutdown: ShutdownSignal,
) {
    let (read_half, write_half) = tokio::io::split(io);
    let mut connection = ServerConnection {
        id: connection_id,
        peer,
        local,
        reader: BufReader::new(read_half),
        writer: write_half,
        ctx,
        served: 0,
    };
    metrics::record_connection_opened(Role::Server.as_label());
    debug!(connection_id, peer = %peer, "server connection opened");

    loop {
        let settings = &connection.ctx.settings;
        let max_header_size = settings.max_header_size;
        let idle_timeout = settings.idle_timeout();
        let header_timeout = settings.request_timeout();
        let next = tokio::select! {
            head = read_request_head(&mut connection.reader, max_header_size, idle_timeout, header_timeout) => head,
            _ = shutdown.wait() => break,
        };
        let head = match next {
            Ok(Some(head)) => head,
            Ok(None) => break,
            Err(err) => {
                debug!(connection_id, peer = %peer, error = %format!("{err:#}"), "malformed request head");
                if let Err(err) =
                    write_error(&mut connection.writer, Version::HTTP_11, StatusCode::BAD_REQUEST).await
                {
                    trace!(connection_id, error = %err, "could not send 400 response");
                }
                break;
            }
        };
        match connection.serve_exchange(head, shutdown.is_triggered()).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => {
                debug!(connection_id, peer = %peer, error = %format!("{err:#}"), "server connection failed");
                break;
            }
        }
    }

    let _ = connection.writer.shutdown().await;
    debug!(
        connection_id,
        peer = %peer,
        served = connection.served,
        "server connection closed"
    );
}
