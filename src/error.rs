use std::fmt;
use std::time::Duration;

use http::StatusCode;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Connect,
    Response,
    BodyReceive,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TimeoutKind::Connect => "connect",
            TimeoutKind::Response => "response",
            TimeoutKind::BodyReceive => "body receive",
        };
        f.write_str(label)
    }
}

/// Failure of a streamed message body. Delivered through the body channel itself, so a body
/// that fails after its header was accepted never reaches the exchange's error path.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BodyError {
    #[error("body channel closed by the receiving side")]
    Closed,
    #[error("body aborted: {0}")]
    Aborted(String),
    #[error("body exceeds limit of {limit} bytes")]
    TooLarge { limit: usize },
    #[error("body length mismatch: declared {expected} bytes, received {actual}")]
    LengthMismatch { expected: u64, actual: u64 },
    #[error("body I/O failed: {0}")]
    Io(String),
}

#[derive(Debug, Error)]
pub enum HttpError {
    /// Malformed header or body framing. The connection that produced it is destroyed.
    #[error("malformed HTTP message: {message}")]
    Framing {
        message: String,
        status: Option<StatusCode>,
    },
    #[error("failed to connect to {host}:{port}: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },
    #[error("{kind} timeout of {} ms reached", timeout.as_millis())]
    Timeout { kind: TimeoutKind, timeout: Duration },
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("connection closed: {0}")]
    Closed(String),
    #[error("max redirects {max} reached")]
    TooManyRedirects { max: u32 },
    #[error("proxy error: {0}")]
    Proxy(String),
    #[error("TLS error: {0}")]
    Tls(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Body(#[from] BodyError),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse classification callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Framing,
    Connect,
    Timeout(TimeoutKind),
    ProtocolViolation,
    Closed,
    TooManyRedirects,
    Proxy,
    Tls,
    InvalidRequest,
    Body,
    Internal,
}

impl ErrorKind {
    pub fn as_label(&self) -> &'static str {
        match self {
            ErrorKind::Framing => "framing",
            ErrorKind::Connect => "connect",
            ErrorKind::Timeout(_) => "timeout",
            ErrorKind::ProtocolViolation => "protocol_violation",
            ErrorKind::Closed => "closed",
            ErrorKind::TooManyRedirects => "too_many_redirects",
            ErrorKind::Proxy => "proxy",
            ErrorKind::Tls => "tls",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::Body => "body",
            ErrorKind::Internal => "internal",
        }
    }
}

impl HttpError {
    pub fn framing(err: anyhow::Error) -> Self {
        HttpError::Framing {
            message: format!("{err:#}"),
            status: None,
        }
    }

    pub fn framing_with_status(err: anyhow::Error, status: StatusCode) -> Self {
        HttpError::Framing {
            message: format!("{err:#}"),
            status: Some(status),
        }
    }

    pub fn closed(reason: impl Into<String>) -> Self {
        HttpError::Closed(reason.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            HttpError::Framing { .. } => ErrorKind::Framing,
            HttpError::Connect { .. } => ErrorKind::Connect,
            HttpError::Timeout { kind, .. } => ErrorKind::Timeout(*kind),
            HttpError::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
            HttpError::Closed(_) => ErrorKind::Closed,
            HttpError::TooManyRedirects { .. } => ErrorKind::TooManyRedirects,
            HttpError::Proxy(_) => ErrorKind::Proxy,
            HttpError::Tls(_) => ErrorKind::Tls,
            HttpError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            HttpError::Body(_) => ErrorKind::Body,
            HttpError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, HttpError::Timeout { .. })
    }

    /// True for transport-level failures raised before the peer delivered a response it had
    /// processed. A parsed error status of 400 or above disqualifies the failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            HttpError::Framing { status, .. } => status.is_none_or(|status| status.as_u16() < 400),
            HttpError::Closed(_) | HttpError::Connect { .. } => true,
            _ => false,
        }
    }
}

pub fn log_exchange_error(host: &str, method: &http::Method, err: &HttpError) {
    match err.kind() {
        ErrorKind::Timeout(kind) => warn!(
            host,
            method = %method,
            timeout_kind = %kind,
            error = %err,
            "exchange timed out"
        ),
        ErrorKind::ProtocolViolation | ErrorKind::Framing => warn!(
            host,
            method = %method,
            error = %err,
            "exchange failed with protocol error"
        ),
        ErrorKind::TooManyRedirects | ErrorKind::InvalidRequest => debug!(
            host,
            method = %method,
            error = %err,
            "exchange rejected"
        ),
        _ => debug!(
            host,
            method = %method,
            error = %err,
            "exchange failed"
        ),
    }
}
