use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use http::header::{CONNECTION, HeaderName};
use http::{HeaderMap, Method, StatusCode, Version};
use tokio::io::AsyncBufRead;

use super::BodyPlan;
use super::headers::{Framing, HeaderAccumulator, is_framing_header, write_header_map};
use super::line::read_line;
use super::request::version_str;

pub(crate) struct ResponseHead {
    pub version: Version,
    pub status: StatusCode,
    pub reason: String,
    pub headers: HeaderMap,
    pub framing: Framing,
}

impl ResponseHead {
    pub fn is_interim(&self) -> bool {
        self.status.is_informational() && self.status != StatusCode::SWITCHING_PROTOCOLS
    }

    /// HTTP/1.1 is persistent unless the peer says `close`; HTTP/1.0 only with `keep-alive`.
    pub fn is_persistent(&self) -> bool {
        if self.framing.wants_close() {
            return false;
        }
        match self.version {
            Version::HTTP_10 => self.framing.wants_keep_alive(),
            _ => true,
        }
    }
}

pub(crate) async fn read_response_head<R>(
    reader: &mut R,
    max_header_bytes: usize,
    timeout: Option<Duration>,
) -> Result<ResponseHead>
where
    R: AsyncBufRead + Unpin,
{
    let mut status_line = String::new();
    let read = read_line(
        reader,
        &mut status_line,
        max_header_bytes,
        timeout,
        "status line",
    )
    .await?;
    if read == 0 {
        bail!("peer closed connection before sending status line");
    }
    let trimmed = status_line.trim_end_matches(['\r', '\n']);
    let (version, status, reason) = parse_status_line(trimmed)?;

    let (headers, framing) = read_header_block(reader, read, max_header_bytes, timeout)
        .await
        .context(AfterStatus(status))?;

    Ok(ResponseHead {
        version,
        status,
        reason,
        headers,
        framing,
    })
}

/// Context on header errors that follow a well-formed status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AfterStatus(pub StatusCode);

impl fmt::Display for AfterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed headers after {} status line", self.0.as_u16())
    }
}

async fn read_header_block<R>(
    reader: &mut R,
    status_line_bytes: usize,
    max_header_bytes: usize,
    timeout: Option<Duration>,
) -> Result<(HeaderMap, Framing)>
where
    R: AsyncBufRead + Unpin,
{
    let mut accumulator = HeaderAccumulator::new(max_header_bytes);
    accumulator.reserve(status_line_bytes)?;
    let mut line = String::new();
    loop {
        let read = read_line(
            reader,
            &mut line,
            max_header_bytes,
            timeout,
            "response headers",
        )
        .await?;
        if read == 0 {
            bail!("peer closed connection during headers");
        }
        if !accumulator.push_line(&line)? {
            break;
        }
    }
    Ok(accumulator.finish())
}

pub(crate) fn parse_status_line(value: &str) -> Result<(Version, StatusCode, String)> {
    let mut parts = value.splitn(3, ' ');
    let version = parts
        .next()
        .filter(|part| !part.is_empty())
        .ok_or_else(|| anyhow!("status line missing HTTP version"))?;
    let status = parts
        .next()
        .ok_or_else(|| anyhow!("status line missing status code"))?;
    let reason = parts.next().unwrap_or_default().trim().to_string();

    let version = match version {
        "HTTP/1.1" => Version::HTTP_11,
        "HTTP/1.0" => Version::HTTP_10,
        other => bail!("unsupported HTTP version '{other}'"),
    };

    let status_code: u16 = status
        .parse()
        .with_context(|| format!("invalid status code '{status}'"))?;
    let status = StatusCode::from_u16(status_code)
        .map_err(|_| anyhow!("unsupported status code '{status_code}'"))?;

    Ok((version, status, reason))
}

/// Chooses how the body following `head` is delimited for a request sent with `method`.
pub(crate) fn determine_response_body_plan(method: &Method, head: &ResponseHead) -> BodyPlan {
    if *method == Method::HEAD {
        return BodyPlan::Empty;
    }
    if head.status == StatusCode::SWITCHING_PROTOCOLS {
        return BodyPlan::UntilClose;
    }
    if head.status.is_informational()
        || head.status == StatusCode::NO_CONTENT
        || head.status == StatusCode::RESET_CONTENT
        || head.status == StatusCode::NOT_MODIFIED
    {
        return BodyPlan::Empty;
    }
    if *method == Method::CONNECT && head.status.is_success() {
        return BodyPlan::Empty;
    }
    if head.framing.chunked {
        return BodyPlan::Chunked;
    }
    if head.framing.transfer_encoding_present {
        return BodyPlan::UntilClose;
    }
    match head.framing.content_length {
        Some(0) => BodyPlan::Empty,
        Some(length) => BodyPlan::Fixed(length),
        None => BodyPlan::UntilClose,
    }
}

/// How the `Connection` header of an outgoing response is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionDirective {
    Close,
    KeepAlive {
        /// Required for HTTP/1.0 peers, which default to closing.
        explicit: bool,
        max: Option<u32>,
        timeout: Option<Duration>,
    },
    Upgrade,
}

pub(crate) fn encode_response_head(
    version: Version,
    status: StatusCode,
    reason: &str,
    headers: &HeaderMap,
    plan: BodyPlan,
    declared_length: Option<u64>,
    directive: ConnectionDirective,
) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(256);
    buffer.extend_from_slice(version_str(version).as_bytes());
    buffer.extend_from_slice(b" ");
    buffer.extend_from_slice(status.as_str().as_bytes());
    buffer.extend_from_slice(b" ");
    buffer.extend_from_slice(reason.as_bytes());
    buffer.extend_from_slice(b"\r\n");

    write_header_map(&mut buffer, headers, |name: &HeaderName| {
        is_framing_header(name) || *name == CONNECTION
    });

    match plan {
        BodyPlan::Empty => {
            if let Some(length) = declared_length.filter(|length| *length > 0) {
                buffer.extend_from_slice(format!("Content-Length: {length}\r\n").as_bytes());
            } else if status_allows_body(status) {
                buffer.extend_from_slice(b"Content-Length: 0\r\n");
            }
        }
        other => other.write_framing_headers(&mut buffer),
    }

    match directive {
        ConnectionDirective::Close => buffer.extend_from_slice(b"Connection: close\r\n"),
        ConnectionDirective::Upgrade => buffer.extend_from_slice(b"Connection: upgrade\r\n"),
        ConnectionDirective::KeepAlive {
            explicit,
            max,
            timeout,
        } => {
            if explicit {
                buffer.extend_from_slice(b"Connection: keep-alive\r\n");
            }
            let mut params = Vec::new();
            if let Some(max) = max {
                params.push(format!("max={max}"));
            }
            if let Some(timeout) = timeout {
                params.push(format!("timeout={}", timeout.as_secs()));
            }
            if !params.is_empty() {
                buffer.extend_from_slice(b"Keep-Alive: ");
                buffer.extend_from_slice(params.join(", ").as_bytes());
                buffer.extend_from_slice(b"\r\n");
            }
        }
    }

    buffer.extend_from_slice(b"\r\n");
    buffer
}

fn status_allows_body(status: StatusCode) -> bool {
    !(status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED)
}
