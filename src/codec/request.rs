use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use http::{HeaderMap, Method, Version};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::debug;

use super::BodyPlan;
use super::headers::{Framing, HeaderAccumulator, is_framing_header, write_header_map};
use super::line::read_line;

pub(crate) struct RequestHead {
    pub method: Method,
    pub target: String,
    pub version: Version,
    pub headers: HeaderMap,
    pub framing: Framing,
}

impl RequestHead {
    /// Requests without explicit framing carry no body.
    pub fn body_plan(&self) -> BodyPlan {
        if self.framing.chunked {
            BodyPlan::Chunked
        } else {
            match self.framing.content_length {
                Some(0) | None => BodyPlan::Empty,
                Some(length) => BodyPlan::Fixed(length),
            }
        }
    }

    pub fn is_persistent(&self) -> bool {
        match self.version {
            Version::HTTP_10 => self.framing.wants_keep_alive() && !self.framing.wants_close(),
            _ => !self.framing.wants_close(),
        }
    }
}

/// Reads the next request head. Returns `None` when the peer closed the connection or stayed
/// silent for `idle_timeout` before sending anything.
pub(crate) async fn read_request_head<R>(
    reader: &mut R,
    max_header_bytes: usize,
    idle_timeout: Option<Duration>,
    header_timeout: Option<Duration>,
) -> Result<Option<RequestHead>>
where
    R: AsyncBufRead + Unpin,
{
    let waiting = reader.fill_buf();
    let available = match idle_timeout {
        Some(idle) => match tokio::time::timeout(idle, waiting).await {
            Ok(result) => result.context("waiting for request data")?,
            Err(_) => {
                debug!("idle timeout reached before next request");
                return Ok(None);
            }
        },
        None => waiting.await.context("waiting for request data")?,
    };
    if available.is_empty() {
        return Ok(None);
    }

    let mut request_line = String::new();
    let read = read_line(
        reader,
        &mut request_line,
        max_header_bytes,
        header_timeout,
        "request line",
    )
    .await?;
    if read == 0 {
        return Ok(None);
    }
    let trimmed = request_line.trim_end_matches(['\r', '\n']);
    if trimmed.is_empty() {
        bail!("empty request line");
    }

    let mut parts = trimmed.split_whitespace();
    let method_str = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing method"))?;
    let target = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing target"))?;
    let version = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing version"))?;
    if parts.next().is_some() {
        bail!("malformed request line: unexpected data");
    }
    let version = match version {
        "HTTP/1.1" => Version::HTTP_11,
        "HTTP/1.0" => Version::HTTP_10,
        other => bail!("invalid HTTP version '{other}'"),
    };
    let method = Method::from_bytes(method_str.as_bytes())
        .with_context(|| format!("invalid method '{method_str}'"))?;
    let target = target.to_string();

    let mut accumulator = HeaderAccumulator::new(max_header_bytes);
    accumulator.reserve(read)?;
    let mut line = String::new();
    loop {
        let read = read_line(
            reader,
            &mut line,
            max_header_bytes,
            header_timeout,
            "request headers",
        )
        .await?;
        if read == 0 {
            bail!("connection closed during request headers");
        }
        if !accumulator.push_line(&line)? {
            break;
        }
    }
    let (headers, framing) = accumulator.finish();
    if framing.transfer_encoding_present && !framing.chunked {
        bail!("unsupported request Transfer-Encoding");
    }

    Ok(Some(RequestHead {
        method,
        target,
        version,
        headers,
        framing,
    }))
}

pub(crate) fn encode_request_head(
    method: &Method,
    target: &str,
    version: Version,
    headers: &HeaderMap,
    plan: BodyPlan,
) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(256);
    buffer.extend_from_slice(method.as_str().as_bytes());
    buffer.extend_from_slice(b" ");
    buffer.extend_from_slice(target.as_bytes());
    buffer.extend_from_slice(b" ");
    buffer.extend_from_slice(version_str(version).as_bytes());
    buffer.extend_from_slice(b"\r\n");

    write_header_map(&mut buffer, headers, is_framing_header);
    plan.write_framing_headers(&mut buffer);

    buffer.extend_from_slice(b"\r\n");
    buffer
}

pub(crate) fn version_str(version: Version) -> &'static str {
    match version {
        Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    }
}
