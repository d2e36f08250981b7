//! Gzip of eligible responses above a size threshold.

use std::io::Write;

use bytes::{Bytes, BytesMut};
use flate2::Compression;
use flate2::write::GzEncoder;
use http::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, HeaderValue, VARY};
use http::{HeaderMap, Method, StatusCode, Version};
use tracing::trace;

use crate::body::{Body, BodySender};
use crate::error::BodyError;
use crate::message::Response;

pub(crate) fn accepts_gzip(headers: &HeaderMap) -> bool {
    headers
        .get_all(ACCEPT_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| value.to_ascii_lowercase().contains("gzip"))
}

/// Text-like media types; event streams are left alone so they keep flushing per event.
pub(crate) fn is_compressible_type(content_type: &str) -> bool {
    let media_type = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    if media_type.starts_with("text/") {
        return media_type != "text/event-stream";
    }
    media_type.starts_with("application/")
        && (matches!(
            media_type.as_str(),
            "application/json" | "application/x-www-form-urlencoded" | "application/x-javascript"
        ) || media_type.ends_with("+xml"))
}

pub(crate) fn is_eligible(version: Version, method: &Method, response: &Response) -> bool {
    version == Version::HTTP_11
        && *method != Method::HEAD
        && matches!(
            response.status,
            StatusCode::OK | StatusCode::CREATED | StatusCode::PARTIAL_CONTENT
        )
        && !response.headers.contains_key(CONTENT_ENCODING)
        && response
            .headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(is_compressible_type)
}

/// Returns `body` gzipped once it is known to exceed `threshold` bytes, updating `headers`
/// to match. Smaller bodies of unknown length are buffered and returned as they are.
pub(crate) async fn auto_compress(
    headers: &mut HeaderMap,
    mut body: Body,
    threshold: usize,
) -> Result<Body, BodyError> {
    if let Some(length) = body.content_length() {
        if length <= threshold as u64 {
            return Ok(body);
        }
        mark_gzip(headers);
        return Ok(gzip(None, body));
    }
    let mut buffered = BytesMut::new();
    while let Some(chunk) = body.chunk().await {
        buffered.extend_from_slice(&chunk?);
        if buffered.len() > threshold {
            mark_gzip(headers);
            return Ok(gzip(Some(buffered.freeze()), body));
        }
    }
    Ok(Body::full(buffered.freeze()))
}

fn mark_gzip(headers: &mut HeaderMap) {
    headers.remove(CONTENT_LENGTH);
    headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
    headers.append(VARY, HeaderValue::from_static("accept-encoding"));
}

fn gzip(prefix: Option<Bytes>, body: Body) -> Body {
    let (tx, compressed) = Body::channel(None);
    tokio::spawn(pump_gzip(prefix, body, tx));
    compressed
}

async fn pump_gzip(mut pending: Option<Bytes>, mut body: Body, tx: BodySender) {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut consumed = 0usize;
    loop {
        let chunk = match pending.take() {
            Some(chunk) => chunk,
            None => match body.chunk().await {
                Some(Ok(chunk)) => chunk,
                Some(Err(err)) => {
                    tx.abort(err).await;
                    return;
                }
                None => break,
            },
        };
        consumed += chunk.len();
        if let Err(err) = encoder.write_all(&chunk) {
            tx.abort(BodyError::Io(err.to_string())).await;
            return;
        }
        let output = std::mem::take(encoder.get_mut());
        if !output.is_empty() && tx.send(Bytes::from(output)).await.is_err() {
            return;
        }
    }
    match encoder.finish() {
        Ok(tail) => {
            if !tail.is_empty() {
                let _ = tx.send(Bytes::from(tail)).await;
            }
            trace!(consumed, "response body compressed");
        }
        Err(err) => tx.abort(BodyError::Io(err.to_string())).await,
    }
}
