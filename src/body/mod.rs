//! Push-based, back-pressured message bodies.
//!
//! A [`Body`] is either empty, a single in-memory buffer, or the receiving end of a bounded
//! channel fed by a [`BodySender`]. Dropping the sender ends the body cleanly; aborting it
//! delivers an error to the reader instead.

mod duplicate;

use std::fmt;

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot};

use crate::error::BodyError;

pub use duplicate::{ReplayBuffer, duplicate};

pub type BodyItem = Result<Bytes, BodyError>;

/// Chunks buffered in a body channel before the writer is back-pressured.
pub const BODY_CHANNEL_CAPACITY: usize = 16;

enum Inner {
    Empty,
    Full(Option<Bytes>),
    Streaming {
        rx: mpsc::Receiver<BodyItem>,
        length: Option<u64>,
    },
}

pub struct Body {
    inner: Inner,
    on_first_read: Option<oneshot::Sender<()>>,
}

impl Body {
    pub fn empty() -> Self {
        Self {
            inner: Inner::Empty,
            on_first_read: None,
        }
    }

    pub fn full(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let inner = if data.is_empty() {
            Inner::Empty
        } else {
            Inner::Full(Some(data))
        };
        Self {
            inner,
            on_first_read: None,
        }
    }

    /// Creates a streaming body. `length` is the declared size when known up front; a
    /// streaming body without one is framed chunked on the wire.
    pub fn channel(length: Option<u64>) -> (BodySender, Body) {
        let (tx, rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
        (
            BodySender { tx },
            Body {
                inner: Inner::Streaming { rx, length },
                on_first_read: None,
            },
        )
    }

    pub fn content_length(&self) -> Option<u64> {
        match &self.inner {
            Inner::Empty => Some(0),
            Inner::Full(data) => Some(data.as_ref().map_or(0, |data| data.len() as u64)),
            Inner::Streaming { length, .. } => *length,
        }
    }

    /// True when the body is known to carry no bytes.
    pub fn is_empty(&self) -> bool {
        self.content_length() == Some(0)
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.inner, Inner::Streaming { .. })
    }

    /// Returns a body that fires the receiver the first time it is read from.
    pub fn with_read_notify(mut self) -> (Body, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        self.on_first_read = Some(tx);
        (self, rx)
    }

    /// Next chunk, `None` at the end of the body.
    pub async fn chunk(&mut self) -> Option<BodyItem> {
        if let Some(notify) = self.on_first_read.take() {
            let _ = notify.send(());
        }
        match &mut self.inner {
            Inner::Empty => None,
            Inner::Full(data) => data.take().map(Ok),
            Inner::Streaming { rx, .. } => rx.recv().await,
        }
    }

    pub async fn collect(self) -> Result<Bytes, BodyError> {
        self.collect_limited(usize::MAX).await
    }

    /// Reads the whole body into memory, failing once more than `limit` bytes arrive.
    pub async fn collect_limited(mut self, limit: usize) -> Result<Bytes, BodyError> {
        if let Inner::Full(_) = self.inner {
            let data = self.chunk().await.transpose()?.unwrap_or_default();
            if data.len() > limit {
                return Err(BodyError::TooLarge { limit });
            }
            return Ok(data);
        }
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.chunk().await {
            let chunk = chunk?;
            if buf.len() + chunk.len() > limit {
                return Err(BodyError::TooLarge { limit });
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    /// Moves every chunk into `sink` without buffering the whole body. A source error aborts
    /// the sink; a closed sink stops forwarding and reports [`BodyError::Closed`].
    pub async fn forward_to(mut self, sink: BodySender) -> Result<u64, BodyError> {
        let mut forwarded = 0u64;
        while let Some(chunk) = self.chunk().await {
            match chunk {
                Ok(data) => {
                    let len = data.len() as u64;
                    sink.send(data).await?;
                    forwarded += len;
                }
                Err(err) => {
                    sink.abort(err.clone()).await;
                    return Err(err);
                }
            }
        }
        Ok(forwarded)
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.inner {
            Inner::Empty => "empty",
            Inner::Full(_) => "full",
            Inner::Streaming { .. } => "streaming",
        };
        f.debug_struct("Body")
            .field("kind", &kind)
            .field("length", &self.content_length())
            .finish()
    }
}

impl From<Bytes> for Body {
    fn from(data: Bytes) -> Self {
        Body::full(data)
    }
}

impl From<Vec<u8>> for Body {
    fn from(data: Vec<u8>) -> Self {
        Body::full(data)
    }
}

impl From<String> for Body {
    fn from(data: String) -> Self {
        Body::full(data)
    }
}

impl From<&'static str> for Body {
    fn from(data: &'static str) -> Self {
        Body::full(Bytes::from_static(data.as_bytes()))
    }
}

/// Writing end of a streaming [`Body`].
#[derive(Debug)]
pub struct BodySender {
    tx: mpsc::Sender<BodyItem>,
}

impl BodySender {
    /// Pushes one chunk, waiting while the channel is full. Empty chunks are skipped.
    pub async fn send(&self, data: Bytes) -> Result<(), BodyError> {
        if data.is_empty() {
            return Ok(());
        }
        self.tx.send(Ok(data)).await.map_err(|_| BodyError::Closed)
    }

    /// Terminates the body with an error visible to the reader.
    pub async fn abort(self, err: BodyError) {
        let _ = self.tx.send(Err(err)).await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the reading side has been dropped.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}
