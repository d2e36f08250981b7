use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use super::{Body, BodySender};
use crate::error::BodyError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum ReplayStatus {
    Open,
    Complete,
    /// Cap exceeded or consumer gone. Replay is disabled for good.
    Destroyed,
    Failed(BodyError),
}

#[derive(Debug)]
struct ReplayState {
    chunks: Vec<Bytes>,
    size: usize,
    max: usize,
    length: Option<u64>,
    status: ReplayStatus,
}

#[derive(Debug)]
struct ReplayShared {
    state: Mutex<ReplayState>,
    changed: Notify,
}

impl ReplayShared {
    fn new(max: usize, length: Option<u64>, status: ReplayStatus) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ReplayState {
                chunks: Vec::new(),
                size: 0,
                max,
                length,
                status,
            }),
            changed: Notify::new(),
        })
    }

    /// Appends a chunk; returns false once the buffer is no longer accepting data.
    fn push(&self, data: Bytes) -> bool {
        let accepted = {
            let mut state = self.state.lock();
            if state.status != ReplayStatus::Open {
                false
            } else if state.size + data.len() > state.max {
                debug!(
                    limit = state.max,
                    buffered = state.size,
                    "replay buffer overflow, disabling replay"
                );
                state.status = ReplayStatus::Destroyed;
                state.chunks.clear();
                false
            } else {
                state.size += data.len();
                state.chunks.push(data);
                true
            }
        };
        self.changed.notify_waiters();
        accepted
    }

    fn settle(&self, status: ReplayStatus) {
        {
            let mut state = self.state.lock();
            if state.status == ReplayStatus::Open {
                state.status = status;
            }
        }
        self.changed.notify_waiters();
    }
}

/// In-memory copy of a duplicated body, able to produce any number of replay bodies.
#[derive(Debug, Clone)]
pub struct ReplayBuffer {
    shared: Arc<ReplayShared>,
}

impl ReplayBuffer {
    fn settled(max: usize, chunk: Option<Bytes>) -> Self {
        let shared = ReplayShared::new(max, None, ReplayStatus::Open);
        if let Some(chunk) = chunk {
            shared.push(chunk);
        }
        shared.settle(ReplayStatus::Complete);
        Self { shared }
    }

    /// False once the buffer overflowed or the source failed.
    pub fn is_available(&self) -> bool {
        matches!(
            self.shared.state.lock().status,
            ReplayStatus::Open | ReplayStatus::Complete
        )
    }

    pub fn is_complete(&self) -> bool {
        self.shared.state.lock().status == ReplayStatus::Complete
    }

    pub fn buffered_len(&self) -> usize {
        self.shared.state.lock().size
    }

    /// Builds a fresh body yielding the buffered chunks followed by whatever the source still
    /// delivers. Returns `None` when replay has been disabled.
    pub fn replay(&self) -> Option<Body> {
        let state = self.shared.state.lock();
        match state.status.clone() {
            ReplayStatus::Destroyed | ReplayStatus::Failed(_) => None,
            ReplayStatus::Complete => {
                let mut buf = BytesMut::with_capacity(state.size);
                for chunk in &state.chunks {
                    buf.extend_from_slice(chunk);
                }
                Some(Body::full(buf.freeze()))
            }
            ReplayStatus::Open => {
                let length = state.length;
                drop(state);
                let (tx, body) = Body::channel(length);
                tokio::spawn(stream_replay(self.shared.clone(), tx));
                Some(body)
            }
        }
    }
}

async fn stream_replay(shared: Arc<ReplayShared>, tx: BodySender) {
    let mut next = 0usize;
    loop {
        let notified = shared.changed.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let (pending, status) = {
            let state = shared.state.lock();
            let pending: Vec<Bytes> = state.chunks.get(next..).unwrap_or_default().to_vec();
            (pending, state.status.clone())
        };
        next += pending.len();
        for chunk in pending {
            if tx.send(chunk).await.is_err() {
                return;
            }
        }
        match status {
            ReplayStatus::Open => notified.await,
            ReplayStatus::Complete => return,
            ReplayStatus::Destroyed => {
                tx.abort(BodyError::Aborted(
                    "replay buffer overflowed while replaying".into(),
                ))
                .await;
                return;
            }
            ReplayStatus::Failed(err) => {
                tx.abort(err).await;
                return;
            }
        }
    }
}

/// Splits `source` into a primary body for the first send and a replay buffer capped at
/// `max_buffer` bytes. Overflowing the cap disables replay without disturbing the primary.
pub fn duplicate(mut source: Body, max_buffer: usize) -> (Body, ReplayBuffer) {
    if !source.is_streaming() {
        let length = source.content_length().unwrap_or(0) as usize;
        let chunk = match &mut source.inner {
            super::Inner::Full(data) => data.clone(),
            _ => None,
        };
        if length > max_buffer {
            let replay = ReplayBuffer {
                shared: ReplayShared::new(max_buffer, None, ReplayStatus::Destroyed),
            };
            return (source, replay);
        }
        return (source, ReplayBuffer::settled(max_buffer, chunk));
    }

    let length = source.content_length();
    let shared = ReplayShared::new(max_buffer, length, ReplayStatus::Open);
    let (primary_tx, primary) = Body::channel(length);
    tokio::spawn(forward_duplicated(
        source,
        primary_tx,
        Arc::downgrade(&shared),
    ));
    (primary, ReplayBuffer { shared })
}

/// Fans `source` into the primary channel and the replay buffer. Either sink may go away
/// without stopping the other; the source is released once both are gone.
async fn forward_duplicated(mut source: Body, primary: BodySender, secondary: Weak<ReplayShared>) {
    let mut primary = Some(primary);
    let mut secondary = Some(secondary);

    loop {
        if primary.is_none() && secondary.as_ref().is_none_or(|weak| weak.strong_count() == 0) {
            debug!("both duplicate sinks closed, releasing source body");
            return;
        }
        match source.chunk().await {
            Some(Ok(data)) => {
                if let Some(weak) = &secondary {
                    let keep = weak
                        .upgrade()
                        .is_some_and(|shared| shared.push(data.clone()));
                    if !keep {
                        secondary = None;
                    }
                }
                if let Some(tx) = &primary
                    && tx.send(data).await.is_err()
                {
                    debug!("primary duplicate sink closed, continuing with replay buffer");
                    primary = None;
                }
            }
            Some(Err(err)) => {
                if let Some(tx) = primary.take() {
                    tx.abort(err.clone()).await;
                }
                if let Some(shared) = secondary.and_then(|weak| weak.upgrade()) {
                    shared.settle(ReplayStatus::Failed(err));
                }
                return;
            }
            None => {
                drop(primary);
                if let Some(shared) = secondary.and_then(|weak| weak.upgrade()) {
                    shared.settle(ReplayStatus::Complete);
                }
                return;
            }
        }
    }
}
