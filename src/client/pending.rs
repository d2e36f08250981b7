use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use http::Method;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;

use crate::error::HttpError;
use crate::message::{ContinueOutcome, Response};

pub(crate) type Responder = oneshot::Sender<Result<Response, HttpError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContinueState {
    Waiting,
    Received,
    Synthetic,
    /// A final response arrived first; the body must not be sent.
    FinalResponse,
}

/// What the body writer should do once the 100-continue wait is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ContinueDecision {
    Send(ContinueOutcome),
    Skip,
}

/// Shared 100-continue state of one request. The writer waits on it while the reader flips it
/// when an interim or final response arrives. Only the first transition out of `Waiting` wins.
#[derive(Debug, Clone)]
pub(crate) struct ContinueGate {
    tx: Arc<watch::Sender<ContinueState>>,
}

impl ContinueGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ContinueState::Waiting);
        Self { tx: Arc::new(tx) }
    }

    fn transition(&self, next: ContinueState) -> ContinueState {
        self.tx.send_if_modified(|state| {
            if *state == ContinueState::Waiting {
                *state = next;
                true
            } else {
                false
            }
        });
        *self.tx.borrow()
    }

    pub fn mark_received(&self) {
        self.transition(ContinueState::Received);
    }

    /// Called when the final response head arrives. Returns how the gate had been opened, or
    /// `None` when the body was never released.
    pub fn on_final_response(&self) -> Option<ContinueOutcome> {
        match self.transition(ContinueState::FinalResponse) {
            ContinueState::Received => Some(ContinueOutcome::Received),
            ContinueState::Synthetic => Some(ContinueOutcome::Synthetic),
            ContinueState::Waiting | ContinueState::FinalResponse => None,
        }
    }

    pub async fn wait(&self, timeout: Duration) -> ContinueDecision {
        let mut rx = self.tx.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|state| *state != ContinueState::Waiting),
        )
        .await;
        let state = match waited {
            Ok(Ok(state)) => *state,
            Ok(Err(_)) => ContinueState::FinalResponse,
            Err(_) => self.transition(ContinueState::Synthetic),
        };
        match state {
            ContinueState::Received => ContinueDecision::Send(ContinueOutcome::Received),
            ContinueState::Synthetic => ContinueDecision::Send(ContinueOutcome::Synthetic),
            ContinueState::Waiting | ContinueState::FinalResponse => ContinueDecision::Skip,
        }
    }
}

pub(crate) struct PendingEntry {
    pub method: Method,
    pub deadline: Option<Instant>,
    pub responder: Responder,
    pub gate: Option<ContinueGate>,
    pub log_id: u64,
}

/// Requests written on a connection that still await their response head, oldest first.
#[derive(Default)]
pub(crate) struct PendingResponseQueue {
    entries: VecDeque<PendingEntry>,
}

impl PendingResponseQueue {
    pub fn push(&mut self, entry: PendingEntry) {
        self.entries.push_back(entry);
    }

    pub fn front(&self) -> Option<&PendingEntry> {
        self.entries.front()
    }

    pub fn pop_front(&mut self) -> Option<PendingEntry> {
        self.entries.pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn take_all(&mut self) -> Vec<PendingEntry> {
        self.entries.drain(..).collect()
    }

    pub fn has_expired(&self, now: Instant) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.deadline.is_some_and(|deadline| deadline <= now))
    }
}
