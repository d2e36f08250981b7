use async_trait::async_trait;
use http::{Method, StatusCode};
use tracing::{debug, info};

use super::chain::{Exchange, Next, RequestHandler};
use crate::body::{Body, ReplayBuffer, duplicate};
use crate::error::HttpError;
use crate::message::{NoRetry, Request, Response, RetryCount};
use crate::metrics;

const RETRYABLE_STATUSES: [u16; 8] = [408, 421, 423, 500, 502, 503, 504, 509];

pub fn is_retryable_status(status: StatusCode) -> bool {
    RETRYABLE_STATUSES.contains(&status.as_u16())
}

/// Replays idempotent requests that failed at the transport level or with a transient
/// error status.
#[derive(Debug, Clone)]
pub struct RetryHandler {
    max_retries: u32,
    max_replay_buffer: usize,
}

enum Attempt {
    /// Delivered to the caller as is.
    Final(Result<Response, HttpError>),
    Retry(Result<Response, HttpError>),
}

fn classify(result: Result<Response, HttpError>) -> Attempt {
    match result {
        Ok(response) if is_retryable_status(response.status) => Attempt::Retry(Ok(response)),
        Err(err) if err.is_retryable() => Attempt::Retry(Err(err)),
        other => Attempt::Final(other),
    }
}

fn trigger_label(failure: &Result<Response, HttpError>) -> String {
    match failure {
        Ok(response) => response.status.as_u16().to_string(),
        Err(err) => err.kind().as_label().to_string(),
    }
}

fn mark(mut result: Result<Response, HttpError>, attempt: u32) -> Result<Response, HttpError> {
    if let Ok(response) = &mut result {
        response.extensions.insert(RetryCount(attempt));
    }
    result
}

impl RetryHandler {
    pub fn new(max_retries: u32, max_replay_buffer: usize) -> Self {
        Self {
            max_retries,
            max_replay_buffer,
        }
    }

    fn applies_to(&self, request: &Request) -> bool {
        self.max_retries > 0
            && request.extensions.get::<RetryCount>().is_none()
            && request.extensions.get::<NoRetry>().is_none()
            && !request.is_upgrade()
            && matches!(request.method, Method::GET | Method::DELETE | Method::PUT)
    }

    /// Buffers the body of a failed response kept for delivery after the last attempt, so the
    /// connection it arrived on can be released.
    async fn detach(&self, failure: Result<Response, HttpError>) -> Result<Response, HttpError> {
        let mut response = failure?;
        let body = std::mem::take(&mut response.body);
        response.body = match body.collect_limited(self.max_replay_buffer).await {
            Ok(data) => Body::full(data),
            Err(err) => {
                debug!(status = response.status.as_u16(), error = %err, "dropping body of failed response");
                Body::empty()
            }
        };
        Ok(response)
    }
}

#[async_trait]
impl RequestHandler for RetryHandler {
    fn name(&self) -> &'static str {
        "retry"
    }

    async fn on_request(&self, mut exchange: Exchange, next: Next) -> Result<Response, HttpError> {
        if !self.applies_to(&exchange.request) {
            return next.run(exchange).await;
        }
        let replayer = exchange.replayer();
        let replay: Option<ReplayBuffer> =
            if exchange.request.method == Method::PUT && !exchange.request.body.is_empty() {
                let body = std::mem::take(&mut exchange.request.body);
                let (primary, replay) = duplicate(body, self.max_replay_buffer);
                exchange.request.body = primary;
                Some(replay)
            } else {
                None
            };
        let head = exchange.request.clone_head();

        let first_failure = match classify(next.run(exchange).await) {
            Attempt::Final(result) => return result,
            Attempt::Retry(failure) => self.detach(failure).await,
        };

        for attempt in 1..=self.max_retries {
            let mut request = head.clone_head();
            if let Some(replay) = &replay {
                match replay.replay() {
                    Some(body) => request.body = body,
                    None => {
                        debug!(url = %head.url, "request body no longer replayable, not retrying");
                        break;
                    }
                }
            }
            request.extensions.insert(RetryCount(attempt));

            let trigger = trigger_label(&first_failure);
            info!(
                method = %head.method,
                url = %head.url,
                attempt,
                max = self.max_retries,
                trigger = %trigger,
                "retrying request"
            );
            metrics::record_retry(&trigger);

            match classify(replayer.send(request).await) {
                Attempt::Final(result) => return mark(result, attempt),
                Attempt::Retry(failure) => {
                    debug!(attempt, trigger = %trigger_label(&failure), "retry attempt failed");
                }
            }
        }
        first_failure
    }
}
