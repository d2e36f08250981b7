use async_trait::async_trait;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, HOST, LOCATION, TRAILER, TRANSFER_ENCODING, UPGRADE};
use http::{Method, StatusCode};
use tracing::{debug, warn};
use url::Url;

use super::chain::{Exchange, Next, RequestHandler};
use crate::body::{Body, ReplayBuffer, duplicate};
use crate::error::HttpError;
use crate::message::{ContinueOutcome, RedirectCount, Request, Response};
use crate::metrics;
use crate::settings::FollowRedirects;

/// Follows 301, 302, 303 and 307 responses by replaying the request against `Location`.
#[derive(Debug, Clone)]
pub struct RedirectHandler {
    mode: FollowRedirects,
    max_redirects: u32,
    treat_302_as_303: bool,
    max_replay_buffer: usize,
}

fn is_get_or_head(method: &Method) -> bool {
    *method == Method::GET || *method == Method::HEAD
}

fn is_post_or_put(method: &Method) -> bool {
    *method == Method::POST || *method == Method::PUT
}

impl RedirectHandler {
    pub fn new(
        mode: FollowRedirects,
        max_redirects: u32,
        treat_302_as_303: bool,
        max_replay_buffer: usize,
    ) -> Self {
        Self {
            mode,
            max_redirects,
            treat_302_as_303,
            max_replay_buffer,
        }
    }

    fn follows_method(&self, method: &Method) -> bool {
        match self.mode {
            FollowRedirects::Off => false,
            FollowRedirects::Rfc => is_get_or_head(method),
            FollowRedirects::All => true,
        }
    }

    pub fn is_eligible(&self, status: StatusCode, method: &Method) -> bool {
        if self.mode == FollowRedirects::Off {
            return false;
        }
        match status {
            StatusCode::MOVED_PERMANENTLY | StatusCode::TEMPORARY_REDIRECT => {
                self.follows_method(method)
            }
            StatusCode::FOUND => {
                self.follows_method(method) || (self.treat_302_as_303 && is_post_or_put(method))
            }
            StatusCode::SEE_OTHER => is_post_or_put(method),
            _ => false,
        }
    }

    /// True when the redirected request is a body-less GET.
    fn switches_to_get(&self, status: StatusCode, method: &Method) -> bool {
        status == StatusCode::SEE_OTHER
            || (status == StatusCode::FOUND && self.treat_302_as_303 && is_post_or_put(method))
    }

    /// Whether a redirect of this request could ever need its body again.
    fn may_resend_body(&self, request: &Request) -> bool {
        !request.body.is_empty() && self.follows_method(&request.method)
    }
}

fn resolve_location(base: &Url, response: &Response) -> Option<Url> {
    let location = response.headers.get(LOCATION)?.to_str().ok()?;
    let url = base.join(location.trim()).ok()?;
    matches!(url.scheme(), "http" | "https").then_some(url)
}

fn mark(mut response: Response, count: u32) -> Response {
    response.extensions.insert(RedirectCount(count));
    response
}

#[async_trait]
impl RequestHandler for RedirectHandler {
    fn name(&self) -> &'static str {
        "redirect"
    }

    async fn on_request(&self, mut exchange: Exchange, next: Next) -> Result<Response, HttpError> {
        let count = exchange.request.redirect_count();
        let replayer = exchange.replayer();
        let replay: Option<ReplayBuffer> = if self.may_resend_body(&exchange.request) {
            let body = std::mem::take(&mut exchange.request.body);
            let (primary, replay) = duplicate(body, self.max_replay_buffer);
            exchange.request.body = primary;
            Some(replay)
        } else {
            None
        };
        let head = exchange.request.clone_head();

        let response = next.run(exchange).await?;
        let status = response.status;
        if !self.is_eligible(status, &head.method) {
            return Ok(mark(response, count));
        }
        let Some(location) = resolve_location(&head.url, &response) else {
            debug!(
                status = status.as_u16(),
                url = %head.url,
                "redirect without usable Location, delivering response"
            );
            return Ok(mark(response, count));
        };
        if count >= self.max_redirects {
            warn!(
                url = %head.url,
                location = %location,
                max = self.max_redirects,
                "redirect limit reached"
            );
            return Err(HttpError::TooManyRedirects {
                max: self.max_redirects,
            });
        }

        let mut redirected = head;
        if self.switches_to_get(status, &redirected.method) {
            redirected.method = Method::GET;
            for name in [CONTENT_TYPE, CONTENT_LENGTH, TRANSFER_ENCODING, TRAILER, UPGRADE] {
                redirected.headers.remove(name);
            }
            redirected.body = Body::empty();
        } else if let Some(replay) = &replay {
            if response.continue_outcome() == Some(ContinueOutcome::Received) {
                return Err(HttpError::ProtocolViolation(format!(
                    "{} redirect received after 100 Continue; request body already consumed",
                    status.as_u16()
                )));
            }
            match replay.replay() {
                Some(body) => redirected.body = body,
                None => {
                    debug!(
                        url = %redirected.url,
                        "request body exceeded replay buffer, delivering redirect response"
                    );
                    return Ok(mark(response, count));
                }
            }
        }
        if redirected.url.host_str() != location.host_str()
            || redirected.url.port_or_known_default() != location.port_or_known_default()
        {
            redirected.headers.remove(HOST);
        }
        redirected.url = location;
        redirected.extensions.insert(RedirectCount(count + 1));
        drop(response);

        debug!(
            status = status.as_u16(),
            method = %redirected.method,
            location = %redirected.url,
            redirect = count + 1,
            "following redirect"
        );
        metrics::record_redirect();
        replayer.send(redirected).await
    }
}
