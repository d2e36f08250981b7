use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use http::header::{COOKIE, HeaderValue, SET_COOKIE};
use http::{HeaderMap, Method};
use tokio::sync::oneshot;
use tracing::debug;

use super::connection::ContinueTrigger;
use super::session::{Session, SessionError, SessionManager};
use crate::body::Body;
use crate::message::Request;

/// Session settings shared by every exchange of a server.
#[derive(Clone)]
pub(crate) struct SessionConfig {
    pub manager: Arc<dyn SessionManager>,
    pub cookie_name: String,
    pub prefix: String,
}

/// One request received by the server, handed to the [`ServerHandler`](super::ServerHandler).
pub struct ServerExchange {
    pub request: Request,
    peer: SocketAddr,
    connection_id: u64,
    sessions: SessionConfig,
    session: Option<Session>,
    session_looked_up: bool,
    set_cookies: Vec<HeaderValue>,
    continue_trigger: Option<oneshot::Sender<()>>,
    continue_sent: Arc<OnceLock<ContinueTrigger>>,
}

/// Session ids named by the `Cookie` headers, in order of appearance.
fn cookie_values<'a>(headers: &'a HeaderMap, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(move |pair| {
            let (key, value) = pair.trim().split_once('=')?;
            (key.trim() == name).then(|| value.trim().trim_matches('"'))
        })
}

impl ServerExchange {
    pub(crate) fn new(
        request: Request,
        peer: SocketAddr,
        connection_id: u64,
        sessions: SessionConfig,
        continue_trigger: Option<oneshot::Sender<()>>,
        continue_sent: Arc<OnceLock<ContinueTrigger>>,
    ) -> Self {
        Self {
            request,
            peer,
            connection_id,
            sessions,
            session: None,
            session_looked_up: false,
            set_cookies: Vec::new(),
            continue_trigger,
            continue_sent,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn method(&self) -> &Method {
        &self.request.method
    }

    /// Takes the request body. For `Expect: 100-continue` requests the first read from it
    /// sends the `100 Continue`.
    pub fn take_body(&mut self) -> Body {
        std::mem::take(&mut self.request.body)
    }

    /// Sends `100 Continue` now instead of waiting for the first body read. No-op when the
    /// request did not ask for one or it was already sent.
    pub fn send_continue(&mut self) {
        if let Some(trigger) = self.continue_trigger.take() {
            let _ = trigger.send(());
        }
    }

    /// What released the `100 Continue`, once it was sent. `Timeout` marks one the server
    /// generated on its own.
    pub fn continue_sent(&self) -> Option<ContinueTrigger> {
        self.continue_sent.get().copied()
    }

    /// The session named by the request's session cookie. With `create`, a missing or
    /// expired session is replaced by a new one and the session cookie is set on the
    /// response. Repeated calls return the same session.
    pub async fn session(&mut self, create: bool) -> Result<Option<Session>, SessionError> {
        if let Some(session) = &self.session
            && session.is_valid()
        {
            return Ok(Some(session.clone()));
        }
        if !self.session_looked_up {
            self.session_looked_up = true;
            let ids: Vec<String> = cookie_values(&self.request.headers, &self.sessions.cookie_name)
                .map(str::to_string)
                .collect();
            for id in ids {
                if let Some(session) = self.sessions.manager.get(&id).await? {
                    self.session = Some(session.clone());
                    return Ok(Some(session));
                }
            }
        }
        if !create {
            return Ok(None);
        }
        let session = self.sessions.manager.create(&self.sessions.prefix).await?;
        let cookie = format!("{}={}; Path=/", self.sessions.cookie_name, session.id());
        match HeaderValue::from_str(&cookie) {
            Ok(value) => self.set_cookies.push(value),
            Err(err) => debug!(error = %err, "session cookie is not a valid header value"),
        }
        self.session = Some(session.clone());
        Ok(Some(session))
    }

    /// Persists the exchange's session and returns the `Set-Cookie` values to emit.
    pub(crate) async fn finish(self) -> Vec<HeaderValue> {
        if let Some(session) = &self.session
            && let Err(err) = self.sessions.manager.save(session.id()).await
        {
            debug!(session_id = session.id(), error = %err, "failed to save session");
        }
        self.set_cookies
    }

    pub(crate) fn apply_cookies(headers: &mut HeaderMap, cookies: Vec<HeaderValue>) {
        for cookie in cookies {
            headers.append(SET_COOKIE, cookie);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::session::InMemorySessionStore;
    use std::time::Duration;

    fn config(store: Arc<InMemorySessionStore>) -> SessionConfig {
        SessionConfig {
            manager: store,
            cookie_name: "SESSIONID".into(),
            prefix: "srv".into(),
        }
    }

    fn exchange(store: Arc<InMemorySessionStore>, cookie: Option<String>) -> ServerExchange {
        let mut request = Request::get("http://localhost/").unwrap();
        if let Some(cookie) = cookie {
            request
                .headers
                .insert(COOKIE, HeaderValue::from_str(&cookie).unwrap());
        }
        ServerExchange::new(
            request,
            "127.0.0.1:9".parse().unwrap(),
            1,
            config(store),
            None,
            Arc::default(),
        )
    }

    #[tokio::test]
    async fn session_lookup_without_create_is_idempotent() {
        let store = Arc::new(InMemorySessionStore::new(Duration::from_secs(60), Duration::ZERO));
        let mut exchange = exchange(store.clone(), None);
        assert!(exchange.session(false).await.unwrap().is_none());
        assert!(exchange.session(false).await.unwrap().is_none());
        assert!(store.is_empty());
        assert!(exchange.finish().await.is_empty());
    }

    #[tokio::test]
    async fn create_sets_cookie_once() {
        let store = Arc::new(InMemorySessionStore::new(Duration::from_secs(60), Duration::ZERO));
        let mut exchange = exchange(store.clone(), None);
        let first = exchange.session(true).await.unwrap().unwrap();
        let second = exchange.session(true).await.unwrap().unwrap();
        assert_eq!(first.id(), second.id());
        let cookies = exchange.finish().await;
        assert_eq!(cookies.len(), 1);
        assert_eq!(
            cookies[0].to_str().unwrap(),
            format!("SESSIONID={}; Path=/", first.id())
        );
    }

    #[tokio::test]
    async fn existing_session_is_found_by_cookie() {
        let store = Arc::new(InMemorySessionStore::new(Duration::from_secs(60), Duration::ZERO));
        let existing = store.create("srv").await.unwrap();
        let mut exchange = exchange(
            store.clone(),
            Some(format!("theme=dark; SESSIONID={}", existing.id())),
        );
        let found = exchange.session(true).await.unwrap().unwrap();
        assert_eq!(found.id(), existing.id());
        assert!(exchange.finish().await.is_empty());
        assert_eq!(store.stats().created, 1);
    }

    #[tokio::test]
    async fn send_continue_fires_once() {
        let store = Arc::new(InMemorySessionStore::new(Duration::from_secs(60), Duration::ZERO));
        let (tx, rx) = oneshot::channel();
        let mut exchange = ServerExchange::new(
            Request::get("http://localhost/").unwrap(),
            "127.0.0.1:9".parse().unwrap(),
            1,
            config(store),
            Some(tx),
            Arc::default(),
        );
        exchange.send_continue();
        exchange.send_continue();
        assert!(rx.await.is_ok());
    }
}
