use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::header::{COOKIE, HeaderValue};
use tracing::{debug, warn};

use super::chain::{Capabilities, Exchange, Next, RequestHandler};
use crate::cookie::CookieJar;
use crate::error::HttpError;
use crate::message::Response;

/// `Cookie` value the jar added to a request, so a replayed copy can recompute it.
#[derive(Debug, Clone, PartialEq, Eq)]
struct JarCookie(HeaderValue);

/// Adds jar cookies to outgoing requests and stores the cookies responses set.
pub struct CookieHandler {
    jar: Arc<CookieJar>,
}

impl CookieHandler {
    pub fn new(sweep_interval: Duration) -> Self {
        Self {
            jar: Arc::new(CookieJar::new(sweep_interval)),
        }
    }

    pub fn jar(&self) -> &Arc<CookieJar> {
        &self.jar
    }
}

#[async_trait]
impl RequestHandler for CookieHandler {
    fn name(&self) -> &'static str {
        "cookie"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            request: true,
            connect: false,
            lifecycle: true,
        }
    }

    async fn on_request(&self, mut exchange: Exchange, next: Next) -> Result<Response, HttpError> {
        let request = &mut exchange.request;
        if let Some(JarCookie(previous)) = request.extensions.remove::<JarCookie>() {
            let kept: Vec<HeaderValue> = request
                .headers
                .get_all(COOKIE)
                .iter()
                .filter(|value| **value != previous)
                .cloned()
                .collect();
            request.headers.remove(COOKIE);
            for value in kept {
                request.headers.append(COOKIE, value);
            }
        } else if request.headers.contains_key(COOKIE) {
            warn!(
                host = request.host(),
                "request already carries a Cookie header while automatic cookie handling is on"
            );
        }

        if let Some(cookies) = self.jar.get(&request.url) {
            match HeaderValue::from_str(&cookies) {
                Ok(value) => {
                    request.headers.append(COOKIE, value.clone());
                    request.extensions.insert(JarCookie(value));
                }
                Err(err) => debug!(error = %err, "jar cookies are not a valid header value"),
            }
        }

        let url = request.url.clone();
        let response = next.run(exchange).await?;
        if response.status.as_u16() > 100 {
            self.jar.put(&url, &response.headers);
        }
        Ok(response)
    }

    fn on_destroy(&self) {
        self.jar.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::HttpClient;
    use crate::message::Request;
    use crate::settings::ClientSettings;
    use http::header::SET_COOKIE;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    /// Serves two requests on one connection and reports each request's Cookie header.
    async fn spawn_server() -> (u16, mpsc::UnboundedReceiver<Option<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut reader = BufReader::new(stream);
                    loop {
                        let mut cookie = None;
                        let mut line = String::new();
                        loop {
                            line.clear();
                            if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                                return;
                            }
                            if line == "\r\n" {
                                break;
                            }
                            if let Some(value) = line.strip_prefix("cookie: ") {
                                cookie = Some(value.trim_end().to_string());
                            }
                        }
                        tx.send(cookie).unwrap();
                        reader
                            .get_mut()
                            .write_all(
                                b"HTTP/1.1 200 OK\r\nSet-Cookie: sid=42; Path=/\r\nContent-Length: 0\r\n\r\n",
                            )
                            .await
                            .unwrap();
                    }
                });
            }
        });
        (port, rx)
    }

    #[tokio::test]
    async fn response_cookies_are_sent_on_the_next_request() {
        let (port, mut seen) = spawn_server().await;
        let client = HttpClient::new(ClientSettings::default()).unwrap();
        let url = format!("http://127.0.0.1:{port}/a");

        let first = client.send(Request::get(&url).unwrap()).await.unwrap();
        assert_eq!(first.headers.get(SET_COOKIE).unwrap(), "sid=42; Path=/");
        assert_eq!(seen.recv().await.unwrap(), None);

        client.send(Request::get(&url).unwrap()).await.unwrap();
        assert_eq!(seen.recv().await.unwrap().as_deref(), Some("sid=42"));
        client.close();
    }

    #[tokio::test]
    async fn replayed_request_does_not_duplicate_jar_cookies() {
        let handler = CookieHandler::new(Duration::ZERO);
        let url = url::Url::parse("http://example.com/").unwrap();
        let mut headers = http::HeaderMap::new();
        headers.insert(SET_COOKIE, HeaderValue::from_static("a=1; Path=/"));
        handler.jar().put(&url, &headers);

        let mut request = Request::get("http://example.com/")
            .unwrap()
            .with_header(COOKIE, HeaderValue::from_static("manual=1"));
        request.headers.append(COOKIE, HeaderValue::from_static("a=1"));
        request.extensions.insert(JarCookie(HeaderValue::from_static("a=1")));

        let client = HttpClient::new(ClientSettings::default()).unwrap();
        let echo = client.clone();
        let exchange = Exchange::new(request, echo);
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let recorder: Arc<dyn RequestHandler> = Arc::new(Recorder { seen: seen.clone() });
        let next = Next::for_test(vec![recorder]);
        handler.on_request(exchange, next).await.unwrap();

        assert_eq!(*seen.lock(), vec!["manual=1".to_string(), "a=1".to_string()]);
        client.close();
    }

    struct Recorder {
        seen: Arc<parking_lot::Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl RequestHandler for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        async fn on_request(&self, exchange: Exchange, _next: Next) -> Result<Response, HttpError> {
            let values = exchange
                .request
                .headers
                .get_all(COOKIE)
                .iter()
                .map(|value| value.to_str().unwrap().to_string())
                .collect();
            *self.seen.lock() = values;
            Ok(Response::new(http::StatusCode::OK))
        }
    }
}
