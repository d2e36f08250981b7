use http::header::{HeaderName, HeaderValue, UPGRADE};
use http::{Extensions, HeaderMap, Method, StatusCode, Version};
use url::Url;

use crate::body::Body;
use crate::error::HttpError;

/// Marks how the 100-continue gate of a request was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinueOutcome {
    /// The peer sent a real `100 Continue`.
    Received,
    /// The continue timeout elapsed and the body was sent without one.
    Synthetic,
}

/// Number of redirects followed to reach this request or response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RedirectCount(pub u32);

/// Number of retries issued to reach this request or response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryCount(pub u32);

/// Opts a single request out of automatic retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoRetry;

/// Routes the request through a forward proxy; the request line switches to absolute form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRoute {
    pub host: String,
    pub port: u16,
}

#[derive(Debug)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Body,
    pub extensions: Extensions,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: Body::empty(),
            extensions: Extensions::new(),
        }
    }

    pub fn parse(method: Method, url: &str) -> Result<Self, HttpError> {
        let url = Url::parse(url)
            .map_err(|err| HttpError::InvalidRequest(format!("invalid URL {url}: {err}")))?;
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(HttpError::InvalidRequest(format!(
                    "unsupported scheme {other}"
                )));
            }
        }
        if url.host_str().is_none() {
            return Err(HttpError::InvalidRequest(format!("URL {url} has no host")));
        }
        Ok(Self::new(method, url))
    }

    pub fn get(url: &str) -> Result<Self, HttpError> {
        Self::parse(Method::GET, url)
    }

    pub fn head(url: &str) -> Result<Self, HttpError> {
        Self::parse(Method::HEAD, url)
    }

    pub fn delete(url: &str) -> Result<Self, HttpError> {
        Self::parse(Method::DELETE, url)
    }

    pub fn put(url: &str, body: impl Into<Body>) -> Result<Self, HttpError> {
        Ok(Self::parse(Method::PUT, url)?.with_body(body))
    }

    pub fn post(url: &str, body: impl Into<Body>) -> Result<Self, HttpError> {
        Ok(Self::parse(Method::POST, url)?.with_body(body))
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn with_extension<T>(mut self, value: T) -> Self
    where
        T: Clone + Send + Sync + 'static,
    {
        self.extensions.insert(value);
        self
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    pub fn port(&self) -> u16 {
        self.url.port_or_known_default().unwrap_or(80)
    }

    pub fn is_secure(&self) -> bool {
        self.url.scheme() == "https"
    }

    pub fn is_upgrade(&self) -> bool {
        self.headers.contains_key(UPGRADE)
    }

    /// Value for the `Host` header: the port is omitted when it is the scheme default.
    pub fn authority(&self) -> String {
        match self.url.port() {
            Some(port) => format!("{}:{port}", self.host()),
            None => self.host().to_string(),
        }
    }

    /// Request-target for the request line.
    pub fn request_target(&self) -> String {
        if self.method == Method::CONNECT {
            return format!("{}:{}", self.host(), self.port());
        }
        if self.extensions.get::<ProxyRoute>().is_some() {
            let mut absolute = self.url.clone();
            absolute.set_fragment(None);
            return absolute.to_string();
        }
        let mut target = self.url.path().to_string();
        if let Some(query) = self.url.query() {
            target.push('?');
            target.push_str(query);
        }
        target
    }

    /// Copy of everything but the body, used to rebuild a request for a replay.
    pub fn clone_head(&self) -> Request {
        Request {
            method: self.method.clone(),
            url: self.url.clone(),
            version: self.version,
            headers: self.headers.clone(),
            body: Body::empty(),
            extensions: self.extensions.clone(),
        }
    }

    pub fn redirect_count(&self) -> u32 {
        self.extensions
            .get::<RedirectCount>()
            .map_or(0, |count| count.0)
    }

    pub fn retry_count(&self) -> u32 {
        self.extensions.get::<RetryCount>().map_or(0, |count| count.0)
    }
}

#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    pub reason: Option<String>,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Body,
    pub extensions: Extensions,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            reason: None,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: Body::empty(),
            extensions: Extensions::new(),
        }
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    pub fn reason_phrase(&self) -> &str {
        self.reason
            .as_deref()
            .or_else(|| self.status.canonical_reason())
            .unwrap_or("")
    }

    pub fn continue_outcome(&self) -> Option<ContinueOutcome> {
        self.extensions.get::<ContinueOutcome>().copied()
    }

    pub fn redirect_count(&self) -> u32 {
        self.extensions
            .get::<RedirectCount>()
            .map_or(0, |count| count.0)
    }

    pub fn retry_count(&self) -> u32 {
        self.extensions.get::<RetryCount>().map_or(0, |count| count.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_form_includes_query_only() {
        let req = Request::get("http://example.com:8080/a/b?x=1#frag").unwrap();
        assert_eq!(req.request_target(), "/a/b?x=1");
        assert_eq!(req.authority(), "example.com:8080");
        assert_eq!(req.port(), 8080);
    }

    #[test]
    fn proxy_route_switches_to_absolute_form() {
        let req = Request::get("http://example.com/path").unwrap().with_extension(ProxyRoute {
            host: "proxy".into(),
            port: 3128,
        });
        assert_eq!(req.request_target(), "http://example.com/path");
        assert_eq!(req.authority(), "example.com");
    }

    #[test]
    fn default_ports_follow_scheme() {
        let req = Request::get("https://secure.example").unwrap();
        assert!(req.is_secure());
        assert_eq!(req.port(), 443);
        assert_eq!(req.request_target(), "/");
    }

    #[test]
    fn rejects_non_http_schemes() {
        assert!(matches!(
            Request::get("ftp://example.com/"),
            Err(HttpError::InvalidRequest(_))
        ));
    }

    #[test]
    fn clone_head_keeps_extensions() {
        let req = Request::put("http://example.com/", "data")
            .unwrap()
            .with_extension(RedirectCount(2));
        let copy = req.clone_head();
        assert_eq!(copy.redirect_count(), 2);
        assert!(copy.body.is_empty());
        assert_eq!(copy.method, Method::PUT);
    }
}
