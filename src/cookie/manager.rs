use std::time::Duration;

use http::HeaderMap;
use http::header::{HeaderName, SET_COOKIE};
use tracing::debug;
use url::Url;

use super::{Cookie, CookieStore, port_in_list};

static SET_COOKIE2: HeaderName = HeaderName::from_static("set-cookie2");

/// Computes `Cookie` request headers and ingests `Set-Cookie`/`Set-Cookie2` responses.
#[derive(Debug)]
pub struct CookieJar {
    store: CookieStore,
}

fn effective_port(url: &Url) -> u16 {
    url.port_or_known_default().unwrap_or(80)
}

/// Directory part of the request path, used as the default cookie path.
fn default_path(url: &Url) -> String {
    let path = url.path();
    if path.ends_with('/') {
        return path.to_string();
    }
    match path.rfind('/') {
        Some(index) if index > 0 => path[..=index].to_string(),
        _ => "/".to_string(),
    }
}

impl CookieJar {
    pub fn new(sweep_interval: Duration) -> Self {
        Self {
            store: CookieStore::new(sweep_interval),
        }
    }

    pub fn store(&self) -> &CookieStore {
        &self.store
    }

    /// Value of the `Cookie` header for a request to `url`, or `None` when no cookie applies.
    pub fn get(&self, url: &Url) -> Option<String> {
        let path = match url.path() {
            "" => "/",
            path => path,
        };
        let port = effective_port(url);
        let mut cookies: Vec<Cookie> = self
            .store
            .get(url)
            .into_iter()
            .filter(|cookie| cookie.path().is_some_and(|prefix| path.starts_with(prefix)))
            .filter(|cookie| match cookie.port_list() {
                Some(ports) if !ports.is_empty() => port_in_list(ports, port),
                _ => true,
            })
            .collect();
        if cookies.is_empty() {
            return None;
        }
        cookies.sort_by_key(|cookie| std::cmp::Reverse(cookie.path().map_or(0, str::len)));

        let mut parts = Vec::with_capacity(cookies.len() + 1);
        if cookies[0].version() > 0 {
            parts.push("$Version=\"1\"".to_string());
        }
        parts.extend(cookies.iter().map(Cookie::to_string));
        Some(parts.join("; "))
    }

    /// Stores every cookie set by a response to a request for `url`. Unparsable headers and
    /// cookies restricted to other ports are skipped.
    pub fn put(&self, url: &Url, headers: &HeaderMap) {
        let port = effective_port(url);
        let values = headers
            .get_all(SET_COOKIE)
            .iter()
            .map(|value| (value, false))
            .chain(headers.get_all(&SET_COOKIE2).iter().map(|value| (value, true)));

        for (value, set_cookie2) in values {
            let Ok(raw) = value.to_str() else {
                debug!("ignoring non-ASCII Set-Cookie header");
                continue;
            };
            let cookies = match Cookie::parse(raw, set_cookie2) {
                Ok(cookies) => cookies,
                Err(err) => {
                    debug!(error = %err, "ignoring malformed Set-Cookie header");
                    continue;
                }
            };
            for mut cookie in cookies {
                if cookie.path().is_none() {
                    cookie.set_path(default_path(url));
                }
                match cookie.port_list() {
                    Some("") => cookie.set_port_list(port.to_string()),
                    Some(ports) if !port_in_list(ports, port) => {
                        debug!(name = cookie.name(), port, "cookie port list excludes request port");
                        continue;
                    }
                    _ => {}
                }
                self.store.add(url, cookie);
            }
        }
    }

    pub fn close(&self) {
        self.store.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::HeaderValue;

    fn url(raw: &str) -> Url {
        Url::parse(raw).unwrap()
    }

    fn headers(values: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in values {
            map.append(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[tokio::test]
    async fn longer_paths_come_first() {
        let jar = CookieJar::new(Duration::ZERO);
        let origin = url("http://example.com/app/page");
        jar.put(
            &origin,
            &headers(&[
                ("set-cookie", "root=1; Path=/"),
                ("set-cookie", "app=2; Path=/app"),
            ]),
        );
        assert_eq!(
            jar.get(&url("http://example.com/app/other")).as_deref(),
            Some("app=2; root=1")
        );
        assert_eq!(jar.get(&url("http://example.com/")).as_deref(), Some("root=1"));
    }

    #[tokio::test]
    async fn missing_path_defaults_to_request_directory() {
        let jar = CookieJar::new(Duration::ZERO);
        jar.put(
            &url("http://example.com/docs/index.html"),
            &headers(&[("set-cookie", "d=1")]),
        );
        assert!(jar.get(&url("http://example.com/other")).is_none());
        assert_eq!(
            jar.get(&url("http://example.com/docs/a")).as_deref(),
            Some("d=1")
        );
    }

    #[tokio::test]
    async fn version1_cookie_gets_version_prefix() {
        let jar = CookieJar::new(Duration::ZERO);
        jar.put(
            &url("http://example.com/"),
            &headers(&[("set-cookie2", "sid=\"abc\"; Version=1; Path=\"/\"")]),
        );
        assert_eq!(
            jar.get(&url("http://example.com/")).as_deref(),
            Some("$Version=\"1\"; sid=\"abc\";$Path=\"/\"")
        );
    }

    #[tokio::test]
    async fn empty_port_list_binds_to_current_port() {
        let jar = CookieJar::new(Duration::ZERO);
        jar.put(
            &url("http://example.com:8080/"),
            &headers(&[("set-cookie2", "p=1; Version=1; Path=/; Port")]),
        );
        assert!(jar.get(&url("http://example.com:8080/")).is_some());
        assert!(jar.get(&url("http://example.com:9090/")).is_none());
    }

    #[tokio::test]
    async fn explicit_port_list_must_contain_current_port() {
        let jar = CookieJar::new(Duration::ZERO);
        jar.put(
            &url("http://example.com/"),
            &headers(&[("set-cookie2", "p=1; Version=1; Path=/; Port=\"8080\"")]),
        );
        assert!(jar.store().is_empty());
    }

    #[tokio::test]
    async fn max_age_zero_deletes_existing_cookie() {
        let jar = CookieJar::new(Duration::ZERO);
        let origin = url("http://example.com/");
        jar.put(&origin, &headers(&[("set-cookie", "token=1; Max-Age=3600; Path=/")]));
        assert!(jar.get(&origin).is_some());
        jar.put(&origin, &headers(&[("set-cookie", "token=; Max-Age=0; Path=/")]));
        assert!(jar.get(&origin).is_none());
        assert!(jar.store().is_empty());
    }

    #[tokio::test]
    async fn malformed_header_is_skipped() {
        let jar = CookieJar::new(Duration::ZERO);
        let origin = url("http://example.com/");
        jar.put(
            &origin,
            &headers(&[("set-cookie", "garbage"), ("set-cookie", "ok=1; Path=/")]),
        );
        assert_eq!(jar.get(&origin).as_deref(), Some("ok=1"));
    }
}
