use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use url::Url;

use super::{Cookie, domain_matches, netscape_domain_matches};
use crate::metrics;
use crate::util::{ShutdownTrigger, shutdown_channel, spawn_sweeper};

#[derive(Default)]
struct Indices {
    by_domain: HashMap<String, Vec<Cookie>>,
    /// Keyed by the origin host the cookie was received from.
    by_origin: HashMap<String, Vec<Cookie>>,
}

impl Indices {
    /// Every stored cookie is in the origin index; the domain index only adds a second route.
    fn len(&self) -> usize {
        self.by_origin.values().map(Vec::len).sum()
    }
}

struct StoreInner {
    indices: Mutex<Indices>,
}

/// In-memory cookie store indexed by cookie domain and by origin host.
pub struct CookieStore {
    inner: Arc<StoreInner>,
    shutdown: ShutdownTrigger,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

fn origin_key(url: &Url) -> String {
    url.host_str().unwrap_or_default().to_ascii_lowercase()
}

fn replace_in(list: &mut Vec<Cookie>, cookie: Cookie) {
    list.retain(|existing| !existing.same_identity(&cookie));
    list.push(cookie);
}

fn remove_from<K: std::hash::Hash + Eq + Clone>(
    index: &mut HashMap<K, Vec<Cookie>>,
    key: &K,
    cookie: &Cookie,
) {
    if let Some(list) = index.get_mut(key) {
        list.retain(|existing| !existing.same_identity(cookie));
        if list.is_empty() {
            index.remove(key);
        }
    }
}

impl CookieStore {
    /// Creates the store and starts its expiry sweep. A zero interval disables sweeping.
    pub fn new(sweep_interval: Duration) -> Self {
        let (shutdown, signal) = shutdown_channel();
        let inner = Arc::new(StoreInner {
            indices: Mutex::new(Indices::default()),
        });
        let weak: Weak<StoreInner> = Arc::downgrade(&inner);
        let sweeper = spawn_sweeper("cookie_store", sweep_interval, signal, move || {
            if let Some(inner) = weak.upgrade() {
                inner.sweep();
            }
        });
        Self {
            inner,
            shutdown,
            sweeper: Mutex::new(sweeper),
        }
    }

    /// Stores `cookie` received from `origin`. A cookie with max-age zero is never stored and
    /// removes a stored cookie with the same identity.
    pub fn add(&self, origin: &Url, cookie: Cookie) {
        let origin = origin_key(origin);
        let mut indices = self.inner.indices.lock();
        if cookie.max_age() == 0 {
            if let Some(domain) = cookie.domain().map(str::to_ascii_lowercase) {
                remove_from(&mut indices.by_domain, &domain, &cookie);
            }
            remove_from(&mut indices.by_origin, &origin, &cookie);
            trace!(name = cookie.name(), "cookie deleted by max-age 0");
        } else {
            if let Some(domain) = cookie.domain().map(str::to_ascii_lowercase) {
                replace_in(indices.by_domain.entry(domain).or_default(), cookie.clone());
            }
            replace_in(indices.by_origin.entry(origin).or_default(), cookie);
        }
        metrics::set_cookies_stored(indices.len());
    }

    /// Unexpired cookies for `url`: domain matches unioned with cookies received from the same
    /// host, without duplicates. Secure cookies are only returned for `https`.
    pub fn get(&self, url: &Url) -> Vec<Cookie> {
        let secure_link = url.scheme().eq_ignore_ascii_case("https");
        let host = url.host_str().unwrap_or_default();
        let origin = origin_key(url);
        let usable = |cookie: &Cookie| !cookie.has_expired() && (secure_link || !cookie.is_secure());

        let indices = self.inner.indices.lock();
        let mut result: Vec<Cookie> = Vec::new();
        for (domain, cookies) in &indices.by_domain {
            for cookie in cookies {
                let matches = if cookie.version() == 0 {
                    netscape_domain_matches(domain, host)
                } else {
                    domain_matches(domain, host)
                };
                if matches
                    && usable(cookie)
                    && !result.iter().any(|existing| existing.same_identity(cookie))
                {
                    result.push(cookie.clone());
                }
            }
        }
        if let Some(cookies) = indices.by_origin.get(&origin) {
            for cookie in cookies {
                if usable(cookie) && !result.iter().any(|existing| existing.same_identity(cookie))
                {
                    result.push(cookie.clone());
                }
            }
        }
        result
    }

    pub fn len(&self) -> usize {
        self.inner.indices.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes expired cookies from both indices.
    pub fn sweep(&self) {
        self.inner.sweep();
    }

    /// Stops the sweep and drops every cookie.
    pub fn close(&self) {
        self.shutdown.trigger();
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
        let mut indices = self.inner.indices.lock();
        indices.by_domain.clear();
        indices.by_origin.clear();
        metrics::set_cookies_stored(0);
    }
}

impl StoreInner {
    fn sweep(&self) {
        let mut guard = self.indices.lock();
        let indices = &mut *guard;
        let before = indices.len();
        for index in [&mut indices.by_domain, &mut indices.by_origin] {
            index.retain(|_, cookies| {
                cookies.retain(|cookie| !cookie.has_expired());
                !cookies.is_empty()
            });
        }
        let after = indices.len();
        if before != after {
            debug!(removed = before - after, remaining = after, "swept expired cookies");
        }
        metrics::set_cookies_stored(after);
    }
}

impl Drop for CookieStore {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

impl std::fmt::Debug for CookieStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CookieStore").field("len", &self.len()).finish()
    }
}
