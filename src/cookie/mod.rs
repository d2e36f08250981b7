//! Client-side cookie handling: parsing of `Set-Cookie`/`Set-Cookie2`, the in-memory store
//! and the jar that renders `Cookie` request headers.

mod manager;
mod store;

pub use manager::CookieJar;
pub use store::CookieStore;

use std::fmt;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc2822;
use tokio::time::Instant;

/// Max-age of a cookie that lives until the client closes.
pub const SESSION_MAX_AGE: i64 = -1;

#[derive(Debug, Clone)]
pub struct Cookie {
    name: String,
    value: String,
    domain: Option<String>,
    path: Option<String>,
    /// Comma-separated port list. `Some("")` means the port the cookie was received on.
    port_list: Option<String>,
    max_age: i64,
    secure: bool,
    version: u8,
    created: Instant,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into().trim().to_string(),
            value: value.into(),
            domain: None,
            path: None,
            port_list: None,
            max_age: SESSION_MAX_AGE,
            secure: false,
            version: 1,
            created: Instant::now(),
        }
    }

    /// Parses one `Set-Cookie` or `Set-Cookie2` header value. Version 1 headers may carry
    /// several cookies separated by commas outside quoted strings.
    pub fn parse(header: &str, set_cookie2: bool) -> Result<Vec<Cookie>> {
        let header = strip_prefix_ignore_case(header, "set-cookie2:")
            .or_else(|| strip_prefix_ignore_case(header, "set-cookie:"))
            .unwrap_or(header);
        let version = detect_version(header, set_cookie2);
        if version == 0 {
            let mut cookie = parse_single(header, version)?;
            cookie.version = 0;
            return Ok(vec![cookie]);
        }
        split_outside_quotes(header)
            .into_iter()
            .filter(|part| !part.trim().is_empty())
            .map(|part| parse_single(part, version))
            .collect()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn port_list(&self) -> Option<&str> {
        self.port_list.as_deref()
    }

    pub fn max_age(&self) -> i64 {
        self.max_age
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_max_age(mut self, max_age: i64) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn with_version(mut self, version: u8) -> Self {
        self.version = version;
        self
    }

    pub(crate) fn set_path(&mut self, path: String) {
        self.path = Some(path);
    }

    pub(crate) fn set_port_list(&mut self, ports: String) {
        self.port_list = Some(ports);
    }

    /// A max-age of zero expires immediately; a negative one never expires.
    pub fn has_expired(&self) -> bool {
        match self.max_age {
            0 => true,
            age if age < 0 => false,
            age => self.created.elapsed() > Duration::from_secs(age as u64),
        }
    }

    /// Name and domain compare case-insensitively, the path exactly.
    pub fn same_identity(&self, other: &Cookie) -> bool {
        self.name.eq_ignore_ascii_case(&other.name)
            && match (&self.domain, &other.domain) {
                (Some(left), Some(right)) => left.eq_ignore_ascii_case(right),
                (None, None) => true,
                _ => false,
            }
            && self.path == other.path
    }

    pub fn allows_port(&self, port: u16) -> bool {
        match self.port_list.as_deref() {
            None | Some("") => true,
            Some(ports) => port_in_list(ports, port),
        }
    }
}

/// Renders the cookie as it appears in a `Cookie` request header.
impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.version == 0 {
            return write!(f, "{}={}", self.name, self.value);
        }
        write!(f, "{}=\"{}\"", self.name, self.value)?;
        if let Some(path) = &self.path {
            write!(f, ";$Path=\"{path}\"")?;
        }
        if let Some(ports) = &self.port_list {
            write!(f, ";$Port=\"{ports}\"")?;
        }
        if let Some(domain) = &self.domain {
            write!(f, ";$Domain=\"{domain}\"")?;
        }
        Ok(())
    }
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    let head = value.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &value[prefix.len()..])
}

/// `expires` marks a Netscape cookie; `version` or `max-age` an RFC 2965 one.
fn detect_version(header: &str, set_cookie2: bool) -> u8 {
    let lower = header.to_ascii_lowercase();
    if lower.contains("expires=") {
        0
    } else if lower.contains("version=") || lower.contains("max-age") || set_cookie2 {
        1
    } else {
        0
    }
}

fn split_outside_quotes(header: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (index, ch) in header.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(&header[start..index]);
                start = index + 1;
            }
            _ => {}
        }
    }
    parts.push(&header[start..]);
    parts
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(value)
}

fn parse_single(header: &str, version: u8) -> Result<Cookie> {
    let mut attributes = header.split(';');
    let pair = attributes
        .next()
        .filter(|pair| !pair.trim().is_empty())
        .ok_or_else(|| anyhow!("empty cookie header"))?;
    let Some((name, value)) = pair.split_once('=') else {
        bail!("invalid cookie name-value pair '{}'", pair.trim());
    };
    let name = name.trim();
    if name.is_empty() {
        bail!("cookie name must not be empty");
    }
    let mut cookie = Cookie::new(name, unquote(value.trim())).with_version(version);
    let mut expires = None;

    for attribute in attributes {
        let (key, value) = match attribute.split_once('=') {
            Some((key, value)) => (key.trim(), Some(value.trim())),
            None => (attribute.trim(), None),
        };
        match key.to_ascii_lowercase().as_str() {
            "domain" => cookie.domain = value.map(|value| unquote(value).to_string()),
            "path" => cookie.path = value.map(|value| unquote(value).to_string()),
            "max-age" => {
                if cookie.max_age == SESSION_MAX_AGE
                    && let Some(age) = value.and_then(|value| unquote(value).parse::<i64>().ok())
                {
                    cookie.max_age = age;
                }
            }
            "expires" => expires = value.map(unquote),
            "port" => cookie.port_list = Some(value.map(unquote).unwrap_or_default().to_string()),
            "secure" => cookie.secure = true,
            _ => {}
        }
    }

    if version == 0
        && cookie.max_age == SESSION_MAX_AGE
        && let Some(expires) = expires
    {
        cookie.max_age = max_age_from_expires(expires);
    }
    Ok(cookie)
}

/// Converts a Netscape `expires` date into a max-age. Dates in the past expire immediately;
/// unparsable dates leave the cookie a session cookie.
fn max_age_from_expires(expires: &str) -> i64 {
    match OffsetDateTime::parse(expires, &Rfc2822) {
        Ok(at) => {
            let remaining = (at - OffsetDateTime::now_utc()).whole_seconds();
            remaining.max(0)
        }
        Err(_) => SESSION_MAX_AGE,
    }
}

pub(crate) fn port_in_list(ports: &str, port: u16) -> bool {
    ports
        .split(',')
        .filter_map(|item| item.trim().parse::<u16>().ok())
        .any(|candidate| candidate == port)
}

/// RFC 2965 domain match: the domain needs an embedded dot (or is `.local`) and the host may
/// only add a single label in front of it.
pub(crate) fn domain_matches(domain: &str, host: &str) -> bool {
    domain_match_impl(domain, host, false)
}

/// Netscape rule: like [`domain_matches`], but any number of host labels may precede the
/// domain.
pub(crate) fn netscape_domain_matches(domain: &str, host: &str) -> bool {
    domain_match_impl(domain, host, true)
}

fn domain_match_impl(domain: &str, host: &str, any_prefix: bool) -> bool {
    let is_local = domain.eq_ignore_ascii_case(".local");
    let search_from = usize::from(domain.starts_with('.'));
    let embedded_dot = domain[search_from..]
        .find('.')
        .map(|index| index + search_from);
    let valid_dot = embedded_dot.is_some_and(|index| index != domain.len() - 1);
    if !is_local && !valid_dot {
        return false;
    }
    if is_local && !host.contains('.') {
        return true;
    }
    if host.len() == domain.len() {
        return host.eq_ignore_ascii_case(domain);
    }
    if host.len() > domain.len() {
        let split = host.len() - domain.len();
        let (prefix, suffix) = host.split_at(split);
        return suffix.eq_ignore_ascii_case(domain) && (any_prefix || !prefix.contains('.'));
    }
    if host.len() + 1 == domain.len() {
        return domain.starts_with('.') && host.eq_ignore_ascii_case(&domain[1..]);
    }
    false
}
