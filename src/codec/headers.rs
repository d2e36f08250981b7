use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use http::HeaderMap;
use http::header::{HeaderName, HeaderValue};

/// `Keep-Alive` parameters announced by the peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeepAliveParams {
    pub timeout: Option<Duration>,
    pub max: Option<u32>,
}

impl KeepAliveParams {
    pub fn parse(value: &str) -> Self {
        let mut params = KeepAliveParams::default();
        for item in value.split(',') {
            let Some((key, raw)) = item.split_once('=') else {
                continue;
            };
            let raw = raw.trim().trim_matches('"');
            match key.trim().to_ascii_lowercase().as_str() {
                "timeout" => {
                    params.timeout = raw.parse::<u64>().ok().map(Duration::from_secs);
                }
                "max" => params.max = raw.parse().ok(),
                _ => {}
            }
        }
        params
    }
}

/// Framing-relevant facts extracted while the header block was parsed.
#[derive(Debug, Clone, Default)]
pub struct Framing {
    pub content_length: Option<u64>,
    pub chunked: bool,
    pub transfer_encoding_present: bool,
    pub connection_tokens: HashSet<String>,
    pub expect_continue: bool,
    pub keep_alive: KeepAliveParams,
}

impl Framing {
    pub fn has_connection_token(&self, token: &str) -> bool {
        self.connection_tokens.contains(token)
    }

    pub fn wants_close(&self) -> bool {
        self.has_connection_token("close")
    }

    pub fn wants_keep_alive(&self) -> bool {
        self.has_connection_token("keep-alive")
    }

    pub fn is_upgrade(&self) -> bool {
        self.has_connection_token("upgrade")
    }
}

/// Collects header lines into a [`HeaderMap`] while enforcing the header size budget and
/// rejecting ambiguous framing.
pub(crate) struct HeaderAccumulator {
    max_bytes: usize,
    consumed: usize,
    headers: HeaderMap,
    framing: Framing,
    expect_seen: bool,
}

impl HeaderAccumulator {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            consumed: 0,
            headers: HeaderMap::new(),
            framing: Framing::default(),
            expect_seen: false,
        }
    }

    pub fn reserve(&mut self, byte_len: usize) -> Result<()> {
        self.consumed = self
            .consumed
            .checked_add(byte_len)
            .ok_or_else(|| anyhow!("header section exceeds configured limit"))?;
        ensure!(
            self.consumed <= self.max_bytes,
            "header section exceeds configured limit of {} bytes",
            self.max_bytes
        );
        Ok(())
    }

    /// Adds one raw line. Returns `Ok(false)` on the blank line ending the header block.
    pub fn push_line(&mut self, line: &str) -> Result<bool> {
        self.reserve(line.len())?;
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            return Ok(false);
        }

        let (name, value) = trimmed
            .split_once(':')
            .ok_or_else(|| anyhow!("header missing ':' separator"))?;
        if name.is_empty() || name.ends_with(char::is_whitespace) {
            bail!("invalid header name '{name}'");
        }
        let value = value.trim();
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| anyhow!("invalid header name '{name}'"))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|_| anyhow!("invalid value for header '{name}'"))?;
        self.record(&header_name, value)?;
        self.headers.append(header_name, header_value);
        Ok(true)
    }

    fn record(&mut self, name: &HeaderName, value: &str) -> Result<()> {
        match name.as_str() {
            "content-length" => {
                if self.framing.transfer_encoding_present {
                    bail!("message must not include both Content-Length and Transfer-Encoding");
                }
                if self.framing.content_length.is_some() {
                    bail!("multiple Content-Length headers are not supported");
                }
                let length: u64 = value
                    .parse()
                    .with_context(|| format!("invalid Content-Length value '{value}'"))?;
                self.framing.content_length = Some(length);
            }
            "transfer-encoding" => {
                if self.framing.content_length.is_some() {
                    bail!("message must not include both Content-Length and Transfer-Encoding");
                }
                self.framing.transfer_encoding_present = true;
                let last = value
                    .split(',')
                    .map(|item| item.trim())
                    .rfind(|item| !item.is_empty())
                    .unwrap_or_default();
                self.framing.chunked = last.eq_ignore_ascii_case("chunked");
            }
            "connection" => {
                for token in value.split(',') {
                    let token = token.trim();
                    if !token.is_empty() {
                        self.framing
                            .connection_tokens
                            .insert(token.to_ascii_lowercase());
                    }
                }
            }
            "keep-alive" => {
                self.framing.keep_alive = KeepAliveParams::parse(value);
            }
            "expect" => {
                if self.expect_seen {
                    bail!("multiple Expect headers are not supported");
                }
                self.expect_seen = true;
                if !value.eq_ignore_ascii_case("100-continue") {
                    bail!("unsupported Expect header value '{value}'");
                }
                self.framing.expect_continue = true;
            }
            _ => {}
        }
        Ok(())
    }

    pub fn total_bytes(&self) -> usize {
        self.consumed
    }

    pub fn finish(self) -> (HeaderMap, Framing) {
        (self.headers, self.framing)
    }
}

/// Header names managed by the codec itself; caller-supplied values are dropped on encode.
pub(crate) fn is_framing_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "content-length" | "transfer-encoding" | "keep-alive"
    )
}

pub(crate) fn write_header_map(buffer: &mut Vec<u8>, headers: &HeaderMap, skip: impl Fn(&HeaderName) -> bool) {
    for (name, value) in headers {
        if skip(name) {
            continue;
        }
        buffer.extend_from_slice(name.as_str().as_bytes());
        buffer.extend_from_slice(b": ");
        buffer.extend_from_slice(value.as_bytes());
        buffer.extend_from_slice(b"\r\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_headers_and_connection_tokens() {
        let mut accumulator = HeaderAccumulator::new(256);
        assert!(accumulator.push_line("Connection: Keep-Alive, Upgrade\r\n").unwrap());
        assert!(accumulator.push_line("Keep-Alive: timeout=5, max=10\r\n").unwrap());
        assert!(accumulator.push_line("Set-Cookie: a=1\r\n").unwrap());
        assert!(accumulator.push_line("Set-Cookie: b=2\r\n").unwrap());
        assert!(!accumulator.push_line("\r\n").unwrap());
        let (headers, framing) = accumulator.finish();
        assert_eq!(headers.get_all("set-cookie").iter().count(), 2);
        assert!(framing.wants_keep_alive());
        assert!(framing.is_upgrade());
        assert_eq!(
            framing.keep_alive,
            KeepAliveParams {
                timeout: Some(Duration::from_secs(5)),
                max: Some(10),
            }
        );
    }

    #[test]
    fn expect_continue_detects_header() {
        let mut accumulator = HeaderAccumulator::new(256);
        accumulator.push_line("Expect: 100-continue\r\n").unwrap();
        let (_, framing) = accumulator.finish();
        assert!(framing.expect_continue);
    }

    #[test]
    fn expect_continue_rejects_unknown_value() {
        let mut accumulator = HeaderAccumulator::new(256);
        let err = accumulator
            .push_line("Expect: something-else\r\n")
            .expect_err("unsupported Expect should error");
        assert!(
            err.to_string().contains("unsupported Expect"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn rejects_content_length_with_transfer_encoding() {
        let mut accumulator = HeaderAccumulator::new(256);
        accumulator.push_line("Transfer-Encoding: chunked\r\n").unwrap();
        let err = accumulator
            .push_line("Content-Length: 10\r\n")
            .expect_err("ambiguous framing should error");
        assert!(err.to_string().contains("both Content-Length"));
    }

    #[test]
    fn rejects_duplicate_content_length() {
        let mut accumulator = HeaderAccumulator::new(256);
        accumulator.push_line("Content-Length: 10\r\n").unwrap();
        assert!(accumulator.push_line("Content-Length: 10\r\n").is_err());
    }

    #[test]
    fn chunked_must_be_final_coding() {
        let mut accumulator = HeaderAccumulator::new(256);
        accumulator
            .push_line("Transfer-Encoding: chunked, gzip\r\n")
            .unwrap();
        let (_, framing) = accumulator.finish();
        assert!(framing.transfer_encoding_present);
        assert!(!framing.chunked);
    }

    #[test]
    fn reject_invalid_header_name() {
        let mut accumulator = HeaderAccumulator::new(256);
        let err = accumulator
            .push_line("Bad Name: value\r\n")
            .expect_err("invalid header name should error");
        assert!(
            err.to_string().contains("invalid header name"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn enforces_header_budget() {
        let mut accumulator = HeaderAccumulator::new(16);
        let err = accumulator
            .push_line("X-Long-Header: some long value\r\n")
            .expect_err("budget exceeded");
        assert!(err.to_string().contains("exceeds configured limit"));
    }
}
