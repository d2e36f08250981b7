#![allow(dead_code)]

pub mod logging;
pub mod net;
pub mod upstream;

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use h1engine::{ClientSettings, HttpClient, ServerSettings};

pub use logging::LogCapture;
pub use net::{find_free_port, wait_for_listener};
pub use upstream::{Reply, ScriptedUpstream, SeenRequest};

/// Client settings for tests: short timeouts so failures surface quickly.
pub fn client_settings() -> ClientSettings {
    ClientSettings {
        connect_timeout_ms: 2_000,
        response_timeout_ms: Some(5_000),
        ..ClientSettings::default()
    }
}

pub fn client(settings: ClientSettings) -> Result<HttpClient> {
    HttpClient::new(settings)
}

pub fn server_settings() -> ServerSettings {
    ServerSettings {
        listen: "127.0.0.1:0".parse().expect("listen address"),
        ..ServerSettings::default()
    }
}

/// Reads a header block up to and including the blank line.
pub async fn read_head<R>(reader: &mut R) -> Result<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = String::new();
    loop {
        let mut line = String::new();
        let read = reader.read_line(&mut line).await?;
        if read == 0 {
            if head.is_empty() {
                return Ok(head);
            }
            return Err(anyhow!("connection closed inside header block"));
        }
        head.push_str(&line);
        if line == "\r\n" {
            return Ok(head);
        }
    }
}

pub fn header_value<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then(|| value.trim())
    })
}

/// Reads the body announced by `head`: Content-Length or chunked.
pub async fn read_body<R>(reader: &mut R, head: &str) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    if header_value(head, "transfer-encoding").is_some_and(|value| value.contains("chunked")) {
        let mut body = Vec::new();
        loop {
            let mut size_line = String::new();
            reader.read_line(&mut size_line).await?;
            let size = usize::from_str_radix(size_line.trim(), 16)
                .with_context(|| format!("bad chunk size line {size_line:?}"))?;
            let mut chunk = vec![0; size + 2];
            reader.read_exact(&mut chunk).await?;
            if size == 0 {
                return Ok(body);
            }
            body.extend_from_slice(&chunk[..size]);
        }
    }
    let length = header_value(head, "content-length")
        .map(|value| value.parse::<usize>())
        .transpose()?
        .unwrap_or(0);
    let mut body = vec![0; length];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

pub fn shared<T>(value: T) -> Arc<parking_lot::Mutex<T>> {
    Arc::new(parking_lot::Mutex::new(value))
}
