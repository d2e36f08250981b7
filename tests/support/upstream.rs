use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use super::{header_value, read_body, read_head};

/// One request as the upstream received it.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub head: String,
    pub body: Vec<u8>,
    /// Index of the TCP connection it arrived on, in accept order.
    pub connection: usize,
}

impl SeenRequest {
    pub fn request_line(&self) -> &str {
        self.head.lines().next().unwrap_or_default()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.head, name)
    }
}

pub enum Reply {
    Raw(Vec<u8>),
    /// Close the connection without answering.
    Drop,
}

impl Reply {
    pub fn status(code: u16, reason: &str, headers: &[(&str, &str)], body: &str) -> Self {
        let mut raw = format!("HTTP/1.1 {code} {reason}\r\n");
        for (name, value) in headers {
            raw.push_str(&format!("{name}: {value}\r\n"));
        }
        raw.push_str(&format!("Content-Length: {}\r\n\r\n{body}", body.len()));
        Reply::Raw(raw.into_bytes())
    }

    pub fn ok(body: &str) -> Self {
        Self::status(200, "OK", &[], body)
    }

    pub fn redirect(code: u16, location: &str) -> Self {
        let reason = match code {
            301 => "Moved Permanently",
            302 => "Found",
            303 => "See Other",
            307 => "Temporary Redirect",
            _ => "Redirect",
        };
        Self::status(code, reason, &[("Location", location)], "")
    }

    fn closes(&self) -> bool {
        match self {
            Reply::Raw(raw) => String::from_utf8_lossy(raw)
                .split("\r\n\r\n")
                .next()
                .is_some_and(|head| header_value(head, "connection") == Some("close")),
            Reply::Drop => true,
        }
    }
}

type Responder = Arc<dyn Fn(usize, &SeenRequest) -> Reply + Send + Sync>;

/// HTTP/1.1 origin answering each request with whatever the script returns for it. The
/// script gets the zero-based index of the request across all connections.
pub struct ScriptedUpstream {
    addr: SocketAddr,
    seen: Arc<Mutex<Vec<SeenRequest>>>,
    connections: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl ScriptedUpstream {
    pub async fn start<F>(script: F) -> Result<Self>
    where
        F: Fn(usize, &SeenRequest) -> Reply + Send + Sync + 'static,
    {
        Self::start_with(false, script).await
    }

    /// Like [`ScriptedUpstream::start`], but answers `Expect: 100-continue` with an interim
    /// `100 Continue` before reading the body.
    pub async fn start_answering_continue<F>(script: F) -> Result<Self>
    where
        F: Fn(usize, &SeenRequest) -> Reply + Send + Sync + 'static,
    {
        Self::start_with(true, script).await
    }

    async fn start_with<F>(answer_continue: bool, script: F) -> Result<Self>
    where
        F: Fn(usize, &SeenRequest) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));
        let script: Responder = Arc::new(script);
        let state = (seen.clone(), connections.clone());
        let handle = tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                let connection = state.1.fetch_add(1, Ordering::SeqCst);
                let seen = state.0.clone();
                let script = script.clone();
                tokio::spawn(async move {
                    let _ = serve(stream, connection, answer_continue, seen, script).await;
                });
            }
        });
        Ok(Self {
            addr,
            seen,
            connections,
            handle,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub fn seen(&self) -> Vec<SeenRequest> {
        self.seen.lock().clone()
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

impl Drop for ScriptedUpstream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve(
    stream: TcpStream,
    connection: usize,
    answer_continue: bool,
    seen: Arc<Mutex<Vec<SeenRequest>>>,
    script: Responder,
) -> Result<()> {
    let mut reader = BufReader::new(stream);
    loop {
        let head = read_head(&mut reader).await?;
        if head.is_empty() {
            return Ok(());
        }
        if answer_continue
            && header_value(&head, "expect")
                .is_some_and(|value| value.eq_ignore_ascii_case("100-continue"))
        {
            reader
                .get_mut()
                .write_all(b"HTTP/1.1 100 Continue\r\n\r\n")
                .await?;
            reader.get_mut().flush().await?;
        }
        let body = read_body(&mut reader, &head).await?;
        let request = SeenRequest {
            head,
            body,
            connection,
        };
        let index = {
            let mut seen = seen.lock();
            seen.push(request.clone());
            seen.len() - 1
        };
        let reply = script(index, &request);
        let closes = reply.closes();
        match reply {
            Reply::Drop => return Ok(()),
            Reply::Raw(raw) => {
                reader.get_mut().write_all(&raw).await?;
                reader.get_mut().flush().await?;
            }
        }
        if closes {
            reader.get_mut().shutdown().await.ok();
            return Ok(());
        }
    }
}
