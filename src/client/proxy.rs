use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, ensure};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use http::StatusCode;
use http::header::{HeaderName, HeaderValue, PROXY_AUTHORIZATION};
use serde::Deserialize;
use tokio::io::{AsyncWriteExt, BufReader};
use tracing::{debug, warn};

use super::chain::{Capabilities, Exchange, Next, RequestHandler};
use super::connection::{ClientConnection, ConnectionOptions};
use crate::codec::read_response_head;
use crate::error::HttpError;
use crate::message::{ProxyRoute, Request, Response};
use crate::tls::LazyClientConfig;
use crate::transport::{Transport, connect_tcp, tls_handshake};

static PROXY_CONNECTION: HeaderName = HeaderName::from_static("proxy-connection");

/// Forward proxy used for every request of a client.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ProxySettings {
    pub host: String,
    pub port: u16,
    /// Proxy used for `https` targets; defaults to `host`/`port`.
    #[serde(default)]
    pub secured_host: Option<String>,
    #[serde(default)]
    pub secured_port: Option<u16>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl ProxySettings {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            secured_host: None,
            secured_port: None,
            user: None,
            password: None,
        }
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_secured_proxy(mut self, host: impl Into<String>, port: u16) -> Self {
        self.secured_host = Some(host.into());
        self.secured_port = Some(port);
        self
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.host.is_empty(), "proxy host must not be empty");
        ensure!(self.port > 0, "proxy port must be greater than 0");
        ensure!(
            self.user.is_none() || self.password.is_some(),
            "proxy user {} is set without a password",
            self.user.as_deref().unwrap_or_default()
        );
        Ok(())
    }

    /// Host and port of the proxy serving a target with the given scheme.
    pub fn endpoint(&self, secure: bool) -> (&str, u16) {
        if secure {
            (
                self.secured_host.as_deref().unwrap_or(&self.host),
                self.secured_port.unwrap_or(self.port),
            )
        } else {
            (&self.host, self.port)
        }
    }

    /// `Proxy-Authorization` value when credentials are configured.
    pub fn authorization(&self) -> Option<HeaderValue> {
        let user = self.user.as_deref()?;
        let password = self.password.as_deref()?;
        let encoded = STANDARD.encode(format!("{user}:{password}"));
        HeaderValue::from_str(&format!("Basic {encoded}")).ok()
    }
}

/// Sends plain requests to the proxy in absolute form, and tunnels `https` and upgrade
/// requests through `CONNECT`.
pub struct ProxyHandler {
    settings: ProxySettings,
    connect_timeout: Duration,
    connection: ConnectionOptions,
    tls: Arc<LazyClientConfig>,
}

impl ProxyHandler {
    pub fn new(
        settings: ProxySettings,
        connect_timeout: Duration,
        connection: ConnectionOptions,
        tls: Arc<LazyClientConfig>,
    ) -> Self {
        Self {
            settings,
            connect_timeout,
            connection,
            tls,
        }
    }

    pub fn settings(&self) -> &ProxySettings {
        &self.settings
    }

    fn needs_tunnel(request: &Request) -> bool {
        request.is_secure() || request.is_upgrade()
    }

    fn tunnel_request(&self, request: &Request) -> Vec<u8> {
        let target = format!("{}:{}", request.host(), request.port());
        let mut head = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
        if let Some(agent) = &self.connection.user_agent {
            head.push_str(&format!("User-Agent: {agent}\r\n"));
        }
        if let Some(auth) = self.settings.authorization()
            && let Ok(auth) = auth.to_str()
        {
            head.push_str(&format!("Proxy-Authorization: {auth}\r\n"));
        }
        head.push_str("Proxy-Connection: keep-alive\r\n\r\n");
        head.into_bytes()
    }

    /// Opens a `CONNECT` tunnel to the request's target and wraps it as a connection that
    /// closes after one response.
    async fn tunnel(&self, request: &Request) -> Result<ClientConnection, HttpError> {
        let (proxy_host, proxy_port) = self.settings.endpoint(request.is_secure());
        let stream = connect_tcp(proxy_host, proxy_port, self.connect_timeout).await?;
        let mut reader = BufReader::new(stream);
        let proxy_error = |what: &str, err: &dyn std::fmt::Display| {
            HttpError::Proxy(format!("{what} {proxy_host}:{proxy_port}: {err}"))
        };

        reader
            .get_mut()
            .write_all(&self.tunnel_request(request))
            .await
            .map_err(|err| proxy_error("failed to send CONNECT to", &err))?;
        let head = read_response_head(
            &mut reader,
            self.connection.max_header_size,
            Some(self.connect_timeout),
        )
        .await
        .map_err(|err| proxy_error("failed to read CONNECT response from", &format!("{err:#}")))?;
        if head.status != StatusCode::OK {
            warn!(
                proxy = %format!("{proxy_host}:{proxy_port}"),
                target = %request.authority(),
                status = head.status.as_u16(),
                "proxy refused tunnel"
            );
            return Err(HttpError::Proxy(format!(
                "could not set up tunnel to {}:{} via {proxy_host}:{proxy_port}: got {} {}",
                request.host(),
                request.port(),
                head.status.as_u16(),
                head.reason
            )));
        }
        if !reader.buffer().is_empty() {
            return Err(HttpError::Proxy(
                "proxy sent data after the CONNECT response".to_string(),
            ));
        }
        let stream = reader.into_inner();
        debug!(
            proxy = %format!("{proxy_host}:{proxy_port}"),
            target = %request.authority(),
            tls = request.is_secure(),
            "proxy tunnel established"
        );

        let transport = if request.is_secure() {
            let config = self.tls.get()?;
            Transport::Tls(Box::new(tls_handshake(config, request.host(), stream).await?))
        } else {
            Transport::Plain(stream)
        };
        let mut options = self.connection.clone();
        options.auto_close = true;
        Ok(ClientConnection::new(
            transport,
            format!("{}:{} via {proxy_host}:{proxy_port}", request.host(), request.port()),
            options,
        ))
    }
}

#[async_trait]
impl RequestHandler for ProxyHandler {
    fn name(&self) -> &'static str {
        "proxy"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            request: true,
            connect: true,
            lifecycle: false,
        }
    }

    async fn on_request(&self, mut exchange: Exchange, next: Next) -> Result<Response, HttpError> {
        if !Self::needs_tunnel(&exchange.request) {
            let (host, port) = self.settings.endpoint(false);
            let request = &mut exchange.request;
            request.extensions.insert(ProxyRoute {
                host: host.to_string(),
                port,
            });
            if let Some(auth) = self.settings.authorization() {
                request.headers.insert(PROXY_AUTHORIZATION, auth);
            }
            request
                .headers
                .insert(PROXY_CONNECTION.clone(), HeaderValue::from_static("keep-alive"));
        }
        next.run(exchange).await
    }

    async fn connect(&self, exchange: &Exchange) -> Option<Result<ClientConnection, HttpError>> {
        if !Self::needs_tunnel(&exchange.request) {
            return None;
        }
        Some(self.tunnel(&exchange.request).await)
    }
}
