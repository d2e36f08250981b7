use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::path::Path;
use std::time::Duration;

use anyhow::{Result, ensure};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::client::proxy::ProxySettings;

const CLIENT_ENV_PREFIX: &str = "H1ENGINE_CLIENT";
const SERVER_ENV_PREFIX: &str = "H1ENGINE_SERVER";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Text,
}

/// Which redirect responses the client follows on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FollowRedirects {
    #[default]
    Off,
    /// 301/302/307 only for GET and HEAD, 303 for POST and PUT.
    Rfc,
    /// 301/302/307 for every method, 303 for POST and PUT.
    All,
}

fn default_max_redirects() -> u32 {
    5
}

fn default_max_retries() -> u32 {
    4
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout_ms() -> u64 {
    60_000
}

fn default_continue_timeout_ms() -> u64 {
    3_000
}

fn default_pooled_idle_timeout_ms() -> u64 {
    3_000
}

fn default_pooled_max_life_ms() -> u64 {
    30_000
}

fn default_max_idle_connections() -> usize {
    32
}

fn default_max_replay_buffer_size() -> usize {
    4 * 1024 * 1024
}

fn default_max_header_size() -> usize {
    32 * 1024
}

fn default_cookie_sweep_interval_ms() -> u64 {
    30_000
}

fn default_user_agent() -> String {
    format!("h1engine/{}", env!("CARGO_PKG_VERSION"))
}

fn default_session_cookie_name() -> String {
    String::from("SESSIONID")
}

fn default_session_prefix() -> String {
    String::from("srv")
}

fn default_session_max_inactive_secs() -> u64 {
    1_800
}

fn default_session_sweep_interval_ms() -> u64 {
    5_000
}

fn default_max_downgrade_buffer() -> usize {
    1024 * 1024
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientSettings {
    #[serde(default = "default_max_redirects")]
    pub max_redirects: u32,
    #[serde(default)]
    pub follow_redirects: FollowRedirects,
    #[serde(default)]
    pub treat_302_as_303: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_true")]
    pub auto_handle_cookies: bool,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default)]
    pub response_timeout_ms: Option<u64>,
    #[serde(default)]
    pub body_receive_timeout_ms: Option<u64>,
    #[serde(default = "default_continue_timeout_ms")]
    pub continue_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub close_on_5xx: bool,
    #[serde(default = "default_pooled_idle_timeout_ms")]
    pub pooled_idle_timeout_ms: u64,
    #[serde(default = "default_pooled_max_life_ms")]
    pub pooled_max_life_ms: u64,
    #[serde(default = "default_max_idle_connections")]
    pub max_idle_connections: usize,
    #[serde(default = "default_max_replay_buffer_size")]
    pub max_replay_buffer_size: usize,
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
    #[serde(default = "default_cookie_sweep_interval_ms")]
    pub cookie_sweep_interval_ms: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub transaction_log_size: usize,
    #[serde(default)]
    pub log: LogFormat,
    #[serde(default)]
    pub proxy: Option<ProxySettings>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            max_redirects: default_max_redirects(),
            follow_redirects: FollowRedirects::default(),
            treat_302_as_303: false,
            max_retries: default_max_retries(),
            auto_handle_cookies: true,
            connect_timeout_ms: default_connect_timeout_ms(),
            response_timeout_ms: None,
            body_receive_timeout_ms: None,
            continue_timeout_ms: default_continue_timeout_ms(),
            close_on_5xx: true,
            pooled_idle_timeout_ms: default_pooled_idle_timeout_ms(),
            pooled_max_life_ms: default_pooled_max_life_ms(),
            max_idle_connections: default_max_idle_connections(),
            max_replay_buffer_size: default_max_replay_buffer_size(),
            max_header_size: default_max_header_size(),
            cookie_sweep_interval_ms: default_cookie_sweep_interval_ms(),
            user_agent: default_user_agent(),
            transaction_log_size: 0,
            log: LogFormat::default(),
            proxy: None,
        }
    }
}

impl ClientSettings {
    pub fn load(path: &Path) -> Result<Self> {
        let settings: ClientSettings = load_layered(path, CLIENT_ENV_PREFIX)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.max_header_size > 0,
            "max_header_size must be greater than 0 (got {})",
            self.max_header_size
        );
        ensure!(
            self.connect_timeout_ms > 0,
            "connect_timeout_ms must be greater than 0 (got {})",
            self.connect_timeout_ms
        );
        ensure!(
            self.max_idle_connections > 0,
            "max_idle_connections must be at least 1 (got {})",
            self.max_idle_connections
        );
        ensure!(
            self.response_timeout_ms != Some(0),
            "response_timeout_ms must be greater than 0 when set"
        );
        ensure!(
            self.body_receive_timeout_ms != Some(0),
            "body_receive_timeout_ms must be greater than 0 when set"
        );
        if let Some(proxy) = &self.proxy {
            proxy.validate()?;
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn response_timeout(&self) -> Option<Duration> {
        self.response_timeout_ms.map(Duration::from_millis)
    }

    pub fn body_receive_timeout(&self) -> Option<Duration> {
        self.body_receive_timeout_ms.map(Duration::from_millis)
    }

    pub fn continue_timeout(&self) -> Duration {
        Duration::from_millis(self.continue_timeout_ms)
    }

    pub fn pooled_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.pooled_idle_timeout_ms)
    }

    pub fn pooled_max_life(&self) -> Duration {
        Duration::from_millis(self.pooled_max_life_ms)
    }

    pub fn cookie_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.cookie_sweep_interval_ms)
    }

    pub fn max_idle_connections_nonzero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.max_idle_connections).unwrap_or(NonZeroUsize::MIN)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    #[serde(default)]
    pub max_transactions: Option<u32>,
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
    #[serde(default)]
    pub idle_timeout_ms: Option<u64>,
    #[serde(default = "default_continue_timeout_ms")]
    pub continue_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub close_on_error: bool,
    #[serde(default = "default_session_cookie_name")]
    pub session_cookie_name: String,
    #[serde(default = "default_session_prefix")]
    pub session_prefix: String,
    #[serde(default = "default_session_max_inactive_secs")]
    pub session_max_inactive_secs: u64,
    #[serde(default = "default_session_sweep_interval_ms")]
    pub session_sweep_interval_ms: u64,
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
    #[serde(default = "default_max_downgrade_buffer")]
    pub max_downgrade_buffer: usize,
    /// Gzip eligible responses larger than this many bytes when the client accepts gzip.
    /// Unset disables compression.
    #[serde(default)]
    pub auto_compress_threshold: Option<usize>,
    #[serde(default)]
    pub transaction_log_size: usize,
    #[serde(default)]
    pub log: LogFormat,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_transactions: None,
            request_timeout_ms: None,
            idle_timeout_ms: None,
            continue_timeout_ms: default_continue_timeout_ms(),
            close_on_error: true,
            session_cookie_name: default_session_cookie_name(),
            session_prefix: default_session_prefix(),
            session_max_inactive_secs: default_session_max_inactive_secs(),
            session_sweep_interval_ms: default_session_sweep_interval_ms(),
            max_header_size: default_max_header_size(),
            max_downgrade_buffer: default_max_downgrade_buffer(),
            auto_compress_threshold: None,
            transaction_log_size: 0,
            log: LogFormat::default(),
        }
    }
}

impl ServerSettings {
    pub fn load(path: &Path) -> Result<Self> {
        let settings: ServerSettings = load_layered(path, SERVER_ENV_PREFIX)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.max_header_size > 0,
            "max_header_size must be greater than 0 (got {})",
            self.max_header_size
        );
        ensure!(
            self.max_transactions != Some(0),
            "max_transactions must be at least 1 when set"
        );
        ensure!(
            !self.session_cookie_name.is_empty(),
            "session_cookie_name must not be empty"
        );
        ensure!(
            !self.session_prefix.contains('-'),
            "session_prefix must not contain '-' (got {})",
            self.session_prefix
        );
        ensure!(
            self.session_max_inactive_secs > 0,
            "session_max_inactive_secs must be greater than 0 (got {})",
            self.session_max_inactive_secs
        );
        Ok(())
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }

    pub fn continue_timeout(&self) -> Duration {
        Duration::from_millis(self.continue_timeout_ms)
    }

    pub fn session_max_inactive(&self) -> Duration {
        Duration::from_secs(self.session_max_inactive_secs)
    }

    pub fn session_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.session_sweep_interval_ms)
    }
}

fn load_layered<T>(path: &Path, env_prefix: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    let cfg = Config::builder()
        .add_source(File::from(path.to_path_buf()).required(true))
        .add_source(
            Environment::with_prefix(env_prefix)
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .map_err(to_anyhow)?;
    cfg.try_deserialize().map_err(to_anyhow)
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}
