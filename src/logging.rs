use std::time::Duration;

use anyhow::{Result, anyhow};
use http::{Method, StatusCode};
use time::OffsetDateTime;
use tracing_subscriber::{EnvFilter, fmt};

use crate::settings::LogFormat;
use crate::transaction_log::ExchangeState;

const DEFAULT_FILTER: &str = "info";

pub fn init_logger(format: LogFormat) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    match format {
        LogFormat::Json => fmt::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .try_init()
            .map_err(|err| anyhow!(err))?,
        LogFormat::Text => fmt::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .try_init()
            .map_err(|err| anyhow!(err))?,
    }

    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub fn as_label(&self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Server => "server",
        }
    }
}

/// One exchange as seen by a single connection, from request head to terminal state.
#[derive(Debug, Clone)]
pub struct TransactionRecord {
    pub id: u64,
    pub role: Role,
    pub connection_id: u64,
    pub peer: String,
    pub method: String,
    pub target: String,
    pub version: String,
    pub state: ExchangeState,
    pub status: Option<u16>,
    pub continue_sent: Option<String>,
    pub bytes_received: u64,
    pub elapsed_ms: u128,
    pub reused: Option<bool>,
    pub error_reason: Option<String>,
    pub error_detail: Option<String>,
}

#[derive(Debug)]
pub struct TransactionRecordBuilder {
    record: TransactionRecord,
}

impl TransactionRecordBuilder {
    pub fn new(role: Role, connection_id: u64) -> Self {
        Self {
            record: TransactionRecord {
                id: 0,
                role,
                connection_id,
                peer: String::new(),
                method: String::new(),
                target: String::new(),
                version: String::from("HTTP/1.1"),
                state: ExchangeState::Pending,
                status: None,
                continue_sent: None,
                bytes_received: 0,
                elapsed_ms: 0,
                reused: None,
                error_reason: None,
                error_detail: None,
            },
        }
    }

    pub fn peer(mut self, peer: impl Into<String>) -> Self {
        self.record.peer = peer.into();
        self
    }

    pub fn method(mut self, method: &Method) -> Self {
        self.record.method = method.as_str().to_string();
        self
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.record.target = target.into();
        self
    }

    pub fn version(mut self, version: http::Version) -> Self {
        self.record.version = format!("{version:?}");
        self
    }

    pub fn state(mut self, state: ExchangeState) -> Self {
        self.record.state = state;
        self
    }

    pub fn status(mut self, status: StatusCode) -> Self {
        self.record.status = Some(status.as_u16());
        self
    }

    pub fn continue_sent(mut self, how: impl Into<String>) -> Self {
        self.record.continue_sent = Some(how.into());
        self
    }

    pub fn bytes_received(mut self, bytes: u64) -> Self {
        self.record.bytes_received = bytes;
        self
    }

    pub fn elapsed(mut self, elapsed: Duration) -> Self {
        self.record.elapsed_ms = elapsed.as_millis();
        self
    }

    pub fn reused(mut self, reused: bool) -> Self {
        self.record.reused = Some(reused);
        self
    }

    pub fn error_reason(mut self, reason: impl Into<String>) -> Self {
        self.record.error_reason = Some(reason.into());
        self
    }

    pub fn error_detail(mut self, detail: impl Into<String>) -> Self {
        self.record.error_detail = Some(detail.into());
        self
    }

    pub fn build(self) -> TransactionRecord {
        self.record
    }
}

pub fn log_transaction(record: &TransactionRecord) {
    let now = OffsetDateTime::now_utc();
    let (year, month, day) = now.to_calendar_date();
    let (hour, minute, second) = now.to_hms();
    let millisecond = now.millisecond();
    let month_number: u8 = month.into();
    let ts = format!(
        "{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{millisecond:03}Z",
        month = month_number
    );

    tracing::info!(
        target: "transaction_log",
        ts,
        id = record.id,
        role = record.role.as_label(),
        connection_id = record.connection_id,
        peer = record.peer.as_str(),
        method = record.method.as_str(),
        target_uri = record.target.as_str(),
        version = record.version.as_str(),
        state = record.state.as_label(),
        status = record.status,
        continue_sent = record.continue_sent.as_deref(),
        bytes_received = record.bytes_received,
        elapsed_ms = record.elapsed_ms,
        reused = record.reused,
        error_reason = record.error_reason.as_deref(),
        error_detail = record.error_detail.as_deref(),
        "exchange finished"
    );

    crate::metrics::record_exchange(
        record.role.as_label(),
        record.state.as_label(),
        record.status.and_then(|status| StatusCode::from_u16(status).ok()),
        Duration::from_millis(record.elapsed_ms as u64),
    );
}
