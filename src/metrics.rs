use std::time::Duration;

use http::StatusCode;
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static EXCHANGES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("exchanges_total", "Completed exchanges by role and outcome");
    let vec = IntCounterVec::new(opts, &["role", "outcome"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register exchanges_total");
    vec
});

static EXCHANGE_STATUS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("exchange_status_total", "Exchanges by role and status class");
    let vec = IntCounterVec::new(opts, &["role", "status_class"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register exchange_status_total");
    vec
});

static EXCHANGE_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let opts = HistogramOpts::new("exchange_duration_seconds", "Exchange latency by role")
        .buckets(latency_buckets());
    let vec = HistogramVec::new(opts, &["role"]).expect("create histogram vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register exchange_duration_seconds");
    vec
});

static REDIRECTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter =
        IntCounter::new("redirects_total", "Redirects followed").expect("create redirects_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register redirects_total");
    counter
});

static RETRIES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let vec = IntCounterVec::new(
        Opts::new("retries_total", "Retried exchanges by trigger"),
        &["trigger"],
    )
    .expect("create retries_total");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register retries_total");
    vec
});

static CONNECTIONS_OPENED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let vec = IntCounterVec::new(
        Opts::new("connections_opened_total", "Connections opened by role"),
        &["role"],
    )
    .expect("create connections_opened_total");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register connections_opened_total");
    vec
});

static POOL_IDLE: Lazy<IntGauge> = Lazy::new(|| {
    let gauge =
        IntGauge::new("pool_idle_connections", "Idle pooled connections").expect("create gauge");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("register pool_idle_connections");
    gauge
});

static POOL_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new("pool_active_connections", "Connections checked out of the pool")
        .expect("create gauge");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("register pool_active_connections");
    gauge
});

static POOL_REUSE_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let vec = IntCounterVec::new(
        Opts::new("pool_reuse_total", "Pooled connection reuse counts"),
        &["reused"],
    )
    .expect("create pool_reuse_total");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register pool_reuse_total");
    vec
});

static POOL_EVICTIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let vec = IntCounterVec::new(
        Opts::new("pool_evictions_total", "Idle connections dropped by reason"),
        &["reason"],
    )
    .expect("create pool_evictions_total");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register pool_evictions_total");
    vec
});

static SESSIONS_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new("sessions_active", "Live server sessions").expect("create gauge");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("register sessions_active");
    gauge
});

static SESSION_EVENTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let vec = IntCounterVec::new(
        Opts::new("session_events_total", "Session lifecycle events"),
        &["event"],
    )
    .expect("create session_events_total");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register session_events_total");
    vec
});

static COOKIES_STORED: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new("cookies_stored", "Cookies held by the client cookie store")
        .expect("create gauge");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("register cookies_stored");
    gauge
});

fn latency_buckets() -> Vec<f64> {
    vec![
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ]
}

fn status_class(status: u16) -> &'static str {
    match status {
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "other",
    }
}

pub fn record_exchange(
    role: &str,
    outcome: &str,
    status: Option<StatusCode>,
    elapsed: Duration,
) {
    EXCHANGES_TOTAL.with_label_values(&[role, outcome]).inc();
    if let Some(status) = status {
        EXCHANGE_STATUS_TOTAL
            .with_label_values(&[role, status_class(status.as_u16())])
            .inc();
    }
    EXCHANGE_DURATION_SECONDS
        .with_label_values(&[role])
        .observe(elapsed.as_secs_f64());
}

pub fn record_redirect() {
    REDIRECTS_TOTAL.inc();
}

pub fn record_retry(trigger: &str) {
    RETRIES_TOTAL.with_label_values(&[trigger]).inc();
}

pub fn record_connection_opened(role: &str) {
    CONNECTIONS_OPENED_TOTAL.with_label_values(&[role]).inc();
}

pub fn set_pool_counts(idle: usize, active: usize) {
    POOL_IDLE.set(idle as i64);
    POOL_ACTIVE.set(active as i64);
}

pub fn record_pool_reuse(reused: bool) {
    let label = if reused { "yes" } else { "no" };
    POOL_REUSE_TOTAL.with_label_values(&[label]).inc();
}

pub fn record_pool_eviction(reason: &str) {
    POOL_EVICTIONS_TOTAL.with_label_values(&[reason]).inc();
}

pub fn set_sessions_active(count: usize) {
    SESSIONS_ACTIVE.set(count as i64);
}

pub fn record_session_event(event: &str) {
    SESSION_EVENTS_TOTAL.with_label_values(&[event]).inc();
}

pub fn set_cookies_stored(count: usize) {
    COOKIES_STORED.set(count as i64);
}

pub fn gather() -> Vec<u8> {
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .expect("encode metrics");
    buffer
}
