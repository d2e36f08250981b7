use std::{future::Future, time::Duration};

use anyhow::{Context, Result, anyhow};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::debug;

const WATCHDOG_MIN_PERIOD: Duration = Duration::from_millis(100);
const WATCHDOG_MAX_PERIOD: Duration = Duration::from_secs(30);

/// Wraps `tokio::time::timeout`, converting elapsed deadlines and inner errors into contextual
/// `anyhow::Error` values for consistent diagnostics.
pub async fn timeout_with_context<F, T, E>(
    duration: Duration,
    future: F,
    context: impl Into<String>,
) -> Result<T>
where
    F: Future<Output = Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    let context = context.into();
    timeout(duration, future)
        .await
        .map_err(|_| anyhow!("timed out {context}"))?
        .with_context(|| format!("failed while {context}"))
}

/// Same as [`timeout_with_context`] but only bounds the future when a duration is configured.
pub async fn maybe_timeout_with_context<F, T, E>(
    duration: Option<Duration>,
    future: F,
    context: impl Into<String>,
) -> Result<T>
where
    F: Future<Output = Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    match duration {
        Some(duration) => timeout_with_context(duration, future, context).await,
        None => {
            let context = context.into();
            future
                .await
                .with_context(|| format!("failed while {context}"))
        }
    }
}

/// Scan period for timeout watchdogs: a tenth of the timeout, bounded to [100ms, 30s].
pub fn watchdog_period(timeout: Duration) -> Duration {
    if timeout <= Duration::from_secs(1) {
        return WATCHDOG_MIN_PERIOD;
    }
    (timeout / 10).clamp(WATCHDOG_MIN_PERIOD, WATCHDOG_MAX_PERIOD)
}

/// Owning side of a shutdown signal. Triggering it stops every task holding a
/// [`ShutdownSignal`] derived from it.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

pub fn shutdown_channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, ShutdownSignal { rx })
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl ShutdownSignal {
    /// Resolves once the trigger fires or is dropped.
    pub async fn wait(&mut self) {
        let _ = self.rx.wait_for(|stopped| *stopped).await;
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Runs `sweep` every `interval` until `shutdown` fires. The first tick is skipped so a freshly
/// started owner is not swept immediately.
pub fn spawn_sweeper<F>(
    name: &'static str,
    interval: Duration,
    mut shutdown: ShutdownSignal,
    mut sweep: F,
) -> Option<JoinHandle<()>>
where
    F: FnMut() + Send + 'static,
{
    if interval.is_zero() {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => sweep(),
                _ = shutdown.wait() => {
                    debug!(sweeper = name, "sweeper stopped");
                    break;
                }
            }
        }
    }))
}
