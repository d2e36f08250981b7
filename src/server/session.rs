use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::metrics;
use crate::util::{ShutdownTrigger, shutdown_channel, spawn_sweeper};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session {0} is invalid")]
    Invalid(String),
    #[error("session backend failed: {0}")]
    Backend(String),
}

struct SessionState {
    last_access: Instant,
    max_inactive: Duration,
    attributes: HashMap<String, String>,
    change_version: u64,
}

struct SessionInner {
    id: String,
    created: Instant,
    valid: AtomicBool,
    state: Mutex<SessionState>,
}

/// Server-side session. Clones share the same state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("valid", &self.inner.valid.load(Ordering::Acquire))
            .field("max_inactive", &state.max_inactive)
            .field("attributes", &state.attributes.len())
            .finish()
    }
}

impl Session {
    pub fn new(id: impl Into<String>, max_inactive: Duration) -> Self {
        let now = Instant::now();
        Self {
            inner: Arc::new(SessionInner {
                id: id.into(),
                created: now,
                valid: AtomicBool::new(true),
                state: Mutex::new(SessionState {
                    last_access: now,
                    max_inactive,
                    attributes: HashMap::new(),
                    change_version: 0,
                }),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn created(&self) -> Instant {
        self.inner.created
    }

    fn checked(&self) -> Result<parking_lot::MutexGuard<'_, SessionState>, SessionError> {
        if !self.is_valid() {
            return Err(SessionError::Invalid(self.inner.id.clone()));
        }
        Ok(self.inner.state.lock())
    }

    pub fn last_accessed(&self) -> Result<Instant, SessionError> {
        Ok(self.checked()?.last_access)
    }

    pub(crate) fn touch(&self) {
        let mut state = self.inner.state.lock();
        state.last_access = Instant::now();
        state.change_version += 1;
    }

    pub fn attribute(&self, name: &str) -> Result<Option<String>, SessionError> {
        Ok(self.checked()?.attributes.get(name).cloned())
    }

    pub fn set_attribute(
        &self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), SessionError> {
        let mut state = self.checked()?;
        state.attributes.insert(name.into(), value.into());
        state.change_version += 1;
        Ok(())
    }

    pub fn remove_attribute(&self, name: &str) -> Result<Option<String>, SessionError> {
        let mut state = self.checked()?;
        let removed = state.attributes.remove(name);
        state.change_version += 1;
        Ok(removed)
    }

    pub fn attribute_names(&self) -> Result<Vec<String>, SessionError> {
        let mut names: Vec<String> = self.checked()?.attributes.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    pub fn max_inactive(&self) -> Duration {
        self.inner.state.lock().max_inactive
    }

    pub fn set_max_inactive(&self, max_inactive: Duration) {
        self.inner.state.lock().max_inactive = max_inactive;
    }

    /// Incremented by every access or modification; lets persistent backends skip saving
    /// unchanged sessions.
    pub fn change_version(&self) -> u64 {
        self.inner.state.lock().change_version
    }

    pub fn invalidate(&self) {
        self.inner.valid.store(false, Ordering::Release);
        self.inner.state.lock().change_version += 1;
    }

    /// False once invalidated or idle past its max-inactive interval. An idle session is
    /// invalidated by this check.
    pub fn is_valid(&self) -> bool {
        if !self.inner.valid.load(Ordering::Acquire) {
            return false;
        }
        let expired = {
            let state = self.inner.state.lock();
            state.last_access.elapsed() > state.max_inactive
        };
        if expired {
            self.invalidate();
        }
        !expired
    }
}

/// Storage backend for server sessions.
#[async_trait]
pub trait SessionManager: Send + Sync {
    /// The session named `id`, touching its last access. Invalid sessions are removed and
    /// reported as absent.
    async fn get(&self, id: &str) -> Result<Option<Session>, SessionError>;

    /// Creates and registers a session whose id is `<prefix>-<uuid>`.
    async fn create(&self, prefix: &str) -> Result<Session, SessionError>;

    async fn remove(&self, id: &str) -> Result<(), SessionError>;

    async fn list(&self) -> Result<Vec<Session>, SessionError>;

    async fn register(&self, session: Session) -> Result<(), SessionError>;

    /// Persists changes made to the session during an exchange.
    async fn save(&self, id: &str) -> Result<(), SessionError>;

    /// Invalidates every session and stops background maintenance.
    fn close(&self);

    fn is_empty(&self) -> bool;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub created: u64,
    pub removed: u64,
    pub expired: u64,
}

#[derive(Default)]
struct StoreInner {
    sessions: Mutex<HashMap<String, Session>>,
    created: AtomicU64,
    removed: AtomicU64,
    expired: AtomicU64,
}

impl StoreInner {
    fn sweep(&self) {
        let expired: Vec<Session> = {
            let mut sessions = self.sessions.lock();
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, session)| !session.is_valid())
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };
        for session in &expired {
            debug!(session_id = session.id(), "session expired");
            metrics::record_session_event("expired");
        }
        self.expired.fetch_add(expired.len() as u64, Ordering::Relaxed);
        self.publish();
    }

    fn publish(&self) {
        metrics::set_sessions_active(self.sessions.lock().len());
    }
}

/// Default [`SessionManager`]: a table in memory with a periodic expiry sweep.
pub struct InMemorySessionStore {
    inner: Arc<StoreInner>,
    max_inactive: Duration,
    shutdown: ShutdownTrigger,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl InMemorySessionStore {
    /// Sessions it creates expire after `max_inactive` without access. A zero
    /// `sweep_interval` disables the background sweep.
    pub fn new(max_inactive: Duration, sweep_interval: Duration) -> Self {
        let (shutdown, signal) = shutdown_channel();
        let inner = Arc::new(StoreInner::default());
        let weak: Weak<StoreInner> = Arc::downgrade(&inner);
        let sweeper = spawn_sweeper("session_store", sweep_interval, signal, move || {
            if let Some(inner) = weak.upgrade() {
                inner.sweep();
            }
        });
        Self {
            inner,
            max_inactive,
            shutdown,
            sweeper: Mutex::new(sweeper),
        }
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            created: self.inner.created.load(Ordering::Relaxed),
            removed: self.inner.removed.load(Ordering::Relaxed),
            expired: self.inner.expired.load(Ordering::Relaxed),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    /// Runs one expiry pass immediately.
    pub fn sweep(&self) {
        self.inner.sweep();
    }
}

#[async_trait]
impl SessionManager for InMemorySessionStore {
    async fn get(&self, id: &str) -> Result<Option<Session>, SessionError> {
        let mut sessions = self.inner.sessions.lock();
        let Some(session) = sessions.get(id).cloned() else {
            return Ok(None);
        };
        if !session.is_valid() {
            sessions.remove(id);
            drop(sessions);
            self.inner.publish();
            return Ok(None);
        }
        session.touch();
        Ok(Some(session))
    }

    async fn create(&self, prefix: &str) -> Result<Session, SessionError> {
        let session = Session::new(format!("{prefix}-{}", Uuid::new_v4()), self.max_inactive);
        self.inner
            .sessions
            .lock()
            .insert(session.id().to_string(), session.clone());
        self.inner.created.fetch_add(1, Ordering::Relaxed);
        metrics::record_session_event("created");
        self.inner.publish();
        debug!(session_id = session.id(), "session created");
        Ok(session)
    }

    async fn remove(&self, id: &str) -> Result<(), SessionError> {
        if self.inner.sessions.lock().remove(id).is_some() {
            self.inner.removed.fetch_add(1, Ordering::Relaxed);
            metrics::record_session_event("removed");
        }
        self.inner.publish();
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Session>, SessionError> {
        Ok(self.inner.sessions.lock().values().cloned().collect())
    }

    async fn register(&self, session: Session) -> Result<(), SessionError> {
        self.inner
            .sessions
            .lock()
            .insert(session.id().to_string(), session);
        self.inner.publish();
        Ok(())
    }

    async fn save(&self, _id: &str) -> Result<(), SessionError> {
        Ok(())
    }

    fn close(&self) {
        self.shutdown.trigger();
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
        let drained: Vec<Session> = self.inner.sessions.lock().drain().map(|(_, s)| s).collect();
        for session in &drained {
            session.invalidate();
        }
        self.inner.publish();
    }

    fn is_empty(&self) -> bool {
        self.inner.sessions.lock().is_empty()
    }
}

impl Drop for InMemorySessionStore {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

impl std::fmt::Debug for InMemorySessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemorySessionStore")
            .field("sessions", &self.len())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn created_session_is_found_and_prefixed() {
        let store = InMemorySessionStore::new(Duration::from_secs(60), Duration::ZERO);
        let session = store.create("srv").await.unwrap();
        assert!(session.id().starts_with("srv-"));
        assert_eq!(session.id().len(), "srv-".len() + 36);

        session.set_attribute("user", "alice").unwrap();
        let found = store.get(session.id()).await.unwrap().unwrap();
        assert_eq!(found.attribute("user").unwrap().as_deref(), Some("alice"));
        assert_eq!(store.stats().created, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_session_is_dropped_on_lookup() {
        let store = InMemorySessionStore::new(Duration::from_secs(10), Duration::ZERO);
        let session = store.create("srv").await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(store.get(session.id()).await.unwrap().is_none());
        assert!(store.is_empty());
        assert!(matches!(
            session.attribute("user"),
            Err(SessionError::Invalid(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn lookup_keeps_session_alive() {
        let store = InMemorySessionStore::new(Duration::from_secs(10), Duration::ZERO);
        let session = store.create("srv").await.unwrap();
        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(8)).await;
            assert!(store.get(session.id()).await.unwrap().is_some());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_expires_idle_sessions() {
        let store = InMemorySessionStore::new(Duration::from_secs(10), Duration::from_secs(5));
        store.create("srv").await.unwrap();
        let kept = store.create("srv").await.unwrap();
        kept.set_max_inactive(Duration::from_secs(3600));

        tokio::time::sleep(Duration::from_secs(16)).await;
        tokio::task::yield_now().await;
        assert_eq!(store.len(), 1);
        let stats = store.stats();
        assert_eq!(stats.created, 2);
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.removed, 0);
    }

    #[tokio::test]
    async fn close_invalidates_everything() {
        let store = InMemorySessionStore::new(Duration::from_secs(60), Duration::from_secs(5));
        let session = store.create("srv").await.unwrap();
        store.remove("unknown").await.unwrap();
        store.close();
        assert!(store.is_empty());
        assert!(!session.is_valid());
        assert_eq!(store.stats().removed, 0);
    }

    #[tokio::test]
    async fn register_and_remove_round_trip() {
        let store = InMemorySessionStore::new(Duration::from_secs(60), Duration::ZERO);
        store
            .register(Session::new("custom-1", Duration::from_secs(60)))
            .await
            .unwrap();
        assert_eq!(store.list().await.unwrap().len(), 1);
        store.remove("custom-1").await.unwrap();
        assert!(store.is_empty());
        assert_eq!(store.stats().removed, 1);
    }
}
