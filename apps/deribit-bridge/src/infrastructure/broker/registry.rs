//! Registry of live sessions.
//!
//! All mutation happens under one lock owned by the registry. A session is
//! live exactly while it is registered.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::session::Session;
use crate::application::ports::SessionDirectory;
use crate::domain::subscription::SessionId;
use crate::infrastructure::metrics;

/// Live sessions keyed by id.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session.
    pub fn insert(&self, session: Arc<Session>) {
        let count = {
            let mut sessions = self.sessions.lock();
            sessions.insert(session.id(), session);
            sessions.len()
        };
        metrics::set_live_sessions(count);
    }

    /// Unregister a session. Returns it if it was registered.
    pub fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        let (removed, count) = {
            let mut sessions = self.sessions.lock();
            let removed = sessions.remove(&id);
            (removed, sessions.len())
        };
        metrics::set_live_sessions(count);
        removed
    }

    /// Look up a session.
    #[must_use]
    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.lock().get(&id).cloned()
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Whether no sessions are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Queue a payload for every live session. Returns how many accepted it.
    pub fn broadcast(&self, payload: &str) -> usize {
        self.snapshot()
            .iter()
            .filter(|session| session.send(payload))
            .count()
    }

    /// Remove every session and return them.
    pub fn drain(&self) -> Vec<Arc<Session>> {
        let drained: Vec<_> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        metrics::set_live_sessions(0);
        drained
    }

    fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().values().cloned().collect()
    }
}

impl SessionDirectory for SessionRegistry {
    fn is_live(&self, session: SessionId) -> bool {
        self.sessions.lock().contains_key(&session)
    }

    fn deliver(&self, session: SessionId, payload: &str) -> bool {
        // Clone out so the lock is not held while queueing.
        let target = self.get(session);
        target.is_some_and(|s| s.send(payload))
    }

    fn live_count(&self) -> usize {
        self.len()
    }
}
