//! Server session management.
//!
//! Handles per-engine session bookkeeping:
//! - Session id generation
//! - Lookup by id for upgrades and follow-up requests
//! - Removal when a session's read loop ends

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use rand::distributions::Alphanumeric;

use crate::core::SESSION_ID_LEN;
use crate::transport::Session;

/// Generate a random session id.
pub fn generate_session_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SESSION_ID_LEN)
        .map(char::from)
        .collect()
}

/// Sessions owned by one accepting engine, keyed by id.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session under a freshly generated id, unless `limit`
    /// sessions are already live.
    ///
    /// The capacity check and the insert happen under one lock. `build` is
    /// called once with an id no live session holds.
    pub fn insert_new(
        &self,
        limit: usize,
        build: impl FnOnce(String) -> Arc<Session>,
    ) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.lock();
        if sessions.len() >= limit {
            return None;
        }
        let id = loop {
            let id = generate_session_id();
            if !sessions.contains_key(&id) {
                break id;
            }
        };
        let session = build(id.clone());
        sessions.insert(id, Arc::clone(&session));
        Some(session)
    }

    /// Look up a session.
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().get(id).cloned()
    }

    /// Remove a session.
    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().remove(id)
    }

    /// Remove and return every session.
    pub fn drain(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().drain().map(|(_, s)| s).collect()
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Check if no sessions are live.
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}
