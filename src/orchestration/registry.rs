//! # Session Registry
//!
//! The live map from worker id to session handle. Only the worker lifecycle manager
//! inserts or removes entries; the resource monitor and tab operations read them.
//! Whoever removes an entry owns terminating that session.

use crate::upstream::SessionHandle;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// A session the lifecycle manager launched and has not yet torn down
#[derive(Debug, Clone, PartialEq)]
pub struct LiveSession {
    pub handle: SessionHandle,
    /// Start attempt that launched this session
    pub start_attempt: u64,
    pub launched_at: DateTime<Utc>,
}

impl LiveSession {
    pub fn new(handle: SessionHandle, start_attempt: u64) -> Self {
        Self {
            handle,
            start_attempt,
            launched_at: Utc::now(),
        }
    }
}

/// Result of [`SessionRegistry::register`]
#[derive(Debug, Clone, PartialEq)]
pub enum Registration {
    Registered,
    /// An older attempt's session held the slot; the caller must terminate it
    Replaced(LiveSession),
    /// A newer attempt already owns the slot; the offered session was not stored
    Superseded,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, LiveSession>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session unless a newer start attempt already owns the worker's slot
    pub fn register(&self, worker_id: &str, session: LiveSession) -> Registration {
        match self.sessions.entry(worker_id.to_string()) {
            Entry::Vacant(vacant) => {
                vacant.insert(session);
                Registration::Registered
            }
            Entry::Occupied(mut occupied) => {
                if occupied.get().start_attempt > session.start_attempt {
                    Registration::Superseded
                } else {
                    Registration::Replaced(occupied.insert(session))
                }
            }
        }
    }

    pub fn remove(&self, worker_id: &str) -> Option<LiveSession> {
        self.sessions.remove(worker_id).map(|(_, session)| session)
    }

    /// Remove the entry only if it still refers to `session_id`
    pub fn remove_session(&self, worker_id: &str, session_id: &str) -> Option<LiveSession> {
        self.sessions
            .remove_if(worker_id, |_, session| session.handle.session_id == session_id)
            .map(|(_, session)| session)
    }

    pub fn get(&self, worker_id: &str) -> Option<LiveSession> {
        self.sessions.get(worker_id).map(|entry| entry.value().clone())
    }

    pub fn handle(&self, worker_id: &str) -> Option<SessionHandle> {
        self.sessions
            .get(worker_id)
            .map(|entry| entry.value().handle.clone())
    }

    pub fn contains(&self, worker_id: &str) -> bool {
        self.sessions.contains_key(worker_id)
    }

    pub fn worker_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Release capacity left behind by removed sessions
    pub fn shrink_to_fit(&self) {
        self.sessions.shrink_to_fit();
    }
}
