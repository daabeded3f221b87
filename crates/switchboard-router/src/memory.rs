//! Shared session memory, carried across agent handoffs

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use switchboard_core::{MemoryUpdate, SessionKey, SessionMemory};
use tokio::sync::Mutex;
use tracing::debug;

/// Per-session records behind their own lock, so merges on one session are
/// serialized while other sessions proceed independently.
#[derive(Default)]
pub struct SessionMemoryStore {
    sessions: DashMap<SessionKey, Arc<Mutex<SessionMemory>>>,
}

impl SessionMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current memory, or an empty record if the session has none.
    pub async fn get(&self, session: &SessionKey) -> SessionMemory {
        match self.slot(session) {
            Some(slot) => slot.lock().await.clone(),
            None => SessionMemory::empty(session),
        }
    }

    pub async fn merge(&self, session: &SessionKey, update: MemoryUpdate) -> SessionMemory {
        let slot = self
            .sessions
            .entry(session.clone())
            .or_insert_with(|| Arc::new(Mutex::new(SessionMemory::empty(session))))
            .clone();
        let mut memory = slot.lock().await;
        memory.apply(update, Utc::now());
        debug!(session = %session, version = memory.version, "Session memory merged");
        memory.clone()
    }

    pub fn delete(&self, session: &SessionKey) -> bool {
        self.sessions.remove(session).is_some()
    }

    pub fn contains(&self, session: &SessionKey) -> bool {
        self.sessions.contains_key(session)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn slot(&self, session: &SessionKey) -> Option<Arc<Mutex<SessionMemory>>> {
        self.sessions.get(session).map(|s| Arc::clone(s.value()))
    }
}
