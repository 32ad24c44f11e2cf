//! Table of live sessions.
//!
//! Each accepted connection gets a slot for as long as its session runs.
//! The slot records whether the connection has authenticated, which gives
//! the supervisor the authenticated-connection set without any session
//! touching another session's state.

use chrono::{DateTime, Utc};
use slab::Slab;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// What the supervisor knows about one live session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub peer: SocketAddr,
    pub connected_at: DateTime<Utc>,
    pub authenticated: bool,
}

/// Live sessions, shared between the accept loop and the sessions.
///
/// Provides O(1) insert, update, and remove.
#[derive(Debug, Clone, Default)]
pub struct SessionTable {
    sessions: Arc<Mutex<Slab<SessionInfo>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slab<SessionInfo>> {
        // Slab updates are never left half done, so a poisoned table is
        // still consistent.
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a session; the returned guard removes it again when dropped.
    pub fn register(&self, peer: SocketAddr) -> SessionGuard {
        let id = self.lock().insert(SessionInfo {
            peer,
            connected_at: Utc::now(),
            authenticated: false,
        });
        SessionGuard {
            table: self.clone(),
            id,
        }
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Number of live sessions that completed the handshake.
    pub fn authenticated_count(&self) -> usize {
        self.lock().iter().filter(|(_, info)| info.authenticated).count()
    }

    /// Snapshot of all live sessions.
    pub fn snapshot(&self) -> Vec<SessionInfo> {
        self.lock().iter().map(|(_, info)| info.clone()).collect()
    }
}

/// Ownership of one slot in a [`SessionTable`].
#[derive(Debug)]
pub struct SessionGuard {
    table: SessionTable,
    id: usize,
}

impl SessionGuard {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn mark_authenticated(&self) {
        if let Some(info) = self.table.lock().get_mut(self.id) {
            info.authenticated = true;
        }
    }

    /// Snapshot of this session's slot.
    pub fn info(&self) -> Option<SessionInfo> {
        self.table.lock().get(self.id).cloned()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.table.lock().try_remove(self.id);
    }
}
