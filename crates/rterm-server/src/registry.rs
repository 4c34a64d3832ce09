//! Registry of live connections.
//!
//! Every accepted connection registers itself before spawning a shell and
//! holds a [`SessionGuard`] for as long as it runs; dropping the guard
//! removes the entry. The registry never hands out sessions, it only counts
//! and describes them.

use crate::session::DeliveryMode;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info};
use rterm_core::{RtermError, RtermResult};

struct Entry {
    peer: SocketAddr,
    mode: DeliveryMode,
    created_at: Instant,
}

/// Information returned when listing connections.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub peer: SocketAddr,
    pub mode: DeliveryMode,
    pub age_secs: u64,
}

/// Tracks live sessions and enforces `max_sessions`.
#[derive(Clone)]
pub struct SessionRegistry {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            max_sessions,
        }
    }

    /// Claim a slot for a new connection.
    ///
    /// Fails with `RtermError::Other` when `max_sessions` are already live.
    pub fn register(&self, peer: SocketAddr, mode: DeliveryMode) -> RtermResult<SessionGuard> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.len() >= self.max_sessions {
            return Err(RtermError::Other(format!(
                "max sessions ({}) reached",
                self.max_sessions
            )));
        }

        let id = generate_session_id();
        entries.insert(
            id.clone(),
            Entry {
                peer,
                mode,
                created_at: Instant::now(),
            },
        );
        info!(session_id = %id, peer = %peer, %mode, live = entries.len(), "session registered");

        Ok(SessionGuard {
            id,
            entries: self.entries.clone(),
        })
    }

    /// Number of live sessions.
    pub fn count(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Snapshot of live sessions.
    pub fn list(&self) -> Vec<SessionInfo> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .map(|(id, e)| SessionInfo {
                id: id.clone(),
                peer: e.peer,
                mode: e.mode,
                age_secs: e.created_at.elapsed().as_secs(),
            })
            .collect()
    }
}

/// Keeps a registry slot alive; removes it on drop.
pub struct SessionGuard {
    id: String,
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl SessionGuard {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.remove(&self.id).is_some() {
            debug!(session_id = %self.id, live = entries.len(), "session unregistered");
        }
    }
}

/// Generate a random session ID (hex-encoded, 16 bytes = 32 hex chars).
fn generate_session_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn guard_removes_entry_on_drop() {
        let registry = SessionRegistry::new(4);
        let guard = registry
            .register(peer(5000), DeliveryMode::RequestResponse)
            .unwrap();
        assert_eq!(guard.id().len(), 32);
        assert_eq!(registry.count(), 1);

        let listed = registry.list();
        assert_eq!(listed[0].id, guard.id());
        assert_eq!(listed[0].peer, peer(5000));

        drop(guard);
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn max_sessions_enforced() {
        let registry = SessionRegistry::new(2);
        let a = registry.register(peer(1), DeliveryMode::Streaming).unwrap();
        let _b = registry.register(peer(2), DeliveryMode::Streaming).unwrap();
        assert!(registry.register(peer(3), DeliveryMode::Streaming).is_err());

        drop(a);
        assert!(registry.register(peer(3), DeliveryMode::Streaming).is_ok());
    }

    #[test]
    fn ids_are_unique() {
        let registry = SessionRegistry::new(8);
        let a = registry.register(peer(1), DeliveryMode::Streaming).unwrap();
        let b = registry.register(peer(2), DeliveryMode::Streaming).unwrap();
        assert_ne!(a.id(), b.id());
    }
}
