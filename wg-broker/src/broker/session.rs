//! Session bookkeeping
//!
//! A session is one private listen endpoint. It moves from `Listening` to
//! `Connected` when its client connects, and is forgotten when the client
//! disconnects or the serving task exits. The endpoint file is unlinked on
//! the first of acceptance or teardown.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Listening,
    Connected,
}

/// Lifecycle signal reported by a session task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Accepted(u32),
    Closed(u32),
    Exited(u32),
}

pub struct SessionRecord {
    pub socket_path: PathBuf,
    pub state: SessionState,
    pub handle: Option<JoinHandle<()>>,
}

/// Live sessions keyed by id
#[derive(Default)]
pub struct SessionRegistry {
    sessions: HashMap<u32, SessionRecord>,
}

impl SessionRegistry {
    pub fn insert(&mut self, id: u32, socket_path: PathBuf, handle: JoinHandle<()>) {
        self.sessions.insert(
            id,
            SessionRecord {
                socket_path,
                state: SessionState::Listening,
                handle: Some(handle),
            },
        );
    }

    /// Apply a lifecycle event; returns the endpoint path to unlink, if any.
    ///
    /// Events for unknown ids are ignored, so a second removal is a no-op.
    pub fn apply(&mut self, event: SessionEvent) -> Option<PathBuf> {
        match event {
            SessionEvent::Accepted(id) => {
                let record = self.sessions.get_mut(&id)?;
                if record.state == SessionState::Connected {
                    return None;
                }
                record.state = SessionState::Connected;
                Some(record.socket_path.clone())
            }
            SessionEvent::Closed(id) | SessionEvent::Exited(id) => {
                let record = self.sessions.remove(&id)?;
                log::debug!("Session {} removed ({:?})", id, event);
                (record.state == SessionState::Listening).then_some(record.socket_path)
            }
        }
    }

    pub fn state(&self, id: u32) -> Option<SessionState> {
        self.sessions.get(&id).map(|r| r.state)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Sessions still waiting for their client
    pub fn pending(&self) -> usize {
        self.sessions
            .values()
            .filter(|r| r.state == SessionState::Listening)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Take every record out of the registry
    pub fn drain(&mut self) -> Vec<SessionRecord> {
        self.sessions.drain().map(|(_, r)| r).collect()
    }
}

/// Remove an endpoint file, ignoring a file that is already gone
pub fn unlink(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => log::debug!("Removed {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("Failed to remove {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(id: u32) -> SessionRegistry {
        let mut registry = SessionRegistry::default();
        registry.insert(id, PathBuf::from(format!("/run/s-{}.sock", id)), tokio::spawn(async {}));
        registry
    }

    #[tokio::test]
    async fn test_pending_counts_listening_only() {
        let mut registry = registry_with(1);
        registry.insert(2, PathBuf::from("/run/s-2.sock"), tokio::spawn(async {}));
        assert_eq!(registry.pending(), 2);

        registry.apply(SessionEvent::Accepted(1));
        assert_eq!(registry.pending(), 1);
        assert_eq!(registry.len(), 2);

        registry.apply(SessionEvent::Exited(2));
        assert_eq!(registry.pending(), 0);
    }

    #[tokio::test]
    async fn test_accept_then_close() {
        let mut registry = registry_with(1);
        assert_eq!(registry.state(1), Some(SessionState::Listening));

        assert_eq!(
            registry.apply(SessionEvent::Accepted(1)),
            Some(PathBuf::from("/run/s-1.sock"))
        );
        assert_eq!(registry.state(1), Some(SessionState::Connected));
        assert_eq!(registry.apply(SessionEvent::Accepted(1)), None);

        // Path already unlinked on accept
        assert_eq!(registry.apply(SessionEvent::Closed(1)), None);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_exit_while_listening_unlinks() {
        let mut registry = registry_with(2);
        assert_eq!(
            registry.apply(SessionEvent::Exited(2)),
            Some(PathBuf::from("/run/s-2.sock"))
        );
        assert_eq!(registry.apply(SessionEvent::Exited(2)), None);
        assert_eq!(registry.apply(SessionEvent::Closed(2)), None);
    }

    #[tokio::test]
    async fn test_unknown_id_ignored() {
        let mut registry = registry_with(3);
        assert_eq!(registry.apply(SessionEvent::Accepted(9)), None);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.drain().len(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unlink_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.sock");
        unlink(&path);
        std::fs::write(&path, "").unwrap();
        unlink(&path);
        assert!(!path.exists());
    }
}
