//! Live session bookkeeping for the Bridge Core event loop.
//!
//! A flat `session_id -> SessionHandle` map plus an explicit removal path.
//! There is no subscription concept here (every live session receives every
//! bus frame), so this carries no reverse index — just mark-and-sweep
//! removal driven by read failure or idle timeout.

use std::{collections::HashMap, time::Instant};

use canbridge_proto::ClientSession;

/// One registered session: its protocol state machine plus bookkeeping the
/// Bridge Core needs but the state machine itself has no business knowing
/// about (last-activity time, for idle eviction).
pub struct SessionHandle {
    /// The protocol state machine for this connection.
    pub session: ClientSession,
    /// Last time a `receive` call on this session produced any action or
    /// consumed any bytes; used for idle-timeout eviction.
    pub last_activity: Instant,
}

impl SessionHandle {
    /// Wraps a freshly accepted session, marking it active as of now.
    #[must_use]
    pub fn new(session: ClientSession, now: Instant) -> Self {
        Self { session, last_activity: now }
    }
}

/// Tracks all currently connected sessions by an opaque, monotonically
/// increasing id assigned at accept time.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: HashMap<u64, SessionHandle>,
    next_id: u64,
}

impl SessionRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a newly accepted session and returns its assigned id.
    pub fn insert(&mut self, session: ClientSession, now: Instant) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.sessions.insert(id, SessionHandle::new(session, now));
        id
    }

    /// Removes a session, e.g. on read failure, explicit close, or idle
    /// timeout. Returns it so the caller can run any final teardown.
    pub fn remove(&mut self, id: u64) -> Option<SessionHandle> {
        self.sessions.remove(&id)
    }

    /// Mutable access to a live session by id.
    pub fn get_mut(&mut self, id: u64) -> Option<&mut SessionHandle> {
        self.sessions.get_mut(&id)
    }

    /// All live session ids, for per-tick fan-out and timeout sweeps.
    pub fn ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.sessions.keys().copied()
    }

    /// Sessions idle longer than `timeout` as of `now`, for the Bridge
    /// Core's periodic sweep.
    #[must_use]
    pub fn idle_since(&self, now: Instant, timeout: std::time::Duration) -> Vec<u64> {
        self.sessions
            .iter()
            .filter(|(_, handle)| now.duration_since(handle.last_activity) > timeout)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Number of currently registered sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the registry currently holds no sessions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use canbridge_proto::ClientSession;

    use super::*;

    fn session(now: Instant) -> ClientSession {
        ClientSession::new(now, Vec::new(), 1)
    }

    #[test]
    fn insert_assigns_increasing_ids_and_remove_forgets_them() {
        let mut registry = SessionRegistry::new();
        let now = Instant::now();

        let first = registry.insert(session(now), now);
        let second = registry.insert(session(now), now);
        assert_ne!(first, second);
        assert_eq!(registry.len(), 2);

        assert!(registry.remove(first).is_some());
        assert_eq!(registry.len(), 1);
        assert!(registry.get_mut(first).is_none());
        assert!(registry.get_mut(second).is_some());
    }

    #[test]
    fn idle_since_finds_only_stale_sessions() {
        let mut registry = SessionRegistry::new();
        let base = Instant::now();

        let stale = registry.insert(session(base), base);
        let fresh = registry.insert(session(base + Duration::from_secs(30)), base + Duration::from_secs(30));

        let idle = registry.idle_since(base + Duration::from_secs(60), Duration::from_secs(45));
        assert_eq!(idle, vec![stale]);
        assert!(!idle.contains(&fresh));
    }
}
