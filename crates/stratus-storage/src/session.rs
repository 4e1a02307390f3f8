//! Session liveness tracking

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use stratus_common::SessionId;

/// Last heartbeat of each client session
///
/// A session that has not sent a heartbeat within the timeout is reported
/// as expired; the caller cleans it up and then forgets it.
#[derive(Debug)]
pub struct SessionTracker {
    timeout: Duration,
    sessions: Mutex<HashMap<SessionId, Instant>>,
}

impl SessionTracker {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Record a heartbeat, registering the session if new
    pub fn heartbeat(&self, session_id: SessionId) {
        self.heartbeat_at(session_id, Instant::now());
    }

    pub fn heartbeat_at(&self, session_id: SessionId, now: Instant) {
        self.sessions.lock().insert(session_id, now);
    }

    /// Forget a session; returns whether it was tracked
    pub fn remove(&self, session_id: SessionId) -> bool {
        self.sessions.lock().remove(&session_id).is_some()
    }

    #[must_use]
    pub fn contains(&self, session_id: SessionId) -> bool {
        self.sessions.lock().contains_key(&session_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Sessions idle for longer than the timeout
    #[must_use]
    pub fn expired_sessions(&self) -> Vec<SessionId> {
        self.expired_sessions_at(Instant::now())
    }

    #[must_use]
    pub fn expired_sessions_at(&self, now: Instant) -> Vec<SessionId> {
        let mut expired: Vec<_> = self
            .sessions
            .lock()
            .iter()
            .filter(|(_, last)| now.saturating_duration_since(**last) > self.timeout)
            .map(|(id, _)| *id)
            .collect();
        expired.sort_unstable();
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry() {
        let tracker = SessionTracker::new(Duration::from_secs(10));
        let start = Instant::now();
        tracker.heartbeat_at(SessionId::new(1), start);
        tracker.heartbeat_at(SessionId::new(2), start + Duration::from_secs(5));

        assert!(tracker.expired_sessions_at(start + Duration::from_secs(10)).is_empty());
        assert_eq!(
            tracker.expired_sessions_at(start + Duration::from_secs(11)),
            vec![SessionId::new(1)]
        );
        assert_eq!(tracker.expired_sessions_at(start + Duration::from_secs(16)).len(), 2);
    }

    #[test]
    fn test_heartbeat_renews() {
        let tracker = SessionTracker::new(Duration::from_secs(10));
        let start = Instant::now();
        tracker.heartbeat_at(SessionId::new(1), start);
        tracker.heartbeat_at(SessionId::new(1), start + Duration::from_secs(8));
        assert!(tracker.expired_sessions_at(start + Duration::from_secs(15)).is_empty());

        assert!(tracker.remove(SessionId::new(1)));
        assert!(!tracker.remove(SessionId::new(1)));
        assert!(tracker.is_empty());
    }
}
