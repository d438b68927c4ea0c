//! Connected client bookkeeping.

use chrono::Utc;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// One connected client.
#[derive(Debug, Clone)]
pub struct Session {
    /// Random session id.
    pub id: String,
    /// Client address.
    pub peer: SocketAddr,
    /// Connect time, ms since epoch.
    pub created_at: i64,
    /// Time of the last request, ms since epoch.
    pub last_activity: i64,
    /// Requests received.
    pub requests: u64,
    /// Whether the client switched to push mode.
    pub subscribed: bool,
    /// Idle time after which the session expires.
    pub idle_timeout_secs: u64,
}

impl Session {
    /// New session for `peer`, active from now.
    pub fn new(peer: SocketAddr, idle_timeout_secs: u64) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            id: Uuid::new_v4().to_string(),
            peer,
            created_at: now,
            last_activity: now,
            requests: 0,
            subscribed: false,
            idle_timeout_secs,
        }
    }

    /// Subscribers are passive and never go idle.
    pub fn is_active(&self) -> bool {
        if self.subscribed {
            return true;
        }
        let elapsed_secs = (Utc::now().timestamp_millis() - self.last_activity).max(0) / 1000;
        (elapsed_secs as u64) < self.idle_timeout_secs
    }

    /// Records a request at the current time.
    pub fn touch(&mut self) {
        self.last_activity = Utc::now().timestamp_millis();
        self.requests += 1;
    }
}

/// Registry of connected clients, shared by the accept loop and client tasks.
#[derive(Debug, Clone, Default)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
}

impl SessionManager {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new client and returns its session.
    pub async fn create_session(&self, peer: SocketAddr, idle_timeout_secs: u64) -> Session {
        let session = Session::new(peer, idle_timeout_secs);
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        session
    }

    /// Snapshot of a session, if it is still registered.
    pub async fn get_session(&self, session_id: &str) -> Option<Session> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Records a request on the session. Returns `false` if it is unknown.
    pub async fn record_request(&self, session_id: &str) -> bool {
        match self.sessions.write().await.get_mut(session_id) {
            Some(session) => {
                session.touch();
                true
            }
            None => false,
        }
    }

    /// Switches a session to push mode. Returns `false` if it is unknown.
    pub async fn mark_subscribed(&self, session_id: &str) -> bool {
        match self.sessions.write().await.get_mut(session_id) {
            Some(session) => {
                session.subscribed = true;
                true
            }
            None => false,
        }
    }

    /// Forgets a session. Returns whether it was registered.
    pub async fn remove_session(&self, session_id: &str) -> bool {
        self.sessions.write().await.remove(session_id).is_some()
    }

    /// Drops idle sessions and returns how many were removed.
    ///
    /// Their connections notice on their next read timeout.
    pub async fn cleanup_expired_sessions(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, session| session.is_active());
        before - sessions.len()
    }

    /// Number of registered sessions.
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Sessions that have not gone idle.
    pub async fn get_active_sessions(&self) -> Vec<Session> {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .filter(|s| s.is_active())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_session_creation() {
        let manager = SessionManager::new();
        let session = manager.create_session(peer(), 6).await;

        assert!(Uuid::parse_str(&session.id).is_ok());
        assert_eq!(session.peer, peer());
        assert_eq!(session.requests, 0);
        assert!(session.is_active());
        assert_eq!(manager.count().await, 1);
    }

    #[tokio::test]
    async fn test_record_request() {
        let manager = SessionManager::new();
        let session = manager.create_session(peer(), 6).await;

        assert!(manager.record_request(&session.id).await);
        assert!(manager.record_request(&session.id).await);
        assert_eq!(manager.get_session(&session.id).await.unwrap().requests, 2);
        assert!(!manager.record_request("missing").await);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_subscribers() {
        let manager = SessionManager::new();
        let idle = manager.create_session(peer(), 0).await;
        let subscriber = manager.create_session(peer(), 0).await;
        assert!(manager.mark_subscribed(&subscriber.id).await);

        assert_eq!(manager.cleanup_expired_sessions().await, 1);
        assert!(manager.get_session(&idle.id).await.is_none());
        assert_eq!(manager.get_active_sessions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_session_removal() {
        let manager = SessionManager::new();
        let session = manager.create_session(peer(), 6).await;

        assert!(manager.remove_session(&session.id).await);
        assert!(manager.get_session(&session.id).await.is_none());
    }
}
