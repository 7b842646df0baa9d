//! Server session tracking and graceful drain.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::codec::MessageType;
use crate::protocol::{ProtocolVersion, Session, SessionState, SessionStats};

/// Drain settings applied when the server goes unhealthy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainPolicy {
    /// Longest wait for in-flight requests, zero skips SUSPEND entirely
    pub max_wait: Duration,
    /// How often outstanding counts are checked
    pub poll_interval: Duration,
}

/// Tracks every accepted session
pub struct SessionManager {
    /// Active sessions by ID
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
    healthy: AtomicBool,
    drain: DrainPolicy,
}

impl SessionManager {
    /// Create an empty manager.
    pub fn new(drain: DrainPolicy) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            healthy: AtomicBool::new(true),
            drain,
        }
    }

    /// Track a session.
    pub async fn insert(&self, session: Arc<Session>) {
        self.sessions
            .write()
            .await
            .insert(session.id().to_string(), session);
    }

    /// Get session by ID
    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Stop tracking a session.
    pub async fn remove(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.write().await.remove(id)
    }

    /// Get session count
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Get all session IDs
    pub async fn list_ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    /// Stats for every tracked session.
    pub async fn stats(&self) -> Vec<SessionStats> {
        self.sessions
            .read()
            .await
            .values()
            .map(|s| s.stats())
            .collect()
    }

    /// Current health flag.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Set the health flag.
    ///
    /// Going unhealthy drains every `Active` session in the background.
    /// Going healthy does nothing to sessions already drained. Returns the
    /// number of drains started.
    pub async fn set_healthy(&self, healthy: bool) -> usize {
        let was = self.healthy.swap(healthy, Ordering::AcqRel);
        if was == healthy {
            return 0;
        }
        if healthy {
            tracing::info!("Server healthy again, accepting sessions");
            return 0;
        }

        // snapshot first so no lock is held while sessions are touched
        let sessions: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        let mut started = 0;
        for session in sessions {
            if session.state() == SessionState::Active {
                tokio::spawn(drain_session(session, self.drain));
                started += 1;
            }
        }
        tracing::info!(
            sessions = started,
            max_wait = ?self.drain.max_wait,
            "Server unhealthy, draining sessions"
        );
        started
    }

    /// Disconnect every tracked session without draining.
    pub async fn disconnect_all(&self) {
        let sessions: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        for session in sessions {
            if session.send_control(MessageType::Disconnect).is_err() {
                session.force_disconnect("server shutdown");
            }
        }
    }
}

/// SUSPEND, wait for outstanding requests, then DISCONNECT.
///
/// With a zero wait, or a peer below the version that introduced SUSPEND,
/// only DISCONNECT is sent.
pub(crate) async fn drain_session(session: Arc<Session>, policy: DrainPolicy) {
    let suspend = !policy.max_wait.is_zero()
        && session
            .version()
            .is_some_and(|v| v.supports(ProtocolVersion::SUSPEND));

    if suspend && session.send_control(MessageType::Suspend).is_ok() {
        if let Err(e) = session.transition(SessionState::Suspending) {
            tracing::debug!(session = %session.id(), error = %e, "Session not suspendable");
        }

        let deadline = Instant::now() + policy.max_wait;
        let closed = session.closed();
        tokio::pin!(closed);
        loop {
            let outstanding = session.outstanding();
            if outstanding == 0 {
                break;
            }
            if Instant::now() >= deadline {
                tracing::warn!(
                    session = %session.id(),
                    outstanding,
                    "Drain window elapsed with requests in flight"
                );
                break;
            }
            tokio::select! {
                _ = &mut closed => return,
                _ = tokio::time::sleep(policy.poll_interval) => {},
            }
        }
    }

    tracing::debug!(session = %session.id(), "Sending DISCONNECT");
    if session.send_control(MessageType::Disconnect).is_err() {
        session.force_disconnect("drained");
        return;
    }
    // the writer closes the socket once DISCONNECT is flushed
    if tokio::time::timeout(policy.poll_interval.max(Duration::from_secs(1)), session.closed())
        .await
        .is_err()
    {
        session.force_disconnect("drained");
    }
}
