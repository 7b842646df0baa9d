//! Session state machine for one TCP connection.
//!
//! State lives in a `tokio::sync::watch` channel so that the I/O tasks,
//! keep-alive timer, correlator and drain task all observe the same value
//! and can await a change. Every mutation goes through
//! [`Session::transition`] or [`Session::force_disconnect`].

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};

use super::version::ProtocolVersion;
use crate::codec::{Frame, MessageType};
use crate::error::{Result, RpcError};

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Socket connecting
    Connecting,
    /// Socket up, handshake in progress
    Negotiating,
    /// Handshake done, requests flow
    Active,
    /// Draining: no new requests, in-flight ones may finish
    Suspending,
    /// Terminal
    Disconnected,
}

impl SessionState {
    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Negotiating)
                | (Negotiating, Active)
                | (Active, Suspending)
                | (Connecting | Negotiating | Active | Suspending, Disconnected)
        )
    }

    /// Whether the state is terminal.
    pub fn is_terminal(self) -> bool {
        self == SessionState::Disconnected
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::Negotiating => "negotiating",
            SessionState::Active => "active",
            SessionState::Suspending => "suspending",
            SessionState::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Which end of the connection this session is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// Initiated the connection
    Client,
    /// Accepted the connection
    Server,
}

/// Receiving end of a session's outbound frame queue, owned by its writer task
pub type OutboundQueue = mpsc::UnboundedReceiver<Frame>;

/// One live connection
pub struct Session {
    id: String,
    role: SessionRole,
    remote_addr: SocketAddr,
    peer_session_id: OnceLock<String>,
    version: OnceLock<ProtocolVersion>,
    state: watch::Sender<SessionState>,
    created_at: Instant,
    // millis since created_at
    last_read: AtomicU64,
    last_write: AtomicU64,
    outstanding: AtomicUsize,
    next_correlation: AtomicU64,
    outbound: mpsc::UnboundedSender<Frame>,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .field("version", &self.version())
            .finish()
    }
}

impl Session {
    /// Create a session in `Connecting` and the queue its writer drains.
    pub fn new(role: SessionRole, remote_addr: SocketAddr) -> (Arc<Self>, OutboundQueue) {
        let (outbound, queue) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(SessionState::Connecting);
        let session = Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            remote_addr,
            peer_session_id: OnceLock::new(),
            version: OnceLock::new(),
            state,
            created_at: Instant::now(),
            last_read: AtomicU64::new(0),
            last_write: AtomicU64::new(0),
            outstanding: AtomicUsize::new(0),
            next_correlation: AtomicU64::new(1),
            outbound,
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        });
        (session, queue)
    }

    /// Local session ID
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Session role
    pub fn role(&self) -> SessionRole {
        self.role
    }

    /// Peer socket address
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// ID the server assigned during the handshake (client side only).
    pub fn peer_session_id(&self) -> Option<&str> {
        self.peer_session_id.get().map(String::as_str)
    }

    pub(crate) fn set_peer_session_id(&self, id: &str) {
        let _ = self.peer_session_id.set(id.to_string());
    }

    /// Negotiated version, once the handshake has completed
    pub fn version(&self) -> Option<ProtocolVersion> {
        self.version.get().copied()
    }

    /// Record the negotiated version. It can only be set once.
    pub fn set_version(&self, version: ProtocolVersion) -> Result<()> {
        self.version.set(version).map_err(|_| {
            RpcError::Protocol(format!("session {} already negotiated", self.id))
        })
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Whether new requests may be sent.
    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Move to `next`, returning the previous state.
    pub fn transition(&self, next: SessionState) -> Result<SessionState> {
        let mut previous = None;
        self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                previous = Some(*current);
                *current = next;
                true
            } else {
                false
            }
        });
        match previous {
            Some(previous) => {
                tracing::debug!(session = %self.id, from = %previous, to = %next, "Session transition");
                Ok(previous)
            },
            None => Err(RpcError::Protocol(format!(
                "session {}: illegal transition {} -> {}",
                self.id,
                self.state(),
                next
            ))),
        }
    }

    /// Force the session to `Disconnected`.
    ///
    /// Returns `true` only for the call that performed the transition, so
    /// cleanup keyed on it runs once.
    pub fn force_disconnect(&self, reason: &str) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if current.is_terminal() {
                false
            } else {
                *current = SessionState::Disconnected;
                true
            }
        });
        if changed {
            tracing::info!(session = %self.id, peer = %self.remote_addr, reason, "Session disconnected");
        }
        changed
    }

    /// Wait until the session reaches `Disconnected`.
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| state.is_terminal()).await;
    }

    /// Allocate the next correlation id. Zero is never returned.
    pub fn next_correlation_id(&self) -> u64 {
        self.next_correlation.fetch_add(1, Ordering::Relaxed)
    }

    /// Queue a frame for the writer task.
    pub fn send_frame(&self, frame: Frame) -> Result<()> {
        if self.state().is_terminal() {
            return Err(RpcError::CommunicationFailure(format!(
                "session {} is disconnected",
                self.id
            )));
        }
        self.outbound.send(frame).map_err(|_| {
            RpcError::CommunicationFailure(format!("session {} writer has stopped", self.id))
        })
    }

    /// Queue a payload-less control frame at the negotiated version.
    pub fn send_control(&self, msg_type: MessageType) -> Result<()> {
        let version = self.version().ok_or_else(|| {
            RpcError::Protocol(format!("session {} has no negotiated version", self.id))
        })?;
        self.send_frame(Frame::control(version, msg_type))
    }

    fn now_millis(&self) -> u64 {
        self.created_at.elapsed().as_millis() as u64
    }

    pub(crate) fn record_read(&self, bytes: usize) {
        self.last_read.store(self.now_millis(), Ordering::Relaxed);
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_write(&self, bytes: usize) {
        self.last_write.store(self.now_millis(), Ordering::Relaxed);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Time since the last inbound frame.
    pub fn read_idle(&self) -> Duration {
        let last = self.last_read.load(Ordering::Relaxed);
        Duration::from_millis(self.now_millis().saturating_sub(last))
    }

    /// Time since the last outbound frame.
    pub fn write_idle(&self) -> Duration {
        let last = self.last_write.load(Ordering::Relaxed);
        Duration::from_millis(self.now_millis().saturating_sub(last))
    }

    /// Requests in flight on this session.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub(crate) fn increment_outstanding(&self) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn decrement_outstanding(&self) {
        let _ = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Snapshot of session counters
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            session_id: self.id.clone(),
            state: self.state(),
            version: self.version(),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            outstanding: self.outstanding(),
            uptime_secs: self.created_at.elapsed().as_secs(),
        }
    }
}

/// Session statistics
#[derive(Debug, Clone)]
pub struct SessionStats {
    /// Session ID
    pub session_id: String,
    /// Current state
    pub state: SessionState,
    /// Negotiated version
    pub version: Option<ProtocolVersion>,
    /// Frames written
    pub frames_sent: u64,
    /// Frames read
    pub frames_received: u64,
    /// Bytes written, headers included
    pub bytes_sent: u64,
    /// Bytes read, headers included
    pub bytes_received: u64,
    /// Requests in flight
    pub outstanding: usize,
    /// Session uptime in seconds
    pub uptime_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> (Arc<Session>, OutboundQueue) {
        Session::new(SessionRole::Client, "127.0.0.1:9000".parse().unwrap())
    }

    #[test]
    fn test_happy_path_transitions() {
        let (session, _queue) = session();
        assert_eq!(session.state(), SessionState::Connecting);
        session.transition(SessionState::Negotiating).unwrap();
        session.transition(SessionState::Active).unwrap();
        session.transition(SessionState::Suspending).unwrap();
        assert_eq!(
            session.transition(SessionState::Disconnected).unwrap(),
            SessionState::Suspending
        );
    }

    #[test]
    fn test_illegal_transitions() {
        let (session, _queue) = session();
        assert!(session.transition(SessionState::Active).is_err());
        assert!(session.transition(SessionState::Suspending).is_err());

        session.force_disconnect("test");
        for next in [
            SessionState::Connecting,
            SessionState::Negotiating,
            SessionState::Active,
            SessionState::Disconnected,
        ] {
            assert!(session.transition(next).is_err());
        }
    }

    #[test]
    fn test_force_disconnect_fires_once() {
        let (session, _queue) = session();
        session.transition(SessionState::Negotiating).unwrap();
        assert!(session.force_disconnect("first"));
        assert!(!session.force_disconnect("second"));
        assert!(session.send_control(MessageType::Heartbeat).is_err());
    }

    #[test]
    fn test_version_set_once() {
        let (session, _queue) = session();
        session.set_version(ProtocolVersion::V3).unwrap();
        assert!(session.set_version(ProtocolVersion::V4).is_err());
        assert_eq!(session.version(), Some(ProtocolVersion::V3));
    }

    #[test]
    fn test_correlation_ids_start_at_one() {
        let (session, _queue) = session();
        assert_eq!(session.next_correlation_id(), 1);
        assert_eq!(session.next_correlation_id(), 2);
    }

    #[test]
    fn test_outstanding_never_underflows() {
        let (session, _queue) = session();
        session.increment_outstanding();
        session.decrement_outstanding();
        session.decrement_outstanding();
        assert_eq!(session.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_send_frame_queues() {
        let (session, mut queue) = session();
        session.set_version(ProtocolVersion::V5).unwrap();
        session.send_control(MessageType::Heartbeat).unwrap();
        let frame = queue.recv().await.unwrap();
        assert_eq!(frame.msg_type, MessageType::Heartbeat);
        assert_eq!(frame.version, 5);
    }

    #[tokio::test]
    async fn test_closed_resolves_on_disconnect() {
        let (session, _queue) = session();
        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.closed().await })
        };
        tokio::task::yield_now().await;
        session.force_disconnect("done");
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
