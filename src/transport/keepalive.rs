//! Keep-alive timers.
//!
//! Two independent checks run on one tick:
//!
//! - no outbound traffic for `interval`: send HEARTBEAT
//! - no inbound traffic for `timeout`: the peer is presumed dead and the
//!   session is forced to `Disconnected`

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::codec::MessageType;
use crate::protocol::{Session, SessionState};

/// Keep-alive settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAlive {
    /// Send a heartbeat after this much write-idle time
    pub interval: Duration,
    /// Disconnect after this much read-idle time
    pub timeout: Duration,
}

impl KeepAlive {
    fn tick(&self) -> Duration {
        (self.interval.min(self.timeout) / 4).max(Duration::from_millis(5))
    }
}

/// Spawn the keep-alive task for `session`. It ends with the session.
pub fn spawn_keepalive(session: Arc<Session>, settings: KeepAlive) -> JoinHandle<()> {
    tokio::spawn(async move {
        let closed = session.closed();
        tokio::pin!(closed);
        let mut ticker = tokio::time::interval(settings.tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut closed => break,
                _ = ticker.tick() => {},
            }

            if !matches!(session.state(), SessionState::Active | SessionState::Suspending) {
                continue;
            }

            let read_idle = session.read_idle();
            if read_idle >= settings.timeout {
                tracing::warn!(
                    session = %session.id(),
                    peer = %session.remote_addr(),
                    ?read_idle,
                    "Keep-alive timeout, peer presumed dead"
                );
                session.force_disconnect("keep-alive timeout");
                break;
            }

            if session.write_idle() >= settings.interval {
                tracing::trace!(session = %session.id(), "Sending heartbeat");
                let _ = session.send_control(MessageType::Heartbeat);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ProtocolVersion, SessionRole};

    fn active_session() -> (Arc<Session>, crate::protocol::OutboundQueue) {
        let (session, queue) = Session::new(SessionRole::Client, "127.0.0.1:1".parse().unwrap());
        session.transition(SessionState::Negotiating).unwrap();
        session.set_version(ProtocolVersion::V5).unwrap();
        session.transition(SessionState::Active).unwrap();
        (session, queue)
    }

    #[tokio::test]
    async fn test_heartbeat_when_write_idle() {
        let (session, mut queue) = active_session();
        let handle = spawn_keepalive(
            session.clone(),
            KeepAlive {
                interval: Duration::from_millis(40),
                timeout: Duration::from_secs(10),
            },
        );

        let frame = tokio::time::timeout(Duration::from_secs(2), queue.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.msg_type, MessageType::Heartbeat);

        session.force_disconnect("test over");
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_when_read_idle() {
        let (session, _queue) = active_session();
        let handle = spawn_keepalive(
            session.clone(),
            KeepAlive {
                interval: Duration::from_millis(20),
                timeout: Duration::from_millis(80),
            },
        );

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.state(), SessionState::Disconnected);
    }
}
