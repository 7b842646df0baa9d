//! Request correlation: pending calls, response routing and expiry.
//!
//! Every pending call is resolved exactly once. The three triggers
//! (response, expiry, session failure) all go through [`RequestCorrelator::take`],
//! and whichever removes the entry from the map owns the observer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::codec::{
    Arguments, DecodeOptions, ExecutionContext, Frame, Marshaller, MessageType, OperationKey,
    Returned, TypeTag,
};
use crate::error::{Result, RpcError};
use crate::protocol::Session;

/// Terminal result of one call
pub type CallOutcome = Result<Returned>;

/// Receives the outcome of a call, exactly once.
///
/// Observers run on I/O or timer tasks and must not block.
pub trait ExecutionObserver: Send + 'static {
    /// Deliver the outcome.
    fn on_complete(self: Box<Self>, outcome: CallOutcome);
}

impl<F> ExecutionObserver for F
where
    F: FnOnce(CallOutcome) + Send + 'static,
{
    fn on_complete(self: Box<Self>, outcome: CallOutcome) {
        (*self)(outcome)
    }
}

/// How long a call may wait for its response
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TimeoutPolicy {
    /// Use the configured default
    #[default]
    Default,
    /// Expire after the given duration
    Expires(Duration),
}

/// Per-call options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallOptions {
    /// Expiry policy
    pub timeout: TimeoutPolicy,
    /// Enum policy override, `None` to use the client default
    pub enum_hard_fail: Option<bool>,
}

impl CallOptions {
    /// Default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Expire after `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = TimeoutPolicy::Expires(timeout);
        self
    }

    /// Override the enum policy.
    pub fn with_enum_hard_fail(mut self, hard_fail: bool) -> Self {
        self.enum_hard_fail = Some(hard_fail);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PendingKey {
    session_id: String,
    correlation_id: u64,
}

struct PendingRequest {
    session: Arc<Session>,
    key: OperationKey,
    deadline: Instant,
    timeout: Duration,
    returns: Option<TypeTag>,
    options: DecodeOptions,
    observer: Box<dyn ExecutionObserver>,
}

impl PendingRequest {
    fn resolve(self, outcome: CallOutcome) {
        self.observer.on_complete(outcome);
    }
}

/// Tracks in-flight calls across sessions
pub struct RequestCorrelator {
    marshaller: Marshaller,
    pending: Mutex<HashMap<PendingKey, PendingRequest>>,
    default_timeout: Duration,
    default_options: DecodeOptions,
}

impl RequestCorrelator {
    /// Create a correlator.
    pub fn new(
        marshaller: Marshaller,
        default_timeout: Duration,
        default_options: DecodeOptions,
    ) -> Self {
        Self {
            marshaller,
            pending: Mutex::new(HashMap::new()),
            default_timeout,
            default_options,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PendingKey, PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of calls awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    /// Send a REQUEST on `session`. Never blocks; the outcome arrives via `observer`.
    pub fn send(
        &self,
        session: &Arc<Session>,
        key: &OperationKey,
        context: &ExecutionContext,
        args: &Arguments,
        options: CallOptions,
        observer: Box<dyn ExecutionObserver>,
    ) {
        if !session.is_active() {
            observer.on_complete(Err(RpcError::CommunicationFailure(format!(
                "session {} is {}",
                session.id(),
                session.state()
            ))));
            return;
        }
        let Some(version) = session.version() else {
            observer.on_complete(Err(RpcError::Protocol("session not negotiated".to_string())));
            return;
        };

        let payload = match self.marshaller.encode_request(version, key, context, args) {
            Ok(payload) => payload,
            Err(e) => {
                observer.on_complete(Err(e));
                return;
            },
        };

        let timeout = match options.timeout {
            TimeoutPolicy::Default => self.default_timeout,
            TimeoutPolicy::Expires(timeout) => timeout,
        };
        let decode = options
            .enum_hard_fail
            .map(|enum_hard_fail| DecodeOptions { enum_hard_fail })
            .unwrap_or(self.default_options);
        let returns = self
            .marshaller
            .registry()
            .operation(key)
            .and_then(|def| def.returns.clone());

        let correlation_id = session.next_correlation_id();
        let pending_key = PendingKey {
            session_id: session.id().to_string(),
            correlation_id,
        };

        // registered before the frame is queued so a fast response finds it
        session.increment_outstanding();
        self.lock().insert(
            pending_key.clone(),
            PendingRequest {
                session: session.clone(),
                key: key.clone(),
                deadline: Instant::now() + timeout,
                timeout,
                returns,
                options: decode,
                observer,
            },
        );

        tracing::debug!(session = %session.id(), correlation_id, operation = %key, "Request sent");

        let frame = Frame::new(version, MessageType::Request, correlation_id, payload);
        if let Err(e) = session.send_frame(frame) {
            if let Some(pending) = self.take(&pending_key) {
                pending.resolve(Err(e));
            }
        }
    }

    fn take(&self, key: &PendingKey) -> Option<PendingRequest> {
        let pending = self.lock().remove(key)?;
        pending.session.decrement_outstanding();
        Some(pending)
    }

    /// Route a RESPONSE_OK / RESPONSE_FAULT frame to its caller.
    ///
    /// Unknown correlation ids (late, duplicate or after timeout) are logged
    /// and dropped.
    pub fn on_response_frame(&self, session: &Session, frame: &Frame) {
        let key = PendingKey {
            session_id: session.id().to_string(),
            correlation_id: frame.correlation_id,
        };
        let Some(pending) = self.take(&key) else {
            tracing::warn!(
                session = %session.id(),
                correlation_id = frame.correlation_id,
                msg_type = ?frame.msg_type,
                "Discarding response with no pending request"
            );
            return;
        };

        let outcome = match frame.msg_type {
            MessageType::ResponseOk => self.marshaller.decode_response(
                &frame.payload,
                pending.returns.as_ref(),
                pending.options,
            ),
            MessageType::ResponseFault => match self.marshaller.decode_fault(&frame.payload) {
                Ok(fault) => Err(RpcError::Fault(fault)),
                Err(e) => Err(e),
            },
            other => Err(RpcError::Protocol(format!("{other:?} is not a response"))),
        };

        tracing::debug!(
            session = %session.id(),
            correlation_id = frame.correlation_id,
            operation = %pending.key,
            ok = outcome.is_ok(),
            "Response received"
        );
        pending.resolve(outcome);
    }

    /// Fire `Timeout` for every call whose deadline is at or before `now`.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let expired: Vec<PendingKey> = self
            .lock()
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(k, _)| k.clone())
            .collect();

        let mut fired = 0;
        for key in expired {
            if let Some(pending) = self.take(&key) {
                tracing::debug!(
                    session = %key.session_id,
                    correlation_id = key.correlation_id,
                    operation = %pending.key,
                    "Call timed out"
                );
                let timeout = pending.timeout;
                pending.resolve(Err(RpcError::Timeout(timeout)));
                fired += 1;
            }
        }
        fired
    }

    /// Fail every call still pending on a session that has gone away.
    pub fn fail_session(&self, session_id: &str, reason: &str) -> usize {
        let keys: Vec<PendingKey> = self
            .lock()
            .keys()
            .filter(|k| k.session_id == session_id)
            .cloned()
            .collect();

        let mut failed = 0;
        for key in keys {
            if let Some(pending) = self.take(&key) {
                pending.resolve(Err(RpcError::CommunicationFailure(format!(
                    "session {session_id} closed: {reason}"
                ))));
                failed += 1;
            }
        }
        if failed > 0 {
            tracing::info!(session = %session_id, failed, reason, "Failed outstanding calls");
        }
        failed
    }

    /// Spawn the periodic expiry sweep. It stops once the correlator is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(correlator) = weak.upgrade() else { break };
                correlator.sweep_expired(Instant::now());
            }
        })
    }
}
