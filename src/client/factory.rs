//! Client connection factory: one active session over a list of candidates.
//!
//! A supervisor task owns the connect / reconnect loop. It walks the
//! candidate list starting after the last address that worked, skips
//! addresses an [`AddressHealth`] probe reports as down, and after a full
//! failed pass sleeps for the reconnect interval (plus jitter) before trying
//! again. It runs until [`ConnectionFactory::stop`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::config::ClientConfig;
use super::correlator::{CallOptions, CallOutcome, ExecutionObserver, RequestCorrelator};
use crate::codec::{
    Arguments, ExecutionContext, FrameCodec, Marshaller, MessageType, OperationKey, SchemaRegistry,
};
use crate::error::{Result, RpcError};
use crate::protocol::{Handshake, HandshakeReply, Session, SessionRole, SessionState, VersionRange};
use crate::transport::{self, spawn_keepalive, spawn_writer, write_frame, FrameReader, KeepAlive};

/// External view of whether a server is fit to receive traffic
pub trait AddressHealth: Send + Sync + 'static {
    /// `false` to skip `address` during selection.
    fn is_healthy(&self, address: &str) -> bool;
}

impl<F> AddressHealth for F
where
    F: Fn(&str) -> bool + Send + Sync + 'static,
{
    fn is_healthy(&self, address: &str) -> bool {
        self(address)
    }
}

/// Connection state of one candidate address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Not connected
    Disconnected,
    /// Connect or handshake in progress
    Connecting,
    /// Carries the active session
    Connected,
    /// Last attempt failed or the address was skipped as unhealthy
    Failed,
}

/// Status snapshot for one candidate address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressStatus {
    /// Address as configured
    pub address: String,
    /// Current status
    pub status: ConnectionStatus,
}

struct FactoryState {
    statuses: Vec<ConnectionStatus>,
    active: Option<(usize, Arc<Session>)>,
    last_index: Option<usize>,
    last_error: Option<String>,
    supervisor: Option<JoinHandle<()>>,
    sweeper: Option<JoinHandle<()>>,
}

struct Inner {
    config: ClientConfig,
    range: VersionRange,
    addresses: Vec<String>,
    client_id: String,
    correlator: Arc<RequestCorrelator>,
    health: Option<Arc<dyn AddressHealth>>,
    state: Mutex<FactoryState>,
    running: watch::Sender<bool>,
    // bumped on every status change so start() waiters re-check
    changes: watch::Sender<u64>,
}

/// Maintains at most one active session to one of the candidate servers
#[derive(Clone)]
pub struct ConnectionFactory {
    inner: Arc<Inner>,
}

impl ConnectionFactory {
    /// Create a factory. Nothing connects until [`start`](Self::start).
    pub fn new(config: ClientConfig, registry: Arc<SchemaRegistry>) -> Result<Self> {
        config.validate()?;
        let range = config.version_range()?;
        let addresses = config.address_list();
        let correlator = Arc::new(RequestCorrelator::new(
            Marshaller::new(registry),
            config.default_call_timeout(),
            config.decode_options(),
        ));
        let (running, _) = watch::channel(false);
        let (changes, _) = watch::channel(0);

        Ok(Self {
            inner: Arc::new(Inner {
                range,
                client_id: uuid::Uuid::new_v4().to_string(),
                correlator,
                health: None,
                state: Mutex::new(FactoryState {
                    statuses: vec![ConnectionStatus::Disconnected; addresses.len()],
                    active: None,
                    last_index: None,
                    last_error: None,
                    supervisor: None,
                    sweeper: None,
                }),
                addresses,
                config,
                running,
                changes,
            }),
        })
    }

    /// Attach a health probe consulted during address selection.
    ///
    /// Must be called before the factory is cloned or started.
    pub fn with_health(mut self, probe: impl AddressHealth) -> Result<Self> {
        let inner = Arc::get_mut(&mut self.inner).ok_or_else(|| {
            RpcError::Config("health probe must be set before the factory is shared".to_string())
        })?;
        inner.health = Some(Arc::new(probe));
        Ok(self)
    }

    /// Begin connecting. Connection attempts continue in the background;
    /// the returned handle resolves on the first active session.
    pub fn start(&self) -> StartHandle {
        let deadline = Instant::now() + self.inner.config.start_timeout();
        let already_running = self.inner.running.send_replace(true);

        if !already_running {
            tracing::info!(addresses = ?self.inner.addresses, "Connection factory starting");
            let supervisor = tokio::spawn(supervise(self.inner.clone()));
            let mut state = self.inner.lock();
            state.supervisor = Some(supervisor);
            if state.sweeper.is_none() {
                state.sweeper = Some(
                    self.inner
                        .correlator
                        .spawn_sweeper(self.inner.config.sweep_interval()),
                );
            }
        }
        self.inner.notify();

        StartHandle {
            inner: self.inner.clone(),
            deadline,
        }
    }

    /// Stop reconnecting and close the active session.
    pub async fn stop(&self) -> Result<()> {
        let was_running = self.inner.running.send_replace(false);
        self.inner.notify();

        let (supervisor, active) = {
            let mut state = self.inner.lock();
            (state.supervisor.take(), state.active.take())
        };
        if let Some((index, session)) = active {
            self.inner.close_session(index, &session).await;
        }

        if let Some(supervisor) = supervisor {
            let _ = supervisor.await;
        }
        // a handshake may have finished while the supervisor was winding down
        let late = self.inner.lock().active.take();
        if let Some((index, session)) = late {
            self.inner.close_session(index, &session).await;
        }

        if was_running {
            tracing::info!("Connection factory stopped");
        }
        Ok(())
    }

    /// Whether a session is active right now.
    pub fn is_connected(&self) -> bool {
        self.inner
            .lock()
            .active
            .as_ref()
            .is_some_and(|(_, session)| session.is_active())
    }

    /// Per-address connection status.
    pub fn connected_status(&self) -> Vec<AddressStatus> {
        let state = self.inner.lock();
        self.inner
            .addresses
            .iter()
            .zip(state.statuses.iter())
            .map(|(address, status)| AddressStatus {
                address: address.clone(),
                status: *status,
            })
            .collect()
    }

    /// Address of the active session, if any.
    pub fn active_address(&self) -> Option<String> {
        let state = self.inner.lock();
        state
            .active
            .as_ref()
            .map(|(index, _)| self.inner.addresses[*index].clone())
    }

    /// The active session, if any.
    pub fn session(&self) -> Option<Arc<Session>> {
        self.inner.lock().active.as_ref().map(|(_, s)| s.clone())
    }

    /// Calls awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.inner.correlator.pending_count()
    }

    /// Invoke an operation; the outcome is delivered to `observer`.
    pub fn invoke(
        &self,
        key: &OperationKey,
        args: &Arguments,
        options: CallOptions,
        observer: impl ExecutionObserver,
    ) {
        self.invoke_with_context(key, &ExecutionContext::new(), args, options, observer);
    }

    /// Invoke an operation with an explicit execution context.
    pub fn invoke_with_context(
        &self,
        key: &OperationKey,
        context: &ExecutionContext,
        args: &Arguments,
        options: CallOptions,
        observer: impl ExecutionObserver,
    ) {
        let observer: Box<dyn ExecutionObserver> = Box::new(observer);
        match self.session() {
            Some(session) => self
                .inner
                .correlator
                .send(&session, key, context, args, options, observer),
            None => observer.on_complete(Err(RpcError::NotConnected)),
        }
    }

    /// Invoke an operation and await its outcome.
    pub async fn call(
        &self,
        key: &OperationKey,
        args: &Arguments,
        options: CallOptions,
    ) -> CallOutcome {
        self.call_with_context(key, &ExecutionContext::new(), args, options)
            .await
    }

    /// Invoke with an explicit context and await the outcome.
    pub async fn call_with_context(
        &self,
        key: &OperationKey,
        context: &ExecutionContext,
        args: &Arguments,
        options: CallOptions,
    ) -> CallOutcome {
        let (tx, rx) = oneshot::channel();
        self.invoke_with_context(key, context, args, options, move |outcome: CallOutcome| {
            let _ = tx.send(outcome);
        });
        rx.await.map_err(|_| RpcError::Cancelled)?
    }
}

/// Resolves when [`ConnectionFactory::start`] has produced a session
pub struct StartHandle {
    inner: Arc<Inner>,
    deadline: Instant,
}

impl StartHandle {
    /// Wait for the first active session.
    ///
    /// Fails with [`RpcError::NoViableAddress`] when the start window
    /// elapses and with [`RpcError::Cancelled`] if the factory is stopped.
    pub async fn wait(self) -> Result<()> {
        let mut changes = self.inner.changes.subscribe();
        loop {
            if !*self.inner.running.borrow() {
                return Err(RpcError::Cancelled);
            }
            let connected = self
                .inner
                .lock()
                .active
                .as_ref()
                .is_some_and(|(_, s)| s.is_active());
            if connected {
                return Ok(());
            }

            tokio::select! {
                changed = changes.changed() => {
                    if changed.is_err() {
                        return Err(RpcError::Cancelled);
                    }
                },
                _ = tokio::time::sleep_until(self.deadline) => {
                    let last = self.inner.lock().last_error.clone();
                    return Err(RpcError::NoViableAddress(
                        last.unwrap_or_else(|| "no address accepted a connection".to_string()),
                    ));
                },
            }
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, FactoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        self.changes.send_modify(|n| *n = n.wrapping_add(1));
    }

    fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    fn set_status(&self, index: usize, status: ConnectionStatus) {
        if let Some(slot) = self.lock().statuses.get_mut(index) {
            *slot = status;
        }
        self.notify();
    }

    fn backoff(&self) -> Duration {
        let base = self.config.reconnect_interval();
        let max_jitter = (base.as_millis() as u64) / 10;
        let jitter = if max_jitter == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=max_jitter)
        };
        base + Duration::from_millis(jitter)
    }

    /// One pass over the candidate list.
    async fn connect_any(self: &Arc<Self>) -> Option<Arc<Session>> {
        let count = self.addresses.len();
        let first = self.lock().last_index.map_or(0, |i| (i + 1) % count);

        for offset in 0..count {
            if !self.is_running() {
                return None;
            }
            let index = (first + offset) % count;
            let address = &self.addresses[index];

            if let Some(health) = &self.health {
                if !health.is_healthy(address) {
                    tracing::debug!(%address, "Skipping address reported unhealthy");
                    self.set_status(index, ConnectionStatus::Failed);
                    continue;
                }
            }

            self.set_status(index, ConnectionStatus::Connecting);
            match self.connect_one(address).await {
                Ok(session) => {
                    {
                        let mut state = self.lock();
                        if !self.is_running() {
                            drop(state);
                            tracing::debug!(%address, "Factory stopped mid-handshake");
                            if session.send_control(MessageType::Disconnect).is_err() {
                                session.force_disconnect("factory stopped");
                            }
                            self.set_status(index, ConnectionStatus::Disconnected);
                            return None;
                        }
                        state.active = Some((index, session.clone()));
                        state.last_index = Some(index);
                        state.last_error = None;
                    }
                    self.set_status(index, ConnectionStatus::Connected);
                    tracing::info!(
                        %address,
                        session = %session.id(),
                        version = ?session.version(),
                        "Connected"
                    );
                    return Some(session);
                },
                Err(e) => {
                    tracing::warn!(%address, error = %e, "Connection attempt failed");
                    self.lock().last_error = Some(format!("{address}: {e}"));
                    self.set_status(index, ConnectionStatus::Failed);
                },
            }
        }
        None
    }

    /// Connect, negotiate and spawn the session's tasks.
    async fn connect_one(self: &Arc<Self>, address: &str) -> Result<Arc<Session>> {
        let stream = transport::connect(address, self.config.connect_timeout()).await?;
        let remote = stream.peer_addr()?;
        let (session, queue) = Session::new(SessionRole::Client, remote);
        session.transition(SessionState::Negotiating)?;

        let (read_half, mut write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half, FrameCodec::new(self.range));

        let hello = Handshake::new(self.range, &self.client_id).to_frame();
        write_frame(&mut write_half, &hello).await?;

        let handshake = tokio::time::timeout(self.config.handshake_timeout(), reader.next_frame());
        let frame = match handshake.await {
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) => {
                return Err(RpcError::CommunicationFailure(
                    "connection closed during handshake".to_string(),
                ))
            },
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(RpcError::NegotiationFailed(format!(
                    "no HANDSHAKE_ACK within {:?}",
                    self.config.handshake_timeout()
                )))
            },
        };
        session.record_read(frame.encoded_len());

        let reply = HandshakeReply::from_frame(&frame)?;
        let (version, peer_id) = match reply.negotiated(&self.range) {
            Ok(negotiated) => negotiated,
            Err(e) => {
                session.force_disconnect("negotiation failed");
                return Err(e);
            },
        };
        session.set_version(version)?;
        session.set_peer_session_id(peer_id);
        reader.set_negotiated(version);
        session.transition(SessionState::Active)?;

        spawn_writer(session.clone(), write_half, queue);
        spawn_keepalive(
            session.clone(),
            KeepAlive {
                interval: self.config.keep_alive_interval(),
                timeout: self.config.keep_alive_timeout(),
            },
        );
        tokio::spawn(read_loop(session.clone(), reader, self.correlator.clone()));

        Ok(session)
    }

    /// Send DISCONNECT, wait briefly for the writer to flush it, then fail
    /// whatever is still pending on the session.
    async fn close_session(&self, index: usize, session: &Session) {
        if session.send_control(MessageType::Disconnect).is_err() {
            session.force_disconnect("factory stopped");
        }
        let linger = self.config.handshake_timeout();
        if tokio::time::timeout(linger, session.closed()).await.is_err() {
            session.force_disconnect("factory stopped");
        }
        self.correlator
            .fail_session(session.id(), "connection factory stopped");
        self.set_status(index, ConnectionStatus::Disconnected);
    }

    /// Clear the active slot if it still holds `session`.
    fn on_session_lost(&self, session: &Session) {
        let index = {
            let mut state = self.lock();
            match &state.active {
                Some((index, active)) if active.id() == session.id() => {
                    let index = *index;
                    state.active = None;
                    Some(index)
                },
                _ => None,
            }
        };
        self.correlator.fail_session(session.id(), "session lost");
        if let Some(index) = index {
            self.set_status(index, ConnectionStatus::Disconnected);
        }
    }
}

async fn supervise(inner: Arc<Inner>) {
    let mut running = inner.running.subscribe();
    loop {
        if !inner.is_running() {
            break;
        }

        if let Some(session) = inner.connect_any().await {
            tokio::select! {
                _ = session.closed() => {},
                _ = running.wait_for(|r| !*r) => break,
            }
            inner.on_session_lost(&session);
            if !inner.is_running() {
                break;
            }
            tracing::warn!(session = %session.id(), "Session lost, reconnecting");
        }

        let delay = inner.backoff();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {},
            _ = running.wait_for(|r| !*r) => break,
        }
    }
    tracing::debug!("Connection supervisor exiting");
}

async fn read_loop(
    session: Arc<Session>,
    mut reader: FrameReader<tokio::net::tcp::OwnedReadHalf>,
    correlator: Arc<RequestCorrelator>,
) {
    let closed = session.closed();
    tokio::pin!(closed);

    loop {
        let next = tokio::select! {
            next = reader.next_frame() => next,
            _ = &mut closed => break,
        };
        let frame = match next {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                session.force_disconnect("peer closed connection");
                break;
            },
            Err(e) => {
                tracing::warn!(session = %session.id(), error = %e, "Read failed");
                session.force_disconnect("read failed");
                break;
            },
        };
        session.record_read(frame.encoded_len());

        match frame.msg_type {
            MessageType::ResponseOk | MessageType::ResponseFault => {
                correlator.on_response_frame(&session, &frame);
            },
            MessageType::Heartbeat => {},
            MessageType::Suspend => {
                if session.transition(SessionState::Suspending).is_ok() {
                    tracing::info!(session = %session.id(), "Server suspended session");
                }
            },
            MessageType::Disconnect => {
                session.force_disconnect("peer sent DISCONNECT");
                break;
            },
            other => {
                tracing::warn!(session = %session.id(), msg_type = ?other, "Unexpected frame from server");
                session.force_disconnect("protocol violation");
                break;
            },
        }
    }

    correlator.fail_session(session.id(), "session closed");
}
