//! RPC server: accept loop, per-connection dispatch and graceful drain.
//!
//! Each accepted connection negotiates a version, then runs a read loop on
//! its own task. REQUEST frames are handed to a bounded worker pool so a
//! slow handler never stalls frame reading. Responses go back through the
//! session's outbound queue.
//!
//! # Example
//!
//! ```rust,ignore
//! use sockrpc::server::{RpcServer, ServerConfig, RequestContext};
//! use sockrpc::codec::{Arguments, Returned};
//!
//! let mut server = RpcServer::new(ServerConfig::default().with_port(7300), schemas)?;
//! server.register_operation_handler(key, |_req: RequestContext, args: Arguments| async move {
//!     Ok(Returned::value(args.get("text").cloned().unwrap_or_default()))
//! })?;
//! let handle = server.serve().await?;
//! handle.set_healthy(false).await; // drain
//! ```

mod config;
mod registry;
mod state;

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;

pub use config::ServerConfig;
pub use registry::{HandlerResult, OperationHandler, OperationRegistry, RequestContext};
pub use state::{DrainPolicy, SessionManager};

use crate::codec::{
    DecodeOptions, Frame, FrameCodec, Marshaller, MessageType, OperationKey, Returned,
    SchemaRegistry,
};
use crate::error::{Fault, FaultCode, Result, RpcError};
use crate::protocol::{
    Handshake, HandshakeReply, Session, SessionRole, SessionState, SessionStats, VersionRange,
};
use crate::transport::{spawn_keepalive, spawn_writer, write_frame, FrameReader, KeepAlive};

/// An RPC server that has not started listening yet
pub struct RpcServer {
    config: ServerConfig,
    operations: OperationRegistry,
}

impl RpcServer {
    /// Create a server. Handlers are registered before [`serve`](Self::serve).
    pub fn new(config: ServerConfig, schemas: Arc<SchemaRegistry>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            operations: OperationRegistry::new(schemas),
        })
    }

    /// Register the handler for `key`.
    pub fn register_operation_handler(
        &mut self,
        key: OperationKey,
        handler: impl OperationHandler,
    ) -> Result<()> {
        self.operations.register(key, handler)
    }

    /// Bind and start accepting connections.
    pub async fn serve(self) -> Result<ServerHandle> {
        let listener = TcpListener::bind(self.config.addr).await?;
        let local_addr = listener.local_addr()?;
        let range = self.config.version_range()?;

        let shared = Arc::new(Shared {
            range,
            marshaller: Marshaller::new(self.operations.schemas().clone()),
            sessions: SessionManager::new(DrainPolicy {
                max_wait: self.config.drain_timeout(),
                poll_interval: self.config.drain_poll_interval(),
            }),
            workers: Arc::new(Semaphore::new(self.config.worker_pool_size)),
            options: self.config.decode_options(),
            operations: self.operations,
            config: self.config,
        });

        tracing::info!(
            addr = %local_addr,
            versions = %range,
            operations = shared.operations.len(),
            "RPC server listening"
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        let accept = tokio::spawn(accept_loop(shared.clone(), listener, shutdown_rx));

        Ok(ServerHandle {
            shared,
            local_addr,
            shutdown,
            accept: Mutex::new(Some(accept)),
        })
    }
}

/// Control surface of a running server
pub struct ServerHandle {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept: Mutex<Option<JoinHandle<()>>>,
}

impl ServerHandle {
    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Mark the server healthy or unhealthy. Going unhealthy drains every
    /// active session.
    pub async fn set_healthy(&self, healthy: bool) {
        self.shared.sessions.set_healthy(healthy).await;
    }

    /// Current health flag.
    pub fn is_healthy(&self) -> bool {
        self.shared.sessions.is_healthy()
    }

    /// Number of tracked sessions.
    pub async fn session_count(&self) -> usize {
        self.shared.sessions.count().await
    }

    /// Stats for every tracked session.
    pub async fn session_stats(&self) -> Vec<SessionStats> {
        self.shared.sessions.stats().await
    }

    /// Stop accepting and DISCONNECT every session.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let accept = self
            .accept
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(accept) = accept {
            let _ = accept.await;
        }
        self.shared.sessions.disconnect_all().await;
        tracing::info!(addr = %self.local_addr, "RPC server stopped");
    }
}

struct Shared {
    config: ServerConfig,
    range: VersionRange,
    marshaller: Marshaller,
    operations: OperationRegistry,
    sessions: SessionManager,
    workers: Arc<Semaphore>,
    options: DecodeOptions,
}

async fn accept_loop(
    shared: Arc<Shared>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let shared = shared.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(shared, stream, peer).await {
                            tracing::warn!(%peer, error = %e, "Connection ended with error");
                        }
                    });
                },
                Err(e) => {
                    tracing::error!(error = %e, "Accept failed");
                },
            },
        }
    }
    tracing::debug!("Accept loop exiting");
}

async fn handle_connection(shared: Arc<Shared>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
    stream.set_nodelay(true)?;
    let (session, queue) = Session::new(SessionRole::Server, peer);
    session.transition(SessionState::Negotiating)?;

    let (read_half, mut write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half, FrameCodec::new(shared.range));

    let handshake = tokio::time::timeout(shared.config.handshake_timeout(), reader.next_frame());
    let frame = match handshake.await {
        Ok(Ok(Some(frame))) => frame,
        Ok(Ok(None)) => {
            session.force_disconnect("closed before handshake");
            return Ok(());
        },
        Ok(Err(e)) => {
            session.force_disconnect("bad handshake");
            return Err(e);
        },
        Err(_) => {
            session.force_disconnect("handshake timeout");
            return Err(RpcError::NegotiationFailed(format!("no HANDSHAKE from {peer}")));
        },
    };
    session.record_read(frame.encoded_len());

    let hello = Handshake::from_frame(&frame)?;
    let reply = hello.respond(&shared.range, session.id());
    write_frame(&mut write_half, &reply.to_frame()).await?;

    let version = match reply {
        HandshakeReply::Accepted { version, .. } => version,
        HandshakeReply::Rejected { server_range } => {
            session.force_disconnect("no common protocol version");
            return Err(RpcError::NegotiationFailed(format!(
                "client {} offered {}, server supports {server_range}",
                hello.client_id, hello.range
            )));
        },
    };
    session.set_version(version)?;
    session.set_peer_session_id(&hello.client_id);
    reader.set_negotiated(version);
    session.transition(SessionState::Active)?;

    spawn_writer(session.clone(), write_half, queue);
    spawn_keepalive(
        session.clone(),
        KeepAlive {
            interval: shared.config.keep_alive_interval(),
            timeout: shared.config.keep_alive_timeout(),
        },
    );
    shared.sessions.insert(session.clone()).await;
    tracing::info!(
        session = %session.id(),
        %peer,
        client = %hello.client_id,
        %version,
        "Session established"
    );

    if !shared.sessions.is_healthy() {
        tracing::info!(session = %session.id(), "Server unhealthy, refusing session");
        let _ = session.send_control(MessageType::Disconnect);
    }

    read_loop(&shared, &session, &mut reader).await;

    shared.sessions.remove(session.id()).await;
    Ok(())
}

async fn read_loop(
    shared: &Arc<Shared>,
    session: &Arc<Session>,
    reader: &mut FrameReader<tokio::net::tcp::OwnedReadHalf>,
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
            MessageType::Request => {
                session.increment_outstanding();
                tokio::spawn(dispatch(shared.clone(), session.clone(), frame));
            },
            MessageType::Heartbeat => {},
            MessageType::Suspend => {
                let _ = session.transition(SessionState::Suspending);
            },
            MessageType::Disconnect => {
                session.force_disconnect("peer sent DISCONNECT");
                break;
            },
            other => {
                tracing::warn!(session = %session.id(), msg_type = ?other, "Unexpected frame from client");
                session.force_disconnect("protocol violation");
                break;
            },
        }
    }
}

/// Run one request on the worker pool and queue its response.
async fn dispatch(shared: Arc<Shared>, session: Arc<Session>, frame: Frame) {
    let correlation_id = frame.correlation_id;
    let outcome = match shared.workers.clone().acquire_owned().await {
        Ok(_permit) => {
            match AssertUnwindSafe(execute(&shared, &session, &frame))
                .catch_unwind()
                .await
            {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::error!(session = %session.id(), correlation_id, "Handler panicked");
                    Err(Fault::new(FaultCode::Server, "operation handler panicked"))
                },
            }
        },
        Err(_) => Err(Fault::new(FaultCode::Server, "worker pool closed")),
    };

    if let Some(version) = session.version() {
        let response = match outcome.and_then(|r| {
            shared
                .marshaller
                .encode_response(&r)
                .map_err(|e| e.to_fault())
        }) {
            Ok(payload) => Frame::new(version, MessageType::ResponseOk, correlation_id, payload),
            Err(fault) => {
                tracing::debug!(
                    session = %session.id(),
                    correlation_id,
                    code = fault.code.as_str(),
                    "Replying with fault"
                );
                Frame::new(
                    version,
                    MessageType::ResponseFault,
                    correlation_id,
                    shared.marshaller.encode_fault(&fault),
                )
            },
        };
        if let Err(e) = session.send_frame(response) {
            tracing::debug!(session = %session.id(), correlation_id, error = %e, "Response dropped");
        }
    }
    session.decrement_outstanding();
}

async fn execute(
    shared: &Shared,
    session: &Session,
    frame: &Frame,
) -> std::result::Result<Returned, Fault> {
    let version = session
        .version()
        .ok_or_else(|| Fault::new(FaultCode::Server, "session has no negotiated version"))?;
    let request = shared
        .marshaller
        .decode_request(version, &frame.payload)
        .map_err(|e| e.to_fault())?;
    let operation = shared
        .operations
        .lookup(&request.key)
        .map_err(|e| e.to_fault())?
        .clone();
    let (key, context, args) = shared
        .marshaller
        .bind_arguments(request, &operation.definition.params, shared.options)
        .map_err(|e| e.to_fault())?;

    tracing::debug!(session = %session.id(), operation = %key, "Dispatching request");
    let request = RequestContext {
        key,
        context,
        session_id: session.id().to_string(),
        remote_addr: session.remote_addr(),
    };
    operation.handler.handle(request, args).await
}
