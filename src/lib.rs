//! # sockrpc - Persistent Binary RPC over TCP
//!
//! A connection-oriented RPC transport: clients keep one long-lived,
//! version-negotiated TCP session to one of several servers and multiplex
//! many concurrent calls over it. Payloads are marshalled field-by-name so
//! that peers built against different schema versions keep talking.
//!
//! ## Features
//!
//! - **Version negotiation**: HANDSHAKE / HANDSHAKE_ACK picks the highest
//!   version both peers support
//! - **Schema evolution**: unknown fields dropped, missing fields defaulted,
//!   enum drift handled by a per-call hard-fail policy
//! - **Object graphs**: cycles and shared references survive a round trip
//! - **Correlation**: out-of-order responses, per-call timeouts, exactly one
//!   outcome per call
//! - **Failover**: health-aware reconnection across a candidate address list
//! - **Graceful drain**: SUSPEND, wait for in-flight work, then DISCONNECT
//!
//! ## Protocol Overview
//!
//! ```text
//! Client                                              Server
//!    |                                                   |
//!    |------ HANDSHAKE (min, max, client id) ----------->|
//!    |<----- HANDSHAKE_ACK (version, session id) --------|
//!    |                                                   |
//!    |====== REQUEST #1 ================================>|
//!    |====== REQUEST #2 ================================>|
//!    |<===== RESPONSE_OK #2 =============================|
//!    |<===== RESPONSE_FAULT #1 ==========================|
//!    |                                                   |
//!    |<----> HEARTBEAT (either side, when idle) <------->|
//!    |                                                   |
//!    |<----- SUSPEND (server unhealthy, v5+) ------------|
//!    |<----- DISCONNECT ---------------------------------|
//! ```
//!
//! ### Session State Machine
//!
//! ```text
//!  [Connecting] ──> [Negotiating] ──> [Active] ──> [Suspending]
//!        │                │              │               │
//!        └────────────────┴──────────────┴───────────────┴──> [Disconnected]
//! ```
//!
//! ### Message Types
//!
//! | Type           | Byte | Direction     | Correlated |
//! |----------------|------|---------------|------------|
//! | HANDSHAKE      | 1    | Client→Server | no         |
//! | HANDSHAKE_ACK  | 2    | Server→Client | no         |
//! | REQUEST        | 3    | Client→Server | yes        |
//! | RESPONSE_OK    | 4    | Server→Client | yes        |
//! | RESPONSE_FAULT | 5    | Server→Client | yes        |
//! | HEARTBEAT      | 6    | Bidirectional | no         |
//! | SUSPEND        | 7    | Server→Client | no         |
//! | DISCONNECT     | 8    | Bidirectional | no         |
//!
//! ## Quick Start
//!
//! ### Server
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use sockrpc::codec::{Arguments, FieldDescriptor, OperationDefinition, OperationKey, Returned, SchemaRegistry, TypeTag};
//! use sockrpc::server::{RequestContext, RpcServer, ServerConfig};
//!
//! let key = OperationKey::new("Greeter", "1", "greet");
//! let schemas = Arc::new(SchemaRegistry::new().with_operation(
//!     OperationDefinition::new(key.clone())
//!         .param(FieldDescriptor::mandatory("name", TypeTag::Str))
//!         .returns(TypeTag::Str),
//! ));
//!
//! let mut server = RpcServer::new(ServerConfig::default(), schemas)?;
//! server.register_operation_handler(key, |_req: RequestContext, args: Arguments| async move {
//!     let name = args.get("name").and_then(|v| v.as_str()).unwrap_or("stranger");
//!     Ok(Returned::value(format!("hello {name}")))
//! })?;
//! let handle = server.serve().await?;
//! ```
//!
//! ### Client
//!
//! ```rust,ignore
//! use sockrpc::client::{CallOptions, ClientConfig, ConnectionFactory};
//!
//! let factory = ConnectionFactory::new(ClientConfig::default(), schemas)?;
//! factory.start().wait().await?;
//!
//! let returned = factory
//!     .call(&key, &Arguments::new().with("name", "ada"), CallOptions::new())
//!     .await?;
//! assert_eq!(returned.value.as_str(), Some("hello ada"));
//! ```
//!
//! ## Modules
//!
//! - [`codec`]: Frames, values, schemas and the marshaller
//! - [`protocol`]: Versions, handshake and the session state machine
//! - [`transport`]: TCP connect, frame I/O and keep-alive
//! - [`client`]: Connection factory and request correlator
//! - [`server`]: Accept loop, operation registry and graceful drain
//! - [`config`]: Configuration management
//! - [`logging`]: Subscriber setup
//! - [`error`]: Error types and result aliases

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod server;
pub mod transport;

// Re-exports for convenience
pub use client::{CallOptions, ClientConfig, ConnectionFactory, ExecutionObserver, TimeoutPolicy};
pub use codec::{
    Arguments, DecodeOptions, ExecutionContext, OperationDefinition, OperationKey, Returned,
    SchemaRegistry, Value,
};
pub use config::Config;
pub use error::{Fault, FaultCode, Result, RpcError};
pub use protocol::{ProtocolVersion, Session, SessionState, VersionRange};
pub use server::{RequestContext, RpcServer, ServerConfig, ServerHandle};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
