//! Transport error types.
//!
//! # Error Classification
//!
//! Errors fall into two groups:
//!
//! - **Connection-level**: [`RpcError::Framing`], [`RpcError::NegotiationFailed`],
//!   [`RpcError::Io`]. The owning session is forced to `Disconnected`; the
//!   client reconnects, the server drops the session.
//! - **Call-level**: [`RpcError::Timeout`], [`RpcError::EnumDeserialisation`],
//!   [`RpcError::Validation`], [`RpcError::Fault`]. Delivered to a single
//!   call's observer, the connection is unaffected.
//!
//! [`RpcError::CommunicationFailure`] sits between the two: it is the
//! per-call symptom of a connection-level failure, delivered to every call
//! that was outstanding when the session went away.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Transport errors.
#[derive(Error, Debug)]
pub enum RpcError {
    /// Malformed frame, unknown message type or unsupported frame version.
    #[error("Framing error: {0}")]
    Framing(String),

    /// No protocol version acceptable to both peers.
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    /// A call expired before its response arrived.
    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    /// The session carrying a call failed or was closed.
    #[error("Communication failure: {0}")]
    CommunicationFailure(String),

    /// An enum constant unknown to the local schema was read under hard-fail.
    #[error("Enum deserialisation failed: {enum_name} has no constant {value:?}")]
    EnumDeserialisation {
        /// Local enum type name.
        enum_name: String,
        /// Constant name found on the wire.
        value: String,
    },

    /// Missing mandatory field or a value of the wrong type.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Payload bytes could not be decoded.
    #[error("Marshalling error: {0}")]
    Marshalling(String),

    /// The remote side answered with a fault.
    #[error("Remote fault: {0}")]
    Fault(Fault),

    /// Operation key has no local definition or handler.
    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    /// Illegal state transition or unexpected frame.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No session is currently active.
    #[error("Not connected")]
    NotConnected,

    /// Operation cancelled by `stop()` or shutdown.
    #[error("Cancelled")]
    Cancelled,

    /// None of the candidate addresses produced a session in time.
    #[error("No viable address: {0}")]
    NoViableAddress(String),

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for transport operations
pub type Result<T> = std::result::Result<T, RpcError>;

impl RpcError {
    /// Whether this error ends the connection it occurred on.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            RpcError::Framing(_) | RpcError::NegotiationFailed(_) | RpcError::Io(_)
        )
    }

    /// Fault sent back to a caller whose request failed server-side.
    pub fn to_fault(&self) -> Fault {
        match self {
            RpcError::Fault(fault) => fault.clone(),
            RpcError::Validation(msg) => Fault::new(FaultCode::Validation, msg),
            RpcError::EnumDeserialisation { .. } => {
                Fault::new(FaultCode::EnumDeserialisation, &self.to_string())
            },
            RpcError::UnknownOperation(key) => {
                Fault::new(FaultCode::NoSuchOperation, &format!("No such operation: {key}"))
            },
            RpcError::Marshalling(msg) => Fault::new(FaultCode::Client, msg),
            other => Fault::new(FaultCode::Server, &other.to_string()),
        }
    }
}

impl From<toml::de::Error> for RpcError {
    fn from(err: toml::de::Error) -> Self {
        RpcError::Config(err.to_string())
    }
}

/// Fault classification carried in RESPONSE_FAULT frames.
///
/// Written on the wire by name so that codes added later decode as
/// [`FaultCode::Server`] on older peers instead of failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultCode {
    /// Unexpected server-side failure
    Server,
    /// Request could not be understood
    Client,
    /// No handler for the operation key
    NoSuchOperation,
    /// Mandatory argument missing or mistyped
    Validation,
    /// Unknown enum constant under hard-fail
    EnumDeserialisation,
    /// Failure raised by the operation itself
    Application,
}

impl FaultCode {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Server => "Server",
            Self::Client => "Client",
            Self::NoSuchOperation => "NoSuchOperation",
            Self::Validation => "Validation",
            Self::EnumDeserialisation => "EnumDeserialisation",
            Self::Application => "Application",
        }
    }

    /// Parse a wire name, unknown names fall back to `Server`.
    pub fn from_name(name: &str) -> Self {
        match name {
            "Client" => Self::Client,
            "NoSuchOperation" => Self::NoSuchOperation,
            "Validation" => Self::Validation,
            "EnumDeserialisation" => Self::EnumDeserialisation,
            "Application" => Self::Application,
            _ => Self::Server,
        }
    }
}

/// Remote fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    /// Classification
    pub code: FaultCode,
    /// Human-readable message
    pub message: String,
    /// Optional detail (e.g. remote stack summary)
    pub detail: Option<String>,
}

impl Fault {
    /// Create a fault without detail.
    pub fn new(code: FaultCode, message: &str) -> Self {
        Self {
            code,
            message: message.to_string(),
            detail: None,
        }
    }

    /// Create an application fault.
    pub fn application(message: &str) -> Self {
        Self::new(FaultCode::Application, message)
    }

    /// Attach detail text.
    pub fn with_detail(mut self, detail: &str) -> Self {
        self.detail = Some(detail.to_string());
        self
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}
