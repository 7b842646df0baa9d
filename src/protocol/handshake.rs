//! HANDSHAKE / HANDSHAKE_ACK payloads.
//!
//! ```text
//! HANDSHAKE     := min:u8 max:u8 client_id:str
//! HANDSHAKE_ACK := status:u8 version:u8 server_min:u8 server_max:u8 session_id:str
//! ```
//!
//! The header version byte of both frames is the sender's maximum. A
//! rejected ack carries version 0.

use bytes::{BufMut, Bytes, BytesMut};

use super::version::{ProtocolVersion, VersionRange};
use crate::codec::{put_str, Frame, MessageType, WireReader};
use crate::error::{Result, RpcError};

const STATUS_ACCEPTED: u8 = 0;
const STATUS_REJECTED: u8 = 1;

/// Client's opening handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Versions the client can speak
    pub range: VersionRange,
    /// Client identifier, for logging
    pub client_id: String,
}

impl Handshake {
    /// Create a handshake.
    pub fn new(range: VersionRange, client_id: &str) -> Self {
        Self {
            range,
            client_id: client_id.to_string(),
        }
    }

    /// Frame carrying this handshake.
    pub fn to_frame(&self) -> Frame {
        let mut buf = BytesMut::with_capacity(2 + self.client_id.len() + 1);
        buf.put_u8(self.range.min().as_u8());
        buf.put_u8(self.range.max().as_u8());
        put_str(&mut buf, &self.client_id);
        Frame::new(self.range.max(), MessageType::Handshake, 0, buf.freeze())
    }

    /// Parse a HANDSHAKE frame.
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        expect_type(frame, MessageType::Handshake)?;
        let mut r = WireReader::new(&frame.payload);
        let range = VersionRange::from_wire(r.u8()?, r.u8()?)?;
        let client_id = r.string()?;
        Ok(Self { range, client_id })
    }

    /// Server side: answer this handshake given the local range.
    pub fn respond(&self, local: &VersionRange, session_id: &str) -> HandshakeReply {
        match local.negotiate(&self.range) {
            Some(version) => HandshakeReply::Accepted {
                version,
                server_range: *local,
                session_id: session_id.to_string(),
            },
            None => HandshakeReply::Rejected {
                server_range: *local,
            },
        }
    }
}

/// Server's answer to a [`Handshake`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeReply {
    /// A common version exists
    Accepted {
        /// Negotiated version
        version: ProtocolVersion,
        /// Server's supported range
        server_range: VersionRange,
        /// Server-assigned session id
        session_id: String,
    },
    /// The ranges do not overlap
    Rejected {
        /// Server's supported range
        server_range: VersionRange,
    },
}

impl HandshakeReply {
    /// Frame carrying this reply.
    pub fn to_frame(&self) -> Frame {
        let mut buf = BytesMut::with_capacity(16);
        let server_range = match self {
            HandshakeReply::Accepted {
                version,
                server_range,
                session_id,
            } => {
                buf.put_u8(STATUS_ACCEPTED);
                buf.put_u8(version.as_u8());
                buf.put_u8(server_range.min().as_u8());
                buf.put_u8(server_range.max().as_u8());
                put_str(&mut buf, session_id);
                server_range
            },
            HandshakeReply::Rejected { server_range } => {
                buf.put_u8(STATUS_REJECTED);
                buf.put_u8(0);
                buf.put_u8(server_range.min().as_u8());
                buf.put_u8(server_range.max().as_u8());
                put_str(&mut buf, "");
                server_range
            },
        };
        Frame::new(server_range.max(), MessageType::HandshakeAck, 0, Bytes::from(buf))
    }

    /// Parse a HANDSHAKE_ACK frame.
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        expect_type(frame, MessageType::HandshakeAck)?;
        let mut r = WireReader::new(&frame.payload);
        let status = r.u8()?;
        let version = ProtocolVersion::new(r.u8()?);
        let server_range = VersionRange::from_wire(r.u8()?, r.u8()?)?;
        let session_id = r.string()?;
        match status {
            STATUS_ACCEPTED => Ok(HandshakeReply::Accepted {
                version,
                server_range,
                session_id,
            }),
            STATUS_REJECTED => Ok(HandshakeReply::Rejected { server_range }),
            other => Err(RpcError::Framing(format!("unknown handshake status {other}"))),
        }
    }

    /// Client side: the version to use, checked against the local range.
    pub fn negotiated(&self, local: &VersionRange) -> Result<(ProtocolVersion, &str)> {
        match self {
            HandshakeReply::Accepted {
                version,
                session_id,
                ..
            } if local.contains(*version) => Ok((*version, session_id.as_str())),
            HandshakeReply::Accepted {
                version,
                server_range,
                ..
            } => Err(RpcError::NegotiationFailed(format!(
                "server chose {version} (server {server_range}) outside local range {local}"
            ))),
            HandshakeReply::Rejected { server_range } => Err(RpcError::NegotiationFailed(format!(
                "no common version: local {local}, server {server_range}"
            ))),
        }
    }
}

fn expect_type(frame: &Frame, expected: MessageType) -> Result<()> {
    if frame.msg_type == expected {
        Ok(())
    } else {
        Err(RpcError::Protocol(format!(
            "expected {expected:?} during handshake, got {:?}",
            frame.msg_type
        )))
    }
}
