//! Wire frame encoding and decoding.
//!
//! # Wire Format
//!
//! ```text
//! +---------+------+----------------+-------------+-----------------+
//! | version | type | correlation_id | payload_len | payload         |
//! | u8      | u8   | u64 BE         | u32 BE      | payload_len     |
//! +---------+------+----------------+-------------+-----------------+
//! ```
//!
//! HANDSHAKE and HANDSHAKE_ACK are exempt from the version-range check:
//! their header carries the sender's maximum and their payload carries the
//! full range, so a version mismatch surfaces as a negotiation failure
//! rather than a framing error.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, RpcError};
use crate::protocol::{ProtocolVersion, VersionRange};

/// Fixed header size in bytes
pub const HEADER_SIZE: usize = 14;

/// Largest payload accepted from a peer
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

/// Frame message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Client opens negotiation
    Handshake = 0x01,
    /// Server answers negotiation
    HandshakeAck = 0x02,
    /// Operation call
    Request = 0x03,
    /// Successful result
    ResponseOk = 0x04,
    /// Fault result
    ResponseFault = 0x05,
    /// Keep-alive
    Heartbeat = 0x06,
    /// Server is draining, send no new requests
    Suspend = 0x07,
    /// Session is over
    Disconnect = 0x08,
}

impl MessageType {
    /// Decode a type byte, `None` for unknown values.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Handshake),
            0x02 => Some(Self::HandshakeAck),
            0x03 => Some(Self::Request),
            0x04 => Some(Self::ResponseOk),
            0x05 => Some(Self::ResponseFault),
            0x06 => Some(Self::Heartbeat),
            0x07 => Some(Self::Suspend),
            0x08 => Some(Self::Disconnect),
            _ => None,
        }
    }

    /// Type byte.
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Whether frames of this type carry a correlation id.
    pub fn is_correlated(self) -> bool {
        matches!(
            self,
            Self::Request | Self::ResponseOk | Self::ResponseFault
        )
    }

    /// Whether the frame belongs to the version handshake.
    pub fn is_handshake(self) -> bool {
        matches!(self, Self::Handshake | Self::HandshakeAck)
    }

    /// Whether the frame is a response to a request.
    pub fn is_response(self) -> bool {
        matches!(self, Self::ResponseOk | Self::ResponseFault)
    }
}

/// One decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Protocol version byte from the header
    pub version: u8,
    /// Message type
    pub msg_type: MessageType,
    /// Correlation id, zero for uncorrelated types
    pub correlation_id: u64,
    /// Payload bytes
    pub payload: Bytes,
}

impl Frame {
    /// Build a frame.
    pub fn new(
        version: ProtocolVersion,
        msg_type: MessageType,
        correlation_id: u64,
        payload: Bytes,
    ) -> Self {
        let correlation_id = if msg_type.is_correlated() {
            correlation_id
        } else {
            0
        };
        Self {
            version: version.as_u8(),
            msg_type,
            correlation_id,
            payload,
        }
    }

    /// Control frame without payload (HEARTBEAT, SUSPEND, DISCONNECT).
    pub fn control(version: ProtocolVersion, msg_type: MessageType) -> Self {
        Self::new(version, msg_type, 0, Bytes::new())
    }

    /// Total encoded size.
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Encode into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        encode_frame(self, &mut buf)?;
        Ok(buf.freeze())
    }
}

/// Append the wire form of `frame` to `dst`.
pub fn encode_frame(frame: &Frame, dst: &mut BytesMut) -> Result<()> {
    if frame.payload.len() > MAX_PAYLOAD_SIZE {
        return Err(RpcError::Framing(format!(
            "payload of {} bytes exceeds maximum {}",
            frame.payload.len(),
            MAX_PAYLOAD_SIZE
        )));
    }
    dst.reserve(frame.encoded_len());
    dst.put_u8(frame.version);
    dst.put_u8(frame.msg_type.as_byte());
    dst.put_u64(frame.correlation_id);
    dst.put_u32(frame.payload.len() as u32);
    dst.extend_from_slice(&frame.payload);
    Ok(())
}

/// Stateful frame decoder for one connection.
///
/// Holds the locally supported range and, once the handshake completes,
/// the negotiated version every subsequent frame must carry.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    supported: VersionRange,
    negotiated: Option<ProtocolVersion>,
}

impl FrameCodec {
    /// Create a codec for the given supported range.
    pub fn new(supported: VersionRange) -> Self {
        Self {
            supported,
            negotiated: None,
        }
    }

    /// Pin the negotiated version.
    pub fn set_negotiated(&mut self, version: ProtocolVersion) {
        self.negotiated = Some(version);
    }

    /// Negotiated version, if the handshake has completed.
    pub fn negotiated(&self) -> Option<ProtocolVersion> {
        self.negotiated
    }

    /// Encode a frame.
    pub fn encode(&self, frame: &Frame, dst: &mut BytesMut) -> Result<()> {
        encode_frame(frame, dst)
    }

    /// Decode one frame from the front of `src`.
    ///
    /// Returns `Ok(None)` when more bytes are needed, `Err` when the bytes
    /// can never form a valid frame. The header is validated as soon as it
    /// is complete, before the payload has arrived.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let version = src[0];
        let msg_type = MessageType::from_byte(src[1])
            .ok_or_else(|| RpcError::Framing(format!("unknown message type 0x{:02x}", src[1])))?;
        let payload_len =
            u32::from_be_bytes([src[10], src[11], src[12], src[13]]) as usize;

        self.check_version(version, msg_type)?;

        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(RpcError::Framing(format!(
                "payload of {payload_len} bytes exceeds maximum {MAX_PAYLOAD_SIZE}"
            )));
        }

        let total = HEADER_SIZE + payload_len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut frame_bytes = src.split_to(total);
        frame_bytes.advance(2);
        let correlation_id = frame_bytes.get_u64();
        frame_bytes.advance(4);

        Ok(Some(Frame {
            version,
            msg_type,
            correlation_id,
            payload: frame_bytes.freeze(),
        }))
    }

    fn check_version(&self, raw: u8, msg_type: MessageType) -> Result<()> {
        if msg_type.is_handshake() {
            return Ok(());
        }
        let version = ProtocolVersion::new(raw);
        if !self.supported.contains(version) {
            return Err(RpcError::Framing(format!(
                "{msg_type:?} frame version {version} outside supported range {}",
                self.supported
            )));
        }
        if let Some(negotiated) = self.negotiated {
            if version != negotiated {
                return Err(RpcError::Framing(format!(
                    "{msg_type:?} frame version {version} differs from negotiated {negotiated}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> FrameCodec {
        FrameCodec::new(VersionRange::new(1, 5).unwrap())
    }

    #[test]
    fn test_request_frame_roundtrip() {
        let frame = Frame::new(
            ProtocolVersion::V3,
            MessageType::Request,
            42,
            Bytes::from_static(b"payload"),
        );
        let mut buf = BytesMut::from(&frame.to_bytes().unwrap()[..]);
        assert_eq!(buf.len(), HEADER_SIZE + 7);

        let decoded = codec().decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_control_frames_have_zero_correlation() {
        let frame = Frame::new(ProtocolVersion::V5, MessageType::Heartbeat, 99, Bytes::new());
        assert_eq!(frame.correlation_id, 0);
    }

    #[test]
    fn test_partial_reads_need_more_bytes() {
        let frame = Frame::new(
            ProtocolVersion::V2,
            MessageType::ResponseOk,
            7,
            Bytes::from_static(b"0123456789"),
        );
        let wire = frame.to_bytes().unwrap();
        let mut codec = codec();

        let mut buf = BytesMut::new();
        for (i, byte) in wire.iter().enumerate() {
            buf.put_u8(*byte);
            let decoded = codec.decode(&mut buf).unwrap();
            if i + 1 < wire.len() {
                assert!(decoded.is_none(), "decoded early at byte {i}");
            } else {
                assert_eq!(decoded.unwrap(), frame);
            }
        }
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let a = Frame::control(ProtocolVersion::V5, MessageType::Suspend);
        let b = Frame::control(ProtocolVersion::V5, MessageType::Disconnect);
        let mut buf = BytesMut::new();
        encode_frame(&a, &mut buf).unwrap();
        encode_frame(&b, &mut buf).unwrap();

        let mut codec = codec();
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), a);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), b);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_unknown_type_is_malformed() {
        let mut buf = BytesMut::from(&[1u8, 0x7F, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0][..]);
        let err = codec().decode(&mut buf).unwrap_err();
        assert!(matches!(err, RpcError::Framing(_)));
    }

    #[test]
    fn test_unsupported_version_is_malformed() {
        let frame = Frame {
            version: 9,
            msg_type: MessageType::Request,
            correlation_id: 1,
            payload: Bytes::new(),
        };
        let mut buf = BytesMut::from(&frame.to_bytes().unwrap()[..]);
        assert!(matches!(codec().decode(&mut buf), Err(RpcError::Framing(_))));
    }

    #[test]
    fn test_handshake_exempt_from_version_check() {
        let frame = Frame {
            version: 9,
            msg_type: MessageType::Handshake,
            correlation_id: 0,
            payload: Bytes::from_static(&[6, 9]),
        };
        let mut buf = BytesMut::from(&frame.to_bytes().unwrap()[..]);
        assert!(codec().decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn test_negotiated_version_enforced() {
        let mut codec = codec();
        codec.set_negotiated(ProtocolVersion::V4);

        let frame = Frame::control(ProtocolVersion::V3, MessageType::Heartbeat);
        let mut buf = BytesMut::from(&frame.to_bytes().unwrap()[..]);
        assert!(codec.decode(&mut buf).is_err());

        let frame = Frame::control(ProtocolVersion::V4, MessageType::Heartbeat);
        let mut buf = BytesMut::from(&frame.to_bytes().unwrap()[..]);
        assert!(codec.decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn test_oversized_payload_rejected_from_header() {
        let mut buf = BytesMut::new();
        buf.put_u8(1);
        buf.put_u8(MessageType::Request.as_byte());
        buf.put_u64(1);
        buf.put_u32(u32::MAX);
        assert!(matches!(codec().decode(&mut buf), Err(RpcError::Framing(_))));
    }
}
