//! Frame-level reading and writing over a byte stream.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;

use crate::codec::{encode_frame, Frame, FrameCodec, MessageType};
use crate::error::{Result, RpcError};
use crate::protocol::{OutboundQueue, ProtocolVersion, Session};

/// Reads whole frames from the read half of a connection.
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
    codec: FrameCodec,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap a reader.
    pub fn new(inner: R, codec: FrameCodec) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(8 * 1024),
            codec,
        }
    }

    /// Pin the negotiated version for all later frames.
    pub fn set_negotiated(&mut self, version: ProtocolVersion) {
        self.codec.set_negotiated(version);
    }

    /// Next frame, or `None` on a clean end of stream.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.buf)? {
                return Ok(Some(frame));
            }
            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(RpcError::Framing(format!(
                    "connection closed with {} bytes of a partial frame",
                    self.buf.len()
                )));
            }
        }
    }
}

/// Write one frame directly, used before the writer task exists.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    let mut buf = BytesMut::with_capacity(frame.encoded_len());
    encode_frame(frame, &mut buf)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Spawn the task that drains a session's outbound queue onto the socket.
///
/// Queued frames are always written before the task reacts to the session
/// closing, so a final DISCONNECT reaches the peer. The socket is shut down
/// when the task ends.
pub fn spawn_writer<W>(
    session: Arc<Session>,
    mut writer: W,
    mut queue: OutboundQueue,
) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let closed = session.closed();
        tokio::pin!(closed);
        let mut buf = BytesMut::with_capacity(8 * 1024);

        loop {
            tokio::select! {
                biased;
                next = queue.recv() => {
                    let Some(frame) = next else { break };
                    let last = frame.msg_type == MessageType::Disconnect;
                    if let Err(e) = write_one(&session, &mut writer, &mut buf, &frame).await {
                        tracing::error!(session = %session.id(), error = %e, "Write failed");
                        session.force_disconnect("write failed");
                        break;
                    }
                    if last {
                        session.force_disconnect("DISCONNECT sent");
                        break;
                    }
                },
                _ = &mut closed => {
                    while let Ok(frame) = queue.try_recv() {
                        if write_one(&session, &mut writer, &mut buf, &frame).await.is_err() {
                            break;
                        }
                    }
                    break;
                },
            }
        }

        let _ = writer.shutdown().await;
    })
}

async fn write_one<W: AsyncWrite + Unpin>(
    session: &Session,
    writer: &mut W,
    buf: &mut BytesMut,
    frame: &Frame,
) -> Result<()> {
    buf.clear();
    encode_frame(frame, buf)?;
    writer.write_all(buf).await?;
    writer.flush().await?;
    session.record_write(buf.len());
    tracing::trace!(
        session = %session.id(),
        msg_type = ?frame.msg_type,
        correlation_id = frame.correlation_id,
        bytes = buf.len(),
        "Frame written"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{SessionRole, SessionState, VersionRange};
    use bytes::Bytes;

    fn codec() -> FrameCodec {
        FrameCodec::new(VersionRange::default())
    }

    #[tokio::test]
    async fn test_reader_splits_frames() {
        let (mut client, server) = tokio::io::duplex(64);
        let a = Frame::new(
            ProtocolVersion::V5,
            MessageType::Request,
            1,
            Bytes::from_static(b"abc"),
        );
        let b = Frame::control(ProtocolVersion::V5, MessageType::Heartbeat);

        tokio::spawn(async move {
            write_frame(&mut client, &a).await.unwrap();
            write_frame(&mut client, &b).await.unwrap();
        });

        let mut reader = FrameReader::new(server, codec());
        assert_eq!(reader.next_frame().await.unwrap().unwrap().correlation_id, 1);
        assert_eq!(
            reader.next_frame().await.unwrap().unwrap().msg_type,
            MessageType::Heartbeat
        );
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reader_reassembles_partial_reads() {
        let frame = Frame::new(
            ProtocolVersion::V5,
            MessageType::ResponseOk,
            9,
            Bytes::from_static(b"payload"),
        );
        let bytes = frame.to_bytes().unwrap();

        let mock = tokio_test::io::Builder::new()
            .read(&bytes[..3])
            .read(&bytes[3..15])
            .read(&bytes[15..])
            .build();
        let mut reader = FrameReader::new(mock, codec());
        let decoded = tokio_test::assert_ok!(reader.next_frame().await).unwrap();
        assert_eq!(decoded, frame);
        assert!(tokio_test::assert_ok!(reader.next_frame().await).is_none());
    }

    #[tokio::test]
    async fn test_reader_rejects_truncated_stream() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(&[5, 3, 0, 0]).await.unwrap();
        drop(client);

        let mut reader = FrameReader::new(server, codec());
        assert!(matches!(reader.next_frame().await, Err(RpcError::Framing(_))));
    }

    #[tokio::test]
    async fn test_writer_flushes_disconnect() {
        let (client, server) = tokio::io::duplex(1024);
        let (session, queue) = Session::new(SessionRole::Server, "127.0.0.1:1".parse().unwrap());
        session.transition(SessionState::Negotiating).unwrap();
        session.set_version(ProtocolVersion::V5).unwrap();
        session.transition(SessionState::Active).unwrap();

        let handle = spawn_writer(session.clone(), client, queue);
        session.send_control(MessageType::Disconnect).unwrap();
        handle.await.unwrap();

        assert_eq!(session.state(), SessionState::Disconnected);
        let mut reader = FrameReader::new(server, codec());
        let frame = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(frame.msg_type, MessageType::Disconnect);
        assert!(reader.next_frame().await.unwrap().is_none());
    }
}
