//! End-to-end transport tests.
//!
//! These tests speak the wire protocol directly where the exact frame
//! sequence matters (drain, keep-alive, malformed input) and use the
//! connection factory for failover.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sockrpc::client::{CallOptions, ClientConfig, ConnectionFactory, ConnectionStatus};
use sockrpc::codec::{
    Arguments, ExecutionContext, FieldDescriptor, Frame, FrameCodec, Marshaller, MessageType,
    OperationDefinition, OperationKey, Returned, SchemaRegistry, TypeTag, Value,
};
use sockrpc::protocol::{Handshake, HandshakeReply};
use sockrpc::server::{RequestContext, RpcServer, ServerConfig, ServerHandle};
use sockrpc::transport::{write_frame, FrameReader};
use sockrpc::{ProtocolVersion, RpcError, VersionRange};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

fn work() -> OperationKey {
    OperationKey::new("Test", "1", "work")
}

fn schemas() -> Arc<SchemaRegistry> {
    Arc::new(
        SchemaRegistry::new().with_operation(
            OperationDefinition::new(work())
                .param(FieldDescriptor::mandatory("ms", TypeTag::Int))
                .returns(TypeTag::Str),
        ),
    )
}

async fn start_server(config: ServerConfig) -> ServerHandle {
    let mut server = RpcServer::new(config.with_port(0), schemas()).unwrap();
    server
        .register_operation_handler(work(), |_req: RequestContext, args: Arguments| async move {
            let ms = args.get("ms").and_then(Value::as_int).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms as u64)).await;
            Ok(Returned::value("done"))
        })
        .unwrap();
    server.serve().await.unwrap()
}

/// Find an address nothing is listening on
async fn dead_address() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().to_string()
}

/// A client that speaks frames directly
struct RawClient {
    reader: FrameReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    version: ProtocolVersion,
}

impl RawClient {
    async fn connect(addr: SocketAddr, range: VersionRange) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (r, mut writer) = stream.into_split();
        let mut reader = FrameReader::new(r, FrameCodec::new(range));
        write_frame(&mut writer, &Handshake::new(range, "raw-client").to_frame())
            .await
            .unwrap();
        let ack = reader.next_frame().await.unwrap().unwrap();
        let reply = HandshakeReply::from_frame(&ack).unwrap();
        let (version, _) = reply.negotiated(&range).unwrap();
        reader.set_negotiated(version);
        Self {
            reader,
            writer,
            version,
        }
    }

    async fn request(&mut self, correlation_id: u64, ms: i64) {
        let payload = Marshaller::new(schemas())
            .encode_request(
                self.version,
                &work(),
                &ExecutionContext::new(),
                &Arguments::new().with("ms", ms),
            )
            .unwrap();
        let frame = Frame::new(self.version, MessageType::Request, correlation_id, payload);
        write_frame(&mut self.writer, &frame).await.unwrap();
    }

    /// Every non-heartbeat frame until the server closes the connection.
    async fn frames_until_close(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        loop {
            let next = tokio::time::timeout(Duration::from_secs(10), self.reader.next_frame())
                .await
                .expect("server did not close the connection");
            match next {
                Ok(Some(frame)) if frame.msg_type == MessageType::Heartbeat => {},
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) | Err(_) => return frames,
            }
        }
    }
}

fn types(frames: &[Frame]) -> Vec<MessageType> {
    frames.iter().map(|f| f.msg_type).collect()
}

/// Unhealthy with a drain window: SUSPEND, the response, then DISCONNECT
#[tokio::test]
async fn test_graceful_drain_waits_for_inflight() {
    let config = ServerConfig::default().with_drain_timeout(Duration::from_millis(5000));
    let server = start_server(config).await;
    let mut client = RawClient::connect(server.local_addr(), VersionRange::default()).await;

    client.request(1, 300).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    server.set_healthy(false).await;

    let frames = client.frames_until_close().await;
    assert_eq!(
        types(&frames),
        vec![MessageType::Suspend, MessageType::ResponseOk, MessageType::Disconnect]
    );
    assert_eq!(frames[1].correlation_id, 1);

    server.shutdown().await;
}

/// Unhealthy with no drain window: DISCONNECT only
#[tokio::test]
async fn test_zero_drain_window_disconnects_immediately() {
    let server = start_server(ServerConfig::default().with_drain_timeout(Duration::ZERO)).await;
    let mut client = RawClient::connect(server.local_addr(), VersionRange::default()).await;

    client.request(1, 300).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    server.set_healthy(false).await;

    let frames = client.frames_until_close().await;
    assert_eq!(types(&frames), vec![MessageType::Disconnect]);

    server.shutdown().await;
}

/// Peers below the SUSPEND version are drained with DISCONNECT only
#[tokio::test]
async fn test_drain_of_pre_suspend_peer() {
    let server = start_server(ServerConfig::default()).await;
    let range = VersionRange::new(1, 4).unwrap();
    let mut client = RawClient::connect(server.local_addr(), range).await;
    assert_eq!(client.version, ProtocolVersion::V4);

    server.set_healthy(false).await;
    let frames = client.frames_until_close().await;
    assert_eq!(types(&frames), vec![MessageType::Disconnect]);

    server.shutdown().await;
}

/// Sessions that arrive while unhealthy are turned away
#[tokio::test]
async fn test_unhealthy_server_refuses_new_sessions() {
    let server = start_server(ServerConfig::default()).await;
    server.set_healthy(false).await;
    assert!(!server.is_healthy());

    let mut client = RawClient::connect(server.local_addr(), VersionRange::default()).await;
    let frames = client.frames_until_close().await;
    assert_eq!(types(&frames), vec![MessageType::Disconnect]);

    server.set_healthy(true).await;
    let mut client = RawClient::connect(server.local_addr(), VersionRange::default()).await;
    client.request(9, 0).await;
    let response = client.reader.next_frame().await.unwrap().unwrap();
    assert_eq!(response.msg_type, MessageType::ResponseOk);

    server.shutdown().await;
}

/// Through the factory: in-flight work completes, new calls fail fast, then
/// the client sees the connection drop
#[tokio::test]
async fn test_client_observes_drain() {
    let server = start_server(ServerConfig::default()).await;
    let config = ClientConfig::default()
        .with_addresses(&server.local_addr().to_string())
        .with_reconnect_interval(Duration::from_secs(30));
    let client = ConnectionFactory::new(config, schemas()).unwrap();
    client.start().wait().await.unwrap();

    let inflight = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .call(&work(), &Arguments::new().with("ms", 300), CallOptions::new())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    server.set_healthy(false).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let refused = client
        .call(&work(), &Arguments::new().with("ms", 0), CallOptions::new())
        .await;
    assert!(matches!(refused, Err(RpcError::CommunicationFailure(_))), "{refused:?}");

    let done = inflight.await.unwrap().unwrap();
    assert_eq!(done.value.as_str(), Some("done"));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while client.is_connected() {
        assert!(tokio::time::Instant::now() < deadline, "client still connected");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    client.stop().await.unwrap();
    server.shutdown().await;
}

/// Dead addresses are skipped; losing the active server fails over to the
/// next healthy one
#[tokio::test]
async fn test_failover_across_address_list() {
    let bad1 = dead_address().await;
    let bad2 = dead_address().await;
    let first = start_server(ServerConfig::default()).await;
    let second = start_server(ServerConfig::default()).await;
    let first_addr = first.local_addr().to_string();
    let second_addr = second.local_addr().to_string();

    let unhealthy = Arc::new(Mutex::new(HashSet::from([second_addr.clone()])));
    let probe = {
        let unhealthy = unhealthy.clone();
        move |addr: &str| !unhealthy.lock().unwrap().contains(addr)
    };

    let config = ClientConfig::default()
        .with_addresses(&format!("{bad1},{bad2},{first_addr},{second_addr}"))
        .with_reconnect_interval(Duration::from_millis(100))
        .with_start_timeout(Duration::from_secs(5));
    let client = ConnectionFactory::new(config, schemas())
        .unwrap()
        .with_health(probe)
        .unwrap();
    client.start().wait().await.unwrap();

    assert_eq!(client.active_address(), Some(first_addr.clone()));
    let statuses: Vec<ConnectionStatus> =
        client.connected_status().iter().map(|s| s.status).collect();
    assert_eq!(
        statuses,
        vec![
            ConnectionStatus::Failed,
            ConnectionStatus::Failed,
            ConnectionStatus::Connected,
            ConnectionStatus::Disconnected,
        ]
    );
    assert_eq!(first.session_count().await, 1);
    assert_eq!(second.session_count().await, 0);

    unhealthy.lock().unwrap().clear();
    first.shutdown().await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while client.active_address().as_deref() != Some(second_addr.as_str()) {
        assert!(tokio::time::Instant::now() < deadline, "no failover to {second_addr}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let returned = client
        .call(&work(), &Arguments::new().with("ms", 0), CallOptions::new())
        .await
        .unwrap();
    assert_eq!(returned.value.as_str(), Some("done"));
    assert_eq!(second.session_count().await, 1);

    client.stop().await.unwrap();
    second.shutdown().await;
}

/// A silent peer gets heartbeats, then is dropped at the keep-alive timeout
#[tokio::test]
async fn test_keepalive_drops_silent_peer() {
    let config = ServerConfig::default()
        .with_keep_alive(Duration::from_millis(50), Duration::from_millis(300));
    let server = start_server(config).await;
    let mut client = RawClient::connect(server.local_addr(), VersionRange::default()).await;

    let mut heartbeats = 0;
    loop {
        let next = tokio::time::timeout(Duration::from_secs(5), client.reader.next_frame())
            .await
            .unwrap();
        match next {
            Ok(Some(frame)) => {
                assert_eq!(frame.msg_type, MessageType::Heartbeat);
                heartbeats += 1;
            },
            Ok(None) | Err(_) => break,
        }
    }
    assert!(heartbeats >= 1);

    server.shutdown().await;
}

/// An unknown message type is fatal for that connection only
#[tokio::test]
async fn test_framing_error_closes_connection() {
    let server = start_server(ServerConfig::default()).await;
    let mut bad = RawClient::connect(server.local_addr(), VersionRange::default()).await;
    let mut good = RawClient::connect(server.local_addr(), VersionRange::default()).await;

    let mut header = vec![bad.version.as_u8(), 0x7f];
    header.extend_from_slice(&0u64.to_be_bytes());
    header.extend_from_slice(&0u32.to_be_bytes());
    bad.writer.write_all(&header).await.unwrap();

    assert!(bad.frames_until_close().await.is_empty());

    good.request(5, 0).await;
    let response = good.reader.next_frame().await.unwrap().unwrap();
    assert_eq!(response.msg_type, MessageType::ResponseOk);
    assert_eq!(response.correlation_id, 5);

    server.shutdown().await;
}
