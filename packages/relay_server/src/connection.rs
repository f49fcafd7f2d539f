//! Per-connection lifecycle: handshake, registration, read loop, teardown.
//!
//! ```text
//! Connecting --handshake ok--> Open --close opcode / EOF / error--> Closing --> Closed
//!     |                                                                 ^
//!     +------------------------- rejected --------------------------------+
//! ```

use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use futures::{sink::SinkExt, stream::StreamExt};
use std::sync::Arc;
use std::io::Cursor;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{BytesCodec, FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use relay_protocol::{FrameDecoder, HandshakeError, UpgradeRequest, UpgradeResponse, find_head_end};

use crate::config::ServerConfig;
use crate::identity::{IdentityResolver, QueryStringIdentity};
use crate::registry::{ConnectionHandle, ConnectionId, Registry};
use crate::router::MessageRouter;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Shared, server-scoped collaborators handed to every connection.
pub struct RelayContext {
    pub registry: Arc<Registry>,
    pub router: MessageRouter,
    pub identity: Arc<dyn IdentityResolver>,
    pub max_request_head_bytes: usize,
    pub send_channel_capacity: usize,
}

impl RelayContext {
    pub fn new(config: &ServerConfig, registry: Arc<Registry>) -> Self {
        Self {
            router: MessageRouter::new(registry.clone()),
            registry,
            identity: Arc::new(QueryStringIdentity::new(config.identity_prefix.clone())),
            max_request_head_bytes: config.max_request_head_bytes,
            send_channel_capacity: config.send_channel_capacity,
        }
    }

    pub fn with_identity(mut self, identity: Arc<dyn IdentityResolver>) -> Self {
        self.identity = identity;
        self
    }
}

struct Lifecycle {
    conn_id: ConnectionId,
    state: ConnectionState,
}

impl Lifecycle {
    fn enter(&mut self, next: ConnectionState) {
        debug!(conn_id = %self.conn_id, from = ?self.state, to = ?next, "connection state");
        self.state = next;
    }
}

/// Registry slot and writer task owned by an open connection.
///
/// `release` tears both down on the normal path. If the serving task panics
/// or is cancelled first, `Drop` aborts the writer and schedules the
/// deregistration instead.
struct Registration {
    registry: Arc<Registry>,
    user_id: String,
    conn_id: ConnectionId,
    writer: JoinHandle<()>,
    armed: bool,
}

impl Registration {
    async fn release(mut self) {
        self.registry
            .remove_connection(&self.user_id, self.conn_id)
            .await;
        self.armed = false;
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.writer.abort();
        if !self.armed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                user_id = %self.user_id,
                conn_id = %self.conn_id,
                "no runtime to deregister on"
            );
            return;
        };
        let registry = self.registry.clone();
        let user_id = std::mem::take(&mut self.user_id);
        let conn_id = self.conn_id;
        debug!(%user_id, %conn_id, "deregistering abandoned connection");
        runtime.spawn(async move {
            registry.remove_connection(&user_id, conn_id).await;
        });
    }
}

/// Read the upgrade request head into `buf`.
///
/// Bytes following the head stay in `buf`; a client may send its first
/// frame in the same segment as the request.
pub async fn read_request_head<R>(
    reader: &mut R,
    buf: &mut BytesMut,
    limit: usize,
) -> Result<UpgradeRequest, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(end) = find_head_end(buf) {
            if end > limit {
                return Err(HandshakeError::HeadTooLarge { limit });
            }
            let head = buf.split_to(end);
            return UpgradeRequest::parse(&head);
        }
        if buf.len() >= limit {
            return Err(HandshakeError::HeadTooLarge { limit });
        }
        let n = reader
            .read_buf(buf)
            .await
            .map_err(|e| HandshakeError::Io(e.to_string()))?;
        if n == 0 {
            return Err(HandshakeError::Incomplete);
        }
    }
}

/// Serve one peer over `stream` until it closes.
///
/// Errors are the connection's own; the caller logs them and carries on.
pub async fn serve_connection<S>(stream: S, ctx: Arc<RelayContext>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut lifecycle = Lifecycle {
        conn_id: ctx.registry.next_connection_id(),
        state: ConnectionState::Connecting,
    };
    let conn_id = lifecycle.conn_id;
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut buf = BytesMut::with_capacity(1024);

    let request = match read_request_head(&mut reader, &mut buf, ctx.max_request_head_bytes).await
    {
        Ok(request) => request,
        Err(e @ (HandshakeError::Incomplete | HandshakeError::Io(_))) => {
            debug!(%conn_id, error = %e, "peer left during handshake");
            lifecycle.enter(ConnectionState::Closed);
            return Ok(());
        }
        Err(e) => return reject(&mut writer, &mut lifecycle, e).await,
    };

    let key = match request.key() {
        Ok(key) => key.to_string(),
        Err(e) => return reject(&mut writer, &mut lifecycle, e).await,
    };

    let user_id = ctx.identity.resolve(&request);
    writer
        .write_all(&UpgradeResponse::accept(&key).to_bytes())
        .await
        .context("failed to write handshake response")?;

    let (handle, outbound) =
        ConnectionHandle::channel(conn_id, &user_id, ctx.send_channel_capacity);
    let registration = Registration {
        registry: ctx.registry.clone(),
        user_id: user_id.clone(),
        conn_id,
        writer: tokio::spawn(write_loop(writer, outbound, conn_id)),
        armed: true,
    };

    if let Some(displaced) = ctx.registry.insert(handle.clone()).await {
        warn!(
            %user_id,
            %conn_id,
            displaced = %displaced.conn_id(),
            "user id already connected, replacing registry entry"
        );
    }
    lifecycle.enter(ConnectionState::Open);
    info!(%user_id, %conn_id, target = %request.target, "connection open");

    // Frames pipelined behind the request head are decoded before the socket.
    let pipelined = Cursor::new(buf.freeze());
    let mut frames = FramedRead::new(pipelined.chain(reader), FrameDecoder::server());

    let result = read_loop(&mut frames, &handle, &ctx.router).await;

    lifecycle.enter(ConnectionState::Closing);
    registration.release().await;
    lifecycle.enter(ConnectionState::Closed);

    match &result {
        Ok(()) => info!(%user_id, %conn_id, "connection closed"),
        Err(e) => warn!(%user_id, %conn_id, error = %e, "connection closed with error"),
    }
    result
}

async fn read_loop<R>(
    frames: &mut FramedRead<R, FrameDecoder>,
    handle: &ConnectionHandle,
    router: &MessageRouter,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    while let Some(next) = frames.next().await {
        let frame = next.context("failed to decode frame")?;

        if frame.is_close() {
            debug!(user_id = %handle.user_id(), "close opcode received");
            return Ok(());
        }
        if !frame.fin {
            debug!(user_id = %handle.user_id(), opcode = ?frame.opcode, "fragmented frame ignored");
            continue;
        }

        let outcome = router
            .route(handle, &frame)
            .await
            .context("failed to route message")?;
        debug!(user_id = %handle.user_id(), ?outcome, "frame routed");
    }
    Ok(())
}

async fn write_loop<W>(writer: W, mut outbound: mpsc::Receiver<Bytes>, conn_id: ConnectionId)
where
    W: AsyncWrite + Unpin,
{
    let mut sink = FramedWrite::new(writer, BytesCodec::new());
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = sink.send(frame).await {
            debug!(%conn_id, error = %e, "write failed, stopping writer");
            return;
        }
    }
    let _ = SinkExt::<Bytes>::close(&mut sink).await;
}

async fn reject<W>(writer: &mut W, lifecycle: &mut Lifecycle, error: HandshakeError) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    warn!(conn_id = %lifecycle.conn_id, error = %error, "rejecting upgrade request");
    lifecycle.enter(ConnectionState::Closing);
    // Best effort: the peer may already be gone.
    let _ = writer
        .write_all(&UpgradeResponse::BadRequest.to_bytes())
        .await;
    let _ = writer.shutdown().await;
    lifecycle.enter(ConnectionState::Closed);
    Err(error.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_protocol::{Frame, Opcode, encode_frame};
    use std::time::Duration;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
    use tokio_util::codec::Decoder;

    const KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
    const MASK: [u8; 4] = [0xa1, 0xb2, 0xc3, 0xd4];

    fn context() -> Arc<RelayContext> {
        Arc::new(RelayContext::new(
            &ServerConfig::default(),
            Arc::new(Registry::new()),
        ))
    }

    fn upgrade_head(target: &str) -> String {
        format!(
            "GET {target} HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\n\
             Connection: Upgrade\r\nSec-WebSocket-Key: {KEY}\r\n\r\n"
        )
    }

    fn masked(payload: &str) -> Bytes {
        encode_frame(Opcode::Text, payload.as_bytes(), Some(MASK)).unwrap()
    }

    struct TestPeer {
        reader: ReadHalf<DuplexStream>,
        writer: WriteHalf<DuplexStream>,
        buf: BytesMut,
        decoder: FrameDecoder,
        task: JoinHandle<Result<()>>,
    }

    impl TestPeer {
        /// Connect and complete the handshake, returning the response head.
        async fn connect(ctx: &Arc<RelayContext>, target: &str) -> (Self, String) {
            let (client, server) = tokio::io::duplex(64 * 1024);
            let task = tokio::spawn(serve_connection(server, ctx.clone()));
            let (reader, mut writer) = tokio::io::split(client);
            writer
                .write_all(upgrade_head(target).as_bytes())
                .await
                .unwrap();
            let mut peer = Self {
                reader,
                writer,
                buf: BytesMut::new(),
                decoder: FrameDecoder::client(),
                task,
            };
            let head = peer.read_head().await;
            (peer, head)
        }

        async fn read_head(&mut self) -> String {
            loop {
                if let Some(end) = find_head_end(&self.buf) {
                    let head = self.buf.split_to(end);
                    return String::from_utf8(head.to_vec()).unwrap();
                }
                let n = self.reader.read_buf(&mut self.buf).await.unwrap();
                assert!(n > 0, "stream closed before response head");
            }
        }

        async fn send(&mut self, bytes: &[u8]) {
            self.writer.write_all(bytes).await.unwrap();
        }

        async fn next_frame(&mut self) -> Frame {
            loop {
                if let Some(frame) = self.decoder.decode(&mut self.buf).unwrap() {
                    return frame;
                }
                let n = self.reader.read_buf(&mut self.buf).await.unwrap();
                assert!(n > 0, "stream closed before a frame arrived");
            }
        }

        async fn next_json(&mut self) -> serde_json::Value {
            let frame = tokio::time::timeout(Duration::from_secs(5), self.next_frame())
                .await
                .expect("frame within timeout");
            serde_json::from_slice(&frame.payload).unwrap()
        }
    }

    struct FixedIdentity(&'static str);

    impl IdentityResolver for FixedIdentity {
        fn resolve(&self, _request: &UpgradeRequest) -> String {
            self.0.to_string()
        }
    }

    async fn wait_until_gone(ctx: &Arc<RelayContext>, user_id: &str) {
        for _ in 0..200 {
            if !ctx.registry.contains(user_id).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("{user_id} still registered");
    }

    async fn wait_for_registration(ctx: &Arc<RelayContext>, user_id: &str) {
        for _ in 0..200 {
            if ctx.registry.contains(user_id).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("{user_id} never registered");
    }

    #[tokio::test]
    async fn handshake_then_login_ack() {
        let ctx = context();
        let (mut peer, head) = TestPeer::connect(&ctx, "/?user=alice").await;
        assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));

        peer.send(&masked(r#"{"type":"login"}"#)).await;
        assert_eq!(
            peer.next_json().await,
            serde_json::json!({ "type": "login", "userId": "alice" })
        );
        assert!(ctx.registry.contains("alice").await);
    }

    #[tokio::test]
    async fn generated_identity_when_no_claim() {
        let ctx = context();
        let (mut peer, _) = TestPeer::connect(&ctx, "/").await;
        peer.send(&masked(r#"{"type":"login"}"#)).await;
        let ack = peer.next_json().await;
        let user_id = ack["userId"].as_str().unwrap();
        assert!(user_id.starts_with("u_"));
        assert_eq!(user_id.len(), 10);
        assert!(ctx.registry.contains(user_id).await);
    }

    #[tokio::test]
    async fn pipelined_frame_after_head() {
        let ctx = context();
        let (client, server) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(serve_connection(server, ctx.clone()));
        let (reader, mut writer) = tokio::io::split(client);

        let mut bytes = upgrade_head("/?user=eager").into_bytes();
        bytes.extend_from_slice(&masked(r#"{"type":"login"}"#));
        writer.write_all(&bytes).await.unwrap();

        let mut peer = TestPeer {
            reader,
            writer,
            buf: BytesMut::new(),
            decoder: FrameDecoder::client(),
            task,
        };
        peer.read_head().await;
        assert_eq!(peer.next_json().await["userId"], "eager");
    }

    #[tokio::test]
    async fn pipelined_login_and_close_are_both_handled() {
        let ctx = context();
        let (client, server) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(serve_connection(server, ctx.clone()));
        let (reader, mut writer) = tokio::io::split(client);

        let mut bytes = upgrade_head("/?user=brief").into_bytes();
        bytes.extend_from_slice(&masked(r#"{"type":"login"}"#));
        bytes.extend_from_slice(&encode_frame(Opcode::Close, b"", Some(MASK)).unwrap());
        writer.write_all(&bytes).await.unwrap();

        let mut peer = TestPeer {
            reader,
            writer,
            buf: BytesMut::new(),
            decoder: FrameDecoder::client(),
            task,
        };
        peer.read_head().await;
        assert_eq!(peer.next_json().await["userId"], "brief");

        tokio::time::timeout(Duration::from_secs(5), peer.task)
            .await
            .expect("connection finished")
            .unwrap()
            .unwrap();
        assert!(!ctx.registry.contains("brief").await);
    }

    #[tokio::test]
    async fn custom_identity_resolver_names_the_connection() {
        let registry = Arc::new(Registry::new());
        let ctx = Arc::new(
            RelayContext::new(&ServerConfig::default(), registry)
                .with_identity(Arc::new(FixedIdentity("resolved"))),
        );
        let (mut peer, _) = TestPeer::connect(&ctx, "/?user=claimed").await;

        peer.send(&masked(r#"{"type":"login"}"#)).await;
        assert_eq!(peer.next_json().await["userId"], "resolved");
        assert!(ctx.registry.contains("resolved").await);
        assert!(!ctx.registry.contains("claimed").await);
    }

    #[tokio::test]
    async fn cancelled_connection_is_deregistered() {
        let ctx = context();
        let (peer, _) = TestPeer::connect(&ctx, "/?user=cancelled").await;
        wait_for_registration(&ctx, "cancelled").await;

        peer.task.abort();
        assert!(peer.task.await.unwrap_err().is_cancelled());
        wait_until_gone(&ctx, "cancelled").await;
    }

    #[tokio::test]
    async fn missing_key_gets_400_and_no_registration() {
        let ctx = context();
        let (mut client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn(serve_connection(server, ctx.clone()));

        client
            .write_all(b"GET /?user=nokey HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();

        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(response.ends_with("\r\n\r\n"));

        let err = task.await.unwrap().unwrap_err();
        assert_eq!(
            err.downcast_ref::<HandshakeError>(),
            Some(&HandshakeError::MissingKey)
        );
        assert!(ctx.registry.is_empty().await);
    }

    #[tokio::test]
    async fn oversized_head_rejected() {
        let config = ServerConfig {
            max_request_head_bytes: 64,
            ..ServerConfig::default()
        };
        let ctx = Arc::new(RelayContext::new(&config, Arc::new(Registry::new())));
        let (mut client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn(serve_connection(server, ctx));

        client.write_all(upgrade_head("/").as_bytes()).await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert!(response.starts_with(b"HTTP/1.1 400"));
        assert!(task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn peer_leaving_mid_handshake_is_not_an_error() {
        let ctx = context();
        let (mut client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn(serve_connection(server, ctx));
        client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
        drop(client);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn close_opcode_deregisters_and_stops_routing() {
        let ctx = context();
        let (bob, mut bob_rx) =
            ConnectionHandle::channel(ctx.registry.next_connection_id(), "bob", 8);
        ctx.registry.insert(bob).await;

        let (mut alice, _) = TestPeer::connect(&ctx, "/?user=alice").await;
        wait_for_registration(&ctx, "alice").await;

        let mut bytes = encode_frame(Opcode::Close, b"", Some(MASK)).unwrap().to_vec();
        bytes.extend_from_slice(&masked(r#"{"type":"chat","data":"too late"}"#));
        alice.send(&bytes).await;

        alice.task.await.unwrap().unwrap();
        assert!(!ctx.registry.contains("alice").await);
        assert!(ctx.registry.contains("bob").await);
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn disconnect_deregisters() {
        let ctx = context();
        let (peer, _) = TestPeer::connect(&ctx, "/?user=gone").await;
        wait_for_registration(&ctx, "gone").await;

        let TestPeer {
            reader,
            writer,
            task,
            ..
        } = peer;
        drop(reader);
        drop(writer);

        task.await.unwrap().unwrap();
        assert!(!ctx.registry.contains("gone").await);
    }

    #[tokio::test]
    async fn oversized_length_closes_connection() {
        let ctx = context();
        let (mut peer, _) = TestPeer::connect(&ctx, "/?user=big").await;
        wait_for_registration(&ctx, "big").await;

        // 127 marker: 64-bit extended length.
        peer.send(&[0x81, 0xFF, 0, 0, 0, 0, 0, 1, 0, 0]).await;
        let err = peer.task.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("failed to decode frame"));
        assert!(!ctx.registry.contains("big").await);
    }

    #[tokio::test]
    async fn displaced_connection_closing_keeps_successor() {
        let ctx = context();
        let (first, _) = TestPeer::connect(&ctx, "/?user=dup").await;
        wait_for_registration(&ctx, "dup").await;
        let first_id = ctx.registry.get("dup").await.unwrap().conn_id();

        let (mut second, _) = TestPeer::connect(&ctx, "/?user=dup").await;
        for _ in 0..200 {
            if ctx.registry.get("dup").await.map(|h| h.conn_id()) != Some(first_id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let TestPeer {
            reader,
            writer,
            task,
            ..
        } = first;
        drop(reader);
        drop(writer);
        task.await.unwrap().unwrap();

        assert!(ctx.registry.contains("dup").await);
        second.send(&masked(r#"{"type":"login"}"#)).await;
        assert_eq!(second.next_json().await["userId"], "dup");
    }

    #[tokio::test]
    async fn fragmented_frames_are_not_routed() {
        let ctx = context();
        let (bob, mut bob_rx) =
            ConnectionHandle::channel(ctx.registry.next_connection_id(), "bob", 8);
        ctx.registry.insert(bob).await;
        let (mut alice, _) = TestPeer::connect(&ctx, "/?user=alice").await;

        // fin bit cleared on an otherwise valid chat frame
        let mut bytes = masked(r#"{"type":"chat","data":"part"}"#).to_vec();
        bytes[0] &= 0x7f;
        alice.send(&bytes).await;
        alice.send(&masked(r#"{"type":"login"}"#)).await;

        assert_eq!(alice.next_json().await["type"], "login");
        assert!(bob_rx.try_recv().is_err());
    }
}
