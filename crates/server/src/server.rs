//! Listener and per-connection dispatch.
//!
//! One TCP port serves everything: the first bytes decide TLS vs.
//! plaintext, then the HTTP router picks between `/login` and a channel
//! upgrade.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use blockwire_transfer::EventBus;

use crate::ServerError;
use crate::auth::Authenticator;
use crate::config::ServerConfig;
use crate::connection::ConnectionOptions;
use crate::detect::{Transport, detect};
use crate::http::{FrontDoor, serve_http};
use crate::registry::SessionRegistry;
use crate::tls::build_acceptor;

/// State shared by every session of one server.
pub(crate) struct ServerState {
    /// Canonical storage root.
    pub(crate) root: PathBuf,
    pub(crate) block_size: u32,
    pub(crate) auth: Authenticator,
    pub(crate) registry: Arc<SessionRegistry>,
    pub(crate) events: EventBus,
    next_id: AtomicU32,
}

impl ServerState {
    pub(crate) fn new(root: PathBuf, block_size: u32, auth: Authenticator, events: EventBus) -> Self {
        Self {
            root,
            block_size,
            auth,
            registry: Arc::new(SessionRegistry::new()),
            events,
            next_id: AtomicU32::new(1),
        }
    }

    /// Allocates a transfer id, unique for the lifetime of the server.
    pub(crate) fn next_file_id(&self) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }
}

/// The block transfer server.
pub struct FileServer {
    bind: SocketAddr,
    state: Arc<ServerState>,
    options: ConnectionOptions,
    handshake_timeout: Duration,
    tls: Option<TlsAcceptor>,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
    running: AtomicBool,
}

impl FileServer {
    /// Validates `config`, prepares the storage root and loads (or
    /// generates) TLS material.
    pub fn new(config: &ServerConfig, events: EventBus) -> Result<Arc<Self>, ServerError> {
        config.validate()?;
        std::fs::create_dir_all(&config.root)?;
        let root = std::fs::canonicalize(&config.root)?;
        let tls = config.tls.as_ref().map(build_acceptor).transpose()?;

        tracing::info!(
            root = %root.display(),
            block_size = config.effective_block_size(),
            tls = tls.is_some(),
            users = config.users.len(),
            "file server configured"
        );

        Ok(Arc::new(Self {
            bind: config.bind,
            state: Arc::new(ServerState::new(
                root,
                config.effective_block_size(),
                Authenticator::new(&config.users),
                events,
            )),
            options: ConnectionOptions {
                keepalive_interval: config.keepalive_interval(),
                keepalive_timeout: config.keepalive_timeout(),
                read_rate_limit: config.read_rate_limit,
                write_rate_limit: config.write_rate_limit,
            },
            handshake_timeout: config.handshake_timeout(),
            tls,
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
            running: AtomicBool::new(false),
        }))
    }

    /// Returns the local address the server is listening on.
    ///
    /// Only available after [`run`](Self::run) binds the socket.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.state.registry)
    }

    pub fn events(&self) -> &EventBus {
        &self.state.events
    }

    /// Stops accepting and closes every open channel.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs the server until [`shutdown`](Self::shutdown).
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyRunning);
        }
        let listener = TcpListener::bind(self.bind).await?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        tracing::info!("file server listening on {local_addr}");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("server shutting down");
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer).await {
                                    tracing::warn!(%peer, "connection error: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {e}");
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), ServerError> {
        let _ = stream.set_nodelay(true);
        let transport = detect(&stream, self.handshake_timeout).await?;
        tracing::debug!(%peer, %transport, "connection accepted");

        match transport {
            Transport::Plain => self.serve(stream, peer, transport).await,
            Transport::Tls => {
                let Some(acceptor) = &self.tls else {
                    return Err(ServerError::TlsNotConfigured);
                };
                let tls = tokio::time::timeout(self.handshake_timeout, acceptor.accept(stream))
                    .await
                    .map_err(|_| ServerError::HandshakeTimeout)??;
                self.serve(tls, peer, transport).await
            }
        }
    }

    /// Hands the stream to the HTTP front door.
    async fn serve<S>(&self, stream: S, peer: SocketAddr, transport: Transport) -> Result<(), ServerError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let door = FrontDoor {
            state: Arc::clone(&self.state),
            options: self.options,
            cancel: self.cancel.clone(),
            peer,
            transport,
        };
        serve_http(stream, door, self.handshake_timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::hash_password;
    use crate::config::{TlsSettings, UserEntry};
    use blockwire_protocol::{
        Channel, ErrorCode, LoginResponse, Message, MessageTag, UploadFileInfo, decode, encode,
    };
    use blockwire_protocol::constants::PENDING_QUEUE_CAPACITY;
    use blockwire_transfer::{BlockLayout, FileTransferContext, TransferEvent, checksum_bytes};
    use futures_util::{SinkExt, StreamExt};
    use std::path::Path;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

    type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

    const BLOCK: u32 = 4096;

    fn config(root: &Path) -> ServerConfig {
        ServerConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
            root: root.to_path_buf(),
            block_size: BLOCK,
            users: vec![UserEntry {
                username: "alice".into(),
                password_sha256: hash_password("pw"),
            }],
            ..ServerConfig::default()
        }
    }

    async fn start(config: &ServerConfig) -> (Arc<FileServer>, SocketAddr) {
        let server = FileServer::new(config, EventBus::new()).unwrap();
        let runner = Arc::clone(&server);
        tokio::spawn(async move { runner.run().await });
        for _ in 0..100 {
            if let Some(addr) = server.local_addr().await {
                return (server, addr);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("server did not bind");
    }

    async fn http_login(addr: SocketAddr, user: &str, password: &str) -> (u16, String) {
        let body = format!(r#"{{"username":"{user}","password":"{password}"}}"#);
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let req = format!(
            "POST /login HTTP/1.1\r\nHost: test\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(req.as_bytes()).await.unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        let status = out[9..12].parse().unwrap();
        let body = out.split("\r\n\r\n").nth(1).unwrap_or_default().to_string();
        (status, body)
    }

    async fn token(addr: SocketAddr) -> String {
        let (status, body) = http_login(addr, "alice", "pw").await;
        assert_eq!(status, 200);
        serde_json::from_str::<LoginResponse>(&body).unwrap().token
    }

    async fn send(ws: &mut Ws, msg: &Message) {
        ws.send(WsMessage::Binary(encode(msg).unwrap())).await.unwrap();
    }

    /// Next protocol message, keepalives included.
    async fn next_message(ws: &mut Ws) -> Message {
        loop {
            match ws.next().await.unwrap().unwrap() {
                WsMessage::Binary(data) => return decode(data).unwrap(),
                WsMessage::Close(_) => panic!("connection closed"),
                _ => {}
            }
        }
    }

    /// Next protocol message, skipping server keepalives.
    async fn recv(ws: &mut Ws) -> Message {
        loop {
            match next_message(ws).await {
                Message::Keepalive { .. } => {}
                msg => return msg,
            }
        }
    }

    async fn expect_closed(ws: &mut Ws) {
        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match ws.next().await {
                    None | Some(Err(_)) | Some(Ok(WsMessage::Close(_))) => return,
                    Some(Ok(WsMessage::Binary(data))) => match decode(data) {
                        Ok(Message::Keepalive { .. }) => {}
                        other => panic!("frame after protocol error: {other:?}"),
                    },
                    Some(Ok(_)) => {}
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "channel stayed open");
    }

    /// `.tmp` files left anywhere under `dir`.
    fn temp_files(dir: &Path) -> Vec<PathBuf> {
        let mut found = Vec::new();
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                found.extend(temp_files(&path));
            } else if path.extension().is_some_and(|e| e == "tmp") {
                found.push(path);
            }
        }
        found
    }

    async fn channel(addr: SocketAddr, channel: Channel, token: &str) -> Ws {
        let (mut ws, _) = connect_async(format!("ws://{addr}{}", channel.path()))
            .await
            .unwrap();
        send(&mut ws, &Message::Login { token: token.into() }).await;
        assert_eq!(
            recv(&mut ws).await,
            Message::Ack {
                acked: MessageTag::Login
            }
        );
        ws
    }

    fn upload_request(name: &str, content: &[u8]) -> Message {
        Message::UploadFileRequest {
            file_size: content.len() as u64,
            info: UploadFileInfo {
                filename: name.into(),
                hash: checksum_bytes(content),
            },
        }
    }

    /// Drives a complete upload from the client side.
    async fn upload(ws: &mut Ws, name: &str, content: &[u8]) -> Message {
        send(ws, &upload_request(name, content)).await;
        let id = match recv(ws).await {
            Message::UploadFileResponse { id, .. } => id,
            other => return other,
        };
        let layout = confirm_layout(ws, id, content.len()).await;
        serve_blocks(ws, id, name, content, layout).await
    }

    /// Reads `FileBlockRequest` and accepts the offered layout.
    async fn confirm_layout(ws: &mut Ws, id: u32, len: usize) -> BlockLayout {
        let Message::FileBlockRequest {
            block_size,
            block_count,
            ..
        } = recv(ws).await
        else {
            panic!("expected FileBlockRequest");
        };
        send(
            ws,
            &Message::FileBlockResponse {
                id,
                block_size,
                block_count,
            },
        )
        .await;
        BlockLayout::new(len as u64, block_size).unwrap()
    }

    /// Answers block requests until the server sends anything else.
    async fn serve_blocks(
        ws: &mut Ws,
        id: u32,
        name: &str,
        content: &[u8],
        layout: BlockLayout,
    ) -> Message {
        let mut ctx = FileTransferContext::new(id, name, PathBuf::from(name), layout);
        loop {
            match recv(ws).await {
                Message::BlockDataRequest { index, .. } => {
                    send_block(ws, &mut ctx, content, index).await;
                }
                other => return other,
            }
        }
    }

    async fn send_block(ws: &mut Ws, ctx: &mut FileTransferContext, content: &[u8], index: u64) {
        let layout = BlockLayout::new(ctx.file_size(), ctx.block_size()).unwrap();
        let start = layout.block_offset(index) as usize;
        let len = layout.block_len(index).unwrap();
        let data = &content[start..start + len];
        let hash = ctx.seal_block(index, data).unwrap();
        send(
            ws,
            &Message::BlockDataResponse {
                id: ctx.id(),
                index,
                hash,
                data: bytes::Bytes::copy_from_slice(data),
            },
        )
        .await;
    }

    /// Starts an upload and stops once the server asks for block 0.
    async fn begin_upload(ws: &mut Ws, name: &str, content: &[u8]) -> FileTransferContext {
        send(ws, &upload_request(name, content)).await;
        let Message::UploadFileResponse { id, .. } = recv(ws).await else {
            panic!("expected UploadFileResponse");
        };
        let layout = confirm_layout(ws, id, content.len()).await;
        assert_eq!(recv(ws).await, Message::BlockDataRequest { id, index: 0 });
        FileTransferContext::new(id, name, PathBuf::from(name), layout)
    }

    #[tokio::test]
    async fn login_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let (server, addr) = start(&config(dir.path())).await;

        let (status, body) = http_login(addr, "alice", "pw").await;
        assert_eq!(status, 200);
        assert!(body.contains("token"));

        let (status, body) = http_login(addr, "alice", "nope").await;
        assert_eq!(status, 401);
        assert!(body.contains("invalid credentials"));
        server.shutdown();
    }

    #[tokio::test]
    async fn unknown_path_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let (server, addr) = start(&config(dir.path())).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /nope HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert!(out.starts_with("HTTP/1.1 404"));
        server.shutdown();
    }

    #[tokio::test]
    async fn bad_token_closes_channel() {
        let dir = tempfile::tempdir().unwrap();
        let (server, addr) = start(&config(dir.path())).await;
        let (mut ws, _) = connect_async(format!("ws://{addr}/upload")).await.unwrap();
        send(&mut ws, &Message::Login { token: "bogus".into() }).await;
        match recv(&mut ws).await {
            Message::Error { code, .. } => assert_eq!(code, ErrorCode::Unauthorized),
            other => panic!("expected Error, got {other:?}"),
        }
        server.shutdown();
    }

    #[tokio::test]
    async fn request_before_login_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (server, addr) = start(&config(dir.path())).await;
        let (mut ws, _) = connect_async(format!("ws://{addr}/control")).await.unwrap();
        send(&mut ws, &Message::FilesRequest { path: "/".into() }).await;
        match recv(&mut ws).await {
            Message::Error { code, .. } => assert_eq!(code, ErrorCode::Protocol),
            other => panic!("expected Error, got {other:?}"),
        }
        server.shutdown();
    }

    #[tokio::test]
    async fn keepalive_is_echoed() {
        let dir = tempfile::tempdir().unwrap();
        let (server, addr) = start(&config(dir.path())).await;
        let (mut ws, _) = connect_async(format!("ws://{addr}/download")).await.unwrap();
        send(&mut ws, &Message::Keepalive { timestamp_ms: 42 }).await;
        loop {
            match next_message(&mut ws).await {
                Message::Keepalive { timestamp_ms: 42 } => break,
                Message::Keepalive { .. } => {}
                other => panic!("expected Keepalive, got {other:?}"),
            }
        }
        server.shutdown();
    }

    #[tokio::test]
    async fn upload_writes_file_and_skips_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let (server, addr) = start(&config(dir.path())).await;
        let mut events = server.events().subscribe();
        let token = token(addr).await;
        let mut ws = channel(addr, Channel::Upload, &token).await;
        assert_eq!(server.registry().len().await, 1);

        let content: Vec<u8> = (0..(BLOCK as usize * 12 + 100)).map(|i| (i % 251) as u8).collect();
        let reply = upload(&mut ws, "nested/data.bin", &content).await;
        assert!(matches!(reply, Message::Done { .. }));

        let stored = std::fs::read(dir.path().join("nested/data.bin")).unwrap();
        assert_eq!(stored, content);
        assert!(temp_files(dir.path()).is_empty());

        let reply = upload(&mut ws, "nested/data.bin", &content).await;
        assert_eq!(
            reply,
            Message::UploadFileExist {
                filename: "nested/data.bin".into()
            }
        );

        let mut saw_completed = false;
        let mut saw_skipped = false;
        while let Ok(event) = events.try_recv() {
            match event {
                TransferEvent::Completed { file_size, .. } => {
                    assert_eq!(file_size, content.len() as u64);
                    saw_completed = true;
                }
                TransferEvent::Skipped { .. } => saw_skipped = true,
                _ => {}
            }
        }
        assert!(saw_completed && saw_skipped);
        server.shutdown();
    }

    #[tokio::test]
    async fn upload_of_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let (server, addr) = start(&config(dir.path())).await;
        let token = token(addr).await;
        let mut ws = channel(addr, Channel::Upload, &token).await;
        let reply = upload(&mut ws, "empty.txt", b"").await;
        assert!(matches!(reply, Message::Done { .. }));
        assert_eq!(std::fs::read(dir.path().join("empty.txt")).unwrap(), b"");
        server.shutdown();
    }

    #[tokio::test]
    async fn upload_with_wrong_content_hash_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let (server, addr) = start(&config(dir.path())).await;
        let token = token(addr).await;
        let mut ws = channel(addr, Channel::Upload, &token).await;

        send(
            &mut ws,
            &Message::UploadFileRequest {
                file_size: 3,
                info: UploadFileInfo {
                    filename: "x.txt".into(),
                    hash: checksum_bytes(b"xyz"),
                },
            },
        )
        .await;
        let Message::UploadFileResponse { id, .. } = recv(&mut ws).await else {
            panic!("expected UploadFileResponse");
        };
        let _ = recv(&mut ws).await;
        send(
            &mut ws,
            &Message::FileBlockResponse {
                id,
                block_size: BLOCK,
                block_count: 1,
            },
        )
        .await;
        assert_eq!(recv(&mut ws).await, Message::BlockDataRequest { id, index: 0 });
        // Checkpoint hash matches the data sent, content hash does not.
        send(
            &mut ws,
            &Message::BlockDataResponse {
                id,
                index: 0,
                hash: checksum_bytes(b"abc"),
                data: bytes::Bytes::from_static(b"abc"),
            },
        )
        .await;
        match recv(&mut ws).await {
            Message::Error { code, .. } => assert_eq!(code, ErrorCode::IntegrityMismatch),
            other => panic!("expected Error, got {other:?}"),
        }
        assert!(!dir.path().join("x.txt").exists());
        assert!(temp_files(dir.path()).is_empty());

        // The session is still usable.
        let reply = upload(&mut ws, "y.txt", b"fine").await;
        assert!(matches!(reply, Message::Done { .. }));
        server.shutdown();
    }

    #[tokio::test]
    async fn same_name_uploads_on_two_channels_stay_separate() {
        let dir = tempfile::tempdir().unwrap();
        let (server, addr) = start(&config(dir.path())).await;
        let token = token(addr).await;
        let mut wa = channel(addr, Channel::Upload, &token).await;
        let mut wb = channel(addr, Channel::Upload, &token).await;
        let a = vec![b'A'; BLOCK as usize * 2];
        let b = vec![b'B'; BLOCK as usize * 2];

        let mut ctx_a = begin_upload(&mut wa, "x.bin", &a).await;
        let mut ctx_b = begin_upload(&mut wb, "x.bin", &b).await;
        assert_eq!(temp_files(dir.path()).len(), 2);

        send_block(&mut wa, &mut ctx_a, &a, 0).await;
        assert_eq!(
            recv(&mut wa).await,
            Message::BlockDataRequest {
                id: ctx_a.id(),
                index: 1
            }
        );
        send_block(&mut wb, &mut ctx_b, &b, 0).await;
        assert_eq!(
            recv(&mut wb).await,
            Message::BlockDataRequest {
                id: ctx_b.id(),
                index: 1
            }
        );

        send_block(&mut wa, &mut ctx_a, &a, 1).await;
        assert_eq!(recv(&mut wa).await, Message::Done { id: ctx_a.id() });
        assert_eq!(std::fs::read(dir.path().join("x.bin")).unwrap(), a);

        send_block(&mut wb, &mut ctx_b, &b, 1).await;
        assert_eq!(recv(&mut wb).await, Message::Done { id: ctx_b.id() });
        assert_eq!(std::fs::read(dir.path().join("x.bin")).unwrap(), b);
        assert!(temp_files(dir.path()).is_empty());
        server.shutdown();
    }

    #[tokio::test]
    async fn out_of_order_block_is_invalid_and_session_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let (server, addr) = start(&config(dir.path())).await;
        let token = token(addr).await;
        let mut ws = channel(addr, Channel::Upload, &token).await;
        let content = vec![7u8; BLOCK as usize * 3];

        let ctx = begin_upload(&mut ws, "x.bin", &content).await;
        send(
            &mut ws,
            &Message::BlockDataResponse {
                id: ctx.id(),
                index: 1,
                hash: String::new(),
                data: bytes::Bytes::copy_from_slice(&content[BLOCK as usize..BLOCK as usize * 2]),
            },
        )
        .await;
        match recv(&mut ws).await {
            Message::Error { code, .. } => assert_eq!(code, ErrorCode::InvalidBlock),
            other => panic!("expected Error, got {other:?}"),
        }
        assert!(temp_files(dir.path()).is_empty());
        assert!(!dir.path().join("x.bin").exists());

        let reply = upload(&mut ws, "x.bin", &content).await;
        assert!(matches!(reply, Message::Done { .. }));
        assert_eq!(std::fs::read(dir.path().join("x.bin")).unwrap(), content);
        server.shutdown();
    }

    #[tokio::test]
    async fn file_data_during_upload_closes_channel() {
        let dir = tempfile::tempdir().unwrap();
        let (server, addr) = start(&config(dir.path())).await;
        let token = token(addr).await;
        let mut ws = channel(addr, Channel::Upload, &token).await;

        let ctx = begin_upload(&mut ws, "x.bin", &[1u8; 10]).await;
        send(
            &mut ws,
            &Message::FileData {
                id: ctx.id(),
                offset: 0,
                data: bytes::Bytes::from_static(b"0123456789"),
            },
        )
        .await;
        match recv(&mut ws).await {
            Message::Error { code, .. } => assert_eq!(code, ErrorCode::Protocol),
            other => panic!("expected Error, got {other:?}"),
        }
        expect_closed(&mut ws).await;
        assert!(temp_files(dir.path()).is_empty());
        server.shutdown();
    }

    #[tokio::test]
    async fn download_request_on_upload_channel_closes_it() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("get.bin"), b"data").unwrap();
        let (server, addr) = start(&config(dir.path())).await;
        let token = token(addr).await;
        let mut ws = channel(addr, Channel::Upload, &token).await;

        begin_upload(&mut ws, "x.bin", &[1u8; 10]).await;
        send(
            &mut ws,
            &Message::DownloadFileRequest {
                filename: "get.bin".into(),
            },
        )
        .await;
        match recv(&mut ws).await {
            Message::Error { code, message } => {
                assert_eq!(code, ErrorCode::Protocol);
                assert!(message.contains("WaitFileData"));
            }
            other => panic!("expected Error, got {other:?}"),
        }
        expect_closed(&mut ws).await;
        server.shutdown();
    }

    #[tokio::test]
    async fn queued_uploads_start_in_order_after_done() {
        let dir = tempfile::tempdir().unwrap();
        let (server, addr) = start(&config(dir.path())).await;
        let token = token(addr).await;
        let mut ws = channel(addr, Channel::Upload, &token).await;
        let first = vec![3u8; BLOCK as usize + 1];

        let mut ctx = begin_upload(&mut ws, "first.bin", &first).await;
        send(&mut ws, &upload_request("q0.bin", b"zero")).await;
        send(&mut ws, &upload_request("q1.bin", b"one")).await;

        send_block(&mut ws, &mut ctx, &first, 0).await;
        assert_eq!(
            recv(&mut ws).await,
            Message::BlockDataRequest {
                id: ctx.id(),
                index: 1
            }
        );
        send_block(&mut ws, &mut ctx, &first, 1).await;
        assert_eq!(recv(&mut ws).await, Message::Done { id: ctx.id() });

        for (name, content) in [("q0.bin", &b"zero"[..]), ("q1.bin", &b"one"[..])] {
            let Message::UploadFileResponse { id, filename } = recv(&mut ws).await else {
                panic!("expected UploadFileResponse for {name}");
            };
            assert_eq!(filename, name);
            let layout = confirm_layout(&mut ws, id, content.len()).await;
            let reply = serve_blocks(&mut ws, id, name, content, layout).await;
            assert_eq!(reply, Message::Done { id });
            assert_eq!(std::fs::read(dir.path().join(name)).unwrap(), content);
        }
        server.shutdown();
    }

    #[tokio::test]
    async fn full_queue_answers_busy_without_aborting_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let (server, addr) = start(&config(dir.path())).await;
        let token = token(addr).await;
        let mut ws = channel(addr, Channel::Upload, &token).await;
        let content = vec![9u8; BLOCK as usize * 2];

        send(&mut ws, &upload_request("big.bin", &content)).await;
        let Message::UploadFileResponse { id, .. } = recv(&mut ws).await else {
            panic!("expected UploadFileResponse");
        };
        for i in 0..PENDING_QUEUE_CAPACITY {
            send(&mut ws, &upload_request(&format!("q{i}.bin"), b"queued")).await;
        }
        send(&mut ws, &upload_request("overflow.bin", b"queued")).await;

        // Queued requests are silent, so the next replies are the block
        // layout for big.bin and then the overflow refusal.
        let layout = confirm_layout(&mut ws, id, content.len()).await;
        match recv(&mut ws).await {
            Message::Error { code, .. } => assert_eq!(code, ErrorCode::Busy),
            other => panic!("expected Error, got {other:?}"),
        }

        let reply = serve_blocks(&mut ws, id, "big.bin", &content, layout).await;
        assert_eq!(reply, Message::Done { id });
        assert_eq!(std::fs::read(dir.path().join("big.bin")).unwrap(), content);
        let Message::UploadFileResponse { filename, .. } = recv(&mut ws).await else {
            panic!("expected UploadFileResponse");
        };
        assert_eq!(filename, "q0.bin");
        server.shutdown();
    }

    #[tokio::test]
    async fn upload_outside_root_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let (server, addr) = start(&config(dir.path())).await;
        let token = token(addr).await;
        let mut ws = channel(addr, Channel::Upload, &token).await;
        match upload(&mut ws, "../escape.txt", b"x").await {
            Message::Error { code, .. } => assert_eq!(code, ErrorCode::SandboxViolation),
            other => panic!("expected Error, got {other:?}"),
        }
        server.shutdown();
    }

    #[tokio::test]
    async fn download_streams_blocks_on_request() {
        let dir = tempfile::tempdir().unwrap();
        let content: Vec<u8> = (0..(BLOCK as usize * 2 + 17)).map(|i| (i % 13) as u8).collect();
        std::fs::write(dir.path().join("get.bin"), &content).unwrap();
        let (server, addr) = start(&config(dir.path())).await;
        let token = token(addr).await;
        let mut ws = channel(addr, Channel::Download, &token).await;

        send(
            &mut ws,
            &Message::DownloadFileRequest {
                filename: "get.bin".into(),
            },
        )
        .await;
        let Message::DownloadFileResponse {
            id,
            file_size,
            block_size,
            ..
        } = recv(&mut ws).await
        else {
            panic!("expected DownloadFileResponse");
        };
        assert_eq!(file_size, content.len() as u64);
        let layout = BlockLayout::new(file_size, block_size).unwrap();
        let mut ctx = FileTransferContext::new(id, "get.bin", PathBuf::new(), layout);
        let mut received = Vec::new();
        for index in 0..layout.block_count() {
            send(&mut ws, &Message::BlockDataRequest { id, index }).await;
            let Message::BlockDataResponse { hash, data, .. } = recv(&mut ws).await else {
                panic!("expected BlockDataResponse");
            };
            ctx.accept_block(index, &data, &hash).unwrap();
            received.extend_from_slice(&data);
        }
        assert_eq!(received, content);
        assert_eq!(ctx.content_hash(), checksum_bytes(&content));

        send(&mut ws, &Message::BlockDataFinish { id }).await;
        assert_eq!(recv(&mut ws).await, Message::Done { id });
        server.shutdown();
    }

    #[tokio::test]
    async fn download_of_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (server, addr) = start(&config(dir.path())).await;
        let token = token(addr).await;
        let mut ws = channel(addr, Channel::Download, &token).await;
        send(
            &mut ws,
            &Message::DownloadFileRequest {
                filename: "ghost.bin".into(),
            },
        )
        .await;
        match recv(&mut ws).await {
            Message::Error { code, .. } => assert_eq!(code, ErrorCode::NotFound),
            other => panic!("expected Error, got {other:?}"),
        }
        server.shutdown();
    }

    #[tokio::test]
    async fn control_channel_edits_tree() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), b"bee").unwrap();
        let (server, addr) = start(&config(dir.path())).await;
        let token = token(addr).await;
        let mut ws = channel(addr, Channel::Control, &token).await;

        send(&mut ws, &Message::CreateDir { path: "/a/deep".into() }).await;
        assert_eq!(
            recv(&mut ws).await,
            Message::Ack {
                acked: MessageTag::CreateDir
            }
        );

        send(&mut ws, &Message::FilesRequest { path: "/".into() }).await;
        let Message::FilesResponse(listing) = recv(&mut ws).await else {
            panic!("expected FilesResponse");
        };
        assert_eq!(listing.path, "/");
        let names: Vec<_> = listing.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["a", "b.txt"]);
        assert!(listing.entries[0].is_dir);
        assert_eq!(listing.entries[1].size, 3);

        let paths = blockwire_protocol::RenamePaths {
            from: "b.txt".into(),
            to: "a/c.txt".into(),
        };
        send(&mut ws, &Message::RenameRequest(paths.clone())).await;
        assert_eq!(recv(&mut ws).await, Message::RenameResponse(paths));
        assert!(dir.path().join("a/c.txt").exists());

        send(&mut ws, &Message::DeleteFileRequest { path: "a/c.txt".into() }).await;
        assert_eq!(
            recv(&mut ws).await,
            Message::DeleteFileResponse {
                path: "a/c.txt".into()
            }
        );
        assert!(!dir.path().join("a/c.txt").exists());

        send(&mut ws, &Message::FilesRequest { path: "/../..".into() }).await;
        match recv(&mut ws).await {
            Message::Error { code, .. } => assert_eq!(code, ErrorCode::SandboxViolation),
            other => panic!("expected Error, got {other:?}"),
        }
        server.shutdown();
    }

    #[tokio::test]
    async fn tls_handshake_without_tls_config_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let (server, addr) = start(&config(dir.path())).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&[0x16, 0x03, 0x01, 0x00, 0x05]).await.unwrap();
        let mut buf = Vec::new();
        assert_eq!(stream.read_to_end(&mut buf).await.unwrap_or(0), 0);
        server.shutdown();
    }

    #[tokio::test]
    async fn self_signed_tls_is_generated() {
        let dir = tempfile::tempdir().unwrap();
        let certs = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.tls = Some(TlsSettings {
            cert_path: certs.path().join("cert.pem"),
            key_path: certs.path().join("key.pem"),
            self_signed: true,
        });
        let server = FileServer::new(&config, EventBus::new()).unwrap();
        assert!(server.tls.is_some());
        assert!(certs.path().join("cert.pem").exists());
    }

    #[tokio::test]
    async fn run_twice_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (server, _addr) = start(&config(dir.path())).await;
        assert!(matches!(server.run().await, Err(ServerError::AlreadyRunning)));
        server.shutdown();
    }
}
