fn main() {
    println!("Run `cargo test -p e2e` to execute the end-to-end scenarios.");
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::time::Duration;

    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    use blockwire_client::{Client, ClientConfig, ClientConnection, ClientError, DownloadClient, UploadOutcome};
    use blockwire_crypt::StreamKey;
    use blockwire_protocol::{Channel, ErrorCode, Message, MessageTag, decode, encode};
    use blockwire_server::{FileServer, ServerConfig, TlsSettings, UserEntry, hash_password};
    use blockwire_transfer::{BlockLayout, EventBus, FileTransferContext, TransferError, TransferEvent};

    const KIB: usize = 1024;

    fn server_config(root: &Path) -> ServerConfig {
        ServerConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
            root: root.to_path_buf(),
            users: vec![UserEntry {
                username: "alice".into(),
                password_sha256: hash_password("secret"),
            }],
            ..ServerConfig::default()
        }
    }

    fn client_config(addr: SocketAddr) -> ClientConfig {
        ClientConfig {
            host: "127.0.0.1".into(),
            port: addr.port(),
            username: "alice".into(),
            password: "secret".into(),
            ..ClientConfig::default()
        }
    }

    async fn start(config: &ServerConfig) -> (Arc<FileServer>, SocketAddr) {
        let server = FileServer::new(config, EventBus::new()).unwrap();
        let runner = Arc::clone(&server);
        tokio::spawn(async move { runner.run().await });
        for _ in 0..200 {
            if let Some(addr) = server.local_addr().await {
                return (server, addr);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("server did not bind");
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    fn write_local(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    // -----------------------------------------------------------------------
    // Scenario A: 300 KiB upload at the default 128 KiB block size
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn scenario_a_upload_in_three_blocks() {
        let root = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        let (server, addr) = start(&server_config(root.path())).await;
        let mut server_events = server.events().subscribe();

        let content = pattern(300 * KIB);
        let src = write_local(local.path(), "big.bin", &content);

        let client = Client::login(client_config(addr), EventBus::new()).await.unwrap();
        let mut upload = client.upload_channel().await.unwrap();
        let outcome = upload.upload(&src, "big.bin").await.unwrap();
        assert!(matches!(outcome, UploadOutcome::Uploaded { bytes, .. } if bytes == content.len() as u64));

        assert_eq!(std::fs::read(root.path().join("big.bin")).unwrap(), content);
        assert!(!root.path().join("big.bin.tmp").exists());

        let mut block_count = None;
        let mut progress = Vec::new();
        while let Ok(event) = server_events.try_recv() {
            match event {
                TransferEvent::Started { block_count: n, .. } => block_count = Some(n),
                TransferEvent::Progress { bytes_done, .. } => progress.push(bytes_done),
                _ => {}
            }
        }
        assert_eq!(block_count, Some(3));
        assert_eq!(
            progress,
            vec![128 * KIB as u64, 256 * KIB as u64, 300 * KIB as u64]
        );
        server.shutdown();
    }

    // -----------------------------------------------------------------------
    // Scenario B: re-upload of identical content
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn scenario_b_identical_reupload_is_skipped() {
        let root = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        let (server, addr) = start(&server_config(root.path())).await;

        let content = pattern(50 * KIB);
        let src = write_local(local.path(), "doc.bin", &content);

        let client = Client::login(client_config(addr), EventBus::new()).await.unwrap();
        let mut upload = client.upload_channel().await.unwrap();
        assert!(matches!(
            upload.upload(&src, "doc.bin").await.unwrap(),
            UploadOutcome::Uploaded { .. }
        ));

        let mut server_events = server.events().subscribe();
        let mut client_events = client.events().subscribe();
        assert_eq!(
            upload.upload(&src, "doc.bin").await.unwrap(),
            UploadOutcome::AlreadyExists
        );

        let mut started = false;
        while let Ok(event) = server_events.try_recv() {
            if matches!(event, TransferEvent::Started { .. }) {
                started = true;
            }
        }
        assert!(!started, "no transfer context may be created");
        assert!(matches!(
            client_events.try_recv().unwrap(),
            TransferEvent::Skipped { .. }
        ));
        assert!(!root.path().join("doc.bin.tmp").exists());

        // Different content under the same name is uploaded again.
        let changed = write_local(local.path(), "doc2.bin", &pattern(10 * KIB));
        assert!(matches!(
            upload.upload(&changed, "doc.bin").await.unwrap(),
            UploadOutcome::Uploaded { .. }
        ));
        assert_eq!(
            std::fs::read(root.path().join("doc.bin")).unwrap(),
            pattern(10 * KIB)
        );
        server.shutdown();
    }

    // -----------------------------------------------------------------------
    // Scenario C: corrupt checkpoint during download
    // -----------------------------------------------------------------------

    #[derive(Debug, Default)]
    struct MockReport {
        error: Option<ErrorCode>,
        saw_finish: bool,
        requested: Vec<u64>,
    }

    /// A download peer that serves honest blocks except for a bad
    /// checkpoint hash on `bad_index`.
    async fn corrupting_server(
        listener: TcpListener,
        content: Vec<u8>,
        block_size: u32,
        bad_index: u64,
    ) -> MockReport {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let layout = BlockLayout::new(content.len() as u64, block_size).unwrap();
        let mut ctx = FileTransferContext::new(1, "remote.bin", PathBuf::new(), layout);
        let mut report = MockReport::default();

        while let Some(Ok(frame)) = ws.next().await {
            let data = match frame {
                WsMessage::Binary(data) => data,
                WsMessage::Close(_) => break,
                _ => continue,
            };
            let reply = match decode(data).unwrap() {
                Message::Login { .. } => Some(Message::Ack {
                    acked: MessageTag::Login,
                }),
                Message::Keepalive { timestamp_ms } => Some(Message::Keepalive { timestamp_ms }),
                Message::DownloadFileRequest { filename } => Some(Message::DownloadFileResponse {
                    id: 1,
                    file_size: layout.file_size(),
                    block_size,
                    filename,
                }),
                Message::BlockDataRequest { id, index } => {
                    report.requested.push(index);
                    let start = layout.block_offset(index) as usize;
                    let len = layout.block_len(index).unwrap();
                    let block = &content[start..start + len];
                    let mut hash = ctx.seal_block(index, block).unwrap();
                    if index == bad_index {
                        hash = "0".repeat(64);
                    }
                    Some(Message::BlockDataResponse {
                        id,
                        index,
                        hash,
                        data: bytes::Bytes::copy_from_slice(block),
                    })
                }
                Message::Error { code, .. } => {
                    report.error = Some(code);
                    None
                }
                Message::BlockDataFinish { .. } => {
                    report.saw_finish = true;
                    None
                }
                other => panic!("mock got unexpected {other:?}"),
            };
            if let Some(reply) = reply {
                ws.send(WsMessage::Binary(encode(&reply).unwrap())).await.unwrap();
            }
        }
        report
    }

    #[tokio::test]
    async fn scenario_c_corrupt_checkpoint_aborts_download() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let block_size = 4 * KIB as u32;
        let content = pattern(12 * 4 * KIB);
        let mock = tokio::spawn(corrupting_server(listener, content, block_size, 9));

        let local = tempfile::tempdir().unwrap();
        let dest = local.path().join("partial.bin");
        let conn = ClientConnection::open(&client_config(addr), Channel::Download, "token")
            .await
            .unwrap();
        let mut download = DownloadClient::new(conn, None, EventBus::new());

        let err = download.download("remote.bin", &dest).await.unwrap_err();
        assert!(
            matches!(
                err,
                ClientError::Transfer(TransferError::IntegrityMismatch { index: 9, .. })
            ),
            "unexpected error: {err}"
        );
        drop(download);

        let report = tokio::time::timeout(Duration::from_secs(5), mock)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.error, Some(ErrorCode::IntegrityMismatch));
        assert!(!report.saw_finish, "no BlockDataFinish after a bad checkpoint");
        assert_eq!(report.requested, (0..10).collect::<Vec<_>>());

        // Blocks before the bad window were written and stay on disk.
        let partial = std::fs::read(&dest).unwrap();
        assert_eq!(partial.len(), 9 * 4 * KIB);
    }

    // -----------------------------------------------------------------------
    // Download through the real server
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn download_roundtrip() {
        let root = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        let content = pattern(700 * KIB + 3);
        std::fs::create_dir_all(root.path().join("media")).unwrap();
        std::fs::write(root.path().join("media/clip.bin"), &content).unwrap();
        let (server, addr) = start(&server_config(root.path())).await;

        let client = Client::login(client_config(addr), EventBus::new()).await.unwrap();
        let mut download = client.download_channel().await.unwrap();
        let dest = local.path().join("clip.bin");
        assert_eq!(
            download.download("/media/clip.bin", &dest).await.unwrap(),
            content.len() as u64
        );
        assert_eq!(std::fs::read(&dest).unwrap(), content);

        let err = download
            .download("/media/missing.bin", &local.path().join("x"))
            .await
            .unwrap_err();
        assert_eq!(err.server_code(), Some(ErrorCode::NotFound));

        // The channel survives the failed request.
        let again = local.path().join("again.bin");
        download.download("media/clip.bin", &again).await.unwrap();
        assert_eq!(std::fs::read(&again).unwrap(), content);
        server.shutdown();
    }

    // -----------------------------------------------------------------------
    // Encryption at rest
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn sealed_upload_opens_on_download() {
        let root = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        let (server, addr) = start(&server_config(root.path())).await;

        let content = pattern(333 * KIB);
        let src = write_local(local.path(), "plain.bin", &content);
        let config = ClientConfig {
            key: Some(StreamKey::from_passphrase("correct horse")),
            ..client_config(addr)
        };

        let client = Client::login(config, EventBus::new()).await.unwrap();
        let mut upload = client.upload_channel().await.unwrap();
        upload.upload(&src, "vault/plain.bin").await.unwrap();

        let stored = std::fs::read(root.path().join("vault/plain.bin")).unwrap();
        assert_ne!(stored, content);
        assert!(stored.len() > content.len());

        let mut download = client.download_channel().await.unwrap();
        let dest = local.path().join("opened.bin");
        download.download("vault/plain.bin", &dest).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), content);

        // The wrong key fails authentication and leaves no plaintext.
        let wrong = ClientConfig {
            key: Some(StreamKey::from_passphrase("wrong")),
            ..client_config(addr)
        };
        let other = Client::login(wrong, EventBus::new()).await.unwrap();
        let mut download = other.download_channel().await.unwrap();
        let bad = local.path().join("bad.bin");
        assert!(matches!(
            download.download("vault/plain.bin", &bad).await,
            Err(ClientError::Crypto(_))
        ));
        assert!(!bad.exists());
        server.shutdown();
    }

    // -----------------------------------------------------------------------
    // Control channel
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn control_channel_flow() {
        let root = tempfile::tempdir().unwrap();
        let (server, addr) = start(&server_config(root.path())).await;
        std::fs::write(root.path().join("notes.txt"), b"hello").unwrap();

        let client = Client::login(client_config(addr), EventBus::new()).await.unwrap();
        let mut control = client.control_channel().await.unwrap();

        control.mkdir("archive/2024").await.unwrap();
        control.rename("notes.txt", "archive/2024/notes.txt").await.unwrap();

        let listing = control.list("/archive/2024").await.unwrap();
        assert_eq!(listing.path, "/archive/2024");
        assert_eq!(listing.entries.len(), 1);
        assert_eq!(listing.entries[0].name, "notes.txt");
        assert_eq!(listing.entries[0].size, 5);
        assert!(listing.entries[0].modified.is_some());

        // A non-empty directory cannot be deleted.
        let err = control.delete("archive/2024").await.unwrap_err();
        assert_eq!(err.server_code(), Some(ErrorCode::Io));

        control.delete("archive/2024/notes.txt").await.unwrap();
        control.delete("archive/2024").await.unwrap();
        assert!(control.list("/archive").await.unwrap().entries.is_empty());

        let err = control.list("../../etc").await.unwrap_err();
        assert_eq!(err.server_code(), Some(ErrorCode::SandboxViolation));
        let err = control.delete("ghost.txt").await.unwrap_err();
        assert_eq!(err.server_code(), Some(ErrorCode::NotFound));

        // Still usable after errors.
        assert!(control.list("/").await.is_ok());
        assert_eq!(server.registry().len().await, 1);
        server.shutdown();
    }

    #[tokio::test]
    async fn wrong_password_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let (server, addr) = start(&server_config(root.path())).await;
        let config = ClientConfig {
            password: "guess".into(),
            ..client_config(addr)
        };
        match Client::login(config, EventBus::new()).await {
            Err(ClientError::Login { status, message }) => {
                assert_eq!(status, 401);
                assert_eq!(message, "invalid credentials");
            }
            Err(e) => panic!("unexpected error {e}"),
            Ok(_) => panic!("login should fail"),
        }
        server.shutdown();
    }

    // -----------------------------------------------------------------------
    // TLS on the same port
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn tls_and_plaintext_share_the_port() {
        let root = tempfile::tempdir().unwrap();
        let certs = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        let cert_path = certs.path().join("cert.pem");
        let mut config = server_config(root.path());
        config.tls = Some(TlsSettings {
            cert_path: cert_path.clone(),
            key_path: certs.path().join("key.pem"),
            self_signed: true,
        });
        let (server, addr) = start(&config).await;

        let content = pattern(20 * KIB);
        let src = write_local(local.path(), "t.bin", &content);

        let tls_config = ClientConfig {
            tls: true,
            ca_cert: Some(cert_path),
            ..client_config(addr)
        };
        let client = Client::login(tls_config, EventBus::new()).await.unwrap();
        let mut upload = client.upload_channel().await.unwrap();
        upload.upload(&src, "t.bin").await.unwrap();
        assert_eq!(std::fs::read(root.path().join("t.bin")).unwrap(), content);

        let insecure = ClientConfig {
            tls: true,
            insecure: true,
            ..client_config(addr)
        };
        let client = Client::login(insecure, EventBus::new()).await.unwrap();
        let mut control = client.control_channel().await.unwrap();
        assert_eq!(control.list("/").await.unwrap().entries.len(), 1);

        let plain = Client::login(client_config(addr), EventBus::new()).await.unwrap();
        let mut control = plain.control_channel().await.unwrap();
        assert_eq!(control.list("/").await.unwrap().entries[0].name, "t.bin");
        server.shutdown();
    }

    #[tokio::test]
    async fn idle_channel_stays_open_with_keepalives() {
        let root = tempfile::tempdir().unwrap();
        let mut config = server_config(root.path());
        config.keepalive_interval_secs = 1;
        config.keepalive_timeout_secs = 2;
        let (server, addr) = start(&config).await;

        let client_cfg = ClientConfig {
            keepalive_interval: Duration::from_millis(300),
            keepalive_timeout: Duration::from_secs(2),
            ..client_config(addr)
        };
        let client = Client::login(client_cfg, EventBus::new()).await.unwrap();
        let mut control = client.control_channel().await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(control.list("/").await.is_ok());
        server.shutdown();
    }
}
