//! One logged-in channel to the server.

use std::time::Duration;

use futures_util::stream::BoxStream;
use futures_util::{Sink, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::client_async_with_config;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use blockwire_protocol::constants::{SEND_QUEUE_CAPACITY, WS_MAX_MESSAGE_SIZE};
use blockwire_protocol::{Channel, Message, MessageTag, decode, encode};

use crate::ClientError;
use crate::config::ClientConfig;
use crate::pumps::keepalive::keepalive_pump;
use crate::pumps::write::write_pump;
use crate::tls;

type Frames = BoxStream<'static, Result<tungstenite::Message, tungstenite::Error>>;

/// A channel after `Login` has been acknowledged.
///
/// Writes go through a queue drained by a single write pump; a second
/// pump sends keepalives. Keepalive echoes are consumed by
/// [`recv`](Self::recv) and never reach the caller.
pub struct ClientConnection {
    channel: Channel,
    write_tx: mpsc::Sender<tungstenite::Message>,
    reader: Frames,
    keepalive_timeout: Duration,
    cancel: CancellationToken,
}

impl ClientConnection {
    /// Connects, upgrades to `channel` and logs in with `token`.
    pub async fn open(
        config: &ClientConfig,
        channel: Channel,
        token: &str,
    ) -> Result<Self, ClientError> {
        let mut conn = tokio::time::timeout(config.handshake_timeout, Self::connect(config, channel))
            .await
            .map_err(|_| ClientError::Timeout("connect"))??;

        conn.send(&Message::Login {
            token: token.to_string(),
        })
        .await?;
        match tokio::time::timeout(config.handshake_timeout, conn.reply()).await {
            Err(_) => return Err(ClientError::Timeout("login")),
            Ok(Err(e)) => return Err(e),
            Ok(Ok(Message::Ack {
                acked: MessageTag::Login,
            })) => {}
            Ok(Ok(other)) => {
                return Err(ClientError::Unexpected {
                    expected: "Ack(Login)",
                    got: other.tag(),
                });
            }
        }
        info!(%channel, server = %config.authority(), "channel ready");
        Ok(conn)
    }

    async fn connect(config: &ClientConfig, channel: Channel) -> Result<Self, ClientError> {
        let tcp = TcpStream::connect(config.authority()).await?;
        let _ = tcp.set_nodelay(true);
        let url = config.channel_url(channel);

        if config.tls {
            let connector = TlsConnector::from(std::sync::Arc::new(tls::client_config(config)?));
            let stream = connector
                .connect(tls::server_name(&config.host)?, tcp)
                .await?;
            Self::upgrade(stream, &url, channel, config).await
        } else {
            Self::upgrade(tcp, &url, channel, config).await
        }
    }

    async fn upgrade<S>(
        stream: S,
        url: &str,
        channel: Channel,
        config: &ClientConfig,
    ) -> Result<Self, ClientError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (ws, _) = client_async_with_config(url, stream, Some(ws_config())).await?;
        debug!(%url, "WebSocket established");
        Ok(Self::spawn(ws, channel, config))
    }

    fn spawn<W>(ws: W, channel: Channel, config: &ClientConfig) -> Self
    where
        W: Stream<Item = Result<tungstenite::Message, tungstenite::Error>>
            + Sink<tungstenite::Message, Error = tungstenite::Error>
            + Send
            + 'static,
    {
        let (write, read) = ws.split();
        let (write_tx, write_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let cancel = CancellationToken::new();

        tokio::spawn(write_pump(write, write_rx, cancel.clone()));
        tokio::spawn(keepalive_pump(
            write_tx.clone(),
            config.keepalive_interval,
            cancel.clone(),
        ));

        Self {
            channel,
            write_tx,
            reader: read.boxed(),
            keepalive_timeout: config.keepalive_timeout,
            cancel,
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Queues a message for the write pump.
    pub async fn send(&self, msg: &Message) -> Result<(), ClientError> {
        let frame = encode(msg)?;
        self.write_tx
            .send(tungstenite::Message::Binary(frame))
            .await
            .map_err(|_| ClientError::Closed)
    }

    /// Next protocol message, skipping keepalive echoes.
    pub async fn recv(&mut self) -> Result<Message, ClientError> {
        loop {
            let next = tokio::time::timeout(self.keepalive_timeout, self.reader.next())
                .await
                .map_err(|_| ClientError::Timeout("keepalive"))?;
            let frame = match next {
                None => return Err(ClientError::Closed),
                Some(frame) => frame?,
            };
            match frame {
                tungstenite::Message::Binary(data) => match decode(data)? {
                    Message::Keepalive { .. } => continue,
                    msg => return Ok(msg),
                },
                tungstenite::Message::Ping(payload) => {
                    let _ = self.write_tx.try_send(tungstenite::Message::Pong(payload));
                }
                tungstenite::Message::Close(_) => return Err(ClientError::Closed),
                tungstenite::Message::Text(_) => {
                    return Err(ClientError::Protocol("text frame from server".into()));
                }
                tungstenite::Message::Pong(_) | tungstenite::Message::Frame(_) => {}
            }
        }
    }

    /// Like [`recv`](Self::recv), but turns an `Error` message into
    /// [`ClientError::Server`].
    pub async fn reply(&mut self) -> Result<Message, ClientError> {
        match self.recv().await? {
            Message::Error { code, message } => Err(ClientError::Server { code, message }),
            msg => Ok(msg),
        }
    }

    /// Flushes queued frames, sends a close frame and stops the pumps.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn ws_config() -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
    config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
    config
}
