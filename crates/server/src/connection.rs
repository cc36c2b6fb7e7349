//! One upgraded WebSocket connection: a FIFO write pump, a keepalive
//! pump, sequential reads with a liveness deadline, and per-direction
//! rate limits.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::stream::BoxStream;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use blockwire_protocol::constants::SEND_QUEUE_CAPACITY;
use blockwire_protocol::{CodecError, Message, decode, encode};

use crate::rate::RateLimiter;

/// How long a closing connection may spend flushing queued frames.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("no frame within the keepalive timeout")]
    KeepaliveTimeout,

    #[error("connection closed")]
    Closed,

    #[error("text frames are not part of the protocol")]
    UnexpectedText,
}

/// Per-connection limits.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    /// Period of server-initiated keepalives; zero disables them.
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
    pub read_rate_limit: u64,
    pub write_rate_limit: u64,
}

/// Handle for queueing messages to the peer.
///
/// Cloneable; every clone feeds the same FIFO, drained by a single write
/// pump so frames never interleave.
#[derive(Clone)]
pub struct Sender {
    tx: mpsc::Sender<WsMessage>,
}

impl Sender {
    /// Encodes and queues a message, waiting while the queue is full.
    pub async fn send(&self, msg: &Message) -> Result<(), ConnectionError> {
        let frame = encode(msg)?;
        self.tx
            .send(WsMessage::Binary(frame.into()))
            .await
            .map_err(|_| ConnectionError::Closed)
    }

    /// Returns `true` if the write pump is still accepting frames.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

pub struct Connection {
    id: Uuid,
    peer: SocketAddr,
    sender: Sender,
    reader: BoxStream<'static, Result<WsMessage, WsError>>,
    read_limiter: RateLimiter,
    keepalive_timeout: Duration,
    cancel: CancellationToken,
    closed: Arc<AtomicBool>,
}

impl Connection {
    /// Splits an upgraded stream and starts its write pump.
    ///
    /// `parent` is the server's shutdown token; cancelling it closes this
    /// connection too.
    pub fn spawn<S>(
        ws: S,
        peer: SocketAddr,
        options: ConnectionOptions,
        parent: &CancellationToken,
    ) -> Self
    where
        S: Stream<Item = Result<WsMessage, WsError>>
            + Sink<WsMessage, Error = WsError>
            + Send
            + 'static,
    {
        let (sink, stream) = ws.split();
        let (tx, rx) = mpsc::channel::<WsMessage>(SEND_QUEUE_CAPACITY);
        let cancel = parent.child_token();

        tokio::spawn(write_pump(
            sink,
            rx,
            RateLimiter::new(options.write_rate_limit),
            cancel.clone(),
        ));
        let sender = Sender { tx };
        if !options.keepalive_interval.is_zero() {
            tokio::spawn(keepalive_pump(
                sender.clone(),
                options.keepalive_interval,
                cancel.clone(),
            ));
        }

        Self {
            id: Uuid::new_v4(),
            peer,
            sender,
            reader: stream.boxed(),
            read_limiter: RateLimiter::new(options.read_rate_limit),
            keepalive_timeout: options.keepalive_timeout,
            cancel,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn sender(&self) -> Sender {
        self.sender.clone()
    }

    /// Reads the next protocol message.
    ///
    /// Returns `Ok(None)` once the peer closes or the connection is shut
    /// down. Any frame, including control frames, counts as liveness;
    /// silence longer than the keepalive timeout is an error.
    pub async fn recv(&mut self) -> Result<Option<Message>, ConnectionError> {
        loop {
            let frame = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(None),
                next = tokio::time::timeout(self.keepalive_timeout, self.reader.next()) => {
                    match next {
                        Err(_) => return Err(ConnectionError::KeepaliveTimeout),
                        Ok(None) => return Ok(None),
                        Ok(Some(Err(e))) => return Err(e.into()),
                        Ok(Some(Ok(frame))) => frame,
                    }
                }
            };

            match frame {
                WsMessage::Binary(data) => {
                    self.read_limiter.acquire(data.len()).await;
                    return Ok(Some(decode(data.into())?));
                }
                WsMessage::Ping(payload) => {
                    let _ = self.sender.tx.try_send(WsMessage::Pong(payload));
                }
                WsMessage::Pong(_) | WsMessage::Frame(_) => {}
                WsMessage::Text(_) => return Err(ConnectionError::UnexpectedText),
                WsMessage::Close(_) => {
                    debug!(peer = %self.peer, "received close frame");
                    return Ok(None);
                }
            }
        }
    }

    /// Stops reading, flushes queued frames and closes the socket.
    ///
    /// Idempotent; returns `false` if the connection was already shut down.
    pub fn shutdown(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        info!(peer = %self.peer, id = %self.id, "connection shut down");
        self.cancel.cancel();
        true
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Drains the send queue one frame at a time.
async fn write_pump<S>(
    mut sink: S,
    mut rx: mpsc::Receiver<WsMessage>,
    mut limiter: RateLimiter,
    cancel: CancellationToken,
) where
    S: Sink<WsMessage, Error = WsError> + Send + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            msg = rx.recv() => {
                let Some(frame) = msg else { break };
                limiter.acquire(frame.len()).await;
                if let Err(e) = sink.send(frame).await {
                    error!("write pump send error: {e}");
                    cancel.cancel();
                    return;
                }
            }
        }
    }

    // Frames queued before shutdown (typically a final error) still go out.
    rx.close();
    let drain = async {
        while let Some(frame) = rx.recv().await {
            if sink.send(frame).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    };
    let _ = tokio::time::timeout(DRAIN_TIMEOUT, drain).await;
}

/// Queues a keepalive every `interval` until cancelled.
///
/// Runs beside the session, so the peer keeps hearing from us while a
/// request handler is busy and not reading.
async fn keepalive_pump(sender: Sender, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let frame = match encode(&Message::keepalive_now()) {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!("failed to encode keepalive: {e}");
                        break;
                    }
                };
                match sender.tx.try_send(WsMessage::Binary(frame)) {
                    Ok(()) => {}
                    // A full queue means frames are already flowing.
                    Err(mpsc::error::TrySendError::Full(_)) => {}
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
        }
    }
}
