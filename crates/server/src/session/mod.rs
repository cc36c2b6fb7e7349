//! Per-channel session state machines.
//!
//! Every channel starts in `WaitLogin`: only `Login` and `Keepalive` are
//! accepted until a valid token arrives. After that the channel-specific
//! session takes over. Errors are sorted into classes: protocol and
//! transport errors end the connection, everything else only aborts the
//! transfer in flight and the session carries on with the next request.

mod control;
mod download;
mod upload;

use std::fmt;
use std::sync::Arc;

use tracing::{info, warn};

use blockwire_protocol::{Channel, ErrorCode, Message, MessageTag};
use blockwire_transfer::TransferError;

use crate::connection::{Connection, ConnectionError, Sender};
use crate::server::ServerState;

use control::ControlSession;
use download::DownloadSession;
use upload::UploadSession;

/// Failure class, deciding how far an error reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Unexpected or malformed message; closes the connection.
    Protocol,
    /// Corrupt or misordered data; aborts the current transfer.
    Integrity,
    /// Local file failure; aborts the current transfer.
    Io,
    /// Socket closed or timed out; closes the connection.
    Transport,
    /// Path outside the storage root; rejects the request.
    Sandbox,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Protocol => "protocol",
            Self::Integrity => "integrity",
            Self::Io => "io",
            Self::Transport => "transport",
            Self::Sandbox => "sandbox",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("unexpected {got:?} in state {state}")]
    Unexpected { state: &'static str, got: MessageTag },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("invalid login token")]
    Unauthorized,

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("path escapes the storage root: {0}")]
    Sandbox(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("busy: {0} requests already queued")]
    Busy(usize),

    #[error("peer reported {code:?}: {message}")]
    Peer { code: ErrorCode, message: String },
}

impl SessionError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Unexpected { .. } | Self::Protocol(_) | Self::Unauthorized => ErrorClass::Protocol,
            Self::Connection(ConnectionError::Codec(_) | ConnectionError::UnexpectedText) => {
                ErrorClass::Protocol
            }
            Self::Connection(_) => ErrorClass::Transport,
            Self::Io(_) | Self::NotFound(_) | Self::Busy(_) => ErrorClass::Io,
            Self::Transfer(TransferError::Io(_)) => ErrorClass::Io,
            Self::Transfer(TransferError::InvalidPath(_)) | Self::Sandbox(_) => ErrorClass::Sandbox,
            Self::Transfer(_) => ErrorClass::Integrity,
            Self::Peer {
                code: ErrorCode::IntegrityMismatch | ErrorCode::InvalidBlock,
                ..
            } => ErrorClass::Integrity,
            Self::Peer { .. } => ErrorClass::Io,
        }
    }

    /// Code sent to the peer for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Unexpected { .. } | Self::Protocol(_) | Self::Connection(_) => {
                ErrorCode::Protocol
            }
            Self::Unauthorized => ErrorCode::Unauthorized,
            Self::Io(_) | Self::Transfer(TransferError::Io(_)) => ErrorCode::Io,
            Self::Transfer(e) if e.is_integrity() => ErrorCode::IntegrityMismatch,
            Self::Transfer(TransferError::InvalidPath(_)) | Self::Sandbox(_) => {
                ErrorCode::SandboxViolation
            }
            Self::Transfer(_) => ErrorCode::InvalidBlock,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Busy(_) => ErrorCode::Busy,
            Self::Peer { code, .. } => *code,
        }
    }

    /// Whether the error ends the connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self.class(), ErrorClass::Protocol | ErrorClass::Transport)
    }

    fn to_message(&self) -> Message {
        Message::error(self.code(), self.to_string())
    }
}

/// Sends the error message for a non-fatal failure.
pub(crate) async fn notify(sender: &Sender, err: &SessionError) -> Result<(), SessionError> {
    sender.send(&err.to_message()).await?;
    Ok(())
}

/// The channel-specific half of a session.
enum ChannelSession {
    Upload(UploadSession),
    Download(DownloadSession),
    Control(ControlSession),
}

impl ChannelSession {
    fn new(channel: Channel, state: Arc<ServerState>) -> Self {
        match channel {
            Channel::Upload => Self::Upload(UploadSession::new(state)),
            Channel::Download => Self::Download(DownloadSession::new(state)),
            Channel::Control => Self::Control(ControlSession::new(state)),
        }
    }

    fn state_name(&self) -> &'static str {
        match self {
            Self::Upload(s) => s.state_name(),
            Self::Download(s) => s.state_name(),
            Self::Control(_) => "Ready",
        }
    }

    async fn handle(&mut self, msg: Message, sender: &Sender) -> Result<(), SessionError> {
        match self {
            Self::Upload(s) => s.handle(msg, sender).await,
            Self::Download(s) => s.handle(msg, sender).await,
            Self::Control(s) => s.handle(msg, sender).await,
        }
    }

    /// Drops the transfer in flight after a non-fatal error.
    async fn abort(&mut self, err: &SessionError) {
        match self {
            Self::Upload(s) => s.abort(err).await,
            Self::Download(s) => s.abort(err),
            Self::Control(_) => {}
        }
    }

    /// Starts queued requests until one is in flight or the queue is empty.
    async fn drain_pending(&mut self, sender: &Sender) -> Result<(), SessionError> {
        match self {
            Self::Upload(s) => s.drain_pending(sender).await,
            Self::Download(s) => s.drain_pending(sender).await,
            Self::Control(_) => Ok(()),
        }
    }

    /// Releases everything the session owns.
    async fn shutdown(&mut self) {
        match self {
            Self::Upload(s) => s.shutdown().await,
            Self::Download(s) => s.shutdown(),
            Self::Control(_) => {}
        }
    }
}

/// Drives one channel until the peer leaves, the server shuts down, or a
/// fatal error occurs.
pub(crate) async fn run_session(mut conn: Connection, channel: Channel, state: Arc<ServerState>) {
    let sender = conn.sender();
    let peer = conn.peer();
    let mut session = ChannelSession::new(channel, Arc::clone(&state));
    let mut user: Option<String> = None;

    loop {
        let msg = match conn.recv().await {
            Ok(Some(msg)) => msg,
            Ok(None) => break,
            Err(e) => {
                let err = SessionError::from(e);
                warn!(%peer, %channel, class = %err.class(), "connection error: {err}");
                if err.class() == ErrorClass::Protocol {
                    let _ = sender.send(&err.to_message()).await;
                }
                break;
            }
        };

        let result = match msg {
            Message::Keepalive { timestamp_ms } => sender
                .send(&Message::Keepalive { timestamp_ms })
                .await
                .map_err(SessionError::from),
            Message::Login { token } if user.is_none() => {
                match state.auth.validate(&token).await {
                    Some(name) => {
                        state
                            .registry
                            .register(&token, &name, conn.id(), channel)
                            .await;
                        info!(%peer, %channel, user = %name, "channel logged in");
                        user = Some(name);
                        sender
                            .send(&Message::Ack {
                                acked: MessageTag::Login,
                            })
                            .await
                            .map_err(SessionError::from)
                    }
                    None => Err(SessionError::Unauthorized),
                }
            }
            other if user.is_none() => Err(SessionError::Unexpected {
                state: "WaitLogin",
                got: other.tag(),
            }),
            Message::Login { .. } => Err(SessionError::Unexpected {
                state: session.state_name(),
                got: MessageTag::Login,
            }),
            other => session.handle(other, &sender).await,
        };

        if let Err(err) = result {
            if !recover(&mut session, &sender, err, channel).await {
                break;
            }
        }
    }

    session.shutdown().await;
    if user.is_some() {
        state.registry.unregister(conn.id()).await;
    }
    conn.shutdown();
}

/// Applies the error policy. Returns `false` if the connection must close.
async fn recover(
    session: &mut ChannelSession,
    sender: &Sender,
    err: SessionError,
    channel: Channel,
) -> bool {
    if err.is_fatal() {
        warn!(%channel, class = %err.class(), "closing session: {err}");
        if err.class() == ErrorClass::Protocol {
            let _ = sender.send(&err.to_message()).await;
        }
        return false;
    }

    warn!(%channel, class = %err.class(), "request failed: {err}");
    if !matches!(err, SessionError::Busy(_)) {
        session.abort(&err).await;
    }
    if !matches!(err, SessionError::Peer { .. }) && notify(sender, &err).await.is_err() {
        return false;
    }
    match session.drain_pending(sender).await {
        Ok(()) => true,
        Err(e) => {
            warn!(%channel, "closing session: {e}");
            if e.class() == ErrorClass::Protocol {
                let _ = sender.send(&e.to_message()).await;
            }
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_and_transport_are_fatal() {
        assert!(SessionError::Protocol("x".into()).is_fatal());
        assert!(SessionError::Unauthorized.is_fatal());
        assert!(SessionError::Connection(ConnectionError::KeepaliveTimeout).is_fatal());
        assert_eq!(
            SessionError::Connection(ConnectionError::KeepaliveTimeout).class(),
            ErrorClass::Transport
        );
    }

    #[test]
    fn transfer_errors_are_not_fatal() {
        let integrity = SessionError::Transfer(TransferError::IntegrityMismatch {
            index: 9,
            expected: "a".into(),
            actual: "b".into(),
        });
        assert!(!integrity.is_fatal());
        assert_eq!(integrity.class(), ErrorClass::Integrity);
        assert_eq!(integrity.code(), ErrorCode::IntegrityMismatch);

        let order = SessionError::Transfer(TransferError::OutOfOrder {
            expected: 0,
            got: 3,
        });
        assert!(!order.is_fatal());
        assert_eq!(order.code(), ErrorCode::InvalidBlock);

        let io = SessionError::Io(std::io::Error::other("disk"));
        assert_eq!(io.class(), ErrorClass::Io);
        assert_eq!(io.code(), ErrorCode::Io);
    }

    #[test]
    fn sandbox_and_lookup_codes() {
        let sandbox = SessionError::Sandbox("../x".into());
        assert_eq!(sandbox.class(), ErrorClass::Sandbox);
        assert_eq!(sandbox.code(), ErrorCode::SandboxViolation);
        assert_eq!(SessionError::NotFound("x".into()).code(), ErrorCode::NotFound);
        assert_eq!(SessionError::Busy(64).code(), ErrorCode::Busy);
    }

    #[test]
    fn peer_error_keeps_code() {
        let err = SessionError::Peer {
            code: ErrorCode::IntegrityMismatch,
            message: "bad".into(),
        };
        assert_eq!(err.code(), ErrorCode::IntegrityMismatch);
        assert_eq!(err.class(), ErrorClass::Integrity);
    }

    #[test]
    fn error_message_carries_code() {
        let msg = SessionError::NotFound("a.txt".into()).to_message();
        match msg {
            Message::Error { code, message } => {
                assert_eq!(code, ErrorCode::NotFound);
                assert!(message.contains("a.txt"));
            }
            other => panic!("expected Error, got {other:?}"),
        }
    }
}
