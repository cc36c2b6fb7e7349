//! Clients for a blockwire server.
//!
//! [`Client::login`] obtains a token over HTTP; each channel is then a
//! separate WebSocket connection authenticated with that token:
//! [`UploadClient`], [`DownloadClient`] and [`ControlClient`].

pub mod config;
pub mod connection;
pub mod control;
pub mod download;
pub mod login;
mod pumps;
pub mod tls;
pub mod upload;

use blockwire_crypt::CryptoError;
use blockwire_protocol::{Channel, CodecError, ErrorCode, MessageTag};
use blockwire_transfer::{EventBus, TransferError};
use tokio_tungstenite::tungstenite;

pub use config::ClientConfig;
pub use connection::ClientConnection;
pub use control::ControlClient;
pub use download::DownloadClient;
pub use upload::{UploadClient, UploadOutcome};

/// Errors from the client side.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("login rejected ({status}): {message}")]
    Login { status: u16, message: String },

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("server error {code:?}: {message}")]
    Server { code: ErrorCode, message: String },

    #[error("expected {expected}, got {got:?}")]
    Unexpected {
        expected: &'static str,
        got: MessageTag,
    },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("connection closed")]
    Closed,

    #[error("invalid config: {0}")]
    Config(String),
}

impl ClientError {
    /// Wire code of a server-reported error, if this is one.
    pub fn server_code(&self) -> Option<ErrorCode> {
        match self {
            Self::Server { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// A logged-in client: the config, its token and the event bus every
/// channel publishes to.
pub struct Client {
    config: ClientConfig,
    token: String,
    events: EventBus,
}

impl Client {
    /// Logs in with the configured credentials.
    pub async fn login(config: ClientConfig, events: EventBus) -> Result<Self, ClientError> {
        let token = login::login(&config).await?;
        Ok(Self {
            config,
            token,
            events,
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Opens and logs in a raw channel.
    pub async fn open(&self, channel: Channel) -> Result<ClientConnection, ClientError> {
        ClientConnection::open(&self.config, channel, &self.token).await
    }

    pub async fn upload_channel(&self) -> Result<UploadClient, ClientError> {
        let conn = self.open(Channel::Upload).await?;
        Ok(UploadClient::new(
            conn,
            self.config.key.clone(),
            self.events.clone(),
        ))
    }

    pub async fn download_channel(&self) -> Result<DownloadClient, ClientError> {
        let conn = self.open(Channel::Download).await?;
        Ok(DownloadClient::new(
            conn,
            self.config.key.clone(),
            self.events.clone(),
        ))
    }

    pub async fn control_channel(&self) -> Result<ControlClient, ClientError> {
        Ok(ControlClient::new(self.open(Channel::Control).await?))
    }
}
