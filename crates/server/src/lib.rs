//! Block transfer server.
//!
//! Accepts TCP connections, sniffs TLS vs. plaintext, serves the HTTP
//! `/login` endpoint through an axum router and upgrades `/upload`, `/download` and `/control`
//! to WebSocket sessions speaking the binary block protocol.

pub mod auth;
pub mod config;
mod connection;
mod detect;
pub mod executor;
mod http;
mod rate;
pub mod registry;
mod server;
mod session;
pub mod tls;

pub use auth::{Authenticator, hash_password};
pub use config::{ServerConfig, TlsSettings, UserEntry};
pub use connection::{Connection, ConnectionError, Sender};
pub use detect::Transport;
pub use rate::RateLimiter;
pub use registry::{RegisteredChannel, SessionRegistry};
pub use server::FileServer;
pub use session::{ErrorClass, SessionError};

/// Errors produced by the server outside of an established session.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("invalid config: {0}")]
    Config(String),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("TLS connection received but TLS is not configured")]
    TlsNotConfigured,

    #[error("server already running")]
    AlreadyRunning,
}
