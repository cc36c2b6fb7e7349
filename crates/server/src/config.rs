//! Server configuration.
//!
//! Read from a JSON file with camelCase keys; every field has a default
//! so a partial (or empty) file is valid.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use blockwire_protocol::constants::{
    DEFAULT_BLOCK_SIZE, HANDSHAKE_TIMEOUT, KEEPALIVE_INTERVAL, KEEPALIVE_TIMEOUT, MAX_BLOCK_SIZE,
    MIN_BLOCK_SIZE,
};

use crate::ServerError;

/// TLS material. When both paths are missing on disk and `selfSigned` is
/// set, a certificate is generated and written there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsSettings {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    #[serde(default)]
    pub self_signed: bool,
}

/// A user allowed to log in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserEntry {
    pub username: String,
    /// Lowercase hex SHA-256 of the password.
    pub password_sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Directory every channel path is resolved against.
    pub root: PathBuf,
    pub block_size: u32,
    pub worker_threads: usize,
    /// Inbound bytes per second per connection, 0 = unlimited.
    pub read_rate_limit: u64,
    /// Outbound bytes per second per connection, 0 = unlimited.
    pub write_rate_limit: u64,
    /// Period of the keepalives the server sends on every channel,
    /// 0 = never.
    pub keepalive_interval_secs: u64,
    pub keepalive_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsSettings>,
    pub users: Vec<UserEntry>,
}

fn default_worker_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8443)),
            root: PathBuf::from("."),
            block_size: DEFAULT_BLOCK_SIZE,
            worker_threads: default_worker_threads(),
            read_rate_limit: 0,
            write_rate_limit: 0,
            keepalive_interval_secs: KEEPALIVE_INTERVAL.as_secs(),
            keepalive_timeout_secs: KEEPALIVE_TIMEOUT.as_secs(),
            handshake_timeout_secs: HANDSHAKE_TIMEOUT.as_secs(),
            tls: None,
            users: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Loads and validates a config file.
    pub fn load(path: &Path) -> Result<Self, ServerError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "server configuration loaded");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        if self.keepalive_timeout_secs == 0 {
            return Err(ServerError::Config("keepaliveTimeoutSecs must be > 0".into()));
        }
        if self.keepalive_timeout_secs < self.keepalive_interval_secs {
            return Err(ServerError::Config(
                "keepaliveTimeoutSecs must not be shorter than keepaliveIntervalSecs".into(),
            ));
        }
        if self.worker_threads == 0 {
            return Err(ServerError::Config("workerThreads must be > 0".into()));
        }
        for user in &self.users {
            if user.password_sha256.len() != 64
                || !user.password_sha256.chars().all(|c| c.is_ascii_hexdigit())
            {
                return Err(ServerError::Config(format!(
                    "user {} has an invalid passwordSha256",
                    user.username
                )));
            }
        }
        Ok(())
    }

    /// Block size actually offered to peers.
    pub fn effective_block_size(&self) -> u32 {
        self.block_size.clamp(MIN_BLOCK_SIZE, MAX_BLOCK_SIZE)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_secs(self.keepalive_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs.max(1))
    }
}
