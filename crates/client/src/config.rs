//! Client configuration.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use blockwire_crypt::StreamKey;
use blockwire_protocol::Channel;
use blockwire_protocol::constants::{
    HANDSHAKE_TIMEOUT, KEEPALIVE_INTERVAL, KEEPALIVE_TIMEOUT, LOGIN_PATH,
};

/// Where and how to reach a server.
#[derive(Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    /// Accept any server certificate.
    pub insecure: bool,
    /// PEM file with the CA (or self-signed certificate) to trust.
    pub ca_cert: Option<PathBuf>,
    pub username: String,
    pub password: String,
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Seals uploads and opens downloads when set.
    pub key: Option<StreamKey>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8443,
            tls: false,
            insecure: false,
            ca_cert: None,
            username: String::new(),
            password: String::new(),
            keepalive_interval: KEEPALIVE_INTERVAL,
            keepalive_timeout: KEEPALIVE_TIMEOUT,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            key: None,
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &self.tls)
            .field("insecure", &self.insecure)
            .field("ca_cert", &self.ca_cert)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("keepalive_interval", &self.keepalive_interval)
            .field("keepalive_timeout", &self.keepalive_timeout)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("encrypted", &self.key.is_some())
            .finish()
    }
}

impl ClientConfig {
    /// `host:port`, bracketing IPv6 literals.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn login_url(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{scheme}://{}{LOGIN_PATH}", self.authority())
    }

    pub fn channel_url(&self, channel: Channel) -> String {
        let scheme = if self.tls { "wss" } else { "ws" };
        format!("{scheme}://{}{}", self.authority(), channel.path())
    }
}
