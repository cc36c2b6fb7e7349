//! TLS vs. plaintext sniffing on a freshly accepted socket.

use std::fmt;
use std::time::Duration;

use tokio::net::TcpStream;

use crate::ServerError;

/// TLS record type of a handshake message.
const TLS_HANDSHAKE: u8 = 0x16;
/// Major version byte shared by SSL 3.0 and every TLS version.
const TLS_MAJOR_VERSION: u8 = 0x03;

/// How a connection speaks on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tls,
    Plain,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tls => "tls",
            Self::Plain => "plain",
        })
    }
}

/// Classifies the first bytes a client sent.
///
/// A TLS ClientHello starts with a handshake record (`0x16 0x03 ..`);
/// HTTP starts with an ASCII method, so one byte is usually enough.
pub fn classify(prefix: &[u8]) -> Option<Transport> {
    match prefix {
        [] => None,
        [TLS_HANDSHAKE] => Some(Transport::Tls),
        [TLS_HANDSHAKE, TLS_MAJOR_VERSION, ..] => Some(Transport::Tls),
        _ => Some(Transport::Plain),
    }
}

/// Peeks at the socket without consuming anything and classifies it.
pub async fn detect(stream: &TcpStream, timeout: Duration) -> Result<Transport, ServerError> {
    let mut buf = [0u8; 3];
    let n = tokio::time::timeout(timeout, stream.peek(&mut buf))
        .await
        .map_err(|_| ServerError::HandshakeTimeout)??;
    classify(&buf[..n]).ok_or_else(|| {
        ServerError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed before first byte",
        ))
    })
}
