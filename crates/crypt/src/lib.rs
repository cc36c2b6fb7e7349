//! Streaming authenticated encryption for file payloads.
//!
//! A stream is a header followed by length-prefixed XChaCha20-Poly1305
//! frames. The header carries the salt the key is derived from and the
//! nonce prefix; each frame's nonce is that prefix plus a big-endian
//! counter and a last-frame flag, so frames cannot be reordered, dropped,
//! or truncated without detection.

mod file;
mod stream;

use std::fmt;

use hkdf::Hkdf;
use sha2::Sha256;

pub use file::{open_file, seal_file};
pub use stream::{HEADER_LEN, StreamDecryptor, StreamEncryptor};

/// Size of a derived key in bytes.
pub const KEY_SIZE: usize = 32;

const KDF_INFO: &[u8] = b"blockwire-stream-v1";

/// Errors produced by the crypt crate.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("authentication failed")]
    Auth,

    #[error("stream truncated before the final frame")]
    Truncated,

    #[error("stream already finished")]
    Finished,

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("frame counter exhausted")]
    CounterExhausted,

    #[error("key derivation failed")]
    KeyDerivation,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared secret both ends of an encrypted stream hold.
///
/// Per-stream keys are derived from it with HKDF-SHA256 and the salt in
/// the stream header.
#[derive(Clone)]
pub struct StreamKey {
    secret: Vec<u8>,
}

impl StreamKey {
    pub fn from_passphrase(passphrase: &str) -> Self {
        Self {
            secret: passphrase.as_bytes().to_vec(),
        }
    }

    pub fn from_bytes(secret: &[u8]) -> Self {
        Self {
            secret: secret.to_vec(),
        }
    }

    pub(crate) fn derive(&self, salt: &[u8]) -> Result<[u8; KEY_SIZE], CryptoError> {
        let hkdf = Hkdf::<Sha256>::new(Some(salt), &self.secret);
        let mut key = [0u8; KEY_SIZE];
        hkdf.expand(KDF_INFO, &mut key)
            .map_err(|_| CryptoError::KeyDerivation)?;
        Ok(key)
    }
}

impl fmt::Debug for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamKey").finish_non_exhaustive()
    }
}
