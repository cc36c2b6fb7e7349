use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::TransferError;

/// Incremental digest used for checkpoint and whole-file hashes.
///
/// The algorithm is opaque to the transfer engine; only the hex output
/// crosses the wire.
pub trait Hasher: Send {
    fn update(&mut self, data: &[u8]);

    /// Finalises the digest and resets the hasher for the next window.
    fn finalize_reset(&mut self) -> Vec<u8>;

    /// Finalises, resets, and returns the digest as lowercase hex.
    fn hex(&mut self) -> String {
        hex::encode(self.finalize_reset())
    }
}

/// SHA-256 implementation of [`Hasher`].
#[derive(Debug, Clone, Default)]
pub struct Sha256Hasher {
    inner: Sha256,
}

impl Sha256Hasher {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Hasher for Sha256Hasher {
    fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    fn finalize_reset(&mut self) -> Vec<u8> {
        self.inner.finalize_reset().to_vec()
    }
}

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256Hasher::new();
    hasher.update(data);
    hasher.hex()
}

/// Computes SHA-256 of an entire file and returns the hex-encoded digest.
pub async fn calculate_file_checksum(path: &Path) -> Result<String, TransferError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256Hasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.hex())
}
