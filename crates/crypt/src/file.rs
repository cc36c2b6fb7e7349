use std::path::Path;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tracing::debug;

use crate::{CryptoError, StreamDecryptor, StreamEncryptor, StreamKey};

const OPEN_READ_SIZE: usize = 64 * 1024;

/// Encrypts `src` into `dst`, one frame per `block_size` bytes of plaintext.
///
/// Returns the size of the sealed file.
pub async fn seal_file(
    src: &Path,
    dst: &Path,
    key: &StreamKey,
    block_size: usize,
) -> Result<u64, CryptoError> {
    let block_size = block_size.max(1);
    let mut input = File::open(src).await?;
    let mut output = BufWriter::new(File::create(dst).await?);
    let mut enc = StreamEncryptor::new(key)?;
    let mut buf = vec![0u8; block_size];
    let mut sealed = 0u64;

    loop {
        let n = read_full(&mut input, &mut buf).await?;
        if n == 0 {
            break;
        }
        let frame = enc.encode(&buf[..n])?;
        output.write_all(&frame).await?;
        sealed += frame.len() as u64;
    }
    let last = enc.encode(&[])?;
    output.write_all(&last).await?;
    sealed += last.len() as u64;

    output.flush().await?;
    output.get_ref().sync_all().await?;
    debug!(src = %src.display(), dst = %dst.display(), sealed, "sealed file");
    Ok(sealed)
}

/// Decrypts `src` into `dst`.
///
/// On any failure `dst` is removed, so a tampered or truncated stream never
/// leaves plaintext behind. Returns the size of the opened file.
pub async fn open_file(src: &Path, dst: &Path, key: &StreamKey) -> Result<u64, CryptoError> {
    match open_into(src, dst, key).await {
        Ok(n) => Ok(n),
        Err(e) => {
            let _ = tokio::fs::remove_file(dst).await;
            Err(e)
        }
    }
}

async fn open_into(src: &Path, dst: &Path, key: &StreamKey) -> Result<u64, CryptoError> {
    let mut input = File::open(src).await?;
    let mut output = BufWriter::new(File::create(dst).await?);
    let mut dec = StreamDecryptor::new(key);
    let mut buf = vec![0u8; OPEN_READ_SIZE];
    let mut opened = 0u64;

    loop {
        let n = input.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let plain = dec.decode(&buf[..n])?;
        output.write_all(&plain).await?;
        opened += plain.len() as u64;
    }
    dec.finish()?;

    output.flush().await?;
    output.get_ref().sync_all().await?;
    debug!(src = %src.display(), dst = %dst.display(), opened, "opened file");
    Ok(opened)
}

/// Fills `buf` unless EOF comes first; returns the bytes read.
async fn read_full(file: &mut File, buf: &mut [u8]) -> Result<usize, std::io::Error> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
