use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};

use crate::{CryptoError, StreamKey};

const SALT_LEN: usize = 16;
const NONCE_PREFIX_LEN: usize = 19;
const TAG_LEN: usize = 16;
/// Flag byte plus big-endian ciphertext length.
const FRAME_HEADER_LEN: usize = 5;
/// Upper bound on a single frame's ciphertext.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Length of the stream header: salt followed by the nonce prefix.
pub const HEADER_LEN: usize = SALT_LEN + NONCE_PREFIX_LEN;

fn cipher_for(key: &StreamKey, salt: &[u8]) -> Result<XChaCha20Poly1305, CryptoError> {
    let derived = key.derive(salt)?;
    Ok(XChaCha20Poly1305::new(&Key::from(derived)))
}

fn frame_nonce(prefix: &[u8; NONCE_PREFIX_LEN], counter: u32, last: bool) -> XNonce {
    let mut nonce = [0u8; 24];
    nonce[..NONCE_PREFIX_LEN].copy_from_slice(prefix);
    nonce[NONCE_PREFIX_LEN..NONCE_PREFIX_LEN + 4].copy_from_slice(&counter.to_be_bytes());
    nonce[23] = u8::from(last);
    XNonce::from(nonce)
}

// ---------------------------------------------------------------------------
// StreamEncryptor
// ---------------------------------------------------------------------------

/// Encrypting half of a stream.
///
/// Each [`encode`](Self::encode) call seals one frame; the first call also
/// emits the header. Passing an empty slice seals the final frame, after
/// which the encryptor refuses further input.
pub struct StreamEncryptor {
    cipher: XChaCha20Poly1305,
    salt: [u8; SALT_LEN],
    prefix: [u8; NONCE_PREFIX_LEN],
    counter: u32,
    header_sent: bool,
    finished: bool,
}

impl StreamEncryptor {
    pub fn new(key: &StreamKey) -> Result<Self, CryptoError> {
        let salt: [u8; SALT_LEN] = rand::random();
        let prefix: [u8; NONCE_PREFIX_LEN] = rand::random();
        Ok(Self {
            cipher: cipher_for(key, &salt)?,
            salt,
            prefix,
            counter: 0,
            header_sent: false,
            finished: false,
        })
    }

    pub fn encode(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if self.finished {
            return Err(CryptoError::Finished);
        }
        let last = plaintext.is_empty();
        let nonce = frame_nonce(&self.prefix, self.counter, last);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CryptoError::Auth)?;

        let mut out = Vec::with_capacity(HEADER_LEN + FRAME_HEADER_LEN + ciphertext.len());
        if !self.header_sent {
            out.extend_from_slice(&self.salt);
            out.extend_from_slice(&self.prefix);
            self.header_sent = true;
        }
        out.push(u8::from(last));
        out.extend_from_slice(&(ciphertext.len() as u32).to_be_bytes());
        out.extend_from_slice(&ciphertext);

        if last {
            self.finished = true;
        } else {
            self.counter = self
                .counter
                .checked_add(1)
                .ok_or(CryptoError::CounterExhausted)?;
        }
        Ok(out)
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Bytes [`encode`](Self::encode) adds around a plaintext of `len`
    /// bytes, not counting the one-off header.
    pub fn overhead() -> usize {
        FRAME_HEADER_LEN + TAG_LEN
    }
}

// ---------------------------------------------------------------------------
// StreamDecryptor
// ---------------------------------------------------------------------------

/// Decrypting half of a stream.
///
/// Input may be split at arbitrary byte boundaries; bytes are buffered
/// until the header and then each whole frame is available. A failed
/// frame poisons the decryptor and discards whatever the failing call had
/// already opened.
pub struct StreamDecryptor {
    key: StreamKey,
    cipher: Option<XChaCha20Poly1305>,
    prefix: [u8; NONCE_PREFIX_LEN],
    buf: Vec<u8>,
    counter: u32,
    finished: bool,
    poisoned: bool,
}

impl StreamDecryptor {
    pub fn new(key: &StreamKey) -> Self {
        Self {
            key: key.clone(),
            cipher: None,
            prefix: [0u8; NONCE_PREFIX_LEN],
            buf: Vec::new(),
            counter: 0,
            finished: false,
            poisoned: false,
        }
    }

    pub fn decode(&mut self, input: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if self.poisoned {
            return Err(CryptoError::Auth);
        }
        if self.finished {
            if input.is_empty() {
                return Ok(Vec::new());
            }
            return Err(CryptoError::Finished);
        }
        self.buf.extend_from_slice(input);

        match self.decode_buffered() {
            Ok(out) => Ok(out),
            Err(e) => {
                self.poisoned = true;
                self.buf.clear();
                Err(e)
            }
        }
    }

    /// Succeeds only if the final frame has been opened.
    pub fn finish(&self) -> Result<(), CryptoError> {
        if self.poisoned {
            return Err(CryptoError::Auth);
        }
        if !self.finished {
            return Err(CryptoError::Truncated);
        }
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn decode_buffered(&mut self) -> Result<Vec<u8>, CryptoError> {
        if self.cipher.is_none() {
            if self.buf.len() < HEADER_LEN {
                return Ok(Vec::new());
            }
            let (salt, rest) = self.buf[..HEADER_LEN].split_at(SALT_LEN);
            self.prefix.copy_from_slice(rest);
            self.cipher = Some(cipher_for(&self.key, salt)?);
            self.buf.drain(..HEADER_LEN);
        }
        let Some(cipher) = self.cipher.as_ref() else {
            return Ok(Vec::new());
        };

        let mut out = Vec::new();
        let mut consumed = 0;
        loop {
            let pending = &self.buf[consumed..];
            if pending.len() < FRAME_HEADER_LEN {
                break;
            }
            let last = match pending[0] {
                0 => false,
                1 => true,
                other => return Err(CryptoError::Malformed(format!("bad frame flag {other}"))),
            };
            let len = u32::from_be_bytes([pending[1], pending[2], pending[3], pending[4]]) as usize;
            if !(TAG_LEN..=MAX_FRAME_LEN).contains(&len) {
                return Err(CryptoError::Malformed(format!("bad frame length {len}")));
            }
            if pending.len() < FRAME_HEADER_LEN + len {
                break;
            }

            let nonce = frame_nonce(&self.prefix, self.counter, last);
            let plaintext = cipher
                .decrypt(&nonce, &pending[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len])
                .map_err(|_| CryptoError::Auth)?;
            consumed += FRAME_HEADER_LEN + len;

            if last {
                if !plaintext.is_empty() {
                    return Err(CryptoError::Malformed("final frame carries data".into()));
                }
                if consumed != self.buf.len() {
                    return Err(CryptoError::Malformed("data after final frame".into()));
                }
                self.finished = true;
                break;
            }
            out.extend_from_slice(&plaintext);
            self.counter = self
                .counter
                .checked_add(1)
                .ok_or(CryptoError::CounterExhausted)?;
        }
        self.buf.drain(..consumed);
        Ok(out)
    }
}
