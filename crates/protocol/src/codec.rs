//! Binary message codec.
//!
//! Wire format:
//!
//! ```text
//! [8 bytes: reserved, zero][2 bytes BE: tag][body]
//! ```
//!
//! Numeric body fields are fixed-width big-endian integers in declared
//! order. The single variable-length field of each message (string,
//! JSON document or raw bytes) consumes the remainder of the frame; the
//! transport delimits frames, not the codec.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::constants::{
    ErrorCode, HEADER_LEN, MAX_BLOCK_SIZE, MAX_HASH_LEN, MAX_STRUCTURED_PAYLOAD, MessageTag,
    RESERVED_PREFIX_LEN,
};
use crate::messages::Message;

/// Errors produced while encoding or decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("truncated frame: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("unknown message tag {0}")]
    UnknownMessage(u16),

    #[error("payload too large: {len} bytes (max {max})")]
    Oversized { len: usize, max: usize },

    #[error("{0} trailing bytes after fixed-size body")]
    TrailingBytes(usize),

    #[error("invalid UTF-8 in string field")]
    InvalidUtf8,

    #[error("invalid JSON body: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("hash field too long: {0} bytes")]
    HashTooLong(usize),
}

/// Largest accepted body for block-carrying messages.
const MAX_BLOCK_BODY: usize = MAX_BLOCK_SIZE as usize + 4 + 8 + 1 + MAX_HASH_LEN;

/// Encodes a message into a single frame.
pub fn encode(msg: &Message) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + 64);
    buf.put_bytes(0, RESERVED_PREFIX_LEN);
    buf.put_u16(msg.tag().as_u16());

    match msg {
        Message::Error { code, message } => {
            buf.put_u32(code.as_u32());
            buf.put_slice(message.as_bytes());
        }
        Message::Login { token } => buf.put_slice(token.as_bytes()),
        Message::UploadFileRequest { file_size, info } => {
            buf.put_u64(*file_size);
            put_json(&mut buf, info)?;
        }
        Message::UploadFileResponse { id, filename } => {
            buf.put_u32(*id);
            buf.put_slice(filename.as_bytes());
        }
        Message::DeleteFileRequest { path }
        | Message::DeleteFileResponse { path }
        | Message::FilesRequest { path }
        | Message::CreateDir { path } => buf.put_slice(path.as_bytes()),
        Message::DownloadFileRequest { filename } | Message::UploadFileExist { filename } => {
            buf.put_slice(filename.as_bytes())
        }
        Message::DownloadFileResponse {
            id,
            file_size,
            block_size,
            filename,
        } => {
            buf.put_u32(*id);
            buf.put_u64(*file_size);
            buf.put_u32(*block_size);
            buf.put_slice(filename.as_bytes());
        }
        Message::Keepalive { timestamp_ms } => buf.put_u64(*timestamp_ms),
        Message::FilesResponse(listing) => put_json(&mut buf, listing)?,
        Message::FileData { id, offset, data } => {
            buf.reserve(12 + data.len());
            buf.put_u32(*id);
            buf.put_u64(*offset);
            buf.put_slice(data);
        }
        Message::Ack { acked } => buf.put_u16(acked.as_u16()),
        Message::Done { id } | Message::BlockDataFinish { id } => buf.put_u32(*id),
        Message::FileBlockRequest {
            id,
            block_size,
            block_count,
        }
        | Message::FileBlockResponse {
            id,
            block_size,
            block_count,
        } => {
            buf.put_u32(*id);
            buf.put_u32(*block_size);
            buf.put_u64(*block_count);
        }
        Message::BlockDataRequest { id, index } => {
            buf.put_u32(*id);
            buf.put_u64(*index);
        }
        Message::BlockDataResponse {
            id,
            index,
            hash,
            data,
        } => {
            if hash.len() > MAX_HASH_LEN {
                return Err(CodecError::HashTooLong(hash.len()));
            }
            buf.reserve(13 + hash.len() + data.len());
            buf.put_u32(*id);
            buf.put_u64(*index);
            buf.put_u8(hash.len() as u8);
            buf.put_slice(hash.as_bytes());
            buf.put_slice(data);
        }
        Message::RenameRequest(paths) | Message::RenameResponse(paths) => {
            put_json(&mut buf, paths)?
        }
    }

    Ok(buf.freeze())
}

/// Decodes one frame.
///
/// Fails closed: an unrecognised tag yields [`CodecError::UnknownMessage`]
/// and a short body yields [`CodecError::Truncated`].
pub fn decode(frame: Bytes) -> Result<Message, CodecError> {
    if frame.len() < HEADER_LEN {
        return Err(CodecError::Truncated {
            needed: HEADER_LEN,
            got: frame.len(),
        });
    }

    let raw_tag = u16::from_be_bytes([frame[RESERVED_PREFIX_LEN], frame[RESERVED_PREFIX_LEN + 1]]);
    let tag = MessageTag::from_u16(raw_tag).ok_or(CodecError::UnknownMessage(raw_tag))?;

    let body = frame.slice(HEADER_LEN..);
    let max = if tag.carries_block_data() {
        MAX_BLOCK_BODY
    } else {
        MAX_STRUCTURED_PAYLOAD
    };
    if body.len() > max {
        return Err(CodecError::Oversized {
            len: body.len(),
            max,
        });
    }

    let mut r = BodyReader { body };
    let msg = match tag {
        MessageTag::Error => {
            let code = ErrorCode::from_u32(r.u32()?);
            Message::Error {
                code,
                message: r.rest_string()?,
            }
        }
        MessageTag::Login => Message::Login {
            token: r.rest_string()?,
        },
        MessageTag::UploadFileRequest => {
            let file_size = r.u64()?;
            Message::UploadFileRequest {
                file_size,
                info: r.rest_json()?,
            }
        }
        MessageTag::UploadFileResponse => {
            let id = r.u32()?;
            Message::UploadFileResponse {
                id,
                filename: r.rest_string()?,
            }
        }
        MessageTag::DeleteFileRequest => Message::DeleteFileRequest {
            path: r.rest_string()?,
        },
        MessageTag::DeleteFileResponse => Message::DeleteFileResponse {
            path: r.rest_string()?,
        },
        MessageTag::DownloadFileRequest => Message::DownloadFileRequest {
            filename: r.rest_string()?,
        },
        MessageTag::DownloadFileResponse => {
            let id = r.u32()?;
            let file_size = r.u64()?;
            let block_size = r.u32()?;
            Message::DownloadFileResponse {
                id,
                file_size,
                block_size,
                filename: r.rest_string()?,
            }
        }
        MessageTag::Keepalive => {
            let timestamp_ms = r.u64()?;
            r.finish()?;
            Message::Keepalive { timestamp_ms }
        }
        MessageTag::FilesRequest => Message::FilesRequest {
            path: r.rest_string()?,
        },
        MessageTag::FilesResponse => Message::FilesResponse(r.rest_json()?),
        MessageTag::FileData => {
            let id = r.u32()?;
            let offset = r.u64()?;
            Message::FileData {
                id,
                offset,
                data: r.rest_bytes(),
            }
        }
        MessageTag::Ack => {
            let raw = r.u16()?;
            r.finish()?;
            let acked = MessageTag::from_u16(raw).ok_or(CodecError::UnknownMessage(raw))?;
            Message::Ack { acked }
        }
        MessageTag::Done => {
            let id = r.u32()?;
            r.finish()?;
            Message::Done { id }
        }
        MessageTag::CreateDir => Message::CreateDir {
            path: r.rest_string()?,
        },
        MessageTag::FileBlockRequest | MessageTag::FileBlockResponse => {
            let id = r.u32()?;
            let block_size = r.u32()?;
            let block_count = r.u64()?;
            r.finish()?;
            if tag == MessageTag::FileBlockRequest {
                Message::FileBlockRequest {
                    id,
                    block_size,
                    block_count,
                }
            } else {
                Message::FileBlockResponse {
                    id,
                    block_size,
                    block_count,
                }
            }
        }
        MessageTag::BlockDataRequest => {
            let id = r.u32()?;
            let index = r.u64()?;
            r.finish()?;
            Message::BlockDataRequest { id, index }
        }
        MessageTag::BlockDataResponse => {
            let id = r.u32()?;
            let index = r.u64()?;
            let hash_len = r.u8()? as usize;
            let hash = r.string(hash_len)?;
            Message::BlockDataResponse {
                id,
                index,
                hash,
                data: r.rest_bytes(),
            }
        }
        MessageTag::BlockDataFinish => {
            let id = r.u32()?;
            r.finish()?;
            Message::BlockDataFinish { id }
        }
        MessageTag::UploadFileExist => Message::UploadFileExist {
            filename: r.rest_string()?,
        },
        MessageTag::RenameRequest => Message::RenameRequest(r.rest_json()?),
        MessageTag::RenameResponse => Message::RenameResponse(r.rest_json()?),
    };

    Ok(msg)
}

fn put_json<T: Serialize>(buf: &mut BytesMut, value: &T) -> Result<(), CodecError> {
    let json = serde_json::to_vec(value)?;
    buf.put_slice(&json);
    Ok(())
}

/// Cursor over a frame body with truncation-aware reads.
struct BodyReader {
    body: Bytes,
}

impl BodyReader {
    fn need(&self, n: usize) -> Result<(), CodecError> {
        if self.body.remaining() < n {
            return Err(CodecError::Truncated {
                needed: n,
                got: self.body.remaining(),
            });
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        self.need(1)?;
        Ok(self.body.get_u8())
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        self.need(2)?;
        Ok(self.body.get_u16())
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        self.need(4)?;
        Ok(self.body.get_u32())
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        self.need(8)?;
        Ok(self.body.get_u64())
    }

    fn string(&mut self, len: usize) -> Result<String, CodecError> {
        self.need(len)?;
        let raw = self.body.split_to(len);
        String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }

    fn rest_string(&mut self) -> Result<String, CodecError> {
        let len = self.body.remaining();
        self.string(len)
    }

    fn rest_bytes(&mut self) -> Bytes {
        self.body.split_off(0)
    }

    fn rest_json<T: DeserializeOwned>(&mut self) -> Result<T, CodecError> {
        let raw = self.rest_bytes();
        Ok(serde_json::from_slice(&raw)?)
    }

    fn finish(&self) -> Result<(), CodecError> {
        match self.body.remaining() {
            0 => Ok(()),
            n => Err(CodecError::TrailingBytes(n)),
        }
    }
}
