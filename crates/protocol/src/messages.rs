use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{ErrorCode, MAX_STRUCTURED_PAYLOAD, MessageTag};

// ---------------------------------------------------------------------------
// Structured (JSON) body parts
// ---------------------------------------------------------------------------

/// Variable part of an upload request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadFileInfo {
    pub filename: String,
    /// Hex SHA-256 of the whole file content.
    pub hash: String,
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
}

/// Directory listing returned for a `FilesRequest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileListing {
    pub path: String,
    pub entries: Vec<FileEntry>,
}

/// Source and destination of a rename.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenamePaths {
    pub from: String,
    pub to: String,
}

/// Body of the HTTP `/login` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Body of a successful HTTP `/login` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
}

/// Body of a failed HTTP `/login` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginError {
    pub error: String,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Every message exchanged over a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Error {
        code: ErrorCode,
        message: String,
    },
    Login {
        token: String,
    },
    UploadFileRequest {
        file_size: u64,
        info: UploadFileInfo,
    },
    UploadFileResponse {
        id: u32,
        filename: String,
    },
    DeleteFileRequest {
        path: String,
    },
    DeleteFileResponse {
        path: String,
    },
    DownloadFileRequest {
        filename: String,
    },
    DownloadFileResponse {
        id: u32,
        file_size: u64,
        block_size: u32,
        filename: String,
    },
    Keepalive {
        timestamp_ms: u64,
    },
    FilesRequest {
        path: String,
    },
    FilesResponse(FileListing),
    /// Legacy push-style data frame; kept on the wire, rejected by sessions.
    FileData {
        id: u32,
        offset: u64,
        data: Bytes,
    },
    Ack {
        acked: MessageTag,
    },
    Done {
        id: u32,
    },
    CreateDir {
        path: String,
    },
    FileBlockRequest {
        id: u32,
        block_size: u32,
        block_count: u64,
    },
    FileBlockResponse {
        id: u32,
        block_size: u32,
        block_count: u64,
    },
    BlockDataRequest {
        id: u32,
        index: u64,
    },
    BlockDataResponse {
        id: u32,
        index: u64,
        /// Checkpoint digest; empty unless this block closes a window.
        hash: String,
        data: Bytes,
    },
    BlockDataFinish {
        id: u32,
    },
    UploadFileExist {
        filename: String,
    },
    RenameRequest(RenamePaths),
    RenameResponse(RenamePaths),
}

impl Message {
    /// Wire tag of this message.
    pub fn tag(&self) -> MessageTag {
        match self {
            Self::Error { .. } => MessageTag::Error,
            Self::Login { .. } => MessageTag::Login,
            Self::UploadFileRequest { .. } => MessageTag::UploadFileRequest,
            Self::UploadFileResponse { .. } => MessageTag::UploadFileResponse,
            Self::DeleteFileRequest { .. } => MessageTag::DeleteFileRequest,
            Self::DeleteFileResponse { .. } => MessageTag::DeleteFileResponse,
            Self::DownloadFileRequest { .. } => MessageTag::DownloadFileRequest,
            Self::DownloadFileResponse { .. } => MessageTag::DownloadFileResponse,
            Self::Keepalive { .. } => MessageTag::Keepalive,
            Self::FilesRequest { .. } => MessageTag::FilesRequest,
            Self::FilesResponse(_) => MessageTag::FilesResponse,
            Self::FileData { .. } => MessageTag::FileData,
            Self::Ack { .. } => MessageTag::Ack,
            Self::Done { .. } => MessageTag::Done,
            Self::CreateDir { .. } => MessageTag::CreateDir,
            Self::FileBlockRequest { .. } => MessageTag::FileBlockRequest,
            Self::FileBlockResponse { .. } => MessageTag::FileBlockResponse,
            Self::BlockDataRequest { .. } => MessageTag::BlockDataRequest,
            Self::BlockDataResponse { .. } => MessageTag::BlockDataResponse,
            Self::BlockDataFinish { .. } => MessageTag::BlockDataFinish,
            Self::UploadFileExist { .. } => MessageTag::UploadFileExist,
            Self::RenameRequest(_) => MessageTag::RenameRequest,
            Self::RenameResponse(_) => MessageTag::RenameResponse,
        }
    }

    /// Creates an error message, truncating the text so the encoded body
    /// stays under [`MAX_STRUCTURED_PAYLOAD`].
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        let mut message = message.into();
        truncate_at_boundary(&mut message, MAX_STRUCTURED_PAYLOAD - 4);
        Self::Error { code, message }
    }

    /// Creates a download response. The echoed filename is cut so the
    /// reply fits even when the request itself was at the size cap.
    pub fn download_response(id: u32, file_size: u64, block_size: u32, filename: &str) -> Self {
        let mut filename = filename.to_string();
        truncate_at_boundary(&mut filename, MAX_STRUCTURED_PAYLOAD - 16);
        Self::DownloadFileResponse {
            id,
            file_size,
            block_size,
            filename,
        }
    }

    /// Creates a keepalive stamped with the current wall-clock time.
    pub fn keepalive_now() -> Self {
        Self::Keepalive {
            timestamp_ms: Utc::now().timestamp_millis().max(0) as u64,
        }
    }
}

fn truncate_at_boundary(text: &mut String, max: usize) {
    if text.len() > max {
        let mut cut = max;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
}
