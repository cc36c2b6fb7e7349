use std::time::Duration;

/// Bytes of reserved prefix written before every message tag.
pub const RESERVED_PREFIX_LEN: usize = 8;

/// Full header length: reserved prefix plus the 2-byte tag.
pub const HEADER_LEN: usize = RESERVED_PREFIX_LEN + 2;

/// Upper bound on the body of any structured (non block-data) message.
///
/// A hostile peer cannot make us buffer more than this for anything
/// other than block payloads, which are bounded by the negotiated block
/// size instead.
pub const MAX_STRUCTURED_PAYLOAD: usize = 2048;

/// Number of blocks folded into one checkpoint hash.
pub const HASH_BLOCK_COUNT: u64 = 10;

/// Default block size (128 KiB).
pub const DEFAULT_BLOCK_SIZE: u32 = 128 * 1024;

/// Smallest block size the server will negotiate.
pub const MIN_BLOCK_SIZE: u32 = 4 * 1024;

/// Largest block size the server will negotiate (4 MiB).
pub const MAX_BLOCK_SIZE: u32 = 4 * 1024 * 1024;

/// Largest hash string carried in a block message.
pub const MAX_HASH_LEN: usize = u8::MAX as usize;

/// Maximum WebSocket message size: one block plus framing overhead.
pub const WS_MAX_MESSAGE_SIZE: usize = MAX_BLOCK_SIZE as usize + 4096;

/// How often a client sends an application-level keepalive.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// How long either side waits for any inbound message before treating
/// the connection as dead.
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(15);

/// Timeout for connect, TLS and WebSocket handshakes.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Outbound queue capacity per connection.
pub const SEND_QUEUE_CAPACITY: usize = 256;

/// Capacity of the per-session pending-file queue.
pub const PENDING_QUEUE_CAPACITY: usize = 64;

/// HTTP path of the login endpoint.
pub const LOGIN_PATH: &str = "/login";

/// Wire tag identifying a message variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageTag {
    Error = 0,
    Login = 1,
    UploadFileRequest = 2,
    UploadFileResponse = 3,
    DeleteFileRequest = 4,
    DeleteFileResponse = 5,
    DownloadFileRequest = 6,
    DownloadFileResponse = 7,
    Keepalive = 8,
    FilesRequest = 9,
    FilesResponse = 10,
    FileData = 11,
    Ack = 12,
    Done = 13,
    CreateDir = 14,
    FileBlockRequest = 15,
    FileBlockResponse = 16,
    BlockDataRequest = 17,
    BlockDataResponse = 18,
    BlockDataFinish = 19,
    UploadFileExist = 20,
    RenameRequest = 21,
    RenameResponse = 22,
}

impl MessageTag {
    /// Looks up a tag by its wire value.
    pub fn from_u16(value: u16) -> Option<Self> {
        let tag = match value {
            0 => Self::Error,
            1 => Self::Login,
            2 => Self::UploadFileRequest,
            3 => Self::UploadFileResponse,
            4 => Self::DeleteFileRequest,
            5 => Self::DeleteFileResponse,
            6 => Self::DownloadFileRequest,
            7 => Self::DownloadFileResponse,
            8 => Self::Keepalive,
            9 => Self::FilesRequest,
            10 => Self::FilesResponse,
            11 => Self::FileData,
            12 => Self::Ack,
            13 => Self::Done,
            14 => Self::CreateDir,
            15 => Self::FileBlockRequest,
            16 => Self::FileBlockResponse,
            17 => Self::BlockDataRequest,
            18 => Self::BlockDataResponse,
            19 => Self::BlockDataFinish,
            20 => Self::UploadFileExist,
            21 => Self::RenameRequest,
            22 => Self::RenameResponse,
            _ => return None,
        };
        Some(tag)
    }

    /// Wire value of this tag.
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Block-carrying messages are exempt from [`MAX_STRUCTURED_PAYLOAD`].
    pub fn carries_block_data(self) -> bool {
        matches!(self, Self::BlockDataResponse | Self::FileData)
    }
}

/// Numeric error codes carried by [`crate::Message::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    Protocol = 1,
    Unauthorized = 2,
    NotFound = 3,
    SandboxViolation = 4,
    Io = 5,
    IntegrityMismatch = 6,
    InvalidBlock = 7,
    Busy = 8,
    Internal = 9,
}

impl ErrorCode {
    /// Maps a wire value to a known code; unknown values become `Internal`.
    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => Self::Protocol,
            2 => Self::Unauthorized,
            3 => Self::NotFound,
            4 => Self::SandboxViolation,
            5 => Self::Io,
            6 => Self::IntegrityMismatch,
            7 => Self::InvalidBlock,
            8 => Self::Busy,
            _ => Self::Internal,
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

/// Logical WebSocket channel, selected by the upgrade URL path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Upload,
    Download,
    Control,
}

impl Channel {
    /// Resolves a request path (query string ignored) to a channel.
    ///
    /// `/cotrol` is a legacy alias still sent by older clients.
    pub fn from_path(path: &str) -> Option<Self> {
        let path = path.split('?').next().unwrap_or(path);
        match path.trim_end_matches('/') {
            "/upload" => Some(Self::Upload),
            "/download" => Some(Self::Download),
            "/control" | "/cotrol" => Some(Self::Control),
            _ => None,
        }
    }

    /// Canonical request path for this channel.
    pub fn path(self) -> &'static str {
        match self {
            Self::Upload => "/upload",
            Self::Download => "/download",
            Self::Control => "/control",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Upload => "upload",
            Self::Download => "download",
            Self::Control => "control",
        })
    }
}
