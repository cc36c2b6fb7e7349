//! Wire protocol for blockwire channels.
//!
//! Message payloads, the tag table, error codes and the binary codec
//! shared by the server and the clients.

pub mod codec;
pub mod constants;
pub mod messages;

// Re-export primary types for convenience.
pub use codec::{CodecError, decode, encode};
pub use constants::{Channel, ErrorCode, MessageTag};
pub use messages::{
    FileEntry, FileListing, LoginError, LoginRequest, LoginResponse, Message, RenamePaths,
    UploadFileInfo,
};
