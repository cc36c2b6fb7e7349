//! Block transfer engine: layout, checkpoint hashing, block I/O, and
//! sandboxed path resolution shared by server and client.

mod block_io;
mod context;
mod events;
mod hasher;
mod layout;
mod sandbox;

use std::path::{Path, PathBuf};

pub use block_io::{BlockReader, BlockWriter};
pub use context::FileTransferContext;
pub use events::{Direction, EventBus, TransferEvent};
pub use hasher::{Hasher, Sha256Hasher, calculate_file_checksum, checksum_bytes};
pub use layout::BlockLayout;
pub use sandbox::{display_path, resolve_path};

/// Suffix of the staging file an upload is written to before the rename.
pub const TEMP_SUFFIX: &str = ".tmp";

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid layout: {0}")]
    InvalidLayout(String),

    #[error("block {got} out of order, expected {expected}")]
    OutOfOrder { expected: u64, got: u64 },

    #[error("block {index} has {got} bytes, expected {expected}")]
    BlockLength {
        index: u64,
        expected: usize,
        got: usize,
    },

    #[error("block {index} is past the end of the file")]
    PastEnd { index: u64 },

    #[error("checkpoint hash missing on block {index}")]
    MissingHash { index: u64 },

    #[error("unexpected hash on non-checkpoint block {index}")]
    UnexpectedHash { index: u64 },

    #[error("integrity mismatch at block {index}: expected {expected}, got {actual}")]
    IntegrityMismatch {
        index: u64,
        expected: String,
        actual: String,
    },

    #[error("content hash mismatch: expected {expected}, got {actual}")]
    ContentHashMismatch { expected: String, actual: String },

    #[error("invalid path: {0}")]
    InvalidPath(String),
}

impl TransferError {
    /// Whether the error means the data itself is corrupt, as opposed to
    /// a misbehaving peer or a local I/O failure.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            Self::IntegrityMismatch { .. } | Self::ContentHashMismatch { .. }
        )
    }
}

/// Staging path for one transfer into `path`: the same name, then
/// `.{unique}`, then [`TEMP_SUFFIX`].
///
/// Concurrent transfers into the same target must pass distinct `unique`
/// values so each one stages into its own file.
pub fn temp_path_for(path: &Path, unique: impl std::fmt::Display) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{unique}{TEMP_SUFFIX}"));
    PathBuf::from(name)
}
