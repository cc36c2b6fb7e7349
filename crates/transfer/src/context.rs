use std::path::{Path, PathBuf};

use crate::hasher::{Hasher, Sha256Hasher};
use crate::layout::BlockLayout;
use crate::TransferError;

/// State of the one file in flight on a session.
///
/// Created when a transfer request is accepted, advanced once per block,
/// dropped when the transfer finishes, aborts, or the session shuts down.
/// `active_block_count` is the index of the next block to send or expect;
/// a block with any other index is rejected without touching the state.
#[derive(Debug)]
pub struct FileTransferContext {
    id: u32,
    name: String,
    path: PathBuf,
    layout: BlockLayout,
    active_block_count: u64,
    bytes_done: u64,
    window: Sha256Hasher,
    whole: Sha256Hasher,
}

impl FileTransferContext {
    pub fn new(id: u32, name: impl Into<String>, path: PathBuf, layout: BlockLayout) -> Self {
        Self {
            id,
            name: name.into(),
            path,
            layout,
            active_block_count: 0,
            bytes_done: 0,
            window: Sha256Hasher::new(),
            whole: Sha256Hasher::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Name the peer used for this file.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Local path of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn layout(&self) -> &BlockLayout {
        &self.layout
    }

    pub fn file_size(&self) -> u64 {
        self.layout.file_size()
    }

    pub fn block_size(&self) -> u32 {
        self.layout.block_size()
    }

    pub fn block_count(&self) -> u64 {
        self.layout.block_count()
    }

    pub fn padding_size(&self) -> u32 {
        self.layout.padding_size()
    }

    /// Index of the next block to send or expect.
    pub fn active_block_count(&self) -> u64 {
        self.active_block_count
    }

    pub fn bytes_done(&self) -> u64 {
        self.bytes_done
    }

    /// `true` once every block has been sent or accepted.
    pub fn is_complete(&self) -> bool {
        self.active_block_count >= self.layout.block_count()
    }

    /// Byte offset of block `index` within the file.
    pub fn offset_of(&self, index: u64) -> u64 {
        self.layout.block_offset(index)
    }

    /// Checks that `index` is the next block and `len` is its exact size.
    pub fn check_block(&self, index: u64, len: usize) -> Result<(), TransferError> {
        if index != self.active_block_count {
            return Err(TransferError::OutOfOrder {
                expected: self.active_block_count,
                got: index,
            });
        }
        let expected = self
            .layout
            .block_len(index)
            .ok_or(TransferError::PastEnd { index })?;
        if len != expected {
            return Err(TransferError::BlockLength {
                index,
                expected,
                got: len,
            });
        }
        Ok(())
    }

    /// Sender side: folds the next block and returns the checkpoint hash
    /// to attach (empty unless the block closes a window).
    pub fn seal_block(&mut self, index: u64, data: &[u8]) -> Result<String, TransferError> {
        self.check_block(index, data.len())?;
        self.fold(data);
        let hash = if self.layout.is_checkpoint(index) {
            self.window.hex()
        } else {
            String::new()
        };
        self.advance(data.len());
        Ok(hash)
    }

    /// Receiver side: validates and folds the next block, verifying the
    /// attached checkpoint hash bit-for-bit.
    pub fn accept_block(
        &mut self,
        index: u64,
        data: &[u8],
        hash: &str,
    ) -> Result<(), TransferError> {
        self.check_block(index, data.len())?;
        let checkpoint = self.layout.is_checkpoint(index);
        if !checkpoint && !hash.is_empty() {
            return Err(TransferError::UnexpectedHash { index });
        }
        if checkpoint && hash.is_empty() {
            return Err(TransferError::MissingHash { index });
        }

        self.fold(data);
        if checkpoint {
            let local = self.window.hex();
            if local != hash {
                return Err(TransferError::IntegrityMismatch {
                    index,
                    expected: hash.to_string(),
                    actual: local,
                });
            }
        }
        self.advance(data.len());
        Ok(())
    }

    /// Finalises the whole-file digest.
    pub fn content_hash(&mut self) -> String {
        self.whole.hex()
    }

    fn fold(&mut self, data: &[u8]) {
        self.window.update(data);
        self.whole.update(data);
    }

    fn advance(&mut self, len: usize) {
        self.active_block_count += 1;
        self.bytes_done += len as u64;
    }
}
