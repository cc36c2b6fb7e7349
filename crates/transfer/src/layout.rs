use blockwire_protocol::constants::HASH_BLOCK_COUNT;

use crate::TransferError;

/// Deterministic split of a file into fixed-size blocks.
///
/// `block_count = ceil(file_size / block_size)`; every block is
/// `block_size` bytes except the last, which is short by
/// [`padding_size`](Self::padding_size) bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    file_size: u64,
    block_size: u32,
    block_count: u64,
}

impl BlockLayout {
    pub fn new(file_size: u64, block_size: u32) -> Result<Self, TransferError> {
        if block_size == 0 {
            return Err(TransferError::InvalidLayout("block size must be non-zero".into()));
        }
        Ok(Self {
            file_size,
            block_size,
            block_count: file_size.div_ceil(u64::from(block_size)),
        })
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    /// Bytes missing from the last block to make it full size.
    pub fn padding_size(&self) -> u32 {
        match self.file_size % u64::from(self.block_size) {
            0 => 0,
            rem => self.block_size - rem as u32,
        }
    }

    /// Byte offset of block `index`.
    pub fn block_offset(&self, index: u64) -> u64 {
        index * u64::from(self.block_size)
    }

    /// Length of block `index`, or `None` past the end of the file.
    pub fn block_len(&self, index: u64) -> Option<usize> {
        if index >= self.block_count {
            return None;
        }
        let remaining = self.file_size - self.block_offset(index);
        Some(remaining.min(u64::from(self.block_size)) as usize)
    }

    /// Whether block `index` closes a checkpoint window.
    pub fn is_checkpoint(&self, index: u64) -> bool {
        index < self.block_count
            && ((index + 1) % HASH_BLOCK_COUNT == 0 || index + 1 == self.block_count)
    }
}
