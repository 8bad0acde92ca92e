//! Block layout math for a transfer.
//!
//! A file of `file_size` bytes is split into fixed-size blocks; only the
//! last block may be shorter. The plan is computed once per run and both
//! ends must be configured with the same block size. Payload lengths on
//! the wire are always derived from the local plan, never from peer input.

/// Immutable description of how a file splits into blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferPlan {
    file_size: u64,
    block_size: u64,
    block_count: u64,
    last_block_size: u64,
}

impl TransferPlan {
    /// Builds the plan for a file of `file_size` bytes cut into
    /// `block_size`-byte blocks. `block_size` must be nonzero; a zero
    /// `file_size` yields an empty plan.
    pub fn new(file_size: u64, block_size: u64) -> Self {
        let block_count = file_size.div_ceil(block_size);
        let last_block_size = if block_count == 0 {
            0
        } else {
            file_size - (block_count - 1) * block_size
        };
        TransferPlan {
            file_size,
            block_size,
            block_count,
            last_block_size,
        }
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    /// Whether `index` names a block of this plan.
    pub fn contains(&self, index: u64) -> bool {
        index < self.block_count
    }

    /// Byte offset of block `index` in the file.
    pub fn offset_of(&self, index: u64) -> u64 {
        index * self.block_size
    }

    /// Payload length of block `index`. All blocks share `block_size`
    /// except the final one, which carries the remainder.
    pub fn len_of(&self, index: u64) -> u64 {
        if index + 1 == self.block_count {
            self.last_block_size
        } else {
            self.block_size
        }
    }
}
