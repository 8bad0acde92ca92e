//! Error types for the block transfer protocol.

use std::path::PathBuf;

/// Errors produced while moving blocks between peers.
///
/// Most variants are recoverable at the connection level: the affected
/// block goes back to the pending queue and the connection is dropped.
/// The fatal variants mean the two ends no longer agree on protocol state
/// (or the destination file is not what was asked for) and the process
/// must terminate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("block {block}: digest mismatch (corrupt link or wrong key)")]
    HashMismatch { block: u64 },

    #[error("block {block} is outside the transfer plan")]
    OutOfRange { block: u64 },

    #[error("expected a data frame, got tag {tag:#04x}")]
    UnexpectedFrame { tag: u8 },

    #[error("requested block {requested}, peer answered with block {received}")]
    BlockMismatch { requested: u64, received: u64 },

    #[error("{}: allocated {actual} bytes, wanted {expected}", path.display())]
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },
}

impl TransferError {
    /// Whether this error must take the whole process down rather than a
    /// single connection. Fatal errors map to their own exit status.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransferError::UnexpectedFrame { .. }
                | TransferError::BlockMismatch { .. }
                | TransferError::SizeMismatch { .. }
        )
    }
}
