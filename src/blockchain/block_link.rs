// Per-block fork-tree entry.

use crate::block::BlockHash;
use crate::error::ChainError;
use crate::Result;

/// Whether a block's transactions have been validated and applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Pending,
    Executed,
    Invalid,
}

impl ExecutionStatus {
    // Integer form for the sqlite column.
    pub fn to_i64(self) -> i64 {
        match self {
            ExecutionStatus::Pending => 0,
            ExecutionStatus::Executed => 1,
            ExecutionStatus::Invalid => 2,
        }
    }

    pub fn from_i64(value: i64) -> Result<Self> {
        match value {
            0 => Ok(ExecutionStatus::Pending),
            1 => Ok(ExecutionStatus::Executed),
            2 => Ok(ExecutionStatus::Invalid),
            other => Err(ChainError::corruption(format!(
                "unknown execution status {other} in store"
            ))),
        }
    }
}

/// One entry per block ever attached, whether or not it is currently on
/// the best branch. Owned exclusively by the fork-tree index; callers
/// only ever see clones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainBlockLink {
    pub block_hash: BlockHash,
    pub previous_block_hash: BlockHash,
    pub height: u64,
    pub execution_status: ExecutionStatus,
    /// True once an unbroken parent chain back to genesis is known. A
    /// block can arrive before its parent; it stays unlinked until then.
    pub is_linked: bool,
}

impl ChainBlockLink {
    pub fn new(block_hash: BlockHash, previous_block_hash: BlockHash, height: u64) -> Self {
        ChainBlockLink {
            block_hash,
            previous_block_hash,
            height,
            execution_status: ExecutionStatus::Pending,
            is_linked: false,
        }
    }
}

/// Outcome of attaching a link to the fork tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachResult {
    /// Parent unknown; stored as an orphan pending the parent's arrival.
    NotLinked,
    /// Connected back to genesis, but the longest chain did not move.
    Linked,
    /// The tip of the longest known branch changed; the caller should
    /// evaluate a best-chain switch.
    NewLongestChainFound,
}
