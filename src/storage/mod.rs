//! Storage layer
//!
//! The segment tree and block index that model forks, the staging stores for
//! announced and downloaded data, the ordered hand-off queue and the
//! persistence collaborator interface.

pub mod block_queue;
pub mod chain;
pub mod memory;
pub mod pending;
pub mod segments;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::primitives::{Block, BlockId, Hash, SegmentId};

pub use block_queue::BlockQueue;
pub use chain::{Blockchain, HeaderPlacement, Reorg};
pub use memory::MemoryBlockStore;
pub use pending::{PendingBlock, PendingBlockStore, PendingTransaction, PendingTransactionStore};
pub use segments::{ForkOutcome, SegmentTree};

/// Chain model failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("Parent block {0} is not known")]
    UnknownParent(Hash),

    #[error("Unknown blockchain segment {0}")]
    UnknownSegment(SegmentId),

    #[error("Cannot fork segment {segment} at height {height}")]
    InvalidForkHeight { segment: SegmentId, height: u64 },

    #[error("Nested-set intervals are inconsistent: {0}")]
    CorruptedIntervals(String),

    #[error("A root segment already exists")]
    DuplicateGenesis,
}

pub type ChainResult<T> = Result<T, ChainError>;

/// One row of the segment table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockchainMetadata {
    pub id: SegmentId,
    pub parent: Option<SegmentId>,
    pub nested_set_left: u64,
    pub nested_set_right: u64,
    pub block_count: u64,
    pub min_block_height: u64,
    pub max_block_height: u64,
}

impl BlockchainMetadata {
    /// `self` is `other` or one of its ancestors
    pub fn contains(&self, other: &BlockchainMetadata) -> bool {
        self.nested_set_left <= other.nested_set_left
            && other.nested_set_right <= self.nested_set_right
    }
}

/// Persistence collaborator for committed blocks
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Persist a block that has been placed in the chain
    async fn commit_block(&self, block: &Block) -> Result<BlockId>;

    async fn has_block(&self, hash: &Hash) -> Result<bool>;

    async fn get_segment_metadata(&self, segment: SegmentId) -> Result<Option<BlockchainMetadata>>;

    /// Replace the mirrored segment table
    async fn store_segment_metadata(&self, segments: Vec<BlockchainMetadata>) -> Result<()>;
}
