//! In-memory block store
//!
//! Keeps bincode-serialized blocks keyed by hash plus a mirror of the
//! segment table. Used by the binary when no external store is attached and
//! by the tests.

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::primitives::{Block, BlockHeader, BlockId, Hash, IdSequence, SegmentId};
use crate::storage::{BlockStore, BlockchainMetadata};

/// Per-block metadata kept next to the serialized block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockMetadata {
    pub id: BlockId,
    pub transaction_count: u32,
    pub byte_count: usize,
}

#[derive(Debug, Default)]
struct MemoryState {
    blocks: HashMap<Hash, Vec<u8>>,
    metadata: HashMap<Hash, BlockMetadata>,
    commit_order: Vec<Hash>,
    segments: HashMap<SegmentId, BlockchainMetadata>,
    ids: IdSequence,
}

#[derive(Debug, Default)]
pub struct MemoryBlockStore {
    state: RwLock<MemoryState>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_block(&self, hash: &Hash) -> Result<Option<Block>> {
        let state = self.state.read().await;
        match state.blocks.get(hash) {
            Some(data) => Ok(Some(bincode::deserialize(data)?)),
            None => Ok(None),
        }
    }

    pub async fn get_header(&self, hash: &Hash) -> Result<Option<BlockHeader>> {
        Ok(self.get_block(hash).await?.map(|block| block.header))
    }

    pub async fn get_block_metadata(&self, hash: &Hash) -> Option<BlockMetadata> {
        self.state.read().await.metadata.get(hash).cloned()
    }

    /// Hashes in the order they were committed
    pub async fn committed_hashes(&self) -> Vec<Hash> {
        self.state.read().await.commit_order.clone()
    }

    pub async fn block_count(&self) -> usize {
        self.state.read().await.blocks.len()
    }
}

#[async_trait]
impl BlockStore for MemoryBlockStore {
    async fn commit_block(&self, block: &Block) -> Result<BlockId> {
        let hash = block.hash();
        let mut state = self.state.write().await;
        if let Some(existing) = state.metadata.get(&hash) {
            return Ok(existing.id);
        }

        let data = bincode::serialize(block)?;
        let id = BlockId::wrap(state.ids.next_value())
            .ok_or_else(|| anyhow!("Block id sequence exhausted"))?;
        state.metadata.insert(
            hash,
            BlockMetadata {
                id,
                transaction_count: block.transactions.len() as u32,
                byte_count: data.len(),
            },
        );
        state.blocks.insert(hash, data);
        state.commit_order.push(hash);
        Ok(id)
    }

    async fn has_block(&self, hash: &Hash) -> Result<bool> {
        Ok(self.state.read().await.blocks.contains_key(hash))
    }

    async fn get_segment_metadata(&self, segment: SegmentId) -> Result<Option<BlockchainMetadata>> {
        Ok(self.state.read().await.segments.get(&segment).copied())
    }

    async fn store_segment_metadata(&self, segments: Vec<BlockchainMetadata>) -> Result<()> {
        let mut state = self.state.write().await;
        state.segments = segments.into_iter().map(|row| (row.id, row)).collect();
        Ok(())
    }
}
