//! Strictly ordered hand-off queue of blocks
//!
//! Every queued block's previous hash equals the hash of the block before
//! it. Blocks that would break the chain are dropped, not buffered.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::primitives::{Block, Hash};

#[derive(Debug, Default)]
struct QueueState {
    blocks: VecDeque<Block>,
    /// Hash of the most recently accepted block, kept after it is popped
    tail: Option<Hash>,
}

#[derive(Debug, Default)]
pub struct BlockQueue {
    state: Mutex<QueueState>,
}

impl BlockQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue whose first block must extend `anchor`
    pub fn with_anchor(anchor: Hash) -> Self {
        Self {
            state: Mutex::new(QueueState {
                blocks: VecDeque::new(),
                tail: Some(anchor),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // Every critical section leaves the state consistent, so a poisoned
        // guard is still usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append `block` if it extends the tail. Returns whether it was kept.
    pub fn add_block(&self, block: Block) -> bool {
        let mut state = self.lock();
        let hash = block.hash();
        if let Some(tail) = state.tail {
            if block.previous_block_hash() != tail {
                debug!(
                    "Dropped block {}: previous {} does not extend {}",
                    hash,
                    block.previous_block_hash(),
                    tail
                );
                return false;
            }
        }
        state.tail = Some(hash);
        state.blocks.push_back(block);
        true
    }

    pub fn get_next_block(&self) -> Option<Block> {
        self.lock().blocks.pop_front()
    }

    /// Hash the next accepted block must build on
    pub fn peek_tail_hash(&self) -> Option<Hash> {
        self.lock().tail
    }

    /// Forget queued blocks and restart from `anchor`, e.g. after a reorg.
    pub fn reset(&self, anchor: Option<Hash>) {
        let mut state = self.lock();
        if !state.blocks.is_empty() {
            warn!("Discarding {} queued blocks", state.blocks.len());
        }
        state.blocks.clear();
        state.tail = anchor;
    }

    pub fn len(&self) -> usize {
        self.lock().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().blocks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::BlockHeader;

    fn block(previous: Hash, nonce: u32) -> Block {
        Block {
            header: BlockHeader {
                version: 1,
                previous_block_hash: previous,
                merkle_root: Hash::ZERO,
                timestamp: 0,
                bits: 0x207f_ffff,
                nonce,
            },
            transactions: Vec::new(),
        }
    }

    #[test]
    fn test_tail_survives_pop() {
        let queue = BlockQueue::new();
        let a = block(Hash::ZERO, 1);
        let b = block(a.hash(), 2);
        assert!(queue.add_block(a.clone()));
        assert_eq!(queue.get_next_block(), Some(a.clone()));
        assert!(queue.is_empty());
        assert_eq!(queue.peek_tail_hash(), Some(a.hash()));
        assert!(queue.add_block(b));
    }

    #[test]
    fn test_anchor_gates_first_block() {
        let anchor = Hash::new([5; 32]);
        let queue = BlockQueue::with_anchor(anchor);
        assert!(!queue.add_block(block(Hash::ZERO, 1)));
        assert!(queue.add_block(block(anchor, 1)));
        assert_eq!(queue.len(), 1);

        queue.reset(None);
        assert!(queue.is_empty());
        assert!(queue.add_block(block(Hash::new([7; 32]), 3)));
    }
}
