//! Block index over the segment tree
//!
//! Places headers into segments, tracks cumulative work and keeps exactly
//! one active (best) segment. The active designation only changes inside
//! `connect_header`, which callers run under the chain write lock.

use std::collections::HashMap;

use tracing::{debug, info};

use crate::primitives::{BlockHeader, ChainWork, Hash, SegmentId};
use crate::storage::segments::SegmentTree;
use crate::storage::{BlockchainMetadata, ChainError, ChainResult};

/// Number of consecutive hashes at the top of a locator
const LOCATOR_DENSE_COUNT: usize = 11;

#[derive(Debug, Clone)]
struct BlockEntry {
    segment: SegmentId,
    height: u64,
    chain_work: ChainWork,
}

/// Active chain switch caused by a connected header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reorg {
    pub from: SegmentId,
    pub to: SegmentId,
    /// Tip of the abandoned segment
    pub from_tip: Hash,
    /// Tip of the new active segment
    pub to_tip: Hash,
}

/// Where a header ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderPlacement {
    AlreadyKnown {
        segment: SegmentId,
        height: u64,
    },
    Connected {
        segment: SegmentId,
        height: u64,
        reorg: Option<Reorg>,
    },
}

impl HeaderPlacement {
    pub fn segment(&self) -> SegmentId {
        match self {
            HeaderPlacement::AlreadyKnown { segment, .. } => *segment,
            HeaderPlacement::Connected { segment, .. } => *segment,
        }
    }

    pub fn height(&self) -> u64 {
        match self {
            HeaderPlacement::AlreadyKnown { height, .. } => *height,
            HeaderPlacement::Connected { height, .. } => *height,
        }
    }

    pub fn reorg(&self) -> Option<Reorg> {
        match self {
            HeaderPlacement::Connected { reorg, .. } => *reorg,
            HeaderPlacement::AlreadyKnown { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Blockchain {
    tree: SegmentTree,
    blocks: HashMap<Hash, BlockEntry>,
    /// Hashes of each segment, lowest height first
    segment_blocks: HashMap<SegmentId, Vec<Hash>>,
    active: SegmentId,
    genesis: Hash,
}

impl Blockchain {
    pub fn new(genesis: &BlockHeader) -> Self {
        let (tree, root) = SegmentTree::with_root(0);
        let hash = genesis.hash();
        let mut blocks = HashMap::new();
        blocks.insert(
            hash,
            BlockEntry {
                segment: root,
                height: 0,
                chain_work: genesis.work(),
            },
        );
        let mut segment_blocks = HashMap::new();
        segment_blocks.insert(root, vec![hash]);
        Self {
            tree,
            blocks,
            segment_blocks,
            active: root,
            genesis: hash,
        }
    }

    pub fn genesis_hash(&self) -> Hash {
        self.genesis
    }

    pub fn segments(&self) -> &SegmentTree {
        &self.tree
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.blocks.contains_key(hash)
    }

    pub fn height_of(&self, hash: &Hash) -> Option<u64> {
        self.blocks.get(hash).map(|entry| entry.height)
    }

    pub fn segment_of(&self, hash: &Hash) -> Option<SegmentId> {
        self.blocks.get(hash).map(|entry| entry.segment)
    }

    pub fn chain_work_of(&self, hash: &Hash) -> Option<ChainWork> {
        self.blocks.get(hash).map(|entry| entry.chain_work)
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn best_segment(&self) -> SegmentId {
        self.active
    }

    pub fn best_tip(&self) -> Hash {
        self.segment_tip(self.active).unwrap_or(self.genesis)
    }

    pub fn best_height(&self) -> u64 {
        self.height_of(&self.best_tip()).unwrap_or(0)
    }

    pub fn best_chain_work(&self) -> ChainWork {
        self.chain_work_of(&self.best_tip()).unwrap_or(ChainWork::ZERO)
    }

    pub fn segment_metadata(&self, segment: SegmentId) -> Option<BlockchainMetadata> {
        self.tree.metadata(segment)
    }

    pub fn all_segment_metadata(&self) -> Vec<BlockchainMetadata> {
        self.tree.all_metadata()
    }

    fn segment_tip(&self, segment: SegmentId) -> Option<Hash> {
        self.segment_blocks
            .get(&segment)
            .and_then(|hashes| hashes.last().copied())
    }

    fn segment_work(&self, segment: SegmentId) -> ChainWork {
        self.segment_tip(segment)
            .and_then(|tip| self.chain_work_of(&tip))
            .unwrap_or(ChainWork::ZERO)
    }

    /// Place a header into the segment tree.
    pub fn connect_header(&mut self, header: &BlockHeader) -> ChainResult<HeaderPlacement> {
        let hash = header.hash();
        if let Some(entry) = self.blocks.get(&hash) {
            return Ok(HeaderPlacement::AlreadyKnown {
                segment: entry.segment,
                height: entry.height,
            });
        }

        let previous = header.previous_block_hash;
        let parent = self
            .blocks
            .get(&previous)
            .cloned()
            .ok_or(ChainError::UnknownParent(previous))?;
        let height = parent.height + 1;
        let chain_work = parent.chain_work.saturating_add(header.work());

        let parent_is_head = self.segment_tip(parent.segment) == Some(previous);
        let parent_is_leaf = self.tree.children(parent.segment).is_empty();

        let segment = if parent_is_head && parent_is_leaf {
            self.tree.extend(parent.segment)?;
            parent.segment
        } else {
            let outcome = self.tree.create_fork(parent.segment, height)?;
            if let Some(split) = outcome.split {
                self.move_blocks(parent.segment, split, height);
                if self.active == parent.segment {
                    self.active = split;
                }
            }
            outcome.fork
        };

        self.blocks.insert(
            hash,
            BlockEntry {
                segment,
                height,
                chain_work,
            },
        );
        self.segment_blocks.entry(segment).or_default().push(hash);

        let reorg = self.update_active_segment();
        if let Some(reorg) = &reorg {
            info!(
                "Reorganized from segment {} ({}) to segment {} ({})",
                reorg.from, reorg.from_tip, reorg.to, reorg.to_tip
            );
        } else {
            debug!("Connected block {} at height {} in segment {}", hash, height, segment);
        }

        Ok(HeaderPlacement::Connected {
            segment,
            height,
            reorg,
        })
    }

    /// Move `from`'s blocks at or above `height` into `to`
    fn move_blocks(&mut self, from: SegmentId, to: SegmentId, height: u64) {
        let Some(hashes) = self.segment_blocks.get_mut(&from) else {
            return;
        };
        let keep = hashes
            .iter()
            .position(|hash| {
                self.blocks
                    .get(hash)
                    .map(|entry| entry.height >= height)
                    .unwrap_or(false)
            })
            .unwrap_or(hashes.len());
        let moved = hashes.split_off(keep);
        for hash in &moved {
            if let Some(entry) = self.blocks.get_mut(hash) {
                entry.segment = to;
            }
        }
        self.segment_blocks.insert(to, moved);
    }

    fn update_active_segment(&mut self) -> Option<Reorg> {
        let leaves = self.tree.leaves();
        let best = self
            .tree
            .select_best_segment(&leaves, |segment| self.segment_work(segment))?;
        if best == self.active {
            return None;
        }

        let reorg = Reorg {
            from: self.active,
            to: best,
            from_tip: self.best_tip(),
            to_tip: self.segment_tip(best).unwrap_or(self.genesis),
        };
        self.active = best;
        Some(reorg)
    }

    /// Whether the block lies on the active chain
    pub fn is_connected_to_active_chain(&self, hash: &Hash) -> bool {
        match self.blocks.get(hash) {
            Some(entry) => {
                self.tree.is_ancestor(entry.segment, self.active)
                    && entry.height <= self.best_height()
            }
            None => false,
        }
    }

    /// Hash of the active-chain block at `height`
    pub fn block_hash_at_height(&self, height: u64) -> Option<Hash> {
        let mut segment = Some(self.active);
        while let Some(id) = segment {
            let metadata = self.tree.metadata(id)?;
            if height >= metadata.min_block_height && height <= metadata.max_block_height {
                let offset = (height - metadata.min_block_height) as usize;
                return self.segment_blocks.get(&id)?.get(offset).copied();
            }
            segment = metadata.parent;
        }
        None
    }

    /// Locator for getblocks/getheaders: the tip and the ten blocks below
    /// it, then exponentially sparser, ending at genesis.
    pub fn block_locator(&self) -> Vec<Hash> {
        let mut hashes = Vec::new();
        let mut height = self.best_height();
        let mut step = 1u64;
        loop {
            if let Some(hash) = self.block_hash_at_height(height) {
                hashes.push(hash);
            }
            if height == 0 {
                break;
            }
            if hashes.len() >= LOCATOR_DENSE_COUNT {
                step *= 2;
            }
            height = height.saturating_sub(step);
        }
        if hashes.last() != Some(&self.genesis) {
            hashes.push(self.genesis);
        }
        hashes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EASY_BITS: u32 = 0x207f_ffff;

    fn genesis() -> BlockHeader {
        BlockHeader {
            version: 1,
            previous_block_hash: Hash::ZERO,
            merkle_root: Hash::ZERO,
            timestamp: 1_296_688_602,
            bits: EASY_BITS,
            nonce: 2,
        }
    }

    fn child(parent: &BlockHeader, nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            previous_block_hash: parent.hash(),
            merkle_root: Hash::ZERO,
            timestamp: parent.timestamp + 600,
            bits: EASY_BITS,
            nonce,
        }
    }

    /// Chain of `length` headers on top of `base`
    fn extend_chain(chain: &mut Blockchain, base: &BlockHeader, length: usize, nonce: u32) -> Vec<BlockHeader> {
        let mut headers = Vec::new();
        let mut tip = base.clone();
        for _ in 0..length {
            let next = child(&tip, nonce);
            chain.connect_header(&next).unwrap();
            headers.push(next.clone());
            tip = next;
        }
        headers
    }

    #[test]
    fn test_linear_extension_stays_in_root() {
        let genesis = genesis();
        let mut chain = Blockchain::new(&genesis);
        let headers = extend_chain(&mut chain, &genesis, 5, 0);

        assert_eq!(chain.best_height(), 5);
        assert_eq!(chain.best_tip(), headers[4].hash());
        assert_eq!(chain.segments().len(), 1);
        assert_eq!(chain.block_hash_at_height(3), Some(headers[2].hash()));
        assert_eq!(chain.best_chain_work(), ChainWork::new(12));
    }

    #[test]
    fn test_unknown_parent_and_duplicate() {
        let genesis = genesis();
        let mut chain = Blockchain::new(&genesis);
        let orphan = child(&child(&genesis, 1), 1);
        assert_eq!(
            chain.connect_header(&orphan),
            Err(ChainError::UnknownParent(orphan.previous_block_hash))
        );

        let block = child(&genesis, 1);
        chain.connect_header(&block).unwrap();
        assert!(matches!(
            chain.connect_header(&block).unwrap(),
            HeaderPlacement::AlreadyKnown { height: 1, .. }
        ));
    }

    #[test]
    fn test_contentious_block_splits_and_reorgs_once() {
        let genesis = genesis();
        let mut chain = Blockchain::new(&genesis);
        let main = extend_chain(&mut chain, &genesis, 4, 0);
        let root = chain.segment_of(&genesis.hash()).unwrap();

        // Competing block at height 3
        let rival = child(&main[1], 77);
        let placement = chain.connect_header(&rival).unwrap();
        assert!(placement.reorg().is_none());
        assert_eq!(placement.height(), 3);

        let main_segment = chain.segment_of(&main[3].hash()).unwrap();
        assert_ne!(main_segment, root);
        assert_eq!(chain.segment_of(&main[1].hash()), Some(root));
        assert_eq!(chain.best_segment(), main_segment);
        assert!(chain.is_connected_to_active_chain(&main[2].hash()));
        assert!(!chain.is_connected_to_active_chain(&rival.hash()));

        // Rival catches up: equal work, first-seen chain stays active
        let rival_tip = child(&rival, 77);
        assert!(chain.connect_header(&rival_tip).unwrap().reorg().is_none());

        // Rival pulls ahead: exactly one reorg
        let winner = child(&rival_tip, 77);
        let reorg = chain.connect_header(&winner).unwrap().reorg().unwrap();
        assert_eq!(reorg.from, main_segment);
        assert_eq!(reorg.to, placement.segment());
        assert_eq!(reorg.to_tip, winner.hash());
        assert_eq!(chain.best_tip(), winner.hash());
        assert_eq!(chain.block_hash_at_height(3), Some(rival.hash()));
        assert!(!chain.is_connected_to_active_chain(&main[2].hash()));

        let next = child(&winner, 77);
        assert!(chain.connect_header(&next).unwrap().reorg().is_none());
        chain.segments().validate().unwrap();
    }

    #[test]
    fn test_locator_shape() {
        let genesis = genesis();
        let mut chain = Blockchain::new(&genesis);
        let headers = extend_chain(&mut chain, &genesis, 40, 0);

        let locator = chain.block_locator();
        assert_eq!(locator[0], headers[39].hash());
        // Heights 40..=30 are consecutive
        for (offset, hash) in locator.iter().take(LOCATOR_DENSE_COUNT).enumerate() {
            assert_eq!(chain.height_of(hash), Some(40 - offset as u64));
        }
        assert_eq!(chain.height_of(&locator[11]), Some(28));
        assert_eq!(chain.height_of(&locator[12]), Some(24));
        assert_eq!(*locator.last().unwrap(), genesis.hash());
    }
}
