//! Nested-set tree of blockchain segments
//!
//! A segment is a run of blocks with no fork inside it. Segments form a tree
//! rooted at the genesis segment; every segment carries a `[left, right]`
//! interval such that ancestry is interval containment. A fork only
//! renumbers the forked segment's subtree and shifts the intervals to its
//! right and its ancestors' right bounds. New bounds are computed off to the
//! side and validated before any are written, so a failed fork leaves the
//! table as it was.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

use tracing::{debug, error};

use crate::primitives::{ChainWork, IdSequence, SegmentId};
use crate::storage::{BlockchainMetadata, ChainError, ChainResult};

#[derive(Debug, Clone)]
struct SegmentNode {
    parent: Option<SegmentId>,
    children: Vec<SegmentId>,
    left: u64,
    right: u64,
    block_count: u64,
    min_block_height: u64,
    max_block_height: u64,
    /// When the first block of this chain was seen; splits inherit it
    sequence: u64,
}

impl SegmentNode {
    fn new(parent: Option<SegmentId>, height: u64, sequence: u64) -> Self {
        Self {
            parent,
            children: Vec::new(),
            left: 0,
            right: 0,
            block_count: 1,
            min_block_height: height,
            max_block_height: height,
            sequence,
        }
    }
}

/// Result of [`SegmentTree::create_fork`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForkOutcome {
    /// Segment that took over the parent's blocks at or above the fork height
    pub split: Option<SegmentId>,
    /// New leaf holding the contentious block
    pub fork: SegmentId,
}

#[derive(Debug, Clone, Default)]
pub struct SegmentTree {
    segments: BTreeMap<SegmentId, SegmentNode>,
    root: Option<SegmentId>,
    ids: IdSequence,
    next_sequence: u64,
}

impl SegmentTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tree holding only a genesis segment whose single block is at `height`
    pub fn with_root(height: u64) -> (Self, SegmentId) {
        let mut tree = Self::new();
        let id = tree.allocate_id();
        let sequence = tree.allocate_sequence();
        let mut node = SegmentNode::new(None, height, sequence);
        node.left = 1;
        node.right = 2;
        tree.segments.insert(id, node);
        tree.root = Some(id);
        (tree, id)
    }

    /// Create the genesis segment
    pub fn create_root(&mut self, height: u64) -> ChainResult<SegmentId> {
        if self.root.is_some() {
            return Err(ChainError::DuplicateGenesis);
        }
        let (tree, id) = Self::with_root(height);
        *self = tree;
        Ok(id)
    }

    /// Rebuild a tree from persisted rows, validating the intervals as given.
    pub fn restore(rows: Vec<BlockchainMetadata>) -> ChainResult<Self> {
        let mut tree = Self::new();
        for row in &rows {
            if row.parent.is_none() {
                if tree.root.is_some() {
                    return Err(ChainError::DuplicateGenesis);
                }
                tree.root = Some(row.id);
            }
            tree.segments.insert(
                row.id,
                SegmentNode {
                    parent: row.parent,
                    children: Vec::new(),
                    left: row.nested_set_left,
                    right: row.nested_set_right,
                    block_count: row.block_count,
                    min_block_height: row.min_block_height,
                    max_block_height: row.max_block_height,
                    sequence: row.id.value(),
                },
            );
        }
        for row in &rows {
            if let Some(parent) = row.parent {
                tree.segments
                    .get_mut(&parent)
                    .ok_or(ChainError::UnknownSegment(parent))?
                    .children
                    .push(row.id);
            }
        }

        let highest = rows.iter().map(|row| row.id.value()).max().unwrap_or(0);
        tree.ids = IdSequence::starting_at(highest as i64 + 1);
        tree.next_sequence = highest;

        validate(&tree.segments, tree.root)?;
        Ok(tree)
    }

    fn allocate_id(&mut self) -> SegmentId {
        loop {
            if let Some(id) = SegmentId::wrap(self.ids.next_value()) {
                return id;
            }
        }
    }

    fn allocate_sequence(&mut self) -> u64 {
        self.next_sequence += 1;
        self.next_sequence
    }

    pub fn root(&self) -> Option<SegmentId> {
        self.root
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn contains(&self, id: SegmentId) -> bool {
        self.segments.contains_key(&id)
    }

    /// `a` is `b` or an ancestor of `b`. Unknown segments are unrelated.
    pub fn is_ancestor(&self, a: SegmentId, b: SegmentId) -> bool {
        match (self.segments.get(&a), self.segments.get(&b)) {
            (Some(a), Some(b)) => a.left <= b.left && b.right <= a.right,
            _ => false,
        }
    }

    pub fn parent(&self, id: SegmentId) -> Option<SegmentId> {
        self.segments.get(&id).and_then(|node| node.parent)
    }

    pub fn children(&self, id: SegmentId) -> Vec<SegmentId> {
        self.segments
            .get(&id)
            .map(|node| node.children.clone())
            .unwrap_or_default()
    }

    pub fn leaves(&self) -> Vec<SegmentId> {
        self.segments
            .iter()
            .filter(|(_, node)| node.children.is_empty())
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn metadata(&self, id: SegmentId) -> Option<BlockchainMetadata> {
        self.segments.get(&id).map(|node| BlockchainMetadata {
            id,
            parent: node.parent,
            nested_set_left: node.left,
            nested_set_right: node.right,
            block_count: node.block_count,
            min_block_height: node.min_block_height,
            max_block_height: node.max_block_height,
        })
    }

    pub fn all_metadata(&self) -> Vec<BlockchainMetadata> {
        self.segments
            .keys()
            .filter_map(|id| self.metadata(*id))
            .collect()
    }

    /// Append one block to the head of a leaf segment.
    ///
    /// Intervals only depend on the tree shape, so no renumber is needed.
    pub fn extend(&mut self, id: SegmentId) -> ChainResult<u64> {
        let node = self
            .segments
            .get_mut(&id)
            .ok_or(ChainError::UnknownSegment(id))?;
        if !node.children.is_empty() {
            return Err(ChainError::InvalidForkHeight {
                segment: id,
                height: node.max_block_height + 1,
            });
        }
        node.block_count += 1;
        node.max_block_height += 1;
        Ok(node.max_block_height)
    }

    /// Branch off `parent` with a new leaf holding one block at `at_height`.
    ///
    /// When `at_height` falls inside the parent, the parent is split first:
    /// its blocks from `at_height` upwards and its previous children move to
    /// a new child segment.
    pub fn create_fork(&mut self, parent: SegmentId, at_height: u64) -> ChainResult<ForkOutcome> {
        let node = self
            .segments
            .get(&parent)
            .ok_or(ChainError::UnknownSegment(parent))?;
        if at_height <= node.min_block_height || at_height > node.max_block_height + 1 {
            return Err(ChainError::InvalidForkHeight {
                segment: parent,
                height: at_height,
            });
        }

        let before = node.clone();
        let split = if at_height <= before.max_block_height {
            Some(self.split(parent, at_height)?)
        } else {
            None
        };

        let fork = self.allocate_id();
        let sequence = self.allocate_sequence();
        self.segments
            .insert(fork, SegmentNode::new(Some(parent), at_height, sequence));
        self.child_list(parent)?.push(fork);

        if let Err(e) = self.renumber_subtree(parent) {
            self.undo_fork(parent, before, split, fork);
            return Err(e);
        }

        debug!(
            "Forked segment {} at height {} (split: {:?}, fork: {})",
            parent, at_height, split, fork
        );
        Ok(ForkOutcome { split, fork })
    }

    /// Put `parent` back the way it was before a fork.
    fn undo_fork(&mut self, parent: SegmentId, before: SegmentNode, split: Option<SegmentId>, fork: SegmentId) {
        self.segments.remove(&fork);
        if let Some(split) = split {
            self.segments.remove(&split);
        }
        for child in &before.children {
            if let Some(node) = self.segments.get_mut(child) {
                node.parent = Some(parent);
            }
        }
        self.segments.insert(parent, before);
    }

    fn child_list(&mut self, id: SegmentId) -> ChainResult<&mut Vec<SegmentId>> {
        self.segments
            .get_mut(&id)
            .map(|node| &mut node.children)
            .ok_or(ChainError::UnknownSegment(id))
    }

    fn split(&mut self, parent: SegmentId, at_height: u64) -> ChainResult<SegmentId> {
        let split_id = self.allocate_id();
        let node = self
            .segments
            .get_mut(&parent)
            .ok_or(ChainError::UnknownSegment(parent))?;

        let moved = node.max_block_height - at_height + 1;
        let split_node = SegmentNode {
            parent: Some(parent),
            children: std::mem::take(&mut node.children),
            left: 0,
            right: 0,
            block_count: moved,
            min_block_height: at_height,
            max_block_height: node.max_block_height,
            sequence: node.sequence,
        };
        node.block_count -= moved;
        node.max_block_height = at_height - 1;
        node.children.push(split_id);

        for child in &split_node.children {
            if let Some(child_node) = self.segments.get_mut(child) {
                child_node.parent = Some(split_id);
            }
        }
        self.segments.insert(split_id, split_node);
        Ok(split_id)
    }

    /// Renumber `top`'s subtree depth-first from `top.left`, then shift
    /// everything right of the old `top.right` by the growth: the right
    /// bound of each ancestor and the whole interval of every subtree that
    /// follows on the way up. Segments left of `top` are never touched.
    fn renumber_subtree(&mut self, top: SegmentId) -> ChainResult<()> {
        let node = self
            .segments
            .get(&top)
            .ok_or(ChainError::UnknownSegment(top))?;
        let (left, old_right) = (node.left, node.right);

        let mut bounds: HashMap<SegmentId, (u64, u64)> = HashMap::new();
        let mut counter = left;
        // (segment, children visited?)
        let mut stack = vec![(top, false)];
        while let Some((id, visited)) = stack.pop() {
            if visited {
                if let Some(bound) = bounds.get_mut(&id) {
                    bound.1 = counter;
                }
                counter += 1;
                continue;
            }
            if bounds.insert(id, (counter, 0)).is_some() || bounds.len() > self.segments.len() {
                return Err(corrupted(format!("segment {} is reachable twice", id)));
            }
            counter += 1;
            stack.push((id, true));
            let children = &self
                .segments
                .get(&id)
                .ok_or(ChainError::UnknownSegment(id))?
                .children;
            for child in children.iter().rev() {
                stack.push((*child, false));
            }
        }

        // Restored tables may leave room inside `top`; keep it
        let new_right = counter - 1;
        let top_right = new_right.max(old_right);
        if let Some(bound) = bounds.get_mut(&top) {
            bound.1 = top_right;
        }
        let shift = top_right - old_right;

        if shift > 0 {
            let mut child = top;
            while let Some(parent) = self.parent(child) {
                let parent_node = self
                    .segments
                    .get(&parent)
                    .ok_or(ChainError::UnknownSegment(parent))?;
                bounds.insert(parent, (parent_node.left, parent_node.right + shift));
                let followers: Vec<SegmentId> = parent_node
                    .children
                    .iter()
                    .copied()
                    .filter(|sibling| {
                        self.segments
                            .get(sibling)
                            .map(|node| node.left > old_right)
                            .unwrap_or(false)
                    })
                    .collect();
                for follower in followers {
                    self.shift_subtree(follower, shift, &mut bounds)?;
                }
                child = parent;
            }
        }

        self.validate_bounds(&bounds)?;
        for (id, (left, right)) in bounds {
            if let Some(node) = self.segments.get_mut(&id) {
                node.left = left;
                node.right = right;
            }
        }
        Ok(())
    }

    fn shift_subtree(
        &self,
        top: SegmentId,
        shift: u64,
        bounds: &mut HashMap<SegmentId, (u64, u64)>,
    ) -> ChainResult<()> {
        let mut stack = vec![top];
        while let Some(id) = stack.pop() {
            let node = self
                .segments
                .get(&id)
                .ok_or(ChainError::UnknownSegment(id))?;
            if bounds.insert(id, (node.left + shift, node.right + shift)).is_some() {
                return Err(corrupted(format!("segment {} is reachable twice", id)));
            }
            stack.extend(node.children.iter().copied());
        }
        Ok(())
    }

    /// Check the changed rows against their parents and their children.
    fn validate_bounds(&self, bounds: &HashMap<SegmentId, (u64, u64)>) -> ChainResult<()> {
        let bound_of = |id: SegmentId| {
            bounds
                .get(&id)
                .copied()
                .or_else(|| self.segments.get(&id).map(|node| (node.left, node.right)))
        };

        for (id, (left, right)) in bounds {
            let fail = |reason: String| {
                error!("Segment renumber failed: {}", reason);
                Err(corrupted(reason))
            };
            if left >= right {
                return fail(format!("segment {} has empty interval", id));
            }
            let Some(node) = self.segments.get(id) else {
                return fail(format!("segment {} is missing", id));
            };
            if let Some(parent) = node.parent {
                match bound_of(parent) {
                    Some((parent_left, parent_right)) if parent_left < *left && *right < parent_right => {}
                    _ => return fail(format!("segment {} escapes parent {}", id, parent)),
                }
            }
            let mut children = Vec::with_capacity(node.children.len());
            for child in &node.children {
                match bound_of(*child) {
                    Some(bound) => children.push(bound),
                    None => return fail(format!("segment {} lists a missing child", id)),
                }
            }
            children.sort_unstable();
            if children.windows(2).any(|pair| pair[0].1 >= pair[1].0) {
                return fail(format!("children of segment {} overlap", id));
            }
        }
        Ok(())
    }

    /// Pick the best of `candidates`: most work, then the chain registered
    /// first.
    pub fn select_best_segment<F>(&self, candidates: &[SegmentId], work: F) -> Option<SegmentId>
    where
        F: Fn(SegmentId) -> ChainWork,
    {
        candidates
            .iter()
            .filter_map(|id| self.segments.get(id).map(|node| (*id, node)))
            .max_by_key(|(id, node)| {
                (work(*id), Reverse(node.sequence), Reverse(*id))
            })
            .map(|(id, _)| id)
    }

    /// Check every interval against the tree shape.
    pub fn validate(&self) -> ChainResult<()> {
        validate(&self.segments, self.root)
    }
}

fn corrupted(reason: String) -> ChainError {
    ChainError::CorruptedIntervals(reason)
}

fn validate(segments: &BTreeMap<SegmentId, SegmentNode>, root: Option<SegmentId>) -> ChainResult<()> {
    let corrupted = |reason: String| Err(corrupted(reason));

    let Some(root) = root else {
        return if segments.is_empty() {
            Ok(())
        } else {
            corrupted("segments without a root".to_string())
        };
    };
    let roots = segments.values().filter(|node| node.parent.is_none()).count();
    if roots != 1 {
        return corrupted(format!("{} root segments", roots));
    }

    for (id, node) in segments {
        if node.left >= node.right {
            return corrupted(format!("segment {} has empty interval", id));
        }
        if let Some(parent_id) = node.parent {
            let Some(parent) = segments.get(&parent_id) else {
                return corrupted(format!("segment {} has missing parent {}", id, parent_id));
            };
            if !(parent.left < node.left && node.right < parent.right) {
                return corrupted(format!(
                    "segment {} [{}, {}] escapes parent {} [{}, {}]",
                    id, node.left, node.right, parent_id, parent.left, parent.right
                ));
            }
        } else if *id != root {
            return corrupted(format!("segment {} is a second root", id));
        }

        let mut siblings: Vec<(u64, u64)> = node
            .children
            .iter()
            .filter_map(|child| segments.get(child).map(|c| (c.left, c.right)))
            .collect();
        if siblings.len() != node.children.len() {
            return corrupted(format!("segment {} lists a missing child", id));
        }
        siblings.sort_unstable();
        if siblings.windows(2).any(|pair| pair[0].1 >= pair[1].0) {
            return corrupted(format!("children of segment {} overlap", id));
        }
    }
    Ok(())
}
