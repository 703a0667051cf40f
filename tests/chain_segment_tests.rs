use bitseg_node::primitives::{BlockHeader, SegmentId};
use bitseg_node::storage::{Blockchain, BlockchainMetadata, ChainError, SegmentTree};

mod common;
use common::*;

fn id(value: i64) -> SegmentId {
    SegmentId::wrap(value).unwrap()
}

fn row(value: i64, parent: Option<i64>, left: u64, right: u64) -> BlockchainMetadata {
    BlockchainMetadata {
        id: id(value),
        parent: parent.map(id),
        nested_set_left: left,
        nested_set_right: right,
        block_count: 1,
        min_block_height: 0,
        max_block_height: 0,
    }
}

fn child_of(parent: &BlockHeader, tag: u8) -> BlockHeader {
    block_on(parent.hash(), tag, parent.timestamp + 600).header
}

/// Ancestry by walking parent links, independent of the intervals
fn walks_to(tree: &SegmentTree, ancestor: SegmentId, mut segment: SegmentId) -> bool {
    loop {
        if segment == ancestor {
            return true;
        }
        match tree.parent(segment) {
            Some(parent) => segment = parent,
            None => return false,
        }
    }
}

fn assert_intervals_match_links(tree: &SegmentTree) {
    tree.validate().unwrap();
    let all = tree.all_metadata();
    for a in &all {
        for b in &all {
            assert_eq!(
                tree.is_ancestor(a.id, b.id),
                walks_to(tree, a.id, b.id),
                "{:?} / {:?}",
                a,
                b
            );
            assert_eq!(a.contains(b), tree.is_ancestor(a.id, b.id));
        }
    }
}

#[test]
fn test_sibling_forks_under_root() {
    let tree = SegmentTree::restore(vec![
        row(1, None, 0, 9),
        row(2, Some(1), 1, 4),
        row(3, Some(1), 5, 8),
    ])
    .unwrap();

    assert!(tree.is_ancestor(id(1), id(2)));
    assert!(tree.is_ancestor(id(1), id(3)));
    assert!(tree.is_ancestor(id(2), id(2)));
    assert!(!tree.is_ancestor(id(2), id(1)));
    assert!(!tree.is_ancestor(id(2), id(3)));
    assert!(!tree.is_ancestor(id(3), id(2)));
    assert_eq!(tree.leaves(), vec![id(2), id(3)]);
}

#[test]
fn test_restore_rejects_orphan_rows() {
    let result = SegmentTree::restore(vec![row(1, None, 1, 4), row(2, Some(7), 2, 3)]);
    assert!(matches!(result, Err(ChainError::UnknownSegment(_))));
}

#[test]
fn test_repeated_forks_keep_intervals_consistent() {
    let genesis = genesis();
    let mut chain = Blockchain::new(&genesis);
    let mut main = vec![genesis.clone()];
    for tag in 1..=12u8 {
        let header = child_of(main.last().unwrap(), tag);
        chain.connect_header(&header).unwrap();
        main.push(header);
    }

    // Branch off at several depths, including inside earlier splits
    let mut rivals = Vec::new();
    for (tag, height) in [(100u8, 3usize), (110, 7), (120, 5), (130, 10), (140, 2)] {
        let header = child_of(&main[height - 1], tag);
        chain.connect_header(&header).unwrap();
        assert_intervals_match_links(chain.segments());
        rivals.push(header);
    }

    // Grow one rival by two blocks; it becomes a branch of its own
    let mut tip = rivals[1].clone();
    for tag in 111..113u8 {
        tip = child_of(&tip, tag);
        chain.connect_header(&tip).unwrap();
    }
    assert_intervals_match_links(chain.segments());

    for header in main.iter().chain(rivals.iter()) {
        let segment = chain.segment_of(&header.hash()).unwrap();
        let metadata = chain.segment_metadata(segment).unwrap();
        let height = chain.height_of(&header.hash()).unwrap();
        assert!(metadata.min_block_height <= height && height <= metadata.max_block_height);
    }

    let root = chain.segments().root().unwrap();
    assert_eq!(chain.segment_metadata(root).unwrap().nested_set_left, 1);
    assert_eq!(
        chain.segment_metadata(root).unwrap().nested_set_right,
        2 * chain.segments().len() as u64
    );
}

#[test]
fn test_active_chain_flips_once_per_overtake() {
    let genesis = genesis();
    let mut chain = Blockchain::new(&genesis);
    let a1 = child_of(&genesis, 1);
    let a2 = child_of(&a1, 2);
    chain.connect_header(&a1).unwrap();
    chain.connect_header(&a2).unwrap();

    let b1 = child_of(&genesis, 50);
    let b2 = child_of(&b1, 51);
    let b3 = child_of(&b2, 52);
    let mut reorgs = 0;
    for header in [&b1, &b2, &b3] {
        if chain.connect_header(header).unwrap().reorg().is_some() {
            reorgs += 1;
        }
    }
    assert_eq!(reorgs, 1);
    assert_eq!(chain.best_tip(), b3.hash());
    assert_eq!(chain.best_height(), 3);
    assert!(chain.is_connected_to_active_chain(&b1.hash()));
    assert!(!chain.is_connected_to_active_chain(&a2.hash()));

    // Reconnecting known headers changes nothing
    let again = chain.connect_header(&a2).unwrap();
    assert!(again.reorg().is_none());
    assert_eq!(chain.best_tip(), b3.hash());
}

#[test]
fn test_unknown_parent_is_reported() {
    let genesis = genesis();
    let mut chain = Blockchain::new(&genesis);
    let stray = child_of(&child_of(&genesis, 1), 2);
    assert!(matches!(
        chain.connect_header(&stray),
        Err(ChainError::UnknownParent(_))
    ));
    assert_eq!(chain.block_count(), 1);
}

#[test]
fn test_locator_walks_back_to_genesis() {
    let genesis = genesis();
    let mut chain = Blockchain::new(&genesis);
    let mut tip = genesis.clone();
    for tag in 1..=30u8 {
        tip = child_of(&tip, tag);
        chain.connect_header(&tip).unwrap();
    }

    let locator = chain.block_locator();
    assert_eq!(locator.first(), Some(&tip.hash()));
    assert_eq!(locator.last(), Some(&genesis.hash()));
    assert!(locator.len() < 30);
    // Dense near the tip
    for (offset, hash) in locator.iter().take(10).enumerate() {
        assert_eq!(Some(*hash), chain.block_hash_at_height(30 - offset as u64));
    }
}
