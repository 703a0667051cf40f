use std::collections::HashMap;
use std::sync::Arc;

use bitseg_node::primitives::Hash;
use bitseg_node::storage::pending::{PendingBlockRange, FAILED_DOWNLOAD_PRIORITY_PENALTY};
use bitseg_node::storage::{BlockQueue, PendingBlockStore, PendingTransactionStore};

mod common;
use common::*;

fn hash(byte: u8) -> Hash {
    Hash::new([byte; 32])
}

#[tokio::test]
async fn test_download_plan_groups_by_height() {
    let store = PendingBlockStore::new();
    let heights: HashMap<Hash, u64> = [(hash(10), 10), (hash(11), 11), (hash(70), 700), (hash(12), 12)]
        .into_iter()
        .collect();

    store.store_block_hash(hash(10), None, 1).await;
    store.store_block_hash(hash(11), None, 2).await;
    store.store_block_hash(hash(99), None, 3).await;
    store.store_block_hash(hash(70), None, 4).await;
    store.store_block_hash(hash(12), None, 5).await;

    // Announced by a connected node: fetched with getdata, not located
    let announced = store.store_block_hash(hash(50), None, 0).await;
    store.add_node_inventory(node(1), announced).await;
    // Already downloaded
    store.store_block(block_on(hash(1), 1, 0)).await;

    let plan = store
        .select_priority_pending_blocks_with_unknown_node_inventory(&[node(1)], |h| heights.get(h).copied())
        .await;
    assert_eq!(
        plan,
        vec![
            PendingBlockRange {
                start: hash(10),
                end: Some(hash(11)),
            },
            PendingBlockRange {
                start: hash(99),
                end: None,
            },
            PendingBlockRange {
                start: hash(70),
                end: None,
            },
            PendingBlockRange {
                start: hash(12),
                end: None,
            },
        ]
    );

    // Once its announcer is gone the entry has to be located again
    let plan = store
        .select_priority_pending_blocks_with_unknown_node_inventory(&[node(2)], |h| heights.get(h).copied())
        .await;
    assert_eq!(plan[0].start, hash(50));
}

#[tokio::test]
async fn test_failures_push_entries_back() {
    let store = PendingBlockStore::new();
    let first = store.store_block_hash(hash(1), None, 100).await;
    let second = store.store_block_hash(hash(2), None, 130).await;
    store.add_node_inventory(node(1), first).await;
    store.add_node_inventory(node(1), second).await;

    let plan = store.select_incomplete_pending_blocks(&[node(1)], 10, 1_000).await;
    assert_eq!(plan, vec![(first, node(1)), (second, node(1))]);

    store.increment_failed_download_count(first).await;
    let entry = store.get_pending_block(first).await.unwrap();
    assert_eq!(entry.priority, 100 + FAILED_DOWNLOAD_PRIORITY_PENALTY);

    let plan = store.select_incomplete_pending_blocks(&[node(1)], 10, 1_000).await;
    assert_eq!(plan, vec![(second, node(1)), (first, node(1))]);
    assert_eq!(store.select_incomplete_pending_blocks(&[node(1)], 1, 1_000).await.len(), 1);
}

#[tokio::test]
async fn test_retry_interval_is_configurable() {
    let store = PendingBlockStore::with_retry_interval(30);
    let id = store.store_block_hash(hash(1), None, 0).await;
    store.add_node_inventory(node(1), id).await;
    store.update_last_download_attempt_time(id, 1_000).await;

    assert!(store.select_incomplete_pending_blocks(&[node(1)], 10, 1_030).await.is_empty());
    assert_eq!(store.select_incomplete_pending_blocks(&[node(1)], 10, 1_031).await.len(), 1);
}

#[tokio::test]
async fn test_candidate_needs_known_parent() {
    let genesis = genesis();
    let blocks = chain_from(genesis.hash(), 2, 1);
    let store = PendingBlockStore::new();
    let child = store.store_block(blocks[1].clone()).await;
    assert!(store
        .select_candidate_pending_block_id(|h| *h == genesis.hash())
        .await
        .is_none());

    let parent = store.store_block(blocks[0].clone()).await;
    assert_eq!(
        store.select_candidate_pending_block_id(|h| *h == genesis.hash()).await,
        Some(parent)
    );
    assert_eq!(
        store
            .get_pending_block_ids_with_previous_block_hash(&blocks[0].hash())
            .await,
        vec![child]
    );

    let removed = store
        .cleanup_pending_blocks(|h| *h == blocks[0].hash() || *h == blocks[1].hash())
        .await;
    assert_eq!(removed.len(), 2);
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn test_purges_keep_downloaded_entries() {
    let store = PendingBlockStore::new();
    let missing = store.store_block_hash(hash(1), None, 0).await;
    let downloaded = store.store_block(block_on(hash(2), 2, 0)).await;
    for _ in 0..5 {
        store.increment_failed_download_count(missing).await;
        store.increment_failed_download_count(downloaded).await;
    }

    assert_eq!(store.purge_failed_pending_blocks(4).await, vec![missing]);
    assert!(store.purge_unlocatable_pending_blocks(&[]).await.is_empty());
    assert!(store.has_block_data(downloaded).await);
}

#[tokio::test]
async fn test_transactions_follow_the_same_rules() {
    let store = PendingTransactionStore::new();
    let announced = store.store_transaction_hash(hash(1), 10).await;
    let lonely = store.store_transaction_hash(hash(2), 5).await;
    store.add_node_inventory(node(1), announced).await;
    assert!(store.nodes_have_transaction_inventory(&[node(1)], &hash(1)).await);
    assert!(!store.nodes_have_transaction_inventory(&[node(2)], &hash(1)).await);

    assert_eq!(
        store.select_incomplete_pending_transactions(&[node(1)], 10, 1_000).await,
        vec![(announced, node(1))]
    );
    assert_eq!(store.purge_unlocatable_pending_transactions(&[node(1)]).await, vec![lonely]);

    let transaction = coinbase(7);
    let id = store.store_transaction(transaction.clone(), 0).await;
    assert_eq!(store.select_candidate_pending_transaction_id().await, Some(id));
    let entry = store.delete_pending_transaction(id).await.unwrap();
    assert_eq!(entry.data, Some(transaction));
}

#[test]
fn test_block_queue_drops_instead_of_buffering() {
    let genesis = genesis();
    let blocks = chain_from(genesis.hash(), 3, 1);
    let (a, b, c) = (&blocks[0], &blocks[1], &blocks[2]);
    let queue = BlockQueue::with_anchor(genesis.hash());

    assert!(queue.add_block(a.clone()));
    assert!(!queue.add_block(c.clone()));
    assert_eq!(queue.get_next_block().map(|block| block.hash()), Some(a.hash()));
    assert!(queue.get_next_block().is_none());

    // C was not held back: B is accepted but C never reappears
    assert!(queue.add_block(b.clone()));
    assert_eq!(queue.get_next_block().map(|block| block.hash()), Some(b.hash()));
    assert!(queue.get_next_block().is_none());
    assert_eq!(queue.peek_tail_hash(), Some(b.hash()));
}

fn indexed_hash(index: u16) -> Hash {
    let mut bytes = [0u8; 32];
    bytes[..2].copy_from_slice(&index.to_le_bytes());
    bytes[31] = 0xee;
    Hash::new(bytes)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_plans_stay_consistent_during_purge() {
    let store = Arc::new(PendingBlockStore::new());
    let heights: Arc<HashMap<Hash, u64>> =
        Arc::new((1..=200u16).map(|i| (indexed_hash(i), u64::from(i))).collect());

    // 1..=100 nobody connected announced; 101..=200 announced by node 1
    for i in 1..=200u16 {
        let id = store.store_block_hash(indexed_hash(i), None, i64::from(i)).await;
        if i > 100 {
            store.add_node_inventory(node(1), id).await;
        }
    }
    let whole = vec![PendingBlockRange {
        start: indexed_hash(1),
        end: Some(indexed_hash(100)),
    }];

    let mut readers = Vec::new();
    for _ in 0..4 {
        let store = Arc::clone(&store);
        let heights = Arc::clone(&heights);
        let whole = whole.clone();
        readers.push(tokio::spawn(async move {
            for _ in 0..50 {
                let plan = store
                    .select_priority_pending_blocks_with_unknown_node_inventory(&[node(1)], |h| {
                        heights.get(h).copied()
                    })
                    .await;
                // The purge is one critical section: never a partial plan
                assert!(plan.is_empty() || plan == whole, "torn plan: {:?}", plan);
                tokio::task::yield_now().await;
            }
        }));
    }

    let purger = {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            store.purge_unlocatable_pending_blocks(&[node(1)]).await
        })
    };

    for reader in readers {
        reader.await.unwrap();
    }
    let purged = purger.await.unwrap();
    assert_eq!(purged.len(), 100);
    assert_eq!(store.len().await, 100);
    assert!(store
        .select_priority_pending_blocks_with_unknown_node_inventory(&[node(1)], |h| heights.get(h).copied())
        .await
        .is_empty());
    for i in 101..=200u16 {
        assert!(store.pending_block_exists(&indexed_hash(i)).await);
    }
}
