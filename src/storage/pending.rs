//! Staging for announced and downloaded blocks/transactions
//!
//! An entry without data means "known, not downloaded yet"; with data it
//! means "downloaded, waiting to be placed". Each store owns its own
//! `RwLock`: queries share it, mutations take it exclusively.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use tokio::sync::RwLock;
use tracing::debug;

use crate::primitives::{
    Block, Hash, IdSequence, NodeId, PendingBlockId, PendingTransactionId, Transaction,
};
use crate::utils::current_timestamp;

/// Added to an entry's priority each time its download fails
pub const FAILED_DOWNLOAD_PRIORITY_PENALTY: i64 = 60;

/// Minimum seconds between download attempts of one entry
pub const DEFAULT_DOWNLOAD_RETRY_SECS: u64 = 5;

/// Most entries considered for one download plan
pub const MAX_DOWNLOAD_PLAN_ENTRIES: usize = 500;

/// Height span of one planned range
pub const MAX_DOWNLOAD_RANGE_HEIGHT: u64 = 500;

pub trait PendingKey: Copy + Ord + Eq + std::hash::Hash + fmt::Debug + fmt::Display {
    fn from_raw(value: i64) -> Option<Self>;
}

impl PendingKey for PendingBlockId {
    fn from_raw(value: i64) -> Option<Self> {
        Self::wrap(value)
    }
}

impl PendingKey for PendingTransactionId {
    fn from_raw(value: i64) -> Option<Self> {
        Self::wrap(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry<K, T> {
    pub id: K,
    pub hash: Hash,
    /// Parent block; always `None` for transactions
    pub previous_block_hash: Option<Hash>,
    pub data: Option<T>,
    /// Lower is sooner
    pub priority: i64,
    pub failed_download_count: u32,
    pub last_download_attempt: Option<u64>,
    pub created_at: u64,
}

impl<K, T> PendingEntry<K, T> {
    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }
}

pub type PendingBlock = PendingEntry<PendingBlockId, Block>;
pub type PendingTransaction = PendingEntry<PendingTransactionId, Transaction>;

/// Hash range to locate with getblocks; `end` is `None` for a lone entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingBlockRange {
    pub start: Hash,
    pub end: Option<Hash>,
}

#[derive(Debug)]
struct PendingTable<K, T> {
    entries: BTreeMap<K, PendingEntry<K, T>>,
    by_hash: HashMap<Hash, K>,
    /// Connected or formerly connected nodes that announced each entry
    inventory: HashMap<K, BTreeSet<NodeId>>,
    ids: IdSequence,
}

impl<K: PendingKey, T> Default for PendingTable<K, T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            by_hash: HashMap::new(),
            inventory: HashMap::new(),
            ids: IdSequence::new(),
        }
    }
}

impl<K: PendingKey, T> PendingTable<K, T> {
    fn allocate_id(&mut self) -> K {
        loop {
            if let Some(id) = K::from_raw(self.ids.next_value()) {
                return id;
            }
        }
    }

    fn insert(&mut self, hash: Hash, previous: Option<Hash>, priority: i64) -> K {
        if let Some(id) = self.by_hash.get(&hash).copied() {
            if let (Some(previous), Some(entry)) = (previous, self.entries.get_mut(&id)) {
                entry.previous_block_hash = Some(previous);
            }
            return id;
        }

        let id = self.allocate_id();
        self.entries.insert(
            id,
            PendingEntry {
                id,
                hash,
                previous_block_hash: previous,
                data: None,
                priority,
                failed_download_count: 0,
                last_download_attempt: None,
                created_at: current_timestamp(),
            },
        );
        self.by_hash.insert(hash, id);
        id
    }

    fn remove(&mut self, id: K) -> Option<PendingEntry<K, T>> {
        let entry = self.entries.remove(&id)?;
        self.by_hash.remove(&entry.hash);
        self.inventory.remove(&id);
        Some(entry)
    }

    fn remove_where<F>(&mut self, predicate: F) -> Vec<K>
    where
        F: Fn(&PendingEntry<K, T>, Option<&BTreeSet<NodeId>>) -> bool,
    {
        let doomed: Vec<K> = self
            .entries
            .values()
            .filter(|entry| predicate(entry, self.inventory.get(&entry.id)))
            .map(|entry| entry.id)
            .collect();
        for id in &doomed {
            self.remove(*id);
        }
        doomed
    }

    /// Entries by priority, then id
    fn by_priority(&self) -> Vec<&PendingEntry<K, T>> {
        let mut entries: Vec<_> = self.entries.values().collect();
        entries.sort_by_key(|entry| (entry.priority, entry.id));
        entries
    }

    fn announced_by_any(&self, id: K, nodes: &[NodeId]) -> bool {
        self.inventory
            .get(&id)
            .map(|announcers| nodes.iter().any(|node| announcers.contains(node)))
            .unwrap_or(false)
    }

    fn first_announcer(&self, id: K, nodes: &[NodeId]) -> Option<NodeId> {
        let announcers = self.inventory.get(&id)?;
        announcers.iter().copied().find(|node| nodes.contains(node))
    }

    fn add_node_inventory(&mut self, node: NodeId, id: K) -> bool {
        if !self.entries.contains_key(&id) {
            return false;
        }
        self.inventory.entry(id).or_default().insert(node)
    }

    fn remove_node(&mut self, node: NodeId) {
        for announcers in self.inventory.values_mut() {
            announcers.remove(&node);
        }
        self.inventory.retain(|_, announcers| !announcers.is_empty());
    }

    fn select_incomplete(&self, connected: &[NodeId], max: usize, now: u64, retry_secs: u64) -> Vec<(K, NodeId)> {
        self.by_priority()
            .into_iter()
            .filter(|entry| !entry.has_data())
            .filter(|entry| now.saturating_sub(entry.last_download_attempt.unwrap_or(0)) > retry_secs)
            .filter_map(|entry| {
                self.first_announcer(entry.id, connected)
                    .map(|node| (entry.id, node))
            })
            .take(max)
            .collect()
    }

    fn increment_failed_download_count(&mut self, id: K) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.failed_download_count += 1;
            entry.priority += FAILED_DOWNLOAD_PRIORITY_PENALTY;
        }
    }
}

/// Staging store for blocks
#[derive(Debug)]
pub struct PendingBlockStore {
    table: RwLock<PendingTable<PendingBlockId, Block>>,
    retry_secs: u64,
}

impl Default for PendingBlockStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingBlockStore {
    pub fn new() -> Self {
        Self::with_retry_interval(DEFAULT_DOWNLOAD_RETRY_SECS)
    }

    pub fn with_retry_interval(retry_secs: u64) -> Self {
        Self {
            table: RwLock::new(PendingTable::default()),
            retry_secs,
        }
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.table.read().await.entries.is_empty()
    }

    pub async fn get_pending_block_id(&self, hash: &Hash) -> Option<PendingBlockId> {
        self.table.read().await.by_hash.get(hash).copied()
    }

    pub async fn pending_block_exists(&self, hash: &Hash) -> bool {
        self.table.read().await.by_hash.contains_key(hash)
    }

    pub async fn has_block_data(&self, id: PendingBlockId) -> bool {
        self.table
            .read()
            .await
            .entries
            .get(&id)
            .map(PendingEntry::has_data)
            .unwrap_or(false)
    }

    pub async fn get_pending_block(&self, id: PendingBlockId) -> Option<PendingBlock> {
        self.table.read().await.entries.get(&id).cloned()
    }

    pub async fn get_pending_block_ids_with_previous_block_hash(&self, previous: &Hash) -> Vec<PendingBlockId> {
        self.table
            .read()
            .await
            .entries
            .values()
            .filter(|entry| entry.previous_block_hash.as_ref() == Some(previous))
            .map(|entry| entry.id)
            .collect()
    }

    /// Record a block hash. Storing a known hash returns its id and fills in
    /// `previous` when given.
    pub async fn store_block_hash(&self, hash: Hash, previous: Option<Hash>, priority: i64) -> PendingBlockId {
        self.table.write().await.insert(hash, previous, priority)
    }

    /// Record a downloaded block; new entries are prioritized by block time.
    pub async fn store_block(&self, block: Block) -> PendingBlockId {
        let hash = block.hash();
        let previous = block.previous_block_hash();
        let mut table = self.table.write().await;
        let id = table.insert(hash, Some(previous), block.header.timestamp as i64);
        if let Some(entry) = table.entries.get_mut(&id) {
            entry.data = Some(block);
        }
        debug!("Stored pending block {} ({})", hash, id);
        id
    }

    pub async fn add_node_inventory(&self, node: NodeId, id: PendingBlockId) -> bool {
        self.table.write().await.add_node_inventory(node, id)
    }

    pub async fn remove_node(&self, node: NodeId) {
        self.table.write().await.remove_node(node);
    }

    pub async fn nodes_have_block_inventory(&self, nodes: &[NodeId], hash: &Hash) -> bool {
        let table = self.table.read().await;
        match table.by_hash.get(hash) {
            Some(id) => table.announced_by_any(*id, nodes),
            None => false,
        }
    }

    /// Nodes that announced `id`
    pub async fn announcers(&self, id: PendingBlockId) -> Vec<NodeId> {
        self.table
            .read()
            .await
            .inventory
            .get(&id)
            .map(|nodes| nodes.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Ranges of missing blocks that no connected node has announced.
    ///
    /// Entries are taken by priority; consecutive entries whose height is
    /// known and within [`MAX_DOWNLOAD_RANGE_HEIGHT`] of the range start are
    /// merged into one range. Entries of unknown height stand alone.
    pub async fn select_priority_pending_blocks_with_unknown_node_inventory<F>(
        &self,
        connected: &[NodeId],
        height_of: F,
    ) -> Vec<PendingBlockRange>
    where
        F: Fn(&Hash) -> Option<u64>,
    {
        let table = self.table.read().await;
        let candidates = table
            .by_priority()
            .into_iter()
            .filter(|entry| !entry.has_data() && !table.announced_by_any(entry.id, connected))
            .take(MAX_DOWNLOAD_PLAN_ENTRIES);

        let mut plan = Vec::new();
        // (range, height of range start)
        let mut current: Option<(PendingBlockRange, Option<u64>)> = None;
        for entry in candidates {
            let height = height_of(&entry.hash);
            if let (Some((range, Some(start_height))), Some(height)) = (current.as_mut(), height) {
                if height >= *start_height && height - *start_height < MAX_DOWNLOAD_RANGE_HEIGHT {
                    range.end = Some(entry.hash);
                    continue;
                }
            }
            if let Some((range, _)) = current.take() {
                plan.push(range);
            }
            current = Some((
                PendingBlockRange {
                    start: entry.hash,
                    end: None,
                },
                height,
            ));
        }
        if let Some((range, _)) = current {
            plan.push(range);
        }
        plan
    }

    /// Missing blocks a connected node announced, not attempted within the
    /// retry interval, each paired with one announcing node.
    pub async fn select_incomplete_pending_blocks(
        &self,
        connected: &[NodeId],
        max: usize,
        now: u64,
    ) -> Vec<(PendingBlockId, NodeId)> {
        self.table
            .read()
            .await
            .select_incomplete(connected, max, now, self.retry_secs)
    }

    /// Downloaded block whose parent `is_known`, lowest priority first
    pub async fn select_candidate_pending_block_id<F>(&self, is_known: F) -> Option<PendingBlockId>
    where
        F: Fn(&Hash) -> bool,
    {
        let table = self.table.read().await;
        table
            .by_priority()
            .into_iter()
            .filter(|entry| entry.has_data())
            .find(|entry| entry.previous_block_hash.map(|hash| is_known(&hash)).unwrap_or(false))
            .map(|entry| entry.id)
    }

    pub async fn increment_failed_download_count(&self, id: PendingBlockId) {
        self.table.write().await.increment_failed_download_count(id);
    }

    pub async fn update_last_download_attempt_time(&self, id: PendingBlockId, now: u64) {
        if let Some(entry) = self.table.write().await.entries.get_mut(&id) {
            entry.last_download_attempt = Some(now);
        }
    }

    pub async fn set_priority(&self, id: PendingBlockId, priority: i64) {
        if let Some(entry) = self.table.write().await.entries.get_mut(&id) {
            entry.priority = priority;
        }
    }

    /// Drop missing blocks that failed to download more than `max_failed` times.
    pub async fn purge_failed_pending_blocks(&self, max_failed: u32) -> Vec<PendingBlockId> {
        let purged = self
            .table
            .write()
            .await
            .remove_where(|entry, _| !entry.has_data() && entry.failed_download_count > max_failed);
        if !purged.is_empty() {
            debug!("Purged {} failed pending blocks", purged.len());
        }
        purged
    }

    /// Drop missing blocks no connected node can serve.
    pub async fn purge_unlocatable_pending_blocks(&self, connected: &[NodeId]) -> Vec<PendingBlockId> {
        let purged = self.table.write().await.remove_where(|entry, announcers| {
            let locatable = announcers
                .map(|nodes| connected.iter().any(|node| nodes.contains(node)))
                .unwrap_or(false);
            !entry.has_data() && !locatable
        });
        if !purged.is_empty() {
            debug!("Purged {} unlocatable pending blocks", purged.len());
        }
        purged
    }

    pub async fn pending_block_hashes(&self) -> Vec<Hash> {
        self.table.read().await.by_hash.keys().copied().collect()
    }

    /// Drop entries for blocks that are already committed.
    pub async fn cleanup_pending_blocks<F>(&self, is_committed: F) -> Vec<PendingBlockId>
    where
        F: Fn(&Hash) -> bool,
    {
        self.table
            .write()
            .await
            .remove_where(|entry, _| is_committed(&entry.hash))
    }

    pub async fn delete_pending_block(&self, id: PendingBlockId) -> Option<PendingBlock> {
        self.table.write().await.remove(id)
    }
}

/// Staging store for transactions
#[derive(Debug)]
pub struct PendingTransactionStore {
    table: RwLock<PendingTable<PendingTransactionId, Transaction>>,
    retry_secs: u64,
}

impl Default for PendingTransactionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingTransactionStore {
    pub fn new() -> Self {
        Self::with_retry_interval(DEFAULT_DOWNLOAD_RETRY_SECS)
    }

    pub fn with_retry_interval(retry_secs: u64) -> Self {
        Self {
            table: RwLock::new(PendingTable::default()),
            retry_secs,
        }
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.entries.len()
    }

    pub async fn get_pending_transaction_id(&self, hash: &Hash) -> Option<PendingTransactionId> {
        self.table.read().await.by_hash.get(hash).copied()
    }

    pub async fn pending_transaction_exists(&self, hash: &Hash) -> bool {
        self.table.read().await.by_hash.contains_key(hash)
    }

    pub async fn has_transaction_data(&self, id: PendingTransactionId) -> bool {
        self.table
            .read()
            .await
            .entries
            .get(&id)
            .map(PendingEntry::has_data)
            .unwrap_or(false)
    }

    pub async fn get_pending_transaction(&self, id: PendingTransactionId) -> Option<PendingTransaction> {
        self.table.read().await.entries.get(&id).cloned()
    }

    pub async fn store_transaction_hash(&self, hash: Hash, priority: i64) -> PendingTransactionId {
        self.table.write().await.insert(hash, None, priority)
    }

    pub async fn store_transaction(&self, transaction: Transaction, priority: i64) -> PendingTransactionId {
        let mut table = self.table.write().await;
        let id = table.insert(transaction.hash(), None, priority);
        if let Some(entry) = table.entries.get_mut(&id) {
            entry.data = Some(transaction);
        }
        id
    }

    pub async fn add_node_inventory(&self, node: NodeId, id: PendingTransactionId) -> bool {
        self.table.write().await.add_node_inventory(node, id)
    }

    pub async fn remove_node(&self, node: NodeId) {
        self.table.write().await.remove_node(node);
    }

    pub async fn nodes_have_transaction_inventory(&self, nodes: &[NodeId], hash: &Hash) -> bool {
        let table = self.table.read().await;
        match table.by_hash.get(hash) {
            Some(id) => table.announced_by_any(*id, nodes),
            None => false,
        }
    }

    pub async fn announcers(&self, id: PendingTransactionId) -> Vec<NodeId> {
        self.table
            .read()
            .await
            .inventory
            .get(&id)
            .map(|nodes| nodes.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn select_incomplete_pending_transactions(
        &self,
        connected: &[NodeId],
        max: usize,
        now: u64,
    ) -> Vec<(PendingTransactionId, NodeId)> {
        self.table
            .read()
            .await
            .select_incomplete(connected, max, now, self.retry_secs)
    }

    /// Downloaded transaction with the lowest priority
    pub async fn select_candidate_pending_transaction_id(&self) -> Option<PendingTransactionId> {
        self.table
            .read()
            .await
            .by_priority()
            .into_iter()
            .find(|entry| entry.has_data())
            .map(|entry| entry.id)
    }

    pub async fn increment_failed_download_count(&self, id: PendingTransactionId) {
        self.table.write().await.increment_failed_download_count(id);
    }

    pub async fn update_last_download_attempt_time(&self, id: PendingTransactionId, now: u64) {
        if let Some(entry) = self.table.write().await.entries.get_mut(&id) {
            entry.last_download_attempt = Some(now);
        }
    }

    pub async fn set_priority(&self, id: PendingTransactionId, priority: i64) {
        if let Some(entry) = self.table.write().await.entries.get_mut(&id) {
            entry.priority = priority;
        }
    }

    pub async fn purge_failed_pending_transactions(&self, max_failed: u32) -> Vec<PendingTransactionId> {
        self.table
            .write()
            .await
            .remove_where(|entry, _| !entry.has_data() && entry.failed_download_count > max_failed)
    }

    pub async fn purge_unlocatable_pending_transactions(&self, connected: &[NodeId]) -> Vec<PendingTransactionId> {
        self.table.write().await.remove_where(|entry, announcers| {
            let locatable = announcers
                .map(|nodes| connected.iter().any(|node| nodes.contains(node)))
                .unwrap_or(false);
            !entry.has_data() && !locatable
        })
    }

    pub async fn cleanup_pending_transactions<F>(&self, is_committed: F) -> Vec<PendingTransactionId>
    where
        F: Fn(&Hash) -> bool,
    {
        self.table
            .write()
            .await
            .remove_where(|entry, _| is_committed(&entry.hash))
    }

    pub async fn delete_pending_transaction(&self, id: PendingTransactionId) -> Option<PendingTransaction> {
        self.table.write().await.remove(id)
    }

    /// Remove and return the downloaded transaction with the lowest priority.
    pub async fn take_next_transaction(&self) -> Option<Transaction> {
        let mut table = self.table.write().await;
        let id = table
            .by_priority()
            .into_iter()
            .find(|entry| entry.has_data())
            .map(|entry| entry.id)?;
        table.remove(id).and_then(|entry| entry.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(byte: u8) -> Hash {
        Hash::new([byte; 32])
    }

    fn node(value: i64) -> NodeId {
        NodeId::wrap(value).unwrap()
    }

    #[tokio::test]
    async fn test_store_block_hash_is_idempotent() {
        let store = PendingBlockStore::new();
        let first = store.store_block_hash(hash(1), None, 100).await;
        let second = store.store_block_hash(hash(1), Some(hash(0)), 5).await;
        assert_eq!(first, second);

        let entry = store.get_pending_block(first).await.unwrap();
        assert_eq!(entry.previous_block_hash, Some(hash(0)));
        assert_eq!(entry.priority, 100);
        assert_eq!(
            store.get_pending_block_ids_with_previous_block_hash(&hash(0)).await,
            vec![first]
        );
    }

    #[tokio::test]
    async fn test_failure_bumps_priority() {
        let store = PendingBlockStore::new();
        let id = store.store_block_hash(hash(1), None, 1_000).await;
        store.increment_failed_download_count(id).await;
        store.increment_failed_download_count(id).await;
        let entry = store.get_pending_block(id).await.unwrap();
        assert_eq!(entry.failed_download_count, 2);
        assert_eq!(entry.priority, 1_120);
    }

    #[tokio::test]
    async fn test_incomplete_selection_respects_retry_interval() {
        let store = PendingBlockStore::new();
        let late = store.store_block_hash(hash(1), None, 20).await;
        let early = store.store_block_hash(hash(2), None, 10).await;
        let unannounced = store.store_block_hash(hash(3), None, 0).await;
        store.add_node_inventory(node(1), late).await;
        store.add_node_inventory(node(1), early).await;

        let plan = store.select_incomplete_pending_blocks(&[node(1)], 10, 1_000).await;
        assert_eq!(plan, vec![(early, node(1)), (late, node(1))]);
        assert!(!plan.iter().any(|(id, _)| *id == unannounced));

        store.update_last_download_attempt_time(early, 998).await;
        let plan = store.select_incomplete_pending_blocks(&[node(1)], 10, 1_000).await;
        assert_eq!(plan, vec![(late, node(1))]);

        // Disconnected announcers do not count
        assert!(store.select_incomplete_pending_blocks(&[node(2)], 10, 1_000).await.is_empty());
    }

    #[tokio::test]
    async fn test_purges() {
        let store = PendingBlockStore::new();
        let failing = store.store_block_hash(hash(1), None, 0).await;
        let orphaned = store.store_block_hash(hash(2), None, 0).await;
        store.add_node_inventory(node(1), failing).await;
        store.add_node_inventory(node(2), orphaned).await;
        for _ in 0..3 {
            store.increment_failed_download_count(failing).await;
        }

        assert_eq!(store.purge_failed_pending_blocks(2).await, vec![failing]);
        store.remove_node(node(2)).await;
        assert_eq!(store.purge_unlocatable_pending_blocks(&[node(1)]).await, vec![orphaned]);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_transaction_candidate_needs_data() {
        let store = PendingTransactionStore::new();
        store.store_transaction_hash(hash(9), 0).await;
        assert!(store.select_candidate_pending_transaction_id().await.is_none());
    }
}
