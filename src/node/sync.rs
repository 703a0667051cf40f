//! Block and transaction synchronization
//!
//! The coordinator owns the in-flight table and the pending stores. Peer
//! tasks feed it [`PeerEvent`]s; it answers with getdata/getblocks through a
//! [`PeerTransport`], and moves downloaded blocks whose parent is known into
//! the block store, the chain and the [`BlockQueue`], in that order.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use crate::config::SyncConfig;
use crate::network::message::{
    BlockMessage, GetBlocksMessage, GetDataMessage, HeadersMessage, InventoryMessage,
    NotFoundMessage, PingMessage, PongMessage, RejectMessage, TransactionMessage,
};
use crate::network::{InventoryItem, InventoryItemType, PeerEvent, PeerTransport, ProtocolMessage};
use crate::node::{Clock, InFlightRequests, SyncError, SyncResult, SystemClock};
use crate::primitives::{BlockHeader, Hash, NodeId, Transaction};
use crate::storage::{
    BlockQueue, BlockStore, Blockchain, PendingBlockStore, PendingTransactionStore,
};
use crate::utils::result_to_option;

/// Coarse progress of the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    /// No peers yet
    Initial,
    /// Downloading announced blocks
    Blocks,
    /// Nothing pending or in flight
    Synced,
    Error(String),
}

pub struct SyncCoordinator<T: PeerTransport, S: BlockStore, C: Clock = SystemClock> {
    transport: Arc<T>,
    store: Arc<S>,
    clock: C,
    config: SyncConfig,
    chain: Arc<RwLock<Blockchain>>,
    pending_blocks: PendingBlockStore,
    pending_transactions: Arc<PendingTransactionStore>,
    block_queue: Arc<BlockQueue>,
    in_flight: InFlightRequests,
    peers: BTreeSet<NodeId>,
    /// getblocks sent to locate hashes no connected peer announced
    locate_requests: HashMap<Hash, Instant>,
    state: SyncState,
}

impl<T: PeerTransport, S: BlockStore> SyncCoordinator<T, S, SystemClock> {
    pub fn new(transport: Arc<T>, store: Arc<S>, genesis: &BlockHeader, config: SyncConfig) -> Self {
        Self::with_clock(transport, store, genesis, config, SystemClock)
    }
}

impl<T: PeerTransport, S: BlockStore, C: Clock> SyncCoordinator<T, S, C> {
    pub fn with_clock(
        transport: Arc<T>,
        store: Arc<S>,
        genesis: &BlockHeader,
        config: SyncConfig,
        clock: C,
    ) -> Self {
        let chain = Blockchain::new(genesis);
        let block_queue = Arc::new(BlockQueue::with_anchor(chain.genesis_hash()));
        Self {
            transport,
            store,
            clock,
            in_flight: InFlightRequests::new(config.max_blocks_in_flight_per_peer),
            pending_blocks: PendingBlockStore::with_retry_interval(config.download_retry_secs),
            pending_transactions: Arc::new(PendingTransactionStore::with_retry_interval(
                config.download_retry_secs,
            )),
            config,
            chain: Arc::new(RwLock::new(chain)),
            block_queue,
            peers: BTreeSet::new(),
            locate_requests: HashMap::new(),
            state: SyncState::Initial,
        }
    }

    pub fn chain(&self) -> Arc<RwLock<Blockchain>> {
        Arc::clone(&self.chain)
    }

    /// Consumer side of the validated block stream
    pub fn block_queue(&self) -> Arc<BlockQueue> {
        Arc::clone(&self.block_queue)
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn pending_blocks(&self) -> &PendingBlockStore {
        &self.pending_blocks
    }

    pub fn pending_transactions(&self) -> &PendingTransactionStore {
        &self.pending_transactions
    }

    /// Consumer side of downloaded transactions
    pub fn transaction_pool(&self) -> Arc<PendingTransactionStore> {
        Arc::clone(&self.pending_transactions)
    }

    pub fn in_flight(&self) -> &InFlightRequests {
        &self.in_flight
    }

    pub fn peers(&self) -> Vec<NodeId> {
        self.peers.iter().copied().collect()
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    fn transition_to(&mut self, new_state: SyncState) {
        if self.state != new_state {
            debug!("Sync state transition: {:?} -> {:?}", self.state, new_state);
            self.state = new_state;
        }
    }

    async fn send(&self, node: NodeId, message: ProtocolMessage) -> SyncResult<()> {
        self.transport
            .send(node, message)
            .await
            .map_err(|e| SyncError::Transport(format!("node {}: {}", node, e)))
    }

    /// Register a peer and ask it for blocks past our tip.
    pub async fn peer_connected(&mut self, node: NodeId) -> SyncResult<()> {
        if !self.peers.insert(node) {
            return Ok(());
        }
        info!("Peer {} connected ({} total)", node, self.peers.len());
        if self.state == SyncState::Initial {
            self.transition_to(SyncState::Blocks);
        }
        let locator = self.locator().await;
        let message = ProtocolMessage::GetBlocks(GetBlocksMessage::new(locator));
        let sent = self.send(node, message).await;
        result_to_option(sent, "Failed to send getblocks");
        Ok(())
    }

    /// Forget a peer. Its claims are released so another announcer can be
    /// asked, and the transport drops its connection handle.
    pub async fn peer_disconnected(&mut self, node: NodeId) {
        self.transport.disconnect(node).await;
        if !self.peers.remove(&node) {
            return;
        }
        self.pending_blocks.remove_node(node).await;
        self.pending_transactions.remove_node(node).await;
        let released = self.in_flight.release_node(node);
        info!(
            "Peer {} disconnected, released {} in-flight requests",
            node,
            released.len()
        );
        if self.peers.is_empty() {
            self.transition_to(SyncState::Initial);
        }
    }

    pub async fn handle_event(&mut self, event: PeerEvent) -> SyncResult<()> {
        match event {
            PeerEvent::Connected {
                node,
                addr,
                version,
            } => {
                debug!(
                    "Peer {} at {} runs {} at height {}",
                    node,
                    addr,
                    version.user_agent(),
                    version.start_height()
                );
                self.peer_connected(node).await
            }
            PeerEvent::Message { node, message } => self.handle_message(node, message).await,
            PeerEvent::Disconnected { node } => {
                self.peer_disconnected(node).await;
                Ok(())
            }
        }
    }

    pub async fn handle_message(&mut self, node: NodeId, message: ProtocolMessage) -> SyncResult<()> {
        match message {
            ProtocolMessage::Inventory(inventory) => self.handle_inventory(node, inventory).await,
            ProtocolMessage::Block(block) => self.handle_block(node, block).await,
            ProtocolMessage::Transaction(transaction) => {
                self.handle_transaction(node, transaction).await;
                Ok(())
            }
            ProtocolMessage::NotFound(not_found) => {
                self.handle_not_found(node, not_found).await;
                Ok(())
            }
            ProtocolMessage::Ping(ping) => {
                self.handle_ping(node, ping).await;
                Ok(())
            }
            ProtocolMessage::Reject(reject) => {
                self.handle_reject(node, &reject);
                Ok(())
            }
            ProtocolMessage::Headers(headers) => self.handle_headers(node, headers).await,
            other => {
                debug!("Ignoring {} from node {}", other.command().as_str(), node);
                Ok(())
            }
        }
    }

    async fn handle_inventory(&mut self, node: NodeId, inventory: InventoryMessage) -> SyncResult<()> {
        if inventory.len() > self.config.max_inventory_count {
            warn!(
                "Node {} sent {} inventory items, limit is {}",
                node,
                inventory.len(),
                self.config.max_inventory_count
            );
            return Ok(());
        }

        let now = self.clock.unix_timestamp() as i64;
        let mut staged = 0usize;
        for item in inventory.into_items() {
            if item.item_type.is_block() {
                if self.chain.read().await.contains(&item.hash) {
                    continue;
                }
                let id = self.pending_blocks.store_block_hash(item.hash, None, now).await;
                self.pending_blocks.add_node_inventory(node, id).await;
                staged += 1;
            } else if item.item_type == InventoryItemType::Transaction {
                let id = self.pending_transactions.store_transaction_hash(item.hash, now).await;
                self.pending_transactions.add_node_inventory(node, id).await;
                staged += 1;
            } else {
                trace!("Ignoring inventory {:?} from node {}", item.item_type, node);
            }
        }
        debug!("Node {} announced {} unknown items", node, staged);
        self.request_missing_data().await
    }

    async fn handle_headers(&mut self, node: NodeId, headers: HeadersMessage) -> SyncResult<()> {
        for header in headers.headers() {
            let hash = header.hash();
            if self.chain.read().await.contains(&hash) {
                continue;
            }
            let id = self
                .pending_blocks
                .store_block_hash(hash, Some(header.previous_block_hash), i64::from(header.timestamp))
                .await;
            self.pending_blocks.add_node_inventory(node, id).await;
        }
        self.request_missing_data().await
    }

    async fn handle_block(&mut self, node: NodeId, message: BlockMessage) -> SyncResult<()> {
        let block = message.into_block();
        let hash = block.hash();
        self.in_flight.release(&hash);

        if self.chain.read().await.contains(&hash) {
            trace!("Block {} from node {} is already connected", hash, node);
            return Ok(());
        }
        if !block.has_valid_merkle_root() {
            warn!("Block {} from node {} has an invalid merkle root", hash, node);
            if let Some(id) = self.pending_blocks.get_pending_block_id(&hash).await {
                self.pending_blocks.increment_failed_download_count(id).await;
            }
            return Ok(());
        }

        let previous = block.previous_block_hash();
        let id = self.pending_blocks.store_block(block).await;
        self.pending_blocks.add_node_inventory(node, id).await;
        self.promote_pending_blocks().await?;

        if self.pending_blocks.pending_block_exists(&hash).await {
            self.request_orphan_parent(node, &hash, previous).await?;
        }
        Ok(())
    }

    /// Stage and ask for the parent of a held orphan unless it is already
    /// known or pending.
    async fn request_orphan_parent(&mut self, node: NodeId, orphan: &Hash, parent: Hash) -> SyncResult<()> {
        if self.chain.read().await.contains(&parent)
            || self.pending_blocks.pending_block_exists(&parent).await
        {
            return Ok(());
        }
        let priority = match self.pending_blocks.get_pending_block_id(orphan).await {
            Some(id) => match self.pending_blocks.get_pending_block(id).await {
                Some(entry) => entry.priority.saturating_sub(1),
                None => self.clock.unix_timestamp() as i64,
            },
            None => self.clock.unix_timestamp() as i64,
        };
        debug!("Holding orphan {}, requesting parent {}", orphan, parent);
        let id = self.pending_blocks.store_block_hash(parent, None, priority).await;
        self.pending_blocks.add_node_inventory(node, id).await;
        self.request_missing_data().await
    }

    async fn handle_transaction(&mut self, node: NodeId, message: TransactionMessage) {
        let transaction = message.into_transaction();
        let hash = transaction.hash();
        self.in_flight.release(&hash);
        let priority = self.clock.unix_timestamp() as i64;
        let id = self.pending_transactions.store_transaction(transaction, priority).await;
        self.pending_transactions.add_node_inventory(node, id).await;
        trace!("Staged transaction {} from node {}", hash, node);
    }

    async fn handle_not_found(&mut self, node: NodeId, message: NotFoundMessage) {
        for item in message.items() {
            self.in_flight.release(&item.hash);
            self.record_failure(item).await;
            debug!("Node {} does not have {}", node, item.hash);
        }
    }

    async fn handle_ping(&self, node: NodeId, ping: PingMessage) {
        let pong = ProtocolMessage::Pong(PongMessage::reply_to(&ping));
        let sent = self.send(node, pong).await;
        result_to_option(sent, "Failed to answer ping");
    }

    fn handle_reject(&self, node: NodeId, reject: &RejectMessage) {
        warn!(
            "Node {} rejected {}: {:?} ({}) {}",
            node,
            reject.rejected_command(),
            reject.code(),
            reject.describe(),
            reject.reason()
        );
        if let Some(hash) = reject.rejected_hash() {
            debug!("Rejected item {}", hash);
        }
    }

    async fn record_failure(&self, item: &InventoryItem) {
        if item.item_type.is_block() {
            if let Some(id) = self.pending_blocks.get_pending_block_id(&item.hash).await {
                self.pending_blocks.increment_failed_download_count(id).await;
            }
        } else if let Some(id) = self.pending_transactions.get_pending_transaction_id(&item.hash).await {
            self.pending_transactions.increment_failed_download_count(id).await;
        }
    }

    async fn announcers(&self, item: &InventoryItem) -> Vec<NodeId> {
        if item.item_type.is_block() {
            match self.pending_blocks.get_pending_block_id(&item.hash).await {
                Some(id) => self.pending_blocks.announcers(id).await,
                None => Vec::new(),
            }
        } else {
            match self.pending_transactions.get_pending_transaction_id(&item.hash).await {
                Some(id) => self.pending_transactions.announcers(id).await,
                None => Vec::new(),
            }
        }
    }

    async fn locator(&self) -> Vec<Hash> {
        let mut locator = self.chain.read().await.block_locator();
        locator.truncate(self.config.max_block_hash_count);
        locator
    }

    /// Pick `preferred` if it can take another request, else any other
    /// connected announcer that can.
    fn choose_node(&self, preferred: NodeId, announcers: &[NodeId]) -> Option<NodeId> {
        if self.in_flight.has_capacity(preferred) {
            return Some(preferred);
        }
        announcers
            .iter()
            .copied()
            .find(|node| self.peers.contains(node) && self.in_flight.has_capacity(*node))
    }

    /// Send getdata for incomplete entries announced by connected peers,
    /// then getblocks for missing blocks nobody connected has announced.
    pub async fn request_missing_data(&mut self) -> SyncResult<()> {
        if self.peers.is_empty() {
            return Ok(());
        }
        let connected = self.peers();
        let now = self.clock.now();
        let unix_now = self.clock.unix_timestamp();
        let mut batches: BTreeMap<NodeId, Vec<InventoryItem>> = BTreeMap::new();

        let blocks = self
            .pending_blocks
            .select_incomplete_pending_blocks(&connected, self.config.max_incomplete_batch, unix_now)
            .await;
        for (id, preferred) in blocks {
            let entry = match self.pending_blocks.get_pending_block(id).await {
                Some(entry) => entry,
                None => continue,
            };
            if self.in_flight.is_in_flight(&entry.hash) {
                continue;
            }
            let announcers = self.pending_blocks.announcers(id).await;
            let node = match self.choose_node(preferred, &announcers) {
                Some(node) => node,
                None => continue,
            };
            let item = InventoryItem::block(entry.hash);
            if self.in_flight.claim(item, node, now) {
                self.pending_blocks.update_last_download_attempt_time(id, unix_now).await;
                batches.entry(node).or_default().push(item);
            }
        }

        let transactions = self
            .pending_transactions
            .select_incomplete_pending_transactions(&connected, self.config.max_incomplete_batch, unix_now)
            .await;
        for (id, preferred) in transactions {
            let entry = match self.pending_transactions.get_pending_transaction(id).await {
                Some(entry) => entry,
                None => continue,
            };
            if self.in_flight.is_in_flight(&entry.hash) {
                continue;
            }
            let announcers = self.pending_transactions.announcers(id).await;
            let node = match self.choose_node(preferred, &announcers) {
                Some(node) => node,
                None => continue,
            };
            let item = InventoryItem::transaction(entry.hash);
            if self.in_flight.claim(item, node, now) {
                self.pending_transactions
                    .update_last_download_attempt_time(id, unix_now)
                    .await;
                batches.entry(node).or_default().push(item);
            }
        }

        for (node, items) in batches {
            for chunk in items.chunks(self.config.max_inventory_count.max(1)) {
                debug!("Requesting {} items from node {}", chunk.len(), node);
                let message = ProtocolMessage::GetData(GetDataMessage::with_items(chunk.to_vec()));
                if let Err(e) = self.send(node, message).await {
                    warn!("{}", e);
                    for item in chunk {
                        self.in_flight.release(&item.hash);
                    }
                }
            }
        }

        self.locate_unannounced_blocks(&connected, now).await
    }

    async fn locate_unannounced_blocks(&mut self, connected: &[NodeId], now: Instant) -> SyncResult<()> {
        let ranges = {
            let chain = self.chain.read().await;
            self.pending_blocks
                .select_priority_pending_blocks_with_unknown_node_inventory(connected, |hash| {
                    chain.height_of(hash)
                })
                .await
        };
        if ranges.is_empty() {
            return Ok(());
        }
        let timeout = Duration::from_secs(self.config.request_timeout_secs);
        self.locate_requests
            .retain(|_, sent| now.saturating_duration_since(*sent) < timeout);

        let locator = self.locator().await;
        let mut peers = connected.iter().copied().cycle();
        for range in ranges {
            if self.locate_requests.contains_key(&range.start) {
                continue;
            }
            let node = match peers.next() {
                Some(node) => node,
                None => break,
            };
            let stop = range.end.unwrap_or(Hash::ZERO);
            let message =
                ProtocolMessage::GetBlocks(GetBlocksMessage::with_stop_hash(locator.clone(), stop));
            let sent = self.send(node, message).await;
            if result_to_option(sent, "Failed to send getblocks").is_some() {
                self.locate_requests.insert(range.start, now);
            }
        }
        Ok(())
    }

    /// Re-request timed-out items once from another announcer, otherwise
    /// give up on the claim and count a failure.
    pub async fn check_timeouts(&mut self) -> SyncResult<()> {
        let now = self.clock.now();
        let timeout = Duration::from_secs(self.config.request_timeout_secs);
        for request in self.in_flight.expired(now, timeout) {
            let hash = request.item.hash;
            let alternative = if request.retried {
                None
            } else {
                self.announcers(&request.item)
                    .await
                    .into_iter()
                    .find(|node| {
                        *node != request.node
                            && self.peers.contains(node)
                            && self.in_flight.has_capacity(*node)
                    })
            };

            match alternative {
                Some(node) => {
                    debug!(
                        "Request for {} to node {} timed out, retrying with node {}",
                        hash, request.node, node
                    );
                    self.in_flight.reassign(&hash, node, now);
                    let message =
                        ProtocolMessage::GetData(GetDataMessage::with_items(vec![request.item]));
                    if let Err(e) = self.send(node, message).await {
                        warn!("{}", e);
                        self.in_flight.release(&hash);
                        self.record_failure(&request.item).await;
                    }
                }
                None => {
                    debug!("Giving up on {} from node {}", hash, request.node);
                    self.in_flight.release(&hash);
                    self.record_failure(&request.item).await;
                }
            }
        }
        Ok(())
    }

    /// Commit, connect and queue every downloaded block whose parent is
    /// known. Returns how many blocks were promoted.
    ///
    /// The chain write lock is held across the store commit, so a header
    /// only becomes visible once its block is durable. A failed commit
    /// leaves the chain untouched and the block pending for the next pass.
    pub async fn promote_pending_blocks(&mut self) -> SyncResult<usize> {
        let mut promoted = 0usize;
        let mut failure = None;
        loop {
            let candidate = {
                let chain = self.chain.read().await;
                self.pending_blocks
                    .select_candidate_pending_block_id(|hash| chain.contains(hash))
                    .await
            };
            let id = match candidate {
                Some(id) => id,
                None => break,
            };
            let block = match self.pending_blocks.get_pending_block(id).await.and_then(|entry| entry.data) {
                Some(block) => block,
                None => {
                    self.pending_blocks.delete_pending_block(id).await;
                    continue;
                }
            };

            let hash = block.hash();
            let placement = {
                let mut chain = self.chain.write().await;
                if let Err(e) = self.store.commit_block(&block).await {
                    warn!("Failed to commit block {}, keeping it pending: {}", hash, e);
                    failure = Some(SyncError::Store(e));
                    break;
                }
                chain.connect_header(&block.header)
            };
            let placement = match placement {
                Ok(placement) => placement,
                Err(e) => {
                    let e = SyncError::from(e);
                    if e.is_fatal() {
                        error!("Chain segments corrupted while connecting {}: {}", hash, e);
                        return Err(e);
                    }
                    warn!("Dropping block {}: {}", hash, e);
                    self.pending_blocks.delete_pending_block(id).await;
                    continue;
                }
            };

            self.pending_blocks.delete_pending_block(id).await;
            if let Some(reorg) = placement.reorg() {
                info!(
                    "Reorganized from segment {} (tip {}) to segment {} (tip {})",
                    reorg.from, reorg.from_tip, reorg.to, reorg.to_tip
                );
            }
            if !self.block_queue.add_block(block) {
                trace!("Block {} is off the queued chain", hash);
            }
            debug!("Connected block {} at height {}", hash, placement.height());
            promoted += 1;
        }

        if promoted > 0 {
            let metadata = self.chain.read().await.all_segment_metadata();
            self.store.store_segment_metadata(metadata).await?;
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(promoted),
        }
    }

    /// Drop entries that failed too often, that no connected peer can
    /// serve, and blocks the store already holds.
    pub async fn prune(&mut self) -> SyncResult<()> {
        let connected = self.peers();
        self.pending_blocks
            .purge_failed_pending_blocks(self.config.max_failed_download_count)
            .await;
        self.pending_transactions
            .purge_failed_pending_transactions(self.config.max_failed_download_count)
            .await;
        self.pending_blocks.purge_unlocatable_pending_blocks(&connected).await;
        self.pending_transactions
            .purge_unlocatable_pending_transactions(&connected)
            .await;

        let mut stored = HashSet::new();
        for hash in self.pending_blocks.pending_block_hashes().await {
            if self.store.has_block(&hash).await? {
                stored.insert(hash);
            }
        }
        let committed = self
            .pending_blocks
            .cleanup_pending_blocks(|hash| stored.contains(hash))
            .await;
        if !committed.is_empty() {
            debug!("Removed {} already committed pending blocks", committed.len());
        }
        Ok(())
    }

    /// Hand the next downloaded transaction to a consumer.
    pub async fn take_pending_transaction(&self) -> Option<Transaction> {
        self.pending_transactions.take_next_transaction().await
    }

    /// One periodic pass: timeouts, pruning, promotion and new requests.
    pub async fn tick(&mut self) -> SyncResult<()> {
        self.check_timeouts().await?;
        self.prune().await?;
        self.promote_pending_blocks().await?;
        self.request_missing_data().await?;
        self.refresh_state().await;
        Ok(())
    }

    async fn refresh_state(&mut self) {
        if self.peers.is_empty() {
            self.transition_to(SyncState::Initial);
        } else if self.in_flight.is_empty() && self.pending_blocks.is_empty().await {
            self.transition_to(SyncState::Synced);
        } else {
            self.transition_to(SyncState::Blocks);
        }
    }

    /// Process peer events and periodic work until shutdown is signalled or
    /// the event channel closes. Only corrupted chain state ends the loop
    /// with an error.
    pub async fn run(
        &mut self,
        mut events: mpsc::UnboundedReceiver<PeerEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> SyncResult<()> {
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.tick_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Sync coordinator started");

        loop {
            let outcome = tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        info!("Peer event channel closed");
                        break;
                    }
                },
                _ = ticker.tick() => self.tick().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Sync coordinator shutting down");
                        break;
                    }
                    continue;
                }
            };

            if let Err(e) = outcome {
                if e.is_fatal() {
                    error!("Sync coordinator stopping: {}", e);
                    self.transition_to(SyncState::Error(e.to_string()));
                    return Err(e);
                }
                warn!("Sync step failed: {}", e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBlockStore;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(NodeId, ProtocolMessage)>>,
    }

    #[async_trait]
    impl PeerTransport for RecordingTransport {
        async fn send(&self, node: NodeId, message: ProtocolMessage) -> Result<()> {
            self.sent.lock().unwrap().push((node, message));
            Ok(())
        }
    }

    fn genesis() -> BlockHeader {
        BlockHeader {
            version: 1,
            previous_block_hash: Hash::ZERO,
            merkle_root: Hash::ZERO,
            timestamp: 1_231_006_505,
            bits: 0x207f_ffff,
            nonce: 2,
        }
    }

    fn node(value: i64) -> NodeId {
        NodeId::wrap(value).unwrap()
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let transport = Arc::new(RecordingTransport::default());
        let store = Arc::new(MemoryBlockStore::new());
        let mut sync = SyncCoordinator::new(transport.clone(), store, &genesis(), SyncConfig::default());

        sync.handle_message(node(1), ProtocolMessage::Ping(PingMessage::with_nonce(42)))
            .await
            .unwrap();
        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, ProtocolMessage::Pong(PongMessage { nonce: 42 }));
    }

    #[tokio::test]
    async fn test_connect_sends_locator_and_changes_state() {
        let transport = Arc::new(RecordingTransport::default());
        let store = Arc::new(MemoryBlockStore::new());
        let mut sync = SyncCoordinator::new(transport.clone(), store, &genesis(), SyncConfig::default());
        assert_eq!(sync.state(), &SyncState::Initial);

        sync.peer_connected(node(1)).await.unwrap();
        assert_eq!(sync.state(), &SyncState::Blocks);
        {
            let sent = transport.sent.lock().unwrap();
            match &sent[0].1 {
                ProtocolMessage::GetBlocks(message) => {
                    assert_eq!(message.block_hashes(), &[genesis().hash()]);
                    assert_eq!(message.stop_hash(), &Hash::ZERO);
                }
                other => panic!("unexpected {:?}", other),
            }
        }

        sync.tick().await.unwrap();
        assert_eq!(sync.state(), &SyncState::Synced);
        sync.peer_disconnected(node(1)).await;
        assert_eq!(sync.state(), &SyncState::Initial);
    }

    #[tokio::test]
    async fn test_inventory_of_known_block_is_ignored() {
        let transport = Arc::new(RecordingTransport::default());
        let store = Arc::new(MemoryBlockStore::new());
        let mut sync = SyncCoordinator::new(transport.clone(), store, &genesis(), SyncConfig::default());
        sync.peer_connected(node(1)).await.unwrap();

        let inventory = InventoryMessage::with_items(vec![InventoryItem::block(genesis().hash())]);
        sync.handle_message(node(1), ProtocolMessage::Inventory(inventory))
            .await
            .unwrap();
        assert!(sync.pending_blocks().is_empty().await);
        assert!(sync.in_flight().is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let transport = Arc::new(RecordingTransport::default());
        let store = Arc::new(MemoryBlockStore::new());
        let mut sync = SyncCoordinator::new(transport, store, &genesis(), SyncConfig::default());
        let (_events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move { sync.run(events_rx, shutdown_rx).await });
        shutdown_tx.send(true).unwrap();
        assert!(handle.await.unwrap().is_ok());
    }
}
