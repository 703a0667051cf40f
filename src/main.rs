//! bitseg-node: connect to Bitcoin peers and follow their block chain.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use bitseg_node::config::{LoggingConfig, NodeConfig};
use bitseg_node::network::{Network, PeerRegistry};
use bitseg_node::node::SyncCoordinator;
use bitseg_node::storage::{BlockQueue, MemoryBlockStore, PendingTransactionStore};
use bitseg_node::utils::{create_shutdown_receiver, init_logging_from_config, log_error_async};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum NetworkArg {
    Mainnet,
    Testnet,
    Regtest,
}

impl From<NetworkArg> for Network {
    fn from(arg: NetworkArg) -> Self {
        match arg {
            NetworkArg::Mainnet => Network::Mainnet,
            NetworkArg::Testnet => Network::Testnet,
            NetworkArg::Regtest => Network::Regtest,
        }
    }
}

/// Bitcoin P2P node core
#[derive(Parser, Debug)]
#[command(name = "bitseg-node")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a JSON or TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Network to join; overrides the config file
    #[arg(short, long, value_enum)]
    network: Option<NetworkArg>,

    /// Peer to connect to (repeatable)
    #[arg(long)]
    connect: Vec<SocketAddr>,

    /// Log filter, e.g. "debug" or "bitseg_node::node=trace"
    #[arg(long)]
    log_level: Option<String>,
}

fn load_config(args: &Args) -> Result<NodeConfig> {
    let mut config = match &args.config {
        Some(path) => NodeConfig::from_file(path)?,
        None => NodeConfig::default(),
    };
    if let Some(network) = args.network {
        config.network = network.into();
    }
    config.connect.extend(args.connect.iter().copied());
    if let Some(level) = &args.log_level {
        let logging = config.logging.get_or_insert_with(LoggingConfig::default);
        logging.filter = Some(level.clone());
    }
    config.validate()?;
    Ok(config)
}

/// Drain connected blocks and downloaded transactions until shutdown.
fn spawn_consumer(
    blocks: Arc<BlockQueue>,
    transactions: Arc<PendingTransactionStore>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    while let Some(block) = blocks.get_next_block() {
                        info!(
                            "Block {} ready ({} transactions)",
                            block.hash(),
                            block.transactions.len()
                        );
                    }
                    while let Some(transaction) = transactions.take_next_transaction().await {
                        debug!("Transaction {} ready", transaction.hash());
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_logging_from_config(config.logging.as_ref());

    info!("Starting bitseg-node v{}", env!("CARGO_PKG_VERSION"));
    info!("Network: {:?}", config.network);

    let registry = Arc::new(PeerRegistry::new(config.magic()));
    let store = Arc::new(MemoryBlockStore::new());
    let genesis = config.network.genesis_header();
    let mut coordinator = SyncCoordinator::new(
        Arc::clone(&registry),
        Arc::clone(&store),
        &genesis,
        config.sync.clone(),
    );

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    for addr in &config.connect {
        let addr = *addr;
        let connected = log_error_async(
            || registry.connect(addr, 0, events_tx.clone()),
            "Failed to connect to peer",
        )
        .await;
        if let Some(node) = connected {
            info!("Peer {} is node {}", addr, node);
        }
    }
    if registry.peer_count().await == 0 {
        info!("No peers connected; waiting for shutdown");
    }

    let (shutdown_tx, shutdown_rx) = create_shutdown_receiver();
    let consumer = spawn_consumer(
        coordinator.block_queue(),
        coordinator.transaction_pool(),
        Duration::from_millis(config.sync.tick_interval_ms),
        shutdown_rx.clone(),
    );
    let outcome = coordinator.run(events_rx, shutdown_rx).await;
    drop(events_tx);
    let _ = shutdown_tx.send(true);
    if let Err(e) = consumer.await {
        error!("Block consumer failed: {}", e);
    }
    if let Err(e) = outcome {
        error!("Sync stopped: {}", e);
        return Err(e.into());
    }

    let chain = coordinator.chain();
    let chain = chain.read().await;
    info!(
        "Stopped at height {} ({} blocks stored)",
        chain.best_height(),
        store.block_count().await
    );
    Ok(())
}
