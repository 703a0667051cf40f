//! Peer connection management
//!
//! Each connection gets a read task (decoding through [`MessageCodec`]) and a
//! write task fed by a channel. Everything a peer says is forwarded to the
//! coordinator as [`PeerEvent`]s.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use crate::network::framing::MessageCodec;
use crate::network::message::{NetworkAddress, VerackMessage, VersionMessage};
use crate::network::protocol::ProtocolMessage;
use crate::primitives::{IdSequence, NodeId};

/// How long the version/verack exchange may take
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Events delivered from peer tasks to the coordinator
#[derive(Debug)]
pub enum PeerEvent {
    Connected {
        node: NodeId,
        addr: SocketAddr,
        version: Box<VersionMessage>,
    },
    Message {
        node: NodeId,
        message: ProtocolMessage,
    },
    Disconnected {
        node: NodeId,
    },
}

/// Outbound side of the peer layer
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn send(&self, node: NodeId, message: ProtocolMessage) -> Result<()>;

    /// The peer's connection ended; release anything held for it.
    async fn disconnect(&self, _node: NodeId) {}
}

/// Sending half of a live connection
#[derive(Debug, Clone)]
pub struct PeerHandle {
    node: NodeId,
    addr: SocketAddr,
    version: VersionMessage,
    send_tx: mpsc::UnboundedSender<ProtocolMessage>,
}

impl PeerHandle {
    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn address(&self) -> SocketAddr {
        self.addr
    }

    /// Version message the peer sent during the handshake
    pub fn version(&self) -> &VersionMessage {
        &self.version
    }

    pub fn send_message(&self, message: ProtocolMessage) -> Result<()> {
        let command = message.command();
        self.send_tx
            .send(message)
            .map_err(|e| anyhow!("Failed to queue {} for peer {}: {}", command, self.addr, e))
    }

    pub fn is_connected(&self) -> bool {
        !self.send_tx.is_closed()
    }
}

/// Exchange version and verack. Returns the peer's version message.
pub async fn perform_handshake<R, W>(
    reader: &mut FramedRead<R, MessageCodec>,
    writer: &mut FramedWrite<W, MessageCodec>,
    ours: VersionMessage,
) -> Result<VersionMessage>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let our_nonce = ours.nonce();
    writer.send(ProtocolMessage::Version(ours)).await?;

    let mut their_version = None;
    let mut verack_received = false;
    while their_version.is_none() || !verack_received {
        let Some(frame) = reader.next().await else {
            bail!("Connection closed during handshake");
        };
        match frame? {
            ProtocolMessage::Version(version) => {
                if version.nonce() == our_nonce {
                    bail!("Connected to self");
                }
                if their_version.is_some() {
                    bail!("Duplicate version message");
                }
                writer.send(ProtocolMessage::Verack(VerackMessage)).await?;
                their_version = Some(version);
            }
            ProtocolMessage::Verack(_) => verack_received = true,
            other => debug!("Ignoring {} before handshake completed", other.command()),
        }
    }

    their_version.ok_or_else(|| anyhow!("Handshake finished without a version message"))
}

/// Start the read and write tasks for an established connection.
pub fn spawn_peer<R, W>(
    node: NodeId,
    addr: SocketAddr,
    version: VersionMessage,
    mut reader: FramedRead<R, MessageCodec>,
    mut writer: FramedWrite<W, MessageCodec>,
    events: mpsc::UnboundedSender<PeerEvent>,
) -> PeerHandle
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (send_tx, mut send_rx) = mpsc::unbounded_channel::<ProtocolMessage>();

    let read_events = events.clone();
    tokio::spawn(async move {
        while let Some(frame) = reader.next().await {
            match frame {
                Ok(message) => {
                    if read_events.send(PeerEvent::Message { node, message }).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Peer {} sent malformed data: {}", addr, e);
                    break;
                }
            }
        }
        info!("Peer {} disconnected", addr);
        let _ = read_events.send(PeerEvent::Disconnected { node });
    });

    tokio::spawn(async move {
        while let Some(message) = send_rx.recv().await {
            let command = message.command();
            if let Err(e) = writer.send(message).await {
                warn!("Peer write error for {}: {}", addr, e);
                break;
            }
            debug!("Sent {} to peer {}", command, addr);
        }
    });

    let _ = events.send(PeerEvent::Connected {
        node,
        addr,
        version: Box::new(version.clone()),
    });

    PeerHandle {
        node,
        addr,
        version,
        send_tx,
    }
}

/// Live connections by node id
pub struct PeerRegistry {
    magic: [u8; 4],
    peers: RwLock<HashMap<NodeId, PeerHandle>>,
    node_ids: Mutex<IdSequence>,
}

impl PeerRegistry {
    pub fn new(magic: [u8; 4]) -> Self {
        Self {
            magic,
            peers: RwLock::new(HashMap::new()),
            node_ids: Mutex::new(IdSequence::new()),
        }
    }

    pub fn magic(&self) -> [u8; 4] {
        self.magic
    }

    pub fn next_node_id(&self) -> Result<NodeId> {
        let mut sequence = self
            .node_ids
            .lock()
            .map_err(|_| anyhow!("Node id sequence lock poisoned"))?;
        NodeId::wrap(sequence.next_value()).ok_or_else(|| anyhow!("Node id sequence exhausted"))
    }

    /// Dial `addr`, handshake and register the connection.
    pub async fn connect(
        &self,
        addr: SocketAddr,
        start_height: i32,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<NodeId> {
        let stream = tokio::time::timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| anyhow!("Timed out connecting to {}", addr))??;
        stream.set_nodelay(true)?;
        let local = stream.local_addr()?;

        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, MessageCodec::new(self.magic));
        let mut writer = FramedWrite::new(write_half, MessageCodec::new(self.magic));

        let mut ours = VersionMessage::new(0, start_height);
        ours.set_remote_address(NetworkAddress::from_socket_addr(addr, 0));
        ours.set_local_address(NetworkAddress::from_socket_addr(local, 0));

        let theirs = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            perform_handshake(&mut reader, &mut writer, ours),
        )
        .await
        .map_err(|_| anyhow!("Handshake with {} timed out", addr))??;
        info!(
            "Connected to {} ({}, height {})",
            addr,
            theirs.user_agent(),
            theirs.start_height()
        );

        let node = self.next_node_id()?;
        let handle = spawn_peer(node, addr, theirs, reader, writer, events);
        self.register(handle).await;
        Ok(node)
    }

    pub async fn register(&self, handle: PeerHandle) {
        self.peers.write().await.insert(handle.node(), handle);
    }

    pub async fn remove(&self, node: NodeId) -> Option<PeerHandle> {
        self.peers.write().await.remove(&node)
    }

    pub async fn get(&self, node: NodeId) -> Option<PeerHandle> {
        self.peers.read().await.get(&node).cloned()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn nodes(&self) -> Vec<NodeId> {
        self.peers.read().await.keys().copied().collect()
    }
}

#[async_trait]
impl PeerTransport for PeerRegistry {
    async fn send(&self, node: NodeId, message: ProtocolMessage) -> Result<()> {
        let handle = self
            .get(node)
            .await
            .ok_or_else(|| anyhow!("Unknown peer {}", node))?;
        handle.send_message(message)
    }

    async fn disconnect(&self, node: NodeId) {
        if let Some(handle) = self.remove(node).await {
            debug!("Dropped handle for peer {} ({})", node, handle.address());
        }
    }
}
