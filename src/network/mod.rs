//! Network layer
//!
//! Byte-level reading and writing, the Bitcoin message envelope, typed
//! messages, stream framing and TCP peers.

pub mod cursor;
pub mod framing;
pub mod inventory;
pub mod message;
pub mod peer;
pub mod protocol;

pub use cursor::{ByteBuilder, ByteCursor, Endian};
pub use framing::MessageCodec;
pub use inventory::{InventoryItem, InventoryItemType};
pub use peer::{PeerEvent, PeerHandle, PeerRegistry, PeerTransport};
pub use protocol::{
    CodecError, CodecResult, Command, MessageHeader, Network, ProtocolMessage, WireMessage,
};
