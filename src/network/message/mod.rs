//! Typed protocol messages
//!
//! One module per message family. Each type implements
//! [`WireMessage`](crate::network::protocol::WireMessage).

pub mod block;
pub mod get_blocks;
pub mod inventory;
pub mod ping;
pub mod reject;
pub mod version;

pub use block::{BlockMessage, HeadersMessage, TransactionMessage, MAX_HEADERS_COUNT};
pub use get_blocks::{GetBlocksMessage, GetHeadersMessage, MAX_BLOCK_HASH_COUNT};
pub use inventory::{GetDataMessage, InventoryMessage, NotFoundMessage, MAX_INVENTORY_COUNT};
pub use ping::{PingMessage, PongMessage};
pub use reject::{RejectCode, RejectMessage};
pub use version::{NetworkAddress, VerackMessage, VersionMessage};
