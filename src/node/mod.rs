//! Synchronization layer
//!
//! Drives peers through inventory, data requests and block promotion into
//! the chain model.

pub mod inflight;
pub mod sync;

use std::time::Instant;

use thiserror::Error;

use crate::network::CodecError;
use crate::storage::ChainError;
use crate::utils::current_timestamp;

pub use inflight::{InFlightRequest, InFlightRequests};
pub use sync::{SyncCoordinator, SyncState};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Store error: {0}")]
    Store(#[from] anyhow::Error),

    #[error("Transport error: {0}")]
    Transport(String),
}

pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    /// Errors after which the coordinator must stop
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Chain(ChainError::CorruptedIntervals(_)))
    }
}

/// Time source for timeouts and download bookkeeping
pub trait Clock: Clone + Send + Sync + 'static {
    fn now(&self) -> Instant;

    /// Seconds since the Unix epoch
    fn unix_timestamp(&self) -> u64 {
        current_timestamp()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}
