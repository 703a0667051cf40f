//! Typed row identifiers
//!
//! Each identifier wraps a positive 64-bit value. `wrap` is the only way to
//! build one and yields `None` for zero, negative or missing sources, so
//! "no identifier" is always visible in the type.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(u64);

        impl $name {
            /// Wrap a raw value; zero and negative values have no identifier.
            pub fn wrap(value: i64) -> Option<Self> {
                if value > 0 {
                    Some(Self(value as u64))
                } else {
                    None
                }
            }

            /// Wrap a nullable raw value
            pub fn wrap_opt(value: Option<i64>) -> Option<Self> {
                value.and_then(Self::wrap)
            }

            pub fn value(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id!(
    /// Committed block
    BlockId
);
define_id!(
    /// Committed transaction
    TransactionId
);
define_id!(
    /// Mining-pool account
    AccountId
);
define_id!(
    /// Mining-pool worker
    WorkerId
);
define_id!(
    /// Client session
    SessionId
);
define_id!(
    /// Connected peer
    NodeId
);
define_id!(PendingBlockId);
define_id!(PendingTransactionId);
define_id!(
    /// Chain segment in the nested-set tree
    SegmentId
);

/// Monotonic allocator for one identifier space
#[derive(Debug, Clone)]
pub struct IdSequence {
    next: i64,
}

impl Default for IdSequence {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl IdSequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume a sequence whose values below `next` are already taken
    pub fn starting_at(next: i64) -> Self {
        Self { next: next.max(1) }
    }

    /// Next raw value. Values are never reused.
    pub fn next_value(&mut self) -> i64 {
        let value = self.next;
        self.next += 1;
        value
    }
}
