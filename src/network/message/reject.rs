//! reject message
//!
//! Layout: var-string rejected command, one code byte, var-string reason,
//! then any remaining bytes as opaque extra data (usually the hash of the
//! rejected object).

use crate::network::cursor::{ByteBuilder, ByteCursor, Endian};
use crate::network::protocol::{CachedPayload, CodecResult, Command, WireMessage};
use crate::primitives::Hash;
use bytes::Bytes;

/// Reject code; its meaning depends on the rejected command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectCode {
    Malformed,
    Invalid,
    Obsolete,
    Duplicate,
    NonStandard,
    Dust,
    InsufficientFee,
    Checkpoint,
    Other(u8),
}

impl RejectCode {
    pub fn from_byte(value: u8) -> Self {
        match value {
            0x01 => RejectCode::Malformed,
            0x10 => RejectCode::Invalid,
            0x11 => RejectCode::Obsolete,
            0x12 => RejectCode::Duplicate,
            0x40 => RejectCode::NonStandard,
            0x41 => RejectCode::Dust,
            0x42 => RejectCode::InsufficientFee,
            0x43 => RejectCode::Checkpoint,
            other => RejectCode::Other(other),
        }
    }

    pub fn as_byte(&self) -> u8 {
        match self {
            RejectCode::Malformed => 0x01,
            RejectCode::Invalid => 0x10,
            RejectCode::Obsolete => 0x11,
            RejectCode::Duplicate => 0x12,
            RejectCode::NonStandard => 0x40,
            RejectCode::Dust => 0x41,
            RejectCode::InsufficientFee => 0x42,
            RejectCode::Checkpoint => 0x43,
            RejectCode::Other(value) => *value,
        }
    }

    /// Human-readable meaning in the context of the rejected command
    pub fn describe(&self, rejected_command: &str) -> &'static str {
        match (rejected_command, self) {
            (_, RejectCode::Malformed) => "malformed message",
            ("block", RejectCode::Invalid) => "invalid block",
            ("tx", RejectCode::Invalid) => "invalid transaction",
            ("version", RejectCode::Obsolete) => "obsolete protocol version",
            ("version", RejectCode::Duplicate) => "duplicate version message",
            ("block", RejectCode::Obsolete) => "obsolete block version",
            ("tx", RejectCode::Duplicate) => "duplicate transaction",
            ("tx", RejectCode::NonStandard) => "non-standard transaction",
            ("tx", RejectCode::Dust) => "dust output",
            ("tx", RejectCode::InsufficientFee) => "insufficient fee",
            ("block", RejectCode::Checkpoint) => "conflicts with checkpoint",
            (_, RejectCode::Invalid) => "invalid",
            (_, RejectCode::Obsolete) => "obsolete",
            (_, RejectCode::Duplicate) => "duplicate",
            _ => "unknown reject code",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectMessage {
    rejected_command: String,
    code: RejectCode,
    reason: String,
    extra_data: Vec<u8>,
    cache: CachedPayload,
}

impl RejectMessage {
    pub fn new(rejected_command: impl Into<String>, code: RejectCode, reason: impl Into<String>) -> Self {
        Self {
            rejected_command: rejected_command.into(),
            code,
            reason: reason.into(),
            extra_data: Vec::new(),
            cache: CachedPayload::new(),
        }
    }

    pub fn with_extra_data(mut self, extra_data: Vec<u8>) -> Self {
        self.set_extra_data(extra_data);
        self
    }

    pub fn rejected_command(&self) -> &str {
        &self.rejected_command
    }

    pub fn code(&self) -> RejectCode {
        self.code
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn extra_data(&self) -> &[u8] {
        &self.extra_data
    }

    pub fn set_extra_data(&mut self, extra_data: Vec<u8>) {
        self.extra_data = extra_data;
        self.cache.invalidate();
    }

    /// Hash of the rejected object when the extra data carries one
    pub fn rejected_hash(&self) -> Option<Hash> {
        let bytes: [u8; 32] = self.extra_data.as_slice().try_into().ok()?;
        Some(Hash::new(bytes))
    }

    pub fn describe(&self) -> &'static str {
        self.code.describe(&self.rejected_command)
    }
}

impl WireMessage for RejectMessage {
    const COMMAND: Command = Command::Reject;

    fn parse_payload(cursor: &mut ByteCursor<'_>) -> CodecResult<Self> {
        let rejected_command = cursor.read_variable_length_string();
        let code = RejectCode::from_byte(cursor.read_byte());
        let reason = cursor.read_variable_length_string();
        let extra_data = cursor.read_remaining();
        Ok(Self {
            rejected_command,
            code,
            reason,
            extra_data,
            cache: CachedPayload::new(),
        })
    }

    fn payload(&self) -> Bytes {
        self.cache.get_or_build(|| {
            let mut builder = ByteBuilder::new();
            builder
                .append_variable_length_string(&self.rejected_command)
                .append_u8(self.code.as_byte())
                .append_variable_length_string(&self.reason)
                .append_bytes(&self.extra_data, Endian::Big);
            builder.build()
        })
    }
}
