//! Transaction structure and legacy wire serialization
//!
//! Only the structure is modelled here; script semantics are left to the
//! validation collaborator.

use crate::network::cursor::{ByteBuilder, ByteCursor, Endian};
use crate::primitives::Hash;
use serde::{Deserialize, Serialize};

/// Reference to a previous transaction output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutPoint {
    pub hash: Hash,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInput {
    pub previous_output: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOutput {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TransactionInput>,
    pub outputs: Vec<TransactionOutput>,
    pub lock_time: u32,
}

impl Transaction {
    /// Parse one transaction. Callers must check `cursor.did_overflow()`.
    pub fn read_from(cursor: &mut ByteCursor<'_>) -> Self {
        let version = cursor.read_i32(Endian::Little);

        let input_count = cursor.read_variable_length_integer();
        let mut inputs = Vec::with_capacity(bounded_capacity(input_count, cursor));
        for _ in 0..input_count {
            if cursor.did_overflow() {
                break;
            }
            let hash = cursor.read_hash();
            let index = cursor.read_u32(Endian::Little);
            let script_sig = cursor.read_variable_length_bytes();
            let sequence = cursor.read_u32(Endian::Little);
            inputs.push(TransactionInput {
                previous_output: OutPoint { hash, index },
                script_sig,
                sequence,
            });
        }

        let output_count = cursor.read_variable_length_integer();
        let mut outputs = Vec::with_capacity(bounded_capacity(output_count, cursor));
        for _ in 0..output_count {
            if cursor.did_overflow() {
                break;
            }
            let value = cursor.read_i64(Endian::Little);
            let script_pubkey = cursor.read_variable_length_bytes();
            outputs.push(TransactionOutput {
                value,
                script_pubkey,
            });
        }

        let lock_time = cursor.read_u32(Endian::Little);

        Self {
            version,
            inputs,
            outputs,
            lock_time,
        }
    }

    pub fn write_to(&self, builder: &mut ByteBuilder) {
        builder.append_i32(self.version, Endian::Little);
        builder.append_variable_length_integer(self.inputs.len() as u64);
        for input in &self.inputs {
            builder
                .append_hash(&input.previous_output.hash)
                .append_u32(input.previous_output.index, Endian::Little)
                .append_variable_length_bytes(&input.script_sig)
                .append_u32(input.sequence, Endian::Little);
        }
        builder.append_variable_length_integer(self.outputs.len() as u64);
        for output in &self.outputs {
            builder
                .append_i64(output.value, Endian::Little)
                .append_variable_length_bytes(&output.script_pubkey);
        }
        builder.append_u32(self.lock_time, Endian::Little);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut builder = ByteBuilder::new();
        self.write_to(&mut builder);
        builder.build()
    }

    /// Transaction id (double-SHA256 of the serialization)
    pub fn hash(&self) -> Hash {
        Hash::double_sha256(&self.to_bytes())
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].previous_output.hash.is_zero()
    }
}

/// Never pre-allocate more entries than bytes left in the buffer.
pub(crate) fn bounded_capacity(declared: u64, cursor: &ByteCursor<'_>) -> usize {
    usize::try_from(declared)
        .unwrap_or(usize::MAX)
        .min(cursor.remaining_byte_count())
}
