//! Stream wire format (component K's output, component I/J's input).
//!
//! Grounded in `tests/pgshovel/streams/publisher.py` and
//! `tests/pgshovel/streams/states.py`: a
//! publisher emits a `Begin`, zero or more `Mutation`s, then a terminal
//! `Commit` or `Rollback`, all sharing one [`BatchIdentifier`] and
//! strictly-increasing per-publisher [`Header::sequence`] numbers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies a publisher-local transaction. `node_id` disambiguates
/// publishers from distinct member databases; `local_id` is a
/// transaction-scoped value (e.g. Postgres `xid`) unique only within that
/// node's stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchIdentifier {
    pub node_id: Uuid,
    pub local_id: u64,
}

/// Envelope metadata present on every message, regardless of operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub publisher: Uuid,
    /// Strictly increasing per publisher. Used by the validator to detect
    /// gaps (dropped messages) and reordering.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

/// A single row-level change captured by the trigger manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    pub table: String,
    pub operation: MutationKind,
    /// Encoded primary key column values, in `Table::primary_key_columns`
    /// order.
    pub primary_key: Vec<String>,
    /// Encoded column values after the change (absent for `Delete`).
    pub columns: Option<std::collections::BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationKind {
    Insert,
    Update,
    Delete,
}

/// The body of one message on the change stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BatchOperation {
    Begin { batch_id: BatchIdentifier },
    Mutation { batch_id: BatchIdentifier, mutation: Mutation },
    Commit { batch_id: BatchIdentifier },
    Rollback { batch_id: BatchIdentifier },
}

impl BatchOperation {
    pub fn batch_id(&self) -> BatchIdentifier {
        match self {
            BatchOperation::Begin { batch_id }
            | BatchOperation::Mutation { batch_id, .. }
            | BatchOperation::Commit { batch_id }
            | BatchOperation::Rollback { batch_id } => *batch_id,
        }
    }
}

/// A full message: header plus operation. This is the unit exchanged over
/// the PGQ-backed transport and fed to the stateful stream validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub header: Header,
    pub operation: BatchOperation,
}

/// Encode an [`Envelope`] for storage in a PGQ event payload.
pub fn encode_envelope(env: &Envelope) -> Result<Vec<u8>, crate::error::CodecError> {
    crate::codec::encode_forward_compatible(env)
}

/// Decode an [`Envelope`] previously produced by [`encode_envelope`].
pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope, crate::error::CodecError> {
    crate::codec::decode_forward_compatible(bytes)
}
