//! Error types for pg_relset.
//!
//! All errors produced by the administration core, the consumption core, and
//! the stream-validation core are represented by [`RelsetError`]. Errors are
//! propagated via `Result<T, RelsetError>` throughout the crate; logging of
//! warnings (e.g. `skip_inaccessible` skips) is the caller's responsibility,
//! not this module's.
//!
//! # Classification
//!
//! [`RelsetError::kind`] buckets errors for monitoring/alerting:
//! - **Infra** — connection, commit, and coordination-store failures. These
//!   propagate to the orchestrator's top frame, which is responsible for
//!   rolling back every open [`crate::acquire::ManagedTransaction`].
//! - **Conflict** — optimistic-concurrency and duplicate-node failures the
//!   caller may legitimately retry end-to-end.
//! - **Validation** — stream-validator failures; terminate the validator.
//! - **Operator** — conditions requiring a human to repair the cluster.

use std::fmt;

/// Primary error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum RelsetError {
    // ── Connection / acquisition errors ──────────────────────────────────
    /// A connection to the given DSN could not be established.
    #[error("connection to {dsn} failed: {cause}")]
    ConnectionFailed { dsn: String, cause: String },

    /// `configure=false` was requested but the node has no `configuration`
    /// table.
    #[error("database {0} is not configured and configure=false")]
    NotConfigured(String),

    /// `setup()` failed and the caller did not request implicit setup.
    #[error("database {0} could not be configured: {1}")]
    NotConfigurable(String, String),

    /// The node's persisted `version` does not match the running software
    /// version.
    #[error("version mismatch: local={local} node={node}")]
    VersionMismatch { local: String, node: String },

    /// Two DSNs resolved to the same node id.
    #[error("duplicate node: {dsn_a} and {dsn_b} both resolve to node {node_id}")]
    DuplicateNode {
        dsn_a: String,
        dsn_b: String,
        node_id: uuid::Uuid,
    },

    /// A session-level advisory lock could not be acquired while setting up
    /// a shared uninitialized node; guards against concurrent-setup deadlock.
    #[error("possible deadlock: advisory lock {0} was already held")]
    PossibleDeadlock(i64),

    // ── Consumer / coordinator errors ────────────────────────────────────
    /// The ownership lease for a capture group was lost while running.
    #[error("lease lost for consumer group {consumer_group:?} set {set:?}")]
    LeaseLost { consumer_group: String, set: String },

    /// The ownership lease for a capture group could not be acquired.
    #[error("lease acquisition failed for consumer group {consumer_group:?} set {set:?}: {cause}")]
    LeaseAcquisitionFailed {
        consumer_group: String,
        set: String,
        cause: String,
    },

    /// A subscribe/unsubscribe request was still queued when the Coordinator
    /// was asked to stop.
    #[error("operation cancelled")]
    Cancelled,

    // ── Coordination-store errors ────────────────────────────────────────
    /// Optimistic-concurrency failure on a coordination-store commit.
    #[error("coordination store conflict at revision {0}")]
    CoordinationStoreConflict(i64),

    /// The coordination-store commit failed after some Postgres commits
    /// already succeeded; the cluster is in a partially-advanced state.
    #[error("cluster left in a partially-advanced state: {0}")]
    ClusterPartial(String),

    /// A generic coordination-store transport/protocol failure.
    #[error("coordination store error: {0}")]
    CoordinationStore(String),

    // ── Stream validation errors ─────────────────────────────────────────
    /// The validator encountered an unknown start state, unknown event tag,
    /// or a transition-specific guard failure.
    #[error("invalid event: {0}")]
    InvalidEvent(#[from] InvalidEvent),

    /// A batch ended without a terminal `Commit`/`Rollback` (publisher
    /// crashed mid-stream).
    #[error("transaction aborted: stream ended mid-batch")]
    TransactionAborted,

    /// A batch was explicitly rolled back.
    #[error("transaction cancelled: explicit rollback")]
    TransactionCancelled,

    // ── Codec errors ─────────────────────────────────────────────────────
    /// A coordination-store or stream payload could not be decoded/encoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// A validation failure on configuration content itself (e.g. a table
    /// with zero primary key columns).
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The requested replication set does not exist.
    #[error("set not found: {0}")]
    SetNotFound(String),

    /// The requested replication set already exists.
    #[error("set already exists: {0}")]
    SetAlreadyExists(String),

    /// A node id appeared in more than one of {additions, mutations,
    /// deletions} while computing an `update_set` diff.
    #[error("node {0} appears in more than one membership class during update_set")]
    AmbiguousMembershipChange(uuid::Uuid),

    /// An internal invariant was violated. Indicates a bug.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Validation failures raised by the stateful stream validator (component I).
#[derive(Debug, thiserror::Error)]
pub enum InvalidEvent {
    #[error("unknown start state")]
    UnknownStartState,

    #[error("unknown event tag {0:?} in current state")]
    UnknownTag(String),

    #[error("batch id mismatch: expected {expected:?}, got {actual:?}")]
    InvalidBatch { expected: String, actual: String },

    #[error("publisher mismatch: expected {expected}, got {actual}")]
    InvalidPublisher { expected: uuid::Uuid, actual: uuid::Uuid },

    #[error("batch id did not advance on commit from the same node")]
    BatchNotAdvanced,

    #[error("batch id advanced unexpectedly on rollback from the same node")]
    BatchUnexpectedlyAdvanced,
}

/// Decode/encode failures from the binary codec (component A).
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("unknown field at cluster root: {0}")]
    UnknownField(String),
}

/// Classification of error severity/kind for monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelsetErrorKind {
    Infra,
    Conflict,
    Validation,
    Operator,
}

impl fmt::Display for RelsetErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelsetErrorKind::Infra => write!(f, "INFRA"),
            RelsetErrorKind::Conflict => write!(f, "CONFLICT"),
            RelsetErrorKind::Validation => write!(f, "VALIDATION"),
            RelsetErrorKind::Operator => write!(f, "OPERATOR"),
        }
    }
}

impl RelsetError {
    /// Classify the error for monitoring and alerting.
    pub fn kind(&self) -> RelsetErrorKind {
        match self {
            RelsetError::ConnectionFailed { .. }
            | RelsetError::NotConfigured(_)
            | RelsetError::NotConfigurable(_, _)
            | RelsetError::CoordinationStore(_)
            | RelsetError::LeaseLost { .. }
            | RelsetError::LeaseAcquisitionFailed { .. }
            | RelsetError::Codec(_) => RelsetErrorKind::Infra,

            RelsetError::VersionMismatch { .. }
            | RelsetError::DuplicateNode { .. }
            | RelsetError::PossibleDeadlock(_)
            | RelsetError::CoordinationStoreConflict(_)
            | RelsetError::AmbiguousMembershipChange(_) => RelsetErrorKind::Conflict,

            RelsetError::InvalidEvent(_)
            | RelsetError::TransactionAborted
            | RelsetError::TransactionCancelled => RelsetErrorKind::Validation,

            RelsetError::ClusterPartial(_)
            | RelsetError::InvalidConfiguration(_)
            | RelsetError::SetNotFound(_)
            | RelsetError::SetAlreadyExists(_)
            | RelsetError::Cancelled
            | RelsetError::Internal(_) => RelsetErrorKind::Operator,
        }
    }

    /// Whether the caller may retry the whole operation end-to-end.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelsetError::CoordinationStoreConflict(_) | RelsetError::PossibleDeadlock(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert_eq!(
            RelsetError::NotConfigured("d1".into()).kind(),
            RelsetErrorKind::Infra
        );
        assert_eq!(
            RelsetError::CoordinationStoreConflict(4).kind(),
            RelsetErrorKind::Conflict
        );
        assert_eq!(
            RelsetError::TransactionAborted.kind(),
            RelsetErrorKind::Validation
        );
        assert_eq!(
            RelsetError::Internal("bug".into()).kind(),
            RelsetErrorKind::Operator
        );
    }

    #[test]
    fn test_retryable() {
        assert!(RelsetError::CoordinationStoreConflict(1).is_retryable());
        assert!(RelsetError::PossibleDeadlock(42).is_retryable());
        assert!(!RelsetError::Internal("x".into()).is_retryable());
    }
}
