//! Stateful stream validator (component I).
//!
//! Grounded in `tests/pgshovel/streams/states.py`'s `StatefulStreamValidator`
//! and `validate_transaction_state`: a small transducer that holds a
//! current state and, for each incoming event tag, looks up a transition
//! function keyed by `(current_state, tag)`. The transition function may
//! reject the event (raising an `InvalidEvent`) or return the next state.

use std::collections::HashMap;

use uuid::Uuid;

use crate::error::{InvalidEvent, RelsetError};
use crate::wire::{BatchIdentifier, BatchOperation, Header};

/// A single incoming event: header plus operation tag, matched against the
/// validator's transition table.
pub struct Event<'a> {
    pub header: &'a Header,
    pub operation: &'a BatchOperation,
}

type Transition<S> = Box<dyn Fn(&S, &Event) -> Result<S, InvalidEvent> + Send + Sync>;

/// Generic transition-table-driven validator. `S` is the validator's state
/// type; transitions are registered per `(state_name, event_tag)` pair.
pub struct StatefulStreamValidator<S: Clone + StateName> {
    transitions: HashMap<(&'static str, &'static str), Transition<S>>,
    state: S,
}

/// Associates a state value with the string key used to look up
/// transitions, mirroring the Python implementation's use of the state
/// *class* (not value) as the dictionary key.
pub trait StateName {
    fn name(&self) -> &'static str;
}

impl<S: Clone + StateName> StatefulStreamValidator<S> {
    pub fn new(start: S) -> Self {
        Self {
            transitions: HashMap::new(),
            state: start,
        }
    }

    pub fn on(
        mut self,
        state_name: &'static str,
        tag: &'static str,
        f: impl Fn(&S, &Event) -> Result<S, InvalidEvent> + Send + Sync + 'static,
    ) -> Self {
        self.transitions.insert((state_name, tag), Box::new(f));
        self
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    /// Feed one event through the validator, advancing `state` on success.
    pub fn push(&mut self, tag: &'static str, event: &Event) -> Result<(), RelsetError> {
        let key = (self.state.name(), tag);
        let transition = self
            .transitions
            .get(&key)
            .ok_or(InvalidEvent::UnknownTag(tag.to_string()))?;
        let next = transition(&self.state, event)?;
        self.state = next;
        Ok(())
    }
}

/// States of the per-batch transaction validator. `Committed`/`RolledBack`
/// carry the terminal batch's publisher and id so a following `Begin` can
/// be checked against them (same-node monotonicity, publisher-change
/// detection).
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionState {
    NoTransaction,
    InTransaction { batch_id: BatchIdentifier, publisher: Uuid },
    Committed { batch_id: BatchIdentifier, publisher: Uuid },
    RolledBack { batch_id: BatchIdentifier, publisher: Uuid },
}

impl StateName for TransactionState {
    fn name(&self) -> &'static str {
        match self {
            TransactionState::NoTransaction => "no_transaction",
            TransactionState::InTransaction { .. } => "in_transaction",
            TransactionState::Committed { .. } => "committed",
            TransactionState::RolledBack { .. } => "rolled_back",
        }
    }
}

fn require_same_batch(expected: BatchIdentifier, actual: BatchIdentifier) -> Result<(), InvalidEvent> {
    if expected != actual {
        return Err(InvalidEvent::InvalidBatch {
            expected: format!("{expected:?}"),
            actual: format!("{actual:?}"),
        });
    }
    Ok(())
}

fn require_same_publisher(expected: Uuid, actual: Uuid) -> Result<(), InvalidEvent> {
    if expected != actual {
        return Err(InvalidEvent::InvalidPublisher { expected, actual });
    }
    Ok(())
}

/// Passes only when the publishers differ — a publisher restart, which
/// resets that publisher's own batch numbering.
fn require_different_publisher(expected: Uuid, actual: Uuid) -> Result<(), InvalidEvent> {
    if expected == actual {
        return Err(InvalidEvent::InvalidPublisher { expected, actual });
    }
    Ok(())
}

/// On a `Commit` → `Begin` transition: if the new batch shares the prior
/// batch's node, its id must have strictly advanced. A different node is
/// unconstrained.
fn require_batch_id_advanced_if_same_node(
    prior: BatchIdentifier,
    next: BatchIdentifier,
) -> Result<(), InvalidEvent> {
    if prior.node_id == next.node_id && next.local_id <= prior.local_id {
        return Err(InvalidEvent::BatchNotAdvanced);
    }
    Ok(())
}

/// On a `Rollback` → `Begin` transition: if the new batch shares the
/// prior batch's node, its id must be unchanged (the failed batch is
/// being retried under the same id). A different node is unconstrained.
fn require_batch_id_not_advanced_if_same_node(
    prior: BatchIdentifier,
    next: BatchIdentifier,
) -> Result<(), InvalidEvent> {
    if prior.node_id == next.node_id && next.local_id != prior.local_id {
        return Err(InvalidEvent::BatchUnexpectedlyAdvanced);
    }
    Ok(())
}

/// Build a validator that enforces: `Begin` starts a transaction,
/// `Mutation`s must belong to the open batch and publisher, `Commit`/
/// `Rollback` must likewise match and return to `NoTransaction`/terminal
/// state. Matches the guard set used by `validate_transaction_state` in
/// `pgshovel/streams/validation.py`.
pub fn transaction_validator() -> StatefulStreamValidator<TransactionState> {
    StatefulStreamValidator::new(TransactionState::NoTransaction)
        .on("no_transaction", "begin", |_state, event| {
            let batch_id = event.operation.batch_id();
            Ok(TransactionState::InTransaction {
                batch_id,
                publisher: event.header.publisher,
            })
        })
        .on("in_transaction", "mutation", |state, event| {
            if let TransactionState::InTransaction { batch_id, publisher } = state {
                require_same_batch(*batch_id, event.operation.batch_id())?;
                require_same_publisher(*publisher, event.header.publisher)?;
                Ok(state.clone())
            } else {
                unreachable!("transition table guarantees state matches key")
            }
        })
        .on("in_transaction", "commit", |state, event| {
            if let TransactionState::InTransaction { batch_id, publisher } = state {
                require_same_batch(*batch_id, event.operation.batch_id())?;
                require_same_publisher(*publisher, event.header.publisher)?;
                Ok(TransactionState::Committed { batch_id: *batch_id, publisher: *publisher })
            } else {
                unreachable!("transition table guarantees state matches key")
            }
        })
        .on("in_transaction", "rollback", |state, event| {
            if let TransactionState::InTransaction { batch_id, publisher } = state {
                require_same_batch(*batch_id, event.operation.batch_id())?;
                require_same_publisher(*publisher, event.header.publisher)?;
                Ok(TransactionState::RolledBack { batch_id: *batch_id, publisher: *publisher })
            } else {
                unreachable!("transition table guarantees state matches key")
            }
        })
        .on("committed", "begin", |state, event| {
            if let TransactionState::Committed { batch_id, publisher } = state {
                let next_batch_id = event.operation.batch_id();
                if require_different_publisher(*publisher, event.header.publisher).is_err() {
                    require_batch_id_advanced_if_same_node(*batch_id, next_batch_id)?;
                }
                Ok(TransactionState::InTransaction {
                    batch_id: next_batch_id,
                    publisher: event.header.publisher,
                })
            } else {
                unreachable!("transition table guarantees state matches key")
            }
        })
        .on("rolled_back", "begin", |state, event| {
            if let TransactionState::RolledBack { batch_id, publisher } = state {
                let next_batch_id = event.operation.batch_id();
                if require_different_publisher(*publisher, event.header.publisher).is_err() {
                    require_batch_id_not_advanced_if_same_node(*batch_id, next_batch_id)?;
                }
                Ok(TransactionState::InTransaction {
                    batch_id: next_batch_id,
                    publisher: event.header.publisher,
                })
            } else {
                unreachable!("transition table guarantees state matches key")
            }
        })
}

pub fn tag_of(op: &BatchOperation) -> &'static str {
    match op {
        BatchOperation::Begin { .. } => "begin",
        BatchOperation::Mutation { .. } => "mutation",
        BatchOperation::Commit { .. } => "commit",
        BatchOperation::Rollback { .. } => "rollback",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{Mutation, MutationKind};
    use chrono::Utc;

    fn header(publisher: Uuid, seq: u64) -> Header {
        Header { publisher, sequence: seq, timestamp: Utc::now() }
    }

    fn batch(node: Uuid, local: u64) -> BatchIdentifier {
        BatchIdentifier { node_id: node, local_id: local }
    }

    fn insert_mutation(batch_id: BatchIdentifier) -> BatchOperation {
        BatchOperation::Mutation {
            batch_id,
            mutation: Mutation {
                table: "public.orders".into(),
                operation: MutationKind::Insert,
                primary_key: vec!["1".into()],
                columns: None,
            },
        }
    }

    #[test]
    fn test_valid_begin_mutation_commit_sequence() {
        let node = Uuid::new_v4();
        let publisher = Uuid::new_v4();
        let b = batch(node, 1);
        let mut v = transaction_validator();

        let begin_op = BatchOperation::Begin { batch_id: b };
        let h1 = header(publisher, 1);
        v.push("begin", &Event { header: &h1, operation: &begin_op }).unwrap();

        let mutation_op = insert_mutation(b);
        let h2 = header(publisher, 2);
        v.push("mutation", &Event { header: &h2, operation: &mutation_op }).unwrap();

        let commit_op = BatchOperation::Commit { batch_id: b };
        let h3 = header(publisher, 3);
        v.push("commit", &Event { header: &h3, operation: &commit_op }).unwrap();

        assert_eq!(*v.state(), TransactionState::Committed { batch_id: b, publisher });
    }

    #[test]
    fn test_mutation_from_wrong_publisher_is_rejected() {
        let node = Uuid::new_v4();
        let publisher = Uuid::new_v4();
        let other = Uuid::new_v4();
        let b = batch(node, 1);
        let mut v = transaction_validator();
        let begin_op = BatchOperation::Begin { batch_id: b };
        let h1 = header(publisher, 1);
        v.push("begin", &Event { header: &h1, operation: &begin_op }).unwrap();

        let mutation_op = insert_mutation(b);
        let h2 = header(other, 2);
        let result = v.push("mutation", &Event { header: &h2, operation: &mutation_op });
        assert!(result.is_err());
    }

    #[test]
    fn test_mutation_before_begin_is_rejected() {
        let node = Uuid::new_v4();
        let publisher = Uuid::new_v4();
        let b = batch(node, 1);
        let mut v = transaction_validator();
        let mutation_op = BatchOperation::Mutation {
            batch_id: b,
            mutation: Mutation {
                table: "public.orders".into(),
                operation: MutationKind::Delete,
                primary_key: vec!["1".into()],
                columns: None,
            },
        };
        let h = header(publisher, 1);
        let result = v.push("mutation", &Event { header: &h, operation: &mutation_op });
        assert!(result.is_err());
    }

    fn commit_batch(v: &mut StatefulStreamValidator<TransactionState>, node: Uuid, publisher: Uuid, local: u64) {
        let b = batch(node, local);
        let begin_op = BatchOperation::Begin { batch_id: b };
        v.push("begin", &Event { header: &header(publisher, 1), operation: &begin_op }).unwrap();
        let commit_op = BatchOperation::Commit { batch_id: b };
        v.push("commit", &Event { header: &header(publisher, 2), operation: &commit_op }).unwrap();
    }

    #[test]
    fn test_begin_after_commit_same_node_same_publisher_requires_advanced_batch_id() {
        let node = Uuid::new_v4();
        let publisher = Uuid::new_v4();
        let mut v = transaction_validator();
        commit_batch(&mut v, node, publisher, 1);

        let stale_begin = BatchOperation::Begin { batch_id: batch(node, 1) };
        let result = v.push("begin", &Event { header: &header(publisher, 3), operation: &stale_begin });
        assert!(matches!(result, Err(RelsetError::InvalidEvent(InvalidEvent::BatchNotAdvanced))));

        let advanced_begin = BatchOperation::Begin { batch_id: batch(node, 2) };
        v.push("begin", &Event { header: &header(publisher, 3), operation: &advanced_begin }).unwrap();
        assert_eq!(
            *v.state(),
            TransactionState::InTransaction { batch_id: batch(node, 2), publisher }
        );
    }

    #[test]
    fn test_begin_after_commit_different_publisher_bypasses_batch_id_advance() {
        let node = Uuid::new_v4();
        let publisher = Uuid::new_v4();
        let restarted = Uuid::new_v4();
        let mut v = transaction_validator();
        commit_batch(&mut v, node, publisher, 1);

        let reused_begin = BatchOperation::Begin { batch_id: batch(node, 1) };
        v.push("begin", &Event { header: &header(restarted, 1), operation: &reused_begin }).unwrap();
        assert_eq!(
            *v.state(),
            TransactionState::InTransaction { batch_id: batch(node, 1), publisher: restarted }
        );
    }

    #[test]
    fn test_begin_after_rollback_same_node_same_publisher_requires_unchanged_batch_id() {
        let node = Uuid::new_v4();
        let publisher = Uuid::new_v4();
        let mut v = transaction_validator();
        let b = batch(node, 1);
        let begin_op = BatchOperation::Begin { batch_id: b };
        v.push("begin", &Event { header: &header(publisher, 1), operation: &begin_op }).unwrap();
        let rollback_op = BatchOperation::Rollback { batch_id: b };
        v.push("rollback", &Event { header: &header(publisher, 2), operation: &rollback_op }).unwrap();

        let advanced_retry = BatchOperation::Begin { batch_id: batch(node, 2) };
        let result = v.push("begin", &Event { header: &header(publisher, 3), operation: &advanced_retry });
        assert!(matches!(result, Err(RelsetError::InvalidEvent(InvalidEvent::BatchUnexpectedlyAdvanced))));

        let same_retry = BatchOperation::Begin { batch_id: batch(node, 1) };
        v.push("begin", &Event { header: &header(publisher, 3), operation: &same_retry }).unwrap();
        assert_eq!(*v.state(), TransactionState::InTransaction { batch_id: batch(node, 1), publisher });
    }
}
