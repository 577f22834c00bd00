//! Batched iterator adapter (component J).
//!
//! Grounded in `src/main/python/pgshovel/streams/batches.py`'s `batched()`
//! generator: groups a flat stream of envelopes by `(publisher,
//! batch_id)`, yielding one mutation sequence per transaction that ends in
//! either `TransactionCancelled` (explicit rollback) or
//! `TransactionAborted` (stream ended without a terminal operation).

use crate::error::RelsetError;
use crate::wire::{BatchIdentifier, BatchOperation, Envelope, Mutation};

/// One fully-delimited transaction: the mutations between a `Begin` and
/// its terminal `Commit`. A `Rollback` or a stream that ends mid-batch is
/// surfaced as an `Err` instead of a value, matching
/// `TransactionCancelled`/`TransactionAborted` in the original.
pub type BatchResult = Result<Vec<Mutation>, RelsetError>;

/// Consumes a flat sequence of envelopes already known to share one
/// `(publisher, batch_id)` pair (the caller groups envelopes with
/// matching keys together before calling this, typically via
/// [`batched`]) and reduces it to a single [`BatchResult`].
pub fn reduce_batch(envelopes: Vec<Envelope>) -> BatchResult {
    let mut mutations = Vec::new();
    let mut saw_begin = false;

    for envelope in envelopes {
        match envelope.operation {
            BatchOperation::Begin { .. } => {
                saw_begin = true;
            }
            BatchOperation::Mutation { mutation, .. } => {
                mutations.push(mutation);
            }
            BatchOperation::Commit { .. } => {
                return Ok(mutations);
            }
            BatchOperation::Rollback { .. } => {
                return Err(RelsetError::TransactionCancelled);
            }
        }
    }

    let _ = saw_begin;
    Err(RelsetError::TransactionAborted)
}

/// Lazily groups a flat sequence of envelopes into consecutive runs sharing
/// the same `(publisher, batch_id)`, mirroring Python's
/// `itertools.groupby(messages, key=lambda m: (m.header.publisher,
/// m.batch_identifier))`, and reduces each run as it's consumed. Envelopes
/// must already be delivered in an order where a batch's messages are
/// contiguous (true for a single PGQ consumer batch); non-contiguous
/// interleaving of two open transactions from the same publisher is not
/// supported, matching the original.
///
/// Yields `(batch_id, result)` rather than a bare [`BatchResult`] so a
/// caller can tell which batch a failure belongs to without re-deriving it
/// from the envelopes it already consumed.
pub struct Batched<I: Iterator<Item = Envelope>> {
    envelopes: std::iter::Peekable<I>,
}

impl<I: Iterator<Item = Envelope>> Iterator for Batched<I> {
    type Item = (BatchIdentifier, BatchResult);

    fn next(&mut self) -> Option<Self::Item> {
        let first = self.envelopes.next()?;
        let key = (first.header.publisher, first.operation.batch_id());
        let batch_id = first.operation.batch_id();
        let mut group = vec![first];

        while let Some(peeked) = self.envelopes.peek() {
            if (peeked.header.publisher, peeked.operation.batch_id()) != key {
                break;
            }
            group.push(self.envelopes.next().unwrap());
        }

        Some((batch_id, reduce_batch(group)))
    }
}

/// Entry point: lazily group then reduce, yielding one
/// `(batch_id, BatchResult)` per distinct batch in stream order. Nothing
/// past the first ungrouped envelope is read until the caller asks for the
/// next item.
pub fn batched<I>(envelopes: I) -> Batched<I::IntoIter>
where
    I: IntoIterator<Item = Envelope>,
{
    Batched { envelopes: envelopes.into_iter().peekable() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{Header, MutationKind};
    use chrono::Utc;
    use uuid::Uuid;

    fn env(publisher: uuid::Uuid, seq: u64, batch: BatchIdentifier, op: BatchOperation) -> Envelope {
        Envelope {
            header: Header { publisher, sequence: seq, timestamp: Utc::now() },
            operation: op,
        }
    }

    fn mutation(table: &str) -> Mutation {
        Mutation {
            table: table.into(),
            operation: MutationKind::Insert,
            primary_key: vec!["1".into()],
            columns: None,
        }
    }

    #[test]
    fn test_batched_commit_yields_mutations() {
        let publisher = Uuid::new_v4();
        let batch = BatchIdentifier { node_id: publisher, local_id: 1 };
        let envelopes = vec![
            env(publisher, 1, batch, BatchOperation::Begin { batch_id: batch }),
            env(
                publisher,
                2,
                batch,
                BatchOperation::Mutation { batch_id: batch, mutation: mutation("public.orders") },
            ),
            env(publisher, 3, batch, BatchOperation::Commit { batch_id: batch }),
        ];
        let results: Vec<_> = batched(envelopes).collect();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, batch);
        assert_eq!(results[0].1.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn test_batched_rollback_yields_cancelled() {
        let publisher = Uuid::new_v4();
        let batch = BatchIdentifier { node_id: publisher, local_id: 1 };
        let envelopes = vec![
            env(publisher, 1, batch, BatchOperation::Begin { batch_id: batch }),
            env(publisher, 2, batch, BatchOperation::Rollback { batch_id: batch }),
        ];
        let results: Vec<_> = batched(envelopes).collect();
        assert!(matches!(results[0].1, Err(RelsetError::TransactionCancelled)));
    }

    #[test]
    fn test_batched_truncated_stream_yields_aborted() {
        let publisher = Uuid::new_v4();
        let batch = BatchIdentifier { node_id: publisher, local_id: 1 };
        let envelopes = vec![env(publisher, 1, batch, BatchOperation::Begin { batch_id: batch })];
        let results: Vec<_> = batched(envelopes).collect();
        assert!(matches!(results[0].1, Err(RelsetError::TransactionAborted)));
    }

    #[test]
    fn test_batched_two_transactions_yield_two_groups() {
        let publisher = Uuid::new_v4();
        let b1 = BatchIdentifier { node_id: publisher, local_id: 1 };
        let b2 = BatchIdentifier { node_id: publisher, local_id: 2 };
        let envelopes = vec![
            env(publisher, 1, b1, BatchOperation::Begin { batch_id: b1 }),
            env(publisher, 2, b1, BatchOperation::Commit { batch_id: b1 }),
            env(publisher, 3, b2, BatchOperation::Begin { batch_id: b2 }),
            env(publisher, 4, b2, BatchOperation::Commit { batch_id: b2 }),
        ];
        let results: Vec<_> = batched(envelopes).collect();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, b1);
        assert_eq!(results[1].0, b2);
    }
}
