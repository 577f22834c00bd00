//! Publisher (component K).
//!
//! Grounded in `tests/pgshovel/streams/publisher.py`: a scoped `batch()`
//! call emits `Begin`, lets the caller publish mutations, then emits
//! `Commit` on normal exit or `Rollback` if the caller's closure returns
//! an error — the publisher itself remains usable afterwards, with its
//! per-publisher sequence counter continuing to advance rather than
//! resetting.

use uuid::Uuid;

use crate::error::RelsetError;
use crate::wire::{BatchIdentifier, BatchOperation, Envelope, Header, Mutation};

/// Emits envelopes for one publisher identity. `sequence` increases by one
/// for every envelope emitted, including `Begin`/`Commit`/`Rollback`,
/// matching the header sequencing asserted in `publisher.py`'s tests.
///
/// `publisher_id` and `node_id` are deliberately distinct: `publisher_id`
/// is this process's own transient identity (freshly generated every
/// restart — the signal the validator's same-node guards use to detect a
/// replay boundary), while `node_id` is the source database's persisted
/// id from bootstrap and must stay stable across publisher restarts so
/// `BatchIdentifier.node_id` monotonicity guards remain meaningful.
pub struct Publisher<S> {
    publisher_id: Uuid,
    node_id: Uuid,
    sequence: u64,
    next_local_id: u64,
    sink: S,
}

/// Where a [`Publisher`] writes emitted envelopes. The real sink appends
/// to the replication set's PGQ queue via [`crate::pgq::insert_event`];
/// tests use an in-memory `Vec`.
#[async_trait::async_trait]
pub trait EnvelopeSink: Send {
    async fn send(&mut self, envelope: Envelope) -> Result<(), RelsetError>;
}

#[async_trait::async_trait]
impl EnvelopeSink for Vec<Envelope> {
    async fn send(&mut self, envelope: Envelope) -> Result<(), RelsetError> {
        self.push(envelope);
        Ok(())
    }
}

impl<S: EnvelopeSink> Publisher<S> {
    /// `publisher_id` is a fresh id generated for this process; `node_id`
    /// is the source database's persisted node id (see
    /// [`crate::bootstrap::setup`]).
    pub fn new(publisher_id: Uuid, node_id: Uuid, sink: S) -> Self {
        Self { publisher_id, node_id, sequence: 0, next_local_id: 0, sink }
    }

    fn next_header(&mut self) -> Header {
        self.sequence += 1;
        Header {
            publisher: self.publisher_id,
            sequence: self.sequence,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Run `body` inside a new batch: emits `Begin`, calls `body` with a
    /// [`BatchHandle`] the caller uses to publish mutations, then emits
    /// `Commit` if `body` returns `Ok`, or `Rollback` followed by
    /// re-raising `body`'s error if it returns `Err`. The publisher is
    /// left usable for a subsequent `batch` call either way.
    pub async fn batch<F, Fut, T>(&mut self, body: F) -> Result<T, RelsetError>
    where
        F: FnOnce(BatchHandle<'_, S>) -> Fut,
        Fut: std::future::Future<Output = Result<T, RelsetError>>,
    {
        self.next_local_id += 1;
        let batch_id = BatchIdentifier {
            node_id: self.node_id,
            local_id: self.next_local_id,
        };

        let header = self.next_header();
        self.sink
            .send(Envelope { header, operation: BatchOperation::Begin { batch_id } })
            .await?;

        let handle = BatchHandle { publisher: self, batch_id };
        let result = body(handle).await;

        let header = self.next_header();
        match &result {
            Ok(_) => {
                self.sink
                    .send(Envelope { header, operation: BatchOperation::Commit { batch_id } })
                    .await?;
            }
            Err(_) => {
                self.sink
                    .send(Envelope { header, operation: BatchOperation::Rollback { batch_id } })
                    .await?;
            }
        }

        result
    }
}

/// Scoped handle passed into a [`Publisher::batch`] closure; publishes
/// mutations tagged with the enclosing batch's identifier.
pub struct BatchHandle<'a, S> {
    publisher: &'a mut Publisher<S>,
    batch_id: BatchIdentifier,
}

impl<'a, S: EnvelopeSink> BatchHandle<'a, S> {
    pub async fn publish(&mut self, mutation: Mutation) -> Result<(), RelsetError> {
        let header = self.publisher.next_header();
        self.publisher
            .sink
            .send(Envelope {
                header,
                operation: BatchOperation::Mutation { batch_id: self.batch_id, mutation },
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::MutationKind;

    fn mutation() -> Mutation {
        Mutation {
            table: "public.orders".into(),
            operation: MutationKind::Insert,
            primary_key: vec!["1".into()],
            columns: None,
        }
    }

    #[tokio::test]
    async fn test_successful_batch_emits_begin_mutation_commit() {
        let mut publisher = Publisher::new(Uuid::new_v4(), Uuid::new_v4(), Vec::<Envelope>::new());
        publisher
            .batch(|mut handle| async move {
                handle.publish(mutation()).await?;
                Ok::<_, RelsetError>(())
            })
            .await
            .unwrap();

        let envelopes = &publisher.sink;
        assert!(matches!(envelopes[0].operation, BatchOperation::Begin { .. }));
        assert!(matches!(envelopes[1].operation, BatchOperation::Mutation { .. }));
        assert!(matches!(envelopes[2].operation, BatchOperation::Commit { .. }));
        assert_eq!(envelopes[0].header.sequence, 1);
        assert_eq!(envelopes[2].header.sequence, 3);
    }

    #[tokio::test]
    async fn test_failed_batch_emits_rollback_and_propagates_error() {
        let mut publisher = Publisher::new(Uuid::new_v4(), Uuid::new_v4(), Vec::<Envelope>::new());
        let result = publisher
            .batch(|_handle| async move { Err::<(), _>(RelsetError::Internal("boom".into())) })
            .await;
        assert!(result.is_err());
        let envelopes = &publisher.sink;
        assert!(matches!(envelopes[1].operation, BatchOperation::Rollback { .. }));
    }

    #[tokio::test]
    async fn test_publisher_remains_usable_after_failure() {
        let mut publisher = Publisher::new(Uuid::new_v4(), Uuid::new_v4(), Vec::<Envelope>::new());
        let _ = publisher
            .batch(|_handle| async move { Err::<(), _>(RelsetError::Internal("boom".into())) })
            .await;
        publisher
            .batch(|mut handle| async move {
                handle.publish(mutation()).await?;
                Ok::<_, RelsetError>(())
            })
            .await
            .unwrap();
        assert_eq!(publisher.sink.len(), 5);
        assert_eq!(publisher.sink[4].header.sequence, 5);
    }
}
