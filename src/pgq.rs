//! Thin wrappers over the PGQ Postgres extension's SQL functions.
//!
//! Grounded in `src/cdc.rs`: that module builds trigger
//! bodies and calls them via `Spi::run(...).map_err(...)`; here the same
//! statements are issued over `tokio_postgres` instead of in-process SPI,
//! since this crate runs as an external client rather than a loaded
//! extension.

use tokio_postgres::GenericClient;

use crate::error::RelsetError;

fn sql_err(context: &str, e: tokio_postgres::Error) -> RelsetError {
    RelsetError::ConnectionFailed {
        dsn: context.to_string(),
        cause: e.to_string(),
    }
}

/// `CREATE EXTENSION IF NOT EXISTS pgq`. Idempotent.
pub async fn ensure_extension<C: GenericClient>(client: &C) -> Result<(), RelsetError> {
    client
        .execute("CREATE EXTENSION IF NOT EXISTS pgq", &[])
        .await
        .map_err(|e| sql_err("pgq.ensure_extension", e))?;
    Ok(())
}

/// `pgq.create_queue(name)`. No-ops if the queue already exists.
pub async fn create_queue<C: GenericClient>(client: &C, queue: &str) -> Result<(), RelsetError> {
    client
        .execute("SELECT pgq.create_queue($1)", &[&queue])
        .await
        .map_err(|e| sql_err("pgq.create_queue", e))?;
    Ok(())
}

/// `pgq.drop_queue(name)`.
pub async fn drop_queue<C: GenericClient>(client: &C, queue: &str) -> Result<(), RelsetError> {
    client
        .execute("SELECT pgq.drop_queue($1)", &[&queue])
        .await
        .map_err(|e| sql_err("pgq.drop_queue", e))?;
    Ok(())
}

/// `pgq.insert_event(queue, event_type, event_data)`. Used by the trigger
/// function body, not called directly by this crate at runtime, but
/// exposed so tests can inject synthetic events.
pub async fn insert_event<C: GenericClient>(
    client: &C,
    queue: &str,
    event_type: &str,
    event_data: &[u8],
) -> Result<(), RelsetError> {
    client
        .execute(
            "SELECT pgq.insert_event($1, $2, encode($3, 'base64'))",
            &[&queue, &event_type, &event_data],
        )
        .await
        .map_err(|e| sql_err("pgq.insert_event", e))?;
    Ok(())
}

/// `pgq.register_consumer(queue, consumer_id)`. Returns `true` if this
/// call newly registered the consumer (vs. it already being registered).
pub async fn register_consumer<C: GenericClient>(
    client: &C,
    queue: &str,
    consumer_id: &str,
) -> Result<bool, RelsetError> {
    let row = client
        .query_one("SELECT pgq.register_consumer($1, $2)", &[&queue, &consumer_id])
        .await
        .map_err(|e| sql_err("pgq.register_consumer", e))?;
    Ok(row.get::<_, i32>(0) != 0)
}

/// `pgq.unregister_consumer(queue, consumer_id)`.
pub async fn unregister_consumer<C: GenericClient>(
    client: &C,
    queue: &str,
    consumer_id: &str,
) -> Result<(), RelsetError> {
    client
        .execute("SELECT pgq.unregister_consumer($1, $2)", &[&queue, &consumer_id])
        .await
        .map_err(|e| sql_err("pgq.unregister_consumer", e))?;
    Ok(())
}

/// Opaque handle to a batch reserved by `pgq.next_batch_info`. `None`
/// means no batch was ready.
#[derive(Debug, Clone, Copy)]
pub struct BatchHandle(pub i64);

/// `pgq.next_batch_info(queue, consumer_id)`. Reserves the next batch of
/// events for this consumer, or returns `None` if none is ready yet.
pub async fn next_batch_info<C: GenericClient>(
    client: &C,
    queue: &str,
    consumer_id: &str,
) -> Result<Option<BatchHandle>, RelsetError> {
    let row = client
        .query_one(
            "SELECT pgq.next_batch_info($1, $2)",
            &[&queue, &consumer_id],
        )
        .await
        .map_err(|e| sql_err("pgq.next_batch_info", e))?;
    let batch_id: Option<i64> = row.get(0);
    Ok(batch_id.map(BatchHandle))
}

/// One raw event row from `pgq.get_batch_events`.
pub struct RawEvent {
    pub event_id: i64,
    pub event_type: String,
    pub event_data: Vec<u8>,
}

/// `pgq.get_batch_events(batch_id)`.
pub async fn get_batch_events<C: GenericClient>(
    client: &C,
    batch: BatchHandle,
) -> Result<Vec<RawEvent>, RelsetError> {
    let rows = client
        .query(
            "SELECT ev_id, ev_type, decode(ev_data, 'base64') FROM pgq.get_batch_events($1)",
            &[&batch.0],
        )
        .await
        .map_err(|e| sql_err("pgq.get_batch_events", e))?;
    Ok(rows
        .into_iter()
        .map(|row| RawEvent {
            event_id: row.get(0),
            event_type: row.get(1),
            event_data: row.get(2),
        })
        .collect())
}

/// `pgq.finish_batch(batch_id)`. Must be called on the same connection
/// that reserved the batch via `next_batch_info`.
pub async fn finish_batch<C: GenericClient>(client: &C, batch: BatchHandle) -> Result<(), RelsetError> {
    client
        .execute("SELECT pgq.finish_batch($1)", &[&batch.0])
        .await
        .map_err(|e| sql_err("pgq.finish_batch", e))?;
    Ok(())
}

/// Session-scoped advisory lock, used by the acquirer to guard concurrent
/// bootstrap of the same uninitialized node. Returns `false` (not an
/// error) if the lock is already held elsewhere, since the caller maps
/// that to `RelsetError::PossibleDeadlock` with more context.
pub async fn try_advisory_lock<C: GenericClient>(client: &C, key: i64) -> Result<bool, RelsetError> {
    let row = client
        .query_one("SELECT pg_try_advisory_lock($1)", &[&key])
        .await
        .map_err(|e| sql_err("pg_try_advisory_lock", e))?;
    Ok(row.get(0))
}

pub async fn advisory_unlock<C: GenericClient>(client: &C, key: i64) -> Result<(), RelsetError> {
    client
        .execute("SELECT pg_advisory_unlock($1)", &[&key])
        .await
        .map_err(|e| sql_err("pg_advisory_unlock", e))?;
    Ok(())
}
