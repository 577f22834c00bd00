//! Managed-database acquirer (component D).
//!
//! `tokio_postgres::Transaction<'a>` borrows its owning `Client`, so it
//! cannot be returned from a function and later committed by a different
//! frame (the orchestrator's commit phase). [`ManagedTransaction`]
//! works around this by owning the `Client` and its connection-driving
//! `JoinHandle` directly and issuing `BEGIN`/`COMMIT`/`ROLLBACK` as plain
//! SQL, trading the typed `Transaction` API for one that survives being
//! moved across an acquire → orchestrate → commit boundary.

use tokio::task::JoinHandle;
use tokio_postgres::{Client, NoTls};
use tracing::warn;
use uuid::Uuid;

use crate::cluster::Cluster;
use crate::error::RelsetError;

/// An owned, open Postgres transaction. Must be resolved with
/// [`ManagedTransaction::commit`] or [`ManagedTransaction::rollback`]
/// before being dropped; dropping unresolved issues a `ROLLBACK` on a
/// best-effort basis and logs a warning, since an unresolved transaction
/// left open at drop time indicates a bug in the caller's control flow.
pub struct ManagedTransaction {
    client: Client,
    connection_task: JoinHandle<()>,
    resolved: bool,
    pub node_id: Uuid,
    pub dsn: String,
}

impl ManagedTransaction {
    /// Connect to `dsn` and issue `BEGIN`.
    pub async fn begin(dsn: &str) -> Result<Self, RelsetError> {
        let (client, connection) = tokio_postgres::connect(dsn, NoTls)
            .await
            .map_err(|e| RelsetError::ConnectionFailed {
                dsn: dsn.to_string(),
                cause: e.to_string(),
            })?;
        let connection_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "postgres connection driver exited with error");
            }
        });
        client
            .execute("BEGIN", &[])
            .await
            .map_err(|e| RelsetError::ConnectionFailed {
                dsn: dsn.to_string(),
                cause: e.to_string(),
            })?;
        Ok(Self {
            client,
            connection_task,
            resolved: false,
            node_id: Uuid::nil(),
            dsn: dsn.to_string(),
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub async fn commit(mut self) -> Result<(), RelsetError> {
        self.client
            .execute("COMMIT", &[])
            .await
            .map_err(|e| RelsetError::ConnectionFailed {
                dsn: self.dsn.clone(),
                cause: e.to_string(),
            })?;
        self.resolved = true;
        Ok(())
    }

    pub async fn rollback(mut self) -> Result<(), RelsetError> {
        self.client
            .execute("ROLLBACK", &[])
            .await
            .map_err(|e| RelsetError::ConnectionFailed {
                dsn: self.dsn.clone(),
                cause: e.to_string(),
            })?;
        self.resolved = true;
        Ok(())
    }
}

impl Drop for ManagedTransaction {
    fn drop(&mut self) {
        if !self.resolved {
            warn!(dsn = %self.dsn, "managed transaction dropped without commit or rollback");
        }
        self.connection_task.abort();
    }
}

/// Options controlling how [`acquire`] treats each member database.
#[derive(Debug, Clone)]
pub struct AcquireOptions {
    /// Run `setup()` (component C) on nodes with no `configuration` table.
    pub configure: bool,
    /// Drop unreachable DSNs from the result instead of failing the whole
    /// acquisition.
    pub skip_inaccessible: bool,
    /// Fail if any acquired node's persisted version differs from another
    /// acquired node's.
    pub require_same_version: bool,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            configure: true,
            skip_inaccessible: false,
            require_same_version: true,
        }
    }
}

/// Connect to every database in `dsns`, beginning a transaction on each,
/// running bootstrap when needed, and detecting duplicate/mismatched
/// nodes. Returns one [`ManagedTransaction`] per successfully acquired
/// DSN, in input order (`skip_inaccessible` may shorten the result).
pub async fn acquire(
    cluster: &Cluster,
    dsns: &[String],
    options: &AcquireOptions,
) -> Result<Vec<ManagedTransaction>, RelsetError> {
    let mut acquired = Vec::with_capacity(dsns.len());
    let mut seen_nodes = std::collections::HashMap::<Uuid, String>::new();

    for dsn in dsns {
        let txn = match ManagedTransaction::begin(dsn).await {
            Ok(txn) => txn,
            Err(e) if options.skip_inaccessible => {
                warn!(dsn = %dsn, error = %e, "skipping inaccessible database");
                continue;
            }
            Err(e) => return Err(e),
        };

        let mut txn = txn;
        let has_schema = schema_exists(&txn, cluster).await?;
        if !has_schema {
            if !options.configure {
                return Err(RelsetError::NotConfigured(dsn.clone()));
            }
            let node_id = crate::bootstrap::setup(txn.client(), cluster)
                .await
                .map_err(|e| RelsetError::NotConfigurable(dsn.clone(), e.to_string()))?;
            txn.node_id = node_id;
        } else {
            txn.node_id = read_node_id(&txn, cluster).await?;
            if options.require_same_version {
                let node_version = read_version(&txn, cluster).await?;
                Cluster::check_version(env!("CARGO_PKG_VERSION"), &node_version)?;
            }
        }

        if let Some(existing_dsn) = seen_nodes.insert(txn.node_id, dsn.clone()) {
            return Err(RelsetError::DuplicateNode {
                dsn_a: existing_dsn,
                dsn_b: dsn.clone(),
                node_id: txn.node_id,
            });
        }

        acquired.push(txn);
    }

    Ok(acquired)
}

async fn schema_exists(txn: &ManagedTransaction, cluster: &Cluster) -> Result<bool, RelsetError> {
    let row = txn
        .client()
        .query_one(
            "SELECT EXISTS (SELECT 1 FROM information_schema.schemata WHERE schema_name = $1)",
            &[&cluster.schema_name()],
        )
        .await
        .map_err(|e| RelsetError::ConnectionFailed {
            dsn: txn.dsn.clone(),
            cause: e.to_string(),
        })?;
    Ok(row.get(0))
}

async fn read_node_id(txn: &ManagedTransaction, cluster: &Cluster) -> Result<Uuid, RelsetError> {
    let sql = format!("SELECT node_id FROM {}.configuration LIMIT 1", cluster.schema_name());
    let row = txn
        .client()
        .query_one(&sql, &[])
        .await
        .map_err(|e| RelsetError::ConnectionFailed {
            dsn: txn.dsn.clone(),
            cause: e.to_string(),
        })?;
    Ok(row.get(0))
}

async fn read_version(txn: &ManagedTransaction, cluster: &Cluster) -> Result<String, RelsetError> {
    let sql = format!("SELECT version FROM {}.configuration LIMIT 1", cluster.schema_name());
    let row = txn
        .client()
        .query_one(&sql, &[])
        .await
        .map_err(|e| RelsetError::ConnectionFailed {
            dsn: txn.dsn.clone(),
            cause: e.to_string(),
        })?;
    Ok(row.get(0))
}

/// Used by the advisory-lock-guarded path of `setup()` in
/// [`crate::bootstrap`] to derive a stable per-DSN lock key.
pub fn advisory_lock_key_for_dsn(dsn: &str) -> i64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    dsn.hash(&mut hasher);
    hasher.finish() as i64
}

