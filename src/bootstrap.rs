//! Database bootstrap (component C).
//!
//! Brings an uninitialized Postgres database up to the point where it can
//! join a cluster: PGQ extension, schema, `configuration` table with a
//! freshly minted node id and the running software version. Mirrors the
//! `setup_database()` sequence in `pgshovel/administration.py`,
//! translated from ZooKeeper znode creation to an idempotent sequence
//! of `CREATE ... IF NOT EXISTS` statements guarded by a session
//! advisory lock.

use tokio_postgres::Client;
use tracing::info;
use uuid::Uuid;

use crate::acquire::advisory_lock_key_for_dsn;
use crate::cluster::Cluster;
use crate::error::RelsetError;
use crate::pgq;

/// Idempotently configure `client`'s database for membership in `cluster`,
/// returning the node id (freshly generated on first setup, or the
/// existing one if setup had already partially run). Callers are expected
/// to be running inside an open transaction (see
/// [`crate::acquire::ManagedTransaction`]); `setup` does not manage its
/// own transaction boundary.
pub async fn setup(client: &Client, cluster: &Cluster) -> Result<Uuid, RelsetError> {
    let schema = cluster.schema_name();
    let lock_key = advisory_lock_key_for_dsn(&schema);

    if !pgq::try_advisory_lock(client, lock_key).await? {
        return Err(RelsetError::PossibleDeadlock(lock_key));
    }

    let result = setup_locked(client, cluster, &schema).await;

    pgq::advisory_unlock(client, lock_key).await?;
    result
}

async fn setup_locked(client: &Client, cluster: &Cluster, schema: &str) -> Result<Uuid, RelsetError> {
    pgq::ensure_extension(client).await?;

    client
        .execute("CREATE EXTENSION IF NOT EXISTS plpgsql", &[])
        .await
        .map_err(conn_err)?;

    client
        .execute(&format!("CREATE SCHEMA IF NOT EXISTS {schema}"), &[])
        .await
        .map_err(conn_err)?;

    client
        .execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {schema}.configuration (
                    node_id uuid NOT NULL,
                    version text NOT NULL
                )"
            ),
            &[],
        )
        .await
        .map_err(conn_err)?;

    let current_version = env!("CARGO_PKG_VERSION");
    let existing = client
        .query_opt(&format!("SELECT node_id, version FROM {schema}.configuration LIMIT 1"), &[])
        .await
        .map_err(conn_err)?;

    // Setup is repair-safe and always converges `version` to the running
    // software version here; a mismatch is only ever an error on the
    // read-only acquire path, never inside `setup` itself.
    let node_id = if let Some(row) = existing {
        let node_id: Uuid = row.get(0);
        let version: String = row.get(1);
        if version != current_version {
            client
                .execute(&format!("UPDATE {schema}.configuration SET version = $1"), &[&current_version.to_string()])
                .await
                .map_err(conn_err)?;
            info!(%node_id, from = %version, to = %current_version, "database version converged");
        } else {
            info!(%node_id, "database already configured");
        }
        node_id
    } else {
        let node_id = Uuid::new_v4();
        client
            .execute(
                &format!("INSERT INTO {schema}.configuration (node_id, version) VALUES ($1, $2)"),
                &[&node_id, &current_version.to_string()],
            )
            .await
            .map_err(conn_err)?;
        info!(%node_id, "database newly configured");
        node_id
    };

    install_log_function(client, cluster).await?;

    Ok(node_id)
}

/// `CREATE OR REPLACE FUNCTION {schema}.log()`, the single shared audit
/// trigger function referenced by every per-table trigger (component F).
/// Always overwritten on setup, since the body is versioned code; the
/// exact row-to-event synthesis it performs is an external collaborator's
/// contract, not part of this crate's surface.
async fn install_log_function(client: &Client, cluster: &Cluster) -> Result<(), RelsetError> {
    let function = cluster.log_function_name();
    let body = format!(
        r#"
CREATE OR REPLACE FUNCTION {function}() RETURNS trigger
LANGUAGE plpgsql AS $log$
DECLARE
    queue text := TG_ARGV[0];
    row_data RECORD;
    op text;
BEGIN
    IF TG_OP = 'DELETE' THEN
        row_data := OLD;
        op := 'delete';
    ELSE
        row_data := NEW;
        op := lower(TG_OP);
    END IF;
    PERFORM pgq.insert_event(queue, op, encode(row_to_json(row_data)::text::bytea, 'base64'));
    RETURN NULL;
END;
$log$;
"#
    );
    client.batch_execute(&body).await.map_err(conn_err)?;
    Ok(())
}

fn conn_err(e: tokio_postgres::Error) -> RelsetError {
    RelsetError::ConnectionFailed {
        dsn: "<bootstrap>".to_string(),
        cause: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advisory_lock_key_deterministic() {
        let a = advisory_lock_key_for_dsn("pg_relset_prod");
        let b = advisory_lock_key_for_dsn("pg_relset_prod");
        assert_eq!(a, b);
    }
}
