//! Trigger manager (component F).
//!
//! Installs, replaces, and drops the per-table `AFTER INSERT OR UPDATE OR
//! DELETE` trigger that dispatches change events into the table's
//! replication set's PGQ queue. Every trigger invokes the single shared
//! `{schema}.log()` function installed once per database by
//! [`crate::bootstrap`] (component C), passing four positional arguments
//! — queue name, encoded primary-key column list, encoded watched-column
//! list, config version fingerprint. The function body that reconstructs
//! them is that component's contract, not this one's. Grounded in
//! `src/cdc.rs`'s `create_change_trigger`/
//! `drop_change_trigger` for the `DROP TRIGGER IF EXISTS` + `CREATE
//! TRIGGER` idiom, generalized here to a shared rather than per-table
//! function.

use tokio_postgres::Client;

use crate::cluster::Cluster;
use crate::codec;
use crate::error::RelsetError;
use crate::model::Table;

fn conn_err(e: tokio_postgres::Error) -> RelsetError {
    RelsetError::ConnectionFailed {
        dsn: "<trigger>".to_string(),
        cause: e.to_string(),
    }
}

/// Opaque-encode a value for embedding as a trigger argument literal.
/// Trigger arguments are SQL string literals baked into `CREATE TRIGGER`
/// itself (not bind parameters), so the encoded form must be safe to
/// splice directly into SQL; hex of the msgpack bytes is both opaque and
/// injection-safe without further quoting.
fn encode_trigger_arg<T: serde::Serialize>(value: &T) -> Result<String, RelsetError> {
    let bytes = codec::encode_forward_compatible(value)?;
    Ok(bytes.iter().map(|b| format!("{b:02x}")).collect())
}

fn trigger_name(table: &Table) -> String {
    format!("pg_relset_capture_{}", sanitize(&table.name))
}

/// Install (or replace) the change trigger for `table` within `set_name`,
/// stamping it with `version`. Idempotent:
/// `DROP TRIGGER IF EXISTS` before `CREATE TRIGGER` so re-running after a
/// column-set or version change is safe.
pub async fn install_trigger(
    client: &Client,
    cluster: &Cluster,
    set_name: &str,
    table: &Table,
    version: &str,
) -> Result<(), RelsetError> {
    let queue = cluster.queue_name(set_name);
    let function = cluster.log_function_name();
    let name = trigger_name(table);
    let update_of = table.trigger_columns()?.join(", ");

    let queue_arg = encode_trigger_arg(&queue)?;
    let pkeys_arg = encode_trigger_arg(&table.primary_key_columns)?;
    let cols_arg = encode_trigger_arg(&table.watched_columns)?;
    let version_arg = encode_trigger_arg(&version)?;

    client
        .execute(&format!("DROP TRIGGER IF EXISTS {name} ON {}", table.qualified_name()), &[])
        .await
        .map_err(conn_err)?;

    client
        .execute(
            &format!(
                "CREATE TRIGGER {name} AFTER INSERT OR DELETE OR UPDATE OF {update_of} \
                 ON {table} FOR EACH ROW EXECUTE FUNCTION {function}('{queue_arg}', '{pkeys_arg}', '{cols_arg}', '{version_arg}')",
                table = table.qualified_name(),
            ),
            &[],
        )
        .await
        .map_err(conn_err)?;

    Ok(())
}

/// Remove the change trigger for `table`. Fatal if missing — callers
/// should already know from the previous configuration whether it exists.
pub async fn drop_trigger(
    client: &Client,
    _cluster: &Cluster,
    _set_name: &str,
    table: &Table,
) -> Result<(), RelsetError> {
    client
        .execute(&format!("DROP TRIGGER {} ON {}", trigger_name(table), table.qualified_name()), &[])
        .await
        .map_err(conn_err)?;
    Ok(())
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Table {
        Table {
            schema: "public".into(),
            name: "orders".into(),
            primary_key_columns: vec!["id".into()],
            watched_columns: vec!["status".into()],
        }
    }

    #[test]
    fn test_trigger_arg_encoding_is_hex() {
        let encoded = encode_trigger_arg(&vec!["id".to_string()]).unwrap();
        assert!(encoded.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_trigger_name_is_sanitized() {
        assert_eq!(trigger_name(&table()), "pg_relset_capture_orders");
    }
}
