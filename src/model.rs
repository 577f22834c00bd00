//! Data model (cluster / replication-set / database / table configuration).
//!
//! These types are the payloads stored in the coordination store and
//! exchanged with [`crate::codec`]. `ClusterConfiguration` is the strict
//! root: unknown fields are rejected so a downgraded node never silently
//! ignores a field it doesn't understand. `ReplicationSetConfiguration`,
//! `Database`, and `Table` are forward-compatible: a node running an older
//! minor version can load a set authored by a newer one.

use std::collections::BTreeMap;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec;
use crate::error::RelsetError;

/// Root configuration object stored at a cluster's root coordination-store
/// key. Strict: an unrecognized field at this level is a hard error, since
/// the root is read by every node in the cluster on every acquisition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfiguration {
    /// Cluster-unique name, used to namespace the coordination-store path.
    pub name: String,
    /// Software version that authored this configuration (`CARGO_PKG_VERSION`).
    pub software_version: String,
    /// Replication sets known to this cluster, keyed by set name.
    pub sets: BTreeMap<String, ReplicationSetConfiguration>,
}

/// Configuration of a single replication set: the databases it spans and
/// the tables captured from each.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationSetConfiguration {
    pub name: String,
    pub databases: BTreeMap<Uuid, Database>,
    pub tables: Vec<Table>,
}

/// A single member database of a replication set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Database {
    pub node_id: Uuid,
    pub dsn: String,
}

/// A captured table and the columns that trigger a change event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub schema: String,
    pub name: String,
    /// Primary key column names, in declaration order.
    pub primary_key_columns: Vec<String>,
    /// Additional columns that, on `UPDATE`, should trigger a change event
    /// even when no primary key column changed. De-duplicated against
    /// `primary_key_columns` by [`Table::trigger_columns`].
    pub watched_columns: Vec<String>,
}

impl Table {
    /// Columns the `UPDATE OF` clause of the change trigger should list:
    /// `primary_key_columns` followed by `watched_columns`, minus
    /// duplicates, preserving first-seen order. A table with zero primary
    /// key columns cannot be captured.
    pub fn trigger_columns(&self) -> Result<Vec<String>, RelsetError> {
        if self.primary_key_columns.is_empty() {
            return Err(RelsetError::InvalidConfiguration(format!(
                "table {}.{} has no primary key columns",
                self.schema, self.name
            )));
        }
        let mut seen = std::collections::BTreeSet::new();
        let mut out = Vec::new();
        for col in self.primary_key_columns.iter().chain(self.watched_columns.iter()) {
            if seen.insert(col.clone()) {
                out.push(col.clone());
            }
        }
        Ok(out)
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

impl ReplicationSetConfiguration {
    /// Node ids for every member database of this set.
    pub fn node_ids(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.databases.keys().copied()
    }
}

/// MD5 fingerprint of a configuration's canonical encoded bytes, used as
/// the `version` column stamped into every member database and the
/// coordination-store entry. Two configurations that encode identically
/// produce the same fingerprint regardless of in-memory representation
/// (e.g. `BTreeMap` iteration order is already canonical).
pub fn version<T: Serialize>(config: &T) -> Result<String, RelsetError> {
    let bytes = codec::encode_forward_compatible(config)?;
    let mut hasher = Md5::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_set() -> ReplicationSetConfiguration {
        ReplicationSetConfiguration {
            name: "orders".into(),
            databases: BTreeMap::new(),
            tables: vec![Table {
                schema: "public".into(),
                name: "orders".into(),
                primary_key_columns: vec!["id".into()],
                watched_columns: vec!["id".into(), "status".into()],
            }],
        }
    }

    #[test]
    fn test_trigger_columns_dedup_preserves_order() {
        let cols = sample_set().tables[0].trigger_columns().unwrap();
        assert_eq!(cols, vec!["id".to_string(), "status".to_string()]);
    }

    #[test]
    fn test_trigger_columns_rejects_empty_primary_key() {
        let t = Table {
            schema: "public".into(),
            name: "t".into(),
            primary_key_columns: vec![],
            watched_columns: vec![],
        };
        assert!(t.trigger_columns().is_err());
    }

    #[test]
    fn test_version_is_deterministic() {
        let set = sample_set();
        let v1 = version(&set).unwrap();
        let v2 = version(&set.clone()).unwrap();
        assert_eq!(v1, v2);
    }

    #[test]
    fn test_version_changes_with_content() {
        let mut set = sample_set();
        let v1 = version(&set).unwrap();
        set.tables[0].watched_columns.push("updated_at".into());
        let v2 = version(&set).unwrap();
        assert_ne!(v1, v2);
    }
}
