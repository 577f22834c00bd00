//! Cluster handle (component B).
//!
//! Derives coordination-store paths and Postgres object names from a
//! cluster name, so every other component constructs keys/names the same
//! way instead of hand-formatting strings.

use std::sync::Arc;

use crate::coordination_store::CoordinationStore;
use crate::error::RelsetError;

/// A handle to a named cluster: the coordination-store path namespace plus
/// the store connection used to read and write it. Cheap to clone.
#[derive(Clone)]
pub struct Cluster {
    name: String,
    store: Arc<dyn CoordinationStore>,
}

impl Cluster {
    pub fn new(name: impl Into<String>, store: Arc<dyn CoordinationStore>) -> Self {
        Self { name: name.into(), store }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    /// Root coordination-store key holding the encoded `ClusterConfiguration`.
    pub fn root_path(&self) -> String {
        format!("/pg_relset/{}/cluster", self.name)
    }

    /// Key prefix under which every replication set's lock and lease state
    /// lives.
    pub fn sets_prefix(&self) -> String {
        format!("/pg_relset/{}/sets/", self.name)
    }

    /// Per-set lock key used to serialize administration operations
    /// (`create_set`/`update_set`/`drop_set`) against one another.
    pub fn set_lock_path(&self, set_name: &str) -> String {
        format!("{}{}/lock", self.sets_prefix(), set_name)
    }

    /// Per-set, per-consumer-group ownership lease key used by the
    /// Consumer to claim exclusive capture of a set.
    pub fn consumer_lease_path(&self, set_name: &str, consumer_group: &str) -> String {
        format!("{}{}/consumers/{}/lease", self.sets_prefix(), set_name, consumer_group)
    }

    /// Schema name used on every member database for this cluster's
    /// bookkeeping tables (`configuration`, PGQ queues).
    pub fn schema_name(&self) -> String {
        format!("pg_relset_{}", sanitize(&self.name))
    }

    /// PGQ queue name for a given replication set.
    pub fn queue_name(&self, set_name: &str) -> String {
        format!("pg_relset_{}_{}", sanitize(&self.name), sanitize(set_name))
    }

    /// The single shared audit trigger function installed once per schema
    /// (component C) and referenced by every per-table trigger (component F).
    pub fn log_function_name(&self) -> String {
        format!("{}.log", self.schema_name())
    }

    pub fn advisory_lock_key(node_dsn_hash: i64) -> i64 {
        node_dsn_hash
    }

    /// Compare the running software version against a node's persisted
    /// version, returning `VersionMismatch` if they differ in major.minor.
    pub fn check_version(local: &str, node: &str) -> Result<(), RelsetError> {
        fn major_minor(v: &str) -> &str {
            let mut parts = v.splitn(3, '.');
            let _major = parts.next();
            let _minor = parts.next();
            let idx = v
                .match_indices('.')
                .nth(1)
                .map(|(i, _)| i)
                .unwrap_or(v.len());
            &v[..idx]
        }
        if major_minor(local) != major_minor(node) {
            return Err(RelsetError::VersionMismatch {
                local: local.to_string(),
                node: node.to_string(),
            });
        }
        Ok(())
    }
}

/// Standard semver-ish ordering: compare dot-separated numeric components
/// left to right, treating a missing trailing component as `0`. Used by
/// `upgrade_cluster` to require `new_version > stored_version` rather than
/// the major.minor equality [`Cluster::check_version`] enforces elsewhere.
pub fn version_is_greater(new: &str, stored: &str) -> bool {
    fn components(v: &str) -> Vec<u64> {
        v.split('.').map(|p| p.parse().unwrap_or(0)).collect()
    }
    let (a, b) = (components(new), components(stored));
    let len = a.len().max(b.len());
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        if x != y {
            return x > y;
        }
    }
    false
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination_store::InMemoryStore;

    fn cluster() -> Cluster {
        Cluster::new("prod", Arc::new(InMemoryStore::new()))
    }

    #[test]
    fn test_paths_are_namespaced_by_cluster_name() {
        let c = cluster();
        assert_eq!(c.root_path(), "/pg_relset/prod/cluster");
        assert!(c.set_lock_path("orders").starts_with(&c.sets_prefix()));
    }

    #[test]
    fn test_queue_name_sanitized() {
        let c = Cluster::new("My Cluster", Arc::new(InMemoryStore::new()));
        assert_eq!(c.queue_name("Order Set"), "pg_relset_my_cluster_order_set");
    }

    #[test]
    fn test_version_check() {
        assert!(Cluster::check_version("0.1.0", "0.1.3").is_ok());
        assert!(Cluster::check_version("0.1.0", "0.2.0").is_err());
    }

    #[test]
    fn test_version_is_greater_is_numeric_not_lexicographic() {
        assert!(version_is_greater("0.10.0", "0.9.0"));
        assert!(!version_is_greater("0.9.0", "0.10.0"));
        assert!(!version_is_greater("0.1.0", "0.1.0"));
    }
}
