//! Ambient configuration layer.
//!
//! Loaded from an optional TOML file overlaid with `PG_RELSET_*` environment
//! variables, following the layering convention used by sibling CLI crates
//! in this corpus (GUC-style defaults overridden by explicit
//! environment/config values). This crate has no GUCs of its own since it
//! runs outside Postgres, so configuration lives here instead of
//! `config.rs`'s `register_gucs()` pattern.

use serde::Deserialize;

use crate::error::RelsetError;

/// Process-wide settings for a `pg_relset` node (CLI invocation or
/// long-running coordinator).
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Coordination store endpoints, e.g. `["http://127.0.0.1:2379"]`.
    #[serde(default = "default_coordination_endpoints")]
    pub coordination_endpoints: Vec<String>,

    /// Cluster name; namespaces every coordination-store path.
    pub cluster_name: String,

    /// Identity reported to PGQ's `register_consumer` and used as the
    /// Consumer's lease holder identity. Defaults to a random UUID if
    /// unset so two instances never collide.
    #[serde(default)]
    pub consumer_group: Option<String>,

    /// How often the Consumer polls `pgq.next_batch_info` when no batch is
    /// immediately available.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// TTL, in seconds, of the coordination-store lease backing a
    /// Consumer's ownership lock.
    #[serde(default = "default_lease_ttl_seconds")]
    pub lease_ttl_seconds: i64,
}

fn default_coordination_endpoints() -> Vec<String> {
    vec!["http://127.0.0.1:2379".to_string()]
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_lease_ttl_seconds() -> i64 {
    30
}

impl Settings {
    /// Load from `path` (TOML) if given, then overlay `PG_RELSET_*`
    /// environment variables (`PG_RELSET_CLUSTER_NAME`,
    /// `PG_RELSET_COORDINATION_ENDPOINTS` as a comma-separated list,
    /// `PG_RELSET_CONSUMER_GROUP`, `PG_RELSET_POLL_INTERVAL_MS`,
    /// `PG_RELSET_LEASE_TTL_SECONDS`).
    pub fn load(path: Option<&std::path::Path>) -> Result<Self, RelsetError> {
        let mut settings: Settings = match path {
            Some(p) => {
                let text = std::fs::read_to_string(p)
                    .map_err(|e| RelsetError::Internal(format!("reading {}: {e}", p.display())))?;
                toml::from_str(&text)
                    .map_err(|e| RelsetError::Internal(format!("parsing {}: {e}", p.display())))?
            }
            None => Settings {
                coordination_endpoints: default_coordination_endpoints(),
                cluster_name: std::env::var("PG_RELSET_CLUSTER_NAME").map_err(|_| {
                    RelsetError::Internal("PG_RELSET_CLUSTER_NAME is required without a config file".into())
                })?,
                consumer_group: None,
                poll_interval_ms: default_poll_interval_ms(),
                lease_ttl_seconds: default_lease_ttl_seconds(),
            },
        };

        if let Ok(endpoints) = std::env::var("PG_RELSET_COORDINATION_ENDPOINTS") {
            settings.coordination_endpoints = endpoints.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(name) = std::env::var("PG_RELSET_CLUSTER_NAME") {
            settings.cluster_name = name;
        }
        if let Ok(group) = std::env::var("PG_RELSET_CONSUMER_GROUP") {
            settings.consumer_group = Some(group);
        }
        if let Ok(interval) = std::env::var("PG_RELSET_POLL_INTERVAL_MS") {
            settings.poll_interval_ms = interval
                .parse()
                .map_err(|_| RelsetError::Internal("PG_RELSET_POLL_INTERVAL_MS must be an integer".into()))?;
        }
        if let Ok(ttl) = std::env::var("PG_RELSET_LEASE_TTL_SECONDS") {
            settings.lease_ttl_seconds = ttl
                .parse()
                .map_err(|_| RelsetError::Internal("PG_RELSET_LEASE_TTL_SECONDS must be an integer".into()))?;
        }

        Ok(settings)
    }

    pub fn consumer_identity(&self) -> String {
        self.consumer_group
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        assert_eq!(default_poll_interval_ms(), 500);
        assert_eq!(default_lease_ttl_seconds(), 30);
    }
}
