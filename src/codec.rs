//! Binary codec (component A).
//!
//! Wraps MessagePack (via `rmp-serde`) with two distinct strictness modes:
//!
//! - [`encode_strict`]/[`decode_strict`] — used for `ClusterConfiguration`.
//!   Relies on `#[serde(deny_unknown_fields)]` on that type to reject a
//!   payload written by a newer version that added a root-level field this
//!   node doesn't understand.
//! - [`encode_forward_compatible`]/[`decode_forward_compatible`] — used for
//!   `ReplicationSetConfiguration`, `Database`, and `Table`. These types
//!   carry no `deny_unknown_fields`, so an unrecognized field decodes as
//!   ignored rather than rejected, and an older node can still load a set
//!   authored by a newer one as long as it doesn't touch the field it
//!   doesn't understand.
//!
//! Both modes use struct-as-map encoding (`rmp_serde`'s default), not
//! positional tuples, so field order is irrelevant to wire compatibility.

use serde::{de::DeserializeOwned, Serialize};

use crate::error::CodecError;

pub fn encode_strict<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    rmp_serde::to_vec_named(value).map_err(|e| CodecError::Encode(e.to_string()))
}

pub fn decode_strict<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    rmp_serde::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
}

pub fn encode_forward_compatible<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    rmp_serde::to_vec_named(value).map_err(|e| CodecError::Encode(e.to_string()))
}

pub fn decode_forward_compatible<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    rmp_serde::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClusterConfiguration, Database, ReplicationSetConfiguration, Table};
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn sample_cluster() -> ClusterConfiguration {
        let mut databases = BTreeMap::new();
        let node_id = Uuid::new_v4();
        databases.insert(
            node_id,
            Database {
                node_id,
                dsn: "postgres://localhost/db0".into(),
            },
        );
        let mut sets = BTreeMap::new();
        sets.insert(
            "orders".into(),
            ReplicationSetConfiguration {
                name: "orders".into(),
                databases,
                tables: vec![Table {
                    schema: "public".into(),
                    name: "orders".into(),
                    primary_key_columns: vec!["id".into()],
                    watched_columns: vec![],
                }],
            },
        );
        ClusterConfiguration {
            name: "cluster0".into(),
            software_version: "0.1.0".into(),
            sets,
        }
    }

    #[test]
    fn test_strict_round_trip() {
        let cluster = sample_cluster();
        let bytes = encode_strict(&cluster).unwrap();
        let decoded: ClusterConfiguration = decode_strict(&bytes).unwrap();
        assert_eq!(cluster, decoded);
    }

    #[test]
    fn test_strict_rejects_unknown_root_field() {
        use serde_json::json;
        // Build a msgpack map with an extra field the real struct doesn't have.
        let mut buf = Vec::new();
        let mut ser = rmp_serde::Serializer::new(&mut buf).with_struct_map();
        let value = json!({
            "name": "cluster0",
            "software_version": "0.1.0",
            "sets": {},
            "unexpected_field": true,
        });
        serde::Serialize::serialize(&value, &mut ser).unwrap();
        let decoded: Result<ClusterConfiguration, _> = decode_strict(&buf);
        assert!(decoded.is_err());
    }

    #[test]
    fn test_forward_compatible_ignores_unknown_field() {
        use serde_json::json;
        let mut buf = Vec::new();
        let mut ser = rmp_serde::Serializer::new(&mut buf).with_struct_map();
        let value = json!({
            "schema": "public",
            "name": "orders",
            "primary_key_columns": ["id"],
            "watched_columns": [],
            "future_field": "ignored by older nodes",
        });
        serde::Serialize::serialize(&value, &mut ser).unwrap();
        let decoded: Table = decode_forward_compatible(&buf).unwrap();
        assert_eq!(decoded.name, "orders");
    }
}
