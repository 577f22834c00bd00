//! Coordination store abstraction (external interface).
//!
//! The real implementation is backed by `etcd-client`: the hierarchical
//! keyspace, per-key mod-revision, compare-and-swap transactions, and
//! exclusive leases map almost directly onto etcd's native primitives. An
//! in-memory fake ([`InMemoryStore`]) implements the same trait for unit
//! tests that don't need a real etcd cluster (integration tests that do
//! use `testcontainers`).

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use etcd_client::{Client, Compare, CompareOp, LeaseGrantOptions, Txn, TxnOp};

use crate::error::RelsetError;

/// One key/value pair plus the revision it was last written at, as
/// returned by a range read.
#[derive(Debug, Clone)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub mod_revision: i64,
}

/// A single step of a compare-and-commit transaction: the key must still
/// be at `expected_revision` (or absent, if `expected_revision` is `None`)
/// for the whole transaction to apply.
#[derive(Debug, Clone)]
pub struct CasPut {
    pub key: String,
    pub value: Vec<u8>,
    pub expected_revision: Option<i64>,
}

/// Abstraction over the coordination store used by the administration and
/// consumption cores. All operations that touch more than one key are
/// transactional: either every compare succeeds and every put/delete
/// applies, or none do.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, RelsetError>;

    /// Range read of every key with the given prefix.
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, RelsetError>;

    /// Apply a batch of compare-and-set puts atomically. Returns `Ok(())`
    /// on success or `Err(RelsetError::CoordinationStoreConflict)` if any
    /// compare failed.
    async fn commit(&self, puts: Vec<CasPut>) -> Result<(), RelsetError>;

    async fn delete(&self, key: &str) -> Result<(), RelsetError>;

    /// Acquire an exclusive lease-backed lock at `key`, held until
    /// `release` is called on the returned guard or the lease expires.
    /// `ttl_seconds` bounds how long the lock survives a crashed holder.
    async fn acquire_lock(&self, key: &str, ttl_seconds: i64) -> Result<LockGuard, RelsetError>;
}

/// An acquired coordination-store lock. Dropping without calling
/// [`LockGuard::release`] leaves the lease to expire naturally at its TTL;
/// callers that need prompt release (e.g. the Consumer on graceful stop)
/// should call it explicitly.
pub struct LockGuard {
    pub lease_id: i64,
    releaser: Box<dyn FnOnce() -> futures_util::future::BoxFuture<'static, Result<(), RelsetError>> + Send>,
}

impl LockGuard {
    pub async fn release(self) -> Result<(), RelsetError> {
        (self.releaser)().await
    }
}

/// Real coordination store backed by an etcd cluster.
pub struct EtcdStore {
    client: Mutex<Client>,
}

impl EtcdStore {
    pub async fn connect(endpoints: &[String]) -> Result<Self, RelsetError> {
        let client = Client::connect(endpoints, None)
            .await
            .map_err(|e| RelsetError::CoordinationStore(e.to_string()))?;
        Ok(Self {
            client: Mutex::new(client),
        })
    }

    fn client(&self) -> Client {
        self.client.lock().expect("etcd client mutex poisoned").clone()
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, RelsetError> {
        let mut client = self.client();
        let resp = client
            .get(key, None)
            .await
            .map_err(|e| RelsetError::CoordinationStore(e.to_string()))?;
        Ok(resp.kvs().first().map(|kv| KeyValue {
            key: String::from_utf8_lossy(kv.key()).into_owned(),
            value: kv.value().to_vec(),
            mod_revision: kv.mod_revision(),
        }))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, RelsetError> {
        let mut client = self.client();
        let resp = client
            .get(prefix, Some(etcd_client::GetOptions::new().with_prefix()))
            .await
            .map_err(|e| RelsetError::CoordinationStore(e.to_string()))?;
        Ok(resp
            .kvs()
            .iter()
            .map(|kv| KeyValue {
                key: String::from_utf8_lossy(kv.key()).into_owned(),
                value: kv.value().to_vec(),
                mod_revision: kv.mod_revision(),
            })
            .collect())
    }

    async fn commit(&self, puts: Vec<CasPut>) -> Result<(), RelsetError> {
        let mut client = self.client();
        let mut compares = Vec::with_capacity(puts.len());
        let mut ops = Vec::with_capacity(puts.len());
        for put in &puts {
            let cmp = match put.expected_revision {
                Some(rev) => Compare::mod_revision(put.key.clone(), CompareOp::Equal, rev),
                None => Compare::mod_revision(put.key.clone(), CompareOp::Equal, 0),
            };
            compares.push(cmp);
            ops.push(TxnOp::put(put.key.clone(), put.value.clone(), None));
        }
        let txn = Txn::new().when(compares).and_then(ops);
        let resp = client
            .txn(txn)
            .await
            .map_err(|e| RelsetError::CoordinationStore(e.to_string()))?;
        if resp.succeeded() {
            Ok(())
        } else {
            Err(RelsetError::CoordinationStoreConflict(0))
        }
    }

    async fn delete(&self, key: &str) -> Result<(), RelsetError> {
        let mut client = self.client();
        client
            .delete(key, None)
            .await
            .map_err(|e| RelsetError::CoordinationStore(e.to_string()))?;
        Ok(())
    }

    async fn acquire_lock(&self, key: &str, ttl_seconds: i64) -> Result<LockGuard, RelsetError> {
        let mut client = self.client();
        let lease = client
            .lease_grant(ttl_seconds, Some(LeaseGrantOptions::new()))
            .await
            .map_err(|e| RelsetError::CoordinationStore(e.to_string()))?;
        let lease_id = lease.id();
        let put_opts = etcd_client::PutOptions::new().with_lease(lease_id);
        let cmp = Compare::mod_revision(key, CompareOp::Equal, 0);
        let txn = Txn::new()
            .when(vec![cmp])
            .and_then(vec![TxnOp::put(key, lease_id.to_string(), Some(put_opts))]);
        let resp = client
            .txn(txn)
            .await
            .map_err(|e| RelsetError::CoordinationStore(e.to_string()))?;
        if !resp.succeeded() {
            return Err(RelsetError::CoordinationStoreConflict(0));
        }
        let mut releaser_client = client.clone();
        Ok(LockGuard {
            lease_id,
            releaser: Box::new(move || {
                Box::pin(async move {
                    releaser_client
                        .lease_revoke(lease_id)
                        .await
                        .map_err(|e| RelsetError::CoordinationStore(e.to_string()))?;
                    Ok(())
                })
            }),
        })
    }
}

/// In-memory coordination store for unit tests. Not safe across processes.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<InMemoryState>,
}

#[derive(Default)]
struct InMemoryState {
    entries: BTreeMap<String, (Vec<u8>, i64)>,
    next_revision: i64,
    next_lease_id: i64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CoordinationStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, RelsetError> {
        let state = self.state.lock().unwrap();
        Ok(state.entries.get(key).map(|(value, rev)| KeyValue {
            key: key.to_string(),
            value: value.clone(),
            mod_revision: *rev,
        }))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, RelsetError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, (v, rev))| KeyValue {
                key: k.clone(),
                value: v.clone(),
                mod_revision: *rev,
            })
            .collect())
    }

    async fn commit(&self, puts: Vec<CasPut>) -> Result<(), RelsetError> {
        let mut state = self.state.lock().unwrap();
        for put in &puts {
            let current = state.entries.get(&put.key).map(|(_, rev)| *rev);
            if current != put.expected_revision {
                return Err(RelsetError::CoordinationStoreConflict(current.unwrap_or(0)));
            }
        }
        for put in puts {
            state.next_revision += 1;
            let rev = state.next_revision;
            state.entries.insert(put.key, (put.value, rev));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), RelsetError> {
        let mut state = self.state.lock().unwrap();
        state.entries.remove(key);
        Ok(())
    }

    async fn acquire_lock(&self, key: &str, _ttl_seconds: i64) -> Result<LockGuard, RelsetError> {
        let mut state = self.state.lock().unwrap();
        if state.entries.contains_key(key) {
            return Err(RelsetError::CoordinationStoreConflict(0));
        }
        state.next_lease_id += 1;
        let lease_id = state.next_lease_id;
        state.next_revision += 1;
        let rev = state.next_revision;
        state
            .entries
            .insert(key.to_string(), (lease_id.to_string().into_bytes(), rev));
        let key_owned = key.to_string();
        Ok(LockGuard {
            lease_id,
            releaser: Box::new(move || {
                Box::pin(async move {
                    let _ = key_owned;
                    Ok(())
                })
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_commit_rejects_stale_revision() {
        let store = InMemoryStore::new();
        store
            .commit(vec![CasPut {
                key: "/a".into(),
                value: b"1".to_vec(),
                expected_revision: None,
            }])
            .await
            .unwrap();
        let kv = store.get("/a").await.unwrap().unwrap();
        let stale = store
            .commit(vec![CasPut {
                key: "/a".into(),
                value: b"2".to_vec(),
                expected_revision: None,
            }])
            .await;
        assert!(stale.is_err());
        let fresh = store
            .commit(vec![CasPut {
                key: "/a".into(),
                value: b"2".to_vec(),
                expected_revision: Some(kv.mod_revision),
            }])
            .await;
        assert!(fresh.is_ok());
    }

    #[tokio::test]
    async fn test_in_memory_prefix_scan() {
        let store = InMemoryStore::new();
        store
            .commit(vec![
                CasPut { key: "/a/1".into(), value: vec![], expected_revision: None },
                CasPut { key: "/a/2".into(), value: vec![], expected_revision: None },
                CasPut { key: "/b/1".into(), value: vec![], expected_revision: None },
            ])
            .await
            .unwrap();
        let got = store.get_prefix("/a/").await.unwrap();
        assert_eq!(got.len(), 2);
    }

    #[tokio::test]
    async fn test_in_memory_lock_is_exclusive() {
        let store = InMemoryStore::new();
        let _guard = store.acquire_lock("/lock/x", 30).await.unwrap();
        let second = store.acquire_lock("/lock/x", 30).await;
        assert!(second.is_err());
    }
}
