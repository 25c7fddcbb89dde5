//! In-memory store backend.
//!
//! Hashes in a `DashMap`, advisory locks as per-key tokio mutexes. Used by
//! the test suite and by single-node dry runs where a Redis server would be
//! overkill. Semantics match the Redis backend: missing hashes read as
//! empty, `hincr` treats absent fields as zero.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use tokio::sync::Mutex;

use super::{LOCK_ACQUIRE_TIMEOUT, LockGuard, Store, StoreError};

#[derive(Default)]
pub struct MemoryStore {
    hashes: DashMap<String, HashMap<String, String>>,
    sets: DashMap<String, HashSet<String>>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    leader: Mutex<Option<(String, Instant)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        Ok(self
            .hashes
            .get(key)
            .map(|entry| entry.clone())
            .unwrap_or_default())
    }

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError> {
        let mut entry = self.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            entry.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn hincr(&self, key: &str, field: &str, delta: Decimal) -> Result<Decimal, StoreError> {
        // The dashmap entry guard serializes concurrent increments per key.
        let mut entry = self.hashes.entry(key.to_string()).or_default();
        let current = match entry.get(field) {
            Some(raw) => Decimal::from_str(raw).map_err(|e| {
                StoreError::Fatal(format!("hincr on non-numeric field {key}.{field}: {e}"))
            })?,
            None => Decimal::ZERO,
        };
        let next = current + delta;
        entry.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        // Hash and set keys share one namespace, like they would on a
        // Redis server.
        Ok(self
            .hashes
            .iter()
            .map(|entry| entry.key().clone())
            .chain(self.sets.iter().map(|entry| entry.key().clone()))
            .filter(|key| key.starts_with(prefix))
            .collect())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<(), StoreError> {
        if let Some(mut entry) = self.sets.get_mut(key) {
            entry.remove(member);
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .sets
            .get(key)
            .map(|entry| entry.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.hashes.remove(key);
        self.sets.remove(key);
        Ok(())
    }

    async fn lock(&self, key: &str) -> Result<LockGuard, StoreError> {
        let mutex = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = tokio::time::timeout(LOCK_ACQUIRE_TIMEOUT, mutex.lock_owned())
            .await
            .map_err(|_| StoreError::Transient(format!("lock {key}: acquire timed out")))?;
        Ok(LockGuard::new(Box::new(guard)))
    }

    async fn try_leader(&self, owner: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut leader = self.leader.lock().await;
        let now = Instant::now();
        match leader.as_ref() {
            Some((holder, expires)) if holder != owner && *expires > now => Ok(false),
            _ => {
                *leader = Some((owner.to_string(), now + ttl));
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[tokio::test]
    async fn missing_hash_reads_empty() {
        let store = MemoryStore::new();
        assert!(store.hget_all("bal_BTC").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn hincr_starts_from_zero_and_accumulates() {
        let store = MemoryStore::new();
        let v = store.hincr("bal_USDT", "free", dec("100.5")).await.unwrap();
        assert_eq!(v, dec("100.5"));
        let v = store.hincr("bal_USDT", "free", dec("-0.5")).await.unwrap();
        assert_eq!(v, dec("100"));
    }

    #[tokio::test]
    async fn prefix_scan_filters() {
        let store = MemoryStore::new();
        store
            .hset("ord_1", &[("status".into(), "new".into())])
            .await
            .unwrap();
        store
            .hset("bal_BTC", &[("free".into(), "1".into())])
            .await
            .unwrap();
        let keys = store.keys_with_prefix("ord_").await.unwrap();
        assert_eq!(keys, vec!["ord_1".to_string()]);
    }

    #[tokio::test]
    async fn set_ops_round_trip() {
        let store = MemoryStore::new();
        assert!(store.smembers("idx_status_new").await.unwrap().is_empty());

        store.sadd("idx_status_new", "oid-1").await.unwrap();
        store.sadd("idx_status_new", "oid-2").await.unwrap();
        store.sadd("idx_status_new", "oid-1").await.unwrap();
        let mut members = store.smembers("idx_status_new").await.unwrap();
        members.sort();
        assert_eq!(members, vec!["oid-1".to_string(), "oid-2".to_string()]);

        store.srem("idx_status_new", "oid-1").await.unwrap();
        store.srem("idx_status_new", "missing").await.unwrap();
        assert_eq!(
            store.smembers("idx_status_new").await.unwrap(),
            vec!["oid-2".to_string()]
        );
    }

    #[tokio::test]
    async fn lock_excludes_second_holder() {
        let store = Arc::new(MemoryStore::new());
        let guard = store.lock("ord_1").await.unwrap();

        let store2 = store.clone();
        let contender = tokio::spawn(async move { store2.lock("ord_1").await.unwrap() });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished(), "second lock() should block");

        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn leader_lock_is_exclusive_until_expiry() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(30);
        assert!(store.try_leader("a", ttl).await.unwrap());
        assert!(!store.try_leader("b", ttl).await.unwrap());
        // Renewal by the holder keeps working.
        assert!(store.try_leader("a", ttl).await.unwrap());
    }
}
