//! In-process store for tests and single-node simulations

use super::{merge_fields, StateStore, Subscription, Watchers};
use crate::errors::{CrashResult, StoreError};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Mutex;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<String, Value>>,
    watchers: Watchers,
    faults: Mutex<FaultPlan>,
}

/// Injected write failures: let `skip` writes through, then fail `fail`
#[derive(Debug, Default, Clone, Copy)]
struct FaultPlan {
    skip: usize,
    fail: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` writes fail with `StoreUnavailable`
    pub fn fail_next_writes(&self, count: usize) {
        self.fail_writes_after(0, count);
    }

    /// Let `ok` writes succeed, then fail the following `count`
    pub fn fail_writes_after(&self, ok: usize, count: usize) {
        if let Ok(mut plan) = self.faults.lock() {
            *plan = FaultPlan { skip: ok, fail: count };
        }
    }

    fn check_write(&self, key: &str) -> CrashResult<()> {
        let Ok(mut plan) = self.faults.lock() else {
            return Ok(());
        };
        if plan.skip > 0 {
            plan.skip -= 1;
            return Ok(());
        }
        if plan.fail > 0 {
            plan.fail -= 1;
            return Err(StoreError::Unavailable(format!("injected failure writing {}", key)).into());
        }
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> CrashResult<Option<Value>> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> CrashResult<()> {
        self.check_write(key)?;
        let mut records = self.records.write().await;
        records.insert(key.to_string(), value.clone());
        // notify under the guard so observers see writes in store order
        self.watchers.notify(key, &value);
        Ok(())
    }

    async fn update(&self, key: &str, fields: Value) -> CrashResult<Value> {
        self.check_write(key)?;
        let mut records = self.records.write().await;
        let merged = merge_fields(records.remove(key), fields);
        records.insert(key.to_string(), merged.clone());
        self.watchers.notify(key, &merged);
        Ok(merged)
    }

    async fn set_batch(&self, entries: Vec<(String, Value)>) -> CrashResult<()> {
        if let Some((first, _)) = entries.first() {
            self.check_write(first)?;
        }
        let mut records = self.records.write().await;
        for (key, value) in &entries {
            records.insert(key.clone(), value.clone());
        }
        for (key, value) in &entries {
            self.watchers.notify(key, value);
        }
        Ok(())
    }

    async fn list(&self, prefix: &str, limit: Option<usize>) -> CrashResult<Vec<(String, Value)>> {
        let records = self.records.read().await;
        Ok(records
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .take(limit.unwrap_or(usize::MAX))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn subscribe(&self, key: &str) -> CrashResult<Subscription> {
        let changes = self.watchers.watch(key);
        let initial = self.get(key).await?;
        Ok(Subscription {
            key: key.to_string(),
            initial,
            changes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_get_set_update() {
        let store = MemoryStore::new();
        assert_eq!(store.get("users/a").await.unwrap(), None);

        store.set("users/a", json!({"balance": 10.0, "username": "a"})).await.unwrap();
        let merged = store.update("users/a", json!({"balance": 5.0})).await.unwrap();
        assert_eq!(merged, json!({"balance": 5.0, "username": "a"}));
        assert_eq!(store.get("users/a").await.unwrap(), Some(merged));

        let created = store.update("games/x", json!({"current_multiplier": 1.5})).await.unwrap();
        assert_eq!(created, json!({"current_multiplier": 1.5}));
    }

    #[tokio::test]
    async fn test_list_by_prefix() {
        let store = MemoryStore::new();
        store.set("game_results/b", json!(2)).await.unwrap();
        store.set("game_results/a", json!(1)).await.unwrap();
        store.set("games/a", json!(0)).await.unwrap();

        let results = store.list("game_results/", None).await.unwrap();
        let keys: Vec<_> = results.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["game_results/a", "game_results/b"]);

        let first = store.list("game_results/", Some(1)).await.unwrap();
        assert_eq!(first, vec![("game_results/a".to_string(), json!(1))]);
    }

    #[tokio::test]
    async fn test_concurrent_writes_notify_in_store_order() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let mut sub = store.subscribe("games/r").await.unwrap();

        let writers: Vec<_> = (0..32)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move { store.set("games/r", json!(i)).await.unwrap() })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }

        let mut last = None;
        for _ in 0..32 {
            last = sub.next().await;
        }
        assert_eq!(last, store.get("games/r").await.unwrap());
    }

    #[tokio::test]
    async fn test_subscription_sees_current_then_changes() {
        let store = MemoryStore::new();
        store.set("games/r", json!({"status": "waiting"})).await.unwrap();

        let mut sub = store.subscribe("games/r").await.unwrap();
        assert_eq!(sub.next().await, Some(json!({"status": "waiting"})));

        store.update("games/r", json!({"status": "running"})).await.unwrap();
        assert_eq!(sub.next().await, Some(json!({"status": "running"})));
        sub.unsubscribe();

        // no subscribers left, writes still succeed
        store.set("games/r", json!({"status": "crashed"})).await.unwrap();
    }

    #[tokio::test]
    async fn test_injected_failures_write_nothing() {
        let store = MemoryStore::new();
        store.fail_writes_after(1, 1);

        store.set("a", json!(1)).await.unwrap();
        let err = store
            .set_batch(vec![("b".into(), json!(2)), ("c".into(), json!(3))])
            .await
            .unwrap_err();
        assert!(err.is_store_unavailable());
        assert_eq!(store.len().await, 1);

        store.set("b", json!(2)).await.unwrap();
        assert_eq!(store.len().await, 2);
    }
}
