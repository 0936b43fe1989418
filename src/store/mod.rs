//! Keyed state store with change subscriptions
//!
//! Every durable record the engine owns goes through [`StateStore`]:
//! rounds, player balances, the results archive and settlement
//! bookkeeping. Values are JSON documents so observers in any language can
//! read them as plain structured data.

mod memory;
mod rocks;

pub use memory::MemoryStore;
pub use rocks::RocksStore;

use crate::{
    config::{StorageBackend, StorageConfig},
    errors::CrashResult,
};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Buffered changes per subscribed key before slow observers start skipping
const WATCH_CAPACITY: usize = 256;

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> CrashResult<Option<Value>>;

    async fn set(&self, key: &str, value: Value) -> CrashResult<()>;

    /// Shallow-merge `fields` into the record, creating it if absent.
    /// Returns the merged record.
    async fn update(&self, key: &str, fields: Value) -> CrashResult<Value>;

    /// Write every entry or none of them
    async fn set_batch(&self, entries: Vec<(String, Value)>) -> CrashResult<()>;

    /// Records whose key starts with `prefix`, in key order. Iteration
    /// stops after `limit` rows.
    async fn list(&self, prefix: &str, limit: Option<usize>) -> CrashResult<Vec<(String, Value)>>;

    /// Current value of `key` (if any) followed by every later change
    async fn subscribe(&self, key: &str) -> CrashResult<Subscription>;
}

/// Open the backend selected in configuration
pub fn open(config: &StorageConfig) -> CrashResult<Arc<dyn StateStore>> {
    match config.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StorageBackend::RocksDb => Ok(Arc::new(RocksStore::open(&config.data_directory)?)),
    }
}

/// Stream of values for one key
pub struct Subscription {
    key: String,
    initial: Option<Value>,
    changes: broadcast::Receiver<Value>,
}

impl Subscription {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Next value, or `None` once the store is gone.
    ///
    /// A lagging subscriber skips to the newest values; records are whole
    /// documents, so nothing but intermediate states is lost.
    pub async fn next(&mut self) -> Option<Value> {
        if let Some(value) = self.initial.take() {
            return Some(value);
        }
        loop {
            match self.changes.recv().await {
                Ok(value) => return Some(value),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(key = %self.key, skipped, "Subscriber lagging, skipping changes");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn unsubscribe(self) {}
}

/// Per-key change fan-out shared by the store implementations
#[derive(Default)]
pub(crate) struct Watchers {
    channels: DashMap<String, broadcast::Sender<Value>>,
}

impl Watchers {
    /// Register first, read second: a write racing the subscription is
    /// delivered twice rather than lost.
    pub(crate) fn watch(&self, key: &str) -> broadcast::Receiver<Value> {
        self.channels
            .entry(key.to_string())
            .or_insert_with(|| broadcast::channel(WATCH_CAPACITY).0)
            .subscribe()
    }

    pub(crate) fn notify(&self, key: &str, value: &Value) {
        let orphaned = match self.channels.get(key) {
            Some(sender) => sender.send(value.clone()).is_err(),
            None => return,
        };
        if orphaned {
            self.channels
                .remove_if(key, |_, sender| sender.receiver_count() == 0);
        }
    }
}

/// Shallow merge of `fields` into `existing`
pub(crate) fn merge_fields(existing: Option<Value>, fields: Value) -> Value {
    match (existing, fields) {
        (Some(Value::Object(mut base)), Value::Object(patch)) => {
            for (k, v) in patch {
                base.insert(k, v);
            }
            Value::Object(base)
        }
        (_, fields) => fields,
    }
}
