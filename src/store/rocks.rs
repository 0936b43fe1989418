//! Durable store on RocksDB
//!
//! Keys are the UTF-8 record paths, values are JSON. Writes that touch
//! several records go through one `WriteBatch`.

use super::{merge_fields, StateStore, Subscription, Watchers};
use crate::errors::{CrashResult, StoreError};
use async_trait::async_trait;
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Clone)]
pub struct RocksStore {
    db: Arc<DB>,
    watchers: Arc<Watchers>,
    /// Serialises writes and their change notifications
    write_lock: Arc<Mutex<()>>,
}

impl RocksStore {
    pub fn open<P: AsRef<Path>>(path: P) -> CrashResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_write_buffer_size(32 * 1024 * 1024);
        opts.set_max_write_buffer_number(3);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let db = DB::open(&opts, path.as_ref())?;
        tracing::info!(path = %path.as_ref().display(), "Opened RocksDB state store");

        Ok(Self {
            db: Arc::new(db),
            watchers: Arc::new(Watchers::default()),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    fn decode(key: &str, bytes: &[u8]) -> CrashResult<Value> {
        serde_json::from_slice(bytes).map_err(|e| {
            StoreError::Corrupted {
                key: key.to_string(),
                reason: e.to_string(),
            }
            .into()
        })
    }

    fn read(&self, key: &str) -> CrashResult<Option<Value>> {
        match self.db.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(Self::decode(key, &bytes)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl StateStore for RocksStore {
    async fn get(&self, key: &str) -> CrashResult<Option<Value>> {
        self.read(key)
    }

    async fn set(&self, key: &str, value: Value) -> CrashResult<()> {
        let bytes = serde_json::to_vec(&value)?;
        let _guard = self.write_lock.lock().await;
        self.db.put(key.as_bytes(), bytes)?;
        self.watchers.notify(key, &value);
        Ok(())
    }

    async fn update(&self, key: &str, fields: Value) -> CrashResult<Value> {
        let _guard = self.write_lock.lock().await;
        let merged = merge_fields(self.read(key)?, fields);
        self.db.put(key.as_bytes(), serde_json::to_vec(&merged)?)?;
        self.watchers.notify(key, &merged);
        Ok(merged)
    }

    async fn set_batch(&self, entries: Vec<(String, Value)>) -> CrashResult<()> {
        let mut batch = WriteBatch::default();
        for (key, value) in &entries {
            batch.put(key.as_bytes(), serde_json::to_vec(value)?);
        }
        let _guard = self.write_lock.lock().await;
        self.db.write(batch)?;
        for (key, value) in &entries {
            self.watchers.notify(key, value);
        }
        Ok(())
    }

    async fn list(&self, prefix: &str, limit: Option<usize>) -> CrashResult<Vec<(String, Value)>> {
        let limit = limit.unwrap_or(usize::MAX);
        let mut rows = Vec::new();
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward));

        for item in iter {
            if rows.len() >= limit {
                break;
            }
            let (key, value) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            let key = String::from_utf8(key.to_vec()).map_err(|e| StoreError::Corrupted {
                key: hex::encode(&key),
                reason: e.to_string(),
            })?;
            let value = Self::decode(&key, &value)?;
            rows.push((key, value));
        }
        Ok(rows)
    }

    async fn subscribe(&self, key: &str) -> CrashResult<Subscription> {
        let changes = self.watchers.watch(key);
        let initial = self.read(key)?;
        Ok(Subscription {
            key: key.to_string(),
            initial,
            changes,
        })
    }
}
