//! C6: Cached metadata model.
//!
//! Same read/write/flush shape as C5, specialised to scalar, singleton
//! metadata keys - including the increment-only key set (§4.6) whose flush
//! semantics are "atomic add to the current DB value", not "overwrite".

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::error::Result;
use crate::storage::repository::{Repository, RepositoryTx};

#[derive(Debug, Clone)]
enum PendingWrite {
    Overwrite(Value),
    Increment(f64),
}

/// Cache over metadata rows (`key -> value`), with a closed increment-only
/// key set whose writes accumulate rather than overwrite.
pub struct CachedMetadataModel {
    increment_keys: HashSet<String>,
    set_cache: HashMap<String, PendingWrite>,
    get_cache: HashMap<String, Value>,
    flushable_record_counter: usize,
}

impl CachedMetadataModel {
    pub fn new(increment_keys: impl IntoIterator<Item = String>) -> Self {
        Self {
            increment_keys: increment_keys.into_iter().collect(),
            set_cache: HashMap::new(),
            get_cache: HashMap::new(),
            flushable_record_counter: 0,
        }
    }

    pub fn is_increment_key(&self, key: &str) -> bool {
        self.increment_keys.contains(key)
    }

    /// §4.6 `find`: getCache, else DB lookup that backfills getCache.
    pub async fn find(&mut self, repo: &dyn Repository, key: &str) -> Result<Option<Value>> {
        if let Some(pending) = self.set_cache.get(key) {
            return Ok(Some(self.resolve_pending(key, pending)));
        }
        if let Some(v) = self.get_cache.get(key) {
            return Ok(Some(v.clone()));
        }
        let found = repo.find_metadata(key).await?;
        if let Some(v) = &found {
            self.get_cache.insert(key.to_string(), v.clone());
        }
        Ok(found)
    }

    /// §4.6 `findMany`: DB bulk lookup merged with pending writes, with
    /// `setCache` winning ties; the merged view is written back into
    /// `getCache`.
    pub async fn find_many(&mut self, repo: &dyn Repository, keys: &[String]) -> Result<HashMap<String, Value>> {
        let db_keys: Vec<String> = keys
            .iter()
            .filter(|k| !self.set_cache.contains_key(*k))
            .cloned()
            .collect();
        let mut merged = if db_keys.is_empty() {
            HashMap::new()
        } else {
            repo.find_metadata_many(&db_keys).await?
        };
        for key in keys {
            if let Some(pending) = self.set_cache.get(key) {
                let resolved = self.resolve_pending_value(key, pending, merged.get(key).cloned());
                merged.insert(key.clone(), resolved);
            }
        }
        for (k, v) in merged.iter() {
            self.get_cache.insert(k.clone(), v.clone());
        }
        Ok(merged)
    }

    fn resolve_pending(&self, key: &str, pending: &PendingWrite) -> Value {
        self.resolve_pending_value(key, pending, self.get_cache.get(key).cloned())
    }

    fn resolve_pending_value(&self, _key: &str, pending: &PendingWrite, base: Option<Value>) -> Value {
        match pending {
            PendingWrite::Overwrite(v) => v.clone(),
            PendingWrite::Increment(delta) => {
                let base = base.and_then(|v| v.as_f64()).unwrap_or(0.0);
                serde_json::json!(base + delta)
            }
        }
    }

    /// §4.6 `set`: last-writer-wins overwrite. Calling this on an
    /// increment-only key is a programmer error (§4.6/§7: use
    /// `setIncrement` instead).
    pub fn set(&mut self, key: impl Into<String>, value: Value) -> Result<()> {
        let key = key.into();
        if self.increment_keys.contains(&key) {
            return Err(crate::error::IndexerError::programmer(format!(
                "set(\"{}\") is not allowed on an increment-only metadata key; use set_increment",
                key
            )));
        }
        let first_write = !self.set_cache.contains_key(&key);
        self.get_cache.insert(key.clone(), value.clone());
        self.set_cache.insert(key.clone(), PendingWrite::Overwrite(value));
        if first_write {
            self.flushable_record_counter += 1;
        }
        Ok(())
    }

    pub fn set_bulk(&mut self, entries: Vec<(String, Value)>) -> Result<()> {
        for (k, v) in entries {
            self.set(k, v)?;
        }
        Ok(())
    }

    /// §4.6 `setIncrement`: accumulates into `setCache` by numeric addition.
    /// Only valid for the closed increment-key set.
    pub fn set_increment(&mut self, key: &str, delta: f64) -> Result<()> {
        if !self.increment_keys.contains(key) {
            return Err(crate::error::IndexerError::programmer(format!(
                "setIncrement(\"{}\") on a non-increment metadata key",
                key
            )));
        }
        let first_write = !self.set_cache.contains_key(key);
        let entry = self
            .set_cache
            .entry(key.to_string())
            .or_insert(PendingWrite::Increment(0.0));
        match entry {
            PendingWrite::Increment(total) => *total += delta,
            PendingWrite::Overwrite(_) => unreachable!("increment key can only ever hold Increment writes"),
        }
        if first_write {
            self.flushable_record_counter += 1;
        }
        Ok(())
    }

    pub fn is_flushable(&self) -> bool {
        !self.set_cache.is_empty()
    }

    pub fn flushable_record_count(&self) -> usize {
        self.flushable_record_counter
    }

    /// §4.6 flush: partitions pending writes into a bulk upsert (overwrite
    /// entries) and server-side atomic adds (increment entries), which stay
    /// concurrency-safe even if another process shares the row (§9).
    pub async fn flush(&mut self, tx: &mut dyn RepositoryTx) -> Result<u64> {
        let mut upserts = Vec::new();
        let mut increments = Vec::new();
        for (key, pending) in self.set_cache.drain() {
            match pending {
                PendingWrite::Overwrite(v) => upserts.push((key, v)),
                PendingWrite::Increment(delta) => increments.push((key, delta)),
            }
        }

        let mut written = 0u64;
        if !upserts.is_empty() {
            written += upserts.len() as u64;
            tx.upsert_metadata(&upserts).await?;
        }
        for (key, delta) in increments {
            tx.increment_metadata(&key, delta).await?;
            written += 1;
        }

        self.flushable_record_counter = 0;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryRepository;

    #[tokio::test]
    async fn set_then_find_round_trips() {
        let repo = MemoryRepository::new();
        let mut m = CachedMetadataModel::new([]);
        m.set("schemaVersion", serde_json::json!(2)).unwrap();
        assert_eq!(m.find(&repo, "schemaVersion").await.unwrap(), Some(serde_json::json!(2)));
    }

    #[tokio::test]
    async fn set_on_increment_key_is_rejected() {
        let mut m = CachedMetadataModel::new(["processedBlockCount".to_string()]);
        assert!(m.set("processedBlockCount", serde_json::json!(5)).is_err());
    }

    #[tokio::test]
    async fn set_increment_accumulates_in_memory() {
        let repo = MemoryRepository::new();
        let mut m = CachedMetadataModel::new(["processedBlockCount".to_string()]);
        m.set_increment("processedBlockCount", 3.0).unwrap();
        m.set_increment("processedBlockCount", 2.0).unwrap();
        let found = m.find(&repo, "processedBlockCount").await.unwrap().unwrap();
        assert_eq!(found.as_f64().unwrap(), 5.0);
    }

    #[tokio::test]
    async fn set_increment_on_non_increment_key_is_rejected() {
        let mut m = CachedMetadataModel::new([]);
        assert!(m.set_increment("schemaVersion", 1.0).is_err());
    }

    #[tokio::test]
    async fn flush_partitions_overwrites_and_increments() {
        let repo = MemoryRepository::new();
        let mut m = CachedMetadataModel::new(["processedBlockCount".to_string()]);
        m.set("schemaVersion", serde_json::json!(2)).unwrap();
        m.set_increment("processedBlockCount", 3.0).unwrap();

        let mut tx = repo.begin().await.unwrap();
        let written = m.flush(tx.as_mut()).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(written, 2);
        assert!(!m.is_flushable());
    }
}
