//! C5: Cached entity model.
//!
//! Read/write/remove API over one entity type. Merges the in-memory C3
//! (`setCache`) and C4 (`getCache`) layers with a DB fallback, and flushes
//! pending mutations into a [`RepositoryTx`] when asked to by the store
//! cache controller (C7).

use std::collections::HashMap;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::cache::recency_map::RecencyMap;
use crate::cache::set_value::SetValueModel;
use crate::error::{IndexerError, Result};
use crate::storage::repository::{EntityRow, EntitySchema, Repository, RepositoryTx};

/// The reflective-serializer boundary (§3/§9): a typed payload that knows
/// its own primary key and can round-trip through the opaque JSONB column
/// the repository layer stores.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn id(&self) -> String;
}

fn to_row(id: &str, data: &impl Serialize, start_height: u64, end_height: Option<u64>) -> EntityRow {
    EntityRow {
        id: id.to_string(),
        data: serde_json::to_value(data).expect("entity payload must serialize to JSON"),
        start_height,
        end_height,
    }
}

fn from_row<E: DeserializeOwned>(row: &EntityRow) -> Result<E> {
    serde_json::from_value(row.data.clone())
        .map_err(|e| IndexerError::Repository(format!("failed to deserialize row {}: {}", row.id, e)))
}

fn field_value<E: Serialize>(data: &E, field: &str) -> Option<Value> {
    serde_json::to_value(data).ok().and_then(|v| v.get(field).cloned())
}

/// Read/write cache over one entity table.
pub struct CachedEntityModel<E: Entity> {
    schema: EntitySchema,
    historical: bool,
    set_cache: HashMap<String, SetValueModel<E>>,
    remove_cache: HashMap<String, u64>,
    get_cache: RecencyMap<Option<E>>,
    flushable_record_counter: usize,
}

/// Offset/limit window for a field query.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub offset: i64,
    pub limit: i64,
}

impl Default for Page {
    fn default() -> Self {
        Self { offset: 0, limit: 100 }
    }
}

impl<E: Entity> CachedEntityModel<E> {
    pub fn new(schema: EntitySchema, historical: bool, max_entries: usize, ttl: Duration) -> Self {
        Self {
            schema,
            historical,
            set_cache: HashMap::new(),
            remove_cache: HashMap::new(),
            get_cache: RecencyMap::new(max_entries, ttl),
            flushable_record_counter: 0,
        }
    }

    fn all_cached_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.set_cache.keys().cloned().collect();
        for k in self.get_cache.keys() {
            if !ids.contains(k) {
                ids.push(k.clone());
            }
        }
        for k in self.remove_cache.keys() {
            if !ids.contains(k) {
                ids.push(k.clone());
            }
        }
        ids
    }

    /// §4.5 read path: removeCache shadows everything, then getCache, then
    /// setCache's latest version, then a DB lookup that backfills getCache.
    pub async fn get(&mut self, repo: &dyn Repository, id: &str) -> Result<Option<E>> {
        if self.remove_cache.contains_key(id) {
            return Ok(None);
        }
        if let Some(hit) = self.get_cache.get(id) {
            return Ok(hit);
        }
        if let Some(model) = self.set_cache.get(id) {
            if let Some(latest) = model.get_latest() {
                return Ok(Some(latest.clone()));
            }
        }
        let row = repo.find_by_pk(self.schema, id).await?;
        let value = match row {
            Some(r) => Some(from_row::<E>(&r)?),
            None => None,
        };
        self.get_cache.set(id.to_string(), value.clone());
        Ok(value)
    }

    /// §4.5 `getByField`: merges in-memory matches with a DB residual query
    /// once the in-memory window is exhausted.
    pub async fn get_by_field(
        &mut self,
        repo: &dyn Repository,
        field: &str,
        value: &Value,
        page: Page,
    ) -> Result<Vec<E>> {
        let mut in_memory: Vec<E> = Vec::new();
        let mut seen: Vec<String> = Vec::new();

        for (id, model) in self.set_cache.iter() {
            if self.remove_cache.contains_key(id) {
                continue;
            }
            if let Some(latest) = model.get_latest() {
                if field_value(latest, field).as_ref() == Some(value) {
                    in_memory.push(latest.clone());
                    seen.push(id.clone());
                }
            }
        }
        self.get_cache.for_each(|id, cached| {
            if seen.contains(&id.to_string()) || self.remove_cache.contains_key(id) {
                return;
            }
            if let Some(data) = cached {
                if field_value(data, field).as_ref() == Some(value) {
                    in_memory.push(data.clone());
                }
            }
        });

        let start = page.offset.max(0) as usize;
        let window_end = (page.offset.max(0) + page.limit.max(0)) as usize;
        if window_end <= in_memory.len() {
            return Ok(in_memory
                .into_iter()
                .skip(start)
                .take(page.limit.max(0) as usize)
                .collect());
        }

        let residual_limit = (window_end - in_memory.len()) as i64;
        let residual_offset = (start.saturating_sub(in_memory.len())) as i64;
        let exclude = self.all_cached_ids();
        let db_rows = repo
            .find_all_where(self.schema, field, value, &exclude, residual_limit, residual_offset)
            .await?;

        let mut merged = in_memory;
        for row in db_rows {
            let entity = from_row::<E>(&row)?;
            self.get_cache.set(row.id.clone(), Some(entity.clone()));
            merged.push(entity);
        }
        Ok(merged.into_iter().skip(start).take(page.limit.max(0) as usize).collect())
    }

    /// §4.5 `getOneByField`, with the null-guard called out as an open
    /// question in §9: a DB miss returns `None` instead of panicking on a
    /// nonexistent row.
    pub async fn get_one_by_field(
        &mut self,
        repo: &dyn Repository,
        field: &str,
        value: &Value,
    ) -> Result<Option<E>> {
        if field == "id" {
            let id = value
                .as_str()
                .ok_or_else(|| IndexerError::programmer("getOneByField(\"id\", _) requires a string value"))?;
            return self.get(repo, id).await;
        }

        for model in self.set_cache.values() {
            if let Some(latest) = model.get_latest() {
                if field_value(latest, field).as_ref() == Some(value) {
                    return Ok(Some(latest.clone()));
                }
            }
        }
        let mut found = None;
        self.get_cache.for_each(|_, cached| {
            if found.is_some() {
                return;
            }
            if let Some(data) = cached {
                if field_value(data, field).as_ref() == Some(value) {
                    found = Some(data.clone());
                }
            }
        });
        if found.is_some() {
            return Ok(found);
        }

        let exclude = self.all_cached_ids();
        let rows = repo.find_all_where(self.schema, field, value, &exclude, 1, 0).await?;
        match rows.into_iter().next() {
            Some(row) => {
                let entity = from_row::<E>(&row)?;
                self.get_cache.set(row.id.clone(), Some(entity.clone()));
                Ok(Some(entity))
            }
            None => Ok(None),
        }
    }

    /// §4.5 `count`.
    pub async fn count(
        &self,
        repo: &dyn Repository,
        field: Option<&str>,
        value: Option<&Value>,
        distinct_column: Option<&str>,
    ) -> Result<i64> {
        let mut in_memory = 0i64;
        for (id, model) in self.set_cache.iter() {
            if self.remove_cache.contains_key(id) {
                continue;
            }
            if let Some(latest) = model.get_latest() {
                let matches = match (field, value) {
                    (Some(f), Some(v)) => field_value(latest, f).as_ref() == Some(v),
                    _ => true,
                };
                if matches {
                    in_memory += 1;
                }
            }
        }
        let exclude = self.all_cached_ids();
        let db_count = repo.count_where(self.schema, field, value, &exclude, distinct_column).await?;
        Ok(in_memory + db_count)
    }

    /// §4.5 write path `set`.
    pub fn set(&mut self, id: impl Into<String>, data: E, height: u64) -> Result<()> {
        let id = id.into();
        let first_write = !self.set_cache.contains_key(&id) && !self.remove_cache.contains_key(&id);
        let model = self.set_cache.entry(id.clone()).or_default();
        model.set(data.clone(), height)?;
        self.get_cache.set(id.clone(), Some(data));
        self.remove_cache.remove(&id);
        if first_write {
            self.flushable_record_counter += 1;
        }
        Ok(())
    }

    pub fn bulk_create(&mut self, rows: Vec<E>, height: u64) -> Result<()> {
        for data in rows {
            let id = data.id();
            self.set(id, data, height)?;
        }
        Ok(())
    }

    /// `fields` narrowing a bulk update to a column subset is unsupported
    /// (§4.5): every `set` rewrites the whole payload.
    pub fn bulk_update(&mut self, rows: Vec<E>, height: u64, fields: Option<&[&str]>) -> Result<()> {
        if fields.is_some() {
            return Err(IndexerError::programmer(
                "bulkUpdate with a fields subset is not supported",
            ));
        }
        self.bulk_create(rows, height)
    }

    /// §4.5 `remove`, idempotent per invariant 5 of §8.
    pub fn remove(&mut self, id: &str, height: u64) -> Result<()> {
        if self.remove_cache.contains_key(id) {
            return Ok(());
        }
        let first_write = !self.set_cache.contains_key(id);
        self.remove_cache.insert(id.to_string(), height);
        self.get_cache.delete(id);
        if let Some(model) = self.set_cache.get_mut(id) {
            model.mark_as_removed(height)?;
        }
        if first_write {
            self.flushable_record_counter += 1;
        }
        Ok(())
    }

    /// An id removed without ever being locally `set` leaves `set_cache`
    /// empty for it, so `remove_cache` must also be checked - otherwise a
    /// remove-only flush window is never seen as flushable and the pending
    /// deletion is lost on restart.
    pub fn is_flushable(&self) -> bool {
        !self.set_cache.is_empty() || !self.remove_cache.is_empty()
    }

    pub fn flushable_record_count(&self) -> usize {
        self.flushable_record_counter
    }

    /// §4.5 flush protocol. Returns the number of rows written, for C7's
    /// metrics. Caches are cleared before returning, per the fire-and-clear
    /// design explicitly kept from the source (§9).
    pub async fn flush(&mut self, tx: &mut dyn RepositoryTx) -> Result<u64> {
        let mut written = 0u64;

        if self.historical {
            let mut closes: Vec<(String, u64)> = Vec::new();
            for (id, model) in self.set_cache.iter() {
                if let Some(first_start) = model.first_start_height() {
                    closes.push((id.clone(), first_start));
                }
            }
            for (id, removed_at) in self.remove_cache.iter() {
                if !self.set_cache.contains_key(id) {
                    closes.push((id.clone(), *removed_at));
                }
            }
            if !closes.is_empty() {
                written += tx.raw_range_close(self.schema, &closes).await?;
            }

            let mut inserts = Vec::new();
            for (id, model) in self.set_cache.iter() {
                for version in model.get_values() {
                    inserts.push(to_row(id, &version.data, version.start_height, version.end_height));
                }
            }
            if !inserts.is_empty() {
                written += tx.insert_versions(self.schema, inserts).await?;
            }
        } else {
            let mut upserts = Vec::new();
            for (id, model) in self.set_cache.iter() {
                if let Some(latest) = model.get_latest() {
                    upserts.push(to_row(id, latest, 0, None));
                }
            }
            if !upserts.is_empty() {
                written += tx.bulk_upsert(self.schema, upserts).await?;
            }

            let remove_ids: Vec<String> = self.remove_cache.keys().cloned().collect();
            if !remove_ids.is_empty() {
                written += tx.delete_where_ids(self.schema, &remove_ids).await?;
            }
        }

        self.set_cache.clear();
        self.remove_cache.clear();
        self.flushable_record_counter = 0;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryRepository;
    use serde::Deserialize;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Account {
        id: String,
        balance: i64,
    }

    impl Entity for Account {
        fn id(&self) -> String {
            self.id.clone()
        }
    }

    const ACCOUNTS: EntitySchema = EntitySchema::new("accounts");

    fn model(historical: bool) -> CachedEntityModel<Account> {
        CachedEntityModel::new(ACCOUNTS, historical, 100, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn get_falls_through_set_cache_before_db() {
        let repo = MemoryRepository::new();
        let mut m = model(false);
        m.set("a", Account { id: "a".into(), balance: 1 }, 1).unwrap();
        let found = m.get(&repo, "a").await.unwrap().unwrap();
        assert_eq!(found.balance, 1);
    }

    #[tokio::test]
    async fn removed_id_reads_as_none_even_if_still_in_set_cache_history() {
        let repo = MemoryRepository::new();
        let mut m = model(true);
        m.set("a", Account { id: "a".into(), balance: 1 }, 1).unwrap();
        m.remove("a", 5).unwrap();
        assert!(m.get(&repo, "a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let repo = MemoryRepository::new();
        let mut m = model(false);
        m.set("a", Account { id: "a".into(), balance: 1 }, 1).unwrap();
        m.remove("a", 5).unwrap();
        m.remove("a", 9).unwrap();
        assert!(m.get(&repo, "a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_only_id_is_flushable_and_persists_the_deletion() {
        let repo = MemoryRepository::new();
        repo.seed(
            ACCOUNTS,
            vec![EntityRow {
                id: "a".into(),
                data: serde_json::json!({"id": "a", "balance": 3}),
                start_height: 1,
                end_height: None,
            }],
        );
        let mut m = model(false);
        m.remove("a", 7).unwrap();
        assert!(m.is_flushable());
        assert_eq!(m.flushable_record_count(), 1);

        let mut tx = repo.begin().await.unwrap();
        let written = m.flush(tx.as_mut()).await.unwrap();
        tx.commit().await.unwrap();

        assert!(written >= 1);
        assert!(!m.is_flushable());
        assert!(repo.find_by_pk(ACCOUNTS, "a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn bulk_update_with_fields_is_rejected() {
        let mut m = model(false);
        let err = m.bulk_update(vec![Account { id: "a".into(), balance: 1 }], 1, Some(&["balance"]));
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn non_historical_flush_upserts_latest_and_deletes_removed() {
        let repo = MemoryRepository::new();
        let mut m = model(false);
        m.set("a", Account { id: "a".into(), balance: 1 }, 1).unwrap();
        m.set("b", Account { id: "b".into(), balance: 2 }, 1).unwrap();
        m.remove("b", 2).unwrap();

        let mut tx = repo.begin().await.unwrap();
        let written = m.flush(tx.as_mut()).await.unwrap();
        tx.commit().await.unwrap();

        assert!(written >= 1);
        assert!(!m.is_flushable());
    }

    #[tokio::test]
    async fn historical_flush_closes_previous_and_inserts_new_version() {
        let repo = MemoryRepository::new();
        repo.seed(
            ACCOUNTS,
            vec![EntityRow {
                id: "a".into(),
                data: serde_json::json!({"id": "a", "balance": 0}),
                start_height: 1,
                end_height: None,
            }],
        );
        let mut m = model(true);
        m.set("a", Account { id: "a".into(), balance: 5 }, 5).unwrap();

        let mut tx = repo.begin().await.unwrap();
        let written = m.flush(tx.as_mut()).await.unwrap();
        tx.commit().await.unwrap();
        assert!(written >= 1);
    }

    #[tokio::test]
    async fn count_combines_in_memory_and_db() {
        let repo = MemoryRepository::new();
        repo.seed(
            ACCOUNTS,
            vec![EntityRow {
                id: "db1".into(),
                data: serde_json::json!({"id": "db1", "balance": 7}),
                start_height: 0,
                end_height: None,
            }],
        );
        let mut m = model(false);
        m.set("mem1", Account { id: "mem1".into(), balance: 7 }, 1).unwrap();
        let n = m
            .count(&repo, Some("balance"), Some(&serde_json::json!(7)), None)
            .await
            .unwrap();
        assert_eq!(n, 2);
    }
}
