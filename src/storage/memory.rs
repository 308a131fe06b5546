//! In-memory [`Repository`] fake used by the test suite, grounded on
//! `db/mem.rs` in the Bitcoin-Indexer reference package: a plain
//! `Mutex<HashMap<..>>` standing in for the real backend so higher-level
//! cache/dispatch tests don't need a running Postgres instance.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::storage::repository::{EntityRow, EntitySchema, Repository, RepositoryTx};

#[derive(Default)]
struct Table {
    rows: Vec<EntityRow>,
}

struct Store {
    tables: Mutex<HashMap<&'static str, Table>>,
    metadata: Mutex<HashMap<String, Value>>,
}

/// Thread-safe in-memory stand-in for a Postgres-backed [`Repository`].
/// Every table is just a `Vec<EntityRow>`; historical mode is honoured by
/// filtering on `end_height.is_none()` exactly as the real backend's
/// `upper_inf(block_range)` clause does.
pub struct MemoryRepository {
    store: Arc<Store>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self {
            store: Arc::new(Store {
                tables: Mutex::new(HashMap::new()),
                metadata: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Test-only seam: pre-populate a table as if rows already existed in
    /// storage before the process started.
    pub fn seed(&self, schema: EntitySchema, rows: Vec<EntityRow>) {
        self.store
            .tables
            .lock()
            .unwrap()
            .entry(schema.table)
            .or_default()
            .rows
            .extend(rows);
    }

    pub fn seed_metadata(&self, key: impl Into<String>, value: Value) {
        self.store.metadata.lock().unwrap().insert(key.into(), value);
    }
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn find_by_pk(&self, schema: EntitySchema, id: &str) -> Result<Option<EntityRow>> {
        let tables = self.store.tables.lock().unwrap();
        Ok(tables
            .get(schema.table)
            .and_then(|t| t.rows.iter().find(|r| r.id == id && r.end_height.is_none()))
            .cloned())
    }

    async fn find_all_where(
        &self,
        schema: EntitySchema,
        field: &str,
        value: &Value,
        exclude_ids: &[String],
        limit: i64,
        offset: i64,
    ) -> Result<Vec<EntityRow>> {
        let tables = self.store.tables.lock().unwrap();
        let Some(table) = tables.get(schema.table) else {
            return Ok(Vec::new());
        };
        let mut matches: Vec<EntityRow> = table
            .rows
            .iter()
            .filter(|r| r.end_height.is_none())
            .filter(|r| !exclude_ids.iter().any(|e| e == &r.id))
            .filter(|r| r.data.get(field) == Some(value))
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.id.cmp(&b.id));
        let start = offset.max(0) as usize;
        let end = if limit < 0 {
            matches.len()
        } else {
            (start + limit as usize).min(matches.len())
        };
        Ok(if start >= matches.len() {
            Vec::new()
        } else {
            matches[start..end].to_vec()
        })
    }

    async fn count_where(
        &self,
        schema: EntitySchema,
        field: Option<&str>,
        value: Option<&Value>,
        exclude_ids: &[String],
        distinct_column: Option<&str>,
    ) -> Result<i64> {
        let tables = self.store.tables.lock().unwrap();
        let Some(table) = tables.get(schema.table) else {
            return Ok(0);
        };
        let live = table
            .rows
            .iter()
            .filter(|r| r.end_height.is_none())
            .filter(|r| !exclude_ids.iter().any(|e| e == &r.id))
            .filter(|r| match (field, value) {
                (Some(f), Some(v)) => r.data.get(f) == Some(v),
                _ => true,
            });
        match distinct_column {
            Some(col) => {
                let mut seen = std::collections::HashSet::new();
                for r in live {
                    if let Some(v) = r.data.get(col) {
                        seen.insert(v.to_string());
                    }
                }
                Ok(seen.len() as i64)
            }
            None => Ok(live.count() as i64),
        }
    }

    async fn find_metadata(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.store.metadata.lock().unwrap().get(key).cloned())
    }

    async fn find_metadata_many(&self, keys: &[String]) -> Result<HashMap<String, Value>> {
        let metadata = self.store.metadata.lock().unwrap();
        Ok(keys
            .iter()
            .filter_map(|k| metadata.get(k).map(|v| (k.clone(), v.clone())))
            .collect())
    }

    async fn begin(&self) -> Result<Box<dyn RepositoryTx>> {
        Ok(Box::new(MemoryTx {
            store: self.store.clone(),
            upserts: Vec::new(),
            deletes: Vec::new(),
            range_closes: Vec::new(),
            inserts: Vec::new(),
            metadata_upserts: Vec::new(),
            metadata_increments: Vec::new(),
        }))
    }
}

/// Buffers writes until `commit`, then applies them against the shared
/// store in one go - approximating a real transaction's all-or-nothing
/// visibility without needing an actual database.
pub struct MemoryTx {
    store: Arc<Store>,
    upserts: Vec<(EntitySchema, Vec<EntityRow>)>,
    deletes: Vec<(EntitySchema, Vec<String>)>,
    range_closes: Vec<(EntitySchema, Vec<(String, u64)>)>,
    inserts: Vec<(EntitySchema, Vec<EntityRow>)>,
    metadata_upserts: Vec<(String, Value)>,
    metadata_increments: Vec<(String, f64)>,
}

#[async_trait]
impl RepositoryTx for MemoryTx {
    async fn bulk_upsert(&mut self, schema: EntitySchema, rows: Vec<EntityRow>) -> Result<u64> {
        let n = rows.len() as u64;
        self.upserts.push((schema, rows));
        Ok(n)
    }

    async fn delete_where_ids(&mut self, schema: EntitySchema, ids: &[String]) -> Result<u64> {
        let n = ids.len() as u64;
        self.deletes.push((schema, ids.to_vec()));
        Ok(n)
    }

    async fn raw_range_close(&mut self, schema: EntitySchema, closes: &[(String, u64)]) -> Result<u64> {
        let n = closes.len() as u64;
        self.range_closes.push((schema, closes.to_vec()));
        Ok(n)
    }

    async fn insert_versions(&mut self, schema: EntitySchema, rows: Vec<EntityRow>) -> Result<u64> {
        let n = rows.len() as u64;
        self.inserts.push((schema, rows));
        Ok(n)
    }

    async fn upsert_metadata(&mut self, entries: &[(String, Value)]) -> Result<()> {
        self.metadata_upserts.extend_from_slice(entries);
        Ok(())
    }

    async fn increment_metadata(&mut self, key: &str, delta: f64) -> Result<()> {
        self.metadata_increments.push((key.to_string(), delta));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut tables = self.store.tables.lock().unwrap();

        for (schema, closes) in &self.range_closes {
            let table = tables.entry(schema.table).or_default();
            for (id, new_upper) in closes {
                if let Some(row) = table
                    .rows
                    .iter_mut()
                    .find(|r| &r.id == id && r.end_height.is_none())
                {
                    row.end_height = Some(*new_upper);
                }
            }
        }
        for (schema, rows) in self.inserts {
            tables.entry(schema.table).or_default().rows.extend(rows);
        }
        for (schema, rows) in self.upserts {
            let table = tables.entry(schema.table).or_default();
            for row in rows {
                if let Some(existing) = table.rows.iter_mut().find(|r| r.id == row.id) {
                    *existing = row;
                } else {
                    table.rows.push(row);
                }
            }
        }
        for (schema, ids) in &self.deletes {
            let table = tables.entry(schema.table).or_default();
            table.rows.retain(|r| !ids.contains(&r.id));
        }
        drop(tables);

        let mut metadata = self.store.metadata.lock().unwrap();
        for (key, value) in self.metadata_upserts {
            metadata.insert(key, value);
        }
        for (key, delta) in self.metadata_increments {
            let current = metadata.get(&key).and_then(|v| v.as_f64()).unwrap_or(0.0);
            metadata.insert(key, serde_json::json!(current + delta));
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::repository::EntitySchema;

    const ACCOUNTS: EntitySchema = EntitySchema::new("accounts");

    fn row(id: &str, balance: i64) -> EntityRow {
        EntityRow {
            id: id.to_string(),
            data: serde_json::json!({ "balance": balance }),
            start_height: 0,
            end_height: None,
        }
    }

    #[tokio::test]
    async fn find_by_pk_returns_seeded_live_row() {
        let repo = MemoryRepository::new();
        repo.seed(ACCOUNTS, vec![row("a", 10)]);
        let found = repo.find_by_pk(ACCOUNTS, "a").await.unwrap().unwrap();
        assert_eq!(found.data["balance"], 10);
    }

    #[tokio::test]
    async fn find_by_pk_ignores_closed_versions() {
        let repo = MemoryRepository::new();
        let mut closed = row("a", 10);
        closed.end_height = Some(5);
        repo.seed(ACCOUNTS, vec![closed]);
        assert!(repo.find_by_pk(ACCOUNTS, "a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn find_all_where_filters_by_field_and_excludes_ids() {
        let repo = MemoryRepository::new();
        repo.seed(ACCOUNTS, vec![row("a", 10), row("b", 10), row("c", 20)]);
        let matches = repo
            .find_all_where(ACCOUNTS, "balance", &serde_json::json!(10), &["b".to_string()], 10, 0)
            .await
            .unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].id, "a");
    }

    #[tokio::test]
    async fn count_where_distinct_counts_unique_values() {
        let repo = MemoryRepository::new();
        repo.seed(ACCOUNTS, vec![row("a", 10), row("b", 10), row("c", 20)]);
        let n = repo
            .count_where(ACCOUNTS, None, None, &[], Some("balance"))
            .await
            .unwrap();
        assert_eq!(n, 2);
    }

    #[tokio::test]
    async fn commit_applies_upsert_and_is_then_visible() {
        let repo = MemoryRepository::new();
        let mut tx = repo.begin().await.unwrap();
        tx.bulk_upsert(ACCOUNTS, vec![row("a", 10)]).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(repo.find_by_pk(ACCOUNTS, "a").await.unwrap().unwrap().data["balance"], 10);
    }

    #[tokio::test]
    async fn rollback_discards_buffered_writes() {
        let repo = MemoryRepository::new();
        let mut tx = repo.begin().await.unwrap();
        tx.bulk_upsert(ACCOUNTS, vec![row("a", 10)]).await.unwrap();
        tx.rollback().await.unwrap();

        assert!(repo.find_by_pk(ACCOUNTS, "a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn range_close_then_insert_produces_two_versions() {
        let repo = MemoryRepository::new();
        repo.seed(
            ACCOUNTS,
            vec![EntityRow {
                id: "a".into(),
                data: serde_json::json!({"balance": 0}),
                start_height: 1,
                end_height: None,
            }],
        );
        let mut tx = repo.begin().await.unwrap();
        tx.raw_range_close(ACCOUNTS, &[("a".to_string(), 5)]).await.unwrap();
        tx.insert_versions(
            ACCOUNTS,
            vec![EntityRow {
                id: "a".into(),
                data: serde_json::json!({"balance": 5}),
                start_height: 5,
                end_height: None,
            }],
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let live = repo.find_by_pk(ACCOUNTS, "a").await.unwrap().unwrap();
        assert_eq!(live.start_height, 5);
        assert_eq!(live.data["balance"], 5);
    }
}
