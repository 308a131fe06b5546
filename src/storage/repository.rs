//! Narrow storage capability consumed by C5/C6/C7 (§9 re-architecture
//! guidance: "Ambient DB query builder" - replace inline ORM calls with a
//! narrow repository capability, keeping C5 free of storage-engine
//! leakage).
//!
//! Entities are stored as an `id` column plus a single JSONB `data` column
//! holding the whole serialized payload - the reflective-serializer
//! boundary (§3/§9): the cache only ever needs to know an entity's table
//! name and `id`, never its column set.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

/// Describes one entity type's table to the repository layer.
#[derive(Debug, Clone, Copy)]
pub struct EntitySchema {
    pub table: &'static str,
}

impl EntitySchema {
    pub const fn new(table: &'static str) -> Self {
        Self { table }
    }
}

/// One materialised row: the payload plus, in historical mode, the
/// block-range it is valid over.
#[derive(Debug, Clone)]
pub struct EntityRow {
    pub id: String,
    pub data: Value,
    pub start_height: u64,
    pub end_height: Option<u64>,
}

/// Narrow read surface used both outside a flush (cache-miss lookups) and,
/// via [`RepositoryTx`], from inside one.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn find_by_pk(&self, schema: EntitySchema, id: &str) -> Result<Option<EntityRow>>;

    async fn find_all_where(
        &self,
        schema: EntitySchema,
        field: &str,
        value: &Value,
        exclude_ids: &[String],
        limit: i64,
        offset: i64,
    ) -> Result<Vec<EntityRow>>;

    async fn count_where(
        &self,
        schema: EntitySchema,
        field: Option<&str>,
        value: Option<&Value>,
        exclude_ids: &[String],
        distinct_column: Option<&str>,
    ) -> Result<i64>;

    async fn find_metadata(&self, key: &str) -> Result<Option<Value>>;

    async fn find_metadata_many(&self, keys: &[String]) -> Result<HashMap<String, Value>>;

    /// Open a transaction for a flush. All writes for one `StoreCache`
    /// flush (§4.7) go through the returned handle and are committed or
    /// rolled back together.
    async fn begin(&self) -> Result<Box<dyn RepositoryTx>>;
}

/// Write surface scoped to one open transaction.
#[async_trait]
pub trait RepositoryTx: Send {
    /// Non-historical upsert: one row per id, every column overwritten on
    /// conflict.
    async fn bulk_upsert(&mut self, schema: EntitySchema, rows: Vec<EntityRow>) -> Result<u64>;

    /// Non-historical delete of removed ids.
    async fn delete_where_ids(&mut self, schema: EntitySchema, ids: &[String]) -> Result<u64>;

    /// Historical: reshape the currently-open row for each id so its upper
    /// bound becomes the paired height (§4.5 "close-previous").
    async fn raw_range_close(
        &mut self,
        schema: EntitySchema,
        closes: &[(String, u64)],
    ) -> Result<u64>;

    /// Historical: insert one new row per version.
    async fn insert_versions(&mut self, schema: EntitySchema, rows: Vec<EntityRow>) -> Result<u64>;

    async fn upsert_metadata(&mut self, entries: &[(String, Value)]) -> Result<()>;

    /// Atomic add against whatever is currently stored for `key` -
    /// concurrency-safe even if multiple processes share the row (§4.6,
    /// §9).
    async fn increment_metadata(&mut self, key: &str, delta: f64) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}
