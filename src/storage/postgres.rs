//! Postgres-backed [`Repository`].
//!
//! Entities are stored one table per type, with an `id` primary key and a
//! single `data JSONB` column carrying the whole serialized payload. In
//! historical mode the table additionally carries a `block_range INT8RANGE`
//! column whose lower-closed/upper-open semantics map directly onto §4.5's
//! version model; `upper_inf(block_range)` is the "live at tip" row.
//!
//! A migration DDL executor is explicitly out of scope (§1 Non-goals); the
//! expected DDL per entity table is documented in [`ddl_for`] for whatever
//! external migration tool owns schema creation.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Row, Transaction};

use crate::error::Result;
use crate::storage::repository::{EntityRow, EntitySchema, Repository, RepositoryTx};

pub struct PostgresRepository {
    pool: PgPool,
    historical: bool,
}

impl PostgresRepository {
    pub async fn connect(url: &str, max_connections: u32, historical: bool) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self { pool, historical })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Expected DDL for one entity table, for an external migration tool to
/// apply (§1 Non-goals: this crate does not execute migrations itself).
pub fn ddl_for(schema: EntitySchema, historical: bool) -> String {
    if historical {
        format!(
            "CREATE TABLE IF NOT EXISTS {table} (\n  id TEXT NOT NULL,\n  data JSONB NOT NULL,\n  block_range INT8RANGE NOT NULL\n);\nCREATE INDEX IF NOT EXISTS {table}_id_idx ON {table} (id);\nCREATE INDEX IF NOT EXISTS {table}_range_idx ON {table} USING gist (block_range);",
            table = schema.table
        )
    } else {
        format!(
            "CREATE TABLE IF NOT EXISTS {table} (\n  id TEXT PRIMARY KEY,\n  data JSONB NOT NULL\n);",
            table = schema.table
        )
    }
}

fn row_to_entity(row: sqlx::postgres::PgRow, historical: bool) -> EntityRow {
    let id: String = row.get("id");
    let data: Value = row.get("data");
    if historical {
        let start_height: i64 = row.get("start_height");
        let end_height: Option<i64> = row.try_get("end_height").unwrap_or(None);
        EntityRow {
            id,
            data,
            start_height: start_height as u64,
            end_height: end_height.map(|h| h as u64),
        }
    } else {
        EntityRow {
            id,
            data,
            start_height: 0,
            end_height: None,
        }
    }
}

#[async_trait]
impl Repository for PostgresRepository {
    async fn find_by_pk(&self, schema: EntitySchema, id: &str) -> Result<Option<EntityRow>> {
        let row = if self.historical {
            let sql = format!(
                "SELECT id, data, lower(block_range) AS start_height, upper(block_range) AS end_height \
                 FROM {table} WHERE id = $1 AND upper_inf(block_range)",
                table = schema.table
            );
            sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?
        } else {
            let sql = format!("SELECT id, data FROM {table} WHERE id = $1", table = schema.table);
            sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?
        };
        Ok(row.map(|r| row_to_entity(r, self.historical)))
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
        let live_clause = if self.historical {
            "AND upper_inf(block_range)"
        } else {
            ""
        };
        let select = if self.historical {
            "id, data, lower(block_range) AS start_height, upper(block_range) AS end_height"
        } else {
            "id, data"
        };
        let sql = format!(
            "SELECT {select} FROM {table} WHERE data -> $1 = $2 AND NOT (id = ANY($3)) {live} \
             ORDER BY id LIMIT $4 OFFSET $5",
            select = select,
            table = schema.table,
            live = live_clause,
        );
        let rows = sqlx::query(&sql)
            .bind(field)
            .bind(value)
            .bind(exclude_ids)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| row_to_entity(r, self.historical)).collect())
    }

    async fn count_where(
        &self,
        schema: EntitySchema,
        field: Option<&str>,
        value: Option<&Value>,
        exclude_ids: &[String],
        distinct_column: Option<&str>,
    ) -> Result<i64> {
        let live_clause = if self.historical {
            "AND upper_inf(block_range)"
        } else {
            ""
        };
        let count_expr = match distinct_column {
            Some(col) => format!("COUNT(DISTINCT data ->> '{col}')", col = col),
            None => "COUNT(*)".to_string(),
        };
        let (where_clause, sql_params): (String, bool) = match (field, value) {
            (Some(_), Some(_)) => ("AND data -> $1 = $2".to_string(), true),
            _ => (String::new(), false),
        };
        let sql = format!(
            "SELECT {count_expr} AS n FROM {table} WHERE NOT (id = ANY(${idx})) {where_clause} {live}",
            count_expr = count_expr,
            table = schema.table,
            idx = if sql_params { 3 } else { 1 },
            where_clause = where_clause,
            live = live_clause,
        );
        let query = if sql_params {
            sqlx::query(&sql).bind(field.unwrap()).bind(value.unwrap()).bind(exclude_ids)
        } else {
            sqlx::query(&sql).bind(exclude_ids)
        };
        let row = query.fetch_one(&self.pool).await?;
        Ok(row.try_get::<i64, _>("n")?)
    }

    async fn find_metadata(&self, key: &str) -> Result<Option<Value>> {
        let row = sqlx::query("SELECT value FROM metadata WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<Value, _>("value")))
    }

    async fn find_metadata_many(&self, keys: &[String]) -> Result<HashMap<String, Value>> {
        let rows = sqlx::query("SELECT key, value FROM metadata WHERE key = ANY($1)")
            .bind(keys)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get::<String, _>("key"), r.get::<Value, _>("value")))
            .collect())
    }

    async fn begin(&self) -> Result<Box<dyn RepositoryTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PostgresTx {
            tx: Some(tx),
            historical: self.historical,
        }))
    }
}

pub struct PostgresTx {
    tx: Option<Transaction<'static, Postgres>>,
    historical: bool,
}

impl PostgresTx {
    fn tx_mut(&mut self) -> &mut Transaction<'static, Postgres> {
        self.tx.as_mut().expect("transaction used after commit/rollback")
    }
}

#[async_trait]
impl RepositoryTx for PostgresTx {
    async fn bulk_upsert(&mut self, schema: EntitySchema, rows: Vec<EntityRow>) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
        let datas: Vec<Value> = rows.iter().map(|r| r.data.clone()).collect();
        let sql = format!(
            "INSERT INTO {table} (id, data) SELECT * FROM UNNEST($1::text[], $2::jsonb[]) \
             ON CONFLICT (id) DO UPDATE SET data = excluded.data",
            table = schema.table
        );
        let result = sqlx::query(&sql).bind(&ids).bind(&datas).execute(self.tx_mut()).await?;
        Ok(result.rows_affected())
    }

    async fn delete_where_ids(&mut self, schema: EntitySchema, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = format!("DELETE FROM {table} WHERE id = ANY($1)", table = schema.table);
        let result = sqlx::query(&sql).bind(ids).execute(self.tx_mut()).await?;
        Ok(result.rows_affected())
    }

    async fn raw_range_close(&mut self, schema: EntitySchema, closes: &[(String, u64)]) -> Result<u64> {
        debug_assert!(self.historical, "raw_range_close only applies in historical mode");
        if closes.is_empty() {
            return Ok(0);
        }
        // Each (id, new upper bound) closes the live `[lo, inf)` row into
        // `[lo, new_upper)`. Issued as one statement per flush batch using
        // UNNEST, not truly parallel with the subsequent insert: a single
        // Postgres connection only ever executes one statement at a time
        // regardless of how many client-side futures are in flight, so
        // "parallel on tx" in §4.5 reduces to "on the same transaction,
        // back to back" for any single-connection backend.
        let ids: Vec<String> = closes.iter().map(|(id, _)| id.clone()).collect();
        let uppers: Vec<i64> = closes.iter().map(|(_, h)| *h as i64).collect();
        let sql = format!(
            "UPDATE {table} t SET block_range = int8range(lower(t.block_range), u.new_upper) \
             FROM UNNEST($1::text[], $2::bigint[]) AS u(id, new_upper) \
             WHERE t.id = u.id AND upper_inf(t.block_range)",
            table = schema.table
        );
        let result = sqlx::query(&sql).bind(&ids).bind(&uppers).execute(self.tx_mut()).await?;
        Ok(result.rows_affected())
    }

    async fn insert_versions(&mut self, schema: EntitySchema, rows: Vec<EntityRow>) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
        let datas: Vec<Value> = rows.iter().map(|r| r.data.clone()).collect();
        let los: Vec<i64> = rows.iter().map(|r| r.start_height as i64).collect();
        let his: Vec<Option<i64>> = rows.iter().map(|r| r.end_height.map(|h| h as i64)).collect();
        let sql = format!(
            "INSERT INTO {table} (id, data, block_range) \
             SELECT id, data, int8range(lo, hi) FROM UNNEST($1::text[], $2::jsonb[], $3::bigint[], $4::bigint[]) \
             AS u(id, data, lo, hi)",
            table = schema.table
        );
        let result = sqlx::query(&sql)
            .bind(&ids)
            .bind(&datas)
            .bind(&los)
            .bind(&his)
            .execute(self.tx_mut())
            .await?;
        Ok(result.rows_affected())
    }

    async fn upsert_metadata(&mut self, entries: &[(String, Value)]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let keys: Vec<String> = entries.iter().map(|(k, _)| k.clone()).collect();
        let values: Vec<Value> = entries.iter().map(|(_, v)| v.clone()).collect();
        sqlx::query(
            "INSERT INTO metadata (key, value) SELECT * FROM UNNEST($1::text[], $2::jsonb[]) \
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        )
        .bind(&keys)
        .bind(&values)
        .execute(self.tx_mut())
        .await?;
        Ok(())
    }

    async fn increment_metadata(&mut self, key: &str, delta: f64) -> Result<()> {
        sqlx::query(
            "INSERT INTO metadata (key, value) VALUES ($1, to_jsonb($2::double precision)) \
             ON CONFLICT (key) DO UPDATE SET value = \
               to_jsonb(COALESCE((metadata.value #>> '{}')::double precision, 0) + $2::double precision)",
        )
        .bind(key)
        .bind(delta)
        .execute(self.tx_mut())
        .await?;
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        self.tx.take().expect("double commit").commit().await?;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        self.tx.take().expect("double rollback").rollback().await?;
        Ok(())
    }
}
