//! PostgreSQL + pgvector implementation of [`ShadowStore`].
//!
//! One administrative pool (the configured `admin_url`) is opened at startup
//! and is used only to create shadow databases. Each shadow database then
//! gets its own pool, created on first use and kept for the process
//! lifetime, so the number of pools is bounded by the number of sources.
//!
//! Shadow table layout:
//!
//! ```sql
//! id                BIGSERIAL PRIMARY KEY
//! record_id         TEXT NOT NULL UNIQUE
//! data              JSONB NOT NULL
//! semantic_text     TEXT
//! embedding         vector(D)
//! source_updated_at TIMESTAMPTZ
//! created_at        TIMESTAMPTZ NOT NULL DEFAULT now()
//! updated_at        TIMESTAMPTZ NOT NULL DEFAULT now()
//! synced_at         TIMESTAMPTZ NOT NULL DEFAULT now()
//! ```
//!
//! plus an HNSW index (`vector_cosine_ops`) on `embedding` and a GIN index
//! (`jsonb_path_ops`) on `data`.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgvector::Vector;
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::config::ShadowConfig;
use crate::error::{SyncError, SyncResult};
use crate::models::{EmbeddingTask, Neighbor, PendingRow, ShadowRow, TableStats};

use super::{quote_ident, ShadowStore, MAX_IDENTIFIER_BYTES};

const DUPLICATE_DATABASE: &str = "42P04";
const DUPLICATE_TABLE: &str = "42P07";
const DUPLICATE_OBJECT: &str = "42710";
const UNIQUE_VIOLATION: &str = "23505";
const UNDEFINED_TABLE: &str = "42P01";
const INVALID_CATALOG_NAME: &str = "3D000";

const SHADOW_COLUMNS: &str = "id, record_id, data, semantic_text, embedding, source_updated_at, \
     created_at, updated_at, synced_at";

pub struct PgShadowStore {
    admin: PgPool,
    connect_options: PgConnectOptions,
    max_connections: u32,
    acquire_timeout: Duration,
    dims: usize,
    pools: RwLock<HashMap<String, PgPool>>,
    ready_databases: Mutex<HashSet<String>>,
    ready_tables: Mutex<HashSet<(String, String)>>,
}

impl PgShadowStore {
    /// Open the administrative pool. Failure here is fatal for the process.
    pub async fn connect(config: &ShadowConfig, dims: usize) -> SyncResult<Self> {
        let connect_options = PgConnectOptions::from_str(&config.admin_url)?.options([(
            "statement_timeout",
            format!("{}s", config.statement_timeout_secs),
        )]);
        let acquire_timeout = Duration::from_secs(config.statement_timeout_secs.max(1));

        let admin = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(acquire_timeout)
            .connect_with(connect_options.clone())
            .await
            .map_err(|e| {
                SyncError::Persistence(format!("Failed to connect to admin database: {}", e))
            })?;

        Ok(Self {
            admin,
            connect_options,
            max_connections: config.max_connections,
            acquire_timeout,
            dims,
            pools: RwLock::new(HashMap::new()),
            ready_databases: Mutex::new(HashSet::new()),
            ready_tables: Mutex::new(HashSet::new()),
        })
    }

    /// Pool for a shadow database, created on first use.
    async fn pool(&self, database: &str) -> Result<PgPool, sqlx::Error> {
        if let Some(pool) = self.pools.read().await.get(database) {
            return Ok(pool.clone());
        }

        let opened = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.acquire_timeout)
            .connect_with(self.connect_options.clone().database(database))
            .await?;

        let mut pools = self.pools.write().await;
        let pool = pools
            .entry(database.to_string())
            .or_insert_with(|| {
                debug!(database, "opened shadow pool");
                opened
            })
            .clone();
        Ok(pool)
    }

    /// Pool for a shadow database that may not exist yet; `None` if absent.
    async fn existing_pool(&self, database: &str) -> SyncResult<Option<PgPool>> {
        or_absent(self.pool(database).await.map(Some), None)
    }

    async fn run_ddl(&self, pool: &PgPool, sql: &str) -> SyncResult<()> {
        match sqlx::query(sql).execute(pool).await {
            Ok(_) => Ok(()),
            Err(e) if has_code(&e, &[DUPLICATE_TABLE, DUPLICATE_OBJECT, UNIQUE_VIOLATION]) => {
                debug!(error = %e, "ignoring concurrent DDL");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn has_code(err: &sqlx::Error, codes: &[&str]) -> bool {
    match err {
        sqlx::Error::Database(db) => db
            .code()
            .as_deref()
            .map(|code| codes.contains(&code))
            .unwrap_or(false),
        _ => false,
    }
}

fn is_missing_relation(err: &sqlx::Error) -> bool {
    has_code(err, &[UNDEFINED_TABLE, INVALID_CATALOG_NAME])
}

/// Map a missing database or table to `absent`.
fn or_absent<T>(result: Result<T, sqlx::Error>, absent: T) -> SyncResult<T> {
    match result {
        Ok(value) => Ok(value),
        Err(e) if is_missing_relation(&e) => Ok(absent),
        Err(e) => Err(e.into()),
    }
}

/// `{table}_{suffix}`, shortening the table part so the name fits the
/// identifier limit.
fn index_name(table: &str, suffix: &str) -> String {
    let room = MAX_IDENTIFIER_BYTES.saturating_sub(suffix.len() + 1);
    let head: String = table.chars().take(room).collect();
    format!("{}_{}", head, suffix)
}

fn row_to_shadow(row: &PgRow) -> SyncResult<ShadowRow> {
    let embedding: Option<Vector> = row.try_get("embedding")?;
    Ok(ShadowRow {
        id: row.try_get("id")?,
        record_id: row.try_get("record_id")?,
        data: row.try_get("data")?,
        semantic_text: row.try_get("semantic_text")?,
        embedding: embedding.map(|v| v.to_vec()),
        source_updated_at: row.try_get("source_updated_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        synced_at: row.try_get("synced_at")?,
    })
}

#[async_trait]
impl ShadowStore for PgShadowStore {
    async fn ensure_database(&self, database: &str) -> SyncResult<()> {
        if self.ready_databases.lock().await.contains(database) {
            return Ok(());
        }

        let exists = sqlx::query("SELECT 1 FROM pg_database WHERE datname = $1")
            .bind(database)
            .fetch_optional(&self.admin)
            .await?
            .is_some();

        if !exists {
            let sql = format!("CREATE DATABASE {}", quote_ident(database));
            match sqlx::query(&sql).execute(&self.admin).await {
                Ok(_) => info!(database, "created shadow database"),
                Err(e) if has_code(&e, &[DUPLICATE_DATABASE, UNIQUE_VIOLATION]) => {
                    debug!(database, "shadow database created concurrently");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let pool = self.pool(database).await?;
        self.run_ddl(&pool, "CREATE EXTENSION IF NOT EXISTS vector")
            .await?;

        self.ready_databases
            .lock()
            .await
            .insert(database.to_string());
        Ok(())
    }

    async fn ensure_table(&self, database: &str, table: &str) -> SyncResult<()> {
        let key = (database.to_string(), table.to_string());
        if self.ready_tables.lock().await.contains(&key) {
            return Ok(());
        }

        let pool = self.pool(database).await?;
        let quoted = quote_ident(table);

        let create = format!(
            "CREATE TABLE IF NOT EXISTS {quoted} (
                id BIGSERIAL PRIMARY KEY,
                record_id TEXT NOT NULL UNIQUE,
                data JSONB NOT NULL DEFAULT '{{}}'::jsonb,
                semantic_text TEXT,
                embedding vector({dims}),
                source_updated_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                synced_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
            dims = self.dims
        );
        self.run_ddl(&pool, &create).await?;

        let hnsw = format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} USING hnsw (embedding vector_cosine_ops)",
            quote_ident(&index_name(table, "embedding_hnsw")),
            quoted
        );
        self.run_ddl(&pool, &hnsw).await?;

        let gin = format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} USING gin (data jsonb_path_ops)",
            quote_ident(&index_name(table, "data_gin")),
            quoted
        );
        self.run_ddl(&pool, &gin).await?;

        self.ready_tables.lock().await.insert(key);
        Ok(())
    }

    async fn upsert_rows(
        &self,
        database: &str,
        table: &str,
        rows: &[PendingRow],
    ) -> SyncResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let pool = self.pool(database).await?;
        let sql = format!(
            "INSERT INTO {t} AS s (record_id, data, semantic_text, source_updated_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (record_id) DO UPDATE SET
                data = EXCLUDED.data,
                embedding = CASE
                    WHEN s.semantic_text IS DISTINCT FROM EXCLUDED.semantic_text THEN NULL
                    ELSE s.embedding
                END,
                semantic_text = EXCLUDED.semantic_text,
                source_updated_at = COALESCE(EXCLUDED.source_updated_at, s.source_updated_at),
                updated_at = now(),
                synced_at = now()
             WHERE s.source_updated_at IS NULL
                OR EXCLUDED.source_updated_at IS NULL
                OR EXCLUDED.source_updated_at >= s.source_updated_at",
            t = quote_ident(table)
        );

        let mut tx = pool.begin().await?;
        let mut written = 0;
        for row in rows {
            let result = sqlx::query(&sql)
                .bind(&row.record_id)
                .bind(&row.data)
                .bind(&row.semantic_text)
                .bind(row.source_updated_at)
                .execute(&mut *tx)
                .await?;
            written += result.rows_affected();
        }
        tx.commit().await?;

        Ok(written)
    }

    async fn delete_row(&self, database: &str, table: &str, record_id: &str) -> SyncResult<u64> {
        let Some(pool) = self.existing_pool(database).await? else {
            return Ok(0);
        };
        let sql = format!("DELETE FROM {} WHERE record_id = $1", quote_ident(table));
        let result = sqlx::query(&sql).bind(record_id).execute(&pool).await;
        or_absent(result.map(|r| r.rows_affected()), 0)
    }

    async fn pending_embeddings(
        &self,
        database: &str,
        table: &str,
        limit: usize,
    ) -> SyncResult<Vec<EmbeddingTask>> {
        let Some(pool) = self.existing_pool(database).await? else {
            return Ok(Vec::new());
        };
        let sql = format!(
            "SELECT id, semantic_text FROM {}
             WHERE embedding IS NULL AND semantic_text IS NOT NULL
             ORDER BY id LIMIT $1",
            quote_ident(table)
        );
        let rows = or_absent(
            sqlx::query(&sql).bind(limit as i64).fetch_all(&pool).await,
            Vec::new(),
        )?;

        rows.iter()
            .map(|row| {
                Ok(EmbeddingTask {
                    id: row.try_get("id")?,
                    text: row.try_get("semantic_text")?,
                })
            })
            .collect()
    }

    async fn store_embedding(
        &self,
        database: &str,
        table: &str,
        id: i64,
        text: &str,
        embedding: &[f32],
    ) -> SyncResult<bool> {
        let Some(pool) = self.existing_pool(database).await? else {
            return Ok(false);
        };
        let sql = format!(
            "UPDATE {} SET embedding = $1 WHERE id = $2 AND semantic_text = $3",
            quote_ident(table)
        );
        let result = sqlx::query(&sql)
            .bind(Vector::from(embedding.to_vec()))
            .bind(id)
            .bind(text)
            .execute(&pool)
            .await;
        or_absent(result.map(|r| r.rows_affected() > 0), false)
    }

    async fn nearest(
        &self,
        database: &str,
        table: &str,
        query: &[f32],
        filter: Option<&Value>,
        limit: usize,
    ) -> SyncResult<Vec<Neighbor>> {
        let Some(pool) = self.existing_pool(database).await? else {
            return Ok(Vec::new());
        };
        let sql = format!(
            "SELECT id, record_id, data, (embedding <=> $1)::float8 AS distance
             FROM {}
             WHERE embedding IS NOT NULL
               AND ($3::jsonb IS NULL OR data @> $3::jsonb)
             ORDER BY embedding <=> $1
             LIMIT $2",
            quote_ident(table)
        );
        let rows = sqlx::query(&sql)
            .bind(Vector::from(query.to_vec()))
            .bind(limit as i64)
            .bind(filter.cloned())
            .fetch_all(&pool)
            .await;
        let rows = or_absent(rows, Vec::new())?;

        rows.iter()
            .map(|row| {
                Ok(Neighbor {
                    id: row.try_get("id")?,
                    record_id: row.try_get("record_id")?,
                    data: row.try_get("data")?,
                    distance: row.try_get("distance")?,
                })
            })
            .collect()
    }

    async fn filter_rows(
        &self,
        database: &str,
        table: &str,
        filter: &Value,
        limit: usize,
        offset: usize,
    ) -> SyncResult<Vec<ShadowRow>> {
        let Some(pool) = self.existing_pool(database).await? else {
            return Ok(Vec::new());
        };
        let sql = format!(
            "SELECT {SHADOW_COLUMNS} FROM {}
             WHERE data @> $1
             ORDER BY id
             LIMIT $2 OFFSET $3",
            quote_ident(table)
        );
        let rows = sqlx::query(&sql)
            .bind(filter)
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&pool)
            .await;

        or_absent(rows, Vec::new())?
            .iter()
            .map(row_to_shadow)
            .collect()
    }

    async fn list_tables(&self, database: &str) -> SyncResult<Vec<String>> {
        let Some(pool) = self.existing_pool(database).await? else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query(
            "SELECT table_name::text AS name FROM information_schema.tables
             WHERE table_schema = 'public' AND table_type = 'BASE TABLE'
             ORDER BY table_name",
        )
        .fetch_all(&pool)
        .await?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("name").map_err(SyncError::from))
            .collect()
    }

    async fn has_embedding_column(&self, database: &str, table: &str) -> SyncResult<bool> {
        let Some(pool) = self.existing_pool(database).await? else {
            return Ok(false);
        };
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (
                SELECT 1 FROM information_schema.columns
                WHERE table_schema = 'public' AND table_name = $1 AND column_name = 'embedding'
            )",
        )
        .bind(table)
        .fetch_one(&pool)
        .await?;
        Ok(exists)
    }

    async fn count_rows(&self, database: &str, table: &str) -> SyncResult<i64> {
        let Some(pool) = self.existing_pool(database).await? else {
            return Ok(0);
        };
        let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
        or_absent(sqlx::query_scalar(&sql).fetch_one(&pool).await, 0)
    }

    async fn table_stats(
        &self,
        database: &str,
        table: &str,
        since: DateTime<Utc>,
    ) -> SyncResult<TableStats> {
        let Some(pool) = self.existing_pool(database).await? else {
            return Ok(TableStats::default());
        };
        let sql = format!(
            "SELECT COUNT(*) AS total,
                    COUNT(embedding) AS embedded,
                    COUNT(*) FILTER (WHERE updated_at >= $1) AS recent,
                    MAX(synced_at) AS last_synced_at
             FROM {}",
            quote_ident(table)
        );
        let Some(row) = or_absent(
            sqlx::query(&sql).bind(since).fetch_one(&pool).await.map(Some),
            None,
        )?
        else {
            return Ok(TableStats::default());
        };

        Ok(TableStats {
            rows: row.try_get("total")?,
            embedded: row.try_get("embedded")?,
            recent: row.try_get("recent")?,
            last_synced_at: row.try_get("last_synced_at")?,
        })
    }

    async fn get_row(
        &self,
        database: &str,
        table: &str,
        record_id: &str,
    ) -> SyncResult<Option<ShadowRow>> {
        let Some(pool) = self.existing_pool(database).await? else {
            return Ok(None);
        };
        let sql = format!(
            "SELECT {SHADOW_COLUMNS} FROM {} WHERE record_id = $1",
            quote_ident(table)
        );
        let row = sqlx::query(&sql).bind(record_id).fetch_optional(&pool).await;
        or_absent(row, None)?.as_ref().map(row_to_shadow).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_name_fits_identifier_limit() {
        let table = "t".repeat(MAX_IDENTIFIER_BYTES);
        let name = index_name(&table, "embedding_hnsw");
        assert_eq!(name.len(), MAX_IDENTIFIER_BYTES);
        assert!(name.ends_with("_embedding_hnsw"));
        assert_eq!(index_name("orders", "data_gin"), "orders_data_gin");
    }

    #[test]
    fn test_or_absent_keeps_other_errors() {
        assert_eq!(or_absent(Ok(3_i64), 0).unwrap(), 3);
        assert!(or_absent::<i64>(Err(sqlx::Error::RowNotFound), 0).is_err());
    }
}
