//! In-memory [`ShadowStore`] implementation for tests and dry runs.
//!
//! Databases, tables and rows live in nested `HashMap`s behind a single
//! `std::sync::RwLock`. Upsert semantics (surrogate id stability, version
//! compare-and-set, embedding reset on text change) match the PostgreSQL
//! store. Nearest-neighbor search is brute-force cosine distance.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::embedding::cosine_similarity;
use crate::error::{SyncError, SyncResult};
use crate::models::{EmbeddingTask, Neighbor, PendingRow, ShadowRow, TableStats};

use super::{json_contains, ShadowStore};

type Rows = HashMap<String, ShadowRow>;
type Tables = HashMap<String, Rows>;

/// In-memory shadow store.
pub struct InMemoryShadowStore {
    databases: RwLock<HashMap<String, Tables>>,
    next_id: AtomicI64,
}

impl InMemoryShadowStore {
    pub fn new() -> Self {
        Self {
            databases: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }

    fn read(&self) -> SyncResult<RwLockReadGuard<'_, HashMap<String, Tables>>> {
        self.databases
            .read()
            .map_err(|_| SyncError::Persistence("in-memory store lock poisoned".to_string()))
    }

    fn write(&self) -> SyncResult<RwLockWriteGuard<'_, HashMap<String, Tables>>> {
        self.databases
            .write()
            .map_err(|_| SyncError::Persistence("in-memory store lock poisoned".to_string()))
    }
}

impl Default for InMemoryShadowStore {
    fn default() -> Self {
        Self::new()
    }
}

fn missing_database(database: &str) -> SyncError {
    SyncError::Persistence(format!("database \"{}\" does not exist", database))
}

fn missing_table(table: &str) -> SyncError {
    SyncError::Persistence(format!("relation \"{}\" does not exist", table))
}

#[async_trait]
impl ShadowStore for InMemoryShadowStore {
    async fn ensure_database(&self, database: &str) -> SyncResult<()> {
        self.write()?.entry(database.to_string()).or_default();
        Ok(())
    }

    async fn ensure_table(&self, database: &str, table: &str) -> SyncResult<()> {
        let mut dbs = self.write()?;
        let tables = dbs
            .get_mut(database)
            .ok_or_else(|| missing_database(database))?;
        tables.entry(table.to_string()).or_default();
        Ok(())
    }

    async fn upsert_rows(
        &self,
        database: &str,
        table: &str,
        rows: &[PendingRow],
    ) -> SyncResult<u64> {
        let mut dbs = self.write()?;
        let stored = dbs
            .get_mut(database)
            .ok_or_else(|| missing_database(database))?
            .get_mut(table)
            .ok_or_else(|| missing_table(table))?;

        let mut written = 0;
        for row in rows {
            let now = Utc::now();
            match stored.get_mut(&row.record_id) {
                Some(existing) => {
                    if let (Some(incoming), Some(current)) =
                        (row.source_updated_at, existing.source_updated_at)
                    {
                        if incoming < current {
                            continue;
                        }
                    }
                    if existing.semantic_text != row.semantic_text {
                        existing.embedding = None;
                    }
                    existing.data = row.data.clone();
                    existing.semantic_text = row.semantic_text.clone();
                    existing.source_updated_at =
                        row.source_updated_at.or(existing.source_updated_at);
                    existing.updated_at = now;
                    existing.synced_at = now;
                }
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                    stored.insert(
                        row.record_id.clone(),
                        ShadowRow {
                            id,
                            record_id: row.record_id.clone(),
                            data: row.data.clone(),
                            semantic_text: row.semantic_text.clone(),
                            embedding: None,
                            source_updated_at: row.source_updated_at,
                            created_at: now,
                            updated_at: now,
                            synced_at: now,
                        },
                    );
                }
            }
            written += 1;
        }
        Ok(written)
    }

    async fn delete_row(&self, database: &str, table: &str, record_id: &str) -> SyncResult<u64> {
        let mut dbs = self.write()?;
        let removed = dbs
            .get_mut(database)
            .and_then(|tables| tables.get_mut(table))
            .and_then(|rows| rows.remove(record_id));
        Ok(u64::from(removed.is_some()))
    }

    async fn pending_embeddings(
        &self,
        database: &str,
        table: &str,
        limit: usize,
    ) -> SyncResult<Vec<EmbeddingTask>> {
        let dbs = self.read()?;
        let Some(rows) = rows_of(&dbs, database, table) else {
            return Ok(Vec::new());
        };

        let mut pending: Vec<EmbeddingTask> = rows
            .values()
            .filter(|r| r.embedding.is_none())
            .filter_map(|r| {
                r.semantic_text.as_ref().map(|text| EmbeddingTask {
                    id: r.id,
                    text: text.clone(),
                })
            })
            .collect();
        pending.sort_by_key(|t| t.id);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn store_embedding(
        &self,
        database: &str,
        table: &str,
        id: i64,
        text: &str,
        embedding: &[f32],
    ) -> SyncResult<bool> {
        let mut dbs = self.write()?;
        let Some(rows) = dbs
            .get_mut(database)
            .and_then(|tables| tables.get_mut(table))
        else {
            return Ok(false);
        };

        let target = rows
            .values_mut()
            .find(|r| r.id == id && r.semantic_text.as_deref() == Some(text));
        match target {
            Some(row) => {
                row.embedding = Some(embedding.to_vec());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn nearest(
        &self,
        database: &str,
        table: &str,
        query: &[f32],
        filter: Option<&Value>,
        limit: usize,
    ) -> SyncResult<Vec<Neighbor>> {
        let dbs = self.read()?;
        let Some(rows) = rows_of(&dbs, database, table) else {
            return Ok(Vec::new());
        };

        let mut hits: Vec<Neighbor> = rows
            .values()
            .filter(|r| filter.map_or(true, |f| json_contains(&r.data, f)))
            .filter_map(|r| {
                r.embedding.as_ref().map(|v| Neighbor {
                    id: r.id,
                    record_id: r.record_id.clone(),
                    data: r.data.clone(),
                    distance: 1.0 - f64::from(cosine_similarity(query, v)),
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.id.cmp(&b.id))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn filter_rows(
        &self,
        database: &str,
        table: &str,
        filter: &Value,
        limit: usize,
        offset: usize,
    ) -> SyncResult<Vec<ShadowRow>> {
        let dbs = self.read()?;
        let Some(rows) = rows_of(&dbs, database, table) else {
            return Ok(Vec::new());
        };

        let mut matched: Vec<&ShadowRow> = rows
            .values()
            .filter(|r| json_contains(&r.data, filter))
            .collect();
        matched.sort_by_key(|r| r.id);
        Ok(matched
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn list_tables(&self, database: &str) -> SyncResult<Vec<String>> {
        let dbs = self.read()?;
        let mut names: Vec<String> = dbs
            .get(database)
            .map(|tables| tables.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        Ok(names)
    }

    async fn has_embedding_column(&self, database: &str, table: &str) -> SyncResult<bool> {
        let dbs = self.read()?;
        Ok(rows_of(&dbs, database, table).is_some())
    }

    async fn count_rows(&self, database: &str, table: &str) -> SyncResult<i64> {
        let dbs = self.read()?;
        Ok(rows_of(&dbs, database, table).map_or(0, |rows| rows.len() as i64))
    }

    async fn table_stats(
        &self,
        database: &str,
        table: &str,
        since: DateTime<Utc>,
    ) -> SyncResult<TableStats> {
        let dbs = self.read()?;
        let Some(rows) = rows_of(&dbs, database, table) else {
            return Ok(TableStats::default());
        };

        Ok(TableStats {
            rows: rows.len() as i64,
            embedded: rows.values().filter(|r| r.embedding.is_some()).count() as i64,
            recent: rows.values().filter(|r| r.updated_at >= since).count() as i64,
            last_synced_at: rows.values().map(|r| r.synced_at).max(),
        })
    }

    async fn get_row(
        &self,
        database: &str,
        table: &str,
        record_id: &str,
    ) -> SyncResult<Option<ShadowRow>> {
        let dbs = self.read()?;
        Ok(rows_of(&dbs, database, table).and_then(|rows| rows.get(record_id)).cloned())
    }
}

fn rows_of<'a>(dbs: &'a HashMap<String, Tables>, database: &str, table: &str) -> Option<&'a Rows> {
    dbs.get(database).and_then(|tables| tables.get(table))
}
