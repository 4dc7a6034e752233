//! Access-gated semantic search over shadow tables.
//!
//! Each request runs strictly in order: authorize the caller, validate the
//! target and parameters, embed the query, run the nearest-neighbor search,
//! format the hits. A denied caller never reaches the store.
//!
//! The same gate covers structured queries (`data @> filter`), table schemas
//! and per-table stats.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::access::AccessPolicy;
use crate::embedding::{embed_query, EmbeddingProvider};
use crate::error::{SyncError, SyncResult};
use crate::models::{CallerIdentity, Neighbor, ShadowRow, TableStats};
use crate::registry::{DiscoverySnapshot, ShadowRegistry, ShadowTarget, TableTarget};
use crate::store::ShadowStore;

pub const DEFAULT_LIMIT: i64 = 10;
pub const MAX_LIMIT: i64 = 100;
pub const DEFAULT_QUERY_LIMIT: i64 = 25;
/// Window for the `recent` counts in [`QueryEngine::stats`].
pub const RECENT_WINDOW_DAYS: i64 = 7;

#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequest {
    pub database: String,
    pub table: String,
    pub query: String,
    #[serde(default)]
    pub limit: Option<i64>,
    /// JSON object the hit's snapshot must contain.
    #[serde(default)]
    pub filter: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub success: bool,
    pub database: String,
    pub table: String,
    pub results: Vec<Value>,
}

/// Structured lookup by snapshot containment, without embeddings.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub database: String,
    pub table: String,
    #[serde(default)]
    pub filter: Option<Value>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub success: bool,
    pub database: String,
    pub table: String,
    pub records: Vec<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseInfo {
    pub source_id: String,
    pub title: String,
    pub database: String,
    pub tables: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableInfo {
    pub name: String,
    pub shadow_table: String,
    /// `None` when the store failed to count; a shadow table that does not
    /// exist yet counts as zero.
    pub row_count: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FieldInfo {
    pub name: String,
    pub field_type: String,
    pub primary_key: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableSchema {
    pub database: String,
    pub table: String,
    pub shadow_table: String,
    /// Columns captured at discovery; empty when the source did not report any.
    pub fields: Vec<FieldInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableStatsInfo {
    pub name: String,
    pub shadow_table: String,
    #[serde(flatten)]
    pub stats: TableStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseStats {
    pub source_id: String,
    pub database: String,
    pub tables: Vec<TableStatsInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    pub success: bool,
    pub recent_window_days: i64,
    pub total_rows: i64,
    pub total_embedded: i64,
    pub total_recent: i64,
    pub databases: Vec<DatabaseStats>,
}

pub struct QueryEngine {
    store: Arc<dyn ShadowStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    registry: Arc<ShadowRegistry>,
    access: AccessPolicy,
}

impl QueryEngine {
    pub fn new(
        store: Arc<dyn ShadowStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        registry: Arc<ShadowRegistry>,
        access: AccessPolicy,
    ) -> Self {
        Self {
            store,
            embedder,
            registry,
            access,
        }
    }

    pub fn access(&self) -> &AccessPolicy {
        &self.access
    }

    /// Shadow database of the caller's allowed source, if it was discovered.
    pub fn allowed_database(&self, caller: &CallerIdentity) -> Option<String> {
        let snapshot = self.registry.snapshot();
        self.access
            .allowed_target(caller, &snapshot)
            .map(|t| t.database.clone())
    }

    pub async fn search(
        &self,
        caller: &CallerIdentity,
        request: &SearchRequest,
    ) -> SyncResult<SearchResponse> {
        let snapshot = self.registry.snapshot();
        let target = self.authorized_target(caller, &request.database, &snapshot)?;
        let table = resolve_table(target, &request.database, &request.table)?;
        let limit = validate_limit(request.limit)?;
        let filter = validate_filter(request.filter.as_ref())?;
        let query = request.query.trim();
        if query.is_empty() {
            return Err(SyncError::Validation("query must not be empty".to_string()));
        }
        if !self
            .store
            .has_embedding_column(&target.database, &table.shadow_table)
            .await?
        {
            return Err(SyncError::Validation(format!(
                "table '{}' has no embedding column",
                request.table
            )));
        }

        if !self.embedder.is_enabled() {
            return Err(SyncError::EmbeddingUnavailable(
                "no embedding provider is configured".to_string(),
            ));
        }
        let vector = embed_query(self.embedder.as_ref(), query)
            .await
            .map_err(|e| SyncError::EmbeddingUnavailable(e.to_string()))?;

        let hits = self
            .store
            .nearest(&target.database, &table.shadow_table, &vector, filter, limit)
            .await?;
        debug!(
            database = %target.database,
            table = %table.shadow_table,
            filtered = filter.is_some(),
            hits = hits.len(),
            "search"
        );

        Ok(SearchResponse {
            success: true,
            database: target.database.clone(),
            table: table.table.name.clone(),
            results: hits.into_iter().map(format_hit).collect(),
        })
    }

    /// Rows whose snapshot contains `filter`, paged by surrogate id. An absent
    /// filter matches every row.
    pub async fn query_records(
        &self,
        caller: &CallerIdentity,
        request: &QueryRequest,
    ) -> SyncResult<QueryResponse> {
        let snapshot = self.registry.snapshot();
        let target = self.authorized_target(caller, &request.database, &snapshot)?;
        let table = resolve_table(target, &request.database, &request.table)?;
        let limit = validate_limit(Some(request.limit.unwrap_or(DEFAULT_QUERY_LIMIT)))?;
        let offset = match request.offset.unwrap_or(0) {
            n if n < 0 => {
                return Err(SyncError::Validation("offset must not be negative".to_string()))
            }
            n => n as usize,
        };
        let everything = Value::Object(Map::new());
        let filter = validate_filter(request.filter.as_ref())?.unwrap_or(&everything);

        let rows = self
            .store
            .filter_rows(&target.database, &table.shadow_table, filter, limit, offset)
            .await?;
        debug!(
            database = %target.database,
            table = %table.shadow_table,
            rows = rows.len(),
            "query"
        );

        Ok(QueryResponse {
            success: true,
            database: target.database.clone(),
            table: table.table.name.clone(),
            records: rows.into_iter().map(format_row).collect(),
        })
    }

    /// Shadow databases the caller may read, with their table names.
    pub fn databases(&self, caller: &CallerIdentity) -> Vec<DatabaseInfo> {
        let snapshot = self.registry.snapshot();
        snapshot
            .targets
            .iter()
            .filter(|t| self.access.visible(caller, t, &snapshot))
            .map(|t| DatabaseInfo {
                source_id: t.source.id.clone(),
                title: t.source.title.clone(),
                database: t.database.clone(),
                tables: t.tables.iter().map(|tt| tt.table.name.clone()).collect(),
            })
            .collect()
    }

    pub async fn tables(&self, caller: &CallerIdentity, database: &str) -> SyncResult<Vec<TableInfo>> {
        let snapshot = self.registry.snapshot();
        let target = self.authorized_target(caller, database, &snapshot)?;

        let mut tables = Vec::with_capacity(target.tables.len());
        for table in &target.tables {
            let row_count = match self
                .store
                .count_rows(&target.database, &table.shadow_table)
                .await
            {
                Ok(count) => Some(count),
                Err(e) => {
                    warn!(table = %table.shadow_table, error = %e, "could not count rows");
                    None
                }
            };
            tables.push(TableInfo {
                name: table.table.name.clone(),
                shadow_table: table.shadow_table.clone(),
                row_count,
            });
        }
        Ok(tables)
    }

    /// Column metadata of one table, as captured at discovery.
    pub fn table_schema(
        &self,
        caller: &CallerIdentity,
        database: &str,
        table: &str,
    ) -> SyncResult<TableSchema> {
        let snapshot = self.registry.snapshot();
        let target = self.authorized_target(caller, database, &snapshot)?;
        let table_target = resolve_table(target, database, table)?;

        Ok(TableSchema {
            database: target.database.clone(),
            table: table_target.table.name.clone(),
            shadow_table: table_target.shadow_table.clone(),
            fields: table_target
                .fields
                .iter()
                .map(|f| FieldInfo {
                    name: f.name.clone(),
                    field_type: f.field_type.as_str().to_string(),
                    primary_key: f.primary_key,
                })
                .collect(),
        })
    }

    /// Row, embedding and freshness counts over every database the caller
    /// may read.
    pub async fn stats(&self, caller: &CallerIdentity) -> SyncResult<StatsResponse> {
        let snapshot = self.registry.snapshot();
        let since = Utc::now() - Duration::days(RECENT_WINDOW_DAYS);

        let mut response = StatsResponse {
            success: true,
            recent_window_days: RECENT_WINDOW_DAYS,
            total_rows: 0,
            total_embedded: 0,
            total_recent: 0,
            databases: Vec::new(),
        };
        for target in snapshot
            .targets
            .iter()
            .filter(|t| self.access.visible(caller, t, &snapshot))
        {
            let mut tables = Vec::with_capacity(target.tables.len());
            for table in &target.tables {
                let stats = self
                    .store
                    .table_stats(&target.database, &table.shadow_table, since)
                    .await?;
                response.total_rows += stats.rows;
                response.total_embedded += stats.embedded;
                response.total_recent += stats.recent;
                tables.push(TableStatsInfo {
                    name: table.table.name.clone(),
                    shadow_table: table.shadow_table.clone(),
                    stats,
                });
            }
            response.databases.push(DatabaseStats {
                source_id: target.source.id.clone(),
                database: target.database.clone(),
                tables,
            });
        }
        Ok(response)
    }

    /// One shadow row by source record id.
    pub async fn get_record(
        &self,
        caller: &CallerIdentity,
        database: &str,
        table: &str,
        record_id: &str,
    ) -> SyncResult<ShadowRow> {
        let snapshot = self.registry.snapshot();
        let target = self.authorized_target(caller, database, &snapshot)?;
        let table_target = resolve_table(target, database, table)?;

        self.store
            .get_row(&target.database, &table_target.shadow_table, record_id)
            .await?
            .ok_or_else(|| {
                SyncError::NotFound(format!("record '{}' not found in '{}'", record_id, table))
            })
    }

    /// The target `database` names, once the caller is cleared to read it.
    fn authorized_target<'a>(
        &self,
        caller: &CallerIdentity,
        database: &str,
        snapshot: &'a DiscoverySnapshot,
    ) -> SyncResult<&'a ShadowTarget> {
        self.access
            .authorize(caller, database, snapshot)?
            .ok_or_else(|| SyncError::Validation(format!("unknown database '{}'", database)))
    }
}

fn resolve_table<'a>(
    target: &'a ShadowTarget,
    database: &str,
    table: &str,
) -> SyncResult<&'a TableTarget> {
    target.table(table).ok_or_else(|| {
        SyncError::Validation(format!("unknown table '{}' in '{}'", table, database))
    })
}

/// Filters must be JSON objects; containment of anything else is meaningless
/// against a record snapshot.
pub fn validate_filter(filter: Option<&Value>) -> SyncResult<Option<&Value>> {
    match filter {
        None | Some(Value::Null) => Ok(None),
        Some(value) if value.is_object() => Ok(Some(value)),
        Some(_) => Err(SyncError::Validation(
            "filter must be a JSON object".to_string(),
        )),
    }
}

/// Accept `1..=100`; absent means the default.
pub fn validate_limit(limit: Option<i64>) -> SyncResult<usize> {
    let limit = limit.unwrap_or(DEFAULT_LIMIT);
    if !(1..=MAX_LIMIT).contains(&limit) {
        return Err(SyncError::Validation(format!(
            "limit must be between 1 and {}",
            MAX_LIMIT
        )));
    }
    Ok(limit as usize)
}

/// `(1 - distance) * 100`, rounded to two decimals.
pub fn similarity_score(distance: f64) -> f64 {
    ((1.0 - distance) * 100.0 * 100.0).round() / 100.0
}

/// Snapshot fields at top level; `id` and `similarity_score` overwrite any
/// snapshot keys of the same name.
fn format_hit(hit: Neighbor) -> Value {
    let mut out = match hit.data {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("data".to_string(), other);
            map
        }
    };
    out.insert("id".to_string(), Value::from(hit.id));
    out.insert(
        "similarity_score".to_string(),
        Value::from(similarity_score(hit.distance)),
    );
    Value::Object(out)
}

/// Snapshot fields at top level plus the surrogate `id`.
fn format_row(row: ShadowRow) -> Value {
    let mut out = match row.data {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("data".to_string(), other);
            map
        }
    };
    out.insert("id".to_string(), Value::from(row.id));
    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_limit_bounds() {
        assert_eq!(validate_limit(None).unwrap(), 10);
        assert_eq!(validate_limit(Some(1)).unwrap(), 1);
        assert_eq!(validate_limit(Some(100)).unwrap(), 100);
        assert!(validate_limit(Some(0)).is_err());
        assert!(validate_limit(Some(101)).is_err());
        assert!(validate_limit(Some(-5)).is_err());
    }

    #[test]
    fn test_filter_must_be_object() {
        let filter = json!({"City": "Charleston"});
        assert_eq!(validate_filter(Some(&filter)).unwrap(), Some(&filter));
        assert_eq!(validate_filter(None).unwrap(), None);
        assert_eq!(validate_filter(Some(&Value::Null)).unwrap(), None);
        assert!(validate_filter(Some(&json!(["City"]))).is_err());
        assert!(validate_filter(Some(&json!("City = Charleston"))).is_err());
    }

    #[test]
    fn test_similarity_score_rounding() {
        assert_eq!(similarity_score(0.0), 100.0);
        assert_eq!(similarity_score(0.123456), 87.65);
        assert_eq!(similarity_score(1.0), 0.0);
        assert_eq!(similarity_score(2.0), -100.0);
    }

    #[test]
    fn test_format_hit_reserved_keys_win() {
        let hit = Neighbor {
            id: 42,
            record_id: "7".into(),
            data: json!({"id": "source-id", "similarity_score": "x", "Name": "alpha"}),
            distance: 0.25,
        };
        let out = format_hit(hit);
        assert_eq!(out["id"], json!(42));
        assert_eq!(out["similarity_score"], json!(75.0));
        assert_eq!(out["Name"], json!("alpha"));
    }
}
