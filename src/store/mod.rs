//! Shadow store abstraction.
//!
//! A shadow database exists per source and holds one shadow table per source
//! table. The [`ShadowStore`] trait covers everything the sync engine and the
//! query surface need from it:
//!
//! - [`postgres::PgShadowStore`] — PostgreSQL + pgvector, one pool per
//!   shadow database, created lazily and reused.
//! - [`memory::InMemoryShadowStore`] — process-local maps with the same
//!   upsert semantics; used by tests and dry runs.
//!
//! Every method takes the *sanitized* database and table names produced by
//! [`database_name`] and [`table_name`].
//!
//! Reads treat a shadow database or table that does not exist yet as empty.
//! Discovery publishes targets before their shadows are created, so the query
//! surface routinely asks about tables that are not there.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::SyncResult;
use crate::models::{EmbeddingTask, Neighbor, PendingRow, ShadowRow, TableStats};

pub use memory::InMemoryShadowStore;
pub use postgres::PgShadowStore;

/// PostgreSQL identifier length limit, in bytes.
pub const MAX_IDENTIFIER_BYTES: usize = 63;

#[async_trait]
pub trait ShadowStore: Send + Sync {
    /// Create the shadow database and its vector extension if absent. Never drops.
    async fn ensure_database(&self, database: &str) -> SyncResult<()>;

    /// Create the shadow table and its indexes if absent.
    async fn ensure_table(&self, database: &str, table: &str) -> SyncResult<()>;

    /// Upsert rows keyed by `record_id`. Returns the number of rows written;
    /// rows rejected as stale are not counted.
    async fn upsert_rows(&self, database: &str, table: &str, rows: &[PendingRow])
        -> SyncResult<u64>;

    /// Delete the row for `record_id`. A missing row or table affects zero rows.
    async fn delete_row(&self, database: &str, table: &str, record_id: &str) -> SyncResult<u64>;

    /// Rows with semantic text but no embedding, oldest first.
    async fn pending_embeddings(
        &self,
        database: &str,
        table: &str,
        limit: usize,
    ) -> SyncResult<Vec<EmbeddingTask>>;

    /// Persist an embedding for row `id`, only if its semantic text is still
    /// `text`. Returns whether the write landed.
    async fn store_embedding(
        &self,
        database: &str,
        table: &str,
        id: i64,
        text: &str,
        embedding: &[f32],
    ) -> SyncResult<bool>;

    /// Embedded rows by ascending cosine distance to `query`. With a
    /// `filter`, only rows whose snapshot contains it (`data @> filter`).
    async fn nearest(
        &self,
        database: &str,
        table: &str,
        query: &[f32],
        filter: Option<&Value>,
        limit: usize,
    ) -> SyncResult<Vec<Neighbor>>;

    /// Rows whose snapshot contains `filter`, by surrogate id.
    async fn filter_rows(
        &self,
        database: &str,
        table: &str,
        filter: &Value,
        limit: usize,
        offset: usize,
    ) -> SyncResult<Vec<ShadowRow>>;

    async fn list_tables(&self, database: &str) -> SyncResult<Vec<String>>;

    async fn has_embedding_column(&self, database: &str, table: &str) -> SyncResult<bool>;

    async fn count_rows(&self, database: &str, table: &str) -> SyncResult<i64>;

    /// Row, embedding and freshness counts; `recent` counts rows updated at
    /// or after `since`.
    async fn table_stats(
        &self,
        database: &str,
        table: &str,
        since: DateTime<Utc>,
    ) -> SyncResult<TableStats>;

    async fn get_row(
        &self,
        database: &str,
        table: &str,
        record_id: &str,
    ) -> SyncResult<Option<ShadowRow>>;
}

/// Lowercase, map every non-alphanumeric run to a single `_`, trim `_` from
/// both ends. Empty results become `"unnamed"`.
pub fn sanitize_identifier(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_sep = false;

    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_sep = true;
        }
    }

    if out.is_empty() {
        "unnamed".to_string()
    } else {
        out
    }
}

/// Shadow database name for a source: `prefix` + sanitized title, truncated
/// to [`MAX_IDENTIFIER_BYTES`].
///
/// Two titles that sanitize to the same string share a database.
pub fn database_name(prefix: &str, source_title: &str) -> String {
    let prefix: String = prefix
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .map(|c| c.to_ascii_lowercase())
        .collect();
    truncate(format!("{}{}", prefix, sanitize_identifier(source_title)))
}

/// Shadow table name for a source table.
pub fn table_name(name: &str) -> String {
    truncate(sanitize_identifier(name))
}

fn truncate(mut name: String) -> String {
    // Sanitized identifiers are ASCII, so any byte offset is a char boundary.
    name.truncate(MAX_IDENTIFIER_BYTES);
    name
}

/// JSONB containment (`haystack @> needle`) evaluated in memory.
///
/// Objects contain every key of the needle with a contained value; arrays
/// contain every needle element somewhere; scalars compare equal.
pub fn json_contains(haystack: &Value, needle: &Value) -> bool {
    match (haystack, needle) {
        (Value::Object(have), Value::Object(want)) => want
            .iter()
            .all(|(k, v)| have.get(k).is_some_and(|h| json_contains(h, v))),
        (Value::Array(have), Value::Array(want)) => want
            .iter()
            .all(|w| have.iter().any(|h| json_contains(h, w))),
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (a, b) => a == b,
    }
}

/// Double-quote an identifier for interpolation into SQL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sanitize_identifier() {
        assert_eq!(sanitize_identifier("Sales CRM"), "sales_crm");
        assert_eq!(sanitize_identifier("  --Q3 / Leads!! "), "q3_leads");
        assert_eq!(sanitize_identifier("Ünïcode"), "n_code");
        assert_eq!(sanitize_identifier("***"), "unnamed");
    }

    #[test]
    fn test_database_name_prefix_and_truncation() {
        assert_eq!(database_name("shadow_", "Sales CRM"), "shadow_sales_crm");
        assert_eq!(database_name("", "Sales CRM"), "sales_crm");
        let long = "x".repeat(100);
        let name = database_name("shadow_", &long);
        assert_eq!(name.len(), MAX_IDENTIFIER_BYTES);
        assert!(name.starts_with("shadow_xxx"));
    }

    #[test]
    fn test_colliding_titles_share_a_name() {
        assert_eq!(
            database_name("shadow_", "Sales-CRM"),
            database_name("shadow_", "sales crm")
        );
    }

    #[test]
    fn test_json_contains() {
        let row = json!({"City": "Charleston", "Tags": ["a", "b"], "Meta": {"n": 3, "x": null}});
        assert!(json_contains(&row, &json!({})));
        assert!(json_contains(&row, &json!({"City": "Charleston"})));
        assert!(json_contains(&row, &json!({"Tags": ["b"], "Meta": {"n": 3.0}})));
        assert!(!json_contains(&row, &json!({"City": "charleston"})));
        assert!(!json_contains(&row, &json!({"Tags": ["c"]})));
        assert!(!json_contains(&row, &json!({"Missing": null})));
        assert!(json_contains(&row, &json!({"Meta": {"x": null}})));
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }
}
