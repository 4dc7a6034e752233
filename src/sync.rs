//! Record synchronization.
//!
//! Pages a source table, derives semantic text for every record and upserts
//! the page into the shadow table keyed by source record id.
//!
//! # Record identity
//!
//! The row key is the first of:
//! 1. the `Id` field,
//! 2. the `id` field,
//! 3. `rec-<sha256>` of the record serialized with sorted keys.
//!
//! The third form is stable across field reordering but two identical
//! id-less records share one row.
//!
//! # Versioning
//!
//! `UpdatedAt` (or `updated_at`), when parseable, becomes the row's
//! `source_updated_at`. The store ignores updates older than what it holds.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::SyncResult;
use crate::models::{Field, PendingRow, Record, Source, Table};
use crate::semantic::{parse_timestamp, record_text};
use crate::source::SourceSystem;
use crate::store::ShadowStore;

const ID_FIELDS: [&str; 2] = ["Id", "id"];
const VERSION_FIELDS: [&str; 2] = ["UpdatedAt", "updated_at"];

/// Where a source table lands.
#[derive(Debug, Clone, Copy)]
pub struct TableSink<'a> {
    pub database: &'a str,
    pub shadow_table: &'a str,
    /// Source table display name, used as the semantic text subject.
    pub label: &'a str,
    pub fields: &'a [Field],
}

/// Resolve the source record id.
pub fn record_id(record: &Record) -> String {
    for key in ID_FIELDS {
        match record.get(key) {
            Some(Value::String(s)) if !s.trim().is_empty() => return s.clone(),
            Some(Value::Number(n)) => return n.to_string(),
            _ => {}
        }
    }

    let whole = Value::Object(record.clone());
    let bytes = serde_json::to_vec(&canonicalize(&whole)).unwrap_or_default();
    format!("rec-{}", hex::encode(Sha256::digest(&bytes)))
}

/// Objects re-keyed into `BTreeMap`s so serialization order is fixed.
fn canonicalize(value: &Value) -> CanonicalValue<'_> {
    match value {
        Value::Object(map) => {
            CanonicalValue::Object(map.iter().map(|(k, v)| (k.as_str(), canonicalize(v))).collect())
        }
        Value::Array(items) => CanonicalValue::Array(items.iter().map(canonicalize).collect()),
        other => CanonicalValue::Scalar(other),
    }
}

#[derive(serde::Serialize)]
#[serde(untagged)]
enum CanonicalValue<'a> {
    Object(BTreeMap<&'a str, CanonicalValue<'a>>),
    Array(Vec<CanonicalValue<'a>>),
    Scalar(&'a Value),
}

/// The record's source-side modification time, if it carries one.
pub fn record_version(record: &Record) -> Option<DateTime<Utc>> {
    VERSION_FIELDS
        .iter()
        .filter_map(|key| record.get(*key).and_then(|v| v.as_str()))
        .find_map(parse_timestamp)
}

pub fn prepare_row(label: &str, fields: &[Field], record: &Record) -> PendingRow {
    PendingRow {
        record_id: record_id(record),
        data: Value::Object(record.clone()),
        semantic_text: record_text(label, fields, record),
        source_updated_at: record_version(record),
    }
}

/// Upsert a batch of source records. Returns rows written.
pub async fn upsert_records(
    store: &dyn ShadowStore,
    sink: TableSink<'_>,
    records: &[Record],
) -> SyncResult<u64> {
    let rows: Vec<PendingRow> = records
        .iter()
        .map(|r| prepare_row(sink.label, sink.fields, r))
        .collect();
    store
        .upsert_rows(sink.database, sink.shadow_table, &rows)
        .await
}

/// Copy every record of `table` into its shadow table.
///
/// Stops on the first page shorter than `page_size`; a full page always
/// triggers one more fetch. Returns rows written.
pub async fn sync_table(
    system: &dyn SourceSystem,
    store: &dyn ShadowStore,
    source: &Source,
    table: &Table,
    sink: TableSink<'_>,
    page_size: usize,
) -> SyncResult<u64> {
    let page_size = page_size.max(1);
    let mut offset = 0;
    let mut written = 0;

    loop {
        let page = system
            .list_records(&source.id, &table.id, offset, page_size)
            .await?;
        let fetched = page.len();

        if fetched > 0 {
            written += upsert_records(store, sink, &page).await?;
        }
        debug!(
            source = %source.title,
            table = %table.name,
            offset,
            rows = fetched,
            "synced page"
        );

        if fetched < page_size {
            break;
        }
        offset += fetched;
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FieldType;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_record_id_precedence() {
        assert_eq!(record_id(&record(json!({"Id": 7, "id": "x"}))), "7");
        assert_eq!(record_id(&record(json!({"id": "abc"}))), "abc");
        assert_eq!(record_id(&record(json!({"Id": null, "id": 3}))), "3");
    }

    #[test]
    fn test_fallback_id_ignores_key_order() {
        let a = record(json!({"name": "Ada", "meta": {"x": 1, "y": 2}}));
        let mut b = Record::new();
        b.insert("meta".into(), json!({"y": 2, "x": 1}));
        b.insert("name".into(), json!("Ada"));

        let id = record_id(&a);
        assert!(id.starts_with("rec-"));
        assert_eq!(id.len(), 4 + 64);
        assert_eq!(id, record_id(&b));
    }

    #[test]
    fn test_record_version() {
        let r = record(json!({"UpdatedAt": "2024-05-01 10:00:00+00:00"}));
        assert!(record_version(&r).is_some());
        assert!(record_version(&record(json!({"UpdatedAt": "soon"}))).is_none());
    }

    #[test]
    fn test_prepare_row_derives_text() {
        let fields = vec![
            Field::new("Name", FieldType::ShortText),
            Field::new("Price", FieldType::Currency),
        ];
        let row = prepare_row(
            "Products",
            &fields,
            &record(json!({"Id": 1, "Name": "alpha widget", "Price": 3})),
        );
        assert_eq!(row.record_id, "1");
        assert_eq!(
            row.semantic_text.as_deref(),
            Some("products record. name: alpha widget. price amount is 3.00")
        );
    }
}
