//! Webhook ingest.
//!
//! Applies record changes pushed by the source system between sync cycles.
//! Inserts and updates go through the same upsert path as a full sync and
//! then trigger one embedding batch; deletes remove the matching shadow row.
//!
//! The payload's `data` may be a single record, an array of records, or the
//! source system's envelope `{ "rows": [...] }`:
//!
//! ```json
//! { "type": "records.after.update", "data": { "table_name": "Orders", "rows": [{ "Id": 4, "Total": 12.5 }] } }
//! ```

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::embed_cmd::{generate_embeddings, EmbedSettings};
use crate::embedding::EmbeddingProvider;
use crate::error::{SyncError, SyncResult};
use crate::models::{Record, RecordOperation};
use crate::registry::ShadowRegistry;
use crate::store::{table_name, ShadowStore};
use crate::sync::{record_id, upsert_records, TableSink};

/// Header carrying the shared webhook secret, when one is configured.
pub const TOKEN_HEADER: &str = "x-shadow-sync-token";

#[derive(Debug, Clone, Serialize)]
pub struct WebhookReport {
    pub operation: RecordOperation,
    pub records: usize,
    pub rows_affected: u64,
    pub embeddings_written: usize,
}

pub struct WebhookIngest {
    store: Arc<dyn ShadowStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    registry: Arc<ShadowRegistry>,
    settings: EmbedSettings,
}

impl WebhookIngest {
    pub fn new(
        store: Arc<dyn ShadowStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        registry: Arc<ShadowRegistry>,
        settings: EmbedSettings,
    ) -> Self {
        Self {
            store,
            embedder,
            registry,
            settings,
        }
    }

    pub async fn handle(
        &self,
        source_id: &str,
        table: &str,
        operation: RecordOperation,
        payload: &Value,
    ) -> SyncResult<WebhookReport> {
        let snapshot = self.registry.snapshot();
        let target = snapshot
            .by_source_id(source_id)
            .ok_or_else(|| SyncError::NotFound(format!("unknown source '{}'", source_id)))?;

        let records = extract_records(payload)?;

        // Tables discovered this cycle carry their schema; anything else is
        // typed with the default field type.
        let known = target.table(table);
        let shadow_table = known
            .map(|t| t.shadow_table.clone())
            .unwrap_or_else(|| table_name(table));
        let fields = known.map(|t| t.fields.as_slice()).unwrap_or(&[]);
        let label = known.map(|t| t.table.name.as_str()).unwrap_or(table);
        if known.is_none() {
            warn!(source = %target.source.title, table, "webhook for undiscovered table, using default typing");
        }

        self.store.ensure_database(&target.database).await?;
        self.store.ensure_table(&target.database, &shadow_table).await?;

        let rows_affected = match operation {
            RecordOperation::Delete => {
                let mut removed = 0;
                for record in &records {
                    removed += self
                        .store
                        .delete_row(&target.database, &shadow_table, &record_id(record))
                        .await?;
                }
                removed
            }
            RecordOperation::Insert | RecordOperation::Update => {
                let sink = TableSink {
                    database: &target.database,
                    shadow_table: &shadow_table,
                    label,
                    fields,
                };
                upsert_records(self.store.as_ref(), sink, &records).await?
            }
        };

        let embeddings_written = if operation != RecordOperation::Delete && self.embedder.is_enabled()
        {
            match generate_embeddings(
                self.store.as_ref(),
                self.embedder.as_ref(),
                &target.database,
                &shadow_table,
                self.settings.batch_size,
                self.settings,
            )
            .await
            {
                Ok(report) => report.embedded,
                Err(e) => {
                    warn!(table = %shadow_table, error = %e, "post-webhook embedding failed");
                    0
                }
            }
        } else {
            0
        };

        info!(
            source = %target.source.title,
            table = %shadow_table,
            operation = operation.as_str(),
            records = records.len(),
            rows = rows_affected,
            "applied webhook"
        );

        Ok(WebhookReport {
            operation,
            records: records.len(),
            rows_affected,
            embeddings_written,
        })
    }
}

/// Pull records out of a webhook body.
pub fn extract_records(payload: &Value) -> SyncResult<Vec<Record>> {
    let data = payload.get("data").unwrap_or(payload);

    let items: Vec<&Value> = match data {
        Value::Array(items) => items.iter().collect(),
        Value::Object(map) => match map.get("rows") {
            Some(Value::Array(rows)) => rows.iter().collect(),
            _ => vec![data],
        },
        _ => Vec::new(),
    };

    let records: Vec<Record> = items
        .into_iter()
        .filter_map(|v| v.as_object().cloned())
        .filter(|r| !r.is_empty())
        .collect();

    if records.is_empty() {
        return Err(SyncError::Validation(
            "webhook payload carries no records".to_string(),
        ));
    }
    Ok(records)
}
