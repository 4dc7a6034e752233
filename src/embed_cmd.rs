//! Embedding generation for shadow rows.
//!
//! Rows whose semantic text has no vector yet are embedded in provider
//! batches. Batches run through a bounded-concurrency pipeline; a batch the
//! provider rejects is retried one row at a time, so one bad row only fails
//! itself. Failed rows keep a null embedding and are picked up again by the
//! next pass.

use futures_util::stream::{self, StreamExt};
use tracing::{info, warn};

use crate::embedding::EmbeddingProvider;
use crate::error::{SyncError, SyncResult};
use crate::models::EmbeddingTask;
use crate::store::ShadowStore;

#[derive(Debug, Clone, Copy)]
pub struct EmbedSettings {
    pub batch_size: usize,
    pub concurrency: usize,
}

impl EmbedSettings {
    pub fn from_config(config: &crate::config::EmbeddingConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            concurrency: config.concurrency,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EmbedReport {
    pub pending: usize,
    pub embedded: usize,
    pub failed: usize,
}

impl EmbedReport {
    fn absorb(&mut self, other: EmbedReport) {
        self.pending += other.pending;
        self.embedded += other.embedded;
        self.failed += other.failed;
    }
}

/// Embed up to `limit` pending rows of one shadow table.
pub async fn generate_embeddings(
    store: &dyn ShadowStore,
    provider: &dyn EmbeddingProvider,
    database: &str,
    table: &str,
    limit: usize,
    settings: EmbedSettings,
) -> SyncResult<EmbedReport> {
    if !provider.is_enabled() {
        return Err(SyncError::EmbeddingUnavailable(
            "embedding provider is disabled".to_string(),
        ));
    }

    let pending = store.pending_embeddings(database, table, limit).await?;
    if pending.is_empty() {
        return Ok(EmbedReport::default());
    }

    let batches: Vec<_> = pending
        .chunks(settings.batch_size.max(1))
        .map(|batch| embed_batch(store, provider, database, table, batch))
        .collect();
    let outcomes: Vec<(usize, usize)> = stream::iter(batches)
        .buffer_unordered(settings.concurrency.max(1))
        .collect()
        .await;

    let report = EmbedReport {
        pending: pending.len(),
        embedded: outcomes.iter().map(|(ok, _)| ok).sum(),
        failed: outcomes.iter().map(|(_, failed)| failed).sum(),
    };
    if report.failed > 0 {
        warn!(
            database,
            table,
            embedded = report.embedded,
            failed = report.failed,
            "some rows could not be embedded"
        );
    }
    Ok(report)
}

/// Returns `(embedded, failed)`.
async fn embed_batch(
    store: &dyn ShadowStore,
    provider: &dyn EmbeddingProvider,
    database: &str,
    table: &str,
    batch: &[EmbeddingTask],
) -> (usize, usize) {
    let texts: Vec<String> = batch.iter().map(|t| t.text.clone()).collect();

    match provider.embed(&texts).await {
        Ok(vectors) if vectors.len() == batch.len() => {
            let mut embedded = 0;
            let mut failed = 0;
            for (task, vector) in batch.iter().zip(vectors) {
                if persist(store, provider, database, table, task, &vector).await {
                    embedded += 1;
                } else {
                    failed += 1;
                }
            }
            (embedded, failed)
        }
        Ok(vectors) => {
            warn!(
                table,
                expected = batch.len(),
                got = vectors.len(),
                "embedding batch size mismatch, retrying per row"
            );
            embed_rows(store, provider, database, table, batch).await
        }
        Err(e) => {
            warn!(table, error = %e, "embedding batch failed, retrying per row");
            embed_rows(store, provider, database, table, batch).await
        }
    }
}

async fn embed_rows(
    store: &dyn ShadowStore,
    provider: &dyn EmbeddingProvider,
    database: &str,
    table: &str,
    batch: &[EmbeddingTask],
) -> (usize, usize) {
    let mut embedded = 0;
    let mut failed = 0;

    for task in batch {
        let vector = match provider.embed(std::slice::from_ref(&task.text)).await {
            Ok(mut vectors) if vectors.len() == 1 => vectors.remove(0),
            Ok(_) => {
                warn!(table, row = task.id, "provider returned no vector");
                failed += 1;
                continue;
            }
            Err(e) => {
                warn!(table, row = task.id, error = %e, "embedding failed");
                failed += 1;
                continue;
            }
        };

        if persist(store, provider, database, table, task, &vector).await {
            embedded += 1;
        } else {
            failed += 1;
        }
    }

    (embedded, failed)
}

async fn persist(
    store: &dyn ShadowStore,
    provider: &dyn EmbeddingProvider,
    database: &str,
    table: &str,
    task: &EmbeddingTask,
    vector: &[f32],
) -> bool {
    if vector.len() != provider.dims() {
        warn!(
            table,
            row = task.id,
            expected = provider.dims(),
            got = vector.len(),
            "embedding has wrong dimensionality"
        );
        return false;
    }

    match store
        .store_embedding(database, table, task.id, &task.text, vector)
        .await
    {
        // A `false` write means the text changed meanwhile; the row stays
        // pending under its new text.
        Ok(_) => true,
        Err(e) => {
            warn!(table, row = task.id, error = %e, "failed to store embedding");
            false
        }
    }
}

/// Embed pending rows across every table of the given shadow databases.
pub async fn run_embed_pending(
    store: &dyn ShadowStore,
    provider: &dyn EmbeddingProvider,
    databases: &[String],
    limit: usize,
    settings: EmbedSettings,
) -> SyncResult<EmbedReport> {
    if !provider.is_enabled() {
        return Err(SyncError::EmbeddingUnavailable(
            "Embedding provider is disabled. Set [embedding] provider in config.".to_string(),
        ));
    }

    let mut total = EmbedReport::default();

    for database in databases {
        let tables = match store.list_tables(database).await {
            Ok(tables) => tables,
            Err(e) => {
                warn!(database = %database, error = %e, "skipping shadow database");
                continue;
            }
        };

        for table in tables {
            match generate_embeddings(store, provider, database, &table, limit, settings).await {
                Ok(report) => {
                    info!(
                        database = %database,
                        table = %table,
                        embedded = report.embedded,
                        failed = report.failed,
                        "embedded pending rows"
                    );
                    total.absorb(report);
                }
                Err(e) => warn!(database = %database, table = %table, error = %e, "embedding pass failed"),
            }
        }
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashProvider;
    use crate::models::PendingRow;
    use crate::store::InMemoryShadowStore;
    use async_trait::async_trait;
    use serde_json::json;

    /// Hash embeddings, except any text containing "poison".
    struct PickyProvider(HashProvider);

    #[async_trait]
    impl EmbeddingProvider for PickyProvider {
        fn model_name(&self) -> &str {
            "picky"
        }
        fn dims(&self) -> usize {
            self.0.dims()
        }
        async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            if texts.iter().any(|t| t.contains("poison")) {
                anyhow::bail!("rejected input");
            }
            self.0.embed(texts).await
        }
    }

    async fn seeded_store(texts: &[&str]) -> InMemoryShadowStore {
        let store = InMemoryShadowStore::new();
        store.ensure_database("db").await.unwrap();
        store.ensure_table("db", "items").await.unwrap();
        let rows: Vec<PendingRow> = texts
            .iter()
            .enumerate()
            .map(|(i, t)| PendingRow {
                record_id: i.to_string(),
                data: json!({}),
                semantic_text: Some(t.to_string()),
                source_updated_at: None,
            })
            .collect();
        store.upsert_rows("db", "items", &rows).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_one_bad_row_does_not_sink_its_batch() {
        let store = seeded_store(&["good one", "poison pill", "good two"]).await;
        let provider = PickyProvider(HashProvider::new(16));
        let settings = EmbedSettings { batch_size: 8, concurrency: 2 };

        let report = generate_embeddings(&store, &provider, "db", "items", 100, settings)
            .await
            .unwrap();

        assert_eq!(report.embedded, 2);
        assert_eq!(report.failed, 1);
        let left = store.pending_embeddings("db", "items", 100).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].text, "poison pill");
    }

    #[tokio::test]
    async fn test_limit_caps_work() {
        let store = seeded_store(&["a", "b", "c", "d"]).await;
        let provider = HashProvider::new(8);
        let settings = EmbedSettings { batch_size: 1, concurrency: 4 };

        let report = generate_embeddings(&store, &provider, "db", "items", 3, settings)
            .await
            .unwrap();
        assert_eq!(report.embedded, 3);
        assert_eq!(store.pending_embeddings("db", "items", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_provider_is_unavailable() {
        let store = seeded_store(&["a"]).await;
        let settings = EmbedSettings { batch_size: 1, concurrency: 1 };
        let err = generate_embeddings(
            &store,
            &crate::embedding::DisabledProvider,
            "db",
            "items",
            10,
            settings,
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "embedding_unavailable");
    }

    #[tokio::test]
    async fn test_generation_runs_on_a_spawned_task() {
        let store = std::sync::Arc::new(seeded_store(&["a", "b", "c"]).await);
        let provider = std::sync::Arc::new(HashProvider::new(8));
        let settings = EmbedSettings { batch_size: 2, concurrency: 2 };

        let task = tokio::spawn(async move {
            generate_embeddings(store.as_ref(), provider.as_ref(), "db", "items", 10, settings).await
        });

        let report = task.await.unwrap().unwrap();
        assert_eq!(report.embedded, 3);
        assert_eq!(report.failed, 0);
    }
}
