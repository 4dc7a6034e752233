//! The source-system seam.
//!
//! [`SourceSystem`] is everything the sync engine consumes from the system
//! that owns the data: discovery (sources, tables, columns), paged record
//! reads, and the two write-backs (read-only mirror registration and webhook
//! registration). [`crate::connector_nocodb::NocoDbClient`] speaks the NocoDB
//! v2 REST API; [`InMemorySource`] is a scriptable stand-in for tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::error::{SyncError, SyncResult};
use crate::models::{ConnectionTarget, Field, HookSpec, MirrorConfig, Record, Source, Table};

#[async_trait]
pub trait SourceSystem: Send + Sync {
    async fn list_sources(&self) -> SyncResult<Vec<Source>>;

    async fn list_tables(&self, source_id: &str) -> SyncResult<Vec<Table>>;

    /// Ordered column metadata for a table.
    async fn list_columns(&self, table_id: &str) -> SyncResult<Vec<Field>>;

    /// One page of records. A page shorter than `limit` is the last one.
    async fn list_records(
        &self,
        source_id: &str,
        table_id: &str,
        offset: usize,
        limit: usize,
    ) -> SyncResult<Vec<Record>>;

    /// Register a shadow database as a new read-only source.
    async fn register_mirror(&self, mirror: &MirrorConfig) -> SyncResult<()>;

    async fn list_hooks(&self, table_id: &str) -> SyncResult<Vec<HookSpec>>;

    async fn register_hook(&self, table_id: &str, hook: &HookSpec) -> SyncResult<()>;
}

#[derive(Default)]
struct State {
    sources: Vec<Source>,
    tables: HashMap<String, Vec<Table>>,
    columns: HashMap<String, Vec<Field>>,
    records: HashMap<String, Vec<Record>>,
    hooks: HashMap<String, Vec<HookSpec>>,
    mirrors: Vec<MirrorConfig>,
    broken_schemas: HashSet<String>,
    offline: bool,
}

/// In-memory [`SourceSystem`] for tests and local experiments.
///
/// Registered mirrors show up as new sources on the next `list_sources`,
/// the way a real source system would list them.
#[derive(Default)]
pub struct InMemorySource {
    state: RwLock<State>,
    record_fetches: AtomicUsize,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> SyncResult<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| SyncError::SourceUnavailable("in-memory source lock poisoned".to_string()))
    }

    fn write(&self) -> SyncResult<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|_| SyncError::SourceUnavailable("in-memory source lock poisoned".to_string()))
    }

    pub fn add_source(&self, source: Source) -> SyncResult<()> {
        self.write()?.sources.push(source);
        Ok(())
    }

    pub fn add_table(&self, source_id: &str, table: Table, fields: Vec<Field>) -> SyncResult<()> {
        let mut state = self.write()?;
        state.columns.insert(table.id.clone(), fields);
        state.records.entry(table.id.clone()).or_default();
        state
            .tables
            .entry(source_id.to_string())
            .or_default()
            .push(table);
        Ok(())
    }

    pub fn set_records(&self, table_id: &str, records: Vec<Record>) -> SyncResult<()> {
        self.write()?.records.insert(table_id.to_string(), records);
        Ok(())
    }

    /// Make `list_columns` fail for a table.
    pub fn break_schema(&self, table_id: &str) -> SyncResult<()> {
        self.write()?.broken_schemas.insert(table_id.to_string());
        Ok(())
    }

    /// Make every call fail with [`SyncError::SourceUnavailable`].
    pub fn set_offline(&self, offline: bool) -> SyncResult<()> {
        self.write()?.offline = offline;
        Ok(())
    }

    pub fn hooks(&self, table_id: &str) -> Vec<HookSpec> {
        self.read()
            .map(|s| s.hooks.get(table_id).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn mirrors(&self) -> Vec<MirrorConfig> {
        self.read().map(|s| s.mirrors.clone()).unwrap_or_default()
    }

    /// Number of `list_records` calls served so far.
    pub fn record_fetches(&self) -> usize {
        self.record_fetches.load(Ordering::SeqCst)
    }

    fn check_online(&self) -> SyncResult<()> {
        if self.read()?.offline {
            return Err(SyncError::SourceUnavailable(
                "source system is offline".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl SourceSystem for InMemorySource {
    async fn list_sources(&self) -> SyncResult<Vec<Source>> {
        self.check_online()?;
        Ok(self.read()?.sources.clone())
    }

    async fn list_tables(&self, source_id: &str) -> SyncResult<Vec<Table>> {
        self.check_online()?;
        Ok(self
            .read()?
            .tables
            .get(source_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_columns(&self, table_id: &str) -> SyncResult<Vec<Field>> {
        self.check_online()?;
        let state = self.read()?;
        if state.broken_schemas.contains(table_id) {
            return Err(SyncError::SchemaUnavailable {
                table: table_id.to_string(),
                message: "column metadata unavailable".to_string(),
            });
        }
        Ok(state.columns.get(table_id).cloned().unwrap_or_default())
    }

    async fn list_records(
        &self,
        _source_id: &str,
        table_id: &str,
        offset: usize,
        limit: usize,
    ) -> SyncResult<Vec<Record>> {
        self.check_online()?;
        self.record_fetches.fetch_add(1, Ordering::SeqCst);
        let state = self.read()?;
        let records = state
            .records
            .get(table_id)
            .ok_or_else(|| SyncError::NotFound(format!("table {}", table_id)))?;
        Ok(records.iter().skip(offset).take(limit).cloned().collect())
    }

    async fn register_mirror(&self, mirror: &MirrorConfig) -> SyncResult<()> {
        self.check_online()?;
        let mut state = self.write()?;
        let id = format!("mirror_{}", state.mirrors.len() + 1);
        state.sources.push(Source {
            id,
            title: mirror.title.clone(),
            connection: Some(ConnectionTarget {
                host: mirror.host.clone(),
                port: Some(mirror.port),
                database: Some(mirror.database.clone()),
            }),
        });
        state.mirrors.push(mirror.clone());
        Ok(())
    }

    async fn list_hooks(&self, table_id: &str) -> SyncResult<Vec<HookSpec>> {
        self.check_online()?;
        Ok(self.hooks(table_id))
    }

    async fn register_hook(&self, table_id: &str, hook: &HookSpec) -> SyncResult<()> {
        self.check_online()?;
        self.write()?
            .hooks
            .entry(table_id.to_string())
            .or_default()
            .push(hook.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FieldType;
    use serde_json::json;

    fn record(id: i64) -> Record {
        json!({ "Id": id }).as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_pages_records() {
        let source = InMemorySource::new();
        source
            .add_table(
                "p1",
                Table { id: "t1".into(), name: "Items".into() },
                vec![Field::new("Name", FieldType::ShortText)],
            )
            .unwrap();
        source
            .set_records("t1", (1..=5).map(record).collect())
            .unwrap();

        let page = source.list_records("p1", "t1", 3, 3).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(source.record_fetches(), 1);
    }

    #[tokio::test]
    async fn test_mirror_becomes_source() {
        let source = InMemorySource::new();
        source
            .register_mirror(&MirrorConfig {
                title: "Shadow: Sales".into(),
                host: "shadow-db".into(),
                port: 5432,
                user: "postgres".into(),
                password: "secret".into(),
                database: "shadow_sales".into(),
            })
            .await
            .unwrap();
        let sources = source.list_sources().await.unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].title, "Shadow: Sales");
    }

    #[tokio::test]
    async fn test_offline_source_errors() {
        let source = InMemorySource::new();
        source.set_offline(true).unwrap();
        let err = source.list_sources().await.unwrap_err();
        assert_eq!(err.code(), "source_unavailable");
    }
}
