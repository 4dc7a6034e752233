//! Schema introspection.
//!
//! Column metadata drives the semantic text templates. It is fetched once
//! per table per sync pass through a [`SchemaCache`]; a failed fetch yields
//! an empty field list, and every field then falls back to
//! [`FieldType::DEFAULT`](crate::models::FieldType::DEFAULT).

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::warn;

use crate::models::{Field, Source, Table};
use crate::source::SourceSystem;

/// Fetch ordered column metadata for a table. Never fails: errors are logged
/// and reported as an empty schema.
pub async fn fetch(system: &dyn SourceSystem, source: &Source, table: &Table) -> Vec<Field> {
    match system.list_columns(&table.id).await {
        Ok(fields) => fields,
        Err(e) => {
            warn!(
                source = %source.title,
                table = %table.name,
                error = %e,
                "schema unavailable, using default field typing"
            );
            Vec::new()
        }
    }
}

/// Per-pass schema cache keyed by table id. Create a fresh one per cycle.
#[derive(Default)]
pub struct SchemaCache {
    fields: Mutex<HashMap<String, Vec<Field>>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_fetch(
        &self,
        system: &dyn SourceSystem,
        source: &Source,
        table: &Table,
    ) -> Vec<Field> {
        if let Some(fields) = self.cached(&table.id) {
            return fields;
        }

        let fields = fetch(system, source, table).await;
        if let Ok(mut cache) = self.fields.lock() {
            cache.insert(table.id.clone(), fields.clone());
        }
        fields
    }

    fn cached(&self, table_id: &str) -> Option<Vec<Field>> {
        self.fields
            .lock()
            .ok()
            .and_then(|cache| cache.get(table_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FieldType;
    use crate::source::InMemorySource;

    fn source() -> Source {
        Source {
            id: "p1".into(),
            title: "Sales".into(),
            connection: None,
        }
    }

    #[tokio::test]
    async fn test_fetch_failure_degrades_to_empty() {
        let system = InMemorySource::new();
        let table = Table { id: "t1".into(), name: "Orders".into() };
        system
            .add_table("p1", table.clone(), vec![Field::new("Total", FieldType::Currency)])
            .unwrap();
        system.break_schema("t1").unwrap();

        assert!(fetch(&system, &source(), &table).await.is_empty());
    }

    #[tokio::test]
    async fn test_cache_serves_repeat_lookups() {
        let system = InMemorySource::new();
        let table = Table { id: "t1".into(), name: "Orders".into() };
        system
            .add_table("p1", table.clone(), vec![Field::new("Total", FieldType::Currency)])
            .unwrap();

        let cache = SchemaCache::new();
        let first = cache.get_or_fetch(&system, &source(), &table).await;
        system.break_schema("t1").unwrap();
        let second = cache.get_or_fetch(&system, &source(), &table).await;

        assert_eq!(first, second);
        assert_eq!(second[0].field_type, FieldType::Currency);
    }
}
