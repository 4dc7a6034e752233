//! Discovery snapshot and reconciliation caches.
//!
//! Each sync cycle discovers eligible sources, their tables and column
//! metadata, and publishes the result as an immutable [`DiscoverySnapshot`].
//! Webhook ingest and the query engine read the latest snapshot; a new cycle
//! swaps in a new `Arc` without disturbing readers of the old one.
//!
//! The registry also remembers which webhooks and mirrors were registered.
//! Those sets live in memory only. They are re-seeded from the source
//! system's live state every cycle, so a restart only costs one lookup per
//! table rather than duplicate registrations.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{Field, RecordOperation, Source, Table};

/// A source table and where it is shadowed.
#[derive(Debug, Clone, Serialize)]
pub struct TableTarget {
    pub table: Table,
    pub shadow_table: String,
    /// Column metadata captured during discovery; empty when unavailable.
    pub fields: Vec<Field>,
}

/// A source and its shadow database.
#[derive(Debug, Clone, Serialize)]
pub struct ShadowTarget {
    pub source: Source,
    pub database: String,
    pub tables: Vec<TableTarget>,
}

impl ShadowTarget {
    /// Find a table by source name, source id, or shadow table name.
    pub fn table(&self, name: &str) -> Option<&TableTarget> {
        self.tables
            .iter()
            .find(|t| t.table.name == name || t.table.id == name || t.shadow_table == name)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DiscoverySnapshot {
    pub targets: Vec<ShadowTarget>,
    pub built_at: Option<DateTime<Utc>>,
}

impl DiscoverySnapshot {
    pub fn new(targets: Vec<ShadowTarget>) -> Self {
        Self {
            targets,
            built_at: Some(Utc::now()),
        }
    }

    /// Resolve a source by id, then title, then shadow database name.
    pub fn resolve(&self, key: &str) -> Option<&ShadowTarget> {
        self.targets
            .iter()
            .find(|t| t.source.id == key)
            .or_else(|| self.targets.iter().find(|t| t.source.title == key))
            .or_else(|| self.targets.iter().find(|t| t.database == key))
    }

    pub fn by_source_id(&self, source_id: &str) -> Option<&ShadowTarget> {
        self.targets.iter().find(|t| t.source.id == source_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct HookKey {
    source_id: String,
    table_id: String,
    operation: RecordOperation,
}

#[derive(Default)]
pub struct ShadowRegistry {
    snapshot: RwLock<Arc<DiscoverySnapshot>>,
    hooks: Mutex<HashSet<HookKey>>,
    mirrors: Mutex<HashSet<String>>,
}

impl ShadowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The latest published snapshot.
    pub fn snapshot(&self) -> Arc<DiscoverySnapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn publish(&self, snapshot: DiscoverySnapshot) {
        let mut current = self
            .snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *current = Arc::new(snapshot);
    }

    pub fn hook_known(&self, source_id: &str, table_id: &str, operation: RecordOperation) -> bool {
        self.hooks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(&HookKey {
                source_id: source_id.to_string(),
                table_id: table_id.to_string(),
                operation,
            })
    }

    pub fn remember_hook(&self, source_id: &str, table_id: &str, operation: RecordOperation) {
        self.hooks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(HookKey {
                source_id: source_id.to_string(),
                table_id: table_id.to_string(),
                operation,
            });
    }

    pub fn mirror_known(&self, database: &str) -> bool {
        self.mirrors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(database)
    }

    pub fn remember_mirror(&self, database: &str) {
        self.mirrors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(database.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> ShadowTarget {
        ShadowTarget {
            source: Source {
                id: "p_sales".into(),
                title: "Sales".into(),
                connection: None,
            },
            database: "shadow_sales".into(),
            tables: vec![TableTarget {
                table: Table {
                    id: "m_orders".into(),
                    name: "Order Lines".into(),
                },
                shadow_table: "order_lines".into(),
                fields: Vec::new(),
            }],
        }
    }

    #[test]
    fn test_resolve_by_any_name() {
        let snapshot = DiscoverySnapshot::new(vec![target()]);
        assert!(snapshot.resolve("p_sales").is_some());
        assert!(snapshot.resolve("Sales").is_some());
        assert!(snapshot.resolve("shadow_sales").is_some());
        assert!(snapshot.resolve("Marketing").is_none());
    }

    #[test]
    fn test_resolve_prefers_id_over_title() {
        let mut impostor = target();
        impostor.source.id = "p_other".into();
        impostor.source.title = "p_sales".into();
        impostor.database = "shadow_p_sales".into();
        let snapshot = DiscoverySnapshot::new(vec![impostor, target()]);

        assert_eq!(snapshot.resolve("p_sales").unwrap().source.id, "p_sales");
        assert_eq!(snapshot.resolve("shadow_p_sales").unwrap().source.id, "p_other");
    }

    #[test]
    fn test_table_lookup() {
        let t = target();
        assert!(t.table("Order Lines").is_some());
        assert!(t.table("order_lines").is_some());
        assert!(t.table("m_orders").is_some());
        assert!(t.table("orders").is_none());
    }

    #[test]
    fn test_publish_swaps_snapshot() {
        let registry = ShadowRegistry::new();
        let before = registry.snapshot();
        registry.publish(DiscoverySnapshot::new(vec![target()]));
        assert!(before.targets.is_empty());
        assert_eq!(registry.snapshot().targets.len(), 1);
    }

    #[test]
    fn test_hook_dedup() {
        let registry = ShadowRegistry::new();
        assert!(!registry.hook_known("p", "t", RecordOperation::Insert));
        registry.remember_hook("p", "t", RecordOperation::Insert);
        assert!(registry.hook_known("p", "t", RecordOperation::Insert));
        assert!(!registry.hook_known("p", "t", RecordOperation::Delete));
    }
}
