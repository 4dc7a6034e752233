//! Sync cycle orchestration.
//!
//! A cycle runs in two phases:
//!
//! 1. **Discovery**: list eligible sources, their tables and column metadata,
//!    and publish the result as the registry's new [`DiscoverySnapshot`].
//! 2. **Sync**: per source, ensure the shadow database; per table, ensure the
//!    shadow table, copy every page and embed pending rows. Then reconcile
//!    webhooks and the read-only mirror.
//!
//! Sources and tables are processed sequentially. A failing table or source
//! is logged and counted; its siblings still run. Cancellation is checked
//! between tables, so an in-flight write always finishes.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::Config;
use crate::embed_cmd::{generate_embeddings, EmbedSettings};
use crate::embedding::EmbeddingProvider;
use crate::error::{SyncError, SyncResult};
use crate::introspect::SchemaCache;
use crate::models::{HookSpec, MirrorConfig, RecordOperation, Source};
use crate::registry::{DiscoverySnapshot, ShadowRegistry, ShadowTarget, TableTarget};
use crate::source::SourceSystem;
use crate::sources::{eligible_sources, EligibilityPolicy};
use crate::store::{database_name, table_name, ShadowStore};
use crate::sync::{sync_table, TableSink};
use crate::webhook::TOKEN_HEADER;

/// Where the source system should deliver record changes.
#[derive(Debug, Clone)]
pub struct HookSettings {
    pub public_base_url: String,
    pub secret: Option<String>,
}

/// Connection the source system uses to read a shadow database.
#[derive(Debug, Clone)]
pub struct MirrorTarget {
    pub title_prefix: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub page_size: usize,
    pub embed_limit: usize,
    pub database_prefix: String,
    pub policy: EligibilityPolicy,
    pub embed: EmbedSettings,
    pub hooks: Option<HookSettings>,
    pub mirror: Option<MirrorTarget>,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> SyncResult<Self> {
        let hooks = config
            .webhook
            .public_base_url
            .as_ref()
            .filter(|url| !url.trim().is_empty())
            .map(|url| HookSettings {
                public_base_url: url.clone(),
                secret: config.webhook.secret(),
            });

        let mirror = if config.mirror.enabled {
            let settings = &config.mirror;
            let password = std::env::var(&settings.password_env).map_err(|_| {
                SyncError::Configuration(format!(
                    "mirror.enabled is set but {} is not",
                    settings.password_env
                ))
            })?;
            Some(MirrorTarget {
                title_prefix: settings.title_prefix.clone(),
                host: settings.host.clone().unwrap_or_default(),
                port: settings.port,
                user: settings.user.clone().unwrap_or_default(),
                password,
            })
        } else {
            None
        };

        Ok(Self {
            page_size: config.sync.page_size,
            embed_limit: config.sync.embed_limit,
            database_prefix: config.shadow.database_prefix.clone(),
            policy: EligibilityPolicy::from_config(config),
            embed: EmbedSettings::from_config(&config.embedding),
            hooks,
            mirror,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    /// Set when another cycle held the guard and this one did nothing.
    pub skipped: bool,
    pub cancelled: bool,
    pub sources: usize,
    pub tables: usize,
    pub rows_written: u64,
    pub embedded: usize,
    pub embed_failed: usize,
    pub hooks_registered: usize,
    pub mirrors_registered: usize,
    pub failures: usize,
}

impl CycleReport {
    pub fn print(&self) {
        if self.skipped {
            println!("sync skipped: a cycle is already running");
            return;
        }
        println!("sync");
        println!("  sources: {}", self.sources);
        println!("  tables: {}", self.tables);
        println!("  rows written: {}", self.rows_written);
        println!("  embeddings written: {}", self.embedded);
        if self.embed_failed > 0 {
            println!("  embeddings failed: {}", self.embed_failed);
        }
        println!("  hooks registered: {}", self.hooks_registered);
        println!("  mirrors registered: {}", self.mirrors_registered);
        if self.failures > 0 {
            println!("  failures: {}", self.failures);
        }
        if self.cancelled {
            println!("cancelled");
        } else {
            println!("ok");
        }
    }
}

pub struct SyncOrchestrator {
    source: Arc<dyn SourceSystem>,
    store: Arc<dyn ShadowStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    registry: Arc<ShadowRegistry>,
    settings: OrchestratorSettings,
    cycle_lock: Mutex<()>,
}

impl SyncOrchestrator {
    pub fn new(
        source: Arc<dyn SourceSystem>,
        store: Arc<dyn ShadowStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        registry: Arc<ShadowRegistry>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            source,
            store,
            embedder,
            registry,
            settings,
            cycle_lock: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Arc<ShadowRegistry> {
        &self.registry
    }

    /// Run one full cycle. Returns immediately with `skipped` set when a
    /// cycle is already in flight.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> SyncResult<CycleReport> {
        let Ok(_guard) = self.cycle_lock.try_lock() else {
            info!("sync cycle already running, skipping trigger");
            return Ok(CycleReport {
                skipped: true,
                ..CycleReport::default()
            });
        };

        let cycle_id = Uuid::new_v4();
        let span = info_span!("sync_cycle", cycle_id = %cycle_id);
        self.cycle(cancel).instrument(span).await
    }

    async fn cycle(&self, cancel: &CancellationToken) -> SyncResult<CycleReport> {
        let mut report = CycleReport::default();

        let (eligible, all) = eligible_sources(self.source.as_ref(), &self.settings.policy).await?;
        info!(
            sources = all.len(),
            eligible = eligible.len(),
            "discovered sources"
        );

        let targets = self.discover(&eligible, &mut report).await;
        self.registry.publish(DiscoverySnapshot::new(targets));
        let snapshot = self.registry.snapshot();

        for target in &snapshot.targets {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            if let Err(e) = self.sync_source(target, &all, cancel, &mut report).await {
                warn!(source = %target.source.title, error = %e, "source sync failed");
                report.failures += 1;
            }
        }

        info!(
            sources = report.sources,
            tables = report.tables,
            rows = report.rows_written,
            embedded = report.embedded,
            failures = report.failures,
            "sync cycle finished"
        );
        Ok(report)
    }

    /// Run only the discovery phase and publish its snapshot. Used by the
    /// one-shot query commands, which have no running cycle to rely on.
    pub async fn refresh_snapshot(&self) -> SyncResult<Arc<DiscoverySnapshot>> {
        let (eligible, _) = eligible_sources(self.source.as_ref(), &self.settings.policy).await?;
        let mut report = CycleReport::default();
        let targets = self.discover(&eligible, &mut report).await;
        self.registry.publish(DiscoverySnapshot::new(targets));
        Ok(self.registry.snapshot())
    }

    async fn discover(&self, eligible: &[Source], report: &mut CycleReport) -> Vec<ShadowTarget> {
        let schemas = SchemaCache::new();
        let mut targets = Vec::with_capacity(eligible.len());

        for source in eligible {
            let tables = match self.source.list_tables(&source.id).await {
                Ok(tables) => tables,
                Err(e) => {
                    warn!(source = %source.title, error = %e, "could not list tables, skipping source");
                    report.failures += 1;
                    continue;
                }
            };

            let mut table_targets = Vec::with_capacity(tables.len());
            for table in tables {
                let fields = schemas
                    .get_or_fetch(self.source.as_ref(), source, &table)
                    .await;
                table_targets.push(TableTarget {
                    shadow_table: table_name(&table.name),
                    table,
                    fields,
                });
            }

            targets.push(ShadowTarget {
                database: database_name(&self.settings.database_prefix, &source.title),
                source: source.clone(),
                tables: table_targets,
            });
        }

        targets
    }

    async fn sync_source(
        &self,
        target: &ShadowTarget,
        all_sources: &[Source],
        cancel: &CancellationToken,
        report: &mut CycleReport,
    ) -> SyncResult<()> {
        self.store.ensure_database(&target.database).await?;
        report.sources += 1;

        for table in &target.tables {
            if cancel.is_cancelled() {
                report.cancelled = true;
                return Ok(());
            }
            match self.sync_one_table(target, table, report).await {
                Ok(()) => report.tables += 1,
                Err(e) => {
                    warn!(
                        source = %target.source.title,
                        table = %table.table.name,
                        error = %e,
                        "table sync failed"
                    );
                    report.failures += 1;
                }
            }
        }

        if let Some(hooks) = &self.settings.hooks {
            report.hooks_registered += self.register_hooks(target, hooks).await;
        }

        if let Some(mirror) = &self.settings.mirror {
            match self.register_mirror(target, mirror, all_sources).await {
                Ok(true) => report.mirrors_registered += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(source = %target.source.title, error = %e, "mirror registration failed");
                    report.failures += 1;
                }
            }
        }

        Ok(())
    }

    async fn sync_one_table(
        &self,
        target: &ShadowTarget,
        table: &TableTarget,
        report: &mut CycleReport,
    ) -> SyncResult<()> {
        self.store
            .ensure_table(&target.database, &table.shadow_table)
            .await?;

        let sink = TableSink {
            database: &target.database,
            shadow_table: &table.shadow_table,
            label: &table.table.name,
            fields: &table.fields,
        };
        let written = sync_table(
            self.source.as_ref(),
            self.store.as_ref(),
            &target.source,
            &table.table,
            sink,
            self.settings.page_size,
        )
        .await?;
        report.rows_written += written;

        if self.embedder.is_enabled() {
            match generate_embeddings(
                self.store.as_ref(),
                self.embedder.as_ref(),
                &target.database,
                &table.shadow_table,
                self.settings.embed_limit,
                self.settings.embed,
            )
            .await
            {
                Ok(embedded) => {
                    report.embedded += embedded.embedded;
                    report.embed_failed += embedded.failed;
                }
                Err(e) => warn!(table = %table.shadow_table, error = %e, "embedding pass failed"),
            }
        }

        info!(
            source = %target.source.title,
            table = %table.table.name,
            rows = written,
            "synced table"
        );
        Ok(())
    }

    /// Register insert/update/delete hooks on every table of `target` that
    /// lacks them. Returns how many were created.
    async fn register_hooks(&self, target: &ShadowTarget, settings: &HookSettings) -> usize {
        let mut created = 0;

        for table in &target.tables {
            let existing = match self.source.list_hooks(&table.table.id).await {
                Ok(hooks) => hooks,
                Err(e) => {
                    warn!(table = %table.table.name, error = %e, "could not list webhooks");
                    continue;
                }
            };

            for operation in RecordOperation::ALL {
                if self
                    .registry
                    .hook_known(&target.source.id, &table.table.id, operation)
                {
                    continue;
                }

                let url = match hook_url(
                    &settings.public_base_url,
                    &target.source.id,
                    &table.table.name,
                    operation,
                ) {
                    Ok(url) => url,
                    Err(e) => {
                        warn!(error = %e, "cannot build webhook url");
                        return created;
                    }
                };

                if existing
                    .iter()
                    .any(|h| h.operation == operation && h.url == url)
                {
                    debug!(table = %table.table.name, operation = operation.as_str(), "webhook already present");
                    self.registry
                        .remember_hook(&target.source.id, &table.table.id, operation);
                    continue;
                }

                let hook = HookSpec {
                    title: format!("shadow-sync {} {}", table.table.name, operation.as_str()),
                    operation,
                    url,
                    headers: settings
                        .secret
                        .iter()
                        .map(|s| (TOKEN_HEADER.to_string(), s.clone()))
                        .collect(),
                };

                match self.source.register_hook(&table.table.id, &hook).await {
                    Ok(()) => {
                        self.registry
                            .remember_hook(&target.source.id, &table.table.id, operation);
                        created += 1;
                        info!(table = %table.table.name, operation = operation.as_str(), "registered webhook");
                    }
                    Err(e) => warn!(
                        table = %table.table.name,
                        operation = operation.as_str(),
                        error = %e,
                        "webhook registration failed"
                    ),
                }
            }
        }

        created
    }

    /// Register the shadow database back into the source system. Returns
    /// `false` when a matching mirror already exists.
    async fn register_mirror(
        &self,
        target: &ShadowTarget,
        settings: &MirrorTarget,
        all_sources: &[Source],
    ) -> SyncResult<bool> {
        if self.registry.mirror_known(&target.database) {
            return Ok(false);
        }

        let title = format!("{}{}", settings.title_prefix, target.source.title);
        if all_sources
            .iter()
            .any(|s| is_mirror_of(s, &title, &settings.title_prefix, &target.database, &settings.host))
        {
            debug!(database = %target.database, "mirror already registered");
            self.registry.remember_mirror(&target.database);
            return Ok(false);
        }

        let mirror = MirrorConfig {
            title,
            host: settings.host.clone(),
            port: settings.port,
            user: settings.user.clone(),
            password: settings.password.clone(),
            database: target.database.clone(),
        };
        self.source.register_mirror(&mirror).await?;
        self.registry.remember_mirror(&target.database);
        info!(source = %target.source.title, database = %target.database, "registered mirror");
        Ok(true)
    }

    /// Run a cycle now, then every `interval` until `cancel` fires.
    pub async fn run_forever(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.run_cycle(&cancel).await {
                        warn!(error = %e, "sync cycle failed");
                    }
                }
            }
        }

        info!("sync loop stopped");
    }
}

/// A source counts as the mirror of a shadow database when it carries the
/// expected title, or the mirror prefix plus a connection to that database.
fn is_mirror_of(source: &Source, title: &str, prefix: &str, database: &str, host: &str) -> bool {
    if source.title == title {
        return true;
    }
    source.title.starts_with(prefix)
        && source.connection.as_ref().is_some_and(|c| {
            c.database.as_deref() == Some(database) && c.host.eq_ignore_ascii_case(host)
        })
}

/// `{base}/webhook/{source_id}/{table}?operation={op}` with each segment
/// percent-encoded.
pub fn hook_url(
    base: &str,
    source_id: &str,
    table: &str,
    operation: RecordOperation,
) -> SyncResult<String> {
    let mut url = reqwest::Url::parse(base)
        .map_err(|e| SyncError::Configuration(format!("invalid webhook.public_base_url: {}", e)))?;
    url.path_segments_mut()
        .map_err(|_| SyncError::Configuration("webhook.public_base_url cannot be a base".into()))?
        .pop_if_empty()
        .extend(["webhook", source_id, table]);
    url.query_pairs_mut()
        .clear()
        .append_pair("operation", operation.as_str());
    Ok(url.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ConnectionTarget;

    #[test]
    fn test_hook_url_encodes_segments() {
        let url = hook_url(
            "http://shadow-sync:8000/",
            "p_sales",
            "Order Lines",
            RecordOperation::Update,
        )
        .unwrap();
        assert_eq!(
            url,
            "http://shadow-sync:8000/webhook/p_sales/Order%20Lines?operation=update"
        );
    }

    #[test]
    fn test_hook_url_keeps_base_path() {
        let url = hook_url("https://example.com/api", "p", "t", RecordOperation::Delete).unwrap();
        assert_eq!(url, "https://example.com/api/webhook/p/t?operation=delete");
    }

    #[test]
    fn test_hook_url_rejects_garbage() {
        assert!(hook_url("not a url", "p", "t", RecordOperation::Insert).is_err());
    }

    #[test]
    fn test_mirror_detection() {
        let by_title = Source {
            id: "m1".into(),
            title: "Shadow: Sales".into(),
            connection: None,
        };
        assert!(is_mirror_of(&by_title, "Shadow: Sales", "Shadow: ", "shadow_sales", "pg"));

        let by_connection = Source {
            id: "m2".into(),
            title: "Shadow: sales (renamed)".into(),
            connection: Some(ConnectionTarget {
                host: "PG".into(),
                port: Some(5432),
                database: Some("shadow_sales".into()),
            }),
        };
        assert!(is_mirror_of(&by_connection, "Shadow: Sales", "Shadow: ", "shadow_sales", "pg"));
        assert!(!is_mirror_of(&by_connection, "Shadow: Sales", "Shadow: ", "shadow_other", "pg"));
    }
}
