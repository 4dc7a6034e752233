//! Process wiring.
//!
//! [`App`] owns the shared components: one source client, one shadow store,
//! one embedding provider, and the registry they all read. [`App::connect`]
//! builds the production stack; [`App::build`] takes any implementations,
//! which is how the tests run against the in-memory store and source.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::access::AccessPolicy;
use crate::config::Config;
use crate::connector_nocodb::NocoDbClient;
use crate::embed_cmd::EmbedSettings;
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::error::SyncResult;
use crate::ingest::{OrchestratorSettings, SyncOrchestrator};
use crate::registry::ShadowRegistry;
use crate::search::QueryEngine;
use crate::server::{self, AppState};
use crate::source::SourceSystem;
use crate::store::{PgShadowStore, ShadowStore};
use crate::webhook::WebhookIngest;

/// Vector width used for the shadow column when no provider is configured.
const FALLBACK_DIMS: usize = 768;

pub struct App {
    pub config: Config,
    pub source: Arc<dyn SourceSystem>,
    pub store: Arc<dyn ShadowStore>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub registry: Arc<ShadowRegistry>,
    pub orchestrator: Arc<SyncOrchestrator>,
    pub query: Arc<QueryEngine>,
    pub webhook: Arc<WebhookIngest>,
}

impl App {
    pub fn build(
        config: Config,
        source: Arc<dyn SourceSystem>,
        store: Arc<dyn ShadowStore>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> SyncResult<Self> {
        let registry = Arc::new(ShadowRegistry::new());
        let settings = OrchestratorSettings::from_config(&config)?;
        let access = AccessPolicy::from_config(&config.access)?;
        let embed = EmbedSettings::from_config(&config.embedding);

        let orchestrator = Arc::new(SyncOrchestrator::new(
            source.clone(),
            store.clone(),
            embedder.clone(),
            registry.clone(),
            settings,
        ));
        let query = Arc::new(QueryEngine::new(
            store.clone(),
            embedder.clone(),
            registry.clone(),
            access,
        ));
        let webhook = Arc::new(WebhookIngest::new(
            store.clone(),
            embedder.clone(),
            registry.clone(),
            embed,
        ));

        Ok(Self {
            config,
            source,
            store,
            embedder,
            registry,
            orchestrator,
            query,
            webhook,
        })
    }

    /// NocoDB client, PostgreSQL store, configured embedding provider.
    pub async fn connect(config: Config) -> anyhow::Result<Self> {
        let embedder = create_provider(&config.embedding)?;
        let dims = if embedder.is_enabled() {
            embedder.dims()
        } else {
            config.embedding.dims.unwrap_or(FALLBACK_DIMS)
        };

        let source = Arc::new(NocoDbClient::new(&config.source)?);
        let store = Arc::new(
            PgShadowStore::connect(&config.shadow, dims)
                .await
                .context("cannot reach the administrative database")?,
        );

        Ok(Self::build(config, source, store, embedder)?)
    }

    pub fn state(&self) -> AppState {
        AppState {
            query: self.query.clone(),
            webhook: self.webhook.clone(),
            webhook_secret: self.config.webhook.secret(),
        }
    }

    /// Warm up embeddings, then run the sync loop and the HTTP server until
    /// Ctrl-C.
    pub async fn serve(self) -> anyhow::Result<()> {
        if self.embedder.is_enabled() {
            info!(model = self.embedder.model_name(), "warming up embedding provider");
            self.embedder
                .warm_up()
                .await
                .context("embedding provider warm-up failed")?;
        }

        let listener = TcpListener::bind(&self.config.server.bind)
            .await
            .with_context(|| format!("cannot bind {}", self.config.server.bind))?;

        let shutdown = CancellationToken::new();
        let interval = Duration::from_secs(self.config.sync.interval_secs);
        let sync_loop = tokio::spawn(
            self.orchestrator
                .clone()
                .run_forever(interval, shutdown.clone()),
        );

        let signal = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "cannot listen for ctrl-c");
                return;
            }
            info!("shutdown requested");
            signal.cancel();
        });

        server::serve(listener, self.state(), shutdown.clone()).await?;
        shutdown.cancel();
        if let Err(e) = sync_loop.await {
            warn!(error = %e, "sync loop ended abnormally");
        }
        Ok(())
    }
}
