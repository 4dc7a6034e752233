//! # shadowctl
//!
//! Command-line interface for shadow-sync.
//!
//! ## Usage
//!
//! ```bash
//! shadowctl --config ./config/shadow-sync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `shadowctl serve` | Run the sync loop and the HTTP API |
//! | `shadowctl sync` | Run one sync cycle and exit |
//! | `shadowctl sources` | List sources with their eligibility verdict |
//! | `shadowctl embed pending` | Embed rows that have no vector yet |
//! | `shadowctl search <db> <table> "<query>"` | Semantic search as an agent |
//! | `shadowctl query <db> <table> --filter '{..}'` | Records containing a JSON filter |
//! | `shadowctl get <db> <table> <record_id>` | Print one shadow row |
//! | `shadowctl stats` | Row and embedding counts per shadow table |

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use shadow_sync::app::App;
use shadow_sync::config;
use shadow_sync::connector_nocodb::NocoDbClient;
use shadow_sync::embed_cmd::{run_embed_pending, EmbedSettings};
use shadow_sync::logging;
use shadow_sync::search::{QueryRequest, SearchRequest};
use shadow_sync::sources;

/// shadow-sync: pgvector shadows of NocoDB bases with access-gated search.
#[derive(Parser)]
#[command(name = "shadowctl", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/shadow-sync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Warm up embeddings, then run the periodic sync loop and the HTTP API.
    Serve,

    /// Run a single sync cycle.
    Sync,

    /// List every source and whether it will be shadowed.
    Sources,

    /// Embedding maintenance.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Semantic search over one shadow table.
    Search {
        /// Source id, title, or shadow database name.
        database: String,
        table: String,
        query: String,

        /// Maximum results (1-100).
        #[arg(long)]
        limit: Option<i64>,

        /// JSON object the record snapshot must contain.
        #[arg(long)]
        filter: Option<String>,

        /// Agent id to search as; access rules apply.
        #[arg(long)]
        agent: Option<String>,
    },

    /// Records whose snapshot contains a JSON filter.
    Query {
        database: String,
        table: String,

        #[arg(long)]
        filter: Option<String>,

        #[arg(long)]
        limit: Option<i64>,

        #[arg(long)]
        offset: Option<i64>,

        #[arg(long)]
        agent: Option<String>,
    },

    /// Row, embedding and freshness counts per shadow table.
    Stats {
        #[arg(long)]
        agent: Option<String>,
    },

    /// Print one shadow row by source record id.
    Get {
        database: String,
        table: String,
        record_id: String,

        #[arg(long)]
        agent: Option<String>,
    },
}

#[derive(Subcommand)]
enum EmbedAction {
    /// Embed rows whose semantic text has no vector yet.
    Pending {
        /// Maximum rows per table.
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init_tracing(&cfg.log)?;

    match cli.command {
        Commands::Sources => {
            let client = NocoDbClient::new(&cfg.source)?;
            sources::list_sources(&cfg, &client).await?;
        }
        Commands::Serve => {
            App::connect(cfg).await?.serve().await?;
        }
        Commands::Sync => {
            let app = App::connect(cfg).await?;
            let cancel = CancellationToken::new();
            let signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    signal.cancel();
                }
            });
            let report = app.orchestrator.run_cycle(&cancel).await?;
            report.print();
        }
        Commands::Embed {
            action: EmbedAction::Pending { limit },
        } => {
            let app = App::connect(cfg).await?;
            let snapshot = app.orchestrator.refresh_snapshot().await?;
            let databases: Vec<String> = snapshot.targets.iter().map(|t| t.database.clone()).collect();
            let limit = limit.unwrap_or(app.config.sync.embed_limit);
            let settings = EmbedSettings::from_config(&app.config.embedding);

            let report = run_embed_pending(
                app.store.as_ref(),
                app.embedder.as_ref(),
                &databases,
                limit,
                settings,
            )
            .await?;
            println!("embed pending");
            println!("  pending: {}", report.pending);
            println!("  embedded: {}", report.embedded);
            println!("  failed: {}", report.failed);
            println!("ok");
        }
        Commands::Search {
            database,
            table,
            query,
            limit,
            filter,
            agent,
        } => {
            let filter = parse_filter(filter.as_deref())?;
            let app = App::connect(cfg).await?;
            app.orchestrator.refresh_snapshot().await?;
            let caller = app.query.access().identity_for(agent.as_deref(), None);
            let request = SearchRequest {
                database,
                table,
                query,
                limit,
                filter,
            };

            let response = app.query.search(&caller, &request).await?;
            if response.results.is_empty() {
                println!("No results.");
            }
            for (i, hit) in response.results.iter().enumerate() {
                let score = hit
                    .get("similarity_score")
                    .and_then(|s| s.as_f64())
                    .unwrap_or_default();
                println!("{}. [{:.2}] {}", i + 1, score, serde_json::to_string(hit)?);
            }
        }
        Commands::Get {
            database,
            table,
            record_id,
            agent,
        } => {
            let app = App::connect(cfg).await?;
            app.orchestrator.refresh_snapshot().await?;
            let caller = app.query.access().identity_for(agent.as_deref(), None);
            let row = app
                .query
                .get_record(&caller, &database, &table, &record_id)
                .await?;
            println!("{}", serde_json::to_string_pretty(&row)?);
        }
        Commands::Query {
            database,
            table,
            filter,
            limit,
            offset,
            agent,
        } => {
            let filter = parse_filter(filter.as_deref())?;
            let app = App::connect(cfg).await?;
            app.orchestrator.refresh_snapshot().await?;
            let caller = app.query.access().identity_for(agent.as_deref(), None);
            let request = QueryRequest {
                database,
                table,
                filter,
                limit,
                offset,
            };

            let response = app.query.query_records(&caller, &request).await?;
            if response.records.is_empty() {
                println!("No records.");
            }
            for record in &response.records {
                println!("{}", serde_json::to_string(record)?);
            }
        }
        Commands::Stats { agent } => {
            let app = App::connect(cfg).await?;
            app.orchestrator.refresh_snapshot().await?;
            let caller = app.query.access().identity_for(agent.as_deref(), None);
            let stats = app.query.stats(&caller).await?;

            for db in &stats.databases {
                println!("{} ({})", db.database, db.source_id);
                for t in &db.tables {
                    println!(
                        "  {:<32} rows={} embedded={} recent={}",
                        t.shadow_table, t.stats.rows, t.stats.embedded, t.stats.recent
                    );
                }
            }
            println!(
                "total rows={} embedded={} recent({}d)={}",
                stats.total_rows, stats.total_embedded, stats.recent_window_days, stats.total_recent
            );
        }
    }

    Ok(())
}

fn parse_filter(raw: Option<&str>) -> anyhow::Result<Option<serde_json::Value>> {
    raw.map(|s| serde_json::from_str(s).context("--filter must be valid JSON"))
        .transpose()
}
