//! # shadow-sync
//!
//! Keeps a pgvector "shadow" database for every eligible NocoDB base and
//! serves access-controlled semantic search over the shadowed tables.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  pages   ┌──────────────┐  upsert  ┌──────────────┐
//! │  NocoDB  │────────▶│ Orchestrator │────────▶│  PostgreSQL   │
//! │  (bases) │◀────────│ sync + embed │         │  + pgvector   │
//! └────┬─────┘ mirrors └──────────────┘         └──────┬───────┘
//!      │        hooks                                  │
//!      │ webhooks      ┌──────────────┐    nearest     │
//!      └─────────────▶│  HTTP (axum) │◀───────────────┘
//!                      │ search/ingest│
//!                      └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! shadowctl sources                 # which bases will be shadowed, and why
//! shadowctl sync                    # run one sync cycle
//! shadowctl embed pending           # backfill missing embeddings
//! shadowctl search shadow_sales products "blue widget"
//! shadowctl serve                   # sync loop + HTTP server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`source`] | Source-system trait and in-memory implementation |
//! | [`connector_nocodb`] | NocoDB v2 REST client |
//! | [`sources`] | Source eligibility policy |
//! | [`introspect`] | Column metadata with per-cycle cache |
//! | [`semantic`] | Record → natural-language text |
//! | [`store`] | Shadow store trait, PostgreSQL and in-memory backends |
//! | [`sync`] | Paged record synchronization |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`embed_cmd`] | Batched embedding generation |
//! | [`webhook`] | Webhook ingest |
//! | [`registry`] | Discovery snapshot and reconciliation caches |
//! | [`ingest`] | Sync cycle orchestration |
//! | [`access`] | Caller identity and access policy |
//! | [`search`] | Access-gated semantic search |
//! | [`server`] | HTTP API |
//! | [`app`] | Process wiring |
//! | [`logging`] | Tracing subscriber setup |

pub mod access;
pub mod app;
pub mod config;
pub mod connector_nocodb;
pub mod embed_cmd;
pub mod embedding;
pub mod error;
pub mod ingest;
pub mod introspect;
pub mod logging;
pub mod models;
pub mod registry;
pub mod search;
pub mod semantic;
pub mod server;
pub mod source;
pub mod sources;
pub mod store;
pub mod sync;
pub mod webhook;
