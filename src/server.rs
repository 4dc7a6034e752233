//! HTTP surface: access-gated search plus webhook ingest.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/agent-info` | Caller identity, allowed source, access mode |
//! | `GET`  | `/list-databases` | Shadow databases visible to the caller |
//! | `POST` | `/list-tables` | Tables and row counts of one database |
//! | `POST` | `/search` | Semantic search over one shadow table, optionally filtered |
//! | `POST` | `/query` | Records whose snapshot contains a JSON filter |
//! | `POST` | `/table-schema` | Column metadata of one table |
//! | `GET`  | `/stats` | Row, embedding and freshness counts |
//! | `POST` | `/webhook/{sourceId}/{tableName}?operation=` | Record change ingest |
//!
//! # Error Contract
//!
//! ```json
//! { "success": false, "error": { "code": "access_denied", "message": "agent 'a' may not read 'b'" } }
//! ```
//!
//! Status codes: `bad_request` (400), `access_denied` (403), `not_found` (404),
//! `embedding_unavailable` (503); everything else is 500.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::access::AccessMode;
use crate::error::SyncError;
use crate::models::RecordOperation;
use crate::search::{
    DatabaseInfo, QueryEngine, QueryRequest, QueryResponse, SearchRequest, SearchResponse,
    StatsResponse, TableInfo, TableSchema,
};
use crate::webhook::{WebhookIngest, WebhookReport, TOKEN_HEADER};

#[derive(Clone)]
pub struct AppState {
    pub query: Arc<QueryEngine>,
    pub webhook: Arc<WebhookIngest>,
    /// Shared secret webhook deliveries must carry, if configured.
    pub webhook_secret: Option<String>,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/agent-info", get(handle_agent_info))
        .route("/list-databases", get(handle_list_databases))
        .route("/list-tables", post(handle_list_tables))
        .route("/search", post(handle_search))
        .route("/query", post(handle_query))
        .route("/table-schema", post(handle_table_schema))
        .route("/stats", get(handle_stats))
        .route("/webhook/{source_id}/{table}", post(handle_webhook))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve until `shutdown` fires, then drain in-flight requests.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "http server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("http server stopped");
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            success: false,
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<SyncError> for AppError {
    fn from(e: SyncError) -> Self {
        let status = match &e {
            SyncError::Validation(_) => StatusCode::BAD_REQUEST,
            SyncError::AccessDenied(_) => StatusCode::FORBIDDEN,
            SyncError::NotFound(_) => StatusCode::NOT_FOUND,
            SyncError::EmbeddingUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(code = e.code(), error = %e, "request failed");
        }
        AppError {
            status,
            code: e.code().to_string(),
            message: e.to_string(),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        SyncError::Validation(rejection.body_text()).into()
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /agent-info ============

#[derive(Serialize)]
struct AgentInfoResponse {
    success: bool,
    agent_id: Option<String>,
    agent_name: Option<String>,
    allowed_source: Option<String>,
    /// Shadow database of the allowed source, once discovered.
    database: Option<String>,
    access_mode: AccessMode,
}

async fn handle_agent_info(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Json<AgentInfoResponse> {
    let access = state.query.access();
    let caller = access.resolve_identity(&headers);
    let database = state.query.allowed_database(&caller);

    Json(AgentInfoResponse {
        success: true,
        agent_id: caller.id,
        agent_name: caller.name,
        allowed_source: caller.allowed_source,
        database,
        access_mode: access.mode(),
    })
}

// ============ GET /list-databases ============

#[derive(Serialize)]
struct ListDatabasesResponse {
    success: bool,
    databases: Vec<DatabaseInfo>,
}

async fn handle_list_databases(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Json<ListDatabasesResponse> {
    let caller = state.query.access().resolve_identity(&headers);
    Json(ListDatabasesResponse {
        success: true,
        databases: state.query.databases(&caller),
    })
}

// ============ POST /list-tables ============

#[derive(Deserialize)]
struct ListTablesRequest {
    database: String,
}

#[derive(Serialize)]
struct ListTablesResponse {
    success: bool,
    database: String,
    tables: Vec<TableInfo>,
}

async fn handle_list_tables(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ListTablesRequest>, JsonRejection>,
) -> Result<Json<ListTablesResponse>, AppError> {
    let Json(request) = body?;
    let caller = state.query.access().resolve_identity(&headers);
    let tables = state.query.tables(&caller, &request.database).await?;

    Ok(Json(ListTablesResponse {
        success: true,
        database: request.database,
        tables,
    }))
}

// ============ POST /search ============

async fn handle_search(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<SearchRequest>, JsonRejection>,
) -> Result<Json<SearchResponse>, AppError> {
    let Json(request) = body?;
    let caller = state.query.access().resolve_identity(&headers);
    let response = state.query.search(&caller, &request).await?;
    Ok(Json(response))
}

// ============ POST /query ============

async fn handle_query(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Json<QueryResponse>, AppError> {
    let Json(request) = body?;
    let caller = state.query.access().resolve_identity(&headers);
    Ok(Json(state.query.query_records(&caller, &request).await?))
}

// ============ POST /table-schema ============

#[derive(Deserialize)]
struct TableSchemaRequest {
    database: String,
    table: String,
}

#[derive(Serialize)]
struct TableSchemaResponse {
    success: bool,
    #[serde(flatten)]
    schema: TableSchema,
}

async fn handle_table_schema(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<TableSchemaRequest>, JsonRejection>,
) -> Result<Json<TableSchemaResponse>, AppError> {
    let Json(request) = body?;
    let caller = state.query.access().resolve_identity(&headers);
    let schema = state
        .query
        .table_schema(&caller, &request.database, &request.table)?;
    Ok(Json(TableSchemaResponse {
        success: true,
        schema,
    }))
}

// ============ GET /stats ============

async fn handle_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<StatsResponse>, AppError> {
    let caller = state.query.access().resolve_identity(&headers);
    Ok(Json(state.query.stats(&caller).await?))
}

// ============ POST /webhook/{sourceId}/{tableName} ============

#[derive(Deserialize)]
struct WebhookQuery {
    operation: Option<String>,
}

#[derive(Serialize)]
struct WebhookResponse {
    success: bool,
    #[serde(flatten)]
    report: WebhookReport,
}

async fn handle_webhook(
    State(state): State<AppState>,
    Path((source_id, table)): Path<(String, String)>,
    Query(query): Query<WebhookQuery>,
    headers: HeaderMap,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<WebhookResponse>, AppError> {
    if let Some(secret) = &state.webhook_secret {
        let presented = headers.get(TOKEN_HEADER).map(|v| v.as_bytes());
        if !presented.is_some_and(|token| token_matches(token, secret.as_bytes())) {
            return Err(SyncError::AccessDenied("missing or invalid webhook token".to_string()).into());
        }
    }

    let operation = query
        .operation
        .as_deref()
        .and_then(RecordOperation::parse)
        .ok_or_else(|| {
            SyncError::Validation("operation must be one of insert, update, delete".to_string())
        })?;
    let Json(payload) = body?;

    let report = state
        .webhook
        .handle(&source_id, &table, operation, &payload)
        .await?;
    Ok(Json(WebhookResponse {
        success: true,
        report,
    }))
}

/// Compare a presented token against the secret in time independent of
/// where they first differ.
fn token_matches(presented: &[u8], secret: &[u8]) -> bool {
    let presented = Sha256::digest(presented);
    let secret = Sha256::digest(secret);
    presented
        .iter()
        .zip(secret.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}
