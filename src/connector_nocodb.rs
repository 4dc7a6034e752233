//! NocoDB connector.
//!
//! Implements [`SourceSystem`] against the NocoDB v2 REST API. Every request
//! carries the `xc-token` header and a per-call timeout, and is retried with
//! exponential backoff on 429, 5xx and network errors.
//!
//! # Endpoints
//!
//! | Operation | Request |
//! |-----------|---------|
//! | list sources | `GET /api/v2/meta/bases` + `GET /api/v2/meta/bases/{id}/sources` |
//! | list tables | `GET /api/v2/meta/bases/{id}/tables` |
//! | list columns | `GET /api/v2/meta/tables/{id}` |
//! | list records | `GET /api/v2/tables/{id}/records?offset=&limit=` |
//! | register mirror | `POST /api/v2/meta/bases` |
//! | list / register hooks | `GET` / `POST /api/v2/meta/tables/{id}/hooks` |
//!
//! # Configuration
//!
//! ```toml
//! [source]
//! api_url = "http://nocodb:8080"
//! token_env = "NOCODB_API_TOKEN"
//! timeout_secs = 30
//! max_retries = 5
//! ```

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::SourceConfig;
use crate::error::{SyncError, SyncResult};
use crate::models::{
    ConnectionTarget, Field, FieldType, HookSpec, MirrorConfig, Record, RecordOperation, Source,
    Table,
};
use crate::source::SourceSystem;

pub struct NocoDbClient {
    base_url: String,
    token: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl NocoDbClient {
    /// Build a client from `[source]`. The API token is read from the
    /// environment variable named by `token_env`.
    pub fn new(config: &SourceConfig) -> SyncResult<Self> {
        let token = std::env::var(&config.token_env).map_err(|_| {
            SyncError::Configuration(format!(
                "{} environment variable not set",
                config.token_env
            ))
        })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SyncError::Configuration(e.to_string()))?;

        Ok(Self {
            base_url: config.api_url.trim_end_matches('/').to_string(),
            token,
            max_retries: config.max_retries,
            client,
        })
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> SyncResult<Value> {
        let url = format!("{}{}", self.base_url, path);
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let mut req = self
                .client
                .request(method.clone(), &url)
                .header("xc-token", &self.token)
                .query(query);
            if let Some(body) = body {
                req = req.json(body);
            }

            match req.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return Ok(response.json().await?);
                    }

                    let body_text = response.text().await.unwrap_or_default();

                    if status.as_u16() == 429 || status.is_server_error() {
                        debug!(%url, %status, attempt, "retrying source request");
                        last_err = Some(SyncError::SourceUnavailable(format!(
                            "{} {}: HTTP {}: {}",
                            method, path, status, body_text
                        )));
                        continue;
                    }

                    if status.as_u16() == 404 {
                        return Err(SyncError::NotFound(format!("{} {}", method, path)));
                    }

                    return Err(SyncError::SourceUnavailable(format!(
                        "{} {}: HTTP {}: {}",
                        method, path, status, body_text
                    )));
                }
                Err(e) => {
                    last_err = Some(SyncError::SourceUnavailable(format!(
                        "{} {}: {}",
                        method, path, e
                    )));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            SyncError::SourceUnavailable(format!("{} {}: retries exhausted", method, path))
        }))
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> SyncResult<Value> {
        self.request(Method::GET, path, query, None).await
    }

    async fn post(&self, path: &str, body: &Value) -> SyncResult<Value> {
        self.request(Method::POST, path, &[], Some(body)).await
    }
}

#[async_trait]
impl SourceSystem for NocoDbClient {
    async fn list_sources(&self) -> SyncResult<Vec<Source>> {
        let bases = self.get("/api/v2/meta/bases", &[]).await?;
        let mut sources = Vec::new();

        for base in list_items(&bases) {
            let Some(id) = str_field(base, "id") else {
                continue;
            };
            let title = str_field(base, "title").unwrap_or(id).to_string();

            // Connection details live on the base's data sources.
            let connection = match self
                .get(&format!("/api/v2/meta/bases/{}/sources", id), &[])
                .await
            {
                Ok(data) => list_items(&data).iter().find_map(parse_connection),
                Err(e) => {
                    warn!(source = %title, error = %e, "could not read base data sources");
                    None
                }
            };

            sources.push(Source {
                id: id.to_string(),
                title,
                connection,
            });
        }

        Ok(sources)
    }

    async fn list_tables(&self, source_id: &str) -> SyncResult<Vec<Table>> {
        let data = self
            .get(&format!("/api/v2/meta/bases/{}/tables", source_id), &[])
            .await?;
        Ok(list_items(&data).iter().filter_map(parse_table).collect())
    }

    async fn list_columns(&self, table_id: &str) -> SyncResult<Vec<Field>> {
        let data = self
            .get(&format!("/api/v2/meta/tables/{}", table_id), &[])
            .await
            .map_err(|e| SyncError::SchemaUnavailable {
                table: table_id.to_string(),
                message: e.to_string(),
            })?;
        Ok(parse_columns(&data))
    }

    async fn list_records(
        &self,
        _source_id: &str,
        table_id: &str,
        offset: usize,
        limit: usize,
    ) -> SyncResult<Vec<Record>> {
        let data = self
            .get(
                &format!("/api/v2/tables/{}/records", table_id),
                &[("offset", offset.to_string()), ("limit", limit.to_string())],
            )
            .await?;
        Ok(list_items(&data)
            .iter()
            .filter_map(|r| r.as_object().cloned())
            .collect())
    }

    async fn register_mirror(&self, mirror: &MirrorConfig) -> SyncResult<()> {
        let body = json!({
            "title": mirror.title,
            "sources": [{
                "type": "pg",
                "alias": mirror.database,
                "config": {
                    "client": "pg",
                    "connection": {
                        "host": mirror.host,
                        "port": mirror.port,
                        "user": mirror.user,
                        "password": mirror.password,
                        "database": mirror.database,
                    },
                },
                "inflection_column": "none",
                "inflection_table": "none",
                "is_schema_readonly": true,
                "is_data_readonly": true,
            }],
        });
        self.post("/api/v2/meta/bases", &body).await?;
        Ok(())
    }

    async fn list_hooks(&self, table_id: &str) -> SyncResult<Vec<HookSpec>> {
        let data = self
            .get(&format!("/api/v2/meta/tables/{}/hooks", table_id), &[])
            .await?;
        Ok(list_items(&data).iter().filter_map(parse_hook).collect())
    }

    async fn register_hook(&self, table_id: &str, hook: &HookSpec) -> SyncResult<()> {
        let headers: Vec<Value> = hook
            .headers
            .iter()
            .map(|(name, value)| json!({ "name": name, "value": value, "enabled": true }))
            .collect();

        let body = json!({
            "title": hook.title,
            "event": "after",
            "operation": hook.operation.as_str(),
            "notification": {
                "type": "URL",
                "payload": {
                    "method": "POST",
                    "path": hook.url,
                    "headers": headers,
                    "body": "{{ json data }}",
                },
            },
            "active": true,
            "version": "v2",
        });
        self.post(&format!("/api/v2/meta/tables/{}/hooks", table_id), &body)
            .await?;
        Ok(())
    }
}

// ============ Response parsing ============

fn list_items(data: &Value) -> &[Value] {
    data.get("list")
        .and_then(|l| l.as_array())
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().map(|n| n != 0).unwrap_or(false),
        _ => false,
    }
}

/// Some API versions return nested JSON objects as encoded strings.
fn as_object_value(value: &Value) -> Option<Value> {
    match value {
        Value::Object(_) => Some(value.clone()),
        Value::String(s) => serde_json::from_str::<Value>(s)
            .ok()
            .filter(|v| v.is_object()),
        _ => None,
    }
}

/// External connection target of a base data source. The source system's
/// own metadata store has none.
fn parse_connection(source: &Value) -> Option<ConnectionTarget> {
    if truthy(source.get("is_meta")) || truthy(source.get("is_local")) {
        return None;
    }

    let config = as_object_value(source.get("config")?)?;
    let connection = config.get("connection")?;
    let host = str_field(connection, "host")?.to_string();

    let port = match connection.get("port") {
        Some(Value::Number(n)) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    };

    Some(ConnectionTarget {
        host,
        port,
        database: str_field(connection, "database").map(str::to_string),
    })
}

fn parse_table(table: &Value) -> Option<Table> {
    let id = str_field(table, "id")?;
    let name = str_field(table, "title").or_else(|| str_field(table, "table_name"))?;
    Some(Table {
        id: id.to_string(),
        name: name.to_string(),
    })
}

fn parse_columns(table: &Value) -> Vec<Field> {
    table
        .get("columns")
        .and_then(|c| c.as_array())
        .map(|columns| {
            columns
                .iter()
                .filter_map(|c| {
                    let name = str_field(c, "title").or_else(|| str_field(c, "column_name"))?;
                    let field_type = str_field(c, "uidt")
                        .map(FieldType::from_tag)
                        .unwrap_or(FieldType::DEFAULT);
                    Some(Field {
                        name: name.to_string(),
                        field_type,
                        primary_key: truthy(c.get("pk")),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parse_hook(hook: &Value) -> Option<HookSpec> {
    let operation = RecordOperation::parse(str_field(hook, "operation")?)?;
    let notification = as_object_value(hook.get("notification")?)?;
    let payload = notification.get("payload")?;
    let url = str_field(payload, "path")?.to_string();

    let headers = payload
        .get("headers")
        .and_then(|h| h.as_array())
        .map(|headers| {
            headers
                .iter()
                .filter_map(|h| {
                    Some((
                        str_field(h, "name")?.to_string(),
                        h.get("value").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                    ))
                })
                .collect()
        })
        .unwrap_or_default();

    Some(HookSpec {
        title: str_field(hook, "title").unwrap_or("").to_string(),
        operation,
        url,
        headers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_connection_from_string_config() {
        let source = json!({
            "id": "ds1",
            "is_meta": false,
            "config": "{\"client\":\"pg\",\"connection\":{\"host\":\"10.0.0.5\",\"port\":\"5433\",\"database\":\"crm\"}}"
        });
        let target = parse_connection(&source).unwrap();
        assert_eq!(target.host, "10.0.0.5");
        assert_eq!(target.port, Some(5433));
        assert_eq!(target.database.as_deref(), Some("crm"));
    }

    #[test]
    fn test_meta_source_has_no_connection() {
        let source = json!({ "id": "ds0", "is_meta": true, "config": {} });
        assert!(parse_connection(&source).is_none());
    }

    #[test]
    fn test_parse_columns_reads_types_and_pk() {
        let table = json!({
            "id": "tbl1",
            "columns": [
                { "title": "Id", "uidt": "ID", "pk": true },
                { "title": "Price", "uidt": "Currency", "pk": false },
                { "column_name": "notes", "uidt": "SomethingNew" }
            ]
        });
        let fields = parse_columns(&table);
        assert_eq!(fields.len(), 3);
        assert!(fields[0].primary_key);
        assert_eq!(fields[1].field_type, FieldType::Currency);
        assert_eq!(fields[2].name, "notes");
        assert_eq!(
            fields[2].field_type,
            FieldType::Unknown("SomethingNew".to_string())
        );
    }

    #[test]
    fn test_parse_table_prefers_title() {
        let table = json!({ "id": "m1", "table_name": "nc_x__orders", "title": "Orders" });
        assert_eq!(parse_table(&table).unwrap().name, "Orders");
    }

    #[test]
    fn test_parse_hook_with_encoded_notification() {
        let hook = json!({
            "title": "shadow-sync insert",
            "operation": "insert",
            "notification": "{\"type\":\"URL\",\"payload\":{\"method\":\"POST\",\"path\":\"http://sync:8000/webhook/p1/Orders?operation=insert\",\"headers\":[{\"name\":\"x-shadow-sync-token\",\"value\":\"s3cret\"}]}}"
        });
        let spec = parse_hook(&hook).unwrap();
        assert_eq!(spec.operation, RecordOperation::Insert);
        assert!(spec.url.ends_with("operation=insert"));
        assert_eq!(spec.headers[0].0, "x-shadow-sync-token");
    }
}
