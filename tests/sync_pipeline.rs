mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use common::{harness, products, HR_DB, SHOP_DB};
use shadow_sync::app::App;
use shadow_sync::embedding::HashProvider;
use shadow_sync::models::RecordOperation;
use shadow_sync::store::ShadowStore;

async fn cycle(app: &App) -> shadow_sync::ingest::CycleReport {
    app.orchestrator
        .run_cycle(&CancellationToken::new())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_pagination_completeness() {
    // page_size = 3
    for (n, expected_fetches) in [(0usize, 1usize), (3, 2), (4, 2)] {
        let h = harness("");
        let names: Vec<String> = (0..n).map(|i| format!("item {}", i)).collect();
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        h.source.set_records("m_products", products(&names)).unwrap();
        h.source.set_records("m_staff", Vec::new()).unwrap();

        let report = cycle(&h.app).await;

        assert_eq!(report.failures, 0);
        assert_eq!(
            h.store.count_rows(SHOP_DB, "products").await.unwrap(),
            n as i64,
            "N = {}",
            n
        );
        // Products plus the single empty Staff page.
        assert_eq!(h.source.record_fetches(), expected_fetches + 1, "N = {}", n);
    }
}

#[tokio::test]
async fn test_full_sync_is_idempotent() {
    let h = harness("");

    let first = cycle(&h.app).await;
    let before = h.store.get_row(SHOP_DB, "products", "2").await.unwrap().unwrap();

    let second = cycle(&h.app).await;
    let after = h.store.get_row(SHOP_DB, "products", "2").await.unwrap().unwrap();

    assert_eq!(first.rows_written, 5);
    assert_eq!(second.rows_written, 5);
    assert_eq!(h.store.count_rows(SHOP_DB, "products").await.unwrap(), 3);
    assert_eq!(h.store.count_rows(HR_DB, "staff").await.unwrap(), 2);
    assert_eq!(before.id, after.id);
    assert_eq!(
        serde_json::to_vec(&before.data).unwrap(),
        serde_json::to_vec(&after.data).unwrap()
    );
    assert_eq!(before.semantic_text, after.semantic_text);
    // Unchanged text keeps its vector.
    assert_eq!(before.embedding, after.embedding);
}

#[tokio::test]
async fn test_update_preserves_surrogate_id() {
    let h = harness("");
    cycle(&h.app).await;
    let before = h.store.get_row(SHOP_DB, "products", "1").await.unwrap().unwrap();
    assert!(before.embedding.is_some());

    tokio::time::sleep(Duration::from_millis(20)).await;
    h.source
        .set_records("m_products", products(&["alpha widget v2", "beta widget", "gamma gadget"]))
        .unwrap();
    cycle(&h.app).await;

    let after = h.store.get_row(SHOP_DB, "products", "1").await.unwrap().unwrap();
    assert_eq!(before.id, after.id);
    assert_eq!(after.data["Name"], json!("alpha widget v2"));
    assert!(after.updated_at > before.updated_at);
    assert_eq!(after.created_at, before.created_at);
    assert_ne!(before.embedding, after.embedding);
    assert_eq!(h.store.count_rows(SHOP_DB, "products").await.unwrap(), 3);
}

#[tokio::test]
async fn test_unavailable_schema_degrades_to_default_typing() {
    let h = harness("");
    h.source.break_schema("m_products").unwrap();

    let report = cycle(&h.app).await;

    assert_eq!(report.failures, 0);
    let row = h.store.get_row(SHOP_DB, "products", "3").await.unwrap().unwrap();
    assert_eq!(
        row.semantic_text.as_deref(),
        Some("products record. name: gamma gadget")
    );
}

#[tokio::test]
async fn test_offline_source_fails_the_cycle() {
    let h = harness("");
    h.source.set_offline(true).unwrap();

    let err = h
        .app
        .orchestrator
        .run_cycle(&CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "source_unavailable");
}

#[tokio::test]
async fn test_cancelled_cycle_still_publishes_discovery() {
    let h = harness("");
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = h.app.orchestrator.run_cycle(&cancel).await.unwrap();

    assert!(report.cancelled);
    assert_eq!(report.rows_written, 0);
    assert_eq!(h.app.registry.snapshot().targets.len(), 2);
}

#[tokio::test]
async fn test_webhook_insert_update_delete() {
    let h = harness("");
    cycle(&h.app).await;

    let insert = json!({"data": {"rows": [{"Id": 10, "Name": "delta widget"}]}});
    let report = h
        .app
        .webhook
        .handle("p_shop", "Products", RecordOperation::Insert, &insert)
        .await
        .unwrap();
    assert_eq!(report.rows_affected, 1);
    assert_eq!(report.embeddings_written, 1);

    // Replaying the same delivery leaves a single row.
    h.app
        .webhook
        .handle("p_shop", "Products", RecordOperation::Insert, &insert)
        .await
        .unwrap();
    assert_eq!(h.store.count_rows(SHOP_DB, "products").await.unwrap(), 4);

    let update = json!({"data": {"Id": 10, "Name": "delta widget deluxe"}});
    h.app
        .webhook
        .handle("p_shop", "Products", RecordOperation::Update, &update)
        .await
        .unwrap();
    let row = h.store.get_row(SHOP_DB, "products", "10").await.unwrap().unwrap();
    assert_eq!(row.data["Name"], json!("delta widget deluxe"));

    let delete = json!({"data": {"Id": 10}});
    let removed = h
        .app
        .webhook
        .handle("p_shop", "Products", RecordOperation::Delete, &delete)
        .await
        .unwrap();
    assert_eq!(removed.rows_affected, 1);

    let again = h
        .app
        .webhook
        .handle("p_shop", "Products", RecordOperation::Delete, &delete)
        .await
        .unwrap();
    assert_eq!(again.rows_affected, 0);
    assert_eq!(h.store.count_rows(SHOP_DB, "products").await.unwrap(), 3);
}

#[tokio::test]
async fn test_stale_webhook_update_is_ignored() {
    let h = harness("");
    cycle(&h.app).await;

    let newer = json!({"data": {"Id": 20, "Name": "fresh", "UpdatedAt": "2024-05-02 10:00:00+00:00"}});
    let older = json!({"data": {"Id": 20, "Name": "stale", "UpdatedAt": "2024-05-01 10:00:00+00:00"}});

    h.app
        .webhook
        .handle("p_shop", "Products", RecordOperation::Update, &newer)
        .await
        .unwrap();
    let report = h
        .app
        .webhook
        .handle("p_shop", "Products", RecordOperation::Update, &older)
        .await
        .unwrap();

    assert_eq!(report.rows_affected, 0);
    let row = h.store.get_row(SHOP_DB, "products", "20").await.unwrap().unwrap();
    assert_eq!(row.data["Name"], json!("fresh"));
}

#[tokio::test]
async fn test_webhook_for_unknown_source_is_not_found() {
    let h = harness("");

    // Nothing discovered yet.
    let payload = json!({"data": {"Id": 1, "Name": "x"}});
    let err = h
        .app
        .webhook
        .handle("p_shop", "Products", RecordOperation::Insert, &payload)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "not_found");

    cycle(&h.app).await;
    let err = h
        .app
        .webhook
        .handle("p_nope", "Products", RecordOperation::Insert, &payload)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "not_found");
}

#[tokio::test]
async fn test_webhook_for_undiscovered_table_uses_default_typing() {
    let h = harness("");
    cycle(&h.app).await;

    let payload = json!({"data": {"Id": 1, "Title": "quarterly plan"}});
    h.app
        .webhook
        .handle("p_shop", "Road Map", RecordOperation::Insert, &payload)
        .await
        .unwrap();

    let row = h.store.get_row(SHOP_DB, "road_map", "1").await.unwrap().unwrap();
    assert_eq!(
        row.semantic_text.as_deref(),
        Some("road map record. title: quarterly plan")
    );
}

#[tokio::test]
async fn test_hooks_are_registered_once() {
    std::env::set_var("SHADOW_SYNC_IT_HOOK_SECRET", "s3cret");
    let extra = r#"
[webhook]
public_base_url = "http://shadow-sync.test:8000"
secret_env = "SHADOW_SYNC_IT_HOOK_SECRET"
"#;
    let h = harness(extra);

    let first = cycle(&h.app).await;
    cycle(&h.app).await;
    assert_eq!(first.hooks_registered, 6);

    let hooks = h.source.hooks("m_products");
    assert_eq!(hooks.len(), 3);
    assert!(hooks.iter().any(|hook| hook.operation == RecordOperation::Delete
        && hook.url == "http://shadow-sync.test:8000/webhook/p_shop/Products?operation=delete"));
    assert!(hooks
        .iter()
        .all(|hook| hook.headers == vec![("x-shadow-sync-token".to_string(), "s3cret".to_string())]));

    // A restarted process rebuilds its cache from the live hook list.
    let restarted = App::build(
        h.app.config.clone(),
        h.source.clone(),
        h.store.clone(),
        Arc::new(HashProvider::new(common::DIMS)),
    )
    .unwrap();
    let report = cycle(&restarted).await;
    assert_eq!(report.hooks_registered, 0);
    assert_eq!(h.source.hooks("m_products").len(), 3);
    assert_eq!(h.source.hooks("m_staff").len(), 3);
}

#[tokio::test]
async fn test_mirrors_are_registered_once() {
    std::env::set_var("SHADOW_SYNC_IT_PG_PASSWORD", "pw");
    let extra = r#"
[mirror]
enabled = true
host = "shadow-db.test"
user = "postgres"
password_env = "SHADOW_SYNC_IT_PG_PASSWORD"
"#;
    let h = harness(extra);

    let first = cycle(&h.app).await;
    let second = cycle(&h.app).await;

    assert_eq!(first.mirrors_registered, 2);
    assert_eq!(second.mirrors_registered, 0);
    // Registered mirrors are themselves excluded from shadowing.
    assert_eq!(second.sources, 2);

    let mirrors = h.source.mirrors();
    assert_eq!(mirrors.len(), 2);
    let shop = mirrors.iter().find(|m| m.database == SHOP_DB).unwrap();
    assert_eq!(shop.title, "Shadow: Shop");
    assert_eq!(shop.password, "pw");

    let restarted = App::build(
        h.app.config.clone(),
        h.source.clone(),
        h.store.clone(),
        Arc::new(HashProvider::new(common::DIMS)),
    )
    .unwrap();
    let report = cycle(&restarted).await;
    assert_eq!(report.mirrors_registered, 0);
    assert_eq!(h.source.mirrors().len(), 2);
}

#[tokio::test]
async fn test_reserved_and_local_sources_are_not_shadowed() {
    let h = harness("");
    h.source
        .add_source(shadow_sync::models::Source {
            id: "p_sample".into(),
            title: "Sample".into(),
            connection: None,
        })
        .unwrap();
    h.source
        .add_source(shadow_sync::models::Source {
            id: "p_local".into(),
            title: "Warehouse".into(),
            connection: Some(shadow_sync::models::ConnectionTarget {
                host: "localhost".into(),
                port: Some(5432),
                database: Some("warehouse".into()),
            }),
        })
        .unwrap();

    let report = cycle(&h.app).await;

    assert_eq!(report.sources, 2);
    let snapshot = h.app.registry.snapshot();
    assert!(snapshot.resolve("p_sample").is_none());
    assert!(snapshot.resolve("p_local").is_none());
}
