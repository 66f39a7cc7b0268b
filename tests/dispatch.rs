//! End-to-end dispatch tests: catalog written to the store, requests sent
//! over HTTP to a started gateway.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gateway_proxy::config::ProxyConfig;
use gateway_proxy::store::Store;

mod common;
use common::TestGateway;

#[tokio::test]
async fn test_forward_with_rewrite() {
    let backend = common::start_programmable_backend(|seen| async move {
        let body = serde_json::json!({
            "method": seen.method,
            "uri": seen.uri,
            "body": seen.body,
        });
        (200, body.to_string())
    })
    .await;

    let gw = TestGateway::boot(ProxyConfig::default()).await;
    gw.cluster(1, &[backend]).await;
    gw.api(serde_json::json!({
        "id": 1, "name": "orders", "url_pattern": "/orders/(number):id", "method": "POST", "status": "up",
        "nodes": [{"cluster_id": 1, "url_rewrite": "/v1/orders/{id}?src=gw"}]
    }))
    .await;

    let resp = gw
        .client
        .post(gw.url("/orders/42"))
        .body(r#"{"qty":3}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp.headers().contains_key("x-request-id"));

    let value: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(value["method"], "POST");
    assert_eq!(value["uri"], "/v1/orders/42?src=gw");
    assert_eq!(value["body"], r#"{"qty":3}"#);

    // Method and pattern both have to match.
    assert_eq!(gw.get("/orders/42").await.status(), 404);
    assert_eq!(gw.get("/orders/abc").await.status(), 404);

    gw.stop().await;
}

#[tokio::test]
async fn test_retry_until_success() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let backend = common::start_programmable_backend(move |_| {
        let counter = counter.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                (503, "{}".to_string())
            } else {
                (200, r#"{"ok":true}"#.to_string())
            }
        }
    })
    .await;

    let gw = TestGateway::boot(ProxyConfig::default()).await;
    gw.cluster(1, &[backend]).await;
    gw.api(serde_json::json!({
        "id": 1, "name": "flaky", "url_pattern": "/flaky", "method": "GET", "status": "up",
        "nodes": [{"cluster_id": 1, "retry": {"max_times": 2, "interval_ms": 10, "codes": [503]}}]
    }))
    .await;

    let resp = gw.get("/flaky").await;
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), r#"{"ok":true}"#);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    gw.stop().await;
}

#[tokio::test]
async fn test_retries_exhausted_pass_status_through() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let backend = common::start_programmable_backend(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { (503, r#"{"error":"busy"}"#.to_string()) }
    })
    .await;

    let gw = TestGateway::boot(ProxyConfig::default()).await;
    gw.cluster(1, &[backend]).await;
    gw.api(serde_json::json!({
        "id": 1, "name": "busy", "url_pattern": "/busy", "method": "GET", "status": "up",
        "nodes": [{"cluster_id": 1, "retry": {"max_times": 1, "interval_ms": 10, "codes": [503]}}]
    }))
    .await;

    let resp = gw.get("/busy").await;
    assert_eq!(resp.status(), 503);
    assert_eq!(resp.text().await.unwrap(), r#"{"error":"busy"}"#);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    gw.stop().await;
}

#[tokio::test]
async fn test_multi_node_merge() {
    let user = common::start_mock_backend(r#"{"name":"ann","age":31}"#).await;
    let orders = common::start_mock_backend(r#"[{"id":1},{"id":2}]"#).await;

    let gw = TestGateway::boot(ProxyConfig::default()).await;
    gw.cluster(1, &[user]).await;
    gw.cluster(2, &[orders]).await;
    gw.api(serde_json::json!({
        "id": 1, "name": "profile", "url_pattern": "/profile", "method": "GET", "status": "up",
        "nodes": [
            {"cluster_id": 1, "attr_name": "user", "batch_index": 0},
            {"cluster_id": 2, "attr_name": "orders", "batch_index": 1}
        ]
    }))
    .await;

    let resp = gw.get("/profile").await;
    assert_eq!(resp.status(), 200);
    let value: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(
        value,
        serde_json::json!({"user": {"name": "ann", "age": 31}, "orders": [{"id": 1}, {"id": 2}]})
    );

    gw.stop().await;
}

#[tokio::test]
async fn test_copy_routing_sends_shadow() {
    let primary = common::start_mock_backend(r#"{"from":"primary"}"#).await;
    let shadow_calls = Arc::new(AtomicU32::new(0));
    let counter = shadow_calls.clone();
    let shadow = common::start_programmable_backend(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { (200, r#"{"from":"shadow"}"#.to_string()) }
    })
    .await;

    let gw = TestGateway::boot(ProxyConfig::default()).await;
    gw.cluster(1, &[primary]).await;
    gw.cluster(2, &[shadow]).await;
    gw.api(serde_json::json!({
        "id": 1, "name": "items", "url_pattern": "/items", "method": "GET", "status": "up",
        "nodes": [{"cluster_id": 1}]
    }))
    .await;
    gw.routing(serde_json::json!({
        "id": 1, "name": "mirror", "api_id": 1, "cluster_id": 2, "strategy": "copy", "status": "up"
    }))
    .await;

    // The client only ever sees the primary.
    let resp = gw.get("/items").await;
    assert_eq!(resp.text().await.unwrap(), r#"{"from":"primary"}"#);

    tokio::time::timeout(Duration::from_secs(2), async {
        while shadow_calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("shadow copy never arrived");

    gw.stop().await;
}

#[tokio::test]
async fn test_split_routing_by_header() {
    let stable = common::start_mock_backend(r#"{"from":"stable"}"#).await;
    let canary = common::start_mock_backend(r#"{"from":"canary"}"#).await;

    let gw = TestGateway::boot(ProxyConfig::default()).await;
    gw.cluster(1, &[stable]).await;
    gw.cluster(2, &[canary]).await;
    gw.api(serde_json::json!({
        "id": 1, "name": "items", "url_pattern": "/items", "method": "GET", "status": "up",
        "nodes": [{"cluster_id": 1}]
    }))
    .await;
    gw.routing(serde_json::json!({
        "id": 1, "name": "canary", "cluster_id": 2, "strategy": "split", "status": "up",
        "predicate": {"and": [{"source": "header", "name": "x-canary", "operator": "==", "value": "1"}]}
    }))
    .await;

    let resp = gw.get("/items").await;
    assert_eq!(resp.text().await.unwrap(), r#"{"from":"stable"}"#);

    let resp = gw
        .client
        .get(gw.url("/items"))
        .header("x-canary", "1")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.text().await.unwrap(), r#"{"from":"canary"}"#);

    gw.stop().await;
}

#[tokio::test]
async fn test_catalog_changes_apply_live() {
    let backend = common::start_mock_backend(r#"{"v":1}"#).await;

    let gw = TestGateway::boot(ProxyConfig::default()).await;
    gw.cluster(1, &[backend]).await;
    let record = serde_json::json!({
        "id": 1, "name": "live", "url_pattern": "/live", "method": "GET", "status": "up",
        "nodes": [{"cluster_id": 1}]
    });
    gw.api(record.clone()).await;
    assert_eq!(gw.get("/live").await.status(), 200);

    // Switch to a canned answer.
    let mut canned = record.clone();
    canned["use_default"] = serde_json::json!(true);
    canned["default_value"] = serde_json::json!({"code": 200, "body": "{\"v\":0}"});
    gw.api(canned).await;
    assert_eq!(gw.get("/live").await.text().await.unwrap(), r#"{"v":0}"#);

    // Deleting the record unroutes it.
    let key = gw.running.keys.api("/live", "GET");
    gw.running.store.delete(&key).await.unwrap();
    gw.wait_for(|s| !s.apis.contains_key(&1)).await;
    assert_eq!(gw.get("/live").await.status(), 404);

    gw.stop().await;
}

#[tokio::test]
async fn test_stopped_gateway_rejects() {
    let gw = TestGateway::boot(ProxyConfig::default()).await;
    gw.api(serde_json::json!({
        "id": 1, "name": "canned", "url_pattern": "/canned", "method": "GET", "status": "up",
        "use_default": true, "default_value": {"code": 200, "body": "{}"}
    }))
    .await;
    assert_eq!(gw.get("/canned").await.status(), 200);

    gw.running.gateway.stop();
    assert_eq!(gw.get("/canned").await.status(), 503);

    gw.stop().await;
}

#[tokio::test]
async fn test_request_body_limit() {
    let backend = common::start_mock_backend("{}").await;
    let mut config = ProxyConfig::default();
    config.limits.max_body_bytes = 16;

    let gw = TestGateway::boot(config).await;
    gw.cluster(1, &[backend]).await;
    gw.api(serde_json::json!({
        "id": 1, "name": "upload", "url_pattern": "/upload", "method": "POST", "status": "up",
        "nodes": [{"cluster_id": 1}]
    }))
    .await;

    let small = gw.client.post(gw.url("/upload")).body("tiny").send().await.unwrap();
    assert_eq!(small.status(), 200);
    let large = gw
        .client
        .post(gw.url("/upload"))
        .body("x".repeat(64))
        .send()
        .await
        .unwrap();
    assert_eq!(large.status(), 413);

    gw.stop().await;
}
