use std::sync::Arc;
use std::time::Duration;

use axum::Router as AxumRouter;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use cachegrid::config::source::InMemoryConfigSource;
use cachegrid::router::{RouterState, build_router};
use cachegrid::store::{ResourceCaps, TtlStore};
use cachegrid::worker;

async fn spawn_worker() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = worker::build_router(Arc::new(TtlStore::new()), ResourceCaps::default());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr.to_string()
}

fn one_namespace_doc(worker_addr: &str) -> String {
    format!(r#"{{"namespaces":[{{"name":"app","apikey":"K1"}}],"workers":["{worker_addr}"],"dashboard":{{"password":"secret"}}}}"#)
}

async fn call(app: AxumRouter, method: &str, uri: &str, api_key: Option<&str>, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
    let mut builder = Request::builder().method(method).uri(uri).header("content-type", "application/json");
    if let Some(key) = api_key {
        builder = builder.header("x-api-key", key);
    }
    let request = builder.body(Body::from(body.to_string())).unwrap();
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() { serde_json::Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
    (status, json)
}

/// Scenario 2 — TTL expiration: Set with ttl=1, wait past it, Get misses.
#[tokio::test]
async fn scenario_2_ttl_expiration_increments_miss_counter() {
    let worker_addr = spawn_worker().await;
    let source = InMemoryConfigSource::new(one_namespace_doc(&worker_addr));
    let state = RouterState::build(source, 150, Duration::from_millis(50), Duration::from_secs(1)).await.unwrap();
    let app = build_router(state);

    call(app.clone(), "POST", "/v1/set", Some("K1"), serde_json::json!({"key": "x", "value": "y", "ttl_seconds": 1})).await;
    tokio::time::sleep(Duration::from_millis(1200)).await;

    let (status, body) = call(app, "POST", "/v1/get", Some("K1"), serde_json::json!({"key": "x"})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["found"], false);
}

/// Scenario 4 (partial) — adding a second worker to the ring moves some
/// previously-placed keys to the new worker; keys still owned by the
/// original worker remain readable.
#[tokio::test]
async fn scenario_4_ring_rebalance_on_worker_add() {
    let w1 = spawn_worker().await;
    let source = InMemoryConfigSource::new(one_namespace_doc(&w1));
    let state = RouterState::build(source.clone(), 150, Duration::from_millis(50), Duration::from_secs(1)).await.unwrap();
    let app = build_router(state);

    for i in 0..50 {
        call(app.clone(), "POST", "/v1/set", Some("K1"), serde_json::json!({"key": format!("k{i}"), "value": "v", "ttl_seconds": 0})).await;
    }

    let w2 = spawn_worker().await;
    source.push(format!(r#"{{"namespaces":[{{"name":"app","apikey":"K1"}}],"workers":["{w1}","{w2}"],"dashboard":{{"password":"secret"}}}}"#)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut found = 0;
    for i in 0..50 {
        let (_, body) = call(app.clone(), "POST", "/v1/get", Some("K1"), serde_json::json!({"key": format!("k{i}")})).await;
        if body["found"] == true {
            found += 1;
        }
    }
    assert!(found > 0, "expected at least some keys to remain reachable after rebalance");
}

/// Scenario 5 — hot reload with a new namespace: publishing a snapshot
/// that adds namespace B makes the Router authenticate B's api key
/// without restarting.
#[tokio::test]
async fn scenario_5_hot_reload_adds_namespace() {
    let worker_addr = spawn_worker().await;
    let source = InMemoryConfigSource::new(one_namespace_doc(&worker_addr));
    let state = RouterState::build(source.clone(), 150, Duration::from_millis(50), Duration::from_secs(1)).await.unwrap();
    let app = build_router(state);

    let (status, _) = call(app.clone(), "POST", "/v1/get", Some("K2"), serde_json::json!({"key": "k"})).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    source
        .push(format!(
            r#"{{"namespaces":[{{"name":"app","apikey":"K1"}},{{"name":"other","apikey":"K2"}}],"workers":["{worker_addr}"],"dashboard":{{"password":"secret"}}}}"#
        ))
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (status, _) = call(app, "POST", "/v1/get", Some("K2"), serde_json::json!({"key": "k"})).await;
    assert_eq!(status, StatusCode::OK);
}

/// Delete after Set yields a miss; Delete on an absent key is success
/// with existed=false and is not an error.
#[tokio::test]
async fn delete_then_get_is_a_miss_and_repeat_delete_is_not_an_error() {
    let worker_addr = spawn_worker().await;
    let source = InMemoryConfigSource::new(one_namespace_doc(&worker_addr));
    let state = RouterState::build(source, 150, Duration::from_millis(50), Duration::from_secs(1)).await.unwrap();
    let app = build_router(state);

    call(app.clone(), "POST", "/v1/set", Some("K1"), serde_json::json!({"key": "k", "value": "v", "ttl_seconds": 0})).await;
    let (_, body) = call(app.clone(), "POST", "/v1/delete", Some("K1"), serde_json::json!({"key": "k"})).await;
    assert_eq!(body["existed"], true);

    let (_, body) = call(app.clone(), "POST", "/v1/get", Some("K1"), serde_json::json!({"key": "k"})).await;
    assert_eq!(body["found"], false);

    let (status, body) = call(app, "POST", "/v1/delete", Some("K1"), serde_json::json!({"key": "k"})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["existed"], false);
}
