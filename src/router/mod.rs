//! The Router: authenticates client requests, places keys on the ring,
//! fans out to the chosen worker, and hot-swaps its ring and auth table
//! whenever the Subscriber publishes a new configuration snapshot.

pub mod pool;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router as AxumRouter, response::IntoResponse};
use serde::Deserialize;

use crate::config::ConfigSnapshot;
use crate::config::source::ConfigSource;
use crate::config::subscriber::Subscriber;
use crate::error::CacheError;
use crate::metrics::{MetricsSnapshot, NamespaceStats, RouterMetrics, SnapshotBuilder, WorkerStats};
use crate::ratelimit::RateLimiter;
use crate::ring::HashRing;
use crate::wire::{DeleteRequest, DeleteResponse, GetRequest, GetResponse, SetRequest as InternalSetRequest, SetResponse, StatsResponse};

use self::pool::{ChannelState, WorkerChannel, WorkerPool, classify_transport_error};

#[derive(Debug, Default)]
struct NamespaceCounters {
    requests: AtomicU64,
    errors: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// All shared mutable state inside one Router process: the ConfigSnapshot
/// pointer (owned by the Subscriber), the placement ring (atomic pointer,
/// rebuilt from scratch on reload), the worker channel pool (locked map),
/// and per-namespace counters (atomics) — exactly the set the spec's
/// "Global mutable state" note enumerates.
pub struct RouterState {
    subscriber: Arc<Subscriber>,
    ring: ArcSwap<HashRing>,
    pool: Arc<WorkerPool>,
    metrics: RouterMetrics,
    namespace_counters: Mutex<HashMap<String, NamespaceCounters>>,
    rate_limiter: RateLimiter,
    virtual_nodes: u32,
    attempt_timeout: Duration,
    metrics_window_secs: AtomicU64,
    last_metrics_sample: AtomicU64,
}

struct AuthenticatedNamespace {
    name: String,
    rate_limit_qps: Option<u32>,
    default_ttl: Option<u64>,
}

impl RouterState {
    /// Builds the Router and performs the Subscriber's initial load.
    /// Returns the Subscriber's error unchanged if that load fails.
    pub async fn build(
        source: Arc<dyn ConfigSource>,
        virtual_nodes: u32,
        drain_grace: Duration,
        attempt_timeout: Duration,
    ) -> Result<Arc<Self>, CacheError> {
        let subscriber = Arc::new(Subscriber::new(source));
        let pool = Arc::new(WorkerPool::new(drain_grace));

        let state = Arc::new(Self {
            subscriber: subscriber.clone(),
            ring: ArcSwap::from_pointee(HashRing::with_virtual_nodes(virtual_nodes)),
            pool,
            metrics: RouterMetrics::default(),
            namespace_counters: Mutex::new(HashMap::new()),
            rate_limiter: RateLimiter::new(),
            virtual_nodes,
            attempt_timeout,
            metrics_window_secs: AtomicU64::new(5),
            last_metrics_sample: AtomicU64::new(0),
        });

        let reload_state = state.clone();
        subscriber
            .start(move |snapshot: Arc<ConfigSnapshot>| {
                apply_snapshot(&reload_state, &snapshot);
            })
            .await?;

        Ok(state)
    }

    fn record(&self, namespace: &str, elapsed: Duration, failed: bool) {
        self.metrics.record_request(elapsed);
        if failed {
            self.metrics.record_error();
        }
        let mut counters = self.namespace_counters.lock().expect("namespace counters lock poisoned");
        let entry = counters.entry(namespace.to_string()).or_default();
        entry.requests.fetch_add(1, Ordering::Relaxed);
        if failed {
            entry.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_found(&self, namespace: &str, found: bool) {
        let mut counters = self.namespace_counters.lock().expect("namespace counters lock poisoned");
        let entry = counters.entry(namespace.to_string()).or_default();
        if found {
            entry.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            entry.misses.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Applied once on initial load and again on every accepted reconfiguration:
/// rebuild-and-swap the ring, prune channels for removed endpoints, and
/// reconcile rate-limit buckets against the new namespace set.
fn apply_snapshot(state: &Arc<RouterState>, snapshot: &ConfigSnapshot) {
    let ring = HashRing::from_endpoints(&snapshot.workers, state.virtual_nodes);
    state.ring.store(Arc::new(ring));
    state.pool.prune_removed(&snapshot.workers);

    let active: Vec<(String, Option<u32>)> = snapshot.namespaces.iter().map(|ns| (ns.name.clone(), ns.rate_limit_qps)).collect();
    state.rate_limiter.reconcile(&active);

    state.metrics_window_secs.store(snapshot.dashboard.refresh_interval.max(1), Ordering::Relaxed);
}

fn authenticate(state: &RouterState, headers: &HeaderMap) -> Result<AuthenticatedNamespace, CacheError> {
    let api_key = headers.get("x-api-key").and_then(|v| v.to_str().ok()).ok_or(CacheError::Authentication)?;
    let snapshot = state.subscriber.current();
    let ns = snapshot.authenticate(api_key).ok_or(CacheError::Authentication)?;
    Ok(AuthenticatedNamespace {
        name: ns.name.clone(),
        rate_limit_qps: ns.rate_limit_qps,
        default_ttl: ns.default_ttl,
    })
}

#[derive(Debug, Deserialize)]
struct WireError {
    code: String,
    message: String,
}

fn error_from_wire(body: WireError) -> CacheError {
    match body.code.as_str() {
        "UNAUTHENTICATED" => CacheError::Authentication,
        "UNAVAILABLE" => CacheError::Unavailable,
        "RESOURCE_EXHAUSTED" => CacheError::ResourceExhausted(body.message),
        "DEADLINE_EXCEEDED" => CacheError::DeadlineExceeded,
        "INVALID_CONFIG" => CacheError::Config(body.message),
        _ => CacheError::Internal(body.message),
    }
}

async fn attempt<Req, Resp>(channel: &WorkerChannel, path: &str, req: &Req, timeout: Duration) -> Result<Resp, CacheError>
where
    Req: serde::Serialize,
    Resp: serde::de::DeserializeOwned,
{
    let response = channel
        .client
        .post(channel.url(path))
        .json(req)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| classify_transport_error(&channel.endpoint, &e))?;

    if response.status().is_success() {
        response
            .json::<Resp>()
            .await
            .map_err(|e| CacheError::Internal(format!("decoding worker response: {e}")))
    } else {
        let body = response.json::<WireError>().await.unwrap_or(WireError {
            code: "INTERNAL".to_string(),
            message: "malformed worker error body".to_string(),
        });
        Err(error_from_wire(body))
    }
}

async fn attempt_get_stats(channel: &WorkerChannel, timeout: Duration) -> Result<StatsResponse, CacheError> {
    let response = channel
        .client
        .get(channel.url("/internal/stats"))
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| classify_transport_error(&channel.endpoint, &e))?;
    if response.status().is_success() {
        response
            .json::<StatsResponse>()
            .await
            .map_err(|e| CacheError::Internal(format!("decoding worker stats: {e}")))
    } else {
        Err(CacheError::Transport {
            endpoint: channel.endpoint.clone(),
            reason: format!("stats endpoint returned {}", response.status()),
        })
    }
}

/// Fans a request out to `endpoint`, retrying once on a fresh channel if
/// the first attempt fails with a transport error. A second transport
/// failure surfaces as UNAVAILABLE, matching the spec's propagation policy.
async fn forward<Req, Resp>(state: &RouterState, endpoint: &str, path: &str, req: &Req, timeout: Duration) -> Result<Resp, CacheError>
where
    Req: serde::Serialize,
    Resp: serde::de::DeserializeOwned,
{
    let channel = state.pool.channel_for(endpoint);
    match attempt(&channel, path, req, timeout).await {
        Ok(resp) => Ok(resp),
        Err(CacheError::Transport { .. }) => {
            channel.mark_broken();
            let fresh = state.pool.channel_for(endpoint);
            attempt(&fresh, path, req, timeout).await.map_err(|e| match e {
                CacheError::Transport { .. } => CacheError::Unavailable,
                other => other,
            })
        }
        Err(other) => Err(other),
    }
}

fn place(state: &RouterState, prefixed_key: &str) -> Result<String, CacheError> {
    state.ring.load().place(prefixed_key).ok_or(CacheError::Unavailable)
}

fn check_rate_limit(state: &RouterState, ns: &AuthenticatedNamespace) -> Result<(), CacheError> {
    if state.rate_limiter.check(&ns.name, ns.rate_limit_qps) {
        Ok(())
    } else {
        Err(CacheError::ResourceExhausted(format!("namespace {} exceeded its rate limit", ns.name)))
    }
}

async fn handle_get(State(state): State<Arc<RouterState>>, headers: HeaderMap, Json(req): Json<GetRequest>) -> Result<Json<GetResponse>, CacheError> {
    let start = Instant::now();
    let ns = authenticate(&state, &headers)?;
    check_rate_limit(&state, &ns)?;
    let prefixed = format!("{}:{}", ns.name, req.key);
    let endpoint = place(&state, &prefixed)?;

    let result = forward::<GetRequest, GetResponse>(&state, &endpoint, "/internal/get", &GetRequest { key: prefixed }, state.attempt_timeout).await;
    state.record(&ns.name, start.elapsed(), result.is_err());
    if let Ok(resp) = &result {
        state.record_found(&ns.name, resp.found);
    }
    result.map(Json)
}

#[derive(Debug, Deserialize)]
struct ClientSetRequest {
    key: String,
    value: String,
    #[serde(default)]
    ttl_seconds: Option<u64>,
}

async fn handle_set(State(state): State<Arc<RouterState>>, headers: HeaderMap, Json(req): Json<ClientSetRequest>) -> Result<Json<SetResponse>, CacheError> {
    let start = Instant::now();
    let ns = authenticate(&state, &headers)?;
    check_rate_limit(&state, &ns)?;
    let prefixed = format!("{}:{}", ns.name, req.key);
    let endpoint = place(&state, &prefixed)?;
    let ttl_seconds = req.ttl_seconds.unwrap_or_else(|| ns.default_ttl.unwrap_or(0));

    let internal_req = InternalSetRequest { key: prefixed, value: req.value, ttl_seconds };
    let result = forward::<InternalSetRequest, SetResponse>(&state, &endpoint, "/internal/set", &internal_req, state.attempt_timeout).await;
    state.record(&ns.name, start.elapsed(), result.is_err());
    result.map(Json)
}

async fn handle_delete(State(state): State<Arc<RouterState>>, headers: HeaderMap, Json(req): Json<DeleteRequest>) -> Result<Json<DeleteResponse>, CacheError> {
    let start = Instant::now();
    let ns = authenticate(&state, &headers)?;
    check_rate_limit(&state, &ns)?;
    let prefixed = format!("{}:{}", ns.name, req.key);
    let endpoint = place(&state, &prefixed)?;

    let result = forward::<DeleteRequest, DeleteResponse>(&state, &endpoint, "/internal/delete", &DeleteRequest { key: prefixed }, state.attempt_timeout).await;
    state.record(&ns.name, start.elapsed(), result.is_err());
    result.map(Json)
}

async fn handle_healthz() -> StatusCode {
    StatusCode::OK
}

#[derive(Debug, Deserialize)]
struct MetricsQuery {
    namespace: Option<String>,
}

async fn build_snapshot(state: &Arc<RouterState>, namespace_filter: Option<&str>) -> MetricsSnapshot {
    let config = state.subscriber.current();

    let mut workers = Vec::with_capacity(config.workers.len());
    for endpoint in &config.workers {
        let channel = state.pool.channel_for(endpoint);
        match attempt_get_stats(&channel, state.attempt_timeout).await {
            Ok(stats) => {
                let total = stats.hits + stats.misses;
                workers.push(WorkerStats {
                    endpoint: endpoint.clone(),
                    healthy: channel.state() == ChannelState::Ready,
                    key_count: stats.size,
                    memory_bytes: stats.memory_bytes,
                    memory_limit_mb: stats.max_memory_mb,
                    hit_rate: if total == 0 { 0.0 } else { stats.hits as f64 / total as f64 },
                    hits: stats.hits,
                    misses: stats.misses,
                    uptime_seconds: stats.uptime_seconds,
                });
            }
            Err(_) => {
                channel.mark_broken();
                workers.push(WorkerStats {
                    endpoint: endpoint.clone(),
                    healthy: false,
                    key_count: 0,
                    memory_bytes: 0,
                    memory_limit_mb: None,
                    hit_rate: 0.0,
                    hits: 0,
                    misses: 0,
                    uptime_seconds: 0,
                });
            }
        }
    }

    let namespaces: Vec<NamespaceStats> = {
        let counters = state.namespace_counters.lock().expect("namespace counters lock poisoned");
        config
            .namespaces
            .iter()
            .filter(|ns| namespace_filter.map(|f| f == ns.name).unwrap_or(true))
            .map(|ns| {
                let (requests, hits, misses) = counters
                    .get(&ns.name)
                    .map(|c| (c.requests.load(Ordering::Relaxed), c.hits.load(Ordering::Relaxed), c.misses.load(Ordering::Relaxed)))
                    .unwrap_or((0, 0, 0));
                let total = hits + misses;
                let window = state.metrics_window_secs.load(Ordering::Relaxed).max(1) as f64;
                NamespaceStats {
                    name: ns.name.clone(),
                    key_count: 0,
                    hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
                    qps: requests as f64 / window,
                    memory_bytes: 0,
                    max_memory_mb: ns.max_memory_mb,
                    max_keys: ns.max_keys,
                }
            })
            .collect()
    };

    let total_now = state.metrics.requests.load(Ordering::Relaxed);
    let previous = state.last_metrics_sample.swap(total_now, Ordering::Relaxed);
    let window_requests = total_now.saturating_sub(previous);
    let window_seconds = state.metrics_window_secs.load(Ordering::Relaxed).max(1) as f64;

    SnapshotBuilder::build(&state.metrics, namespaces, workers, window_requests, window_seconds)
}

async fn handle_metrics_stream(State(state): State<Arc<RouterState>>, Query(params): Query<MetricsQuery>) -> impl IntoResponse {
    let stream = futures::stream::unfold((state, params.namespace, true), |(state, filter, first)| async move {
        if !first {
            let window = Duration::from_secs(state.metrics_window_secs.load(Ordering::Relaxed).max(1));
            tokio::time::sleep(window).await;
        }
        let snapshot = build_snapshot(&state, filter.as_deref()).await;
        let mut line = serde_json::to_vec(&snapshot).unwrap_or_default();
        line.push(b'\n');
        Some((Ok::<_, std::convert::Infallible>(axum::body::Bytes::from(line)), (state, filter, false)))
    });

    axum::response::Response::builder()
        .header("content-type", "application/x-ndjson")
        .body(axum::body::Body::from_stream(stream))
        .expect("response builder with a fixed header set never fails")
}

pub fn build_router(state: Arc<RouterState>) -> AxumRouter {
    AxumRouter::new()
        .route("/v1/get", post(handle_get))
        .route("/v1/set", post(handle_set))
        .route("/v1/delete", post(handle_delete))
        .route("/healthz", get(handle_healthz))
        .route("/v1/metrics/stream", get(handle_metrics_stream))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::source::InMemoryConfigSource;
    use crate::store::{ResourceCaps, TtlStore};
    use crate::worker;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn spawn_worker() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = worker::build_router(Arc::new(TtlStore::new()), ResourceCaps::default());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr.to_string()
    }

    fn config_doc(worker_addr: &str) -> String {
        format!(
            r#"{{"namespaces":[{{"name":"app","apikey":"K1"}},{{"name":"other","apikey":"K2"}}],"workers":["{worker_addr}"],"dashboard":{{"password":"secret","refreshInterval":5}}}}"#
        )
    }

    async fn build_test_router(worker_addr: &str) -> AxumRouter {
        let source = InMemoryConfigSource::new(config_doc(worker_addr));
        let state = RouterState::build(source, 150, Duration::from_millis(50), Duration::from_secs(1)).await.unwrap();
        build_router(state)
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

    #[tokio::test]
    async fn scenario_1_basic_set_get_and_unknown_key() {
        let worker_addr = spawn_worker().await;
        let app = build_test_router(&worker_addr).await;

        let (status, body) = call(app.clone(), "POST", "/v1/set", Some("K1"), serde_json::json!({"key": "user:1", "value": "Alice", "ttl_seconds": 60})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);

        let (status, body) = call(app.clone(), "POST", "/v1/get", Some("K1"), serde_json::json!({"key": "user:1"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["found"], true);
        assert_eq!(body["value"], "Alice");

        let (status, _) = call(app, "POST", "/v1/get", Some("K2-unknown"), serde_json::json!({"key": "user:1"})).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn scenario_3_namespace_isolation() {
        let worker_addr = spawn_worker().await;
        let app = build_test_router(&worker_addr).await;

        call(app.clone(), "POST", "/v1/set", Some("K1"), serde_json::json!({"key": "k", "value": "va", "ttl_seconds": 0})).await;
        let (_, body) = call(app.clone(), "POST", "/v1/get", Some("K2"), serde_json::json!({"key": "k"})).await;
        assert_eq!(body["found"], false);

        call(app.clone(), "POST", "/v1/set", Some("K2"), serde_json::json!({"key": "k", "value": "vb", "ttl_seconds": 0})).await;
        let (_, body) = call(app, "POST", "/v1/get", Some("K1"), serde_json::json!({"key": "k"})).await;
        assert_eq!(body["found"], true);
        assert_eq!(body["value"], "va");
    }

    #[tokio::test]
    async fn missing_api_key_is_unauthenticated() {
        let worker_addr = spawn_worker().await;
        let app = build_test_router(&worker_addr).await;
        let (status, _) = call(app, "POST", "/v1/get", None, serde_json::json!({"key": "k"})).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn empty_worker_set_yields_unavailable() {
        let source = InMemoryConfigSource::new(r#"{"namespaces":[{"name":"app","apikey":"K1"}],"workers":[],"dashboard":{"password":"secret"}}"#);
        let state = RouterState::build(source, 150, Duration::from_millis(50), Duration::from_secs(1)).await.unwrap();
        let app = build_router(state);
        let (status, _) = call(app, "POST", "/v1/get", Some("K1"), serde_json::json!({"key": "k"})).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn healthz_is_exempt_from_authentication() {
        let worker_addr = spawn_worker().await;
        let app = build_test_router(&worker_addr).await;
        let (status, _) = call(app, "GET", "/healthz", None, serde_json::Value::Null).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_stream_bootstraps_within_a_tick() {
        let worker_addr = spawn_worker().await;
        let source = InMemoryConfigSource::new(config_doc(&worker_addr));
        let state = RouterState::build(source, 150, Duration::from_millis(50), Duration::from_secs(1)).await.unwrap();
        let app = build_router(state);

        let request = Request::builder().method("GET").uri("/v1/metrics/stream").body(Body::empty()).unwrap();
        let response = tokio::time::timeout(Duration::from_millis(200), app.oneshot(request)).await.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let mut body = response.into_body().into_data_stream();
        use futures::StreamExt;
        let first_chunk = tokio::time::timeout(Duration::from_millis(150), body.next()).await.unwrap();
        assert!(first_chunk.is_some());
    }
}
