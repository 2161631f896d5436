//! The Storage Worker's HTTP surface: unary Get/Set/Delete/Stats RPCs
//! served over a single `axum` router, backed by one [`TtlStore`].
//!
//! Grounded in the teacher's `server::pg_server::PostgresServer` for the
//! listener/accept-loop shape, generalized from a raw `TcpListener` loop to
//! an `axum::serve` router since the wire protocol here is HTTP+JSON, not
//! pgwire.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, response::IntoResponse};
use tower_http::trace::TraceLayer;

use crate::error::CacheError;
use crate::store::{ResourceCaps, TtlStore};
use crate::wire::{DeleteRequest, DeleteResponse, GetRequest, GetResponse, SetRequest, SetResponse, StatsResponse};

pub struct AppState {
    pub store: Arc<TtlStore>,
    pub caps: ResourceCaps,
}

/// Builds the worker's router. `/internal/*` is the Router-facing data
/// plane; `/healthz` is the liveness probe consumed by the orchestrator.
pub fn build_router(store: Arc<TtlStore>, caps: ResourceCaps) -> Router {
    let state = Arc::new(AppState { store, caps });
    Router::new()
        .route("/internal/get", post(handle_get))
        .route("/internal/set", post(handle_set))
        .route("/internal/delete", post(handle_delete))
        .route("/internal/stats", get(handle_stats))
        .route("/healthz", get(handle_healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_get(State(state): State<Arc<AppState>>, Json(req): Json<GetRequest>) -> impl IntoResponse {
    let (value, found, ttl_remaining) = state.store.get(&req.key).await;
    Json(GetResponse { found, value, ttl_remaining })
}

async fn handle_set(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SetRequest>,
) -> Result<Json<SetResponse>, CacheError> {
    state.store.set(req.key, req.value, req.ttl_seconds).await?;
    Ok(Json(SetResponse { ok: true }))
}

async fn handle_delete(State(state): State<Arc<AppState>>, Json(req): Json<DeleteRequest>) -> impl IntoResponse {
    let existed = state.store.delete(&req.key).await;
    Json(DeleteResponse { existed })
}

async fn handle_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (hits, misses, sets, deletes) = state.store.stats();
    Json(StatsResponse {
        size: state.store.size().await,
        hits,
        misses,
        sets,
        deletes,
        uptime_seconds: state.store.uptime().as_secs(),
        memory_bytes: state.store.memory_bytes().await,
        max_memory_mb: state.caps.max_memory_bytes.map(|b| b / (1024 * 1024)),
        max_keys: state.caps.max_keys,
    })
}

async fn handle_healthz() -> StatusCode {
    StatusCode::OK
}

/// Serves `router` on `addr` until `shutdown` resolves, then waits up to
/// `grace` for in-flight requests before returning. Mirrors the worker
/// shutdown contract: stop accepting, drain briefly, discard the store.
pub async fn serve_with_graceful_shutdown(
    router: Router,
    addr: std::net::SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    grace: Duration,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "storage worker listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown.await;
            tracing::info!(grace_seconds = grace.as_secs(), "shutdown signal received, draining");
        })
        .await
}
