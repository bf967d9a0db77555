//! Vector server: keeps the embedding model and the in-memory matrix warm.
//!
//! Runs as a long-lived daemon next to the watcher. Endpoints:
//!
//! ```text
//! GET  /health     → {"status": "ok", "n_vectors": N}
//! POST /embed      → {"vectors": [[f32, ...]]}
//! POST /search     → {"results": [{"id": str, "score": f32}]}
//! POST /add        → {"ok": true}
//! POST /add_batch  → {"ok": true, "n": N}
//! ```
//!
//! On startup the matrix is replayed from the index's `embeddings` table;
//! after that, watchers and the facade push updates via `/add`.

use crate::config::KgConfig;
use crate::embedder::{get_embedder, CachedEmbedder};
use crate::error::{KgError, KgResult};
use crate::index::Index;
use crate::vector::VectorIndex;
use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Clone)]
pub struct VectorServiceState {
    pub index: Arc<VectorIndex>,
    pub embedder: Arc<CachedEmbedder>,
}

#[derive(Debug, Deserialize)]
pub struct EmbedRequest {
    pub texts: Vec<String>,
    #[serde(default)]
    pub context: String,
    #[serde(default = "default_task_type")]
    pub task_type: String,
}

fn default_task_type() -> String {
    "doc".to_string()
}

#[derive(Debug, Serialize)]
pub struct EmbedResponse {
    pub vectors: Vec<Vec<f32>>,
}

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub vector: Vec<f32>,
    #[serde(default = "default_k")]
    pub k: usize,
}

fn default_k() -> usize {
    20
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: String,
    pub score: f32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
pub struct AddRequest {
    pub id: String,
    pub vector: Vec<f32>,
}

#[derive(Debug, Deserialize)]
pub struct AddBatchRequest {
    pub ids: Vec<String>,
    pub vectors: Vec<Vec<f32>>,
}

pub fn create_app(state: VectorServiceState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/embed", post(embed))
        .route("/search", post(search))
        .route("/add", post(add))
        .route("/add_batch", post(add_batch))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<VectorServiceState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "n_vectors": state.index.len(),
    }))
}

async fn embed(
    State(state): State<VectorServiceState>,
    Json(req): Json<EmbedRequest>,
) -> KgResult<Json<EmbedResponse>> {
    if req.texts.is_empty() {
        return Err(KgError::Invalid("texts must be a non-empty list".into()));
    }

    // The embedder blocks (ONNX inference or a sync HTTP call).
    let embedder = state.embedder.clone();
    let vectors = tokio::task::spawn_blocking(move || -> KgResult<Vec<Vec<f32>>> {
        if req.task_type == "query" {
            req.texts.iter().map(|t| embedder.embed_query(t)).collect()
        } else {
            let contexts = vec![req.context.clone(); req.texts.len()];
            embedder.embed_batch(&req.texts, Some(&contexts))
        }
    })
    .await
    .map_err(|e| KgError::Transient(format!("embed task failed: {e}")))??;

    Ok(Json(EmbedResponse { vectors }))
}

async fn search(
    State(state): State<VectorServiceState>,
    Json(req): Json<SearchRequest>,
) -> KgResult<Json<SearchResponse>> {
    if req.vector.is_empty() {
        return Err(KgError::Invalid("vector must be a non-empty list".into()));
    }
    let results = state
        .index
        .search(&req.vector, req.k)?
        .into_iter()
        .map(|(id, score)| SearchResult { id, score })
        .collect();
    Ok(Json(SearchResponse { results }))
}

async fn add(
    State(state): State<VectorServiceState>,
    Json(req): Json<AddRequest>,
) -> KgResult<Json<Value>> {
    if req.id.is_empty() {
        return Err(KgError::Invalid("id must be a non-empty string".into()));
    }
    state.index.add(&req.id, &req.vector)?;
    Ok(Json(json!({"ok": true})))
}

async fn add_batch(
    State(state): State<VectorServiceState>,
    Json(req): Json<AddBatchRequest>,
) -> KgResult<Json<Value>> {
    let n = req.ids.len();
    state.index.add_batch(&req.ids, &req.vectors)?;
    Ok(Json(json!({"ok": true, "n": n})))
}

/// Build state, warm the matrix from graph.db, then serve until terminated.
pub async fn run_vector_server(cfg: &KgConfig) -> anyhow::Result<()> {
    let embedder = get_embedder(&cfg.embedding_model, &cfg.embedding_cache_dir())?;
    let vectors = Arc::new(VectorIndex::new());

    let db = Index::new(cfg.db_path());
    let rows = db.load_embeddings(&cfg.embedding_model)?;
    if !rows.is_empty() {
        let (ids, vecs): (Vec<String>, Vec<Vec<f32>>) = rows.into_iter().unzip();
        vectors.add_batch(&ids, &vecs)?;
    }
    info!(n_vectors = vectors.len(), "vector index warmed from graph.db");

    let state = VectorServiceState {
        index: vectors,
        embedder: Arc::new(embedder),
    };
    let app = create_app(state);

    let addr: SocketAddr = format!("127.0.0.1:{}", cfg.vector_port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("vector-server listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("Received Ctrl+C, shutting down"); },
        _ = terminate => { info!("Received terminate signal, shutting down"); },
    }
}
