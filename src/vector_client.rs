//! Vector client: proxy to the warm vector server, with a direct in-process
//! fallback when the server is down.
//!
//! Connection-refused and timeout both mean "service absent"; callers get
//! the same answers computed locally, just colder.

use crate::config::KgConfig;
use crate::embedder::get_embedder;
use crate::error::{KgError, KgResult};
use crate::index::Index;
use crate::vector::cosine_top_k;
use serde_json::{json, Value};
use std::time::Duration;

/// Deadline for every vector-server RPC.
const RPC_TIMEOUT: Duration = Duration::from_secs(5);

fn agent() -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(RPC_TIMEOUT)
        .timeout(RPC_TIMEOUT)
        .build()
}

/// POST JSON. `Ok(None)` when the server is unreachable; an HTTP error
/// status from a live server is a real failure.
fn post(url: &str, body: Value) -> KgResult<Option<Value>> {
    match agent().post(url).send_json(body) {
        Ok(resp) => {
            let value: Value = resp
                .into_json()
                .map_err(|e| KgError::Transient(format!("vector server response: {e}")))?;
            Ok(Some(value))
        }
        Err(ureq::Error::Status(code, resp)) => Err(KgError::Transient(format!(
            "vector server {code}: {}",
            resp.into_string().unwrap_or_default()
        ))),
        // Transport errors: connection refused, timeout, dns.
        Err(_) => Ok(None),
    }
}

/// True when the vector server answers its health check.
pub fn is_server_running(cfg: &KgConfig) -> bool {
    let url = format!("{}/health", cfg.vector_server_url());
    match agent().get(&url).call() {
        Ok(resp) => resp
            .into_json::<Value>()
            .map(|v| v.get("status").and_then(Value::as_str) == Some("ok"))
            .unwrap_or(false),
        Err(_) => false,
    }
}

/// Embed texts via the server (fast) or the local embedder (fallback).
pub fn embed(
    texts: &[String],
    cfg: &KgConfig,
    context: &str,
    task_type: &str,
) -> KgResult<Vec<Vec<f32>>> {
    let url = format!("{}/embed", cfg.vector_server_url());
    let body = json!({"texts": texts, "context": context, "task_type": task_type});
    if let Some(resp) = post(&url, body)? {
        let vectors = resp
            .get("vectors")
            .and_then(Value::as_array)
            .ok_or_else(|| KgError::Transient("vector server returned no vectors".into()))?;
        return vectors
            .iter()
            .map(|v| {
                v.as_array()
                    .map(|a| {
                        a.iter()
                            .filter_map(|x| x.as_f64().map(|f| f as f32))
                            .collect::<Vec<f32>>()
                    })
                    .ok_or_else(|| KgError::Transient("malformed vector in response".into()))
            })
            .collect();
    }

    // Fallback: compute directly.
    let embedder = get_embedder(&cfg.embedding_model, &cfg.embedding_cache_dir())?;
    if task_type == "query" {
        texts.iter().map(|t| embedder.embed_query(t)).collect()
    } else {
        let contexts = vec![context.to_string(); texts.len()];
        embedder.embed_batch(texts, Some(&contexts))
    }
}

/// Semantic search: embed the query, then find nearest node vectors.
/// Returns (node_slug, score) sorted by score descending.
pub fn search_vector(query_text: &str, cfg: &KgConfig, k: usize) -> KgResult<Vec<(String, f32)>> {
    let query_vec = embed(&[query_text.to_string()], cfg, "", "query")?
        .into_iter()
        .next()
        .ok_or_else(|| KgError::Transient("failed to embed query".into()))?;

    let url = format!("{}/search", cfg.vector_server_url());
    if let Some(resp) = post(&url, json!({"vector": query_vec, "k": k}))? {
        let results = resp
            .get("results")
            .and_then(Value::as_array)
            .ok_or_else(|| KgError::Transient("vector server returned no results".into()))?;
        return Ok(results
            .iter()
            .filter_map(|r| {
                let id = r.get("id")?.as_str()?.to_string();
                let score = r.get("score")?.as_f64()? as f32;
                Some((id, score))
            })
            .collect());
    }

    // Fallback: brute-force cosine over the persisted embeddings.
    let db = Index::new(cfg.db_path());
    let rows = db.load_embeddings(&cfg.embedding_model)?;
    Ok(cosine_top_k(&query_vec, &rows, k))
}

/// Push one vector into the running server. Best-effort: a missing server is
/// fine, the warm matrix will be replayed from the index on its next boot.
pub fn push_vector(cfg: &KgConfig, id: &str, vector: &[f32]) -> bool {
    let url = format!("{}/add", cfg.vector_server_url());
    matches!(post(&url, json!({"id": id, "vector": vector})), Ok(Some(_)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_cfg(dir: &std::path::Path) -> KgConfig {
        let mut cfg = crate::config::load_config(Some(dir)).unwrap();
        cfg.embedding_model = "stub:8".to_string();
        // A port nothing listens on: every call exercises the fallback.
        cfg.vector_port = 1;
        cfg
    }

    #[test]
    fn embed_falls_back_when_server_absent() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = offline_cfg(dir.path());
        let out = embed(&["hello".to_string()], &cfg, "", "query").unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].len(), 8);
    }

    #[test]
    fn search_falls_back_to_db_vectors() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = offline_cfg(dir.path());
        let store = crate::store::NodeStore::new(&cfg.nodes_dir);
        let db = Index::new(cfg.db_path());

        store.add_bullet("close", "rust ownership", "fact", None).unwrap();
        db.reindex_node("close", &store).unwrap();

        let embedder = get_embedder("stub:8", &cfg.embedding_cache_dir()).unwrap();
        let v = embedder.embed_document("rust ownership", "").unwrap();
        db.upsert_embedding("close", &v, "stub:8").unwrap();

        let hits = search_vector("rust ownership", &cfg, 5).unwrap();
        assert_eq!(hits[0].0, "close");
    }

    #[test]
    fn absent_server_reports_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = offline_cfg(dir.path());
        assert!(!is_server_running(&cfg));
        assert!(!push_vector(&cfg, "x", &[1.0]));
    }
}
