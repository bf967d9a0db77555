//! Cross-encoder reranking with an embedding-cosine fallback.
//!
//! The fallback chain is explicit and transparent to callers: try the
//! cross-encoder, then query-document cosine on fresh embeddings, and as a
//! last resort return the input order with zero scores.

use crate::config::KgConfig;
use crate::error::{KgError, KgResult};
use crate::vector_client;
use fastembed::{RerankInitOptions, RerankerModel, TextRerank};
use std::sync::Mutex;
use tracing::debug;

/// Loaded-once cross-encoder handle. Owned by the application context (the
/// facade), not a process global.
pub struct Reranker {
    model_name: String,
    /// `None` = not tried yet; `Some(None)` = tried and unavailable.
    encoder: Mutex<Option<Option<TextRerank>>>,
}

impl Reranker {
    pub fn new(model_name: &str) -> Self {
        Self {
            model_name: model_name.to_string(),
            encoder: Mutex::new(None),
        }
    }

    /// Score (id, text) pairs by relevance to `query`. Best-first.
    pub fn rerank(
        &self,
        query: &str,
        candidates: &[(String, String)],
        cfg: &KgConfig,
    ) -> Vec<(String, f32)> {
        if candidates.is_empty() {
            return Vec::new();
        }

        match self.cross_encoder_scores(query, candidates) {
            Ok(Some(scored)) => return sorted_desc(scored),
            Ok(None) => {}
            Err(e) => debug!(error = %e, "cross-encoder rerank failed, falling back"),
        }

        match self.cosine_scores(query, candidates, cfg) {
            Ok(scored) => return sorted_desc(scored),
            Err(e) => debug!(error = %e, "cosine rerank failed, keeping input order"),
        }

        candidates.iter().map(|(id, _)| (id.clone(), 0.0)).collect()
    }

    /// `Ok(None)` means the cross-encoder is not applicable (model missing or
    /// failed to initialize); the orchestrator moves on.
    fn cross_encoder_scores(
        &self,
        query: &str,
        candidates: &[(String, String)],
    ) -> KgResult<Option<Vec<(String, f32)>>> {
        let mut guard = self
            .encoder
            .lock()
            .map_err(|e| KgError::Transient(format!("reranker lock poisoned: {e}")))?;

        if guard.is_none() {
            let variant = TextRerank::list_supported_models()
                .into_iter()
                .find(|m| m.model_code == self.model_name)
                .map(|m| m.model);
            let loaded = variant.and_then(|v| {
                TextRerank::try_new(RerankInitOptions::new(v).with_show_download_progress(false))
                    .map_err(|e| {
                        debug!(model = %self.model_name, error = %e, "cross-encoder unavailable");
                        e
                    })
                    .ok()
            });
            *guard = Some(loaded);
        }

        let encoder = match guard.as_mut() {
            Some(Some(encoder)) => encoder,
            _ => return Ok(None),
        };

        let documents: Vec<&str> = candidates.iter().map(|(_, text)| text.as_str()).collect();
        let results = encoder
            .rerank(query, documents, false, None)
            .map_err(|e| KgError::Transient(format!("rerank: {e}")))?;

        let mut scored = vec![(String::new(), 0.0f32); candidates.len()];
        for r in results {
            scored[r.index] = (candidates[r.index].0.clone(), r.score);
        }
        Ok(Some(scored))
    }

    fn cosine_scores(
        &self,
        query: &str,
        candidates: &[(String, String)],
        cfg: &KgConfig,
    ) -> KgResult<Vec<(String, f32)>> {
        let texts: Vec<String> = candidates.iter().map(|(_, t)| t.clone()).collect();
        let q_vec = vector_client::embed(&[query.to_string()], cfg, "", "query")?
            .into_iter()
            .next()
            .ok_or_else(|| KgError::Transient("failed to embed rerank query".into()))?;
        let t_vecs = vector_client::embed(&texts, cfg, "", "doc")?;

        let n_q = l2(&q_vec);
        Ok(candidates
            .iter()
            .zip(&t_vecs)
            .map(|((id, _), tv)| {
                let n_t = l2(tv);
                let score = if n_q > 0.0 && n_t > 0.0 {
                    dot(&q_vec, tv) / (n_q * n_t)
                } else {
                    0.0
                };
                (id.clone(), score)
            })
            .collect())
    }
}

fn l2(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn sorted_desc(mut scored: Vec<(String, f32)>) -> Vec<(String, f32)> {
    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    scored
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_cfg(dir: &std::path::Path) -> KgConfig {
        let mut cfg = crate::config::load_config(Some(dir)).unwrap();
        cfg.embedding_model = "stub:8".to_string();
        cfg.vector_port = 1;
        cfg.search.reranker_model = "no-such-model".to_string();
        cfg
    }

    #[test]
    fn empty_candidates_yield_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = offline_cfg(dir.path());
        let r = Reranker::new(&cfg.search.reranker_model);
        assert!(r.rerank("q", &[], &cfg).is_empty());
    }

    #[test]
    fn cosine_fallback_prefers_matching_text() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = offline_cfg(dir.path());
        let r = Reranker::new(&cfg.search.reranker_model);

        // The stub embedder hashes text, so an exact match has cosine 1.
        let candidates = vec![
            ("other".to_string(), "unrelated words".to_string()),
            ("exact".to_string(), "rust ownership".to_string()),
        ];
        let ranked = r.rerank("rust ownership", &candidates, &cfg);
        assert_eq!(ranked[0].0, "exact");
        assert!(ranked[0].1 > ranked[1].1);
    }
}
