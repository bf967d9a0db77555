//! Score calibration: map raw FTS and cosine scores onto [0, 1] quantiles.
//!
//! Raw BM25 ranks and raw cosine similarities live on incomparable scales,
//! so blending them directly is meaningless. Calibration samples real
//! bullets, replays searches with them, and records 21 quantile breakpoints
//! per scorer. `score_to_quantile` then lands any raw score on [0, 1].

use crate::config::KgConfig;
use crate::error::KgResult;
use crate::index::Index;
use crate::vector_client;
use tracing::{debug, info};

/// Minimum observations before a scorer gets calibrated.
const MIN_SCORES: usize = 20;
/// Hits fetched per probe query.
const PROBE_K: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub enum ScorerStatus {
    Calibrated { scores: usize },
    Skipped { scores: usize },
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct CalibrationReport {
    pub fts: ScorerStatus,
    pub vector: ScorerStatus,
}

/// Sample up to `sample_size` bullets, probe both scorers with each sample's
/// own text, and persist per-scorer quantile breakpoints when enough
/// non-self scores were observed.
pub fn calibrate(cfg: &KgConfig, db: &Index, sample_size: usize) -> KgResult<CalibrationReport> {
    let samples = db.sample_bullets(sample_size)?;
    let bullet_count = db.bullet_count()?;

    let mut fts_scores: Vec<f32> = Vec::new();
    let mut vec_scores: Vec<f32> = Vec::new();
    let mut vector_error: Option<String> = None;

    for (bullet_id, slug, text) in &samples {
        // Lexical probe: the sample's own text as the query. Raw score is
        // the negated rank (higher = better). Exact self-matches excluded.
        for hit in db.search_fts(text, PROBE_K)? {
            if &hit.bullet_id != bullet_id {
                fts_scores.push(-hit.rank as f32);
            }
        }

        // Vector probe, skipped for the rest of the run on the first
        // transient failure (no embedder available, etc.).
        if vector_error.is_none() {
            match vector_client::search_vector(text, cfg, PROBE_K) {
                Ok(hits) => {
                    for (hit_slug, score) in hits {
                        if &hit_slug != slug {
                            vec_scores.push(score);
                        }
                    }
                }
                Err(e) => {
                    debug!(error = %e, "vector probe failed during calibration");
                    vector_error = Some(e.to_string());
                }
            }
        }
    }

    let fts = persist_scorer(db, "fts", &mut fts_scores, bullet_count)?;
    let vector = match vector_error {
        Some(e) if vec_scores.len() < MIN_SCORES => ScorerStatus::Failed(e),
        _ => persist_scorer(db, "vector", &mut vec_scores, bullet_count)?,
    };

    info!(?fts, ?vector, samples = samples.len(), "calibration finished");
    Ok(CalibrationReport { fts, vector })
}

fn persist_scorer(
    db: &Index,
    scorer: &str,
    scores: &mut Vec<f32>,
    bullet_count: i64,
) -> KgResult<ScorerStatus> {
    if scores.len() < MIN_SCORES {
        return Ok(ScorerStatus::Skipped {
            scores: scores.len(),
        });
    }
    scores.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let breakpoints = quantile_breakpoints(scores);
    db.set_calibration(scorer, &breakpoints, bullet_count)?;
    Ok(ScorerStatus::Calibrated {
        scores: scores.len(),
    })
}

/// 21 evenly spaced quantile breakpoints over a sorted score list.
fn quantile_breakpoints(sorted: &[f32]) -> Vec<f32> {
    let n = sorted.len();
    (0..=20)
        .map(|i| {
            let pos = ((n - 1) as f64 * i as f64 / 20.0).round() as usize;
            sorted[pos]
        })
        .collect()
}

/// Map a raw score onto [0, 1]: `i/20` for the largest `i` with
/// `breakpoints[i] <= x`, saturating at both endpoints.
pub fn score_to_quantile(x: f32, breakpoints: &[f32]) -> f32 {
    if breakpoints.is_empty() {
        return 0.0;
    }
    if x < breakpoints[0] {
        return 0.0;
    }
    let mut best = 0usize;
    for (i, b) in breakpoints.iter().enumerate() {
        if *b <= x {
            best = i;
        }
    }
    (best as f32 / 20.0).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NodeStore;

    #[test]
    fn quantile_lookup_saturates() {
        let breaks: Vec<f32> = (0..=20).map(|i| i as f32).collect();
        assert_eq!(score_to_quantile(-5.0, &breaks), 0.0);
        assert_eq!(score_to_quantile(0.0, &breaks), 0.0);
        assert_eq!(score_to_quantile(10.0, &breaks), 0.5);
        assert_eq!(score_to_quantile(10.5, &breaks), 0.5);
        assert_eq!(score_to_quantile(20.0, &breaks), 1.0);
        assert_eq!(score_to_quantile(999.0, &breaks), 1.0);
    }

    #[test]
    fn breakpoints_span_the_sorted_list() {
        let sorted: Vec<f32> = (0..100).map(|i| i as f32).collect();
        let breaks = quantile_breakpoints(&sorted);
        assert_eq!(breaks.len(), 21);
        assert_eq!(breaks[0], 0.0);
        assert_eq!(breaks[20], 99.0);
        assert!(breaks.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn calibrate_persists_fts_when_enough_scores() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = crate::config::load_config(Some(dir.path())).unwrap();
        cfg.embedding_model = "stub:8".to_string();
        cfg.vector_port = 1;

        let store = NodeStore::new(&cfg.nodes_dir);
        let db = Index::new(cfg.db_path());

        // Many nodes sharing vocabulary, so every probe sees other bullets.
        for i in 0..12 {
            let slug = format!("node-{i:02}");
            store
                .add_bullet(&slug, "rust ownership and borrowing rules", "fact", None)
                .unwrap();
            store
                .add_bullet(&slug, "ownership moves values between scopes", "fact", None)
                .unwrap();
            db.reindex_node(&slug, &store).unwrap();
        }

        let report = calibrate(&cfg, &db, 50).unwrap();
        assert!(matches!(report.fts, ScorerStatus::Calibrated { .. }));

        let cal = db.get_calibration("fts").unwrap().unwrap();
        assert_eq!(cal.breakpoints.len(), 21);
        assert_eq!(cal.ops_since, 0);
        assert_eq!(cal.bullet_count, db.bullet_count().unwrap());
    }

    #[test]
    fn calibrate_skips_sparse_scorers() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = crate::config::load_config(Some(dir.path())).unwrap();
        cfg.embedding_model = "stub:8".to_string();
        cfg.vector_port = 1;

        let store = NodeStore::new(&cfg.nodes_dir);
        let db = Index::new(cfg.db_path());
        store.add_bullet("only", "singular text", "fact", None).unwrap();
        db.reindex_node("only", &store).unwrap();

        let report = calibrate(&cfg, &db, 10).unwrap();
        assert!(matches!(report.fts, ScorerStatus::Skipped { .. }));
        assert!(db.get_calibration("fts").unwrap().is_none());
    }
}
