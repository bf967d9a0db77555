//! The retrieval facade: one per-project object bundling the store, the
//! derived index, the context builder, the calibrator, and daemon controls.
//! The CLI, the MCP tool server, and the web viewer all call through here.
//!
//! Mutating operations (`add_bullet`, `mark_reviewed`) reindex the node
//! synchronously before returning, so readers of the index see the change.

use crate::calibrate::{self, CalibrationReport};
use crate::config::{load_config, KgConfig};
use crate::context::{build_context, ContextParams};
use crate::daemon::{Daemon, DaemonKind};
use crate::embedder::{get_embedder, CachedEmbedder};
use crate::error::{KgError, KgResult};
use crate::index::Index;
use crate::rerank::Reranker;
use crate::store::NodeStore;
use crate::vector_client;
use std::path::Path;
use tracing::{debug, warn};

pub struct Kg {
    pub cfg: KgConfig,
    pub store: NodeStore,
    pub db: Index,
    reranker: Reranker,
    embedder: Option<CachedEmbedder>,
}

impl Kg {
    /// Open the project at `root` (or discover it upward from the current
    /// directory), creating the standard layout on first use.
    pub fn open(root: Option<&Path>) -> KgResult<Self> {
        let cfg = load_config(root)?;
        cfg.ensure_dirs()?;
        let store = NodeStore::new(&cfg.nodes_dir);
        let db = Index::new(cfg.db_path());
        let reranker = Reranker::new(&cfg.search.reranker_model);
        let embedder = match get_embedder(&cfg.embedding_model, &cfg.embedding_cache_dir()) {
            Ok(e) => Some(e),
            Err(e) => {
                warn!(error = %e, "embedder unavailable, running lexical-only");
                None
            }
        };
        Ok(Self {
            cfg,
            store,
            db,
            reranker,
            embedder,
        })
    }

    // ------------------------------------------------------------------
    // Retrieval tool surface
    // ------------------------------------------------------------------

    /// Compact ranked context for LLM injection, or `"(no results)"`.
    pub fn context(
        &self,
        query: &str,
        session_id: Option<&str>,
        max_tokens: usize,
        limit: usize,
    ) -> KgResult<String> {
        let mut params = ContextParams::new();
        params.max_tokens = max_tokens;
        params.limit = limit;
        params.session_id = session_id.map(str::to_string);

        let packed = build_context(
            query,
            &self.cfg,
            &self.store,
            &self.db,
            Some(&self.reranker),
            &params,
        )?;
        if packed.nodes.is_empty() {
            return Ok("(no results)".to_string());
        }
        Ok(packed.format_compact())
    }

    /// Flat FTS search: `[slug] <text> ←<id>` rows, best matches first.
    pub fn search(&self, query: &str, limit: usize) -> KgResult<String> {
        let hits = self.db.search_fts(query, limit)?;
        if hits.is_empty() {
            return Ok("(no results)".to_string());
        }
        let lines: Vec<String> = hits
            .iter()
            .map(|h| {
                let text: String = h.text.chars().take(120).collect();
                format!("[{}] {} ←{}", h.slug, text, h.bullet_id)
            })
            .collect();
        Ok(lines.join("\n"))
    }

    /// Full node rendering: header, review banner if applicable, live bullets.
    pub fn show(&self, slug: &str) -> KgResult<String> {
        let node = self
            .store
            .get(slug)?
            .ok_or_else(|| KgError::NotFound(format!("node {slug}")))?;
        let live = node.live_bullets();

        let budget_info = if node.token_budget >= 100.0 {
            format!("  ↑{} credits", node.token_budget as i64)
        } else {
            String::new()
        };
        let created = if node.created_at.is_empty() {
            String::new()
        } else {
            let date: String = node.created_at.chars().take(10).collect();
            format!("  created {date}")
        };

        let mut lines = vec![format!(
            "# {}  [{}]  type={}  ●{} bullets{budget_info}{created}",
            node.title,
            node.slug,
            node.kind,
            live.len(),
        )];

        if let Some(hint) = node.review_hint(self.cfg.budget_threshold, live.len()) {
            let bar = "─".repeat(60);
            lines.push(bar.clone());
            lines.push(hint);
            lines.push(bar);
        }

        for b in &live {
            let prefix = if b.kind == "fact" {
                String::new()
            } else {
                format!("({}) ", b.kind)
            };
            let votes = if b.useful > 0 || b.harmful > 0 {
                format!("  [+{}/-{}]", b.useful, b.harmful)
            } else {
                String::new()
            };
            lines.push(format!("  {prefix}{}  ←{}{votes}", b.text, b.id));
        }
        Ok(lines.join("\n"))
    }

    /// Tabular list of nodes whose budget is at or above the threshold,
    /// highest review pressure first.
    pub fn review_list(&self, threshold: Option<f64>, limit: usize) -> KgResult<String> {
        let threshold = threshold.unwrap_or(self.cfg.budget_threshold);
        let rows = self.db.review_list(threshold, limit)?;
        if rows.is_empty() {
            return Ok(format!(
                "No nodes above {} credits — graph looks healthy.",
                threshold as i64
            ));
        }

        let mut lines = vec![
            format!("{:>9}  {:>8}  {:>7}  Node", "Cr/bullet", "Credits", "Bullets"),
            "-".repeat(60),
        ];
        for r in rows {
            let per_bullet = r.token_budget / (r.bullet_count.max(1)) as f64;
            let reviewed = r
                .last_reviewed
                .as_deref()
                .map(|d| {
                    let date: String = d.chars().take(10).collect();
                    format!("  last reviewed {date}")
                })
                .unwrap_or_default();
            lines.push(format!(
                "{:>9}  {:>8}  {:>7}  [{}] {}{reviewed}",
                per_bullet as i64, r.token_budget as i64, r.bullet_count, r.slug, r.title,
            ));
        }
        Ok(lines.join("\n"))
    }

    /// Clear a node's budget and reindex it.
    pub fn mark_reviewed(&self, slug: &str) -> KgResult<String> {
        if !self.store.exists(slug) {
            return Err(KgError::NotFound(format!("node {slug}")));
        }
        self.store.clear_node_budget(slug)?;
        self.db.reindex_node(slug, &self.store)?;
        Ok(format!("Marked reviewed: {slug}"))
    }

    /// Append a bullet (auto-creating the node) and index it synchronously.
    /// Returns the new bullet id.
    pub fn add_bullet(
        &self,
        node_slug: &str,
        text: &str,
        bullet_type: &str,
        status: Option<&str>,
    ) -> KgResult<String> {
        let bullet = self.store.add_bullet(node_slug, text, bullet_type, status)?;
        self.db.reindex_node(node_slug, &self.store)?;
        if let Some(embedder) = &self.embedder {
            if let Err(e) =
                refresh_node_embedding(&self.cfg, &self.store, &self.db, embedder, node_slug)
            {
                debug!(slug = node_slug, error = %e, "embedding refresh skipped");
            }
        }
        Ok(bullet.id)
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Drop and regenerate the whole index from content files.
    pub fn rebuild(&self) -> KgResult<usize> {
        self.db.rebuild_all(&self.store)
    }

    pub fn calibrate(&self, sample_size: usize) -> KgResult<CalibrationReport> {
        calibrate::calibrate(&self.cfg, &self.db, sample_size)
    }

    /// One line per scorer: when it was calibrated and whether it has gone
    /// stale against the current bullet population.
    pub fn calibration_status(&self) -> KgResult<String> {
        let bullet_count = self.db.bullet_count()?;
        let mut lines = Vec::new();
        for scorer in ["fts", "vector"] {
            let line = match self.db.get_calibration(scorer)? {
                None => format!("{scorer}: never calibrated"),
                Some(cal) => {
                    let date: String = cal.calibrated_at.chars().take(10).collect();
                    let staleness = if cal.is_stale(bullet_count) {
                        "  (stale — recalibrate)"
                    } else {
                        ""
                    };
                    format!(
                        "{scorer}: calibrated {date} over {} bullets{staleness}",
                        cal.bullet_count
                    )
                }
            };
            lines.push(line);
        }
        Ok(lines.join("\n"))
    }

    pub fn daemon(&self, kind: DaemonKind) -> Daemon<'_> {
        Daemon::new(&self.cfg, kind)
    }
}

/// Re-embed one node (title + live bullet texts) into the index, and push
/// the vector into the running vector server when there is one.
pub fn refresh_node_embedding(
    cfg: &KgConfig,
    store: &NodeStore,
    db: &Index,
    embedder: &CachedEmbedder,
    slug: &str,
) -> KgResult<()> {
    let Some(node) = store.get(slug)? else {
        db.delete_embedding(slug)?;
        return Ok(());
    };

    let mut text = node.title.clone();
    for b in node.live_bullets() {
        text.push('\n');
        text.push_str(&b.text);
    }
    let vector = embedder.embed_document(&text, "")?;
    db.upsert_embedding(slug, &vector, embedder.model_id())?;
    vector_client::push_vector(cfg, slug, &vector);
    Ok(())
}
