//! Project configuration: `kg.toml` at the project root.
//!
//! Default layout, all relative to the root that contains `kg.toml`:
//!
//! ```text
//! kg.toml                  # project config (version-tracked)
//! nodes/<slug>/node.jsonl  # content, append-only JSONL
//! nodes/<slug>/meta.jsonl  # votes + node budget, append-only
//! .kg/index/graph.db       # derived SQLite cache (ignored by VCS)
//! .kg/index/embedding_cache/
//! .kg/index/logs/
//! .kg/index/*.pid
//! ```

use crate::error::{KgError, KgResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};

const CONFIG_FILENAME: &str = "kg.toml";
const DEFAULT_NODES_DIR: &str = "nodes";
const DEFAULT_INDEX_DIR: &str = ".kg/index";
const GITIGNORE_CONTENT: &str = "index/\n";

#[derive(Debug, Clone, Deserialize, Default)]
struct RawConfig {
    #[serde(default)]
    kg: RawKg,
    #[serde(default)]
    embeddings: RawEmbeddings,
    #[serde(default)]
    search: RawSearch,
    #[serde(default)]
    review: RawReview,
    #[serde(default)]
    server: RawServer,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct RawKg {
    name: Option<String>,
    nodes_dir: Option<String>,
    index_dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct RawEmbeddings {
    model: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct RawSearch {
    fts_weight: Option<f32>,
    vector_weight: Option<f32>,
    dual_match_bonus: Option<f32>,
    use_reranker: Option<bool>,
    reranker_model: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct RawReview {
    budget_threshold: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct RawServer {
    vector_port: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub fts_weight: f32,
    pub vector_weight: f32,
    pub dual_match_bonus: f32,
    pub use_reranker: bool,
    pub reranker_model: String,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            fts_weight: 0.6,
            vector_weight: 0.4,
            dual_match_bonus: 0.15,
            use_reranker: false,
            reranker_model: "BAAI/bge-reranker-base".to_string(),
        }
    }
}

/// Resolved configuration for a knowledge graph project.
#[derive(Debug, Clone)]
pub struct KgConfig {
    /// Directory that contains kg.toml.
    pub root: PathBuf,
    pub name: String,
    pub nodes_dir: PathBuf,
    pub index_dir: PathBuf,
    pub embedding_model: String,
    pub search: SearchConfig,
    pub budget_threshold: f64,
    pub vector_port: u16,
}

impl KgConfig {
    pub fn db_path(&self) -> PathBuf {
        self.index_dir.join("graph.db")
    }

    pub fn embedding_cache_dir(&self) -> PathBuf {
        self.index_dir.join("embedding_cache")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.index_dir.join("logs")
    }

    pub fn pid_path(&self, daemon: &str) -> PathBuf {
        self.index_dir.join(format!("{daemon}.pid"))
    }

    pub fn vector_server_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.vector_port)
    }

    /// Create nodes_dir and index_dir, and write the VCS ignore file that
    /// keeps the derived index out of version control.
    pub fn ensure_dirs(&self) -> KgResult<()> {
        std::fs::create_dir_all(&self.nodes_dir)?;
        std::fs::create_dir_all(&self.index_dir)?;
        if let Some(parent) = self.index_dir.parent() {
            let gitignore = parent.join(".gitignore");
            if !gitignore.exists() {
                std::fs::write(&gitignore, GITIGNORE_CONTENT)?;
            }
        }
        Ok(())
    }
}

/// Load kg.toml from `root`, or walk upward from the current directory when
/// `root` is `None`.
pub fn load_config(root: Option<&Path>) -> KgResult<KgConfig> {
    let start = match root {
        Some(p) => p.to_path_buf(),
        None => std::env::current_dir()?,
    };
    let root_path = find_root(&start);
    let config_path = root_path.join(CONFIG_FILENAME);

    let raw: RawConfig = if config_path.exists() {
        let text = std::fs::read_to_string(&config_path)?;
        toml::from_str(&text)
            .map_err(|e| KgError::Config(format!("{}: {e}", config_path.display())))?
    } else {
        RawConfig::default()
    };

    let name = raw.kg.name.unwrap_or_else(|| {
        root_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    });

    let nodes_rel = raw.kg.nodes_dir.unwrap_or_else(|| DEFAULT_NODES_DIR.into());
    let index_rel = raw.kg.index_dir.unwrap_or_else(|| DEFAULT_INDEX_DIR.into());

    let defaults = SearchConfig::default();
    Ok(KgConfig {
        nodes_dir: root_path.join(nodes_rel),
        index_dir: root_path.join(index_rel),
        root: root_path,
        name,
        embedding_model: raw
            .embeddings
            .model
            .unwrap_or_else(|| "fastembed:BAAI/bge-small-en-v1.5".into()),
        search: SearchConfig {
            fts_weight: raw.search.fts_weight.unwrap_or(defaults.fts_weight),
            vector_weight: raw.search.vector_weight.unwrap_or(defaults.vector_weight),
            dual_match_bonus: raw
                .search
                .dual_match_bonus
                .unwrap_or(defaults.dual_match_bonus),
            use_reranker: raw.search.use_reranker.unwrap_or(defaults.use_reranker),
            reranker_model: raw
                .search
                .reranker_model
                .unwrap_or(defaults.reranker_model),
        },
        budget_threshold: raw.review.budget_threshold.unwrap_or(500.0),
        vector_port: raw.server.vector_port.unwrap_or(7343),
    })
}

/// Walk upward from `start` looking for kg.toml. Falls back to `start` when
/// nothing is found so a fresh project can still be initialised there.
fn find_root(start: &Path) -> PathBuf {
    let mut dir = Some(start);
    while let Some(d) = dir {
        if d.join(CONFIG_FILENAME).exists() {
            return d.to_path_buf();
        }
        dir = d.parent();
    }
    start.to_path_buf()
}
