//! kgraph: a personal knowledge graph for LLM coding agents.
//!
//! A directory of append-only JSONL files is the source of truth; a derived
//! SQLite index (FTS5, backlinks, embeddings, review accounting) provides
//! fast lookup; a background watcher keeps the index in sync; and a hybrid
//! retrieval pipeline packs ranked fragments into a compact, budget-limited
//! context string for prompt injection.
//!
//! Entry points: [`api::Kg`] for the retrieval surface,
//! [`watcher::run_watcher`] and [`vector_server::run_vector_server`] for the
//! two daemons, [`daemon::Daemon`] for their lifecycle.

pub mod api;
pub mod calibrate;
pub mod config;
pub mod context;
pub mod daemon;
pub mod embedder;
pub mod error;
pub mod index;
pub mod model;
pub mod rerank;
pub mod store;
pub mod vector;
pub mod vector_client;
pub mod vector_server;
pub mod watcher;

pub use api::Kg;
pub use config::{load_config, KgConfig};
pub use error::{KgError, KgResult};
