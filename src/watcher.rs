//! Watch the nodes directory and keep the derived index in sync.
//!
//! Runs as a long-lived daemon (`kgraphd watch <root>`). Any write to a
//! `*.jsonl` file under `nodes/<slug>/` schedules a reindex of that slug;
//! bursts within the debounce window collapse to one reindex. A failed
//! reindex is logged and the loop keeps going; the next write fully
//! reconstructs the node's rows, so the watcher is safely restartable.

use crate::config::KgConfig;
use crate::embedder::{get_embedder, CachedEmbedder};
use crate::error::KgResult;
use crate::index::Index;
use crate::store::NodeStore;
use notify::RecursiveMode;
use notify_debouncer_full::{new_debouncer, DebounceEventResult};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::mpsc;
use std::time::Duration;
use tracing::{info, warn};

/// Debounce window for collapsing editor save storms per slug.
const DEBOUNCE_MS: u64 = 250;
/// Polling fallback interval when native notifications are unavailable.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Extract the slug from a changed path: the first segment under nodes/.
fn slug_from_path(nodes_dir: &Path, changed: &Path) -> Option<String> {
    let rel = changed.strip_prefix(nodes_dir).ok()?;
    let first = rel.components().next()?;
    let slug = first.as_os_str().to_string_lossy().to_string();
    if slug.is_empty() {
        None
    } else {
        Some(slug)
    }
}

fn is_jsonl(path: &Path) -> bool {
    path.extension().is_some_and(|e| e == "jsonl")
}

/// One watcher pass over a single slug: reindex, then refresh the node's
/// embedding best-effort.
fn process_slug(
    slug: &str,
    store: &NodeStore,
    db: &Index,
    cfg: &KgConfig,
    embedder: Option<&CachedEmbedder>,
) {
    match db.reindex_node(slug, store) {
        Ok(()) => info!(slug, "indexed"),
        Err(e) => {
            warn!(slug, error = %e, "failed to index");
            return;
        }
    }
    if let Some(embedder) = embedder {
        if let Err(e) = crate::api::refresh_node_embedding(cfg, store, db, embedder, slug) {
            warn!(slug, error = %e, "embedding refresh failed");
        }
    }
}

/// Block forever, watching `cfg.nodes_dir`.
pub fn run_watcher(cfg: &KgConfig) -> KgResult<()> {
    cfg.ensure_dirs()?;
    let store = NodeStore::new(&cfg.nodes_dir);
    let db = Index::new(cfg.db_path());

    // The embedder is optional equipment: without it the watcher still
    // maintains FTS and backlinks.
    let embedder = match get_embedder(&cfg.embedding_model, &cfg.embedding_cache_dir()) {
        Ok(e) => Some(e),
        Err(e) => {
            warn!(error = %e, "embedder unavailable, watcher runs without embeddings");
            None
        }
    };

    let (tx, rx) = mpsc::channel::<String>();
    let nodes_dir = cfg.nodes_dir.clone();
    let nodes_dir_for_cb = nodes_dir.clone();

    let debouncer = new_debouncer(
        Duration::from_millis(DEBOUNCE_MS),
        None,
        move |result: DebounceEventResult| match result {
            Ok(events) => {
                // Collapse the batch to unique slugs.
                let mut slugs: HashSet<String> = HashSet::new();
                for event in &events {
                    use notify::EventKind;
                    if matches!(event.kind, EventKind::Access(_)) {
                        continue;
                    }
                    for path in &event.paths {
                        if !is_jsonl(path) {
                            continue;
                        }
                        if let Some(slug) = slug_from_path(&nodes_dir_for_cb, path) {
                            slugs.insert(slug);
                        }
                    }
                }
                for slug in slugs {
                    let _ = tx.send(slug);
                }
            }
            Err(errors) => {
                for e in errors {
                    warn!("file watcher error: {e:?}");
                }
            }
        },
    );

    match debouncer {
        Ok(mut debouncer) => {
            debouncer
                .watch(&nodes_dir, RecursiveMode::Recursive)
                .map_err(|e| crate::error::KgError::Io(std::io::Error::other(e)))?;
            info!(dir = %nodes_dir.display(), debounce_ms = DEBOUNCE_MS, "watching nodes directory");

            // Single-threaded processing loop: the debouncer thread only
            // enqueues slugs, all index work happens here.
            while let Ok(slug) = rx.recv() {
                process_slug(&slug, &store, &db, cfg, embedder.as_ref());
            }
            Ok(())
        }
        Err(e) => {
            warn!(error = %e, "native file notifications unavailable, polling instead");
            watch_poll(cfg, &store, &db, embedder.as_ref())
        }
    }
}

/// Polling fallback: track per-file mtimes and reindex on increase.
fn watch_poll(
    cfg: &KgConfig,
    store: &NodeStore,
    db: &Index,
    embedder: Option<&CachedEmbedder>,
) -> KgResult<()> {
    info!(dir = %cfg.nodes_dir.display(), "polling nodes directory");
    let mut seen: HashMap<std::path::PathBuf, std::time::SystemTime> = HashMap::new();

    loop {
        let slugs = store.list_slugs().unwrap_or_default();
        for slug in slugs {
            let mut changed = false;
            for file in [store.node_path(&slug), store.meta_path(&slug)] {
                let Ok(meta) = std::fs::metadata(&file) else {
                    continue;
                };
                let Ok(mtime) = meta.modified() else {
                    continue;
                };
                let newer = seen.get(&file).map(|prev| mtime > *prev).unwrap_or(true);
                if newer {
                    seen.insert(file, mtime);
                    changed = true;
                }
            }
            if changed {
                process_slug(&slug, store, db, cfg, embedder);
            }
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}
