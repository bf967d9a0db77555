//! End-to-end scenarios against a real temp project: JSONL store → index →
//! retrieval surface, plus a live vector server on an ephemeral port.

use kgraph::embedder::get_embedder;
use kgraph::vector::VectorIndex;
use kgraph::vector_server::{create_app, VectorServiceState};
use kgraph::Kg;
use std::path::Path;
use std::sync::Arc;

fn init_project(dir: &Path, vector_port: u16) -> Kg {
    std::fs::write(
        dir.join("kg.toml"),
        format!(
            r#"
[kg]
name = "e2e"

[embeddings]
model = "stub:16"

[review]
budget_threshold = 500.0

[server]
vector_port = {vector_port}
"#
        ),
    )
    .unwrap();
    Kg::open(Some(dir)).unwrap()
}

#[test]
fn happy_path_fts_search() {
    let dir = tempfile::tempdir().unwrap();
    let kg = init_project(dir.path(), 1);

    kg.store.create("kg1", "Rust lifetimes", "concept").unwrap();
    let id = kg
        .add_bullet("kg1", "ownership is explicit", "fact", None)
        .unwrap();

    let out = kg.search("ownership", 20).unwrap();
    let lines: Vec<&str> = out.lines().collect();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0], format!("[kg1] ownership is explicit ←{id}"));
}

#[test]
fn cross_references_update_on_rewrite() {
    let dir = tempfile::tempdir().unwrap();
    let kg = init_project(dir.path(), 1);

    let id = kg.add_bullet("aa", "see [bb] and [cc]", "note", None).unwrap();
    assert_eq!(kg.db.get_backlinks("bb").unwrap(), vec!["aa"]);
    assert_eq!(kg.db.get_backlinks("cc").unwrap(), vec!["aa"]);

    kg.store.update_bullet("aa", &id, "see [bb]").unwrap();
    kg.db.reindex_node("aa", &kg.store).unwrap();
    assert_eq!(kg.db.get_backlinks("bb").unwrap(), vec!["aa"]);
    assert!(kg.db.get_backlinks("cc").unwrap().is_empty());
}

#[test]
fn tombstones_survive_the_whole_stack() {
    let dir = tempfile::tempdir().unwrap();
    let kg = init_project(dir.path(), 1);

    let first = kg.add_bullet("t", "first", "fact", None).unwrap();
    let second = kg.add_bullet("t", "second", "fact", None).unwrap();
    let third = kg.add_bullet("t", "third", "fact", None).unwrap();
    kg.store.delete_bullet("t", &second).unwrap();
    kg.db.reindex_node("t", &kg.store).unwrap();

    let node = kg.store.get("t").unwrap().unwrap();
    let ids: Vec<String> = node.live_bullets().iter().map(|b| b.id.clone()).collect();
    assert_eq!(ids, vec![first, third]);
    assert!(kg.search("second", 20).unwrap().contains("(no results)"));
}

#[test]
fn vector_fallback_context_with_service_down() {
    let dir = tempfile::tempdir().unwrap();
    // Port 1 refuses connections: the whole pipeline must degrade cleanly.
    let kg = init_project(dir.path(), 1);
    kg.add_bullet("kg1", "lifetimes bound borrows to owners", "fact", None)
        .unwrap();

    let out = kg.context("lifetimes", None, 1000, 20).unwrap();
    assert!(out.contains("[kg1]"));
    assert!(out.contains("lifetimes bound borrows to owners"));

    let node = kg.store.get("kg1").unwrap().unwrap();
    assert!(node.token_budget > 0.0);
}

#[test]
fn review_cycle_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let kg = init_project(dir.path(), 1);
    let text = "a deliberately wordy bullet so each context response serves \
                several hundred characters of knowledge graph output text";
    kg.add_bullet("big", text, "fact", None).unwrap();

    for _ in 0..10 {
        kg.context("knowledge", None, 1000, 20).unwrap();
    }
    kg.db.reindex_node("big", &kg.store).unwrap();

    let listing = kg.review_list(None, 20).unwrap();
    assert!(listing.contains("[big]"));

    kg.mark_reviewed("big").unwrap();
    assert!(!kg.review_list(None, 20).unwrap().contains("[big]"));
    assert_eq!(kg.store.get("big").unwrap().unwrap().token_budget, 0.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn vector_server_round_trip() {
    let dir = tempfile::tempdir().unwrap();

    // Stand the service up on an ephemeral port.
    let cache = dir.path().join("cache");
    let embedder = get_embedder("stub:16", &cache).unwrap();
    let state = VectorServiceState {
        index: Arc::new(VectorIndex::new()),
        embedder: Arc::new(embedder),
    };
    let app = create_app(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let dir_path = dir.path().to_path_buf();
    let results = tokio::task::spawn_blocking(move || {
        let kg = init_project(&dir_path, port);
        assert!(kgraph::vector_client::is_server_running(&kg.cfg));

        // Server-side embed path.
        let vectors = kgraph::vector_client::embed(
            &["rust ownership".to_string()],
            &kg.cfg,
            "",
            "doc",
        )
        .unwrap();
        assert_eq!(vectors.len(), 1);
        assert_eq!(vectors[0].len(), 16);

        // Adding a bullet pushes the node vector into the live server.
        kg.add_bullet("vec-node", "rust ownership", "fact", None).unwrap();
        kgraph::vector_client::search_vector("rust ownership", &kg.cfg, 5).unwrap()
    })
    .await
    .unwrap();

    assert!(!results.is_empty());
    assert_eq!(results[0].0, "vec-node");
    assert_eq!(state.index.len(), 1);
}
