//! Build and query the derived SQLite index.
//!
//! The database is a pure derived cache over the node JSONL files: delete
//! it and rebuild anytime. It holds FTS5 over bullet text, the backlink
//! graph extracted from `[slug]` references, per-node embeddings, and the
//! per-scorer calibration rows.

use crate::error::{KgError, KgResult};
use crate::model::extract_crossrefs;
use crate::store::NodeStore;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS nodes (
    slug TEXT PRIMARY KEY,
    title TEXT,
    type TEXT,
    created_at TEXT,
    bullet_count INTEGER DEFAULT 0,
    token_budget REAL DEFAULT 0,
    last_reviewed TEXT
);

CREATE TABLE IF NOT EXISTS bullets (
    id TEXT PRIMARY KEY,
    node_slug TEXT NOT NULL REFERENCES nodes(slug) ON DELETE CASCADE,
    type TEXT,
    text TEXT,
    status TEXT,
    created_at TEXT,
    useful INTEGER DEFAULT 0,
    harmful INTEGER DEFAULT 0,
    used INTEGER DEFAULT 0
);

CREATE VIRTUAL TABLE IF NOT EXISTS bullets_fts USING fts5(
    text,
    node_slug UNINDEXED,
    bullet_id UNINDEXED,
    content=bullets,
    content_rowid=rowid
);

CREATE TABLE IF NOT EXISTS backlinks (
    from_slug TEXT NOT NULL,
    to_slug TEXT NOT NULL,
    PRIMARY KEY (from_slug, to_slug)
);

CREATE TABLE IF NOT EXISTS embeddings (
    node_slug TEXT PRIMARY KEY,
    vector BLOB,
    model TEXT,
    updated_at TEXT
);

CREATE TABLE IF NOT EXISTS file_sources (
    path        TEXT PRIMARY KEY,
    rel_path    TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    slug        TEXT NOT NULL,
    source_name TEXT DEFAULT '',
    indexed_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS file_sources_slug ON file_sources(slug);

CREATE TABLE IF NOT EXISTS calibration (
    scorer TEXT PRIMARY KEY,
    breakpoints TEXT NOT NULL,
    bullet_count INTEGER NOT NULL,
    calibrated_at TEXT NOT NULL,
    ops_since INTEGER DEFAULT 0
);

CREATE TRIGGER IF NOT EXISTS bullets_ai AFTER INSERT ON bullets BEGIN
    INSERT INTO bullets_fts(rowid, text, node_slug, bullet_id)
    VALUES (new.rowid, new.text, new.node_slug, new.id);
END;
CREATE TRIGGER IF NOT EXISTS bullets_ad AFTER DELETE ON bullets BEGIN
    INSERT INTO bullets_fts(bullets_fts, rowid, text, node_slug, bullet_id)
    VALUES ('delete', old.rowid, old.text, old.node_slug, old.id);
END;
CREATE TRIGGER IF NOT EXISTS bullets_au AFTER UPDATE ON bullets BEGIN
    INSERT INTO bullets_fts(bullets_fts, rowid, text, node_slug, bullet_id)
    VALUES ('delete', old.rowid, old.text, old.node_slug, old.id);
    INSERT INTO bullets_fts(rowid, text, node_slug, bullet_id)
    VALUES (new.rowid, new.text, new.node_slug, new.id);
END;
"#;

/// One FTS hit. `rank` is the engine's BM25-style rank: more negative is a
/// better match, ascending order is best-first.
#[derive(Debug, Clone)]
pub struct FtsHit {
    pub slug: String,
    pub bullet_id: String,
    pub text: String,
    pub rank: f64,
}

/// A row from the review listing.
#[derive(Debug, Clone)]
pub struct ReviewRow {
    pub slug: String,
    pub title: String,
    pub bullet_count: i64,
    pub token_budget: f64,
    pub last_reviewed: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Calibration {
    pub breakpoints: Vec<f32>,
    pub bullet_count: i64,
    pub calibrated_at: String,
    pub ops_since: i64,
}

impl Calibration {
    /// Calibration goes stale when the bullet population drifts by more than
    /// max(5, 10%) from the count at calibration time, or after 20 index
    /// mutations.
    pub fn is_stale(&self, current_bullet_count: i64) -> bool {
        let drift = (current_bullet_count - self.bullet_count).abs();
        let allowed = 5.max(self.bullet_count / 10);
        drift > allowed || self.ops_since >= 20
    }
}

#[derive(Debug, Clone)]
pub struct Index {
    db_path: PathBuf,
}

impl Index {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Open a connection with WAL journaling and foreign keys enforced, and
    /// make sure the schema exists. Short-lived callers open and close; the
    /// watcher keeps calling this per event, which is cheap under WAL.
    pub fn conn(&self) -> KgResult<Connection> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&self.db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(conn)
    }

    // ------------------------------------------------------------------
    // Reindex
    // ------------------------------------------------------------------

    /// Re-index a single node: wipe its rows and re-insert from node.jsonl,
    /// all inside one transaction. A missing content file just removes the
    /// node from the index.
    pub fn reindex_node(&self, slug: &str, store: &NodeStore) -> KgResult<()> {
        let mut conn = self.conn()?;
        self.reindex_node_with(&mut conn, slug, store)
    }

    fn reindex_node_with(
        &self,
        conn: &mut Connection,
        slug: &str,
        store: &NodeStore,
    ) -> KgResult<()> {
        let node = store.get(slug)?;

        let result = (|| -> rusqlite::Result<()> {
            let tx = conn.transaction()?;
            // CASCADE removes the node's bullets, and the delete trigger
            // mirrors each removal into the FTS table.
            tx.execute("DELETE FROM nodes WHERE slug = ?1", [slug])?;
            tx.execute("DELETE FROM backlinks WHERE from_slug = ?1", [slug])?;

            if let Some(node) = &node {
                let live = node.live_bullets();
                tx.execute(
                    "INSERT OR REPLACE INTO nodes(slug, title, type, created_at, bullet_count, token_budget, last_reviewed)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        node.slug,
                        node.title,
                        node.kind,
                        node.created_at,
                        live.len() as i64,
                        node.token_budget,
                        node.last_reviewed,
                    ],
                )?;

                for b in live {
                    tx.execute(
                        "INSERT OR REPLACE INTO bullets(id, node_slug, type, text, status, created_at, useful, harmful, used)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                        params![
                            b.id, node.slug, b.kind, b.text, b.status, b.created_at,
                            b.useful, b.harmful, b.used,
                        ],
                    )?;
                    for target in extract_crossrefs(&b.text) {
                        if target != slug {
                            tx.execute(
                                "INSERT OR IGNORE INTO backlinks(from_slug, to_slug) VALUES (?1, ?2)",
                                params![slug, target],
                            )?;
                        }
                    }
                }
            }

            tx.execute("UPDATE calibration SET ops_since = ops_since + 1", [])?;
            tx.commit()
        })();

        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                if !self.triggers_present(conn) {
                    Err(KgError::Schema("FTS triggers missing".into()))
                } else {
                    Err(e.into())
                }
            }
        }
    }

    fn triggers_present(&self, conn: &Connection) -> bool {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'trigger'
             AND name IN ('bullets_ai', 'bullets_ad', 'bullets_au')",
            [],
            |row| row.get::<_, i64>(0),
        )
        .map(|n| n == 3)
        .unwrap_or(false)
    }

    /// Full rebuild: drop the database and re-index every node from disk.
    /// Returns the number of nodes indexed.
    pub fn rebuild_all(&self, store: &NodeStore) -> KgResult<usize> {
        for suffix in ["", "-wal", "-shm"] {
            let p = PathBuf::from(format!("{}{}", self.db_path.display(), suffix));
            if p.exists() {
                std::fs::remove_file(&p)?;
            }
        }

        let mut conn = self.conn()?;
        let slugs = store.list_slugs()?;
        for slug in &slugs {
            self.reindex_node_with(&mut conn, slug, store)?;
        }
        Ok(slugs.len())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// FTS5 search over bullet text, best matches first. The query string is
    /// handed to the engine verbatim; engine syntax errors surface as an
    /// empty result set, not a failure.
    pub fn search_fts(&self, query: &str, limit: usize) -> KgResult<Vec<FtsHit>> {
        if !self.db_path.exists() {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT node_slug, bullet_id, text, rank
             FROM bullets_fts
             WHERE bullets_fts MATCH ?1
             ORDER BY rank
             LIMIT ?2",
        )?;

        // The query string is not sanitized; FTS5 reports syntax errors at
        // step time, so the whole fetch collapses to an empty result set.
        let hits: rusqlite::Result<Vec<FtsHit>> = stmt
            .query_map(params![query, limit as i64], |row| {
                Ok(FtsHit {
                    slug: row.get(0)?,
                    bullet_id: row.get(1)?,
                    text: row.get(2)?,
                    rank: row.get(3)?,
                })
            })
            .and_then(|rows| rows.collect());

        match hits {
            Ok(hits) => Ok(hits),
            Err(e) => {
                tracing::debug!(query, error = %e, "FTS query rejected by engine");
                Ok(Vec::new())
            }
        }
    }

    /// Slugs of nodes that link TO this slug.
    pub fn get_backlinks(&self, slug: &str) -> KgResult<Vec<String>> {
        if !self.db_path.exists() {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT from_slug FROM backlinks WHERE to_slug = ?1 ORDER BY from_slug")?;
        let rows = stmt.query_map([slug], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn node_title(&self, slug: &str) -> KgResult<Option<String>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT title FROM nodes WHERE slug = ?1",
                [slug],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn bullet_count(&self) -> KgResult<i64> {
        let conn = self.conn()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM bullets", [], |row| row.get(0))?)
    }

    /// Uniform random sample of bullet texts, for calibration.
    pub fn sample_bullets(&self, n: usize) -> KgResult<Vec<(String, String, String)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, node_slug, text FROM bullets ORDER BY RANDOM() LIMIT ?1",
        )?;
        let rows = stmt.query_map([n as i64], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Nodes at or above the budget threshold, most review pressure first.
    /// Internal (`_`-prefixed) nodes are excluded.
    pub fn review_list(&self, threshold: f64, limit: usize) -> KgResult<Vec<ReviewRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT slug, title, bullet_count, token_budget, last_reviewed
             FROM nodes
             WHERE token_budget >= ?1 AND slug NOT LIKE '\\_%' ESCAPE '\\'
             ORDER BY token_budget / MAX(bullet_count, 1) DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![threshold, limit as i64], |row| {
            Ok(ReviewRow {
                slug: row.get(0)?,
                title: row.get(1)?,
                bullet_count: row.get(2)?,
                token_budget: row.get(3)?,
                last_reviewed: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ------------------------------------------------------------------
    // Embeddings
    // ------------------------------------------------------------------

    /// Store a node's embedding as raw little-endian f32 bytes together with
    /// the model that produced it.
    pub fn upsert_embedding(&self, slug: &str, vector: &[f32], model: &str) -> KgResult<()> {
        let blob: Vec<u8> = vector.iter().flat_map(|f| f.to_le_bytes()).collect();
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO embeddings(node_slug, vector, model, updated_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![slug, blob, model, crate::model::now_iso()],
        )?;
        Ok(())
    }

    pub fn delete_embedding(&self, slug: &str) -> KgResult<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM embeddings WHERE node_slug = ?1", [slug])?;
        Ok(())
    }

    /// Load all embeddings produced by `model`, in insertion order. Vectors
    /// from other models are stale and skipped.
    pub fn load_embeddings(&self, model: &str) -> KgResult<Vec<(String, Vec<f32>)>> {
        if !self.db_path.exists() {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT node_slug, vector FROM embeddings
             WHERE vector IS NOT NULL AND model = ?1",
        )?;
        let rows = stmt.query_map([model], |row| {
            let slug: String = row.get(0)?;
            let blob: Vec<u8> = row.get(1)?;
            Ok((slug, blob))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (slug, blob) = row?;
            out.push((slug, blob_to_f32(&blob)));
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Calibration
    // ------------------------------------------------------------------

    pub fn set_calibration(
        &self,
        scorer: &str,
        breakpoints: &[f32],
        bullet_count: i64,
    ) -> KgResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO calibration(scorer, breakpoints, bullet_count, calibrated_at, ops_since)
             VALUES (?1, ?2, ?3, ?4, 0)",
            params![
                scorer,
                serde_json::to_string(breakpoints)?,
                bullet_count,
                crate::model::now_iso(),
            ],
        )?;
        Ok(())
    }

    pub fn get_calibration(&self, scorer: &str) -> KgResult<Option<Calibration>> {
        if !self.db_path.exists() {
            return Ok(None);
        }
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT breakpoints, bullet_count, calibrated_at, ops_since
                 FROM calibration WHERE scorer = ?1",
                [scorer],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((breaks_json, bullet_count, calibrated_at, ops_since)) = row else {
            return Ok(None);
        };
        let breakpoints: Vec<f32> = serde_json::from_str(&breaks_json)?;
        Ok(Some(Calibration {
            breakpoints,
            bullet_count,
            calibrated_at,
            ops_since,
        }))
    }

    /// Breakpoints for a scorer, or `None` when uncalibrated or stale.
    pub fn fresh_breakpoints(&self, scorer: &str) -> KgResult<Option<Vec<f32>>> {
        let Some(cal) = self.get_calibration(scorer)? else {
            return Ok(None);
        };
        if cal.is_stale(self.bullet_count()?) {
            return Ok(None);
        }
        Ok(Some(cal.breakpoints))
    }
}

fn blob_to_f32(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, NodeStore, Index) {
        let dir = tempfile::tempdir().unwrap();
        let store = NodeStore::new(dir.path().join("nodes"));
        let index = Index::new(dir.path().join("index/graph.db"));
        (dir, store, index)
    }

    #[test]
    fn reindex_mirrors_live_bullets() {
        let (_dir, store, index) = setup();
        let a = store.add_bullet("kg1", "ownership is explicit", "fact", None).unwrap();
        let b = store.add_bullet("kg1", "borrowck catches races", "fact", None).unwrap();
        store.delete_bullet("kg1", &b.id).unwrap();
        index.reindex_node("kg1", &store).unwrap();

        let conn = index.conn().unwrap();
        let count: i64 = conn
            .query_row("SELECT bullet_count FROM nodes WHERE slug = 'kg1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
        let id: String = conn
            .query_row("SELECT id FROM bullets WHERE node_slug = 'kg1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(id, a.id);
    }

    #[test]
    fn fts_finds_bullet_text() {
        let (_dir, store, index) = setup();
        let b = store.add_bullet("kg1", "ownership is explicit", "fact", None).unwrap();
        index.reindex_node("kg1", &store).unwrap();

        let hits = index.search_fts("ownership", 20).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].slug, "kg1");
        assert_eq!(hits[0].bullet_id, b.id);
        assert_eq!(hits[0].text, "ownership is explicit");
        assert!(hits[0].rank < 0.0);
    }

    #[test]
    fn fts_query_passes_through_and_bad_syntax_yields_empty() {
        let (_dir, store, index) = setup();
        store.add_bullet("kg1", "ownership is explicit", "fact", None).unwrap();
        index.reindex_node("kg1", &store).unwrap();

        // Unbalanced quote is an FTS5 syntax error; empty results, no error.
        let hits = index.search_fts("\"ownership", 20).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn backlinks_follow_rewrites() {
        let (_dir, store, index) = setup();
        let bullet = store.add_bullet("aa", "see [bb] and [cc]", "note", None).unwrap();
        index.reindex_node("aa", &store).unwrap();
        assert_eq!(index.get_backlinks("bb").unwrap(), vec!["aa"]);
        assert_eq!(index.get_backlinks("cc").unwrap(), vec!["aa"]);

        store.update_bullet("aa", &bullet.id, "see [bb]").unwrap();
        index.reindex_node("aa", &store).unwrap();
        assert_eq!(index.get_backlinks("bb").unwrap(), vec!["aa"]);
        assert!(index.get_backlinks("cc").unwrap().is_empty());
    }

    #[test]
    fn self_references_are_ignored() {
        let (_dir, store, index) = setup();
        store.add_bullet("aa", "about [aa] and [bb]", "note", None).unwrap();
        index.reindex_node("aa", &store).unwrap();
        assert!(index.get_backlinks("aa").unwrap().is_empty());
        assert_eq!(index.get_backlinks("bb").unwrap(), vec!["aa"]);
    }

    #[test]
    fn reindex_is_idempotent() {
        let (_dir, store, index) = setup();
        store.add_bullet("kg1", "stable fact", "fact", None).unwrap();
        index.reindex_node("kg1", &store).unwrap();
        index.reindex_node("kg1", &store).unwrap();

        let conn = index.conn().unwrap();
        let nodes: i64 = conn.query_row("SELECT COUNT(*) FROM nodes", [], |r| r.get(0)).unwrap();
        let bullets: i64 = conn.query_row("SELECT COUNT(*) FROM bullets", [], |r| r.get(0)).unwrap();
        assert_eq!((nodes, bullets), (1, 1));
        assert_eq!(index.search_fts("stable", 10).unwrap().len(), 1);
    }

    #[test]
    fn reindex_of_deleted_file_removes_rows() {
        let (_dir, store, index) = setup();
        store.add_bullet("gone", "text", "fact", None).unwrap();
        index.reindex_node("gone", &store).unwrap();
        std::fs::remove_dir_all(store.nodes_dir().join("gone")).unwrap();
        index.reindex_node("gone", &store).unwrap();

        let conn = index.conn().unwrap();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM nodes", [], |r| r.get(0)).unwrap();
        assert_eq!(n, 0);
        assert!(index.search_fts("text", 10).unwrap().is_empty());
    }

    #[test]
    fn rebuild_matches_incremental_search() {
        let (_dir, store, index) = setup();
        store.add_bullet("aa", "ownership is explicit", "fact", None).unwrap();
        store.add_bullet("bb", "ownership moves values", "fact", None).unwrap();
        index.reindex_node("aa", &store).unwrap();
        index.reindex_node("bb", &store).unwrap();
        let incremental: Vec<_> = index
            .search_fts("ownership", 20)
            .unwrap()
            .into_iter()
            .map(|h| (h.slug, h.bullet_id))
            .collect();

        let n = index.rebuild_all(&store).unwrap();
        assert_eq!(n, 2);
        let rebuilt: Vec<_> = index
            .search_fts("ownership", 20)
            .unwrap()
            .into_iter()
            .map(|h| (h.slug, h.bullet_id))
            .collect();
        assert_eq!(incremental, rebuilt);
    }

    #[test]
    fn embedding_blob_round_trips() {
        let (_dir, store, index) = setup();
        store.add_bullet("vv", "x", "fact", None).unwrap();
        index.reindex_node("vv", &store).unwrap();

        let vec = vec![0.25f32, -1.5, 3.0];
        index.upsert_embedding("vv", &vec, "stub:3").unwrap();
        let loaded = index.load_embeddings("stub:3").unwrap();
        assert_eq!(loaded, vec![("vv".to_string(), vec)]);

        // A model change invalidates existing vectors.
        assert!(index.load_embeddings("stub:4").unwrap().is_empty());
    }

    #[test]
    fn calibration_staleness_rules() {
        let (_dir, store, index) = setup();
        store.add_bullet("cc", "x", "fact", None).unwrap();
        index.reindex_node("cc", &store).unwrap();

        let breaks: Vec<f32> = (0..21).map(|i| i as f32).collect();
        index.set_calibration("fts", &breaks, 100).unwrap();
        let cal = index.get_calibration("fts").unwrap().unwrap();
        assert_eq!(cal.ops_since, 0);
        assert!(!cal.is_stale(100));
        assert!(!cal.is_stale(105)); // within max(5, 10%)
        assert!(!cal.is_stale(110));
        assert!(cal.is_stale(111));
        assert!(cal.is_stale(60));

        // Mutations bump ops_since; 20 of them force recalibration.
        for _ in 0..20 {
            index.reindex_node("cc", &store).unwrap();
        }
        let cal = index.get_calibration("fts").unwrap().unwrap();
        assert!(cal.ops_since >= 20);
        assert!(cal.is_stale(100));
    }

    #[test]
    fn review_list_orders_by_credit_pressure() {
        let (_dir, store, index) = setup();
        store.add_bullet("heavy", "a", "fact", None).unwrap();
        store.update_node_budget("heavy", 900).unwrap();
        store.add_bullet("lighter", "a", "fact", None).unwrap();
        store.add_bullet("lighter", "b", "fact", None).unwrap();
        store.update_node_budget("lighter", 1000).unwrap();
        store.add_bullet("_internal", "a", "fact", None).unwrap();
        store.update_node_budget("_internal", 9999).unwrap();
        for slug in ["heavy", "lighter", "_internal"] {
            index.reindex_node(slug, &store).unwrap();
        }

        let rows = index.review_list(500.0, 20).unwrap();
        let slugs: Vec<_> = rows.iter().map(|r| r.slug.as_str()).collect();
        // heavy: 900/bullet beats lighter: 500/bullet; internal excluded.
        assert_eq!(slugs, vec!["heavy", "lighter"]);
    }
}
