//! Data model for the file-based node store.
//!
//! A node is a directory `nodes/<slug>/` holding two JSONL streams:
//! `node.jsonl` (header + bullets + tombstones) and `meta.jsonl`
//! (votes, usage counts, node budget). Everything else is derived.

use chrono::{SecondsFormat, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use regex::Regex;
use serde_json::{json, Value};
use std::sync::LazyLock;

/// Cross-reference token: `[slug]` embedded in bullet text.
static CROSSREF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([a-z0-9][a-z0-9\-]*[a-z0-9])\]").unwrap());

/// Full-string slug grammar (min length 2, no leading/trailing hyphen).
static SLUG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9\-]*[a-z0-9]$").unwrap());

/// Node slugs additionally allow the `_` prefix that marks internal nodes
/// (session scratch, doc chunks). References never resolve to those.
static NODE_SLUG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^_?[a-z0-9][a-z0-9\-]*[a-z0-9]$").unwrap());

/// Generate a compact bullet id: `b-` + 8 hex chars, drawn from the OS CSPRNG.
pub fn new_bullet_id() -> String {
    let n = OsRng.next_u64();
    format!("b-{:08x}", (n & 0xffff_ffff) as u32)
}

pub fn is_valid_slug(slug: &str) -> bool {
    SLUG_RE.is_match(slug)
}

pub fn is_valid_node_slug(slug: &str) -> bool {
    NODE_SLUG_RE.is_match(slug)
}

/// Extract well-formed `[slug]` references from bullet text, in order.
pub fn extract_crossrefs(text: &str) -> Vec<String> {
    CROSSREF_RE
        .captures_iter(text)
        .map(|c| c[1].to_string())
        .collect()
}

/// Current wall-clock time as ISO-8601 UTC.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// A single bullet line from node.jsonl.
#[derive(Debug, Clone, PartialEq)]
pub struct Bullet {
    pub id: String,
    /// fact | gotcha | decision | task | note | success | failure | chunk
    pub kind: String,
    pub text: String,
    pub created_at: String,
    /// pending | completed | archived (tasks)
    pub status: Option<String>,
    pub deleted: bool,

    // Vote state, merged in from meta.jsonl, never written to node.jsonl.
    pub useful: i64,
    pub harmful: i64,
    pub used: i64,
}

impl Bullet {
    pub fn new(kind: &str, text: &str, status: Option<&str>) -> Self {
        Self {
            id: new_bullet_id(),
            kind: kind.to_string(),
            text: text.to_string(),
            created_at: now_iso(),
            status: status.map(str::to_string),
            deleted: false,
            useful: 0,
            harmful: 0,
            used: 0,
        }
    }

    /// Parse a bullet record. Returns `None` unless the object carries an id.
    pub fn from_record(obj: &Value) -> Option<Self> {
        let id = obj.get("id")?.as_str()?.to_string();
        Some(Self {
            id,
            kind: obj
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("fact")
                .to_string(),
            text: obj
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            created_at: obj
                .get("created_at")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            status: obj
                .get("status")
                .and_then(Value::as_str)
                .map(str::to_string),
            deleted: obj
                .get("deleted")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            useful: 0,
            harmful: 0,
            used: 0,
        })
    }

    /// Wire shape for node.jsonl. Vote counters stay in the meta stream.
    pub fn to_record(&self) -> Value {
        let mut obj = json!({
            "id": self.id,
            "type": self.kind,
            "text": self.text,
        });
        if let Some(status) = &self.status {
            obj["status"] = json!(status);
        }
        if !self.created_at.is_empty() {
            obj["created_at"] = json!(self.created_at);
        }
        obj
    }

    pub fn tombstone(id: &str) -> Value {
        json!({"id": id, "deleted": true})
    }
}

/// A node loaded from `nodes/<slug>/node.jsonl` with meta state merged in.
#[derive(Debug, Clone)]
pub struct Node {
    pub slug: String,
    /// concept | task | decision | agent | session | doc | _-prefixed internal
    pub kind: String,
    pub title: String,
    pub created_at: String,
    pub bullets: Vec<Bullet>,

    // Node-level meta (last record wins in meta.jsonl).
    pub token_budget: f64,
    pub last_reviewed: Option<String>,
}

impl Node {
    pub fn new(slug: &str, title: &str, kind: &str) -> Self {
        Self {
            slug: slug.to_string(),
            kind: kind.to_string(),
            title: title.to_string(),
            created_at: now_iso(),
            bullets: Vec::new(),
            token_budget: 0.0,
            last_reviewed: None,
        }
    }

    /// Bullets that have not been tombstoned, in write order.
    pub fn live_bullets(&self) -> Vec<&Bullet> {
        self.bullets.iter().filter(|b| !b.deleted).collect()
    }

    pub fn header_record(&self) -> Value {
        json!({
            "v": 1,
            "slug": self.slug,
            "title": self.title,
            "type": self.kind,
            "created_at": self.created_at,
        })
    }

    /// Served characters per live bullet, the review pressure metric.
    pub fn credits_per_bullet(&self, live_count: usize) -> f64 {
        self.token_budget / live_count.max(1) as f64
    }

    pub fn needs_review(&self, threshold: f64, live_count: usize) -> bool {
        self.credits_per_bullet(live_count) >= threshold
    }

    /// One-line review banner, present only when the threshold is exceeded.
    pub fn review_hint(&self, threshold: f64, live_count: usize) -> Option<String> {
        if !self.needs_review(threshold, live_count) {
            return None;
        }
        Some(format!(
            "⚠ NEEDS REVIEW: {} credits, {}/bullet  see [node-review]",
            self.token_budget as i64,
            self.credits_per_bullet(live_count) as i64,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bullet_id_shape() {
        let id = new_bullet_id();
        assert_eq!(id.len(), 10);
        assert!(id.starts_with("b-"));
        assert!(id[2..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn slug_grammar() {
        assert!(is_valid_slug("asyncpg-patterns"));
        assert!(is_valid_slug("a1"));
        assert!(!is_valid_slug("a"));
        assert!(!is_valid_slug("-leading"));
        assert!(!is_valid_slug("trailing-"));
        assert!(!is_valid_slug("Upper-Case"));
        assert!(!is_valid_slug("under_score"));
    }

    #[test]
    fn internal_prefix_only_valid_for_node_slugs() {
        assert!(is_valid_node_slug("_fleeting-abc123"));
        assert!(is_valid_node_slug("asyncpg-patterns"));
        assert!(!is_valid_slug("_fleeting-abc123"));
        assert!(!is_valid_node_slug("__double"));
    }

    #[test]
    fn crossref_extraction() {
        let refs = extract_crossrefs("see [asyncpg-patterns] and [b2], not [X] or [-a]");
        assert_eq!(refs, vec!["asyncpg-patterns", "b2"]);
    }

    #[test]
    fn bullet_record_round_trip() {
        let b = Bullet::new("gotcha", "LIKE is case-sensitive", Some("pending"));
        let parsed = Bullet::from_record(&b.to_record()).unwrap();
        assert_eq!(parsed.id, b.id);
        assert_eq!(parsed.kind, "gotcha");
        assert_eq!(parsed.text, "LIKE is case-sensitive");
        assert_eq!(parsed.status.as_deref(), Some("pending"));
        assert!(!parsed.deleted);
    }

    #[test]
    fn tombstone_marks_deleted() {
        let t = Bullet::tombstone("b-deadbeef");
        let parsed = Bullet::from_record(&t).unwrap();
        assert!(parsed.deleted);
        assert_eq!(parsed.id, "b-deadbeef");
    }

    #[test]
    fn review_hint_respects_threshold() {
        let mut node = Node::new("kg1", "Rust lifetimes", "concept");
        node.bullets.push(Bullet::new("fact", "ownership is explicit", None));
        node.token_budget = 100.0;
        assert!(node.review_hint(500.0, 1).is_none());
        node.token_budget = 600.0;
        assert!(node.review_hint(500.0, 1).is_some());
    }
}
