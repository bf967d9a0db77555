//! Embedding generation: remote Gemini or local fastembed, with an
//! on-disk cache keyed by content.
//!
//! Providers are selected by the configured model string:
//!
//! - `gemini:<model>`            → remote REST API (needs GEMINI_API_KEY)
//! - `fastembed:<model>` / bare  → local ONNX model, no key needed
//! - `stub:<dims>`               → deterministic hash vectors (tests)

use crate::error::{KgError, KgResult};
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::info;

const GEMINI_DIMENSIONS: usize = 768;
const GEMINI_DOCUMENT_TASK: &str = "RETRIEVAL_DOCUMENT";
const GEMINI_QUERY_TASK: &str = "RETRIEVAL_QUERY";
const REMOTE_TIMEOUT: Duration = Duration::from_secs(30);

/// Text-to-vector provider. All calls are blocking; batch calls are
/// all-or-nothing.
pub trait Embedder: Send + Sync {
    /// Embed a single document. A non-empty `context` is prepended as
    /// `"{context}: {text}"` before embedding.
    fn embed_document(&self, text: &str, context: &str) -> KgResult<Vec<f32>>;

    /// Embed a search query (may use a different task-type hint).
    fn embed_query(&self, text: &str) -> KgResult<Vec<f32>>;

    /// Embed a batch of documents. `contexts`, if present, must be equal in
    /// length to `texts`.
    fn embed_batch(&self, texts: &[String], contexts: Option<&[String]>)
        -> KgResult<Vec<Vec<f32>>>;

    fn dimensions(&self) -> usize;

    /// The model identifier as configured (used for cache segmentation and
    /// embedding staleness checks).
    fn model_id(&self) -> &str;
}

/// Which provider a model string names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmbedderKind {
    Remote { model: String },
    Local { model: String },
    Stub { dims: usize },
}

impl EmbedderKind {
    pub fn parse(model_str: &str) -> KgResult<Self> {
        let lower = model_str.to_ascii_lowercase();
        if let Some(bare) = lower.strip_prefix("gemini:") {
            return Ok(Self::Remote {
                model: bare.to_string(),
            });
        }
        if let Some(bare) = model_str.strip_prefix("fastembed:") {
            return Ok(Self::Local {
                model: bare.to_string(),
            });
        }
        if let Some(dims) = lower.strip_prefix("stub:") {
            let dims: usize = dims
                .parse()
                .map_err(|_| KgError::Invalid(format!("bad stub dims: {model_str}")))?;
            return Ok(Self::Stub { dims });
        }
        if lower.contains(':') {
            return Err(KgError::Unsupported(format!(
                "unknown embedding provider: {model_str}"
            )));
        }
        // No prefix: treat as a fastembed model name.
        Ok(Self::Local {
            model: model_str.to_string(),
        })
    }
}

fn contextual(text: &str, context: &str) -> String {
    if context.is_empty() {
        text.to_string()
    } else {
        format!("{context}: {text}")
    }
}

/// Sanitize a model string for use as a cache directory name.
fn safe_model_name(model: &str) -> String {
    model.replace(['/', ':'], "_")
}

// ---------------------------------------------------------------------------
// GeminiEmbedder
// ---------------------------------------------------------------------------

/// Remote embedder against the Gemini REST API.
pub struct GeminiEmbedder {
    model: String,
    model_id: String,
    api_key: String,
    agent: ureq::Agent,
}

impl GeminiEmbedder {
    pub fn new(model: &str, model_id: &str) -> KgResult<Self> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .or_else(|_| std::env::var("GOOGLE_API_KEY"))
            .map_err(|_| {
                KgError::Unsupported(
                    "gemini embeddings need GEMINI_API_KEY or GOOGLE_API_KEY".into(),
                )
            })?;
        Ok(Self {
            model: model.to_string(),
            model_id: model_id.to_string(),
            api_key,
            agent: ureq::AgentBuilder::new().timeout(REMOTE_TIMEOUT).build(),
        })
    }

    fn endpoint(&self, verb: &str) -> String {
        format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:{verb}",
            self.model
        )
    }

    fn embed_one(&self, text: &str, task_type: &str) -> KgResult<Vec<f32>> {
        let body = json!({
            "content": {"parts": [{"text": text}]},
            "taskType": task_type,
            "outputDimensionality": GEMINI_DIMENSIONS,
        });
        let resp: Value = self
            .agent
            .post(&self.endpoint("embedContent"))
            .set("x-goog-api-key", &self.api_key)
            .send_json(body)
            .map_err(|e| KgError::Transient(format!("gemini embed: {e}")))?
            .into_json()
            .map_err(|e| KgError::Transient(format!("gemini embed response: {e}")))?;

        parse_values(resp.pointer("/embedding/values"))
            .ok_or_else(|| KgError::Transient("gemini returned no embedding".into()))
    }
}

fn parse_values(values: Option<&Value>) -> Option<Vec<f32>> {
    Some(
        values?
            .as_array()?
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect(),
    )
}

impl Embedder for GeminiEmbedder {
    fn embed_document(&self, text: &str, context: &str) -> KgResult<Vec<f32>> {
        self.embed_one(&contextual(text, context), GEMINI_DOCUMENT_TASK)
    }

    fn embed_query(&self, text: &str) -> KgResult<Vec<f32>> {
        self.embed_one(text, GEMINI_QUERY_TASK)
    }

    fn embed_batch(
        &self,
        texts: &[String],
        contexts: Option<&[String]>,
    ) -> KgResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(ctxs) = contexts {
            if ctxs.len() != texts.len() {
                return Err(KgError::Invalid(
                    "contexts must have the same length as texts".into(),
                ));
            }
        }
        let requests: Vec<Value> = texts
            .iter()
            .enumerate()
            .map(|(i, text)| {
                let ctx = contexts.map(|c| c[i].as_str()).unwrap_or("");
                json!({
                    "model": format!("models/{}", self.model),
                    "content": {"parts": [{"text": contextual(text, ctx)}]},
                    "taskType": GEMINI_DOCUMENT_TASK,
                    "outputDimensionality": GEMINI_DIMENSIONS,
                })
            })
            .collect();

        let resp: Value = self
            .agent
            .post(&self.endpoint("batchEmbedContents"))
            .set("x-goog-api-key", &self.api_key)
            .send_json(json!({"requests": requests}))
            .map_err(|e| KgError::Transient(format!("gemini batch embed: {e}")))?
            .into_json()
            .map_err(|e| KgError::Transient(format!("gemini batch response: {e}")))?;

        let embeddings = resp
            .get("embeddings")
            .and_then(Value::as_array)
            .ok_or_else(|| KgError::Transient("gemini returned no embeddings".into()))?;
        if embeddings.len() != texts.len() {
            return Err(KgError::Transient(format!(
                "gemini returned {} embeddings for {} texts",
                embeddings.len(),
                texts.len()
            )));
        }
        embeddings
            .iter()
            .map(|e| {
                parse_values(e.get("values"))
                    .ok_or_else(|| KgError::Transient("gemini embedding missing values".into()))
            })
            .collect()
    }

    fn dimensions(&self) -> usize {
        GEMINI_DIMENSIONS
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

// ---------------------------------------------------------------------------
// LocalEmbedder
// ---------------------------------------------------------------------------

/// Local embedder over a fastembed ONNX model. The model downloads on first
/// use and is held behind a mutex (the tokenizer is not Sync).
pub struct LocalEmbedder {
    model_name: String,
    model_id: String,
    variant: EmbeddingModel,
    dims: usize,
    model: Mutex<Option<TextEmbedding>>,
}

impl LocalEmbedder {
    pub fn new(model_name: &str, model_id: &str) -> KgResult<Self> {
        let info = TextEmbedding::list_supported_models()
            .into_iter()
            .find(|m| m.model_code == model_name)
            .ok_or_else(|| {
                KgError::Unsupported(format!("fastembed model not available: {model_name}"))
            })?;
        Ok(Self {
            model_name: model_name.to_string(),
            model_id: model_id.to_string(),
            variant: info.model,
            dims: info.dim,
            model: Mutex::new(None),
        })
    }

    fn with_model<T>(&self, f: impl FnOnce(&mut TextEmbedding) -> KgResult<T>) -> KgResult<T> {
        let mut guard = self
            .model
            .lock()
            .map_err(|e| KgError::Transient(format!("embedder lock poisoned: {e}")))?;
        if guard.is_none() {
            info!(model = %self.model_name, dims = self.dims, "initializing local embedding model");
            let model = TextEmbedding::try_new(
                InitOptions::new(self.variant.clone()).with_show_download_progress(false),
            )
            .map_err(|e| KgError::Transient(format!("init {}: {e}", self.model_name)))?;
            *guard = Some(model);
        }
        f(guard.as_mut().expect("model initialized above"))
    }
}

impl Embedder for LocalEmbedder {
    fn embed_document(&self, text: &str, context: &str) -> KgResult<Vec<f32>> {
        let full = contextual(text, context);
        self.with_model(|m| {
            let mut out = m
                .embed(vec![full.clone()], None)
                .map_err(|e| KgError::Transient(format!("embed: {e}")))?;
            out.pop()
                .ok_or_else(|| KgError::Transient("model returned no embedding".into()))
        })
    }

    fn embed_query(&self, text: &str) -> KgResult<Vec<f32>> {
        self.embed_document(text, "")
    }

    fn embed_batch(
        &self,
        texts: &[String],
        contexts: Option<&[String]>,
    ) -> KgResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(ctxs) = contexts {
            if ctxs.len() != texts.len() {
                return Err(KgError::Invalid(
                    "contexts must have the same length as texts".into(),
                ));
            }
        }
        let full: Vec<String> = texts
            .iter()
            .enumerate()
            .map(|(i, t)| contextual(t, contexts.map(|c| c[i].as_str()).unwrap_or("")))
            .collect();
        self.with_model(|m| {
            m.embed(full.clone(), None)
                .map_err(|e| KgError::Transient(format!("batch embed: {e}")))
        })
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

// ---------------------------------------------------------------------------
// StubEmbedder
// ---------------------------------------------------------------------------

/// Deterministic embedder for tests and offline runs: vectors are derived
/// from a sha256 of the input, so equal text always embeds identically.
pub struct StubEmbedder {
    dims: usize,
    model_id: String,
}

impl StubEmbedder {
    pub fn new(dims: usize, model_id: &str) -> Self {
        Self {
            dims,
            model_id: model_id.to_string(),
        }
    }

    fn hash_vector(&self, text: &str) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.dims);
        let mut counter = 0u32;
        while out.len() < self.dims {
            let mut hasher = Sha256::new();
            hasher.update(counter.to_le_bytes());
            hasher.update(text.as_bytes());
            let digest = hasher.finalize();
            for chunk in digest.chunks_exact(4) {
                if out.len() >= self.dims {
                    break;
                }
                let n = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                // Map to [-1, 1).
                out.push((n as f32 / u32::MAX as f32) * 2.0 - 1.0);
            }
            counter += 1;
        }
        out
    }
}

impl Embedder for StubEmbedder {
    fn embed_document(&self, text: &str, context: &str) -> KgResult<Vec<f32>> {
        Ok(self.hash_vector(&contextual(text, context)))
    }

    fn embed_query(&self, text: &str) -> KgResult<Vec<f32>> {
        Ok(self.hash_vector(text))
    }

    fn embed_batch(
        &self,
        texts: &[String],
        contexts: Option<&[String]>,
    ) -> KgResult<Vec<Vec<f32>>> {
        if let Some(ctxs) = contexts {
            if ctxs.len() != texts.len() {
                return Err(KgError::Invalid(
                    "contexts must have the same length as texts".into(),
                ));
            }
        }
        texts
            .iter()
            .enumerate()
            .map(|(i, t)| self.embed_document(t, contexts.map(|c| c[i].as_str()).unwrap_or("")))
            .collect()
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

// ---------------------------------------------------------------------------
// CachedEmbedder
// ---------------------------------------------------------------------------

/// Content-addressed disk cache around any embedder.
///
/// Key: sha256 of `"{task_type}:{context}:{text}:{dims}"`. The cache
/// directory is segmented by a filesystem-safe encoding of the model
/// identifier, so switching models transparently invalidates entries.
/// Payloads are raw little-endian f32 bytes, written via temp-file rename so
/// concurrent readers and writers need no locking.
pub struct CachedEmbedder {
    inner: Box<dyn Embedder>,
    model_dir: PathBuf,
}

impl CachedEmbedder {
    pub fn new(inner: Box<dyn Embedder>, cache_dir: &Path) -> Self {
        let model_dir = cache_dir.join(safe_model_name(inner.model_id()));
        Self { inner, model_dir }
    }

    pub fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    pub fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    fn cache_key(&self, text: &str, context: &str, task_type: &str) -> String {
        let raw = format!("{task_type}:{context}:{text}:{}", self.inner.dimensions());
        let mut hasher = Sha256::new();
        hasher.update(raw.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn cache_path(&self, key: &str) -> PathBuf {
        self.model_dir.join(format!("{key}.vec"))
    }

    fn cache_get(&self, key: &str) -> Option<Vec<f32>> {
        let bytes = std::fs::read(self.cache_path(key)).ok()?;
        if bytes.is_empty() || bytes.len() % 4 != 0 {
            return None;
        }
        Some(
            bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        )
    }

    fn cache_put(&self, key: &str, vector: &[f32]) {
        let bytes: Vec<u8> = vector.iter().flat_map(|f| f.to_le_bytes()).collect();
        let path = self.cache_path(key);
        let tmp = path.with_extension("tmp");
        let write = || -> std::io::Result<()> {
            std::fs::create_dir_all(&self.model_dir)?;
            std::fs::write(&tmp, &bytes)?;
            std::fs::rename(&tmp, &path)
        };
        if let Err(e) = write() {
            tracing::debug!(error = %e, "embedding cache write failed");
        }
    }

    pub fn embed_document(&self, text: &str, context: &str) -> KgResult<Vec<f32>> {
        let key = self.cache_key(text, context, "document");
        if let Some(cached) = self.cache_get(&key) {
            return Ok(cached);
        }
        let vector = self.inner.embed_document(text, context)?;
        self.cache_put(&key, &vector);
        Ok(vector)
    }

    pub fn embed_query(&self, text: &str) -> KgResult<Vec<f32>> {
        let key = self.cache_key(text, "", "query");
        if let Some(cached) = self.cache_get(&key) {
            return Ok(cached);
        }
        let vector = self.inner.embed_query(text)?;
        self.cache_put(&key, &vector);
        Ok(vector)
    }

    /// Batch embed with per-item cache hits; only misses reach the provider,
    /// in one all-or-nothing call.
    pub fn embed_batch(
        &self,
        texts: &[String],
        contexts: Option<&[String]>,
    ) -> KgResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(ctxs) = contexts {
            if ctxs.len() != texts.len() {
                return Err(KgError::Invalid(
                    "contexts must have the same length as texts".into(),
                ));
            }
        }

        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut miss_indices = Vec::new();
        let mut miss_texts = Vec::new();
        let mut miss_contexts = Vec::new();

        for (i, text) in texts.iter().enumerate() {
            let ctx = contexts.map(|c| c[i].as_str()).unwrap_or("");
            let key = self.cache_key(text, ctx, "document");
            match self.cache_get(&key) {
                Some(vector) => results[i] = Some(vector),
                None => {
                    miss_indices.push(i);
                    miss_texts.push(text.clone());
                    miss_contexts.push(ctx.to_string());
                }
            }
        }

        if !miss_texts.is_empty() {
            let fresh = self.inner.embed_batch(&miss_texts, Some(&miss_contexts))?;
            for ((i, text), vector) in miss_indices.iter().zip(&miss_texts).zip(fresh) {
                let ctx = contexts.map(|c| c[*i].as_str()).unwrap_or("");
                let key = self.cache_key(text, ctx, "document");
                self.cache_put(&key, &vector);
                results[*i] = Some(vector);
            }
        }

        Ok(results.into_iter().flatten().collect())
    }
}

/// Factory: build the cached embedder the configured model string names.
pub fn get_embedder(model_str: &str, cache_dir: &Path) -> KgResult<CachedEmbedder> {
    let inner: Box<dyn Embedder> = match EmbedderKind::parse(model_str)? {
        EmbedderKind::Remote { model } => Box::new(GeminiEmbedder::new(&model, model_str)?),
        EmbedderKind::Local { model } => Box::new(LocalEmbedder::new(&model, model_str)?),
        EmbedderKind::Stub { dims } => Box::new(StubEmbedder::new(dims, model_str)),
    };
    Ok(CachedEmbedder::new(inner, cache_dir))
}
