//! Thread-safe in-memory vector index: exact cosine top-k over a single
//! contiguous row-major matrix.

use crate::error::{KgError, KgResult};
use parking_lot::Mutex;
use std::cmp::Ordering;

#[derive(Default)]
struct Inner {
    ids: Vec<String>,
    /// Row-major N×D. Vec growth doubles capacity, so per-insert cost stays
    /// amortized O(D).
    matrix: Vec<f32>,
    /// Parallel row norms, maintained at insertion so search never has to
    /// renormalize the matrix.
    norms: Vec<f32>,
    dims: usize,
}

impl Inner {
    fn len(&self) -> usize {
        self.ids.len()
    }

    fn row(&self, i: usize) -> &[f32] {
        &self.matrix[i * self.dims..(i + 1) * self.dims]
    }

    fn set_row(&mut self, i: usize, vector: &[f32]) {
        let start = i * self.dims;
        self.matrix[start..start + self.dims].copy_from_slice(vector);
        self.norms[i] = norm(vector);
    }

    fn push(&mut self, id: String, vector: &[f32]) {
        self.ids.push(id);
        self.matrix.extend_from_slice(vector);
        self.norms.push(norm(vector));
    }
}

fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

pub struct VectorIndex {
    inner: Mutex<Inner>,
}

impl Default for VectorIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl VectorIndex {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert or overwrite a single vector.
    pub fn add(&self, id: &str, vector: &[f32]) -> KgResult<()> {
        if vector.is_empty() {
            return Err(KgError::Invalid("empty vector".into()));
        }
        let mut inner = self.inner.lock();
        if inner.dims == 0 {
            inner.dims = vector.len();
        }
        if vector.len() != inner.dims {
            return Err(KgError::Invalid(format!(
                "vector has {} dims, index has {}",
                vector.len(),
                inner.dims
            )));
        }
        match inner.ids.iter().position(|i| i == id) {
            Some(pos) => inner.set_row(pos, vector),
            None => inner.push(id.to_string(), vector),
        }
        Ok(())
    }

    /// Replace the entire index with the given batch, in the given order.
    pub fn add_batch(&self, ids: &[String], vectors: &[Vec<f32>]) -> KgResult<()> {
        if ids.len() != vectors.len() {
            return Err(KgError::Invalid(
                "ids and vectors must have the same length".into(),
            ));
        }
        let dims = vectors.first().map(|v| v.len()).unwrap_or(0);
        if vectors.iter().any(|v| v.len() != dims) {
            return Err(KgError::Invalid("vectors differ in dimensionality".into()));
        }

        let mut inner = self.inner.lock();
        *inner = Inner {
            ids: ids.to_vec(),
            matrix: Vec::with_capacity(ids.len() * dims),
            norms: Vec::with_capacity(ids.len()),
            dims,
        };
        for v in vectors {
            inner.matrix.extend_from_slice(v);
            inner.norms.push(norm(v));
        }
        Ok(())
    }

    /// Remove a vector by id. Unknown ids are a no-op.
    pub fn remove(&self, id: &str) {
        let mut inner = self.inner.lock();
        let Some(pos) = inner.ids.iter().position(|i| i == id) else {
            return;
        };
        let dims = inner.dims;
        inner.ids.remove(pos);
        inner.norms.remove(pos);
        inner.matrix.drain(pos * dims..(pos + 1) * dims);
    }

    /// Cosine top-k: normalized dot product against every row, partial
    /// selection of the best k, ties broken by ascending id for determinism.
    pub fn search(&self, query: &[f32], k: usize) -> KgResult<Vec<(String, f32)>> {
        let inner = self.inner.lock();
        if inner.len() == 0 || k == 0 {
            return Ok(Vec::new());
        }
        if query.len() != inner.dims {
            return Err(KgError::Invalid(format!(
                "query has {} dims, index has {}",
                query.len(),
                inner.dims
            )));
        }

        let q_norm = norm(query);
        let q: Vec<f32> = if q_norm > 0.0 {
            query.iter().map(|x| x / q_norm).collect()
        } else {
            query.to_vec()
        };

        let scores: Vec<f32> = (0..inner.len())
            .map(|i| {
                let n = inner.norms[i];
                if n == 0.0 {
                    return 0.0;
                }
                inner.row(i).iter().zip(&q).map(|(a, b)| a * b).sum::<f32>() / n
            })
            .collect();

        let mut order: Vec<usize> = (0..inner.len()).collect();
        let better = |a: &usize, b: &usize| -> Ordering {
            scores[*b]
                .partial_cmp(&scores[*a])
                .unwrap_or(Ordering::Equal)
                .then_with(|| inner.ids[*a].cmp(&inner.ids[*b]))
        };

        let k = k.min(order.len());
        if k < order.len() {
            order.select_nth_unstable_by(k - 1, better);
            order.truncate(k);
        }
        order.sort_unstable_by(better);

        Ok(order
            .into_iter()
            .map(|i| (inner.ids[i].clone(), scores[i]))
            .collect())
    }
}

/// Brute-force cosine top-k over loose (id, vector) pairs, the in-process
/// fallback path when the vector service is unreachable.
pub fn cosine_top_k(
    query: &[f32],
    rows: &[(String, Vec<f32>)],
    k: usize,
) -> Vec<(String, f32)> {
    let index = VectorIndex::new();
    for (id, v) in rows {
        if v.len() == query.len() {
            let _ = index.add(id, v);
        }
    }
    index.search(query, k).unwrap_or_default()
}
