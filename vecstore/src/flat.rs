use std::cmp::Ordering;

use crate::dot::inner_product;
use crate::error::VecError;

/// Hit is a single result from a similarity search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hit {
    /// Position of the matched vector inside the index.
    pub slot: usize,

    /// Raw inner product between the query and the matched vector.
    /// Higher values indicate higher similarity.
    pub score: f32,
}

/// FlatIndex is a dense, positional embedding index searched exhaustively
/// by inner product.
///
/// Vectors live in one contiguous buffer. Slots are assigned in insertion
/// order (`slot == len()` at the time of `add`) and the buffer is kept
/// compact: removing slot `s` shifts every vector after it down by one.
///
/// The index does no locking of its own; the owner serializes mutation.
#[derive(Debug, Clone)]
pub struct FlatIndex {
    dim: usize,
    data: Vec<f32>,
}

impl FlatIndex {
    /// Create an empty index for vectors of length `dim`.
    /// Panics if `dim` is 0.
    pub fn new(dim: usize) -> Self {
        assert!(dim > 0, "vecstore: FlatIndex dim must be positive");
        Self {
            dim,
            data: Vec::new(),
        }
    }

    /// Build from a decoded snapshot buffer. `data.len()` must be a
    /// multiple of `dim`.
    pub(crate) fn from_raw(dim: usize, data: Vec<f32>) -> Self {
        debug_assert!(dim > 0 && data.len() % dim == 0);
        Self { dim, data }
    }

    pub(crate) fn raw(&self) -> &[f32] {
        &self.data
    }

    /// Vector dimension accepted by this index.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of stored vectors.
    pub fn len(&self) -> usize {
        self.data.len() / self.dim
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Append a vector and return its slot.
    pub fn add(&mut self, vector: &[f32]) -> Result<usize, VecError> {
        self.check(vector)?;
        let slot = self.len();
        self.data.extend_from_slice(vector);
        Ok(slot)
    }

    /// Return up to `k` entries ordered by descending score. Equal scores
    /// are ordered by ascending slot. An empty index yields no hits.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Hit>, VecError> {
        self.check(query)?;
        if self.is_empty() || k == 0 {
            return Ok(vec![]);
        }

        let mut hits: Vec<Hit> = self
            .data
            .chunks_exact(self.dim)
            .enumerate()
            .map(|(slot, v)| Hit {
                slot,
                score: inner_product(query, v),
            })
            .collect();

        hits.sort_by(|a, b| match b.score.total_cmp(&a.score) {
            Ordering::Equal => a.slot.cmp(&b.slot),
            ord => ord,
        });
        hits.truncate(k);
        Ok(hits)
    }

    /// Remove the vector at `slot`, shifting later vectors down by one.
    /// Returns the removed vector.
    pub fn remove_at(&mut self, slot: usize) -> Result<Vec<f32>, VecError> {
        let count = self.len();
        if slot >= count {
            return Err(VecError::SlotOutOfRange { slot, count });
        }
        let start = slot * self.dim;
        Ok(self.data.drain(start..start + self.dim).collect())
    }

    /// Borrow the vector stored at `slot`.
    pub fn vector_at(&self, slot: usize) -> Option<&[f32]> {
        if slot >= self.len() {
            return None;
        }
        let start = slot * self.dim;
        Some(&self.data[start..start + self.dim])
    }

    /// Drop every vector. The dimension is kept.
    pub fn reset(&mut self) {
        self.data.clear();
    }

    fn check(&self, vector: &[f32]) -> Result<(), VecError> {
        if vector.len() != self.dim {
            return Err(VecError::DimensionMismatch {
                got: vector.len(),
                want: self.dim,
            });
        }
        if let Some(pos) = vector.iter().position(|x| !x.is_finite()) {
            return Err(VecError::NonFinite(pos));
        }
        Ok(())
    }
}
