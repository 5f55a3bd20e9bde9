//! Math boundary: embedding generation and vector distance.
//!
//! The engine only depends on these traits. Accelerated host implementations
//! plug in behind them; the reference implementations here are portable and
//! deterministic.

use std::fmt;

use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbedError(pub String);

impl fmt::Display for EmbedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "embedding failed: {}", self.0)
    }
}

impl std::error::Error for EmbedError {}

/// `embed(raw_unit) -> vector`.
pub trait Embedder: Send + Sync {
    fn dim(&self) -> usize;
    fn embed(&self, raw: &[u8]) -> Result<Vec<f32>, EmbedError>;
}

/// `distance(vector, vector) -> float`. Smaller is closer.
pub trait Distance: Send + Sync {
    fn distance(&self, a: &[f32], b: &[f32]) -> f32;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Cosine;

impl Distance for Cosine {
    /// `1 - cos(a, b)`; zero vectors are maximally distant from everything.
    fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        let mut dot = 0.0f64;
        let mut na = 0.0f64;
        let mut nb = 0.0f64;
        for (x, y) in a.iter().zip(b) {
            dot += (*x as f64) * (*y as f64);
            na += (*x as f64) * (*x as f64);
            nb += (*y as f64) * (*y as f64);
        }
        if na == 0.0 || nb == 0.0 {
            return 1.0;
        }
        (1.0 - dot / (na.sqrt() * nb.sqrt())) as f32
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Euclidean;

impl Distance for Euclidean {
    fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        a.iter()
            .zip(b)
            .map(|(x, y)| {
                let d = (*x - *y) as f64;
                d * d
            })
            .sum::<f64>()
            .sqrt() as f32
    }
}

/// Feature-hashing embedder over byte trigrams.
///
/// Each trigram is hashed to a bucket and a sign; counts are accumulated and
/// the vector is L2-normalised. Inputs sharing most trigrams land close
/// together, which is enough to exercise spatial search end to end.
#[derive(Clone, Debug)]
pub struct HashedNgramEmbedder {
    dim: usize,
}

impl HashedNgramEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(1) }
    }
}

impl Embedder for HashedNgramEmbedder {
    fn dim(&self) -> usize {
        self.dim
    }

    fn embed(&self, raw: &[u8]) -> Result<Vec<f32>, EmbedError> {
        let mut v = vec![0.0f32; self.dim];
        if raw.is_empty() {
            return Ok(v);
        }
        let width = raw.len().min(3);
        for gram in raw.windows(width) {
            let h = Sha256::digest(gram);
            let bucket = u64::from_le_bytes([h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7]])
                % self.dim as u64;
            let sign = if h[8] & 1 == 0 { 1.0 } else { -1.0 };
            v[bucket as usize] += sign;
        }
        let n = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if n > 0.0 {
            v.iter_mut().for_each(|x| *x /= n);
        }
        Ok(v)
    }
}
