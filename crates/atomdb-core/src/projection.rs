//! Spatial projection: embedding vector → bounded 3-D key.
//!
//! The vector is normalised onto the unit sphere, its squared distances to
//! four fixed anchors are measured, and those distances are multilaterated
//! against a regular tetrahedron with vertices
//! `(1,1,1) (1,-1,-1) (-1,1,-1) (-1,-1,1)`. For unit vectors
//! `d_i² = 2 - 2·c_i` where `c_i` is the cosine to anchor `i`, so the
//! linearised system has the closed form
//!
//! ```text
//! b_i = c_i - c_0            (i = 1..3)
//! t   = -(b_1 + b_2 + b_3) / 4
//! key = (t + b_1/2, t + b_2/2, t + b_3/2)
//! ```
//!
//! The key is a linear function of the cosines, hence deterministic,
//! Lipschitz in the normalised input, and bounded.

use std::fmt;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::constants::{ANCHOR_COUNT, EPSILON, SPATIAL_DOMAIN};

/// Lipschitz constant of `project` with respect to the normalised input,
/// in Euclidean key distance. Conservative for orthonormal anchors (exact is √3/2).
pub const KEY_LIPSCHITZ: f64 = 2.6;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpatialKey {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl SpatialKey {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn origin() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }

    pub fn distance(&self, other: &SpatialKey) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    pub fn axes(&self) -> [f64; 3] {
        [self.x, self.y, self.z]
    }

    /// Whether every coordinate is finite and inside the indexed domain.
    pub fn in_domain(&self) -> bool {
        self.axes()
            .iter()
            .all(|v| v.is_finite() && v.abs() <= SPATIAL_DOMAIN)
    }
}

/// Axis-aligned box, inclusive on both ends.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min: SpatialKey,
    pub max: SpatialKey,
}

impl BoundingBox {
    /// Build from two corners in any order.
    pub fn new(a: SpatialKey, b: SpatialKey) -> Self {
        Self {
            min: SpatialKey::new(a.x.min(b.x), a.y.min(b.y), a.z.min(b.z)),
            max: SpatialKey::new(a.x.max(b.x), a.y.max(b.y), a.z.max(b.z)),
        }
    }

    pub fn around(center: SpatialKey, radius: f64) -> Self {
        let r = radius.abs();
        Self::new(
            SpatialKey::new(center.x - r, center.y - r, center.z - r),
            SpatialKey::new(center.x + r, center.y + r, center.z + r),
        )
    }

    pub fn contains(&self, key: &SpatialKey) -> bool {
        key.x >= self.min.x
            && key.x <= self.max.x
            && key.y >= self.min.y
            && key.y <= self.max.y
            && key.z >= self.min.z
            && key.z <= self.max.z
    }

    /// Intersection with the indexed domain, or `None` when disjoint.
    pub fn clip_to_domain(&self) -> Option<BoundingBox> {
        let lo = -SPATIAL_DOMAIN;
        let hi = SPATIAL_DOMAIN;
        let min = SpatialKey::new(self.min.x.max(lo), self.min.y.max(lo), self.min.z.max(lo));
        let max = SpatialKey::new(self.max.x.min(hi), self.max.y.min(hi), self.max.z.min(hi));
        let valid = min.axes().iter().chain(max.axes().iter()).all(|v| !v.is_nan());
        if !valid || min.x > max.x || min.y > max.y || min.z > max.z {
            return None;
        }
        Some(BoundingBox { min, max })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProjectionError {
    DimensionMismatch { expected: usize, actual: usize },
    InvalidAnchors(String),
    NonFinite,
}

impl fmt::Display for ProjectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProjectionError::DimensionMismatch { expected, actual } => {
                write!(f, "embedding dimension mismatch: expected {expected}, got {actual}")
            }
            ProjectionError::InvalidAnchors(msg) => write!(f, "invalid anchors: {msg}"),
            ProjectionError::NonFinite => write!(f, "embedding contains non-finite values"),
        }
    }
}

impl std::error::Error for ProjectionError {}

/// Four fixed unit-norm reference points in embedding space.
#[derive(Clone, Debug, PartialEq)]
pub struct AnchorSet {
    anchors: Vec<Vec<f64>>,
    dim: usize,
    seed: Option<u64>,
}

impl AnchorSet {
    /// Deterministic orthonormal anchors derived from `seed`.
    /// The same `(seed, dim)` always yields the same anchors.
    pub fn seeded(seed: u64, dim: usize) -> Result<Self, ProjectionError> {
        if dim < ANCHOR_COUNT {
            return Err(ProjectionError::InvalidAnchors(format!(
                "dimension {dim} is smaller than the anchor count {ANCHOR_COUNT}"
            )));
        }
        let mut rng = SmallRng::seed_from_u64(seed);
        let mut anchors: Vec<Vec<f64>> = Vec::with_capacity(ANCHOR_COUNT);

        while anchors.len() < ANCHOR_COUNT {
            let mut v: Vec<f64> = (0..dim).map(|_| rng.random_range(-1.0..1.0)).collect();
            // Gram-Schmidt against the anchors accepted so far
            for a in &anchors {
                let d = dot(&v, a);
                for (vi, ai) in v.iter_mut().zip(a) {
                    *vi -= d * ai;
                }
            }
            let n = norm(&v);
            if n < 1e-6 {
                continue;
            }
            v.iter_mut().for_each(|x| *x /= n);
            anchors.push(v);
        }

        Ok(Self {
            anchors,
            dim,
            seed: Some(seed),
        })
    }

    /// Use caller-chosen anchors (e.g. embeddings of reference atoms).
    /// Vectors are normalised; they need not be orthogonal.
    pub fn from_vectors(vectors: &[Vec<f32>]) -> Result<Self, ProjectionError> {
        if vectors.len() != ANCHOR_COUNT {
            return Err(ProjectionError::InvalidAnchors(format!(
                "expected {ANCHOR_COUNT} anchors, got {}",
                vectors.len()
            )));
        }
        let dim = vectors[0].len();
        let mut anchors = Vec::with_capacity(ANCHOR_COUNT);
        for v in vectors {
            if v.len() != dim {
                return Err(ProjectionError::DimensionMismatch {
                    expected: dim,
                    actual: v.len(),
                });
            }
            let v: Vec<f64> = v.iter().map(|&x| x as f64).collect();
            if v.iter().any(|x| !x.is_finite()) {
                return Err(ProjectionError::NonFinite);
            }
            let n = norm(&v);
            if n < EPSILON {
                return Err(ProjectionError::InvalidAnchors("zero-norm anchor".into()));
            }
            anchors.push(v.into_iter().map(|x| x / n).collect());
        }
        Ok(Self {
            anchors,
            dim,
            seed: None,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    pub fn anchors(&self) -> &[Vec<f64>] {
        &self.anchors
    }

    /// Project an embedding to its spatial key.
    pub fn project(&self, embedding: &[f32]) -> Result<SpatialKey, ProjectionError> {
        if embedding.len() != self.dim {
            return Err(ProjectionError::DimensionMismatch {
                expected: self.dim,
                actual: embedding.len(),
            });
        }
        let v: Vec<f64> = embedding.iter().map(|&x| x as f64).collect();
        if v.iter().any(|x| !x.is_finite()) {
            return Err(ProjectionError::NonFinite);
        }
        let n = norm(&v);
        if n < EPSILON {
            return Ok(SpatialKey::origin());
        }

        let mut c = [0.0f64; ANCHOR_COUNT];
        for (ci, a) in c.iter_mut().zip(&self.anchors) {
            *ci = dot(&v, a) / n;
        }

        let b1 = c[1] - c[0];
        let b2 = c[2] - c[0];
        let b3 = c[3] - c[0];
        let t = -(b1 + b2 + b3) / 4.0;

        let clamp = |x: f64| x.clamp(-SPATIAL_DOMAIN, SPATIAL_DOMAIN);
        Ok(SpatialKey::new(
            clamp(t + b1 / 2.0),
            clamp(t + b2 / 2.0),
            clamp(t + b3 / 2.0),
        ))
    }
}

/// Upper bound on key distance between two embeddings `a`, `b`:
/// `KEY_LIPSCHITZ · |a/|a| - b/|b||`, which is at most
/// `2 · KEY_LIPSCHITZ · |a - b| / |a|`.
pub fn stability_bound(perturbation: f64, norm_a: f64) -> f64 {
    if norm_a < EPSILON {
        return f64::INFINITY;
    }
    2.0 * KEY_LIPSCHITZ * perturbation / norm_a
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn norm(v: &[f64]) -> f64 {
    dot(v, v).sqrt()
}
