/// Hard upper bound on an atom's raw payload. Anything larger must be decomposed.
pub const ATOM_MAX_BYTES: usize = 64;

/// Number of projection anchors (one tetrahedron vertex each).
pub const ANCHOR_COUNT: usize = 4;

/// Half-width of the spatial key domain. Projected coordinates lie in
/// `[-SPATIAL_DOMAIN, SPATIAL_DOMAIN]` on every axis.
pub const SPATIAL_DOMAIN: f64 = 2.5;

/// Numerical epsilon for near-zero comparisons
pub const EPSILON: f64 = 1e-12;

/// Default seed for deterministic anchor generation.
pub const DEFAULT_ANCHOR_SEED: u64 = 0x5eed;

/// Default embedding dimension for the reference embedder.
pub const DEFAULT_EMBEDDING_DIM: usize = 256;

/// Default grid resolution (cells per axis) of the spatial index.
pub const DEFAULT_GRID_CELLS: usize = 16;
