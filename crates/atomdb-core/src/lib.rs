//! Atomic content-addressable store: the pure model.
//!
//! Content is decomposed into bounded atoms identified by `(modality, hash)`,
//! composed into ordered trees, and projected into a bounded 3-D key space
//! for similarity search.
//!
//! Zero I/O. Persistence and ingestion orchestration live in `atomdb-store`.

pub mod assembly;
pub mod atom;
pub mod atomizer;
pub mod constants;
pub mod embed;
pub mod hash;
pub mod job;
pub mod order;
pub mod projection;
pub mod provenance;
pub mod spatial;
pub mod time;

pub use assembly::{AssemblyError, AssemblyRule, Part, Raster, Reconstructed, assembly_rule};
pub use atom::{AtomError, AtomId, AtomRecord, Modality, UnknownModality, validate_payload};
pub use atomizer::{Atomize, AtomizeError, Atomizer, Chunk, ChunkLimits, HashedChunk, Unit};
pub use constants::{
    ANCHOR_COUNT, ATOM_MAX_BYTES, DEFAULT_ANCHOR_SEED, DEFAULT_EMBEDDING_DIM, DEFAULT_GRID_CELLS,
    EPSILON, SPATIAL_DOMAIN,
};
pub use embed::{Cosine, Distance, EmbedError, Embedder, Euclidean, HashedNgramEmbedder};
pub use hash::{CompositeHasher, ContentHash, ParseHashError, anchor_digest, digest};
pub use job::{AtomizerParams, IngestionJob, JobStatus, SourceModality, TextGranularity};
pub use order::OrderKey;
pub use projection::{AnchorSet, BoundingBox, ProjectionError, SpatialKey, stability_bound};
pub use provenance::{NullSink, ProvenanceEvent, ProvenanceSink};
pub use spatial::SpatialIndex;
