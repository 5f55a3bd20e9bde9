//! Modality-specific decomposers.
//!
//! Every atomizer is a pure function of `(source bytes, cursor)`: it returns
//! the next chunk starting exactly at `cursor`, or `None` once the source is
//! exhausted. Chunk boundaries are deterministic so a resumed job sees the
//! same chunks an uninterrupted one would.

mod audio;
mod image;
mod text;
mod weights;

use std::fmt;

pub use audio::AudioAtomizer;
pub use image::{ImageAtomizer, PnmHeader, parse_pnm_header};
pub use text::TextAtomizer;
pub use weights::WeightsAtomizer;

use crate::atom::{AtomError, Modality, validate_payload};
use crate::constants::ATOM_MAX_BYTES;
use crate::hash::{CompositeHasher, ContentHash, digest};
use crate::job::{AtomizerParams, SourceModality};
use crate::order::OrderKey;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtomizeError {
    /// Source bytes cannot be decoded at `offset`.
    CorruptInput { offset: u64, reason: String },
    InvalidParams(String),
    Atom(AtomError),
}

impl fmt::Display for AtomizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AtomizeError::CorruptInput { offset, reason } => {
                write!(f, "corrupt input at byte {offset}: {reason}")
            }
            AtomizeError::InvalidParams(msg) => write!(f, "invalid atomizer parameters: {msg}"),
            AtomizeError::Atom(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for AtomizeError {}

impl From<AtomError> for AtomizeError {
    fn from(e: AtomError) -> Self {
        AtomizeError::Atom(e)
    }
}

pub(crate) fn corrupt(offset: usize, reason: impl Into<String>) -> AtomizeError {
    AtomizeError::CorruptInput {
        offset: offset as u64,
        reason: reason.into(),
    }
}

/// Chunk size limits, normally taken from engine configuration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChunkLimits {
    pub max_atom_bytes: usize,
    pub text_bytes: usize,
    pub image_rows: usize,
    pub audio_samples: usize,
    pub weight_scalars: usize,
}

impl Default for ChunkLimits {
    fn default() -> Self {
        Self {
            max_atom_bytes: ATOM_MAX_BYTES,
            text_bytes: 4096,
            image_rows: 16,
            audio_samples: 4096,
            weight_scalars: 4096,
        }
    }
}

/// One leaf unit of a chunk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Unit {
    pub value: Vec<u8>,
    pub key: OrderKey,
}

/// A contiguous piece of source, atomized.
#[derive(Clone, Debug, PartialEq)]
pub struct Chunk {
    /// Cursor this chunk starts at.
    pub start: u64,
    /// Cursor after this chunk is committed.
    pub end: u64,
    /// Byte range of the raw payload inside the source (excludes headers).
    pub payload: (usize, usize),
    pub modality: Modality,
    pub unit_modality: Modality,
    pub units: Vec<Unit>,
}

/// A chunk with every digest precomputed, ready for a commit.
#[derive(Clone, Debug)]
pub struct HashedChunk {
    pub chunk: Chunk,
    pub unit_hashes: Vec<ContentHash>,
    pub root_hash: ContentHash,
}

impl Chunk {
    pub fn raw<'a>(&self, source: &'a [u8]) -> &'a [u8] {
        &source[self.payload.0..self.payload.1]
    }

    /// Validate unit sizes and compute leaf and structural digests.
    pub fn hashed(self, max_atom_bytes: usize) -> Result<HashedChunk, AtomizeError> {
        let mut hasher = CompositeHasher::new(self.modality);
        let mut unit_hashes = Vec::with_capacity(self.units.len());
        for unit in &self.units {
            validate_payload(&unit.value, max_atom_bytes)?;
            let h = digest(&unit.value);
            hasher.push(unit.key, &h);
            unit_hashes.push(h);
        }
        Ok(HashedChunk {
            chunk: self,
            unit_hashes,
            root_hash: hasher.finish(),
        })
    }
}

/// Common interface of every decomposer.
pub trait Atomize {
    fn next_chunk(&self, source: &[u8], cursor: u64) -> Result<Option<Chunk>, AtomizeError>;
}

/// Closed set of atomizers, one per source modality.
#[derive(Clone, Debug)]
pub enum Atomizer {
    Text(TextAtomizer),
    Image(ImageAtomizer),
    Audio(AudioAtomizer),
    Weights(WeightsAtomizer),
}

impl Atomizer {
    pub fn new(
        modality: SourceModality,
        params: &AtomizerParams,
        limits: &ChunkLimits,
    ) -> Result<Self, AtomizeError> {
        Ok(match modality {
            SourceModality::Text => Atomizer::Text(TextAtomizer::new(
                params.granularity,
                limits.text_bytes,
                limits.max_atom_bytes,
            )?),
            SourceModality::Image => Atomizer::Image(ImageAtomizer::new(limits.image_rows)?),
            SourceModality::Audio => Atomizer::Audio(AudioAtomizer::new(
                params.sample_width.unwrap_or(2),
                limits.audio_samples,
            )?),
            SourceModality::Weights => Atomizer::Weights(WeightsAtomizer::new(
                params.columns.unwrap_or(1),
                limits.weight_scalars,
            )?),
        })
    }

    pub fn source_modality(&self) -> SourceModality {
        match self {
            Atomizer::Text(_) => SourceModality::Text,
            Atomizer::Image(_) => SourceModality::Image,
            Atomizer::Audio(_) => SourceModality::Audio,
            Atomizer::Weights(_) => SourceModality::Weights,
        }
    }
}

impl Atomize for Atomizer {
    fn next_chunk(&self, source: &[u8], cursor: u64) -> Result<Option<Chunk>, AtomizeError> {
        match self {
            Atomizer::Text(a) => a.next_chunk(source, cursor),
            Atomizer::Image(a) => a.next_chunk(source, cursor),
            Atomizer::Audio(a) => a.next_chunk(source, cursor),
            Atomizer::Weights(a) => a.next_chunk(source, cursor),
        }
    }
}

/// Atomize a whole in-memory source. Convenience for tests and tooling.
pub fn atomize_all(atomizer: &impl Atomize, source: &[u8]) -> Result<Vec<Chunk>, AtomizeError> {
    let mut chunks = Vec::new();
    let mut cursor = 0u64;
    while let Some(chunk) = atomizer.next_chunk(source, cursor)? {
        cursor = chunk.end;
        chunks.push(chunk);
    }
    Ok(chunks)
}
