use super::{Atomize, AtomizeError, Chunk, Unit, corrupt};
use crate::atom::Modality;
use crate::order::OrderKey;

/// Raw little-endian PCM: one atom per sample.
#[derive(Clone, Debug)]
pub struct AudioAtomizer {
    sample_width: usize,
    samples_per_chunk: usize,
}

impl AudioAtomizer {
    pub fn new(sample_width: usize, samples_per_chunk: usize) -> Result<Self, AtomizeError> {
        if !(1..=4).contains(&sample_width) {
            return Err(AtomizeError::InvalidParams(format!(
                "sample width must be 1-4 bytes, got {sample_width}"
            )));
        }
        if samples_per_chunk == 0 {
            return Err(AtomizeError::InvalidParams("samples per chunk must be positive".into()));
        }
        Ok(Self {
            sample_width,
            samples_per_chunk,
        })
    }
}

impl Atomize for AudioAtomizer {
    fn next_chunk(&self, source: &[u8], cursor: u64) -> Result<Option<Chunk>, AtomizeError> {
        let start = cursor as usize;
        if start >= source.len() {
            return Ok(None);
        }
        if start % self.sample_width != 0 {
            return Err(corrupt(start, "cursor is not on a sample boundary"));
        }
        let remaining = source.len() - start;
        let samples = (remaining / self.sample_width).min(self.samples_per_chunk);
        if samples == 0 {
            return Err(corrupt(
                start,
                format!("{remaining} trailing bytes do not form a {}-byte sample", self.sample_width),
            ));
        }
        let end = start + samples * self.sample_width;

        let units = source[start..end]
            .chunks_exact(self.sample_width)
            .enumerate()
            .map(|(i, s)| Unit {
                value: s.to_vec(),
                key: OrderKey::Sequence(i as u64),
            })
            .collect();

        Ok(Some(Chunk {
            start: cursor,
            end: end as u64,
            payload: (start, end),
            modality: Modality::AudioClip,
            unit_modality: Modality::AudioSample,
            units,
        }))
    }
}
