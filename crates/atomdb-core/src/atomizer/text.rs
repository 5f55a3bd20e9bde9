use std::sync::LazyLock;

use regex::Regex;

use super::{Atomize, AtomizeError, Chunk, Unit, corrupt};
use crate::atom::Modality;
use crate::job::TextGranularity;
use crate::order::OrderKey;

// Word runs, whitespace runs, or single other characters. Together these
// cover every character, so concatenating tokens reproduces the input.
static TOKEN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\w+|\s+|[^\w\s]").unwrap());

#[derive(Clone, Debug)]
pub struct TextAtomizer {
    granularity: TextGranularity,
    chunk_bytes: usize,
    max_atom_bytes: usize,
}

impl TextAtomizer {
    pub fn new(
        granularity: TextGranularity,
        chunk_bytes: usize,
        max_atom_bytes: usize,
    ) -> Result<Self, AtomizeError> {
        if chunk_bytes < 4 {
            return Err(AtomizeError::InvalidParams(format!(
                "text chunk must hold at least one UTF-8 character (4 bytes), got {chunk_bytes}"
            )));
        }
        if max_atom_bytes < 4 {
            return Err(AtomizeError::InvalidParams(format!(
                "atom bound {max_atom_bytes} cannot hold a UTF-8 character"
            )));
        }
        Ok(Self {
            granularity,
            chunk_bytes,
            max_atom_bytes,
        })
    }

    fn units(&self, text: &str) -> Vec<Unit> {
        let pieces: Vec<&str> = match self.granularity {
            TextGranularity::Char => text
                .char_indices()
                .map(|(i, c)| &text[i..i + c.len_utf8()])
                .collect(),
            TextGranularity::Token => TOKEN
                .find_iter(text)
                .flat_map(|m| split_bounded(m.as_str(), self.max_atom_bytes))
                .collect(),
        };

        pieces
            .into_iter()
            .enumerate()
            .map(|(i, p)| Unit {
                value: p.as_bytes().to_vec(),
                key: OrderKey::Sequence(i as u64),
            })
            .collect()
    }
}

/// Split `s` into pieces of at most `max` bytes on character boundaries.
fn split_bounded(s: &str, max: usize) -> Vec<&str> {
    let mut out = Vec::new();
    let mut rest = s;
    while rest.len() > max {
        let mut cut = max;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        out.push(&rest[..cut]);
        rest = &rest[cut..];
    }
    if !rest.is_empty() {
        out.push(rest);
    }
    out
}

fn is_continuation(b: u8) -> bool {
    b & 0b1100_0000 == 0b1000_0000
}

impl Atomize for TextAtomizer {
    fn next_chunk(&self, source: &[u8], cursor: u64) -> Result<Option<Chunk>, AtomizeError> {
        let start = cursor as usize;
        if start >= source.len() {
            return Ok(None);
        }
        if is_continuation(source[start]) {
            return Err(corrupt(start, "cursor is inside a UTF-8 sequence"));
        }

        let mut end = (start + self.chunk_bytes).min(source.len());
        let text = match std::str::from_utf8(&source[start..end]) {
            Ok(s) => s,
            Err(e) => {
                let valid = e.valid_up_to();
                // A character cut by the chunk boundary is not corruption.
                if e.error_len().is_none() && end < source.len() && valid > 0 {
                    end = start + valid;
                    std::str::from_utf8(&source[start..end])
                        .map_err(|_| corrupt(start + valid, "invalid UTF-8"))?
                } else {
                    return Err(corrupt(start + valid, "invalid UTF-8"));
                }
            }
        };

        Ok(Some(Chunk {
            start: cursor,
            end: end as u64,
            payload: (start, end),
            modality: Modality::TextSpan,
            unit_modality: Modality::TextToken,
            units: self.units(text),
        }))
    }
}
