//! Assembly rules: how reconstructed children combine under a parent.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

use crate::atom::Modality;
use crate::atomizer::PnmHeader;
use crate::order::OrderKey;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssemblyRule {
    /// Emit the atom's own value.
    Leaf,
    /// Concatenate byte parts, or stack rasters vertically.
    Concatenate,
    /// Place cells at their `(row, col, depth)` offsets.
    Place,
}

pub fn assembly_rule(modality: Modality) -> AssemblyRule {
    match modality {
        Modality::TextToken | Modality::Pixel | Modality::AudioSample | Modality::WeightScalar => {
            AssemblyRule::Leaf
        }
        Modality::TextSpan | Modality::AudioClip | Modality::DocumentRoot => {
            AssemblyRule::Concatenate
        }
        Modality::ImageBand | Modality::TensorSlice => AssemblyRule::Place,
    }
}

/// Dense row-major grid of fixed-size cells (depth innermost).
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Raster {
    pub width: usize,
    pub height: usize,
    pub depth: usize,
    pub cell_bytes: usize,
    pub data: Vec<u8>,
}

impl Raster {
    /// Encode as binary PGM/PPM when the cell layout allows it.
    pub fn to_pnm(&self) -> Option<Vec<u8>> {
        if self.depth != 1 || !(self.cell_bytes == 1 || self.cell_bytes == 3) {
            return None;
        }
        let mut out = PnmHeader::encode(self.width, self.height, self.cell_bytes);
        out.extend_from_slice(&self.data);
        Some(out)
    }
}

/// Intermediate result of reconstructing a subtree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Part {
    Bytes(Vec<u8>),
    Raster(Raster),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AssemblyError {
    MixedParts,
    NotSpatial(OrderKey),
    DuplicateCell(OrderKey),
    Hole { row: usize, col: usize, depth: usize },
    CellSize { expected: usize, actual: usize },
    WidthMismatch { expected: usize, actual: usize },
    NestedRaster,
    NotUtf8,
}

impl fmt::Display for AssemblyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssemblyError::MixedParts => write!(f, "cannot concatenate byte and raster parts"),
            AssemblyError::NotSpatial(k) => write!(f, "order key {k} is not a spatial offset"),
            AssemblyError::DuplicateCell(k) => write!(f, "duplicate cell at {k}"),
            AssemblyError::Hole { row, col, depth } => {
                write!(f, "missing cell at ({row},{col},{depth})")
            }
            AssemblyError::CellSize { expected, actual } => {
                write!(f, "cell size {actual} differs from {expected}")
            }
            AssemblyError::WidthMismatch { expected, actual } => {
                write!(f, "raster width {actual} differs from {expected}")
            }
            AssemblyError::NestedRaster => write!(f, "raster cells must be leaf values"),
            AssemblyError::NotUtf8 => write!(f, "text content is not valid UTF-8"),
        }
    }
}

impl std::error::Error for AssemblyError {}

/// Concatenate byte parts in order, or stack rasters of equal width.
pub fn concatenate(parts: Vec<Part>) -> Result<Part, AssemblyError> {
    let mut iter = parts.into_iter();
    let Some(first) = iter.next() else {
        return Ok(Part::Bytes(Vec::new()));
    };
    match first {
        Part::Bytes(mut out) => {
            for part in iter {
                match part {
                    Part::Bytes(b) => out.extend_from_slice(&b),
                    Part::Raster(_) => return Err(AssemblyError::MixedParts),
                }
            }
            Ok(Part::Bytes(out))
        }
        Part::Raster(mut out) => {
            for part in iter {
                let Part::Raster(r) = part else {
                    return Err(AssemblyError::MixedParts);
                };
                if r.width != out.width || r.depth != out.depth {
                    return Err(AssemblyError::WidthMismatch {
                        expected: out.width,
                        actual: r.width,
                    });
                }
                if r.cell_bytes != out.cell_bytes {
                    return Err(AssemblyError::CellSize {
                        expected: out.cell_bytes,
                        actual: r.cell_bytes,
                    });
                }
                out.height += r.height;
                out.data.extend_from_slice(&r.data);
            }
            Ok(Part::Raster(out))
        }
    }
}

/// Place leaf cells at their spatial offsets. Every cell of the bounding
/// grid must be present exactly once and all cells must share one size.
pub fn place(cells: Vec<(OrderKey, Part)>) -> Result<Raster, AssemblyError> {
    let mut width = 0usize;
    let mut height = 0usize;
    let mut depth = 0usize;
    let mut cell_bytes: Option<usize> = None;
    let mut grid: HashMap<(usize, usize, usize), Vec<u8>> = HashMap::with_capacity(cells.len());

    for (key, part) in cells {
        let OrderKey::Spatial { row, col, depth: d } = key else {
            return Err(AssemblyError::NotSpatial(key));
        };
        let Part::Bytes(value) = part else {
            return Err(AssemblyError::NestedRaster);
        };
        match cell_bytes {
            None => cell_bytes = Some(value.len()),
            Some(expected) if expected != value.len() => {
                return Err(AssemblyError::CellSize {
                    expected,
                    actual: value.len(),
                });
            }
            Some(_) => {}
        }
        let (r, c, d) = (row as usize, col as usize, d as usize);
        width = width.max(c + 1);
        height = height.max(r + 1);
        depth = depth.max(d + 1);
        if grid.insert((r, c, d), value).is_some() {
            return Err(AssemblyError::DuplicateCell(key));
        }
    }

    let cell_bytes = cell_bytes.unwrap_or(0);
    let mut data = Vec::with_capacity(width * height * depth * cell_bytes);
    for r in 0..height {
        for c in 0..width {
            for d in 0..depth {
                let cell = grid.remove(&(r, c, d)).ok_or(AssemblyError::Hole {
                    row: r,
                    col: c,
                    depth: d,
                })?;
                data.extend_from_slice(&cell);
            }
        }
    }

    Ok(Raster {
        width,
        height,
        depth: depth.max(1),
        cell_bytes,
        data,
    })
}

/// Fully reassembled content.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reconstructed {
    Text(String),
    Bytes(Vec<u8>),
    Raster(Raster),
}

impl Reconstructed {
    pub fn from_part(part: Part, text: bool) -> Result<Self, AssemblyError> {
        match part {
            Part::Bytes(b) if text => String::from_utf8(b)
                .map(Reconstructed::Text)
                .map_err(|_| AssemblyError::NotUtf8),
            Part::Bytes(b) => Ok(Reconstructed::Bytes(b)),
            Part::Raster(r) => Ok(Reconstructed::Raster(r)),
        }
    }

    /// Flat byte rendering: UTF-8 text, raw bytes, or raster cell data.
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Reconstructed::Text(s) => s.into_bytes(),
            Reconstructed::Bytes(b) => b,
            Reconstructed::Raster(r) => r.data,
        }
    }
}
