use super::{Atomize, AtomizeError, Chunk, Unit, corrupt};
use crate::atom::Modality;
use crate::order::OrderKey;

/// Parsed binary PGM (P5) / PPM (P6) header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PnmHeader {
    pub width: usize,
    pub height: usize,
    pub channels: usize,
    /// Offset of the first pixel byte.
    pub data_offset: usize,
}

impl PnmHeader {
    pub fn row_bytes(&self) -> usize {
        self.width.saturating_mul(self.channels)
    }

    /// Saturates on headers that did not come from `parse_pnm_header`.
    pub fn data_end(&self) -> usize {
        self.row_bytes()
            .saturating_mul(self.height)
            .saturating_add(self.data_offset)
    }

    /// Render a header for `width × height` pixels of `channels` bytes each.
    pub fn encode(width: usize, height: usize, channels: usize) -> Vec<u8> {
        let magic = if channels == 1 { "P5" } else { "P6" };
        format!("{magic}\n{width} {height}\n255\n").into_bytes()
    }
}

fn skip_space_and_comments(src: &[u8], mut pos: usize) -> usize {
    loop {
        while pos < src.len() && src[pos].is_ascii_whitespace() {
            pos += 1;
        }
        if pos < src.len() && src[pos] == b'#' {
            while pos < src.len() && src[pos] != b'\n' {
                pos += 1;
            }
            continue;
        }
        return pos;
    }
}

fn read_number(src: &[u8], pos: usize) -> Result<(usize, usize), AtomizeError> {
    let start = skip_space_and_comments(src, pos);
    let mut end = start;
    while end < src.len() && src[end].is_ascii_digit() {
        end += 1;
    }
    if end == start {
        return Err(corrupt(start, "expected a number in PNM header"));
    }
    let text = std::str::from_utf8(&src[start..end]).map_err(|_| corrupt(start, "bad digits"))?;
    let n = text
        .parse::<usize>()
        .map_err(|_| corrupt(start, "number out of range in PNM header"))?;
    Ok((n, end))
}

pub fn parse_pnm_header(src: &[u8]) -> Result<PnmHeader, AtomizeError> {
    if src.len() < 2 || src[0] != b'P' {
        return Err(corrupt(0, "missing PNM magic"));
    }
    let channels = match src[1] {
        b'5' => 1,
        b'6' => 3,
        _ => return Err(corrupt(1, "only binary P5/P6 images are supported")),
    };
    let (width, pos) = read_number(src, 2)?;
    let (height, pos) = read_number(src, pos)?;
    let (maxval, pos) = read_number(src, pos)?;
    if maxval == 0 || maxval > 255 {
        return Err(corrupt(pos, format!("unsupported maxval {maxval}")));
    }
    if pos >= src.len() || !src[pos].is_ascii_whitespace() {
        return Err(corrupt(pos, "missing separator after PNM header"));
    }
    let header = PnmHeader {
        width,
        height,
        channels,
        data_offset: pos + 1,
    };
    let needed = width
        .checked_mul(height)
        .and_then(|p| p.checked_mul(channels))
        .and_then(|n| n.checked_add(header.data_offset))
        .ok_or_else(|| corrupt(0, "image dimensions overflow"))?;
    if src.len() < needed {
        return Err(corrupt(src.len(), "truncated pixel data"));
    }
    Ok(header)
}

/// Decomposes an image into pixel atoms, one band of rows per chunk.
/// Pixels are keyed by `(row within band, col, 0)`.
#[derive(Clone, Debug)]
pub struct ImageAtomizer {
    rows_per_chunk: usize,
}

impl ImageAtomizer {
    pub fn new(rows_per_chunk: usize) -> Result<Self, AtomizeError> {
        if rows_per_chunk == 0 {
            return Err(AtomizeError::InvalidParams("rows per chunk must be positive".into()));
        }
        Ok(Self { rows_per_chunk })
    }
}

impl Atomize for ImageAtomizer {
    fn next_chunk(&self, source: &[u8], cursor: u64) -> Result<Option<Chunk>, AtomizeError> {
        let header = parse_pnm_header(source)?;
        let pos = (cursor as usize).max(header.data_offset);
        if pos >= header.data_end() || header.row_bytes() == 0 {
            return Ok(None);
        }
        let offset = pos - header.data_offset;
        if offset % header.row_bytes() != 0 {
            return Err(corrupt(pos, "cursor is not on a row boundary"));
        }

        let first_row = offset / header.row_bytes();
        let rows = self.rows_per_chunk.min(header.height - first_row);
        let end = pos + rows * header.row_bytes();

        let mut units = Vec::with_capacity(rows * header.width);
        for r in 0..rows {
            let row_start = pos + r * header.row_bytes();
            for c in 0..header.width {
                let px = row_start + c * header.channels;
                units.push(Unit {
                    value: source[px..px + header.channels].to_vec(),
                    key: OrderKey::spatial(r as u32, c as u32),
                });
            }
        }

        Ok(Some(Chunk {
            start: cursor,
            end: end as u64,
            payload: (pos, end),
            modality: Modality::ImageBand,
            unit_modality: Modality::Pixel,
            units,
        }))
    }
}
