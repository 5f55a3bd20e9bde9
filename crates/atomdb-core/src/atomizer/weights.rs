use super::{Atomize, AtomizeError, Chunk, Unit, corrupt};
use crate::atom::Modality;
use crate::order::OrderKey;

const SCALAR_BYTES: usize = 4;

/// Raw little-endian f32 tensor laid out row-major with `columns` scalars
/// per row. Each chunk is a slice of whole rows; scalars are keyed by
/// `(row within slice, col, 0)`. Bit patterns are kept verbatim, so NaN
/// payloads and signed zeros survive reconstruction.
#[derive(Clone, Debug)]
pub struct WeightsAtomizer {
    columns: usize,
    rows_per_chunk: usize,
}

impl WeightsAtomizer {
    pub fn new(columns: usize, scalars_per_chunk: usize) -> Result<Self, AtomizeError> {
        if columns == 0 {
            return Err(AtomizeError::InvalidParams("tensor columns must be positive".into()));
        }
        if columns.checked_mul(SCALAR_BYTES).is_none() {
            return Err(AtomizeError::InvalidParams(format!("{columns} tensor columns overflow a row")));
        }
        Ok(Self {
            columns,
            rows_per_chunk: (scalars_per_chunk / columns).max(1),
        })
    }

    fn row_bytes(&self) -> usize {
        self.columns * SCALAR_BYTES
    }
}

impl Atomize for WeightsAtomizer {
    fn next_chunk(&self, source: &[u8], cursor: u64) -> Result<Option<Chunk>, AtomizeError> {
        let start = cursor as usize;
        if start >= source.len() {
            return Ok(None);
        }
        if start % self.row_bytes() != 0 {
            return Err(corrupt(start, "cursor is not on a tensor row boundary"));
        }
        let remaining = source.len() - start;
        let rows = (remaining / self.row_bytes()).min(self.rows_per_chunk);
        if rows == 0 {
            return Err(corrupt(
                start,
                format!(
                    "{remaining} trailing bytes do not form a row of {} f32 scalars",
                    self.columns
                ),
            ));
        }
        let end = start + rows * self.row_bytes();

        let mut units = Vec::with_capacity(rows * self.columns);
        for (i, scalar) in source[start..end].chunks_exact(SCALAR_BYTES).enumerate() {
            let (r, c) = (i / self.columns, i % self.columns);
            units.push(Unit {
                value: scalar.to_vec(),
                key: OrderKey::spatial(r as u32, c as u32),
            });
        }

        Ok(Some(Chunk {
            start: cursor,
            end: end as u64,
            payload: (start, end),
            modality: Modality::TensorSlice,
            unit_modality: Modality::WeightScalar,
            units,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atomizer::atomize_all;

    fn f32s(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn test_rows_and_columns() {
        let src = f32s(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let chunk = WeightsAtomizer::new(3, 100).unwrap().next_chunk(&src, 0).unwrap().unwrap();
        assert_eq!(chunk.units.len(), 6);
        assert_eq!(chunk.units[4].key, OrderKey::spatial(1, 1));
        assert_eq!(chunk.units[4].value, 5.0f32.to_le_bytes().to_vec());
    }

    #[test]
    fn test_slices_hold_whole_rows() {
        let src = f32s(&[0.5; 12]);
        let chunks = atomize_all(&WeightsAtomizer::new(4, 8).unwrap(), &src).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].units.len(), 4);
        assert_eq!(chunks[1].units[0].key, OrderKey::spatial(0, 0));
    }

    #[test]
    fn test_signed_zero_distinct() {
        let src = f32s(&[0.0, -0.0]);
        let chunk = WeightsAtomizer::new(2, 8).unwrap().next_chunk(&src, 0).unwrap().unwrap();
        assert_ne!(chunk.units[0].value, chunk.units[1].value);
    }

    #[test]
    fn test_partial_row_is_corrupt() {
        let src = f32s(&[1.0, 2.0, 3.0]);
        let a = WeightsAtomizer::new(2, 8).unwrap();
        let first = a.next_chunk(&src, 0).unwrap().unwrap();
        assert!(a.next_chunk(&src, first.end).is_err());
    }

    #[test]
    fn test_rejects_bad_column_counts() {
        assert!(matches!(WeightsAtomizer::new(0, 8), Err(AtomizeError::InvalidParams(_))));
        assert!(matches!(
            WeightsAtomizer::new(usize::MAX / 2, 8),
            Err(AtomizeError::InvalidParams(_))
        ));
    }
}
