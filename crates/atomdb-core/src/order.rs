use serde::{Deserialize, Serialize};

/// Position of a child under its parent.
///
/// Sequential content (text, audio) uses `Sequence`. Multi-dimensional
/// content (images, tensors) uses `Spatial` offsets. Ordering is
/// row-major for spatial keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKey {
    Sequence(u64),
    Spatial { row: u32, col: u32, depth: u32 },
}

impl OrderKey {
    pub fn spatial(row: u32, col: u32) -> Self {
        Self::Spatial { row, col, depth: 0 }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Sequence(_) => "seq",
            Self::Spatial { .. } => "spatial",
        }
    }

    /// Flatten into three sortable integer components `(a, b, c)`.
    /// Sequence keys use `(index, 0, 0)`.
    pub fn components(&self) -> (i64, i64, i64) {
        match *self {
            Self::Sequence(i) => (i as i64, 0, 0),
            Self::Spatial { row, col, depth } => (row as i64, col as i64, depth as i64),
        }
    }

    pub fn from_components(kind: &str, a: i64, b: i64, c: i64) -> Option<Self> {
        match kind {
            "seq" if a >= 0 => Some(Self::Sequence(a as u64)),
            "spatial" => Some(Self::Spatial {
                row: u32::try_from(a).ok()?,
                col: u32::try_from(b).ok()?,
                depth: u32::try_from(c).ok()?,
            }),
            _ => None,
        }
    }

    /// Fixed-width binary encoding used inside structural digests.
    pub fn encode(&self) -> [u8; 13] {
        let mut out = [0u8; 13];
        match *self {
            Self::Sequence(i) => {
                out[0] = 0;
                out[1..9].copy_from_slice(&i.to_le_bytes());
            }
            Self::Spatial { row, col, depth } => {
                out[0] = 1;
                out[1..5].copy_from_slice(&row.to_le_bytes());
                out[5..9].copy_from_slice(&col.to_le_bytes());
                out[9..13].copy_from_slice(&depth.to_le_bytes());
            }
        }
        out
    }
}

impl std::fmt::Display for OrderKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sequence(i) => write!(f, "#{i}"),
            Self::Spatial { row, col, depth } => write!(f, "({row},{col},{depth})"),
        }
    }
}
