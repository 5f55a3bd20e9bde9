use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::ATOM_MAX_BYTES;
use crate::hash::ContentHash;

/// Stable surrogate identifier assigned on first insertion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AtomId(pub i64);

impl fmt::Display for AtomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AtomId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<i64>().map(AtomId)
    }
}

/// Domain tag of an atom. Content addressing is scoped per modality:
/// identical bytes under different modalities are different atoms.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Modality {
    TextToken,
    Pixel,
    AudioSample,
    WeightScalar,
    TextSpan,
    ImageBand,
    AudioClip,
    TensorSlice,
    DocumentRoot,
}

impl Modality {
    pub const ALL: [Modality; 9] = [
        Modality::TextToken,
        Modality::Pixel,
        Modality::AudioSample,
        Modality::WeightScalar,
        Modality::TextSpan,
        Modality::ImageBand,
        Modality::AudioClip,
        Modality::TensorSlice,
        Modality::DocumentRoot,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::TextToken => "text-token",
            Modality::Pixel => "pixel",
            Modality::AudioSample => "audio-sample",
            Modality::WeightScalar => "weight-scalar",
            Modality::TextSpan => "text-span",
            Modality::ImageBand => "image-band",
            Modality::AudioClip => "audio-clip",
            Modality::TensorSlice => "tensor-slice",
            Modality::DocumentRoot => "document-root",
        }
    }

    /// Composite atoms carry no value of their own and exist as structural anchors.
    pub fn is_composite(&self) -> bool {
        matches!(
            self,
            Modality::TextSpan
                | Modality::ImageBand
                | Modality::AudioClip
                | Modality::TensorSlice
                | Modality::DocumentRoot
        )
    }

    /// Leaf modality held by chunks of this composite, if any.
    pub fn unit_modality(&self) -> Option<Modality> {
        match self {
            Modality::TextSpan => Some(Modality::TextToken),
            Modality::ImageBand => Some(Modality::Pixel),
            Modality::AudioClip => Some(Modality::AudioSample),
            Modality::TensorSlice => Some(Modality::WeightScalar),
            _ => None,
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownModality(pub String);

impl fmt::Display for UnknownModality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown modality: {}", self.0)
    }
}

impl std::error::Error for UnknownModality {}

impl FromStr for Modality {
    type Err = UnknownModality;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Modality::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| UnknownModality(s.to_string()))
    }
}

/// One row of the canonical atom table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AtomRecord {
    pub atom_id: AtomId,
    pub modality: Modality,
    pub content_hash: ContentHash,
    pub value: Option<Vec<u8>>,
    pub reference_count: i64,
    pub is_deleted: bool,
    pub dedup_hits: i64,
    pub created_at: u64,
    pub deleted_at: Option<u64>,
}

impl AtomRecord {
    pub fn is_live(&self) -> bool {
        !self.is_deleted
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtomError {
    PayloadTooLarge { len: usize, max: usize },
}

impl fmt::Display for AtomError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AtomError::PayloadTooLarge { len, max } => {
                write!(f, "payload of {len} bytes exceeds atom bound of {max} bytes")
            }
        }
    }
}

impl std::error::Error for AtomError {}

/// Check a leaf payload against the atom size bound.
/// `max` is clamped to [`ATOM_MAX_BYTES`]; configuration may lower the bound, never raise it.
pub fn validate_payload(value: &[u8], max: usize) -> Result<(), AtomError> {
    let max = max.min(ATOM_MAX_BYTES);
    if value.len() > max {
        return Err(AtomError::PayloadTooLarge {
            len: value.len(),
            max,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modality_str_roundtrip() {
        for m in Modality::ALL {
            assert_eq!(m.as_str().parse::<Modality>().unwrap(), m);
        }
        assert!("bogus".parse::<Modality>().is_err());
    }

    #[test]
    fn test_composite_flags() {
        assert!(!Modality::TextToken.is_composite());
        assert!(Modality::ImageBand.is_composite());
        assert!(Modality::DocumentRoot.is_composite());
        assert_eq!(Modality::ImageBand.unit_modality(), Some(Modality::Pixel));
        assert_eq!(Modality::DocumentRoot.unit_modality(), None);
    }

    #[test]
    fn test_validate_payload_bound() {
        assert!(validate_payload(&[0u8; 64], 64).is_ok());
        assert_eq!(
            validate_payload(&[0u8; 65], 64),
            Err(AtomError::PayloadTooLarge { len: 65, max: 64 })
        );
    }

    #[test]
    fn test_validate_payload_cannot_raise_bound() {
        assert!(validate_payload(&[0u8; 65], 1024).is_err());
        assert!(validate_payload(&[0u8; 9], 8).is_err());
    }

    #[test]
    fn test_modality_serde_kebab() {
        let json = serde_json::to_string(&Modality::WeightScalar).unwrap();
        assert_eq!(json, "\"weight-scalar\"");
    }
}
