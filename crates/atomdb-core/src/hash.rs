//! Content identity: SHA-256 digests over raw payloads and structural digests
//! over ordered children.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::atom::Modality;
use crate::order::OrderKey;

/// 256-bit content digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash(pub [u8; 32]);

/// Digest a raw payload. Pure and deterministic.
pub fn digest(bytes: &[u8]) -> ContentHash {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    ContentHash(hasher.finalize().into())
}

impl ContentHash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseHashError(pub String);

impl fmt::Display for ParseHashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid content hash: {}", self.0)
    }
}

impl std::error::Error for ParseHashError {}

impl FromStr for ContentHash {
    type Err = ParseHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 {
            return Err(ParseHashError(format!(
                "expected 64 hex characters, got {}",
                s.len()
            )));
        }
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out).map_err(|e| ParseHashError(format!("{s}: {e}")))?;
        Ok(Self(out))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..12])
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Incremental structural digest for composite atoms.
///
/// Feeds the composite modality tag, then each child's order key and content
/// hash in order. Two composites hash equal iff they have the same modality
/// and identical ordered children.
pub struct CompositeHasher {
    inner: Sha256,
}

impl CompositeHasher {
    pub fn new(modality: Modality) -> Self {
        let mut inner = Sha256::new();
        inner.update(b"atomdb/composite/v1\0");
        inner.update(modality.as_str().as_bytes());
        inner.update([0u8]);
        Self { inner }
    }

    pub fn push(&mut self, key: OrderKey, child: &ContentHash) {
        self.inner.update(key.encode());
        self.inner.update(child.0);
    }

    pub fn finish(self) -> ContentHash {
        ContentHash(self.inner.finalize().into())
    }
}

/// Anchor digest for a document root owned by one ingestion job.
pub fn anchor_digest(job_id: &uuid::Uuid) -> ContentHash {
    let mut hasher = Sha256::new();
    hasher.update(b"atomdb/anchor/v1\0");
    hasher.update(job_id.as_bytes());
    ContentHash(hasher.finalize().into())
}
