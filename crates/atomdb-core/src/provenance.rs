//! Provenance boundary. Creation events are handed to an external mirror
//! after commit; publishing must never block the caller.

use serde::{Deserialize, Serialize};

use crate::atom::{AtomId, Modality};
use crate::hash::ContentHash;
use crate::order::OrderKey;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProvenanceEvent {
    AtomCreated {
        atom_id: AtomId,
        modality: Modality,
        content_hash: ContentHash,
    },
    CompositionCreated {
        parent: AtomId,
        child: AtomId,
        key: OrderKey,
    },
}

/// Fire-and-forget sink. Implementations must return promptly and swallow
/// their own delivery failures.
pub trait ProvenanceSink: Send + Sync {
    fn publish(&self, event: ProvenanceEvent);
}

/// Discards every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl ProvenanceSink for NullSink {
    fn publish(&self, _event: ProvenanceEvent) {}
}
