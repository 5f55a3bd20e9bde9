use atomdb_core::assembly::{concatenate, place};
use atomdb_core::{AssemblyError, AssemblyRule, AtomId, Modality, Part, Reconstructed, assembly_rule};

use crate::error::{Result, StoreError};
use crate::store::Store;

impl Store {
    /// Rebuild the content under `root` depth-first, in key order.
    pub fn reconstruct(&self, root: AtomId) -> Result<Reconstructed> {
        let (part, modality) = self.assemble(root, root, 0)?;
        let text = match modality {
            Modality::TextToken | Modality::TextSpan => true,
            Modality::DocumentRoot => self.first_child_modality(root)? == Some(Modality::TextSpan),
            _ => false,
        };
        Reconstructed::from_part(part, text).map_err(|e| broken(root, e))
    }

    fn assemble(&self, id: AtomId, parent: AtomId, depth: u32) -> Result<(Part, Modality)> {
        if depth > self.config().max_composition_depth {
            return Err(StoreError::CompositionTooDeep {
                child: id,
                limit: self.config().max_composition_depth,
            });
        }
        let record = match self.get(id)? {
            Some(r) if r.is_live() => r,
            Some(_) => {
                return Err(StoreError::BrokenComposition {
                    atom_id: parent,
                    reason: format!("child {id} is deleted"),
                });
            }
            None => {
                return Err(StoreError::BrokenComposition {
                    atom_id: parent,
                    reason: format!("child {id} is missing"),
                });
            }
        };

        let part = match assembly_rule(record.modality) {
            AssemblyRule::Leaf => Part::Bytes(record.value.unwrap_or_default()),
            AssemblyRule::Concatenate => {
                let mut parts = Vec::new();
                for edge in self.children_of(id) {
                    parts.push(self.assemble(edge?.child, id, depth + 1)?.0);
                }
                concatenate(parts).map_err(|e| broken(id, e))?
            }
            AssemblyRule::Place => {
                let mut cells = Vec::new();
                for edge in self.children_of(id) {
                    let edge = edge?;
                    cells.push((edge.key, self.assemble(edge.child, id, depth + 1)?.0));
                }
                Part::Raster(place(cells).map_err(|e| broken(id, e))?)
            }
        };
        Ok((part, record.modality))
    }

    fn first_child_modality(&self, parent: AtomId) -> Result<Option<Modality>> {
        match self.children_of(parent).next() {
            Some(edge) => Ok(self.get(edge?.child)?.map(|r| r.modality)),
            None => Ok(None),
        }
    }
}

fn broken(atom_id: AtomId, e: AssemblyError) -> StoreError {
    StoreError::BrokenComposition {
        atom_id,
        reason: e.to_string(),
    }
}
