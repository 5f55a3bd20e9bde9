//! Sweep of soft-deleted atoms.
//!
//! An atom is collected only while it still has zero references, is marked
//! deleted, has been deleted for at least the grace period, and is not the
//! child of any remaining composition. Collecting a parent drops its edges
//! and releases each child, which may make the child collectable in turn.

use rusqlite::{OptionalExtension, params};
use serde::Serialize;

use atomdb_core::AtomId;

use crate::error::{Result, StoreError};
use crate::store::{Store, now, release_on};

const BATCH: i64 = 256;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    pub collected: Vec<AtomId>,
    pub released_children: u64,
    /// Candidates revived or re-linked between selection and deletion.
    pub skipped: u64,
}

impl Store {
    pub fn collect_garbage(&self, grace_secs: u64) -> Result<GcReport> {
        let mut report = GcReport::default();
        loop {
            let cutoff = now().saturating_sub(grace_secs.min(i64::MAX as u64) as i64);
            let candidates = self.gc_candidates(cutoff)?;
            if candidates.is_empty() {
                break;
            }
            let mut progressed = false;
            for id in candidates {
                match self.collect_one(id, cutoff)? {
                    Some(children) => {
                        report.collected.push(id);
                        report.released_children += children;
                        progressed = true;
                    }
                    None => report.skipped += 1,
                }
            }
            if !progressed {
                break;
            }
        }
        if !report.collected.is_empty() {
            tracing::info!(
                collected = report.collected.len(),
                released = report.released_children,
                skipped = report.skipped,
                "garbage collected"
            );
        }
        Ok(report)
    }

    fn gc_candidates(&self, cutoff: i64) -> Result<Vec<AtomId>> {
        let mut stmt = self.conn().prepare(
            "SELECT atom_id FROM atoms a
             WHERE is_deleted = 1 AND reference_count = 0 AND deleted_at <= ?1
               AND NOT EXISTS (SELECT 1 FROM atom_compositions c WHERE c.child_atom_id = a.atom_id)
             ORDER BY atom_id LIMIT ?2",
        )?;
        let ids: Vec<i64> = stmt
            .query_map(params![cutoff, BATCH], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        Ok(ids.into_iter().map(AtomId).collect())
    }

    /// Delete one atom if it is still collectable. Returns the number of
    /// child references released, or `None` when the guard no longer holds.
    fn collect_one(&self, id: AtomId, cutoff: i64) -> Result<Option<u64>> {
        let tx = self.immediate()?;
        let eligible: Option<i64> = tx
            .query_row(
                "SELECT atom_id FROM atoms a
                 WHERE atom_id = ?1 AND is_deleted = 1 AND reference_count = 0
                   AND deleted_at <= ?2
                   AND NOT EXISTS (SELECT 1 FROM atom_compositions c
                                   WHERE c.child_atom_id = a.atom_id)",
                params![id.0, cutoff],
                |row| row.get(0),
            )
            .optional()?;
        if eligible.is_none() {
            return Ok(None);
        }

        let children: Vec<i64> = {
            let mut stmt =
                tx.prepare("SELECT child_atom_id FROM atom_compositions WHERE parent_atom_id = ?1")?;
            stmt.query_map([id.0], |row| row.get(0))?
                .collect::<std::result::Result<_, _>>()?
        };
        tx.execute("DELETE FROM atom_compositions WHERE parent_atom_id = ?1", [id.0])?;
        tx.execute("DELETE FROM atom_embeddings WHERE atom_id = ?1", [id.0])?;
        tx.execute("DELETE FROM atoms WHERE atom_id = ?1", [id.0])?;

        let mut released = 0u64;
        for child in children {
            match release_on(&tx, AtomId(child)) {
                Ok(_) => released += 1,
                Err(StoreError::ReferenceUnderflow(c)) => {
                    tracing::warn!(parent = %id, child = %c, "child already at zero references");
                }
                Err(e) => return Err(e),
            }
        }
        tx.commit()?;
        tracing::debug!(atom_id = %id, released, "atom collected");
        Ok(Some(released))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atomdb_core::{Modality, OrderKey, digest};

    #[test]
    fn test_live_atoms_untouched() {
        let s = Store::open_in_memory().unwrap();
        let a = s.get_or_create(Modality::TextToken, b"a").unwrap().atom_id;
        let report = s.collect_garbage(0).unwrap();
        assert!(report.collected.is_empty());
        assert!(s.get(a).unwrap().is_some());
    }

    #[test]
    fn test_grace_period_respected() {
        let s = Store::open_in_memory().unwrap();
        let a = s.get_or_create(Modality::TextToken, b"a").unwrap().atom_id;
        s.release(a).unwrap();
        assert!(s.collect_garbage(3600).unwrap().collected.is_empty());
        assert_eq!(s.collect_garbage(0).unwrap().collected, vec![a]);
        assert!(s.get(a).unwrap().is_none());
    }

    #[test]
    fn test_cascade_releases_children() {
        let s = Store::open_in_memory().unwrap();
        let root = s.ensure_anchor(Modality::TextSpan, &digest(b"root")).unwrap().atom_id;
        let x = s.get_or_create(Modality::TextToken, b"x").unwrap().atom_id;
        let y = s.get_or_create(Modality::TextToken, b"y").unwrap().atom_id;
        // y is also held elsewhere
        s.get_or_create(Modality::TextToken, b"y").unwrap();
        s.link(root, x, OrderKey::Sequence(0)).unwrap();
        s.link(root, y, OrderKey::Sequence(1)).unwrap();

        s.release(root).unwrap();
        let report = s.collect_garbage(0).unwrap();
        assert_eq!(report.collected, vec![root, x]);
        assert_eq!(report.released_children, 2);
        assert!(s.get(x).unwrap().is_none());
        assert_eq!(s.get(y).unwrap().unwrap().reference_count, 1);
        assert_eq!(s.stats().unwrap().compositions, 0);
    }

    #[test]
    fn test_revived_atom_survives() {
        let s = Store::open_in_memory().unwrap();
        let a = s.get_or_create(Modality::Pixel, &[1]).unwrap().atom_id;
        s.release(a).unwrap();
        s.get_or_create(Modality::Pixel, &[1]).unwrap();
        assert!(s.collect_garbage(0).unwrap().collected.is_empty());
        assert!(s.get(a).unwrap().unwrap().is_live());
    }

    #[test]
    fn test_linked_child_not_collected() {
        let s = Store::open_in_memory().unwrap();
        let p = s.get_or_create(Modality::TextToken, b"p").unwrap().atom_id;
        let c = s.get_or_create(Modality::TextToken, b"c").unwrap().atom_id;
        s.link(p, c, OrderKey::Sequence(0)).unwrap();
        s.release(c).unwrap();
        assert!(s.collect_garbage(0).unwrap().collected.is_empty());
        assert!(s.get(c).unwrap().is_some());
    }
}
