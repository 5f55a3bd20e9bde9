//! Parent → child composition edges and their ordered traversal.

use std::collections::VecDeque;

use rusqlite::{Connection, ErrorCode, params};
use serde::Serialize;

use atomdb_core::{AtomId, OrderKey};

use crate::error::{Result, StoreError};
use crate::store::{Store, atom_exists_on};

const PAGE_SIZE: usize = 512;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Composition {
    pub parent: AtomId,
    pub child: AtomId,
    pub key: OrderKey,
}

impl Store {
    /// Record `child` under `parent` at `key`. Rejects edges that would
    /// close a cycle.
    pub fn link(&self, parent: AtomId, child: AtomId, key: OrderKey) -> Result<()> {
        let tx = self.immediate()?;
        link_on(&tx, parent, child, key, self.config().max_composition_depth)?;
        tx.commit()?;
        Ok(())
    }

    /// Children of `parent` in order-key order. Each call starts a fresh
    /// iteration that pages through the current rows.
    pub fn children_of(&self, parent: AtomId) -> Children<'_> {
        Children::new(self.conn(), parent)
    }

    pub fn parents_of(&self, child: AtomId) -> Result<Vec<AtomId>> {
        let mut stmt = self.conn().prepare(
            "SELECT DISTINCT parent_atom_id FROM atom_compositions
             WHERE child_atom_id = ?1 ORDER BY parent_atom_id",
        )?;
        let ids: Vec<i64> = stmt
            .query_map([child.0], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        Ok(ids.into_iter().map(AtomId).collect())
    }
}

pub(crate) fn link_on(
    conn: &Connection,
    parent: AtomId,
    child: AtomId,
    key: OrderKey,
    max_depth: u32,
) -> Result<()> {
    if parent == child {
        return Err(StoreError::CyclicComposition { parent, child });
    }
    for id in [parent, child] {
        if !atom_exists_on(conn, id)? {
            return Err(StoreError::InvalidData(format!("atom {id} not found")));
        }
    }
    check_acyclic_on(conn, parent, child, max_depth)?;
    insert_edge_on(conn, parent, child, key)
}

/// Walk down from `child`; the edge is cyclic if `parent` shows up.
fn check_acyclic_on(conn: &Connection, parent: AtomId, child: AtomId, max_depth: u32) -> Result<()> {
    let (reaches, truncated): (bool, bool) = conn.query_row(
        "WITH RECURSIVE reach(id, depth) AS (
             SELECT ?1, 0
             UNION
             SELECT c.child_atom_id, r.depth + 1
             FROM atom_compositions c JOIN reach r ON c.parent_atom_id = r.id
             WHERE r.depth < ?3
         )
         SELECT
             EXISTS(SELECT 1 FROM reach WHERE id = ?2),
             EXISTS(SELECT 1 FROM reach r JOIN atom_compositions c
                    ON c.parent_atom_id = r.id WHERE r.depth = ?3)",
        params![child.0, parent.0, max_depth],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    if reaches {
        return Err(StoreError::CyclicComposition { parent, child });
    }
    if truncated {
        return Err(StoreError::CompositionTooDeep {
            child,
            limit: max_depth,
        });
    }
    Ok(())
}

/// Insert without the reachability check. Only valid when `parent` was
/// created in the current transaction and so has no incoming edges.
pub(crate) fn insert_edge_on(
    conn: &Connection,
    parent: AtomId,
    child: AtomId,
    key: OrderKey,
) -> Result<()> {
    let (a, b, c) = key.components();
    let res = conn.execute(
        "INSERT INTO atom_compositions
             (parent_atom_id, child_atom_id, key_kind, ord_a, ord_b, ord_c)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![parent.0, child.0, key.kind(), a, b, c],
    );
    match res {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
            Err(StoreError::InvalidData(format!(
                "atom {parent} already has a child at {key}"
            )))
        }
        Err(e) => Err(e.into()),
    }
}

type Cursor = (String, i64, i64, i64);

/// Keyset-paginated iterator over a parent's children.
pub struct Children<'a> {
    conn: &'a Connection,
    parent: AtomId,
    after: Cursor,
    page: VecDeque<Composition>,
    exhausted: bool,
}

impl<'a> Children<'a> {
    fn new(conn: &'a Connection, parent: AtomId) -> Self {
        Self {
            conn,
            parent,
            after: (String::new(), i64::MIN, i64::MIN, i64::MIN),
            page: VecDeque::new(),
            exhausted: false,
        }
    }

    fn fetch(&mut self) -> Result<()> {
        let conn = self.conn;
        let mut stmt = conn.prepare_cached(
            "SELECT child_atom_id, key_kind, ord_a, ord_b, ord_c FROM atom_compositions
             WHERE parent_atom_id = ?1
               AND (key_kind, ord_a, ord_b, ord_c) > (?2, ?3, ?4, ?5)
             ORDER BY key_kind, ord_a, ord_b, ord_c
             LIMIT ?6",
        )?;
        let (kind, a, b, c) = &self.after;
        let rows: Vec<(i64, String, i64, i64, i64)> = stmt
            .query_map(
                params![self.parent.0, kind, a, b, c, PAGE_SIZE as i64],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )?
            .collect::<std::result::Result<_, _>>()?;

        if rows.len() < PAGE_SIZE {
            self.exhausted = true;
        }
        for (child, kind, a, b, c) in rows {
            let key = OrderKey::from_components(&kind, a, b, c).ok_or_else(|| {
                StoreError::InvalidData(format!("bad order key {kind}({a},{b},{c})"))
            })?;
            self.page.push_back(Composition {
                parent: self.parent,
                child: AtomId(child),
                key,
            });
            self.after = (kind, a, b, c);
        }
        Ok(())
    }
}

impl Iterator for Children<'_> {
    type Item = Result<Composition>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.page.is_empty() && !self.exhausted {
            if let Err(e) = self.fetch() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        self.page.pop_front().map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use atomdb_core::Modality;

    fn atom(s: &Store, v: &[u8]) -> AtomId {
        s.get_or_create(Modality::TextToken, v).unwrap().atom_id
    }

    #[test]
    fn test_link_and_children_in_order() {
        let s = Store::open_in_memory().unwrap();
        let p = atom(&s, b"p");
        let (x, y) = (atom(&s, b"x"), atom(&s, b"y"));
        s.link(p, y, OrderKey::Sequence(1)).unwrap();
        s.link(p, x, OrderKey::Sequence(0)).unwrap();
        s.link(p, y, OrderKey::Sequence(2)).unwrap();

        let kids: Vec<Composition> = s.children_of(p).collect::<Result<_>>().unwrap();
        let ids: Vec<AtomId> = kids.iter().map(|c| c.child).collect();
        assert_eq!(ids, vec![x, y, y]);
        assert_eq!(kids[2].key, OrderKey::Sequence(2));
        assert_eq!(s.parents_of(y).unwrap(), vec![p]);
    }

    #[test]
    fn test_reverse_link_is_cyclic() {
        let s = Store::open_in_memory().unwrap();
        let (a, b) = (atom(&s, b"a"), atom(&s, b"b"));
        s.link(a, b, OrderKey::Sequence(0)).unwrap();
        assert!(matches!(
            s.link(b, a, OrderKey::Sequence(0)),
            Err(StoreError::CyclicComposition { .. })
        ));
    }

    #[test]
    fn test_self_link_rejected() {
        let s = Store::open_in_memory().unwrap();
        let a = atom(&s, b"a");
        assert!(matches!(
            s.link(a, a, OrderKey::Sequence(0)),
            Err(StoreError::CyclicComposition { .. })
        ));
    }

    #[test]
    fn test_transitive_cycle_rejected() {
        let s = Store::open_in_memory().unwrap();
        let (a, b, c) = (atom(&s, b"a"), atom(&s, b"b"), atom(&s, b"c"));
        s.link(a, b, OrderKey::Sequence(0)).unwrap();
        s.link(b, c, OrderKey::Sequence(0)).unwrap();
        assert!(s.link(c, a, OrderKey::Sequence(0)).is_err());
        // a diamond is fine
        s.link(a, c, OrderKey::Sequence(1)).unwrap();
    }

    #[test]
    fn test_depth_bound() {
        let config = EngineConfig {
            max_composition_depth: 2,
            ..EngineConfig::default()
        };
        let s = Store::open_in_memory_with_config(config).unwrap();
        let ids: Vec<AtomId> = (0u8..5).map(|i| atom(&s, &[i])).collect();
        s.link(ids[1], ids[2], OrderKey::Sequence(0)).unwrap();
        s.link(ids[2], ids[3], OrderKey::Sequence(0)).unwrap();
        s.link(ids[3], ids[4], OrderKey::Sequence(0)).unwrap();
        assert!(matches!(
            s.link(ids[0], ids[1], OrderKey::Sequence(0)),
            Err(StoreError::CompositionTooDeep { limit: 2, .. })
        ));
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let s = Store::open_in_memory().unwrap();
        let (p, x, y) = (atom(&s, b"p"), atom(&s, b"x"), atom(&s, b"y"));
        s.link(p, x, OrderKey::spatial(0, 0)).unwrap();
        assert!(matches!(
            s.link(p, y, OrderKey::spatial(0, 0)),
            Err(StoreError::InvalidData(_))
        ));
    }

    #[test]
    fn test_link_missing_atom() {
        let s = Store::open_in_memory().unwrap();
        let a = atom(&s, b"a");
        assert!(matches!(
            s.link(a, AtomId(999), OrderKey::Sequence(0)),
            Err(StoreError::InvalidData(_))
        ));
    }

    #[test]
    fn test_children_paginate_past_one_page() {
        let s = Store::open_in_memory().unwrap();
        let p = atom(&s, b"p");
        let leaf = atom(&s, b"l");
        let n = PAGE_SIZE as u64 * 2 + 7;
        for i in (0..n).rev() {
            s.link(p, leaf, OrderKey::Sequence(i)).unwrap();
        }
        let keys: Vec<OrderKey> = s.children_of(p).map(|c| c.unwrap().key).collect();
        assert_eq!(keys.len() as u64, n);
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_children_restart_sees_new_rows() {
        let s = Store::open_in_memory().unwrap();
        let (p, x) = (atom(&s, b"p"), atom(&s, b"x"));
        s.link(p, x, OrderKey::Sequence(0)).unwrap();
        assert_eq!(s.children_of(p).count(), 1);
        s.link(p, x, OrderKey::Sequence(1)).unwrap();
        assert_eq!(s.children_of(p).count(), 2);
    }

    #[test]
    fn test_spatial_keys_order_row_major() {
        let s = Store::open_in_memory().unwrap();
        let (p, x) = (atom(&s, b"p"), atom(&s, b"x"));
        for (r, c) in [(1, 0), (0, 1), (1, 1), (0, 0)] {
            s.link(p, x, OrderKey::spatial(r, c)).unwrap();
        }
        let keys: Vec<OrderKey> = s.children_of(p).map(|c| c.unwrap().key).collect();
        assert_eq!(
            keys,
            vec![
                OrderKey::spatial(0, 0),
                OrderKey::spatial(0, 1),
                OrderKey::spatial(1, 0),
                OrderKey::spatial(1, 1)
            ]
        );
    }
}
