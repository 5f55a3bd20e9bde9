//! Grid-bucketed spatial index over the bounded key domain.
//!
//! The domain `[-SPATIAL_DOMAIN, SPATIAL_DOMAIN]³` is cut into `cells³`
//! buckets, each behind its own `RwLock`. A writer only locks the bucket it
//! touches, so queries over other regions proceed concurrently.

use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::atom::AtomId;
use crate::constants::SPATIAL_DOMAIN;
use crate::projection::{BoundingBox, SpatialKey};

#[derive(Clone, Copy, Debug, PartialEq)]
struct Entry {
    atom_id: AtomId,
    key: SpatialKey,
}

pub struct SpatialIndex {
    cells: usize,
    buckets: Vec<RwLock<Vec<Entry>>>,
    locations: RwLock<HashMap<AtomId, usize>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

impl SpatialIndex {
    pub fn new(cells: usize) -> Self {
        let cells = cells.max(1);
        let buckets = (0..cells * cells * cells)
            .map(|_| RwLock::new(Vec::new()))
            .collect();
        Self {
            cells,
            buckets,
            locations: RwLock::new(HashMap::new()),
        }
    }

    pub fn cells(&self) -> usize {
        self.cells
    }

    fn cell_width(&self) -> f64 {
        2.0 * SPATIAL_DOMAIN / self.cells as f64
    }

    fn axis_cell(&self, v: f64) -> usize {
        let t = ((v + SPATIAL_DOMAIN) / self.cell_width()).floor();
        (t.max(0.0) as usize).min(self.cells - 1)
    }

    fn cell_of(&self, key: &SpatialKey) -> (usize, usize, usize) {
        (
            self.axis_cell(key.x),
            self.axis_cell(key.y),
            self.axis_cell(key.z),
        )
    }

    fn bucket_index(&self, (x, y, z): (usize, usize, usize)) -> usize {
        (x * self.cells + y) * self.cells + z
    }

    /// Insert or move an entry. Keys outside the domain are rejected (returns `false`).
    pub fn insert(&self, atom_id: AtomId, key: SpatialKey) -> bool {
        if !key.in_domain() {
            return false;
        }
        let target = self.bucket_index(self.cell_of(&key));
        let mut locations = write(&self.locations);

        if let Some(&previous) = locations.get(&atom_id) {
            write(&self.buckets[previous]).retain(|e| e.atom_id != atom_id);
        }
        write(&self.buckets[target]).push(Entry { atom_id, key });
        locations.insert(atom_id, target);
        true
    }

    pub fn remove(&self, atom_id: AtomId) -> bool {
        let mut locations = write(&self.locations);
        match locations.remove(&atom_id) {
            Some(bucket) => {
                write(&self.buckets[bucket]).retain(|e| e.atom_id != atom_id);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, atom_id: AtomId) -> Option<SpatialKey> {
        let bucket = *read(&self.locations).get(&atom_id)?;
        read(&self.buckets[bucket])
            .iter()
            .find(|e| e.atom_id == atom_id)
            .map(|e| e.key)
    }

    pub fn len(&self) -> usize {
        read(&self.locations).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Exact range query. A box disjoint from the domain yields an empty set.
    pub fn range(&self, bbox: &BoundingBox) -> HashSet<AtomId> {
        let mut out = HashSet::new();
        let Some(clipped) = bbox.clip_to_domain() else {
            return out;
        };
        let (x0, y0, z0) = self.cell_of(&clipped.min);
        let (x1, y1, z1) = self.cell_of(&clipped.max);

        for x in x0..=x1 {
            for y in y0..=y1 {
                for z in z0..=z1 {
                    let bucket = read(&self.buckets[self.bucket_index((x, y, z))]);
                    out.extend(
                        bucket
                            .iter()
                            .filter(|e| bbox.contains(&e.key))
                            .map(|e| e.atom_id),
                    );
                }
            }
        }
        out
    }

    /// Approximate k-nearest neighbours in key space, ascending by distance.
    ///
    /// Searches rings of cells around the query cell (Chebyshev radius r) and
    /// stops once the k-th best distance is no larger than the closest any
    /// unvisited ring could be. Ties break on atom id. An atom moved by a
    /// concurrent `insert` is reported at most once. A query outside the
    /// domain yields an empty result.
    pub fn nearest(&self, query: &SpatialKey, k: usize) -> Vec<(AtomId, f64)> {
        if k == 0 || !query.in_domain() {
            return Vec::new();
        }
        let (cx, cy, cz) = self.cell_of(query);
        let w = self.cell_width();
        let mut found: Vec<(AtomId, f64)> = Vec::new();
        let mut seen: HashSet<AtomId> = HashSet::new();

        for r in 0..self.cells {
            self.visit_ring((cx, cy, cz), r, |bucket| {
                let bucket = read(&self.buckets[bucket]);
                found.extend(
                    bucket
                        .iter()
                        .filter(|e| seen.insert(e.atom_id))
                        .map(|e| (e.atom_id, e.key.distance(query))),
                );
            });

            if found.len() >= k {
                sort_hits(&mut found);
                let kth = found[k - 1].1;
                // Every point in ring r+1 is at least r cell widths away.
                if kth <= r as f64 * w {
                    break;
                }
            }
        }

        sort_hits(&mut found);
        found.truncate(k);
        found
    }

    fn visit_ring(&self, (cx, cy, cz): (usize, usize, usize), r: usize, mut f: impl FnMut(usize)) {
        let n = self.cells as i64;
        let r = r as i64;
        let (cx, cy, cz) = (cx as i64, cy as i64, cz as i64);

        for x in (cx - r).max(0)..=(cx + r).min(n - 1) {
            for y in (cy - r).max(0)..=(cy + r).min(n - 1) {
                for z in (cz - r).max(0)..=(cz + r).min(n - 1) {
                    let ring = (x - cx).abs().max((y - cy).abs()).max((z - cz).abs());
                    if ring == r {
                        f(self.bucket_index((x as usize, y as usize, z as usize)));
                    }
                }
            }
        }
    }
}

fn sort_hits(hits: &mut [(AtomId, f64)]) {
    hits.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
}
