//! Persisted embeddings, anchor pinning and the in-memory spatial index.

use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;

use atomdb_core::{AnchorSet, AtomId, Distance, HashedNgramEmbedder, SpatialIndex, SpatialKey};

use crate::error::{Result, StoreError};
use crate::store::{Store, get_metadata_on};

const ANCHOR_SEED_KEY: &str = "anchor_seed";
const ANCHOR_DIM_KEY: &str = "anchor_dim";

#[derive(Clone, Debug, PartialEq)]
pub struct StoredEmbedding {
    pub vector: Vec<f32>,
    pub key: SpatialKey,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Recalibration {
    pub previous_seed: u64,
    pub seed: u64,
    pub reprojected: u64,
}

impl Store {
    /// The anchor set this database was built with. The configured seed and
    /// dimension are pinned on first use; later config changes are ignored
    /// until an explicit recalibration.
    pub fn anchors(&self) -> Result<AnchorSet> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR IGNORE INTO metadata (key, value) VALUES (?1, ?2)",
            params![ANCHOR_SEED_KEY, self.config().anchor_seed.to_string()],
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO metadata (key, value) VALUES (?1, ?2)",
            params![ANCHOR_DIM_KEY, self.config().embedding_dim.to_string()],
        )?;
        let (seed, dim) = pinned_anchor_params(conn)?;
        if seed != self.config().anchor_seed || dim != self.config().embedding_dim {
            tracing::warn!(
                pinned_seed = seed,
                pinned_dim = dim,
                "configured anchors differ from pinned anchors; using pinned"
            );
        }
        Ok(AnchorSet::seeded(seed, dim)?)
    }

    /// The built-in n-gram embedder, sized to the pinned anchor dimension
    /// rather than the configured one.
    pub fn embedder(&self) -> Result<HashedNgramEmbedder> {
        Ok(HashedNgramEmbedder::new(self.anchors()?.dim()))
    }

    pub fn put_embedding(&self, atom_id: AtomId, vector: &[f32], key: SpatialKey) -> Result<()> {
        put_embedding_on(self.conn(), atom_id, vector, key)
    }

    pub fn get_embedding(&self, atom_id: AtomId) -> Result<Option<StoredEmbedding>> {
        let row: Option<(Vec<u8>, f64, f64, f64)> = self
            .conn()
            .query_row(
                "SELECT vector, key_x, key_y, key_z FROM atom_embeddings WHERE atom_id = ?1",
                [atom_id.0],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;
        row.map(|(blob, x, y, z)| {
            Ok(StoredEmbedding {
                vector: decode_vector(&blob)?,
                key: SpatialKey::new(x, y, z),
            })
        })
        .transpose()
    }

    /// Build a spatial index over every live embedded atom.
    pub fn load_spatial_index(&self) -> Result<SpatialIndex> {
        let index = SpatialIndex::new(self.config().grid_cells);
        let mut stmt = self.conn().prepare(
            "SELECT e.atom_id, e.key_x, e.key_y, e.key_z
             FROM atom_embeddings e JOIN atoms a ON a.atom_id = e.atom_id
             WHERE a.is_deleted = 0",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                AtomId(row.get(0)?),
                SpatialKey::new(row.get(1)?, row.get(2)?, row.get(3)?),
            ))
        })?;
        for row in rows {
            let (id, key) = row?;
            if !index.insert(id, key) {
                tracing::warn!(%id, "stored spatial key outside domain, skipped");
            }
        }
        tracing::debug!(entries = index.len(), "spatial index loaded");
        Ok(index)
    }

    /// Replace the anchor seed and re-project every stored embedding in one
    /// transaction. Any spatial index built before this call is stale.
    pub fn recalibrate_anchors(&self, seed: u64) -> Result<Recalibration> {
        let tx = self.immediate()?;
        // nothing pinned yet: start from the configured anchors
        let (previous_seed, dim) = match pinned_anchor_params(&tx) {
            Ok(p) => p,
            Err(_) => (self.config().anchor_seed, self.config().embedding_dim),
        };
        let anchors = AnchorSet::seeded(seed, dim)?;

        let embedded: Vec<(i64, Vec<u8>)> = {
            let mut stmt = tx.prepare("SELECT atom_id, vector FROM atom_embeddings")?;
            stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<std::result::Result<_, _>>()?
        };
        let mut reprojected = 0u64;
        for (id, blob) in embedded {
            let key = anchors.project(&decode_vector(&blob)?)?;
            tx.execute(
                "UPDATE atom_embeddings SET key_x = ?2, key_y = ?3, key_z = ?4 WHERE atom_id = ?1",
                params![id, key.x, key.y, key.z],
            )?;
            reprojected += 1;
        }
        for (k, v) in [(ANCHOR_SEED_KEY, seed.to_string()), (ANCHOR_DIM_KEY, dim.to_string())] {
            tx.execute(
                "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
                params![k, v],
            )?;
        }
        tx.commit()?;

        tracing::info!(previous_seed, seed, reprojected, "anchors recalibrated");
        Ok(Recalibration {
            previous_seed,
            seed,
            reprojected,
        })
    }

    /// Exact reordering of index candidates by full-vector distance.
    /// Candidates without a stored embedding of matching dimension are dropped.
    pub fn rerank(
        &self,
        query: &[f32],
        candidates: &[AtomId],
        distance: &dyn Distance,
    ) -> Result<Vec<(AtomId, f32)>> {
        let mut scored = Vec::with_capacity(candidates.len());
        for &id in candidates {
            if let Some(e) = self.get_embedding(id)?
                && e.vector.len() == query.len()
            {
                scored.push((id, distance.distance(query, &e.vector)));
            }
        }
        scored.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        Ok(scored)
    }
}

fn pinned_anchor_params(conn: &Connection) -> Result<(u64, usize)> {
    let seed = get_metadata_on(conn, ANCHOR_SEED_KEY)?
        .ok_or_else(|| StoreError::InvalidData("anchor seed not pinned".into()))?;
    let dim = get_metadata_on(conn, ANCHOR_DIM_KEY)?
        .ok_or_else(|| StoreError::InvalidData("anchor dimension not pinned".into()))?;
    let seed = seed
        .parse()
        .map_err(|_| StoreError::InvalidData(format!("bad pinned anchor seed {seed:?}")))?;
    let dim = dim
        .parse()
        .map_err(|_| StoreError::InvalidData(format!("bad pinned anchor dimension {dim:?}")))?;
    Ok((seed, dim))
}

pub(crate) fn put_embedding_on(
    conn: &Connection,
    atom_id: AtomId,
    vector: &[f32],
    key: SpatialKey,
) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO atom_embeddings (atom_id, dim, vector, key_x, key_y, key_z)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            atom_id.0,
            vector.len() as i64,
            encode_vector(vector),
            key.x,
            key.y,
            key.z
        ],
    )?;
    Ok(())
}

fn encode_vector(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|x| x.to_le_bytes()).collect()
}

fn decode_vector(blob: &[u8]) -> Result<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return Err(StoreError::InvalidData(format!(
            "embedding blob of {} bytes is not f32-aligned",
            blob.len()
        )));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}
