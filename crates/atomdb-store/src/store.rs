use std::path::Path;

use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use serde::Serialize;

use atomdb_core::time::now_unix_secs;
use atomdb_core::{AtomId, AtomRecord, ContentHash, Modality, digest, validate_payload};

use crate::config::EngineConfig;
use crate::error::{Result, StoreError};
use crate::schema;

pub(crate) const ATOM_COLUMNS: &str = "atom_id, modality, content_hash, value, reference_count, \
     is_deleted, dedup_hits, created_at, deleted_at";

pub struct Store {
    conn: Connection,
    config: EngineConfig,
}

/// Outcome of acquiring a reference to an atom.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct GetOrCreate {
    pub atom_id: AtomId,
    pub reference_count: i64,
    /// `true` when this call inserted the row.
    pub created: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub atoms: i64,
    pub live_atoms: i64,
    pub deleted_atoms: i64,
    pub compositions: i64,
    pub embeddings: i64,
    pub jobs: i64,
    pub dedup_hits: i64,
    pub by_modality: Vec<(Modality, i64)>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_config(path, EngineConfig::default())
    }

    pub fn open_with_config(path: &Path, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let conn = Connection::open(path)?;
        schema::initialize(&conn)?;
        Ok(Self { conn, config })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open_in_memory_with_config(EngineConfig::default())
    }

    pub fn open_in_memory_with_config(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self { conn, config })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Write transaction that takes the database lock up front.
    pub(crate) fn immediate(&self) -> Result<Transaction<'_>> {
        Ok(Transaction::new_unchecked(
            &self.conn,
            TransactionBehavior::Immediate,
        )?)
    }

    // --- Metadata ---

    pub fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        get_metadata_on(&self.conn, key)
    }

    pub fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    // --- Atoms ---

    /// Acquire a reference to the atom holding `value`, inserting it on
    /// first sight. A soft-deleted match is revived.
    pub fn get_or_create(&self, modality: Modality, value: &[u8]) -> Result<GetOrCreate> {
        validate_payload(value, self.config.max_atom_bytes)?;
        upsert_on(&self.conn, modality, &digest(value), Some(value))
    }

    /// Insert a structural anchor (no value) if absent. Never bumps the
    /// reference count of an existing anchor.
    pub fn ensure_anchor(&self, modality: Modality, hash: &ContentHash) -> Result<GetOrCreate> {
        let tx = self.immediate()?;
        let out = ensure_anchor_on(&tx, modality, hash)?;
        tx.commit()?;
        Ok(out)
    }

    /// Drop one reference. Returns the remaining count; at zero the atom is
    /// soft-deleted and left for the collector.
    pub fn release(&self, atom_id: AtomId) -> Result<i64> {
        let remaining = release_on(&self.conn, atom_id)?;
        if remaining == 0 {
            tracing::debug!(%atom_id, "atom soft-deleted");
        }
        Ok(remaining)
    }

    pub fn get(&self, atom_id: AtomId) -> Result<Option<AtomRecord>> {
        get_on(&self.conn, atom_id)
    }

    /// Exact lookup by content hash within `modality`.
    pub fn lookup(&self, modality: Modality, hash: &ContentHash) -> Result<Option<AtomRecord>> {
        let sql = format!("SELECT {ATOM_COLUMNS} FROM atoms WHERE content_hash = ?1");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows: Vec<AtomRow> = stmt
            .query_map([hash.as_bytes().as_slice()], atom_row)?
            .collect::<std::result::Result<_, _>>()?;

        let mut found = Vec::with_capacity(rows.len());
        for row in rows {
            let record = row.into_record()?;
            if record.modality == modality {
                return Ok(Some(record));
            }
            found.push(record.modality);
        }
        if found.is_empty() {
            Ok(None)
        } else {
            Err(StoreError::ModalityMismatch {
                requested: modality,
                found,
            })
        }
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let (atoms, live_atoms, dedup_hits): (i64, i64, i64) = self.conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(is_deleted = 0), 0), COALESCE(SUM(dedup_hits), 0) FROM atoms",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        let count = |table: &str| -> Result<i64> {
            Ok(self
                .conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?)
        };

        let mut stmt = self
            .conn
            .prepare("SELECT modality, COUNT(*) FROM atoms GROUP BY modality ORDER BY modality")?;
        let raw: Vec<(String, i64)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<_, _>>()?;
        let by_modality = raw
            .into_iter()
            .map(|(m, n)| Ok((parse_modality(&m)?, n)))
            .collect::<Result<Vec<_>>>()?;

        Ok(StoreStats {
            atoms,
            live_atoms,
            deleted_atoms: atoms - live_atoms,
            compositions: count("atom_compositions")?,
            embeddings: count("atom_embeddings")?,
            jobs: count("ingestion_jobs")?,
            dedup_hits,
            by_modality,
        })
    }
}

// --- Connection-level helpers shared with transactions ---

pub(crate) fn now() -> i64 {
    now_unix_secs() as i64
}

pub(crate) fn get_metadata_on(conn: &Connection, key: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row("SELECT value FROM metadata WHERE key = ?1", [key], |row| {
            row.get(0)
        })
        .optional()?)
}

pub(crate) fn upsert_on(
    conn: &Connection,
    modality: Modality,
    hash: &ContentHash,
    value: Option<&[u8]>,
) -> Result<GetOrCreate> {
    let (id, reference_count, dedup_hits): (i64, i64, i64) = conn.query_row(
        "INSERT INTO atoms (modality, content_hash, value, reference_count, created_at)
         VALUES (?1, ?2, ?3, 1, ?4)
         ON CONFLICT(modality, content_hash) DO UPDATE SET
             reference_count = reference_count + 1,
             dedup_hits = dedup_hits + 1,
             is_deleted = 0,
             deleted_at = NULL
         RETURNING atom_id, reference_count, dedup_hits",
        params![modality.as_str(), hash.as_bytes().as_slice(), value, now()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;
    Ok(GetOrCreate {
        atom_id: AtomId(id),
        reference_count,
        created: dedup_hits == 0,
    })
}

pub(crate) fn ensure_anchor_on(
    conn: &Connection,
    modality: Modality,
    hash: &ContentHash,
) -> Result<GetOrCreate> {
    let inserted: Option<i64> = conn
        .query_row(
            "INSERT INTO atoms (modality, content_hash, value, reference_count, created_at)
             VALUES (?1, ?2, NULL, 1, ?3)
             ON CONFLICT(modality, content_hash) DO NOTHING
             RETURNING atom_id",
            params![modality.as_str(), hash.as_bytes().as_slice(), now()],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = inserted {
        return Ok(GetOrCreate {
            atom_id: AtomId(id),
            reference_count: 1,
            created: true,
        });
    }

    let (id, reference_count): (i64, i64) = conn.query_row(
        "UPDATE atoms SET
             reference_count = MAX(reference_count, 1),
             is_deleted = 0,
             deleted_at = NULL
         WHERE modality = ?1 AND content_hash = ?2
         RETURNING atom_id, reference_count",
        params![modality.as_str(), hash.as_bytes().as_slice()],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok(GetOrCreate {
        atom_id: AtomId(id),
        reference_count,
        created: false,
    })
}

pub(crate) fn release_on(conn: &Connection, atom_id: AtomId) -> Result<i64> {
    let remaining: Option<i64> = conn
        .query_row(
            "UPDATE atoms SET
                 reference_count = reference_count - 1,
                 is_deleted = CASE WHEN reference_count = 1 THEN 1 ELSE is_deleted END,
                 deleted_at = CASE WHEN reference_count = 1 THEN ?2 ELSE deleted_at END
             WHERE atom_id = ?1 AND reference_count > 0
             RETURNING reference_count",
            params![atom_id.0, now()],
            |row| row.get(0),
        )
        .optional()?;
    match remaining {
        Some(n) => Ok(n),
        None if atom_exists_on(conn, atom_id)? => Err(StoreError::ReferenceUnderflow(atom_id)),
        None => Err(StoreError::InvalidData(format!("atom {atom_id} not found"))),
    }
}

pub(crate) fn atom_exists_on(conn: &Connection, atom_id: AtomId) -> Result<bool> {
    Ok(conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM atoms WHERE atom_id = ?1)",
        [atom_id.0],
        |row| row.get(0),
    )?)
}

pub(crate) fn get_on(conn: &Connection, atom_id: AtomId) -> Result<Option<AtomRecord>> {
    let sql = format!("SELECT {ATOM_COLUMNS} FROM atoms WHERE atom_id = ?1");
    conn.query_row(&sql, [atom_id.0], atom_row)
        .optional()?
        .map(AtomRow::into_record)
        .transpose()
}

pub(crate) struct AtomRow {
    atom_id: i64,
    modality: String,
    content_hash: Vec<u8>,
    value: Option<Vec<u8>>,
    reference_count: i64,
    is_deleted: bool,
    dedup_hits: i64,
    created_at: i64,
    deleted_at: Option<i64>,
}

pub(crate) fn atom_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AtomRow> {
    Ok(AtomRow {
        atom_id: row.get(0)?,
        modality: row.get(1)?,
        content_hash: row.get(2)?,
        value: row.get(3)?,
        reference_count: row.get(4)?,
        is_deleted: row.get(5)?,
        dedup_hits: row.get(6)?,
        created_at: row.get(7)?,
        deleted_at: row.get(8)?,
    })
}

impl AtomRow {
    pub(crate) fn into_record(self) -> Result<AtomRecord> {
        let content_hash = ContentHash::from_slice(&self.content_hash).ok_or_else(|| {
            StoreError::InvalidData(format!("atom {} has a malformed hash", self.atom_id))
        })?;
        Ok(AtomRecord {
            atom_id: AtomId(self.atom_id),
            modality: parse_modality(&self.modality)?,
            content_hash,
            value: self.value,
            reference_count: self.reference_count,
            is_deleted: self.is_deleted,
            dedup_hits: self.dedup_hits,
            created_at: self.created_at.max(0) as u64,
            deleted_at: self.deleted_at.map(|t| t.max(0) as u64),
        })
    }
}

pub(crate) fn parse_modality(s: &str) -> Result<Modality> {
    s.parse()
        .map_err(|e| StoreError::InvalidData(format!("{e}")))
}
