use rusqlite::Connection;

use crate::error::Result;

pub const SCHEMA_VERSION: i64 = 1;

pub fn initialize(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;
    conn.pragma_update(None, "wal_autocheckpoint", 100)?;

    // In-memory databases reject this; ignore.
    if conn
        .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
        .is_ok()
    {
        tracing::debug!("startup WAL checkpoint complete");
    }

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS metadata (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS atoms (
            atom_id         INTEGER PRIMARY KEY AUTOINCREMENT,
            modality        TEXT NOT NULL,
            content_hash    BLOB NOT NULL,
            value           BLOB,
            reference_count INTEGER NOT NULL DEFAULT 1,
            is_deleted      INTEGER NOT NULL DEFAULT 0,
            dedup_hits      INTEGER NOT NULL DEFAULT 0,
            created_at      INTEGER NOT NULL,
            deleted_at      INTEGER,
            UNIQUE (modality, content_hash)
        );

        CREATE TABLE IF NOT EXISTS atom_compositions (
            parent_atom_id INTEGER NOT NULL REFERENCES atoms(atom_id),
            child_atom_id  INTEGER NOT NULL REFERENCES atoms(atom_id),
            key_kind       TEXT NOT NULL,
            ord_a          INTEGER NOT NULL,
            ord_b          INTEGER NOT NULL,
            ord_c          INTEGER NOT NULL,
            PRIMARY KEY (parent_atom_id, key_kind, ord_a, ord_b, ord_c)
        );

        CREATE TABLE IF NOT EXISTS atom_embeddings (
            atom_id INTEGER PRIMARY KEY REFERENCES atoms(atom_id),
            dim     INTEGER NOT NULL,
            vector  BLOB NOT NULL,
            key_x   REAL NOT NULL,
            key_y   REAL NOT NULL,
            key_z   REAL NOT NULL
        );

        CREATE TABLE IF NOT EXISTS ingestion_jobs (
            job_id           TEXT PRIMARY KEY,
            modality         TEXT NOT NULL,
            source_reference TEXT NOT NULL,
            cursor           INTEGER NOT NULL DEFAULT 0,
            status           TEXT NOT NULL DEFAULT 'pending',
            quota_remaining  INTEGER NOT NULL,
            failure_reason   TEXT,
            root_atom_id     INTEGER,
            chunks_committed INTEGER NOT NULL DEFAULT 0,
            params           TEXT NOT NULL DEFAULT '{}',
            worker_id        TEXT,
            created_at       INTEGER NOT NULL,
            updated_at       INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_atoms_hash ON atoms(content_hash);
        CREATE INDEX IF NOT EXISTS idx_atoms_gc ON atoms(is_deleted, deleted_at);
        CREATE INDEX IF NOT EXISTS idx_comp_child ON atom_compositions(child_atom_id);
        CREATE INDEX IF NOT EXISTS idx_jobs_status ON ingestion_jobs(status);
        ",
    )?;

    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES ('schema_version', ?1)",
        [SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}
