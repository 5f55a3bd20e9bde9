use std::fmt;

use atomdb_core::{AtomError, AtomId, AtomizeError, JobStatus, Modality, ProjectionError};
use uuid::Uuid;

#[derive(Debug)]
pub enum StoreError {
    Sqlite(rusqlite::Error),
    Io(std::io::Error),
    InvalidData(String),
    Config(String),
    PayloadTooLarge { len: usize, max: usize },
    ModalityMismatch { requested: Modality, found: Vec<Modality> },
    CyclicComposition { parent: AtomId, child: AtomId },
    CompositionTooDeep { child: AtomId, limit: u32 },
    BrokenComposition { atom_id: AtomId, reason: String },
    QuotaExceeded { job_id: Uuid, cursor: u64 },
    JobNotResumable { job_id: Uuid, status: JobStatus },
    JobNotFound(Uuid),
    JobNotClaimable { job_id: Uuid, status: JobStatus },
    ReferenceUnderflow(AtomId),
    Projection(ProjectionError),
    Atomize(AtomizeError),
    Embedding(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Sqlite(e) => write!(f, "SQLite error: {e}"),
            StoreError::Io(e) => write!(f, "I/O error: {e}"),
            StoreError::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            StoreError::Config(msg) => write!(f, "invalid configuration: {msg}"),
            StoreError::PayloadTooLarge { len, max } => {
                write!(f, "PayloadTooLarge: {len} bytes exceeds atom bound of {max}")
            }
            StoreError::ModalityMismatch { requested, found } => {
                let found: Vec<&str> = found.iter().map(|m| m.as_str()).collect();
                write!(
                    f,
                    "ModalityMismatch: hash not stored as {requested}, only as {}",
                    found.join(", ")
                )
            }
            StoreError::CyclicComposition { parent, child } => {
                write!(f, "CyclicComposition: {parent} is reachable from {child}")
            }
            StoreError::CompositionTooDeep { child, limit } => {
                write!(f, "composition under {child} exceeds depth {limit}")
            }
            StoreError::BrokenComposition { atom_id, reason } => {
                write!(f, "BrokenComposition at atom {atom_id}: {reason}")
            }
            StoreError::QuotaExceeded { job_id, cursor } => {
                write!(f, "QuotaExceeded: job {job_id} stopped at byte {cursor}")
            }
            StoreError::JobNotResumable { job_id, status } => {
                write!(f, "JobNotResumable: job {job_id} is {status}")
            }
            StoreError::JobNotFound(id) => write!(f, "job not found: {id}"),
            StoreError::JobNotClaimable { job_id, status } => {
                write!(f, "job {job_id} cannot be claimed while {status}")
            }
            StoreError::ReferenceUnderflow(id) => {
                write!(f, "atom {id} has no references left to release")
            }
            StoreError::Projection(e) => write!(f, "projection failed: {e}"),
            StoreError::Atomize(e) => write!(f, "{e}"),
            StoreError::Embedding(msg) => write!(f, "embedding failed: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Sqlite(e) => Some(e),
            StoreError::Io(e) => Some(e),
            StoreError::Projection(e) => Some(e),
            StoreError::Atomize(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Sqlite(e)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e)
    }
}

impl From<ProjectionError> for StoreError {
    fn from(e: ProjectionError) -> Self {
        StoreError::Projection(e)
    }
}

impl From<AtomError> for StoreError {
    fn from(e: AtomError) -> Self {
        match e {
            AtomError::PayloadTooLarge { len, max } => StoreError::PayloadTooLarge { len, max },
        }
    }
}

impl From<AtomizeError> for StoreError {
    fn from(e: AtomizeError) -> Self {
        match e {
            AtomizeError::Atom(inner) => inner.into(),
            other => StoreError::Atomize(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
