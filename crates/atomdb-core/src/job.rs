use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::atom::{AtomId, Modality, UnknownModality};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Completed and cancelled jobs are final. Failed jobs keep their cursor
    /// and may be resumed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Cancelled)
    }

    pub fn can_transition(&self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (*self, to),
            (Pending, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Failed, Pending)
                | (Pending, Cancelled)
                | (Running, Cancelled)
                | (Failed, Cancelled)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Kind of source an ingestion job decomposes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceModality {
    Text,
    Image,
    Audio,
    Weights,
}

impl SourceModality {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceModality::Text => "text",
            SourceModality::Image => "image",
            SourceModality::Audio => "audio",
            SourceModality::Weights => "weights",
        }
    }

    /// Composite modality of the chunk roots this source produces.
    pub fn chunk_modality(&self) -> Modality {
        match self {
            SourceModality::Text => Modality::TextSpan,
            SourceModality::Image => Modality::ImageBand,
            SourceModality::Audio => Modality::AudioClip,
            SourceModality::Weights => Modality::TensorSlice,
        }
    }
}

impl fmt::Display for SourceModality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceModality {
    type Err = UnknownModality;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(SourceModality::Text),
            "image" => Ok(SourceModality::Image),
            "audio" => Ok(SourceModality::Audio),
            "weights" => Ok(SourceModality::Weights),
            other => Err(UnknownModality(other.to_string())),
        }
    }
}

/// How text is cut into atoms.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextGranularity {
    #[default]
    Char,
    Token,
}

impl FromStr for TextGranularity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "char" => Ok(TextGranularity::Char),
            "token" => Ok(TextGranularity::Token),
            other => Err(format!("unknown text granularity: {other} (expected char or token)")),
        }
    }
}

/// Per-job atomizer parameters, persisted with the job as JSON so a resumed
/// job re-atomizes with exactly the same settings.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AtomizerParams {
    pub granularity: TextGranularity,
    /// Bytes per audio sample (1–4).
    pub sample_width: Option<usize>,
    /// Scalars per tensor row.
    pub columns: Option<usize>,
    /// Attach an embedding + spatial key to each chunk root.
    pub embed: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IngestionJob {
    pub job_id: Uuid,
    pub modality: SourceModality,
    pub source_reference: String,
    pub cursor: u64,
    pub status: JobStatus,
    pub quota_remaining: i64,
    pub failure_reason: Option<String>,
    pub root_atom_id: Option<AtomId>,
    pub chunks_committed: u64,
    pub params: AtomizerParams,
    pub worker_id: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}
