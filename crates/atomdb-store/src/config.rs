//! Engine configuration, read from `<data_dir>/atomdb.toml`.

use std::path::{Path, PathBuf};
use std::{env, fs};

use atomdb_core::{
    ANCHOR_COUNT, ATOM_MAX_BYTES, ChunkLimits, DEFAULT_ANCHOR_SEED, DEFAULT_EMBEDDING_DIM,
    DEFAULT_GRID_CELLS,
};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

pub const CONFIG_FILE: &str = "atomdb.toml";
pub const DB_FILE: &str = "atoms.db";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on a leaf value. Can be lowered below 64, never raised.
    pub max_atom_bytes: usize,
    pub text_chunk_bytes: usize,
    pub image_rows_per_chunk: usize,
    pub audio_samples_per_chunk: usize,
    pub weights_scalars_per_chunk: usize,
    pub gc_grace_secs: u64,
    /// A running job whose `updated_at` is older than this may be taken over.
    pub job_lease_secs: u64,
    pub max_composition_depth: u32,
    pub grid_cells: usize,
    pub anchor_seed: u64,
    pub embedding_dim: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_atom_bytes: ATOM_MAX_BYTES,
            text_chunk_bytes: 4096,
            image_rows_per_chunk: 16,
            audio_samples_per_chunk: 4096,
            weights_scalars_per_chunk: 4096,
            gc_grace_secs: 3600,
            job_lease_secs: 300,
            max_composition_depth: 64,
            grid_cells: DEFAULT_GRID_CELLS,
            anchor_seed: DEFAULT_ANCHOR_SEED,
            embedding_dim: DEFAULT_EMBEDDING_DIM,
        }
    }
}

impl EngineConfig {
    /// Load `atomdb.toml` from `data_dir`, falling back to defaults when absent.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| StoreError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "loaded engine config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_atom_bytes == 0 || self.max_atom_bytes > ATOM_MAX_BYTES {
            return Err(StoreError::Config(format!(
                "max_atom_bytes must be in 1..={ATOM_MAX_BYTES}, got {}",
                self.max_atom_bytes
            )));
        }
        let positive = [
            ("text_chunk_bytes", self.text_chunk_bytes),
            ("image_rows_per_chunk", self.image_rows_per_chunk),
            ("audio_samples_per_chunk", self.audio_samples_per_chunk),
            ("weights_scalars_per_chunk", self.weights_scalars_per_chunk),
            ("grid_cells", self.grid_cells),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(StoreError::Config(format!("{name} must be greater than 0")));
        }
        if self.embedding_dim < ANCHOR_COUNT {
            return Err(StoreError::Config(format!(
                "embedding_dim must be at least {ANCHOR_COUNT}"
            )));
        }
        if self.max_composition_depth == 0 {
            return Err(StoreError::Config(
                "max_composition_depth must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    pub fn chunk_limits(&self) -> ChunkLimits {
        ChunkLimits {
            max_atom_bytes: self.max_atom_bytes,
            text_bytes: self.text_chunk_bytes,
            image_rows: self.image_rows_per_chunk,
            audio_samples: self.audio_samples_per_chunk,
            weight_scalars: self.weights_scalars_per_chunk,
        }
    }
}

/// `ATOMDB_DATA_DIR`, else `~/.atomdb`.
pub fn default_data_dir() -> PathBuf {
    if let Ok(dir) = env::var("ATOMDB_DATA_DIR")
        && !dir.is_empty()
    {
        return PathBuf::from(dir);
    }
    env::var("HOME")
        .or_else(|_| env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".atomdb")
}

pub fn database_path(data_dir: &Path) -> PathBuf {
    data_dir.join(DB_FILE)
}
