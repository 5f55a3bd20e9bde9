//! SQLite persistence for atomdb: the atom store, composition graph,
//! embeddings, ingestion jobs, reconstruction and garbage collection.

pub mod composition;
pub mod config;
pub mod embedding;
pub mod error;
pub mod gc;
pub mod jobs;
pub mod pipeline;
pub mod reconstruct;
pub mod schema;
pub mod store;

pub use composition::{Children, Composition};
pub use config::{CONFIG_FILE, DB_FILE, EngineConfig, database_path, default_data_dir};
pub use embedding::{Recalibration, StoredEmbedding};
pub use error::{Result, StoreError};
pub use gc::GcReport;
pub use pipeline::{IngestReport, IngestWorker};
pub use store::{GetOrCreate, Store, StoreStats};
