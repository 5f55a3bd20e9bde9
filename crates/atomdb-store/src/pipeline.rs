//! Governed, resumable ingestion.
//!
//! A worker claims a job and walks its source chunk by chunk. Atomizing,
//! hashing and embedding happen before the chunk transaction opens; the
//! transaction then writes the chunk's atoms and edges and advances the job
//! cursor together, so a crash or cancellation never leaves half a chunk.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use atomdb_core::{
    AnchorSet, AtomId, Atomize, Atomizer, ContentHash, Embedder, HashedChunk, IngestionJob,
    JobStatus, Modality, NullSink, OrderKey, ProvenanceEvent, ProvenanceSink, SpatialIndex,
    SpatialKey, anchor_digest,
};

use crate::composition::{insert_edge_on, link_on};
use crate::embedding::put_embedding_on;
use crate::error::{Result, StoreError};
use crate::store::{GetOrCreate, Store, ensure_anchor_on, now, upsert_on};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub cursor: u64,
    pub root_atom_id: Option<AtomId>,
    /// Chunks committed by this run.
    pub chunks: u64,
    pub atoms_created: u64,
    pub dedup_hits: u64,
}

impl IngestReport {
    fn starting(job: &IngestionJob) -> Self {
        Self {
            job_id: job.job_id,
            status: job.status,
            cursor: job.cursor,
            root_atom_id: job.root_atom_id,
            chunks: 0,
            atoms_created: 0,
            dedup_hits: 0,
        }
    }

    fn finish(mut self, job: &IngestionJob) -> Self {
        self.status = job.status;
        self.cursor = job.cursor;
        self.root_atom_id = job.root_atom_id;
        self
    }
}

#[derive(Default)]
struct Committed {
    chunk_root: Option<AtomId>,
    events: Vec<ProvenanceEvent>,
    atoms_created: u64,
    dedup_hits: u64,
}

impl Committed {
    fn acquired(&mut self, got: GetOrCreate, modality: Modality, hash: ContentHash) {
        if got.created {
            self.atoms_created += 1;
            self.events.push(ProvenanceEvent::AtomCreated {
                atom_id: got.atom_id,
                modality,
                content_hash: hash,
            });
        } else {
            self.dedup_hits += 1;
        }
    }

    fn linked(&mut self, parent: AtomId, child: AtomId, key: OrderKey) {
        self.events
            .push(ProvenanceEvent::CompositionCreated { parent, child, key });
    }
}

/// One ingestion worker. Owns its own connection; share the spatial index
/// and math strategies between workers through `Arc`.
pub struct IngestWorker {
    store: Store,
    worker_id: String,
    index: Arc<SpatialIndex>,
    embedder: Option<Arc<dyn Embedder>>,
    sink: Arc<dyn ProvenanceSink>,
}

impl IngestWorker {
    pub fn new(store: Store, worker_id: impl Into<String>, index: Arc<SpatialIndex>) -> Self {
        Self {
            store,
            worker_id: worker_id.into(),
            index,
            embedder: None,
            sink: Arc::new(NullSink),
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ProvenanceSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Claim a pending job and ingest the file named by its source reference.
    pub fn run(&self, job_id: Uuid) -> Result<IngestReport> {
        let job = self.store.claim_job(job_id, &self.worker_id)?;
        let source = self.read_source(&job)?;
        self.drive(job, &source)
    }

    pub fn run_on(&self, job_id: Uuid, source: &[u8]) -> Result<IngestReport> {
        let job = self.store.claim_job(job_id, &self.worker_id)?;
        self.drive(job, source)
    }

    /// Resume from the job's last committed cursor.
    pub fn resume(&self, job_id: Uuid) -> Result<IngestReport> {
        let lease = self.store.config().job_lease_secs;
        let job = self.store.resume_job(job_id, &self.worker_id, lease)?;
        let source = self.read_source(&job)?;
        self.drive(job, &source)
    }

    pub fn resume_on(&self, job_id: Uuid, source: &[u8]) -> Result<IngestReport> {
        let lease = self.store.config().job_lease_secs;
        let job = self.store.resume_job(job_id, &self.worker_id, lease)?;
        self.drive(job, source)
    }

    fn read_source(&self, job: &IngestionJob) -> Result<Vec<u8>> {
        std::fs::read(&job.source_reference).map_err(|e| {
            let err = StoreError::Io(std::io::Error::new(
                e.kind(),
                format!("{}: {e}", job.source_reference),
            ));
            self.fail(job, err)
        })
    }

    /// Mark the job failed and hand the error back for propagation.
    fn fail(&self, job: &IngestionJob, err: StoreError) -> StoreError {
        if let Err(e) = self.store.fail_job(job.job_id, &self.worker_id, &err.to_string()) {
            tracing::error!(job_id = %job.job_id, error = %e, "could not record job failure");
        }
        err
    }

    fn drive(&self, mut job: IngestionJob, source: &[u8]) -> Result<IngestReport> {
        let config = self.store.config().clone();
        let mut report = IngestReport::starting(&job);

        let atomizer = Atomizer::new(job.modality, &job.params, &config.chunk_limits())
            .map_err(|e| self.fail(&job, e.into()))?;
        let projection = if job.params.embed {
            let Some(embedder) = self.embedder.clone() else {
                return Err(self.fail(
                    &job,
                    StoreError::Embedding("job requests embeddings but no embedder is configured".into()),
                ));
            };
            let anchors = self.store.anchors().map_err(|e| self.fail(&job, e))?;
            Some((embedder, anchors))
        } else {
            None
        };

        loop {
            let current = self.store.require_job(job.job_id)?;
            if current.status != JobStatus::Running
                || current.worker_id.as_deref() != Some(self.worker_id.as_str())
            {
                tracing::info!(
                    job_id = %job.job_id,
                    status = %current.status,
                    "job no longer held by this worker, stopping"
                );
                return Ok(report.finish(&current));
            }
            job = current;

            let chunk = match atomizer.next_chunk(source, job.cursor) {
                Ok(Some(chunk)) => chunk,
                Ok(None) => {
                    let done = self.complete(&job)?;
                    tracing::info!(
                        job_id = %job.job_id,
                        status = %done.status,
                        chunks = done.chunks_committed,
                        "ingestion finished"
                    );
                    return Ok(report.finish(&done));
                }
                Err(e) => return Err(self.fail(&job, e.into())),
            };

            if job.quota_remaining <= 0 {
                return Err(self.fail(
                    &job,
                    StoreError::QuotaExceeded {
                        job_id: job.job_id,
                        cursor: job.cursor,
                    },
                ));
            }

            let hashed = chunk
                .hashed(config.max_atom_bytes)
                .map_err(|e| self.fail(&job, e.into()))?;
            let embedding = match &projection {
                Some((embedder, anchors)) => Some(
                    embed_chunk(embedder.as_ref(), anchors, hashed.chunk.raw(source))
                        .map_err(|e| self.fail(&job, e))?,
                ),
                None => None,
            };

            let committed = match self.commit_chunk(&job, &hashed, embedding.as_ref()) {
                Ok(Some(c)) => c,
                // guard lost: the loop head reports why
                Ok(None) => continue,
                Err(e) => return Err(self.fail(&job, e)),
            };

            if let (Some(root), Some((_, key))) = (committed.chunk_root, &embedding) {
                self.index.insert(root, *key);
            }
            for event in committed.events {
                self.sink.publish(event);
            }
            report.chunks += 1;
            report.atoms_created += committed.atoms_created;
            report.dedup_hits += committed.dedup_hits;
            tracing::debug!(
                job_id = %job.job_id,
                start = hashed.chunk.start,
                end = hashed.chunk.end,
                units = hashed.chunk.units.len(),
                "chunk committed"
            );
        }
    }

    fn commit_chunk(
        &self,
        job: &IngestionJob,
        hashed: &HashedChunk,
        embedding: Option<&(Vec<f32>, SpatialKey)>,
    ) -> Result<Option<Committed>> {
        let chunk = &hashed.chunk;
        let mut out = Committed::default();
        let tx = self.store.immediate()?;

        let doc = match job.root_atom_id {
            Some(id) => id,
            None => {
                let hash = anchor_digest(&job.job_id);
                let got = ensure_anchor_on(&tx, Modality::DocumentRoot, &hash)?;
                out.acquired(got, Modality::DocumentRoot, hash);
                got.atom_id
            }
        };

        let root = upsert_on(&tx, chunk.modality, &hashed.root_hash, None)?;
        out.acquired(root, chunk.modality, hashed.root_hash);
        if root.created {
            for (unit, hash) in chunk.units.iter().zip(&hashed.unit_hashes) {
                let got = upsert_on(&tx, chunk.unit_modality, hash, Some(&unit.value))?;
                out.acquired(got, chunk.unit_modality, *hash);
                insert_edge_on(&tx, root.atom_id, got.atom_id, unit.key)?;
                out.linked(root.atom_id, got.atom_id, unit.key);
            }
        }

        let seq = OrderKey::Sequence(job.chunks_committed);
        link_on(
            &tx,
            doc,
            root.atom_id,
            seq,
            self.store.config().max_composition_depth,
        )?;
        out.linked(doc, root.atom_id, seq);

        if let Some((vector, key)) = embedding {
            put_embedding_on(&tx, root.atom_id, vector, *key)?;
            out.chunk_root = Some(root.atom_id);
        }

        let n = tx.execute(
            "UPDATE ingestion_jobs SET
                 cursor = ?1,
                 quota_remaining = quota_remaining - 1,
                 chunks_committed = chunks_committed + 1,
                 root_atom_id = ?2,
                 updated_at = ?3
             WHERE job_id = ?4 AND status = 'running' AND worker_id = ?5 AND cursor = ?6",
            rusqlite::params![
                chunk.end as i64,
                doc.0,
                now(),
                job.job_id.to_string(),
                self.worker_id,
                job.cursor as i64
            ],
        )?;
        if n == 0 {
            tracing::info!(job_id = %job.job_id, "chunk rolled back, job changed underneath");
            return Ok(None);
        }
        tx.commit()?;
        Ok(Some(out))
    }

    fn complete(&self, job: &IngestionJob) -> Result<IngestionJob> {
        let tx = self.store.immediate()?;
        let doc = match job.root_atom_id {
            Some(id) => id,
            None => {
                let hash = anchor_digest(&job.job_id);
                ensure_anchor_on(&tx, Modality::DocumentRoot, &hash)?.atom_id
            }
        };
        let n = tx.execute(
            "UPDATE ingestion_jobs SET status = 'completed', root_atom_id = ?1, updated_at = ?2
             WHERE job_id = ?3 AND status = 'running' AND worker_id = ?4",
            rusqlite::params![doc.0, now(), job.job_id.to_string(), self.worker_id],
        )?;
        if n > 0 {
            tx.commit()?;
        } else {
            drop(tx);
        }
        self.store.require_job(job.job_id)
    }
}

fn embed_chunk(
    embedder: &dyn Embedder,
    anchors: &AnchorSet,
    raw: &[u8],
) -> Result<(Vec<f32>, SpatialKey)> {
    let vector = embedder
        .embed(raw)
        .map_err(|e| StoreError::Embedding(e.0))?;
    let key = anchors.project(&vector)?;
    Ok((vector, key))
}
