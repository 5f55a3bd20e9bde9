//! End-to-end ingestion against real SQLite databases: dedup, round trips,
//! resumption, cancellation, concurrency and collection.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use atomdb_core::atomizer::PnmHeader;
use atomdb_core::{
    AtomId, AtomizerParams, EmbedError, Embedder, HashedNgramEmbedder, JobStatus, Modality,
    OrderKey, ProvenanceEvent, ProvenanceSink, Reconstructed, SourceModality, SpatialIndex,
    TextGranularity, digest,
};
use atomdb_store::{EngineConfig, IngestWorker, Store, StoreError};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;
use uuid::Uuid;

fn small_chunks() -> EngineConfig {
    EngineConfig {
        text_chunk_bytes: 8,
        image_rows_per_chunk: 2,
        audio_samples_per_chunk: 5,
        weights_scalars_per_chunk: 6,
        embedding_dim: 64,
        ..EngineConfig::default()
    }
}

fn db(dir: &TempDir) -> PathBuf {
    dir.path().join("atoms.db")
}

fn open(path: &Path, config: &EngineConfig) -> Store {
    Store::open_with_config(path, config.clone()).unwrap()
}

fn memory_worker(config: EngineConfig) -> IngestWorker {
    IngestWorker::new(
        Store::open_in_memory_with_config(config).unwrap(),
        "w0",
        Arc::new(SpatialIndex::new(8)),
    )
}

fn ingest(w: &IngestWorker, m: SourceModality, params: AtomizerParams, src: &[u8]) -> AtomId {
    let job = w.store().create_job(m, "mem", 10_000, &params).unwrap();
    let report = w.run_on(job.job_id, src).unwrap();
    assert_eq!(report.status, JobStatus::Completed);
    report.root_atom_id.unwrap()
}

fn ppm(width: usize, height: usize, seed: u64) -> Vec<u8> {
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut out = PnmHeader::encode(width, height, 3);
    // few distinct colours so pixels dedup
    out.extend((0..width * height * 3).map(|_| rng.random_range(0..4u8) * 60));
    out
}

// --- scenarios ---

#[test]
fn two_by_two_black_image_dedups_to_one_pixel() {
    let w = memory_worker(EngineConfig::default());
    let s = w.store();
    let doc = ingest(&w, SourceModality::Image, AtomizerParams::default(), &ppm_black());

    let pixel = s.lookup(Modality::Pixel, &digest(&[0, 0, 0])).unwrap().unwrap();
    assert_eq!(pixel.reference_count, 4);

    let bands: Vec<_> = s.children_of(doc).map(|c| c.unwrap()).collect();
    assert_eq!(bands.len(), 1);
    let edges: Vec<_> = s.children_of(bands[0].child).map(|c| c.unwrap()).collect();
    assert_eq!(edges.len(), 4);
    assert!(edges.iter().all(|e| e.child == pixel.atom_id));
    assert!(edges.iter().all(|e| matches!(e.key, OrderKey::Spatial { .. })));
    assert_eq!(s.get(bands[0].child).unwrap().unwrap().modality, Modality::ImageBand);
}

fn ppm_black() -> Vec<u8> {
    let mut out = PnmHeader::encode(2, 2, 3);
    out.extend([0u8; 12]);
    out
}

#[test]
fn quota_zero_fails_without_atoms() {
    let w = memory_worker(EngineConfig::default());
    let s = w.store();
    let job = s
        .create_job(SourceModality::Image, "mem", 0, &AtomizerParams::default())
        .unwrap();
    assert!(matches!(
        w.run_on(job.job_id, &ppm_black()),
        Err(StoreError::QuotaExceeded { .. })
    ));
    let job = s.require_job(job.job_id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.cursor, 0);
    let stats = s.stats().unwrap();
    assert_eq!((stats.atoms, stats.compositions), (0, 0));
}

#[test]
fn quota_exhaustion_keeps_cursor_and_blocks_resume() {
    let w = memory_worker(small_chunks());
    let s = w.store();
    let src = b"0123456789abcdefghijklmnopqrstuv"; // 4 chunks of 8
    let job = s
        .create_job(SourceModality::Text, "mem", 2, &AtomizerParams::default())
        .unwrap();
    assert!(matches!(
        w.run_on(job.job_id, src),
        Err(StoreError::QuotaExceeded { cursor: 16, .. })
    ));
    let job = s.require_job(job.job_id).unwrap();
    assert_eq!((job.cursor, job.chunks_committed, job.quota_remaining), (16, 2, 0));

    // exhausted quota keeps failing on resume
    assert!(matches!(
        w.resume_on(job.job_id, src),
        Err(StoreError::QuotaExceeded { .. })
    ));
}

// --- round trips ---

#[test]
fn text_roundtrip_char_and_token() {
    let text = "Atoms all the way down. Ünïcödé 🦀 survives chunk boundaries!\n".repeat(5);
    for granularity in [TextGranularity::Char, TextGranularity::Token] {
        let w = memory_worker(small_chunks());
        let params = AtomizerParams {
            granularity,
            ..AtomizerParams::default()
        };
        let doc = ingest(&w, SourceModality::Text, params, text.as_bytes());
        assert_eq!(w.store().reconstruct(doc).unwrap(), Reconstructed::Text(text.clone()));
    }
}

#[test]
fn image_roundtrip_multiple_bands() {
    let w = memory_worker(small_chunks());
    let src = ppm(7, 5, 3);
    let doc = ingest(&w, SourceModality::Image, AtomizerParams::default(), &src);
    let Reconstructed::Raster(raster) = w.store().reconstruct(doc).unwrap() else {
        panic!("image should reconstruct to a raster");
    };
    assert_eq!((raster.width, raster.height, raster.cell_bytes), (7, 5, 3));
    assert_eq!(raster.to_pnm().unwrap(), src);
}

#[test]
fn audio_roundtrip() {
    let w = memory_worker(small_chunks());
    let samples: Vec<i16> = (0..23).map(|i| ((i * 37) % 7 - 3) * 1000).collect();
    let src: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
    let params = AtomizerParams {
        sample_width: Some(2),
        ..AtomizerParams::default()
    };
    let doc = ingest(&w, SourceModality::Audio, params, &src);
    assert_eq!(w.store().reconstruct(doc).unwrap(), Reconstructed::Bytes(src));
}

#[test]
fn weights_roundtrip_bit_exact() {
    let w = memory_worker(small_chunks());
    let values = [1.0f32, -0.0, 0.0, f32::NAN, 3.5, -2.25, 1e-30, 7.0, 1.0, 0.5, -0.0, 9.0, 1.0, 1.0, 2.0];
    let src: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    let params = AtomizerParams {
        columns: Some(3),
        ..AtomizerParams::default()
    };
    let doc = ingest(&w, SourceModality::Weights, params, &src);
    let out = w.store().reconstruct(doc).unwrap();
    let Reconstructed::Raster(ref r) = out else {
        panic!("tensor should reconstruct to a raster");
    };
    assert_eq!((r.width, r.height, r.cell_bytes), (3, 5, 4));
    assert_eq!(out.into_bytes(), src);
}

// --- dedup across sources ---

#[test]
fn second_ingest_of_same_content_creates_only_a_document_root() {
    let w = memory_worker(small_chunks());
    let s = w.store();
    let text = b"repeated content, repeated content";
    let first = ingest(&w, SourceModality::Text, AtomizerParams::default(), text);
    let before = s.stats().unwrap().atoms;

    let job = s
        .create_job(SourceModality::Text, "mem", 100, &AtomizerParams::default())
        .unwrap();
    let report = w.run_on(job.job_id, text).unwrap();
    assert_eq!(report.atoms_created, 1);
    assert_eq!(s.stats().unwrap().atoms, before + 1);

    let second = report.root_atom_id.unwrap();
    assert_ne!(first, second);
    assert_eq!(s.reconstruct(first).unwrap(), s.reconstruct(second).unwrap());
}

// --- resumability ---

type AtomRow = (String, Vec<u8>, i64, bool);
type EdgeRow = (Vec<u8>, Vec<u8>, String, i64, i64, i64);

/// Atoms and edges by content. Document roots hash per job, so their hash
/// is blanked.
fn content_snapshot(path: &Path) -> (Vec<AtomRow>, Vec<EdgeRow>) {
    let conn = rusqlite::Connection::open(path).unwrap();
    let atoms = conn
        .prepare(
            "SELECT modality,
                    CASE WHEN modality = 'document-root' THEN x'' ELSE content_hash END,
                    reference_count, is_deleted
             FROM atoms ORDER BY 1, 2",
        )
        .unwrap()
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)))
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    let edges = conn
        .prepare(
            "SELECT CASE WHEN p.modality = 'document-root' THEN x'' ELSE p.content_hash END,
                    c.content_hash, e.key_kind, e.ord_a, e.ord_b, e.ord_c
             FROM atom_compositions e
             JOIN atoms p ON p.atom_id = e.parent_atom_id
             JOIN atoms c ON c.atom_id = e.child_atom_id
             ORDER BY 1, 2, 3, 4, 5, 6",
        )
        .unwrap()
        .query_map([], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?))
        })
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    (atoms, edges)
}

/// Fails every call after the first `ok` ones.
struct FlakyEmbedder {
    inner: HashedNgramEmbedder,
    ok: usize,
    calls: AtomicUsize,
}

impl Embedder for FlakyEmbedder {
    fn dim(&self) -> usize {
        self.inner.dim()
    }

    fn embed(&self, raw: &[u8]) -> Result<Vec<f32>, EmbedError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) >= self.ok {
            return Err(EmbedError("accelerator went away".into()));
        }
        self.inner.embed(raw)
    }
}

#[test]
fn failed_job_resumes_from_cursor_without_duplicates() {
    let dir = TempDir::new().unwrap();
    let config = small_chunks();
    let text = "resumable ingestion keeps its place in the source".repeat(3);
    let params = AtomizerParams {
        embed: true,
        ..AtomizerParams::default()
    };

    let job_id = {
        let store = open(&db(&dir), &config);
        let job = store.create_job(SourceModality::Text, "mem", 1000, &params).unwrap();
        let flaky = Arc::new(FlakyEmbedder {
            inner: HashedNgramEmbedder::new(64),
            ok: 4,
            calls: AtomicUsize::new(0),
        });
        let w = IngestWorker::new(store, "first", Arc::new(SpatialIndex::new(8)))
            .with_embedder(flaky);
        assert!(matches!(
            w.run_on(job.job_id, text.as_bytes()),
            Err(StoreError::Embedding(_))
        ));
        let failed = w.store().require_job(job.job_id).unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.chunks_committed, 4);
        assert_eq!(failed.cursor, 32);
        job.job_id
    };

    // a fresh process picks the job back up
    let store = open(&db(&dir), &config);
    let w = IngestWorker::new(store, "second", Arc::new(SpatialIndex::new(8)))
        .with_embedder(Arc::new(HashedNgramEmbedder::new(64)));
    let report = w.resume_on(job_id, text.as_bytes()).unwrap();
    assert_eq!(report.status, JobStatus::Completed);

    let s = w.store();
    let job = s.require_job(job_id).unwrap();
    let expected_chunks = text.len().div_ceil(8) as u64;
    assert_eq!(job.chunks_committed, expected_chunks);
    assert_eq!(report.chunks, expected_chunks - 4);

    let doc = job.root_atom_id.unwrap();
    let keys: Vec<OrderKey> = s.children_of(doc).map(|c| c.unwrap().key).collect();
    let expected: Vec<OrderKey> = (0..expected_chunks).map(OrderKey::Sequence).collect();
    assert_eq!(keys, expected);
    assert_eq!(s.reconstruct(doc).unwrap(), Reconstructed::Text(text.clone()));

    // same end state as a run that was never interrupted
    let clean_dir = TempDir::new().unwrap();
    let clean = IngestWorker::new(
        open(&db(&clean_dir), &config),
        "clean",
        Arc::new(SpatialIndex::new(8)),
    )
    .with_embedder(Arc::new(HashedNgramEmbedder::new(64)));
    ingest(&clean, SourceModality::Text, params, text.as_bytes());

    let (resumed, uninterrupted) = (s.stats().unwrap(), clean.store().stats().unwrap());
    assert_eq!(resumed.atoms, uninterrupted.atoms);
    assert_eq!(resumed.compositions, uninterrupted.compositions);
    assert_eq!(resumed.embeddings, uninterrupted.embeddings);
    assert_eq!(resumed.dedup_hits, uninterrupted.dedup_hits);
    assert_eq!(resumed.by_modality, uninterrupted.by_modality);
    drop(w);
    drop(clean);
    assert_eq!(content_snapshot(&db(&dir)), content_snapshot(&db(&clean_dir)));
}

#[test]
fn corrupt_input_fails_and_keeps_cursor() {
    let w = memory_worker(small_chunks());
    let s = w.store();
    let mut src = b"valid text!!".to_vec(); // 12 bytes: one full chunk, then 4 more
    src.extend_from_slice(b"\xff\xfe");
    let job = s
        .create_job(SourceModality::Text, "mem", 100, &AtomizerParams::default())
        .unwrap();
    let err = w.run_on(job.job_id, &src).unwrap_err();
    assert!(matches!(err, StoreError::Atomize(_)));
    let job = s.require_job(job.job_id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.cursor, 8);
    assert!(job.failure_reason.unwrap().contains("corrupt input"));
}

#[test]
fn completed_job_is_not_resumable() {
    let w = memory_worker(EngineConfig::default());
    let job = w
        .store()
        .create_job(SourceModality::Text, "mem", 10, &AtomizerParams::default())
        .unwrap();
    w.run_on(job.job_id, b"done").unwrap();
    assert!(matches!(
        w.resume_on(job.job_id, b"done"),
        Err(StoreError::JobNotResumable { status: JobStatus::Completed, .. })
    ));
}

#[test]
fn crashed_worker_job_taken_over_after_lease() {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig {
        job_lease_secs: 0,
        ..small_chunks()
    };
    let store = open(&db(&dir), &config);
    let job = store
        .create_job(SourceModality::Text, "mem", 100, &AtomizerParams::default())
        .unwrap();
    // claimed and then abandoned
    store.claim_job(job.job_id, "crashed").unwrap();

    let w = IngestWorker::new(open(&db(&dir), &config), "rescuer", Arc::new(SpatialIndex::new(4)));
    let report = w.resume_on(job.job_id, b"rescued text").unwrap();
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(
        w.store().require_job(job.job_id).unwrap().worker_id.as_deref(),
        Some("rescuer")
    );
}

// --- cancellation ---

/// Cancels the job from another connection while the second chunk is being embedded.
struct CancelDuringSecondChunk {
    inner: HashedNgramEmbedder,
    db: PathBuf,
    job: Uuid,
    calls: AtomicUsize,
}

impl Embedder for CancelDuringSecondChunk {
    fn dim(&self) -> usize {
        self.inner.dim()
    }

    fn embed(&self, raw: &[u8]) -> Result<Vec<f32>, EmbedError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 1 {
            let other = Store::open(&self.db).map_err(|e| EmbedError(e.to_string()))?;
            other.cancel_job(self.job).map_err(|e| EmbedError(e.to_string()))?;
        }
        self.inner.embed(raw)
    }
}

#[derive(Default)]
struct Recorder(Mutex<Vec<ProvenanceEvent>>);

impl ProvenanceSink for Recorder {
    fn publish(&self, event: ProvenanceEvent) {
        self.0.lock().unwrap().push(event);
    }
}

#[test]
fn cancellation_rolls_back_in_flight_chunk() {
    let dir = TempDir::new().unwrap();
    let config = small_chunks();
    let store = open(&db(&dir), &config);
    let params = AtomizerParams {
        embed: true,
        ..AtomizerParams::default()
    };
    let job = store
        .create_job(SourceModality::Text, "mem", 100, &params)
        .unwrap();

    let embedder = Arc::new(CancelDuringSecondChunk {
        inner: HashedNgramEmbedder::new(64),
        db: db(&dir),
        job: job.job_id,
        calls: AtomicUsize::new(0),
    });
    let sink = Arc::new(Recorder::default());
    let index = Arc::new(SpatialIndex::new(8));
    let w = IngestWorker::new(store, "w", index.clone())
        .with_embedder(embedder)
        .with_sink(sink.clone());

    let report = w.run_on(job.job_id, b"aaaaaaaabbbbbbbbcccccccc").unwrap();
    assert_eq!(report.status, JobStatus::Cancelled);
    assert_eq!(report.chunks, 1);

    let s = w.store();
    let job = s.require_job(job.job_id).unwrap();
    assert_eq!(job.cursor, 8);
    assert!(s.lookup(Modality::TextToken, &digest(b"b")).unwrap().is_none());
    assert_eq!(index.len(), 1);

    // only the committed chunk was published: doc root, span, 'a', 8 + 1 edges
    let events = sink.0.lock().unwrap();
    let created = events
        .iter()
        .filter(|e| matches!(e, ProvenanceEvent::AtomCreated { .. }))
        .count();
    assert_eq!(created, 3);
    assert_eq!(events.len(), 3 + 9);
}

// --- concurrency ---

#[test]
fn concurrent_workers_share_atoms() {
    let dir = TempDir::new().unwrap();
    let config = small_chunks();
    let text = "the same sentence ingested by many workers at once".to_string();
    let index = Arc::new(SpatialIndex::new(8));

    let creator = open(&db(&dir), &config);
    let jobs: Vec<Uuid> = (0..4)
        .map(|_| {
            creator
                .create_job(SourceModality::Text, "mem", 1000, &AtomizerParams::default())
                .unwrap()
                .job_id
        })
        .collect();

    let handles: Vec<_> = jobs
        .iter()
        .enumerate()
        .map(|(i, &job_id)| {
            let path = db(&dir);
            let config = config.clone();
            let index = index.clone();
            let text = text.clone();
            std::thread::spawn(move || {
                let w = IngestWorker::new(open(&path, &config), format!("w{i}"), index);
                w.run_on(job_id, text.as_bytes()).unwrap()
            })
        })
        .collect();
    let reports: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(reports.iter().all(|r| r.status == JobStatus::Completed));

    let s = open(&db(&dir), &config);
    let mut distinct: Vec<char> = text.chars().collect();
    distinct.sort();
    distinct.dedup();
    let tokens = s
        .stats()
        .unwrap()
        .by_modality
        .into_iter()
        .find(|(m, _)| *m == Modality::TextToken)
        .unwrap()
        .1;
    assert_eq!(tokens as usize, distinct.len());

    // each span is referenced once per document
    for r in &reports {
        let doc = r.root_atom_id.unwrap();
        for edge in s.children_of(doc) {
            let span = s.get(edge.unwrap().child).unwrap().unwrap();
            assert_eq!(span.reference_count, 4);
        }
        assert_eq!(s.reconstruct(doc).unwrap(), Reconstructed::Text(text.clone()));
    }
}

#[test]
fn concurrent_claims_have_one_winner() {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig::default();
    let job = open(&db(&dir), &config)
        .create_job(SourceModality::Text, "mem", 1, &AtomizerParams::default())
        .unwrap();

    let handles: Vec<_> = (0..6)
        .map(|i| {
            let path = db(&dir);
            std::thread::spawn(move || {
                Store::open(&path).unwrap().claim_job(job.job_id, &format!("w{i}")).is_ok()
            })
        })
        .collect();
    let wins = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|won| *won)
        .count();
    assert_eq!(wins, 1);
}

// --- embeddings & search ---

#[test]
fn embedded_chunks_are_searchable_after_reopen() {
    let dir = TempDir::new().unwrap();
    let config = small_chunks();
    let embedder = Arc::new(HashedNgramEmbedder::new(64));
    let index = Arc::new(SpatialIndex::new(8));
    let params = AtomizerParams {
        embed: true,
        ..AtomizerParams::default()
    };

    let w = IngestWorker::new(open(&db(&dir), &config), "w", index.clone())
        .with_embedder(embedder.clone());
    let doc = ingest(&w, SourceModality::Text, params, b"aaaaaaaazzzzzzzz");
    let spans: Vec<AtomId> = w.store().children_of(doc).map(|c| c.unwrap().child).collect();
    assert_eq!(index.len(), 2);

    let anchors = w.store().anchors().unwrap();
    let key = anchors.project(&embedder.embed(b"zzzzzzzz").unwrap()).unwrap();
    assert_eq!(index.nearest(&key, 1)[0].0, spans[1]);

    let reopened = open(&db(&dir), &config);
    let rebuilt = reopened.load_spatial_index().unwrap();
    assert_eq!(rebuilt.len(), 2);
    assert_eq!(rebuilt.get(spans[0]), index.get(spans[0]));
}

#[test]
fn embedding_follows_pinned_dimension_after_config_change() {
    let dir = TempDir::new().unwrap();
    open(&db(&dir), &small_chunks()).anchors().unwrap();

    let widened = EngineConfig {
        embedding_dim: 128,
        ..small_chunks()
    };
    let store = open(&db(&dir), &widened);
    let embedder = Arc::new(store.embedder().unwrap());
    let w = IngestWorker::new(store, "w", Arc::new(SpatialIndex::new(8))).with_embedder(embedder);
    let params = AtomizerParams {
        embed: true,
        ..AtomizerParams::default()
    };
    let doc = ingest(&w, SourceModality::Text, params, b"pinned dimension");

    let span = w.store().children_of(doc).next().unwrap().unwrap().child;
    let stored = w.store().get_embedding(span).unwrap().unwrap();
    assert_eq!(stored.vector.len(), 64);
}

// --- collection ---

#[test]
fn releasing_document_collects_everything() {
    let w = memory_worker(small_chunks());
    let s = w.store();
    let doc = ingest(
        &w,
        SourceModality::Text,
        AtomizerParams::default(),
        b"abcdabcdabcdabcd plus a tail",
    );
    assert!(s.stats().unwrap().atoms > 0);

    assert_eq!(s.release(doc).unwrap(), 0);
    let report = s.collect_garbage(0).unwrap();
    assert!(report.collected.contains(&doc));

    let stats = s.stats().unwrap();
    assert_eq!((stats.atoms, stats.compositions, stats.embeddings), (0, 0, 0));
}

#[test]
fn shared_content_survives_other_document_collection() {
    let w = memory_worker(small_chunks());
    let s = w.store();
    let a = ingest(&w, SourceModality::Text, AtomizerParams::default(), b"shared!!unique-a");
    let b = ingest(&w, SourceModality::Text, AtomizerParams::default(), b"shared!!unique-b");

    s.release(a).unwrap();
    s.collect_garbage(0).unwrap();
    assert!(s.get(a).unwrap().is_none());
    assert_eq!(
        s.reconstruct(b).unwrap(),
        Reconstructed::Text("shared!!unique-b".into())
    );
}
