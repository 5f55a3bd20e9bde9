mod provenance;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use atomdb_core::{
    AtomId, AtomRecord, AtomizerParams, BoundingBox, ContentHash, Cosine, Embedder, IngestionJob,
    Modality, Reconstructed, SourceModality, SpatialIndex, SpatialKey, TextGranularity,
};
use atomdb_store::{EngineConfig, IngestReport, IngestWorker, Store, database_path, default_data_dir};
use clap::{Parser, Subcommand};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "atomdb", about = "Content-addressed atom store with spatial search")]
struct Cli {
    /// Data directory (defaults to $ATOMDB_DATA_DIR, then ~/.atomdb)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable verbose debug output
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create one ingestion job per file and run them
    Ingest {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// text, image, audio or weights
        #[arg(long, default_value = "text")]
        modality: SourceModality,

        /// Maximum number of chunks each job may commit
        #[arg(long, default_value_t = 1_000_000)]
        quota: u64,

        /// Embed chunk roots and add them to the spatial index
        #[arg(long)]
        embed: bool,

        /// Concurrent workers
        #[arg(long, default_value_t = 4)]
        workers: usize,

        /// char or token (text only)
        #[arg(long, default_value = "char")]
        granularity: TextGranularity,

        /// Scalars per row (weights only)
        #[arg(long)]
        columns: Option<usize>,

        /// Bytes per sample (audio only)
        #[arg(long)]
        sample_width: Option<usize>,
    },

    /// Resume failed or stalled jobs from their last committed chunk
    Resume {
        #[arg(required = true)]
        jobs: Vec<Uuid>,
    },

    /// Cancel a job
    Cancel { job: Uuid },

    /// List ingestion jobs
    Jobs,

    /// Show one ingestion job
    Job { job: Uuid },

    /// Show an atom
    Get { atom: AtomId },

    /// Find an atom by modality and content hash
    Lookup { modality: Modality, hash: ContentHash },

    /// List an atom's children in order
    Children { atom: AtomId },

    /// List the atoms that contain an atom
    Parents { atom: AtomId },

    /// Rebuild the content under an atom
    Reconstruct {
        atom: AtomId,

        /// Write to a file instead of stdout (rasters become PGM/PPM when possible)
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Nearest embedded atoms to some text or to an existing atom
    Nearest {
        #[arg(long, required_unless_present = "atom", conflicts_with = "atom")]
        text: Option<String>,

        #[arg(long)]
        atom: Option<AtomId>,

        #[arg(short, default_value_t = 10)]
        k: usize,
    },

    /// Embedded atoms inside a bounding box
    #[command(allow_negative_numbers = true)]
    Range {
        x0: f64,
        y0: f64,
        z0: f64,
        x1: f64,
        y1: f64,
        z1: f64,
    },

    /// Drop one reference to an atom
    Release { atom: AtomId },

    /// Delete soft-deleted atoms past the grace period
    Gc {
        /// Seconds an atom must stay deleted before collection
        #[arg(long)]
        grace: Option<u64>,
    },

    /// Re-derive anchors from a new seed and re-project every embedding
    Recalibrate {
        #[arg(long)]
        seed: u64,
    },

    /// Show store statistics
    Stats,
}

struct Env {
    data_dir: PathBuf,
    config: EngineConfig,
}

impl Env {
    fn load(cli: &Cli) -> Result<Self> {
        let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create {}", data_dir.display()))?;
        let config = EngineConfig::load(&data_dir).context("failed to load configuration")?;
        Ok(Self { data_dir, config })
    }

    fn db_path(&self) -> PathBuf {
        database_path(&self.data_dir)
    }

    fn open(&self) -> Result<Store> {
        Store::open_with_config(&self.db_path(), self.config.clone())
            .with_context(|| format!("failed to open {}", self.db_path().display()))
    }
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let env = Env::load(&cli)?;

    match cli.command {
        Commands::Ingest {
            files,
            modality,
            quota,
            embed,
            workers,
            granularity,
            columns,
            sample_width,
        } => {
            let params = AtomizerParams {
                granularity,
                sample_width,
                columns,
                embed,
            };
            cmd_ingest(&env, &files, modality, quota, &params, workers).await
        }
        Commands::Resume { jobs } => run_jobs(&env, jobs, Mode::Resume, 4).await,
        Commands::Cancel { job } => cmd_cancel(&env, job),
        Commands::Jobs => cmd_jobs(&env),
        Commands::Job { job } => cmd_job(&env, job),
        Commands::Get { atom } => cmd_get(&env, atom),
        Commands::Lookup { modality, hash } => cmd_lookup(&env, modality, &hash),
        Commands::Children { atom } => cmd_children(&env, atom),
        Commands::Parents { atom } => cmd_parents(&env, atom),
        Commands::Reconstruct { atom, output } => cmd_reconstruct(&env, atom, output.as_deref()),
        Commands::Nearest { text, atom, k } => cmd_nearest(&env, text.as_deref(), atom, k),
        Commands::Range {
            x0,
            y0,
            z0,
            x1,
            y1,
            z1,
        } => cmd_range(&env, SpatialKey::new(x0, y0, z0), SpatialKey::new(x1, y1, z1)),
        Commands::Release { atom } => cmd_release(&env, atom),
        Commands::Gc { grace } => cmd_gc(&env, grace),
        Commands::Recalibrate { seed } => cmd_recalibrate(&env, seed),
        Commands::Stats => cmd_stats(&env),
    }
}

// ---------------------------------------------------------------------------
// Ingestion
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
enum Mode {
    Run,
    Resume,
}

async fn cmd_ingest(
    env: &Env,
    files: &[PathBuf],
    modality: SourceModality,
    quota: u64,
    params: &AtomizerParams,
    workers: usize,
) -> Result<()> {
    let store = env.open()?;
    let mut jobs = Vec::with_capacity(files.len());
    for file in files {
        let path = std::path::absolute(file)
            .with_context(|| format!("failed to resolve {}", file.display()))?;
        if !path.is_file() {
            bail!("{} is not a file", file.display());
        }
        let job = store.create_job(modality, &path.to_string_lossy(), quota, params)?;
        println!("job {} created for {}", job.job_id, file.display());
        jobs.push(job.job_id);
    }
    drop(store);
    run_jobs(env, jobs, Mode::Run, workers).await
}

/// Drive `jobs` on blocking tasks, `workers` at a time, each with its own
/// connection. Ctrl-C cancels every job that has not finished.
async fn run_jobs(env: &Env, jobs: Vec<Uuid>, mode: Mode, workers: usize) -> Result<()> {
    let store = env.open()?;
    let index = Arc::new(store.load_spatial_index()?);
    let embedder: Arc<dyn Embedder> = Arc::new(store.embedder()?);
    drop(store);
    let (sink, writer) = provenance::spawn_writer(env.data_dir.join(provenance::PROVENANCE_FILE));
    let interrupted = CancellationToken::new();
    let permits = Arc::new(Semaphore::new(workers.max(1)));

    let watcher = {
        let interrupted = interrupted.clone();
        let db = env.db_path();
        let config = env.config.clone();
        let jobs = jobs.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            tracing::warn!("interrupt received, cancelling in-flight jobs");
            interrupted.cancel();
            let cancelled = tokio::task::spawn_blocking(move || -> Result<()> {
                let store = Store::open_with_config(&db, config)?;
                for job in jobs {
                    store.cancel_job(job)?;
                }
                Ok(())
            })
            .await;
            match cancelled {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "failed to cancel jobs"),
                Err(e) => tracing::error!(error = %e, "cancellation task panicked"),
            }
        })
    };

    let kit = WorkerKit {
        db: env.db_path(),
        config: env.config.clone(),
        index,
        embedder,
        sink,
    };
    let mut tasks = JoinSet::new();
    for (i, job_id) in jobs.iter().copied().enumerate() {
        let permits = permits.clone();
        let interrupted = interrupted.clone();
        let kit = kit.clone();
        let worker_id = format!("atomdb-{}-{i}", std::process::id());
        tasks.spawn(async move {
            let _permit = permits.acquire_owned().await?;
            if interrupted.is_cancelled() {
                return Ok((job_id, None));
            }
            let report = tokio::task::spawn_blocking(move || kit.drive(worker_id, job_id, mode))
                .await
                .context("ingestion worker panicked")?;
            Ok::<_, anyhow::Error>((job_id, Some(report)))
        });
    }
    // the provenance writer stops once the last worker drops its sink
    drop(kit);

    let mut failed = 0usize;
    while let Some(joined) = tasks.join_next().await {
        match joined.context("ingestion task panicked")? {
            Ok((job_id, Some(Ok(report)))) => print_report(job_id, &report),
            Ok((job_id, Some(Err(e)))) => {
                failed += 1;
                eprintln!("job {job_id} failed: {e:#}");
            }
            Ok((job_id, None)) => println!("job {job_id}: skipped after interrupt"),
            Err(e) => {
                failed += 1;
                eprintln!("{e:#}");
            }
        }
    }
    watcher.abort();

    match writer.await {
        Ok(Ok(events)) => tracing::info!(events, "provenance written"),
        Ok(Err(e)) => tracing::warn!(error = %e, "provenance writer failed"),
        Err(e) => tracing::warn!(error = %e, "provenance writer panicked"),
    }

    if failed > 0 {
        bail!("{failed} of {} jobs failed", jobs.len());
    }
    Ok(())
}

/// Everything a worker needs besides its own connection.
#[derive(Clone)]
struct WorkerKit {
    db: PathBuf,
    config: EngineConfig,
    index: Arc<SpatialIndex>,
    embedder: Arc<dyn Embedder>,
    sink: Arc<provenance::ChannelSink>,
}

impl WorkerKit {
    fn drive(self, worker_id: String, job_id: Uuid, mode: Mode) -> Result<IngestReport> {
        let store = Store::open_with_config(&self.db, self.config)?;
        let worker = IngestWorker::new(store, worker_id, self.index)
            .with_embedder(self.embedder)
            .with_sink(self.sink);
        let report = match mode {
            Mode::Run => worker.run(job_id)?,
            Mode::Resume => worker.resume(job_id)?,
        };
        Ok(report)
    }
}

fn print_report(job_id: Uuid, report: &IngestReport) {
    println!(
        "job {job_id}: {} at byte {}, {} chunks, {} new atoms, {} dedup hits, root {}",
        report.status,
        report.cursor,
        report.chunks,
        report.atoms_created,
        report.dedup_hits,
        report
            .root_atom_id
            .map_or_else(|| "-".to_string(), |id| id.to_string()),
    );
}

fn cmd_cancel(env: &Env, job: Uuid) -> Result<()> {
    let store = env.open()?;
    if store.cancel_job(job)? {
        println!("job {job} cancelled");
    } else {
        let status = store.require_job(job)?.status;
        println!("job {job} already {status}");
    }
    Ok(())
}

fn cmd_jobs(env: &Env) -> Result<()> {
    let jobs = env.open()?.list_jobs()?;
    if jobs.is_empty() {
        println!("(no jobs)");
    }
    for job in &jobs {
        println!(
            "{}  {:<9} {:<7} cursor={:<10} quota={:<8} {}",
            job.job_id,
            job.status.as_str(),
            job.modality.as_str(),
            job.cursor,
            job.quota_remaining,
            job.source_reference
        );
    }
    Ok(())
}

fn cmd_job(env: &Env, job: Uuid) -> Result<()> {
    let job = env.open()?.require_job(job)?;
    print_job(&job);
    Ok(())
}

fn print_job(job: &IngestionJob) {
    println!("job:        {}", job.job_id);
    println!("status:     {}", job.status);
    println!("modality:   {}", job.modality);
    println!("source:     {}", job.source_reference);
    println!("cursor:     {}", job.cursor);
    println!("chunks:     {}", job.chunks_committed);
    println!("quota:      {}", job.quota_remaining);
    if let Some(root) = job.root_atom_id {
        println!("root:       {root}");
    }
    if let Some(worker) = &job.worker_id {
        println!("worker:     {worker}");
    }
    if let Some(reason) = &job.failure_reason {
        println!("failure:    {reason}");
    }
    println!("updated:    {}", atomdb_core::time::unix_to_iso8601(job.updated_at));
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

fn print_atom(atom: &AtomRecord) {
    println!("atom:       {}", atom.atom_id);
    println!("modality:   {}", atom.modality);
    println!("hash:       {}", atom.content_hash);
    println!("refs:       {}", atom.reference_count);
    println!("dedup_hits: {}", atom.dedup_hits);
    println!("deleted:    {}", atom.is_deleted);
    match &atom.value {
        Some(v) => println!("value:      {}", render_value(atom.modality, v)),
        None => println!("value:      (composite)"),
    }
}

fn render_value(modality: Modality, value: &[u8]) -> String {
    if modality == Modality::TextToken
        && let Ok(s) = std::str::from_utf8(value)
    {
        return format!("{s:?}");
    }
    value.iter().map(|b| format!("{b:02x}")).collect()
}

fn cmd_get(env: &Env, atom: AtomId) -> Result<()> {
    match env.open()?.get(atom)? {
        Some(record) => print_atom(&record),
        None => bail!("atom {atom} not found"),
    }
    Ok(())
}

fn cmd_lookup(env: &Env, modality: Modality, hash: &ContentHash) -> Result<()> {
    match env.open()?.lookup(modality, hash)? {
        Some(record) => print_atom(&record),
        None => println!("(not found)"),
    }
    Ok(())
}

fn cmd_children(env: &Env, atom: AtomId) -> Result<()> {
    let store = env.open()?;
    if store.get(atom)?.is_none() {
        bail!("atom {atom} not found");
    }
    for edge in store.children_of(atom) {
        let edge = edge?;
        println!("{}\t{}", edge.key, edge.child);
    }
    Ok(())
}

fn cmd_parents(env: &Env, atom: AtomId) -> Result<()> {
    let store = env.open()?;
    if store.get(atom)?.is_none() {
        bail!("atom {atom} not found");
    }
    for parent in store.parents_of(atom)? {
        println!("{parent}");
    }
    Ok(())
}

fn cmd_reconstruct(env: &Env, atom: AtomId, output: Option<&Path>) -> Result<()> {
    let rebuilt = env
        .open()?
        .reconstruct(atom)
        .with_context(|| format!("failed to reconstruct atom {atom}"))?;
    let bytes = match rebuilt {
        Reconstructed::Raster(raster) => match raster.to_pnm() {
            Some(pnm) => pnm,
            None => raster.data,
        },
        other => other.into_bytes(),
    };
    match output {
        Some(path) => {
            std::fs::write(path, &bytes)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("wrote {} bytes to {}", bytes.len(), path.display());
        }
        None => {
            use std::io::Write;
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&bytes)?;
            stdout.flush()?;
        }
    }
    Ok(())
}

fn cmd_nearest(env: &Env, text: Option<&str>, atom: Option<AtomId>, k: usize) -> Result<()> {
    let store = env.open()?;
    let (vector, key) = match (text, atom) {
        (Some(text), _) => {
            let vector = store
                .embedder()?
                .embed(text.as_bytes())
                .context("failed to embed query")?;
            let key = store.anchors()?.project(&vector)?;
            (vector, key)
        }
        (None, Some(atom)) => {
            let stored = store
                .get_embedding(atom)?
                .with_context(|| format!("atom {atom} has no embedding"))?;
            (stored.vector, stored.key)
        }
        (None, None) => bail!("pass --text or --atom"),
    };

    let index = store.load_spatial_index()?;
    print_neighbours(&store, &index, &vector, &key, k)
}

fn print_neighbours(
    store: &Store,
    index: &SpatialIndex,
    vector: &[f32],
    key: &SpatialKey,
    k: usize,
) -> Result<()> {
    let hits = index.nearest(key, k);
    if hits.is_empty() {
        println!("(no embedded atoms)");
        return Ok(());
    }
    let ids: Vec<AtomId> = hits.iter().map(|(id, _)| *id).collect();
    let cosine: std::collections::HashMap<AtomId, f32> =
        store.rerank(vector, &ids, &Cosine)?.into_iter().collect();
    for (id, spatial) in hits {
        match cosine.get(&id) {
            Some(c) => println!("{id}\tspatial={spatial:.6}\tcosine={c:.6}"),
            None => println!("{id}\tspatial={spatial:.6}"),
        }
    }
    Ok(())
}

fn cmd_range(env: &Env, a: SpatialKey, b: SpatialKey) -> Result<()> {
    let index = env.open()?.load_spatial_index()?;
    let mut ids: Vec<AtomId> = index.range(&BoundingBox::new(a, b)).into_iter().collect();
    ids.sort();
    if ids.is_empty() {
        println!("(none)");
    }
    for id in ids {
        println!("{id}");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Maintenance
// ---------------------------------------------------------------------------

fn cmd_release(env: &Env, atom: AtomId) -> Result<()> {
    let remaining = env.open()?.release(atom)?;
    if remaining == 0 {
        println!("atom {atom}: 0 references, soft-deleted");
    } else {
        println!("atom {atom}: {remaining} references");
    }
    Ok(())
}

fn cmd_gc(env: &Env, grace: Option<u64>) -> Result<()> {
    let grace = grace.unwrap_or(env.config.gc_grace_secs);
    let report = env.open()?.collect_garbage(grace)?;
    println!(
        "collected {} atoms, released {} child references, skipped {}",
        report.collected.len(),
        report.released_children,
        report.skipped
    );
    Ok(())
}

fn cmd_recalibrate(env: &Env, seed: u64) -> Result<()> {
    let r = env.open()?.recalibrate_anchors(seed)?;
    println!(
        "anchors reseeded {} -> {}, {} embeddings re-projected",
        r.previous_seed, r.seed, r.reprojected
    );
    Ok(())
}

fn cmd_stats(env: &Env) -> Result<()> {
    let stats = env.open()?.stats()?;
    println!("atoms:        {}", stats.atoms);
    println!("live:         {}", stats.live_atoms);
    println!("deleted:      {}", stats.deleted_atoms);
    println!("compositions: {}", stats.compositions);
    println!("embeddings:   {}", stats.embeddings);
    println!("jobs:         {}", stats.jobs);
    println!("dedup_hits:   {}", stats.dedup_hits);
    for (modality, count) in &stats.by_modality {
        println!("  {:<14} {count}", modality.as_str());
    }
    Ok(())
}
