//! Provenance mirror: events published by ingestion workers are queued on
//! an unbounded channel and appended as JSON lines by a background task.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use atomdb_core::{ProvenanceEvent, ProvenanceSink};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const PROVENANCE_FILE: &str = "provenance.jsonl";

pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ProvenanceEvent>,
}

impl ProvenanceSink for ChannelSink {
    fn publish(&self, event: ProvenanceEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("provenance writer stopped, event dropped");
        }
    }
}

/// Start the writer. It finishes, returning the number of lines written,
/// once every clone of the returned sink has been dropped.
pub fn spawn_writer(path: PathBuf) -> (Arc<ChannelSink>, JoinHandle<Result<u64>>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<ProvenanceEvent>();
    let handle = tokio::spawn(async move {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;
        let mut out = tokio::io::BufWriter::new(file);
        let mut written = 0u64;
        while let Some(event) = rx.recv().await {
            let mut line = serde_json::to_vec(&event).context("failed to encode event")?;
            line.push(b'\n');
            out.write_all(&line).await?;
            written += 1;
        }
        out.flush().await?;
        tracing::debug!(written, path = %path.display(), "provenance flushed");
        Ok(written)
    });
    (Arc::new(ChannelSink { tx }), handle)
}
