//! Ingestion job rows and their guarded state transitions.

use rusqlite::{OptionalExtension, params};
use uuid::Uuid;

use atomdb_core::{AtomId, AtomizerParams, IngestionJob, JobStatus, SourceModality};

use crate::error::{Result, StoreError};
use crate::store::{Store, now};

const JOB_COLUMNS: &str = "job_id, modality, source_reference, cursor, status, quota_remaining, \
     failure_reason, root_atom_id, chunks_committed, params, worker_id, created_at, updated_at";

impl Store {
    pub fn create_job(
        &self,
        modality: SourceModality,
        source_reference: &str,
        quota: u64,
        params: &AtomizerParams,
    ) -> Result<IngestionJob> {
        let job_id = Uuid::new_v4();
        let params_json = serde_json::to_string(params)
            .map_err(|e| StoreError::InvalidData(format!("atomizer params: {e}")))?;
        let ts = now();
        self.conn().execute(
            "INSERT INTO ingestion_jobs
                 (job_id, modality, source_reference, status, quota_remaining, params,
                  created_at, updated_at)
             VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6, ?6)",
            params![
                job_id.to_string(),
                modality.as_str(),
                source_reference,
                quota.min(i64::MAX as u64) as i64,
                params_json,
                ts
            ],
        )?;
        tracing::info!(%job_id, %modality, source = source_reference, quota, "job created");
        self.require_job(job_id)
    }

    pub fn get_job(&self, job_id: Uuid) -> Result<Option<IngestionJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM ingestion_jobs WHERE job_id = ?1");
        self.conn()
            .query_row(&sql, [job_id.to_string()], job_row)
            .optional()?
            .map(JobRow::into_job)
            .transpose()
    }

    pub fn require_job(&self, job_id: Uuid) -> Result<IngestionJob> {
        self.get_job(job_id)?.ok_or(StoreError::JobNotFound(job_id))
    }

    pub fn list_jobs(&self) -> Result<Vec<IngestionJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM ingestion_jobs ORDER BY created_at, rowid");
        let mut stmt = self.conn().prepare(&sql)?;
        let rows: Vec<JobRow> = stmt
            .query_map([], job_row)?
            .collect::<std::result::Result<_, _>>()?;
        rows.into_iter().map(JobRow::into_job).collect()
    }

    /// `pending → running` for `worker_id`. Exactly one concurrent caller wins.
    pub fn claim_job(&self, job_id: Uuid, worker_id: &str) -> Result<IngestionJob> {
        let n = self.conn().execute(
            "UPDATE ingestion_jobs SET status = 'running', worker_id = ?2, updated_at = ?3
             WHERE job_id = ?1 AND status = 'pending'",
            params![job_id.to_string(), worker_id, now()],
        )?;
        let job = self.require_job(job_id)?;
        if n == 0 {
            return Err(StoreError::JobNotClaimable {
                job_id,
                status: job.status,
            });
        }
        tracing::info!(%job_id, worker = worker_id, cursor = job.cursor, "job claimed");
        Ok(job)
    }

    /// Re-acquire a job for `worker_id`: failed jobs are re-queued, pending
    /// jobs claimed, and a running job taken over only once its lease expired.
    pub fn resume_job(&self, job_id: Uuid, worker_id: &str, lease_secs: u64) -> Result<IngestionJob> {
        let job = self.require_job(job_id)?;
        match job.status {
            JobStatus::Completed | JobStatus::Cancelled => Err(StoreError::JobNotResumable {
                job_id,
                status: job.status,
            }),
            JobStatus::Failed => {
                self.conn().execute(
                    "UPDATE ingestion_jobs
                     SET status = 'pending', failure_reason = NULL, worker_id = NULL, updated_at = ?2
                     WHERE job_id = ?1 AND status = 'failed'",
                    params![job_id.to_string(), now()],
                )?;
                tracing::info!(%job_id, cursor = job.cursor, "failed job re-queued");
                self.claim_job(job_id, worker_id)
            }
            JobStatus::Pending => self.claim_job(job_id, worker_id),
            JobStatus::Running => {
                let ts = now();
                let n = self.conn().execute(
                    "UPDATE ingestion_jobs SET worker_id = ?2, updated_at = ?3
                     WHERE job_id = ?1 AND status = 'running' AND updated_at <= ?4",
                    params![
                        job_id.to_string(),
                        worker_id,
                        ts,
                        ts.saturating_sub(lease_secs.min(i64::MAX as u64) as i64)
                    ],
                )?;
                if n == 0 {
                    return Err(StoreError::JobNotClaimable {
                        job_id,
                        status: JobStatus::Running,
                    });
                }
                tracing::warn!(
                    %job_id,
                    previous = job.worker_id.as_deref().unwrap_or("-"),
                    worker = worker_id,
                    "took over job with expired lease"
                );
                self.require_job(job_id)
            }
        }
    }

    /// Move any non-terminal job to cancelled. Returns `false` if the job had
    /// already finished.
    pub fn cancel_job(&self, job_id: Uuid) -> Result<bool> {
        let n = self.conn().execute(
            "UPDATE ingestion_jobs SET status = 'cancelled', updated_at = ?2
             WHERE job_id = ?1 AND status IN ('pending', 'running', 'failed')",
            params![job_id.to_string(), now()],
        )?;
        if n == 0 {
            self.require_job(job_id)?;
            return Ok(false);
        }
        tracing::info!(%job_id, "job cancelled");
        Ok(true)
    }

    /// Record a failure for the job `worker_id` holds; the cursor is kept.
    pub(crate) fn fail_job(&self, job_id: Uuid, worker_id: &str, reason: &str) -> Result<bool> {
        let n = self.conn().execute(
            "UPDATE ingestion_jobs SET status = 'failed', failure_reason = ?3, updated_at = ?4
             WHERE job_id = ?1 AND status = 'running' AND worker_id = ?2",
            params![job_id.to_string(), worker_id, reason, now()],
        )?;
        if n > 0 {
            tracing::warn!(%job_id, reason, "job failed");
        }
        Ok(n > 0)
    }
}

struct JobRow {
    job_id: String,
    modality: String,
    source_reference: String,
    cursor: i64,
    status: String,
    quota_remaining: i64,
    failure_reason: Option<String>,
    root_atom_id: Option<i64>,
    chunks_committed: i64,
    params: String,
    worker_id: Option<String>,
    created_at: i64,
    updated_at: i64,
}

fn job_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRow> {
    Ok(JobRow {
        job_id: row.get(0)?,
        modality: row.get(1)?,
        source_reference: row.get(2)?,
        cursor: row.get(3)?,
        status: row.get(4)?,
        quota_remaining: row.get(5)?,
        failure_reason: row.get(6)?,
        root_atom_id: row.get(7)?,
        chunks_committed: row.get(8)?,
        params: row.get(9)?,
        worker_id: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

impl JobRow {
    fn into_job(self) -> Result<IngestionJob> {
        let job_id = Uuid::parse_str(&self.job_id)
            .map_err(|e| StoreError::InvalidData(format!("bad job id {}: {e}", self.job_id)))?;
        let modality = self
            .modality
            .parse::<SourceModality>()
            .map_err(|e| StoreError::InvalidData(e.to_string()))?;
        let status = self.status.parse::<JobStatus>().map_err(StoreError::InvalidData)?;
        let params: AtomizerParams = serde_json::from_str(&self.params)
            .map_err(|e| StoreError::InvalidData(format!("job {job_id} params: {e}")))?;
        Ok(IngestionJob {
            job_id,
            modality,
            source_reference: self.source_reference,
            cursor: self.cursor.max(0) as u64,
            status,
            quota_remaining: self.quota_remaining,
            failure_reason: self.failure_reason,
            root_atom_id: self.root_atom_id.map(AtomId),
            chunks_committed: self.chunks_committed.max(0) as u64,
            params,
            worker_id: self.worker_id,
            created_at: self.created_at.max(0) as u64,
            updated_at: self.updated_at.max(0) as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(s: &Store) -> IngestionJob {
        s.create_job(SourceModality::Text, "doc.txt", 10, &AtomizerParams::default())
            .unwrap()
    }

    #[test]
    fn test_create_and_get() {
        let s = Store::open_in_memory().unwrap();
        let j = job(&s);
        assert_eq!(j.status, JobStatus::Pending);
        assert_eq!(j.cursor, 0);
        assert_eq!(j.quota_remaining, 10);
        assert_eq!(j.root_atom_id, None);
        assert_eq!(s.get_job(j.job_id).unwrap().unwrap(), j);
        assert!(s.get_job(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn test_params_persisted() {
        let s = Store::open_in_memory().unwrap();
        let params = AtomizerParams {
            columns: Some(8),
            embed: true,
            ..AtomizerParams::default()
        };
        let j = s.create_job(SourceModality::Weights, "w.bin", 1, &params).unwrap();
        assert_eq!(s.require_job(j.job_id).unwrap().params, params);
    }

    #[test]
    fn test_claim_once() {
        let s = Store::open_in_memory().unwrap();
        let j = job(&s);
        let claimed = s.claim_job(j.job_id, "w1").unwrap();
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(claimed.worker_id.as_deref(), Some("w1"));
        assert!(matches!(
            s.claim_job(j.job_id, "w2"),
            Err(StoreError::JobNotClaimable { status: JobStatus::Running, .. })
        ));
    }

    #[test]
    fn test_resume_failed_requeues_and_claims() {
        let s = Store::open_in_memory().unwrap();
        let j = job(&s);
        s.claim_job(j.job_id, "w1").unwrap();
        assert!(s.fail_job(j.job_id, "w1", "boom").unwrap());
        let failed = s.require_job(j.job_id).unwrap();
        assert_eq!(failed.failure_reason.as_deref(), Some("boom"));

        let resumed = s.resume_job(j.job_id, "w2", 300).unwrap();
        assert_eq!(resumed.status, JobStatus::Running);
        assert_eq!(resumed.worker_id.as_deref(), Some("w2"));
        assert_eq!(resumed.failure_reason, None);
    }

    #[test]
    fn test_resume_terminal_rejected() {
        let s = Store::open_in_memory().unwrap();
        let j = job(&s);
        assert!(s.cancel_job(j.job_id).unwrap());
        assert!(matches!(
            s.resume_job(j.job_id, "w", 0),
            Err(StoreError::JobNotResumable { status: JobStatus::Cancelled, .. })
        ));
        assert!(!s.cancel_job(j.job_id).unwrap());
    }

    #[test]
    fn test_resume_running_respects_lease() {
        let s = Store::open_in_memory().unwrap();
        let j = job(&s);
        s.claim_job(j.job_id, "dead-worker").unwrap();
        assert!(matches!(
            s.resume_job(j.job_id, "w2", 300),
            Err(StoreError::JobNotClaimable { .. })
        ));
        let taken = s.resume_job(j.job_id, "w2", 0).unwrap();
        assert_eq!(taken.worker_id.as_deref(), Some("w2"));
        // the stale worker can no longer fail it
        assert!(!s.fail_job(j.job_id, "dead-worker", "late").unwrap());
    }

    #[test]
    fn test_cancel_unknown_job() {
        let s = Store::open_in_memory().unwrap();
        assert!(matches!(
            s.cancel_job(Uuid::new_v4()),
            Err(StoreError::JobNotFound(_))
        ));
    }

    #[test]
    fn test_list_jobs_in_creation_order() {
        let s = Store::open_in_memory().unwrap();
        let a = job(&s);
        let b = job(&s);
        let ids: Vec<Uuid> = s.list_jobs().unwrap().iter().map(|j| j.job_id).collect();
        assert_eq!(ids, vec![a.job_id, b.job_id]);
    }
}
