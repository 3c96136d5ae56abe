//! Job operations: enqueue, atomic claim, completion, retry bookkeeping,
//! stuck-job recovery, and the operator queries built on top of them.

use std::time::Duration;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use tracing::{debug, error, info, warn};

use super::{JobStore, duration_ms};
use crate::error::{Error, Result};
use crate::model::*;
use crate::telemetry::metrics;

const JOB_COLUMNS: &str =
    "id, source_id, tenant, kind, payload, status, retry_count, last_error, created_at, updated_at";

fn count_transition(from: JobStatus, to: JobStatus) {
    metrics::job_state_transitions().add(
        1,
        &[
            KeyValue::new("from", from.as_str()),
            KeyValue::new("to", to.as_str()),
        ],
    );
}

impl JobStore {
    /// Insert a new `pending` job. Content is never rejected and `source_id`
    /// is not required to be unique; callers that want de-duplication check
    /// [`JobStore::count_for_source`] first.
    pub async fn enqueue(&self, new: NewJob) -> Result<JobId> {
        let now = self.now_ms();
        let kind = new.kind();
        let payload = serde_json::to_string(&new.payload)?;

        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO jobs (source_id, tenant, kind, payload, status, retry_count, created_at, updated_at)
             VALUES (?, ?, ?, ?, 'pending', 0, ?, ?)
             RETURNING id",
        )
        .bind(&new.source_id)
        .bind(&new.tenant)
        .bind(kind.as_str())
        .bind(&payload)
        .bind(now)
        .bind(now)
        .fetch_one(self.pool())
        .await?;

        metrics::jobs_enqueued().add(1, &[KeyValue::new("kind", kind.as_str())]);
        info!(job_id = id, source_id = %new.source_id, %kind, "job enqueued");

        Ok(JobId(id))
    }

    /// Insert several jobs in one transaction: either all become visible or
    /// none do. Used by the producer so a message is never half-recorded.
    pub async fn enqueue_batch(&self, batch: Vec<NewJob>) -> Result<Vec<JobId>> {
        let now = self.now_ms();
        let mut tx = self.pool().begin().await?;
        let mut ids = Vec::with_capacity(batch.len());

        for new in &batch {
            let (id,): (i64,) = sqlx::query_as(
                "INSERT INTO jobs (source_id, tenant, kind, payload, status, retry_count, created_at, updated_at)
                 VALUES (?, ?, ?, ?, 'pending', 0, ?, ?)
                 RETURNING id",
            )
            .bind(&new.source_id)
            .bind(&new.tenant)
            .bind(new.kind().as_str())
            .bind(serde_json::to_string(&new.payload)?)
            .bind(now)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;
            ids.push(JobId(id));
        }

        tx.commit().await?;

        for (new, id) in batch.iter().zip(&ids) {
            metrics::jobs_enqueued().add(1, &[KeyValue::new("kind", new.kind().as_str())]);
            info!(job_id = %id, source_id = %new.source_id, kind = %new.kind(), "job enqueued");
        }
        Ok(ids)
    }

    /// Claim the oldest eligible pending job.
    ///
    /// A pending job is eligible when it has never failed, or when its last
    /// update is older than the re-claim delay. Selection and the move to
    /// `processing` happen in one write statement, which SQLite runs under
    /// its exclusive write lock: no two callers can receive the same row.
    pub async fn claim_next(&self) -> Result<Option<Job>> {
        let now = self.now_ms();
        let eligible_before = now.saturating_sub(duration_ms(self.config.reclaim_delay));

        let row: Option<JobRow> = sqlx::query_as(&format!(
            "UPDATE jobs SET status = 'processing', updated_at = ?
             WHERE id = (
                 SELECT id FROM jobs
                 WHERE status = 'pending'
                   AND (retry_count = 0 OR updated_at < ?)
                 ORDER BY created_at ASC, id ASC
                 LIMIT 1
             )
             AND status = 'pending'
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(now)
        .bind(eligible_before)
        .fetch_optional(self.pool())
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let job = row.try_into_job()?;
        count_transition(JobStatus::Pending, JobStatus::Processing);
        debug!(job_id = %job.id, retry_count = job.retry_count, "job claimed");
        Ok(Some(job))
    }

    /// Mark a job `completed` and return the status it left.
    ///
    /// Calling this on an already-completed job is a no-op that returns
    /// `Completed`. A job that the stuck sweep returned to `pending` can still
    /// be completed by the worker that finished it. A `failed` job cannot.
    pub async fn complete(&self, id: JobId) -> Result<JobStatus> {
        let now = self.now_ms();
        for from in [JobStatus::Processing, JobStatus::Pending] {
            let rows_affected = sqlx::query(
                "UPDATE jobs SET status = 'completed', updated_at = ?
                 WHERE id = ? AND status = ?",
            )
            .bind(now)
            .bind(id.0)
            .bind(from.as_str())
            .execute(self.pool())
            .await?
            .rows_affected();

            if rows_affected == 1 {
                count_transition(from, JobStatus::Completed);
                info!(job_id = %id, from = from.as_str(), "job completed");
                return Ok(from);
            }
        }

        match self.get(id).await?.status {
            JobStatus::Completed => {
                debug!(job_id = %id, "job already completed");
                Ok(JobStatus::Completed)
            }
            from => Err(Error::InvalidTransition {
                from,
                to: JobStatus::Completed,
            }),
        }
    }

    /// Record a failed attempt.
    ///
    /// Increments `retry_count` and, in the same statement, either returns
    /// the job to `pending` or, once the count exceeds `max_retries`, marks
    /// it `failed` for good. Only a `processing` job can fail.
    pub async fn fail(&self, id: JobId, error_message: &str) -> Result<FailOutcome> {
        let now = self.now_ms();
        let max_retries = i64::from(self.config.max_retries);

        let row: Option<(String, i64)> = sqlx::query_as(
            "UPDATE jobs
             SET retry_count = retry_count + 1,
                 status = CASE WHEN retry_count + 1 > ? THEN 'failed' ELSE 'pending' END,
                 last_error = ?,
                 updated_at = ?
             WHERE id = ? AND status = 'processing'
             RETURNING status, retry_count",
        )
        .bind(max_retries)
        .bind(error_message)
        .bind(now)
        .bind(id.0)
        .fetch_optional(self.pool())
        .await?;

        let Some((status, retry_count)) = row else {
            let from = self.get(id).await?.status;
            return Err(Error::InvalidTransition {
                from,
                to: JobStatus::Pending,
            });
        };

        let status: JobStatus = status.parse()?;
        let attempts = u32::try_from(retry_count).unwrap_or(u32::MAX);
        count_transition(JobStatus::Processing, status);

        if status == JobStatus::Failed {
            error!(
                job_id = %id,
                attempts,
                error = error_message,
                "job permanently failed"
            );
            Ok(FailOutcome::Exhausted { attempts })
        } else {
            warn!(
                job_id = %id,
                attempt = attempts,
                max_retries = self.config.max_retries,
                error = error_message,
                "job failed, will retry"
            );
            Ok(FailOutcome::Retrying { attempt: attempts })
        }
    }

    /// Return jobs stuck in `processing` for longer than `timeout` to
    /// `pending`. Retry counts are left alone. Returns how many were reset.
    pub async fn reset_stuck(&self, timeout: Duration) -> Result<u64> {
        let now = self.now_ms();
        let stale_before = now.saturating_sub(duration_ms(timeout));

        let reset = sqlx::query(
            "UPDATE jobs
             SET status = 'pending', last_error = 'reset from stuck state', updated_at = ?
             WHERE status = 'processing' AND updated_at < ?",
        )
        .bind(now)
        .bind(stale_before)
        .execute(self.pool())
        .await?
        .rows_affected();

        if reset > 0 {
            metrics::stuck_jobs_reset().add(reset, &[]);
            warn!(count = reset, "reset stuck jobs to pending");
        }
        Ok(reset)
    }

    /// [`JobStore::reset_stuck`] with the configured default timeout.
    pub async fn reset_stuck_default(&self) -> Result<u64> {
        self.reset_stuck(self.config.stuck_timeout).await
    }

    /// Get a job by ID.
    pub async fn get(&self, id: JobId) -> Result<Job> {
        let row: Option<JobRow> =
            sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"))
                .bind(id.0)
                .fetch_optional(self.pool())
                .await?;

        row.ok_or_else(|| Error::NotFound(format!("job {id}")))?
            .try_into_job()
    }

    /// Most recent jobs first, optionally filtered by status.
    pub async fn list(&self, status: Option<JobStatus>, limit: i64) -> Result<Vec<Job>> {
        let status = status.map(JobStatus::as_str);
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE (? IS NULL OR status = ?)
             ORDER BY id DESC
             LIMIT ?"
        ))
        .bind(status)
        .bind(status)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(JobRow::try_into_job).collect()
    }

    /// Number of jobs in each state.
    pub async fn counts(&self) -> Result<JobCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM jobs GROUP BY status")
                .fetch_all(self.pool())
                .await?;

        let mut counts = JobCounts::default();
        for (status, n) in rows {
            let n = u64::try_from(n).unwrap_or(0);
            match status.parse::<JobStatus>()? {
                JobStatus::Pending => counts.pending = n,
                JobStatus::Processing => counts.processing = n,
                JobStatus::Completed => counts.completed = n,
                JobStatus::Failed => counts.failed = n,
            }
        }
        Ok(counts)
    }

    /// How many jobs (in any state) were enqueued for `source_id`.
    pub async fn count_for_source(&self, source_id: &str) -> Result<u64> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM jobs WHERE source_id = ?")
            .bind(source_id)
            .fetch_one(self.pool())
            .await?;
        Ok(u64::try_from(n).unwrap_or(0))
    }

    /// Re-enqueue a permanently failed job as a fresh pending job with the
    /// same source, tenant, and payload. The failed row is kept for audit.
    pub async fn requeue(&self, id: JobId) -> Result<JobId> {
        let mut tx = self.pool().begin().await?;

        let row: Option<JobRow> =
            sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"))
                .bind(id.0)
                .fetch_optional(&mut *tx)
                .await?;
        let job = row
            .ok_or_else(|| Error::NotFound(format!("job {id}")))?
            .try_into_job()?;

        if job.status != JobStatus::Failed {
            return Err(Error::InvalidTransition {
                from: job.status,
                to: JobStatus::Pending,
            });
        }

        let now = self.now_ms();
        let (new_id,): (i64,) = sqlx::query_as(
            "INSERT INTO jobs (source_id, tenant, kind, payload, status, retry_count, created_at, updated_at)
             VALUES (?, ?, ?, ?, 'pending', 0, ?, ?)
             RETURNING id",
        )
        .bind(&job.source_id)
        .bind(&job.tenant)
        .bind(job.kind().as_str())
        .bind(serde_json::to_string(&job.payload)?)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        metrics::jobs_enqueued().add(1, &[KeyValue::new("kind", job.kind().as_str())]);
        info!(job_id = %id, new_job_id = new_id, "failed job requeued");
        Ok(JobId(new_id))
    }

    /// Delete `completed` and `failed` jobs last updated more than
    /// `older_than` ago. Returns how many rows were removed.
    pub async fn purge_finished(&self, older_than: Duration) -> Result<u64> {
        let cutoff = self.now_ms().saturating_sub(duration_ms(older_than));
        let purged = sqlx::query(
            "DELETE FROM jobs WHERE status IN ('completed', 'failed') AND updated_at < ?",
        )
        .bind(cutoff)
        .execute(self.pool())
        .await?
        .rows_affected();

        if purged > 0 {
            info!(count = purged, "purged finished jobs");
        }
        Ok(purged)
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct JobRow {
    id: i64,
    source_id: String,
    tenant: Option<String>,
    kind: String,
    payload: String,
    status: String,
    retry_count: i64,
    last_error: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl JobRow {
    fn try_into_job(self) -> Result<Job> {
        let kind: JobKind = self.kind.parse()?;
        let payload: JobPayload = serde_json::from_str(&self.payload)?;
        if payload.kind() != kind {
            return Err(Error::Other(format!(
                "job {}: kind column '{kind}' disagrees with payload type '{}'",
                self.id,
                payload.kind()
            )));
        }

        Ok(Job {
            id: JobId(self.id),
            source_id: self.source_id,
            tenant: self.tenant,
            payload,
            status: self.status.parse()?,
            retry_count: u32::try_from(self.retry_count).unwrap_or(0),
            last_error: self.last_error,
            created_at: from_millis(self.created_at)?,
            updated_at: from_millis(self.updated_at)?,
        })
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| Error::Other(format!("timestamp out of range: {ms}")))
}
