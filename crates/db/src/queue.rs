//! The Job Queue contract and its PostgreSQL adapter.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use quarry_core::jobs::{JobState, ResearchJob, RetryPolicy, STALLED_LIMIT_REASON};

use crate::models::job::{
    ClaimedJob, FailOutcome, JobHandle, JobRecord, JobRow, NewJob, StalledAction, StalledJob,
};
use crate::repositories::QueueJobRepo;
use crate::DbPool;

/// Errors raised by a [`JobQueue`].
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue unavailable: {0}")]
    Unavailable(String),

    #[error("Job {key} is already active")]
    Conflict { key: String },

    #[error("Job {key} is not held by worker {worker_id}")]
    LockLost { key: String, worker_id: String },

    #[error("Invalid job payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Invalid job state: {0}")]
    State(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Keyed, retrying job queue.
///
/// At most one job exists per key. Enqueueing over a waiting, delayed or
/// finished job replaces it; enqueueing over an active job is a conflict.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Cheap reachability check.
    async fn ping(&self) -> Result<(), QueueError>;

    async fn enqueue(&self, job: NewJob) -> Result<JobHandle, QueueError>;

    /// Claim the oldest available waiting job for `worker_id`.
    async fn claim(
        &self,
        worker_id: &str,
        lock_duration: Duration,
    ) -> Result<Option<ClaimedJob>, QueueError>;

    /// Claim the job stored under `key`, if it is waiting and available.
    async fn claim_key(
        &self,
        key: &str,
        worker_id: &str,
        lock_duration: Duration,
    ) -> Result<Option<ClaimedJob>, QueueError>;

    /// Renew a held lock. `false` means the worker lost it.
    async fn extend_lock(
        &self,
        key: &str,
        worker_id: &str,
        lock_duration: Duration,
    ) -> Result<bool, QueueError>;

    async fn complete(
        &self,
        key: &str,
        worker_id: &str,
        return_value: serde_json::Value,
    ) -> Result<(), QueueError>;

    /// Record a failed attempt. Delays the job when attempts remain,
    /// otherwise retains it as failed.
    async fn fail(
        &self,
        key: &str,
        worker_id: &str,
        reason: &str,
    ) -> Result<FailOutcome, QueueError>;

    /// Hand a held job back to waiting without counting the attempt.
    /// `false` means the worker no longer held it.
    async fn release(&self, key: &str, worker_id: &str) -> Result<bool, QueueError>;

    /// Return active jobs whose lock expired to waiting, or fail those that
    /// stalled more than `max_stalled_count` times.
    async fn recover_stalled(&self, max_stalled_count: u32) -> Result<Vec<StalledJob>, QueueError>;

    /// Delete completed jobs older than `max_age` or beyond the newest
    /// `max_count`. Returns how many were deleted.
    async fn prune_completed(&self, max_age: Duration, max_count: u64) -> Result<u64, QueueError>;

    async fn get(&self, key: &str) -> Result<Option<JobRecord>, QueueError>;
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

impl JobRow {
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.max_attempts.max(0) as u32,
            initial_backoff: Duration::from_millis(self.backoff_ms.max(0) as u64),
        }
    }

    fn into_record(self) -> Result<JobRecord, QueueError> {
        let state = self
            .reported_state(Utc::now())
            .ok_or_else(|| QueueError::State(self.state.clone()))?;
        let payload: ResearchJob = serde_json::from_value(self.payload)?;
        Ok(JobRecord {
            key: self.key,
            state,
            payload,
            attempts_made: self.attempts_made.max(0) as u32,
            max_attempts: self.max_attempts.max(0) as u32,
            stalled_count: self.stalled_count.max(0) as u32,
            failed_reason: self.failed_reason,
            return_value: self.return_value,
            available_at: self.available_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
            finished_at: self.finished_at,
        })
    }
}

// ---------------------------------------------------------------------------
// PostgreSQL adapter
// ---------------------------------------------------------------------------

/// [`JobQueue`] backed by the `queue_jobs` table.
#[derive(Clone)]
pub struct PgJobQueue {
    pool: DbPool,
}

impl PgJobQueue {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Decode a freshly claimed row. A row whose payload does not decode is
    /// failed on the spot.
    async fn claimed(&self, row: Option<JobRow>) -> Result<Option<ClaimedJob>, QueueError> {
        let Some(row) = row else {
            return Ok(None);
        };

        let payload: ResearchJob = match serde_json::from_value(row.payload.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                QueueJobRepo::mark_failed(&self.pool, &row.key, &format!("Invalid payload: {e}"))
                    .await?;
                return Err(e.into());
            }
        };

        Ok(Some(ClaimedJob {
            key: row.key,
            payload,
            attempts_made: row.attempts_made.max(0) as u32,
            locked_until: row.locked_until.unwrap_or_else(Utc::now),
        }))
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn ping(&self) -> Result<(), QueueError> {
        crate::health_check(&self.pool)
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))
    }

    async fn enqueue(&self, job: NewJob) -> Result<JobHandle, QueueError> {
        let key = job.key();
        let payload = serde_json::to_value(&job.payload)?;
        let row = QueueJobRepo::upsert(
            &self.pool,
            &key,
            &payload,
            job.retry.attempts as i32,
            millis(job.retry.initial_backoff),
        )
        .await?
        .ok_or_else(|| QueueError::Conflict { key: key.clone() })?;

        tracing::debug!(key = %key, "Job enqueued");
        Ok(JobHandle {
            key: row.key,
            state: JobState::Waiting,
        })
    }

    async fn claim(
        &self,
        worker_id: &str,
        lock_duration: Duration,
    ) -> Result<Option<ClaimedJob>, QueueError> {
        let row = QueueJobRepo::claim_next(&self.pool, worker_id, millis(lock_duration)).await?;
        self.claimed(row).await
    }

    async fn claim_key(
        &self,
        key: &str,
        worker_id: &str,
        lock_duration: Duration,
    ) -> Result<Option<ClaimedJob>, QueueError> {
        let row = QueueJobRepo::claim_by_key(&self.pool, key, worker_id, millis(lock_duration)).await?;
        self.claimed(row).await
    }

    async fn extend_lock(
        &self,
        key: &str,
        worker_id: &str,
        lock_duration: Duration,
    ) -> Result<bool, QueueError> {
        Ok(QueueJobRepo::extend_lock(&self.pool, key, worker_id, millis(lock_duration)).await?)
    }

    async fn complete(
        &self,
        key: &str,
        worker_id: &str,
        return_value: serde_json::Value,
    ) -> Result<(), QueueError> {
        if QueueJobRepo::complete(&self.pool, key, worker_id, &return_value).await? {
            Ok(())
        } else {
            Err(QueueError::LockLost {
                key: key.to_string(),
                worker_id: worker_id.to_string(),
            })
        }
    }

    async fn fail(
        &self,
        key: &str,
        worker_id: &str,
        reason: &str,
    ) -> Result<FailOutcome, QueueError> {
        let mut tx = self.pool.begin().await?;
        let row = QueueJobRepo::find_held_for_update(&mut *tx, key, worker_id)
            .await?
            .ok_or_else(|| QueueError::LockLost {
                key: key.to_string(),
                worker_id: worker_id.to_string(),
            })?;

        let outcome = match row
            .retry_policy()
            .retry_delay(row.attempts_made.max(0) as u32)
        {
            Some(delay) => {
                QueueJobRepo::requeue(&mut *tx, key, millis(delay), Some(reason)).await?;
                FailOutcome::Retrying { delay }
            }
            None => {
                QueueJobRepo::mark_failed(&mut *tx, key, reason).await?;
                FailOutcome::Exhausted
            }
        };
        tx.commit().await?;

        Ok(outcome)
    }

    async fn release(&self, key: &str, worker_id: &str) -> Result<bool, QueueError> {
        Ok(QueueJobRepo::release(&self.pool, key, worker_id).await?)
    }

    async fn recover_stalled(&self, max_stalled_count: u32) -> Result<Vec<StalledJob>, QueueError> {
        let mut tx = self.pool.begin().await?;
        let rows = QueueJobRepo::mark_stalled(&mut *tx).await?;

        let mut stalled = Vec::with_capacity(rows.len());
        for row in rows {
            let action = if row.stalled_count.max(0) as u32 > max_stalled_count {
                QueueJobRepo::mark_failed(&mut *tx, &row.key, STALLED_LIMIT_REASON).await?;
                StalledAction::Failed
            } else {
                QueueJobRepo::requeue(&mut *tx, &row.key, 0, None).await?;
                StalledAction::Requeued
            };
            stalled.push(StalledJob {
                key: row.key,
                action,
            });
        }
        tx.commit().await?;

        Ok(stalled)
    }

    async fn prune_completed(&self, max_age: Duration, max_count: u64) -> Result<u64, QueueError> {
        Ok(QueueJobRepo::prune_completed(
            &self.pool,
            millis(max_age),
            i64::try_from(max_count).unwrap_or(i64::MAX),
        )
        .await?)
    }

    async fn get(&self, key: &str) -> Result<Option<JobRecord>, QueueError> {
        QueueJobRepo::find_by_key(&self.pool, key)
            .await?
            .map(JobRow::into_record)
            .transpose()
    }
}
