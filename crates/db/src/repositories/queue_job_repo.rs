//! Repository for the `queue_jobs` table.
//!
//! Claims use `SELECT ... FOR UPDATE SKIP LOCKED` so several worker
//! processes can poll the same table without double-dispatch.

use sqlx::{PgConnection, PgExecutor, PgPool};

use crate::models::job::JobRow;

/// Column list for `queue_jobs` queries.
const COLUMNS: &str = "\
    key, state, payload, attempts_made, max_attempts, backoff_ms, \
    available_at, locked_by, locked_until, stalled_count, \
    failed_reason, return_value, created_at, updated_at, finished_at";

/// Stored state names.
pub const STATE_WAITING: &str = "waiting";
pub const STATE_ACTIVE: &str = "active";
pub const STATE_COMPLETED: &str = "completed";
pub const STATE_FAILED: &str = "failed";

/// Provides the keyed queue operations on `queue_jobs`.
pub struct QueueJobRepo;

impl QueueJobRepo {
    /// Insert a waiting job, or replace a non-active job with the same key.
    ///
    /// Waiting, delayed and finished jobs are overwritten with the new
    /// payload and a reset attempt counter. Returns `None` when the existing
    /// job is active.
    pub async fn upsert(
        pool: &PgPool,
        key: &str,
        payload: &serde_json::Value,
        max_attempts: i32,
        backoff_ms: i64,
    ) -> Result<Option<JobRow>, sqlx::Error> {
        let query = format!(
            "INSERT INTO queue_jobs (key, state, payload, max_attempts, backoff_ms) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (key) DO UPDATE SET \
                state = EXCLUDED.state, \
                payload = EXCLUDED.payload, \
                attempts_made = 0, \
                max_attempts = EXCLUDED.max_attempts, \
                backoff_ms = EXCLUDED.backoff_ms, \
                available_at = NOW(), \
                locked_by = NULL, \
                locked_until = NULL, \
                stalled_count = 0, \
                failed_reason = NULL, \
                return_value = NULL, \
                finished_at = NULL, \
                created_at = CASE WHEN queue_jobs.state IN ($6, $7) \
                    THEN NOW() ELSE queue_jobs.created_at END, \
                updated_at = NOW() \
             WHERE queue_jobs.state <> $8 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, JobRow>(&query)
            .bind(key)
            .bind(STATE_WAITING)
            .bind(payload)
            .bind(max_attempts)
            .bind(backoff_ms)
            .bind(STATE_COMPLETED)
            .bind(STATE_FAILED)
            .bind(STATE_ACTIVE)
            .fetch_optional(pool)
            .await
    }

    /// Atomically claim the oldest available waiting job.
    ///
    /// Marks it active, stamps the lock and counts the attempt.
    pub async fn claim_next(
        pool: &PgPool,
        worker_id: &str,
        lock_ms: i64,
    ) -> Result<Option<JobRow>, sqlx::Error> {
        let query = format!(
            "UPDATE queue_jobs \
             SET state = $1, locked_by = $2, \
                 locked_until = NOW() + ($3::FLOAT8 * INTERVAL '1 millisecond'), \
                 attempts_made = attempts_made + 1, updated_at = NOW() \
             WHERE key = ( \
                 SELECT key FROM queue_jobs \
                 WHERE state = $4 AND available_at <= NOW() \
                 ORDER BY available_at ASC, created_at ASC \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, JobRow>(&query)
            .bind(STATE_ACTIVE)
            .bind(worker_id)
            .bind(lock_ms)
            .bind(STATE_WAITING)
            .fetch_optional(pool)
            .await
    }

    /// Claim the job under `key` if it is waiting and available.
    pub async fn claim_by_key(
        pool: &PgPool,
        key: &str,
        worker_id: &str,
        lock_ms: i64,
    ) -> Result<Option<JobRow>, sqlx::Error> {
        let query = format!(
            "UPDATE queue_jobs \
             SET state = $1, locked_by = $2, \
                 locked_until = NOW() + ($3::FLOAT8 * INTERVAL '1 millisecond'), \
                 attempts_made = attempts_made + 1, updated_at = NOW() \
             WHERE key = $4 AND state = $5 AND available_at <= NOW() \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, JobRow>(&query)
            .bind(STATE_ACTIVE)
            .bind(worker_id)
            .bind(lock_ms)
            .bind(key)
            .bind(STATE_WAITING)
            .fetch_optional(pool)
            .await
    }

    /// Put an active job held by `worker_id` back to waiting, available
    /// now, and uncount the interrupted attempt.
    pub async fn release(pool: &PgPool, key: &str, worker_id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE queue_jobs \
             SET state = $3, available_at = NOW(), \
                 attempts_made = GREATEST(attempts_made - 1, 0), \
                 locked_by = NULL, locked_until = NULL, updated_at = NOW() \
             WHERE key = $1 AND locked_by = $2 AND state = $4",
        )
        .bind(key)
        .bind(worker_id)
        .bind(STATE_WAITING)
        .bind(STATE_ACTIVE)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Push the lock of an active job forward. Returns `false` if the
    /// worker no longer holds it.
    pub async fn extend_lock(
        pool: &PgPool,
        key: &str,
        worker_id: &str,
        lock_ms: i64,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE queue_jobs \
             SET locked_until = NOW() + ($3::FLOAT8 * INTERVAL '1 millisecond'), updated_at = NOW() \
             WHERE key = $1 AND locked_by = $2 AND state = $4",
        )
        .bind(key)
        .bind(worker_id)
        .bind(lock_ms)
        .bind(STATE_ACTIVE)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Mark an active job held by `worker_id` as completed.
    pub async fn complete(
        pool: &PgPool,
        key: &str,
        worker_id: &str,
        return_value: &serde_json::Value,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE queue_jobs \
             SET state = $3, return_value = $4, finished_at = NOW(), \
                 locked_by = NULL, locked_until = NULL, updated_at = NOW() \
             WHERE key = $1 AND locked_by = $2 AND state = $5",
        )
        .bind(key)
        .bind(worker_id)
        .bind(STATE_COMPLETED)
        .bind(return_value)
        .bind(STATE_ACTIVE)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Lock the active job held by `worker_id` for a failure transition.
    pub async fn find_held_for_update(
        conn: &mut PgConnection,
        key: &str,
        worker_id: &str,
    ) -> Result<Option<JobRow>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM queue_jobs \
             WHERE key = $1 AND locked_by = $2 AND state = $3 \
             FOR UPDATE"
        );
        sqlx::query_as::<_, JobRow>(&query)
            .bind(key)
            .bind(worker_id)
            .bind(STATE_ACTIVE)
            .fetch_optional(conn)
            .await
    }

    /// Return an active job to waiting, claimable after `delay_ms`.
    pub async fn requeue<'e, E: PgExecutor<'e>>(
        executor: E,
        key: &str,
        delay_ms: i64,
        reason: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE queue_jobs \
             SET state = $2, available_at = NOW() + ($3::FLOAT8 * INTERVAL '1 millisecond'), \
                 failed_reason = COALESCE($4, failed_reason), \
                 locked_by = NULL, locked_until = NULL, updated_at = NOW() \
             WHERE key = $1",
        )
        .bind(key)
        .bind(STATE_WAITING)
        .bind(delay_ms)
        .bind(reason)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Move a job to the failed state, where it is retained.
    pub async fn mark_failed<'e, E: PgExecutor<'e>>(
        executor: E,
        key: &str,
        reason: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE queue_jobs \
             SET state = $2, failed_reason = $3, finished_at = NOW(), \
                 locked_by = NULL, locked_until = NULL, updated_at = NOW() \
             WHERE key = $1",
        )
        .bind(key)
        .bind(STATE_FAILED)
        .bind(reason)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Lock every active job whose lock has expired and count the stall.
    ///
    /// The interrupted attempt is not counted against the job's attempts.
    pub async fn mark_stalled(conn: &mut PgConnection) -> Result<Vec<JobRow>, sqlx::Error> {
        let query = format!(
            "UPDATE queue_jobs \
             SET stalled_count = stalled_count + 1, \
                 attempts_made = GREATEST(attempts_made - 1, 0), \
                 updated_at = NOW() \
             WHERE key IN ( \
                 SELECT key FROM queue_jobs \
                 WHERE state = $1 AND locked_until < NOW() \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, JobRow>(&query)
            .bind(STATE_ACTIVE)
            .fetch_all(conn)
            .await
    }

    /// Delete completed jobs older than `max_age_ms` or beyond the newest
    /// `max_count`. Failed jobs are never pruned.
    pub async fn prune_completed(
        pool: &PgPool,
        max_age_ms: i64,
        max_count: i64,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM queue_jobs \
             WHERE state = $1 AND ( \
                 finished_at < NOW() - ($2::FLOAT8 * INTERVAL '1 millisecond') \
                 OR key IN ( \
                     SELECT key FROM queue_jobs WHERE state = $1 \
                     ORDER BY finished_at DESC \
                     OFFSET $3 \
                 ) \
             )",
        )
        .bind(STATE_COMPLETED)
        .bind(max_age_ms)
        .bind(max_count)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn find_by_key(pool: &PgPool, key: &str) -> Result<Option<JobRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM queue_jobs WHERE key = $1");
        sqlx::query_as::<_, JobRow>(&query)
            .bind(key)
            .fetch_optional(pool)
            .await
    }
}
