//! Queue job models for research generation.

use std::time::Duration;

use quarry_core::jobs::{JobState, ResearchJob, RetryPolicy};
use quarry_core::types::Timestamp;
use serde::Serialize;
use sqlx::FromRow;

/// A row from the `queue_jobs` table.
///
/// `state` holds one of `waiting`, `active`, `completed`, `failed`; delayed
/// jobs are stored as `waiting` with a future `available_at`.
#[derive(Debug, Clone, FromRow)]
pub struct JobRow {
    pub key: String,
    pub state: String,
    pub payload: serde_json::Value,
    pub attempts_made: i32,
    pub max_attempts: i32,
    pub backoff_ms: i64,
    pub available_at: Timestamp,
    pub locked_by: Option<String>,
    pub locked_until: Option<Timestamp>,
    pub stalled_count: i32,
    pub failed_reason: Option<String>,
    pub return_value: Option<serde_json::Value>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub finished_at: Option<Timestamp>,
}

impl JobRow {
    /// Reported state at `now`: a waiting job not yet available is delayed.
    pub fn reported_state(&self, now: Timestamp) -> Option<JobState> {
        match JobState::parse(&self.state)? {
            JobState::Waiting if self.available_at > now => Some(JobState::Delayed),
            state => Some(state),
        }
    }
}

/// Public view of a queued job, as returned by `JobQueue::get`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
    pub key: String,
    pub state: JobState,
    pub payload: ResearchJob,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub stalled_count: u32,
    pub failed_reason: Option<String>,
    pub return_value: Option<serde_json::Value>,
    pub available_at: Timestamp,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub finished_at: Option<Timestamp>,
}

/// Input for `JobQueue::enqueue`.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub payload: ResearchJob,
    pub retry: RetryPolicy,
}

impl NewJob {
    pub fn new(payload: ResearchJob) -> Self {
        Self {
            payload,
            retry: RetryPolicy::default(),
        }
    }

    pub fn key(&self) -> String {
        self.payload.key()
    }
}

/// Handle returned by a successful enqueue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobHandle {
    pub key: String,
    pub state: JobState,
}

/// A job claimed by a worker. The worker holds its lock until
/// `locked_until` unless it extends it.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub key: String,
    pub payload: ResearchJob,
    /// Attempts made including this one.
    pub attempts_made: u32,
    pub locked_until: Timestamp,
}

/// Result of failing an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// The job is delayed and will be claimable again after `delay`.
    Retrying { delay: Duration },
    /// No attempts remain; the job is retained in the failed state.
    Exhausted,
}

/// What a stalled-job sweep did with one expired job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StalledAction {
    Requeued,
    Failed,
}

/// A job whose lock expired while active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StalledJob {
    pub key: String,
    pub action: StalledAction,
}
