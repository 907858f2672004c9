//! Research generation jobs: keys, payload, states and retry policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::research::ResearchQuestion;
use crate::types::EntityId;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Prefix of every research job key.
pub const JOB_KEY_PREFIX: &str = "research:";

/// Attempts a job gets before it is left in the failed state.
pub const DEFAULT_JOB_ATTEMPTS: u32 = 3;

/// Backoff before the first retry; doubles on every further attempt.
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(1000);

/// Number of jobs processed in parallel by one worker pool.
pub const DEFAULT_CONCURRENCY: usize = 3;

/// How long a claimed job stays locked without a heartbeat.
pub const DEFAULT_LOCK_DURATION: Duration = Duration::from_secs(30);

/// How often the pool sweeps for jobs whose lock expired.
pub const DEFAULT_STALLED_INTERVAL: Duration = Duration::from_secs(30);

/// Number of lock expiries tolerated before a job is failed outright.
pub const DEFAULT_MAX_STALLED_COUNT: u32 = 1;

/// Completed jobs older than this are pruned.
pub const DEFAULT_COMPLETED_MAX_AGE: Duration = Duration::from_secs(3600);

/// At most this many completed jobs are retained.
pub const DEFAULT_COMPLETED_MAX_COUNT: u64 = 1000;

/// Failure reason recorded when a job exceeds the stall limit.
pub const STALLED_LIMIT_REASON: &str = "job stalled more than allowable limit";

// ---------------------------------------------------------------------------
// Keys and payload
// ---------------------------------------------------------------------------

/// Deterministic queue key for a research's generation job.
///
/// At most one authoritative job exists per key.
pub fn research_job_key(research_id: EntityId) -> String {
    format!("{JOB_KEY_PREFIX}{research_id}")
}

/// Payload carried by a research generation job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResearchJob {
    pub research_id: EntityId,
    pub question: ResearchQuestion,
    /// Opaque id supplied by the external auth layer.
    pub user_id: String,
    pub result_id: EntityId,
}

impl ResearchJob {
    pub fn key(&self) -> String {
        research_job_key(self.research_id)
    }
}

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

/// Lifecycle state of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    /// Waiting, but not claimable before its backoff elapses.
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Delayed => "delayed",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "waiting" => Some(Self::Waiting),
            "delayed" => Some(Self::Delayed),
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Completed and failed jobs are finished; a new submission replaces them.
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Bounded exponential retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_JOB_ATTEMPTS,
            initial_backoff: DEFAULT_BACKOFF,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after `attempts_made` failed attempts, or
    /// `None` once the attempts are exhausted.
    pub fn retry_delay(&self, attempts_made: u32) -> Option<Duration> {
        if attempts_made == 0 || attempts_made >= self.attempts {
            return None;
        }
        Some(backoff_delay(self.initial_backoff, attempts_made))
    }
}

/// Exponential backoff: `initial * 2^(attempt - 1)`.
pub fn backoff_delay(initial: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(20);
    initial.saturating_mul(1u32 << exponent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_prefixed_research_id() {
        let id = uuid::Uuid::nil();
        assert_eq!(
            research_job_key(id),
            "research:00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn payload_uses_camel_case() {
        let job = ResearchJob {
            research_id: uuid::Uuid::nil(),
            question: ResearchQuestion::new("Q1"),
            user_id: "u1".into(),
            result_id: uuid::Uuid::nil(),
        };
        let json = serde_json::to_value(&job).unwrap();
        assert!(json.get("researchId").is_some());
        assert!(json.get("resultId").is_some());
        assert_eq!(json["userId"], "u1");
        assert_eq!(json["question"]["question"], "Q1");
    }

    #[test]
    fn backoff_doubles_from_initial() {
        let initial = Duration::from_millis(1000);
        assert_eq!(backoff_delay(initial, 1), Duration::from_millis(1000));
        assert_eq!(backoff_delay(initial, 2), Duration::from_millis(2000));
        assert_eq!(backoff_delay(initial, 3), Duration::from_millis(4000));
    }

    #[test]
    fn retry_delay_is_bounded_by_attempts() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.retry_delay(1), Some(Duration::from_millis(1000)));
        assert_eq!(policy.retry_delay(2), Some(Duration::from_millis(2000)));
        assert_eq!(policy.retry_delay(3), None);
        assert_eq!(policy.retry_delay(0), None);
    }

    #[test]
    fn state_names_round_trip() {
        for state in [
            JobState::Waiting,
            JobState::Delayed,
            JobState::Active,
            JobState::Completed,
            JobState::Failed,
        ] {
            assert_eq!(JobState::parse(state.as_str()), Some(state));
        }
        assert_eq!(JobState::parse("paused"), None);
    }

    #[test]
    fn finished_states() {
        assert!(JobState::Completed.is_finished());
        assert!(JobState::Failed.is_finished());
        assert!(!JobState::Active.is_finished());
        assert!(!JobState::Delayed.is_finished());
    }
}
