use std::time::Duration;

use quarry_core::jobs::{
    RetryPolicy, DEFAULT_BACKOFF, DEFAULT_COMPLETED_MAX_AGE, DEFAULT_COMPLETED_MAX_COUNT,
    DEFAULT_CONCURRENCY, DEFAULT_JOB_ATTEMPTS, DEFAULT_LOCK_DURATION, DEFAULT_MAX_STALLED_COUNT,
    DEFAULT_STALLED_INTERVAL,
};

/// Worker pool configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Parallel claim loops (default: `3`).
    pub concurrency: usize,
    /// How long a claimed job stays locked without renewal (default: `30s`).
    pub lock_duration: Duration,
    /// Period of the stalled-job sweep (default: `30s`).
    pub stalled_interval: Duration,
    /// Stalls tolerated before a job is failed (default: `1`).
    pub max_stalled_count: u32,
    /// Idle wait between claim attempts when the queue is empty (default: `500ms`).
    pub poll_interval: Duration,
    /// Period of the completed-job pruner (default: `60s`).
    pub prune_interval: Duration,
    /// Completed jobs older than this are pruned (default: `3600s`).
    pub completed_max_age: Duration,
    /// At most this many completed jobs are retained (default: `1000`).
    pub completed_max_count: u64,
    /// Ceiling on one generation attempt (default: `1800s`).
    pub max_generation: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            lock_duration: DEFAULT_LOCK_DURATION,
            stalled_interval: DEFAULT_STALLED_INTERVAL,
            max_stalled_count: DEFAULT_MAX_STALLED_COUNT,
            poll_interval: Duration::from_millis(500),
            prune_interval: Duration::from_secs(60),
            completed_max_age: DEFAULT_COMPLETED_MAX_AGE,
            completed_max_count: DEFAULT_COMPLETED_MAX_COUNT,
            max_generation: Duration::from_secs(1800),
        }
    }
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                    | Default |
    /// |----------------------------|---------|
    /// | `WORKER_CONCURRENCY`       | `3`     |
    /// | `JOB_LOCK_DURATION_MS`     | `30000` |
    /// | `JOB_STALLED_INTERVAL_MS`  | `30000` |
    /// | `JOB_MAX_STALLED_COUNT`    | `1`     |
    /// | `WORKER_POLL_INTERVAL_MS`  | `500`   |
    /// | `JOB_COMPLETED_MAX_AGE_SECS` | `3600` |
    /// | `JOB_COMPLETED_MAX_COUNT`  | `1000`  |
    /// | `MAX_GENERATION_SECS`      | `1800`  |
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let concurrency: usize = std::env::var("WORKER_CONCURRENCY")
            .unwrap_or_else(|_| defaults.concurrency.to_string())
            .parse()
            .expect("WORKER_CONCURRENCY must be a valid usize");

        let lock_duration_ms: u64 = std::env::var("JOB_LOCK_DURATION_MS")
            .unwrap_or_else(|_| "30000".into())
            .parse()
            .expect("JOB_LOCK_DURATION_MS must be a valid u64");

        let stalled_interval_ms: u64 = std::env::var("JOB_STALLED_INTERVAL_MS")
            .unwrap_or_else(|_| "30000".into())
            .parse()
            .expect("JOB_STALLED_INTERVAL_MS must be a valid u64");

        let max_stalled_count: u32 = std::env::var("JOB_MAX_STALLED_COUNT")
            .unwrap_or_else(|_| defaults.max_stalled_count.to_string())
            .parse()
            .expect("JOB_MAX_STALLED_COUNT must be a valid u32");

        let poll_interval_ms: u64 = std::env::var("WORKER_POLL_INTERVAL_MS")
            .unwrap_or_else(|_| "500".into())
            .parse()
            .expect("WORKER_POLL_INTERVAL_MS must be a valid u64");

        let completed_max_age_secs: u64 = std::env::var("JOB_COMPLETED_MAX_AGE_SECS")
            .unwrap_or_else(|_| "3600".into())
            .parse()
            .expect("JOB_COMPLETED_MAX_AGE_SECS must be a valid u64");

        let completed_max_count: u64 = std::env::var("JOB_COMPLETED_MAX_COUNT")
            .unwrap_or_else(|_| defaults.completed_max_count.to_string())
            .parse()
            .expect("JOB_COMPLETED_MAX_COUNT must be a valid u64");

        let max_generation_secs: u64 = std::env::var("MAX_GENERATION_SECS")
            .unwrap_or_else(|_| "1800".into())
            .parse()
            .expect("MAX_GENERATION_SECS must be a valid u64");

        Self {
            concurrency: concurrency.max(1),
            lock_duration: Duration::from_millis(lock_duration_ms.max(1000)),
            stalled_interval: Duration::from_millis(stalled_interval_ms.max(1000)),
            max_stalled_count,
            poll_interval: Duration::from_millis(poll_interval_ms.max(10)),
            prune_interval: defaults.prune_interval,
            completed_max_age: Duration::from_secs(completed_max_age_secs),
            completed_max_count,
            max_generation: Duration::from_secs(max_generation_secs.max(1)),
        }
    }

    /// How often a held lock is renewed.
    pub fn lock_renew_interval(&self) -> Duration {
        self.lock_duration / 2
    }
}

/// Retry settings applied to newly submitted jobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueConfig {
    pub retry: RetryPolicy,
}

impl QueueConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var          | Default |
    /// |------------------|---------|
    /// | `JOB_ATTEMPTS`   | `3`     |
    /// | `JOB_BACKOFF_MS` | `1000`  |
    pub fn from_env() -> Self {
        let attempts: u32 = std::env::var("JOB_ATTEMPTS")
            .unwrap_or_else(|_| DEFAULT_JOB_ATTEMPTS.to_string())
            .parse()
            .expect("JOB_ATTEMPTS must be a valid u32");

        let backoff_ms: u64 = std::env::var("JOB_BACKOFF_MS")
            .unwrap_or_else(|_| (DEFAULT_BACKOFF.as_millis() as u64).to_string())
            .parse()
            .expect("JOB_BACKOFF_MS must be a valid u64");

        Self {
            retry: RetryPolicy {
                attempts: attempts.max(1),
                initial_backoff: Duration::from_millis(backoff_ms),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_queue_policy() {
        let config = WorkerConfig::default();
        assert_eq!(config.concurrency, 3);
        assert_eq!(config.lock_duration, Duration::from_secs(30));
        assert_eq!(config.lock_renew_interval(), Duration::from_secs(15));
        assert_eq!(config.max_stalled_count, 1);

        let queue = QueueConfig::default();
        assert_eq!(queue.retry.attempts, 3);
        assert_eq!(queue.retry.initial_backoff, Duration::from_millis(1000));
    }
}
