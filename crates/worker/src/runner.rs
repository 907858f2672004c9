//! Runs claimed jobs and reports every outcome back to the queue.
//!
//! Shared by the pool's claim loops and by relay connections that drive a
//! generation themselves. While a job runs its lock is renewed every
//! `lock_duration / 2`; a cancelled run hands the job back to waiting.

use std::sync::Arc;
use std::time::Duration;

use quarry_db::models::job::{ClaimedJob, FailOutcome};
use quarry_db::queue::JobQueue;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::processor::GenerationWorker;

/// How one claimed job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// The attempt failed; the job is delayed for `delay`.
    Retrying { delay: Duration },
    Failed,
    /// The lock was lost mid-run; the queue decides what happens next.
    Abandoned,
    /// The run was cancelled and the job returned to waiting.
    Released,
}

pub struct JobRunner {
    queue: Arc<dyn JobQueue>,
    worker: Arc<GenerationWorker>,
    lock_duration: Duration,
    renew_every: Duration,
}

impl JobRunner {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        worker: Arc<GenerationWorker>,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            queue,
            worker,
            lock_duration: config.lock_duration,
            renew_every: config.lock_renew_interval(),
        }
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    pub fn lock_duration(&self) -> Duration {
        self.lock_duration
    }

    /// Process a claimed job while renewing its lock, then report the
    /// outcome to the queue. A job in flight always runs to the end.
    pub async fn run(&self, worker_id: &str, job: ClaimedJob) -> JobOutcome {
        self.run_claimed(worker_id, job, None).await
    }

    /// Run `job`, then keep claiming it back through its retries until it
    /// completes, exhausts its attempts, is taken by another worker or
    /// `cancel` fires.
    pub async fn follow(
        &self,
        worker_id: &str,
        mut job: ClaimedJob,
        cancel: &CancellationToken,
    ) -> JobOutcome {
        loop {
            let key = job.key.clone();
            let outcome = self.run_claimed(worker_id, job, Some(cancel)).await;
            let JobOutcome::Retrying { delay } = outcome else {
                return outcome;
            };

            tokio::select! {
                _ = cancel.cancelled() => return outcome,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.queue.claim_key(&key, worker_id, self.lock_duration).await {
                Ok(Some(next)) => {
                    tracing::info!(
                        worker_id = %worker_id,
                        key = %key,
                        attempt = next.attempts_made,
                        "Job reclaimed for retry",
                    );
                    job = next;
                }
                Ok(None) => {
                    tracing::debug!(worker_id = %worker_id, key = %key, "Retry taken by another worker");
                    return outcome;
                }
                Err(e) => {
                    tracing::warn!(worker_id = %worker_id, key = %key, error = %e, "Failed to reclaim job");
                    return outcome;
                }
            }
        }
    }

    async fn run_claimed(
        &self,
        worker_id: &str,
        job: ClaimedJob,
        cancel: Option<&CancellationToken>,
    ) -> JobOutcome {
        let mut renewal = interval_at(Instant::now() + self.renew_every, self.renew_every);
        renewal.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let processing = self.worker.process(&job.payload);
        tokio::pin!(processing);

        let result = loop {
            tokio::select! {
                biased;
                result = &mut processing => break Some(result),
                _ = cancelled(cancel) => {
                    return self.release(worker_id, &job.key).await;
                }
                _ = renewal.tick() => {
                    match self
                        .queue
                        .extend_lock(&job.key, worker_id, self.lock_duration)
                        .await
                    {
                        Ok(true) => {}
                        Ok(false) => {
                            tracing::warn!(
                                worker_id = %worker_id,
                                key = %job.key,
                                "Job lock lost, abandoning run",
                            );
                            break None;
                        }
                        Err(e) => tracing::warn!(
                            worker_id = %worker_id,
                            key = %job.key,
                            error = %e,
                            "Failed to renew job lock",
                        ),
                    }
                }
            }
        };

        match result {
            None => JobOutcome::Abandoned,
            Some(Ok(summary)) => {
                match self
                    .queue
                    .complete(&job.key, worker_id, summary.return_value())
                    .await
                {
                    Ok(()) => tracing::info!(worker_id = %worker_id, key = %job.key, "Job completed"),
                    Err(e) => tracing::error!(
                        worker_id = %worker_id,
                        key = %job.key,
                        error = %e,
                        "Failed to mark job completed",
                    ),
                }
                JobOutcome::Completed
            }
            Some(Err(error)) => match self.queue.fail(&job.key, worker_id, &error.to_string()).await {
                Ok(FailOutcome::Retrying { delay }) => {
                    tracing::warn!(
                        worker_id = %worker_id,
                        key = %job.key,
                        attempt = job.attempts_made,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %error,
                        "Job attempt failed, retrying",
                    );
                    JobOutcome::Retrying { delay }
                }
                Ok(FailOutcome::Exhausted) => {
                    tracing::error!(
                        worker_id = %worker_id,
                        key = %job.key,
                        attempt = job.attempts_made,
                        error = %error,
                        "Job failed, attempts exhausted",
                    );
                    JobOutcome::Failed
                }
                Err(e) => {
                    tracing::error!(
                        worker_id = %worker_id,
                        key = %job.key,
                        error = %e,
                        "Failed to record job failure",
                    );
                    JobOutcome::Abandoned
                }
            },
        }
    }

    async fn release(&self, worker_id: &str, key: &str) -> JobOutcome {
        match self.queue.release(key, worker_id).await {
            Ok(true) => {
                tracing::info!(worker_id = %worker_id, key = %key, "Run cancelled, job released");
                JobOutcome::Released
            }
            Ok(false) => JobOutcome::Abandoned,
            Err(e) => {
                tracing::warn!(worker_id = %worker_id, key = %key, error = %e, "Failed to release job");
                JobOutcome::Abandoned
            }
        }
    }
}

async fn cancelled(cancel: Option<&CancellationToken>) {
    match cancel {
        Some(cancel) => cancel.cancelled().await,
        None => std::future::pending().await,
    }
}
