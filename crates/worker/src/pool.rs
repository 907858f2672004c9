//! Worker pool: claim loops and queue maintenance.
//!
//! The pool runs `concurrency` claim loops, each processing one job at a
//! time, plus a stalled-job sweep and a completed-job pruner. All of them
//! stop when the pool's [`CancellationToken`] is cancelled; a job already
//! being processed is allowed to finish first.

use std::sync::Arc;

use quarry_db::models::job::StalledAction;
use quarry_db::queue::{JobQueue, QueueError};
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::processor::GenerationWorker;
use crate::runner::{JobOutcome, JobRunner};

/// A fixed-size pool of generation workers fed by a [`JobQueue`].
pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    runner: JobRunner,
    config: WorkerConfig,
    name: String,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        worker: Arc<GenerationWorker>,
        config: WorkerConfig,
    ) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self {
            runner: JobRunner::new(Arc::clone(&queue), worker, &config),
            queue,
            config,
            name: format!("worker-{}", &suffix[..8]),
        }
    }

    /// Worker id of the `n`-th claim loop.
    pub fn worker_id(&self, n: usize) -> String {
        format!("{}-{n}", self.name)
    }

    /// Run every loop until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!(
            pool = %self.name,
            concurrency = self.config.concurrency,
            lock_duration_ms = self.config.lock_duration.as_millis() as u64,
            "Worker pool started",
        );

        let mut tasks = JoinSet::new();
        for n in 0..self.config.concurrency {
            let pool = Arc::clone(&self);
            let cancel = cancel.clone();
            tasks.spawn(async move { pool.claim_loop(pool.worker_id(n), cancel).await });
        }
        {
            let pool = Arc::clone(&self);
            let cancel = cancel.clone();
            tasks.spawn(async move { pool.stalled_loop(cancel).await });
        }
        {
            let pool = Arc::clone(&self);
            let cancel = cancel.clone();
            tasks.spawn(async move { pool.prune_loop(cancel).await });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(pool = %self.name, error = %e, "Worker task panicked");
            }
        }
        tracing::info!(pool = %self.name, "Worker pool stopped");
    }

    /// Spawn the pool onto the runtime.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    async fn claim_loop(&self, worker_id: String, cancel: CancellationToken) {
        tracing::debug!(worker_id = %worker_id, "Claim loop started");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match self.run_once(&worker_id).await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => tracing::error!(worker_id = %worker_id, error = %e, "Claim failed"),
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
        tracing::debug!(worker_id = %worker_id, "Claim loop stopped");
    }

    /// Claim and process at most one job. `Ok(None)` means nothing was
    /// available.
    pub async fn run_once(&self, worker_id: &str) -> Result<Option<JobOutcome>, QueueError> {
        let Some(job) = self.queue.claim(worker_id, self.config.lock_duration).await? else {
            return Ok(None);
        };
        tracing::info!(
            worker_id = %worker_id,
            key = %job.key,
            attempt = job.attempts_made,
            "Job claimed",
        );
        Ok(Some(self.runner.run(worker_id, job).await))
    }

    async fn stalled_loop(&self, cancel: CancellationToken) {
        let period = self.config.stalled_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.sweep_stalled().await,
            }
        }
    }

    /// Requeue or fail active jobs whose lock expired.
    pub async fn sweep_stalled(&self) {
        match self.queue.recover_stalled(self.config.max_stalled_count).await {
            Ok(stalled) => {
                for job in stalled {
                    match job.action {
                        StalledAction::Requeued => {
                            tracing::warn!(key = %job.key, "Stalled job returned to waiting")
                        }
                        StalledAction::Failed => {
                            tracing::error!(key = %job.key, "Stalled job failed")
                        }
                    }
                }
            }
            Err(e) => tracing::error!(error = %e, "Stalled-job sweep failed"),
        }
    }

    async fn prune_loop(&self, cancel: CancellationToken) {
        let period = self.config.prune_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self
                        .queue
                        .prune_completed(self.config.completed_max_age, self.config.completed_max_count)
                        .await
                    {
                        Ok(0) => {}
                        Ok(pruned) => tracing::debug!(pruned, "Pruned completed jobs"),
                        Err(e) => tracing::error!(error = %e, "Completed-job pruning failed"),
                    }
                }
            }
        }
    }
}
