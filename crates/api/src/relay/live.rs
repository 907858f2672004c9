//! Relay-driven generation for live connections.
//!
//! A live connection runs its result's queue job itself when nothing else
//! holds it: the job is submitted (or picked up if already waiting),
//! claimed under a connection-local worker id and followed through its
//! retries. At most one such run exists per result.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use quarry_core::jobs::{research_job_key, JobState};
use quarry_core::research::ResearchQuestion;
use quarry_core::types::EntityId;
use quarry_db::models::research::ResearchResult;
use quarry_db::store::{ResultStore, StoreError};
use quarry_worker::{JobOutcome, JobRunner};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::engine::{ResearchDispatcher, SubmissionError};

/// Results currently being generated by a relay connection.
#[derive(Default)]
pub struct LiveRuns {
    running: Mutex<HashSet<EntityId>>,
}

impl LiveRuns {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the run of `result_id`; `None` if one is already in progress.
    pub fn try_start(self: &Arc<Self>, result_id: EntityId) -> Option<LiveRunGuard> {
        if !self.lock().insert(result_id) {
            return None;
        }
        Some(LiveRunGuard {
            runs: Arc::clone(self),
            result_id,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<EntityId>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Releases a live run when dropped.
pub struct LiveRunGuard {
    runs: Arc<LiveRuns>,
    result_id: EntityId,
}

impl Drop for LiveRunGuard {
    fn drop(&mut self) {
        self.runs.lock().remove(&self.result_id);
    }
}

/// Why a live connection did not start a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveSkip {
    Complete,
    /// Another worker holds the job, or it is delayed or queued for another
    /// version.
    Queued,
    AlreadyRunning,
    /// No job payload could be derived for this result version.
    NoPayload,
    /// The queue could not be reached.
    Unavailable,
}

/// Shared handles a live run needs.
pub struct LiveContext<'a> {
    pub store: &'a Arc<dyn ResultStore>,
    pub dispatcher: &'a ResearchDispatcher,
    pub runner: &'a Arc<JobRunner>,
    pub runs: &'a Arc<LiveRuns>,
}

/// A generation owned by one relay connection.
pub struct LiveRun {
    outcome: JoinHandle<JobOutcome>,
    cancel: CancellationToken,
}

impl LiveRun {
    /// Resolves once the run ended for good.
    pub async fn finished(&mut self) -> JobOutcome {
        match (&mut self.outcome).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(error = %e, "Live generation task panicked");
                JobOutcome::Abandoned
            }
        }
    }

    /// Stop the run; a job still in flight goes back to waiting.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

/// Start generating `result` through its queue job unless something else
/// owns it.
pub async fn start_live_run(
    ctx: LiveContext<'_>,
    result: &ResearchResult,
) -> Result<Result<LiveRun, LiveSkip>, StoreError> {
    if result.is_complete {
        return Ok(Err(LiveSkip::Complete));
    }

    let Some(guard) = ctx.runs.try_start(result.id) else {
        return Ok(Err(LiveSkip::AlreadyRunning));
    };

    let record = match ctx.dispatcher.job_status(result.research_id).await {
        Ok(record) => record,
        Err(e) => {
            tracing::warn!(
                research_id = %result.research_id,
                error = %e,
                "Job queue lookup failed, not starting a live run",
            );
            return Ok(Err(LiveSkip::Unavailable));
        }
    };

    let pending = match &record {
        Some(r) if r.state == JobState::Active => return Ok(Err(LiveSkip::Queued)),
        Some(r) if matches!(r.state, JobState::Waiting | JobState::Delayed) => {
            if r.payload.result_id != result.id {
                return Ok(Err(LiveSkip::Queued));
            }
            true
        }
        _ => false,
    };

    if !pending {
        let (question, user_id) = match record {
            Some(r) if r.payload.result_id == result.id => (r.payload.question, r.payload.user_id),
            _ if result.version == 1 => {
                let detail = ctx.store.get_research(result.research_id).await?;
                (
                    ResearchQuestion::new(detail.research.question),
                    detail.research.user_id.unwrap_or_default(),
                )
            }
            _ => return Ok(Err(LiveSkip::NoPayload)),
        };
        match ctx
            .dispatcher
            .submit(result.research_id, question, &user_id, result.id)
            .await
        {
            Ok(_) => {}
            Err(SubmissionError::Conflict { .. }) => return Ok(Err(LiveSkip::Queued)),
            Err(SubmissionError::InvalidPayload(_)) => return Ok(Err(LiveSkip::NoPayload)),
            Err(SubmissionError::Unavailable(reason)) => {
                tracing::warn!(result_id = %result.id, error = %reason, "Live job submission failed");
                return Ok(Err(LiveSkip::Unavailable));
            }
        }
    }

    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let worker_id = format!("live-{}", &suffix[..8]);
    let key = research_job_key(result.research_id);
    let claimed = match ctx
        .runner
        .queue()
        .claim_key(&key, &worker_id, ctx.runner.lock_duration())
        .await
    {
        Ok(Some(job)) => job,
        // Delayed, or a pool worker was faster.
        Ok(None) => return Ok(Err(LiveSkip::Queued)),
        Err(e) => {
            tracing::warn!(key = %key, error = %e, "Live job claim failed");
            return Ok(Err(LiveSkip::Unavailable));
        }
    };

    tracing::info!(
        result_id = %result.id,
        worker_id = %worker_id,
        attempt = claimed.attempts_made,
        "Live generation started",
    );

    let cancel = CancellationToken::new();
    let runner = Arc::clone(ctx.runner);
    let run_cancel = cancel.clone();
    let outcome = tokio::spawn(async move {
        let _guard = guard;
        let outcome = runner.follow(&worker_id, claimed, &run_cancel).await;
        tracing::info!(worker_id = %worker_id, outcome = ?outcome, "Live generation ended");
        outcome
    });

    Ok(Ok(LiveRun { outcome, cancel }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_is_released_on_drop() {
        let runs = Arc::new(LiveRuns::new());
        let id = uuid::Uuid::nil();

        let guard = runs.try_start(id).unwrap();
        assert!(runs.try_start(id).is_none());

        drop(guard);
        assert!(runs.try_start(id).is_some());
    }
}
