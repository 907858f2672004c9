//! Research job dispatcher.
//!
//! Turns a generation request into a uniquely keyed queue job
//! (`research:{research_id}`). The queue's replace semantics keep at most
//! one authoritative job per research.

use std::sync::Arc;

use quarry_core::jobs::{research_job_key, ResearchJob, RetryPolicy};
use quarry_core::research::ResearchQuestion;
use quarry_core::types::EntityId;
use quarry_db::models::job::{JobHandle, JobRecord, NewJob};
use quarry_db::queue::{JobQueue, QueueError};

/// Why a job could not be submitted.
#[derive(Debug, thiserror::Error)]
pub enum SubmissionError {
    #[error("Job queue unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid job payload: {0}")]
    InvalidPayload(String),

    /// A job for this research is being generated right now.
    #[error("Research {research_id} is already being generated")]
    Conflict { research_id: EntityId },
}

impl SubmissionError {
    fn from_queue(err: QueueError, research_id: EntityId) -> Self {
        match err {
            QueueError::Conflict { .. } => Self::Conflict { research_id },
            QueueError::Payload(e) => Self::InvalidPayload(e.to_string()),
            other => Self::Unavailable(other.to_string()),
        }
    }
}

/// Submits research generation jobs to the queue.
pub struct ResearchDispatcher {
    queue: Arc<dyn JobQueue>,
    retry: RetryPolicy,
}

impl ResearchDispatcher {
    pub fn new(queue: Arc<dyn JobQueue>, retry: RetryPolicy) -> Self {
        Self { queue, retry }
    }

    /// Fail fast when the queue cannot be reached, before anything is
    /// written for the request.
    pub async fn ensure_reachable(&self) -> Result<(), SubmissionError> {
        self.queue
            .ping()
            .await
            .map_err(|e| SubmissionError::Unavailable(e.to_string()))
    }

    /// Submit (or replace) the generation job of a research.
    pub async fn submit(
        &self,
        research_id: EntityId,
        question: ResearchQuestion,
        user_id: &str,
        result_id: EntityId,
    ) -> Result<JobHandle, SubmissionError> {
        if question.question.trim().is_empty() {
            return Err(SubmissionError::InvalidPayload(
                "question must not be empty".into(),
            ));
        }

        let job = NewJob {
            payload: ResearchJob {
                research_id,
                question,
                user_id: user_id.to_string(),
                result_id,
            },
            retry: self.retry,
        };

        let handle = self
            .queue
            .enqueue(job)
            .await
            .map_err(|e| SubmissionError::from_queue(e, research_id))?;

        tracing::info!(
            key = %handle.key,
            research_id = %research_id,
            result_id = %result_id,
            "Research job submitted",
        );
        Ok(handle)
    }

    /// The queue record of a research's job, if one is retained.
    pub async fn job_status(&self, research_id: EntityId) -> Result<Option<JobRecord>, QueueError> {
        self.queue.get(&research_job_key(research_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use quarry_core::jobs::JobState;
    use quarry_db::memory::MemoryJobQueue;
    use quarry_core::types::new_id;

    fn dispatcher(queue: Arc<MemoryJobQueue>) -> ResearchDispatcher {
        ResearchDispatcher::new(queue, RetryPolicy::default())
    }

    #[tokio::test]
    async fn submit_uses_research_key() {
        let queue = Arc::new(MemoryJobQueue::new());
        let research_id = new_id();
        let handle = dispatcher(queue.clone())
            .submit(research_id, ResearchQuestion::new("Q1"), "u1", new_id())
            .await
            .unwrap();

        assert_eq!(handle.key, format!("research:{research_id}"));
        assert_eq!(handle.state, JobState::Waiting);
        let record = queue.get(&handle.key).await.unwrap().unwrap();
        assert_eq!(record.max_attempts, 3);
        assert_eq!(record.payload.user_id, "u1");
    }

    #[tokio::test]
    async fn resubmission_replaces_waiting_job() {
        let queue = Arc::new(MemoryJobQueue::new());
        let dispatcher = dispatcher(queue.clone());
        let research_id = new_id();
        let second_result = new_id();

        dispatcher
            .submit(research_id, ResearchQuestion::new("Q1"), "u1", new_id())
            .await
            .unwrap();
        dispatcher
            .submit(research_id, ResearchQuestion::new("Q2"), "u1", second_result)
            .await
            .unwrap();

        let record = dispatcher.job_status(research_id).await.unwrap().unwrap();
        assert_eq!(record.payload.result_id, second_result);
        assert_eq!(record.payload.question.question, "Q2");
    }

    #[tokio::test]
    async fn active_job_is_a_conflict() {
        let queue = Arc::new(MemoryJobQueue::new());
        let dispatcher = dispatcher(queue.clone());
        let research_id = new_id();
        dispatcher
            .submit(research_id, ResearchQuestion::new("Q1"), "u1", new_id())
            .await
            .unwrap();
        queue
            .claim("w-1", std::time::Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        let err = dispatcher
            .submit(research_id, ResearchQuestion::new("Q1"), "u1", new_id())
            .await
            .unwrap_err();
        assert_matches!(err, SubmissionError::Conflict { research_id: id } if id == research_id);
    }

    #[tokio::test]
    async fn unreachable_queue_fails_synchronously() {
        let queue = Arc::new(MemoryJobQueue::new());
        queue.set_reachable(false);
        let dispatcher = dispatcher(queue);

        assert_matches!(
            dispatcher.ensure_reachable().await,
            Err(SubmissionError::Unavailable(_))
        );
        assert_matches!(
            dispatcher
                .submit(new_id(), ResearchQuestion::new("Q1"), "u1", new_id())
                .await,
            Err(SubmissionError::Unavailable(_))
        );
    }

    #[tokio::test]
    async fn blank_question_is_rejected() {
        let dispatcher = dispatcher(Arc::new(MemoryJobQueue::new()));
        assert_matches!(
            dispatcher
                .submit(new_id(), ResearchQuestion::new("  "), "u1", new_id())
                .await,
            Err(SubmissionError::InvalidPayload(_))
        );
    }
}
