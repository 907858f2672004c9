//! In-process adapters for [`ResultStore`] and [`JobQueue`].
//!
//! Used by tests and single-process deployments. They follow the same merge
//! and queue semantics as the PostgreSQL adapters. Reads clone under the
//! lock, so callers never observe a half-applied update. Queue timing uses
//! `tokio::time::Instant`, which lets tests drive backoff and lock expiry
//! with a paused clock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use quarry_core::jobs::{JobState, ResearchJob, RetryPolicy, STALLED_LIMIT_REASON};
use quarry_core::progress::{ProgressUpdate, SequencedUpdate};
use quarry_core::research::{select_current, title_from_question};
use quarry_core::types::{new_id, EntityId, Timestamp};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use crate::models::job::{
    ClaimedJob, FailOutcome, JobHandle, JobRecord, NewJob, StalledAction, StalledJob,
};
use crate::models::research::{
    NewResearch, Research, ResearchDetail, ResearchResult, ResearchSummary, ResultPatch,
};
use crate::queue::{JobQueue, QueueError};
use crate::repositories::research_repo::MAX_LIMIT;
use crate::store::{ResultStore, StoreError};

// ---------------------------------------------------------------------------
// Result store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StoreState {
    research: HashMap<EntityId, Research>,
    results: HashMap<EntityId, ResearchResult>,
    events: HashMap<EntityId, Vec<SequencedUpdate>>,
}

impl StoreState {
    fn results_of(&self, research_id: EntityId) -> Vec<ResearchResult> {
        let mut results: Vec<ResearchResult> = self
            .results
            .values()
            .filter(|r| r.research_id == research_id)
            .cloned()
            .collect();
        results.sort_by_key(|r| r.version);
        results
    }

    fn insert_next_version(&mut self, research_id: EntityId, now: Timestamp) -> ResearchResult {
        let current_max = self
            .results
            .values()
            .filter(|r| r.research_id == research_id)
            .map(|r| r.version)
            .max();
        let version = quarry_core::research::next_version(current_max);
        let result = ResearchResult::initial(new_id(), research_id, version, now);
        self.results.insert(result.id, result.clone());
        result
    }
}

/// [`ResultStore`] held in process memory.
#[derive(Default)]
pub struct MemoryResultStore {
    state: RwLock<StoreState>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn get(&self, result_id: EntityId) -> Result<ResearchResult, StoreError> {
        self.state
            .read()
            .await
            .results
            .get(&result_id)
            .cloned()
            .ok_or(StoreError::ResultNotFound(result_id))
    }

    async fn record(
        &self,
        result_id: EntityId,
        patch: ResultPatch,
        updates: &[ProgressUpdate],
    ) -> Result<ResearchResult, StoreError> {
        let now = Utc::now();
        let mut state = self.state.write().await;
        let result = state
            .results
            .get_mut(&result_id)
            .ok_or(StoreError::ResultNotFound(result_id))?;

        result.apply(&patch, now);
        let first_seq = result.last_event_seq + 1;
        result.last_event_seq += updates.len() as i64;
        let snapshot = result.clone();

        let log = state.events.entry(result_id).or_default();
        log.extend(updates.iter().enumerate().map(|(offset, update)| SequencedUpdate {
            seq: first_seq + offset as i64,
            update: update.clone(),
            created_at: now,
        }));

        Ok(snapshot)
    }

    async fn events_since(
        &self,
        result_id: EntityId,
        after_seq: i64,
        limit: i64,
    ) -> Result<Vec<SequencedUpdate>, StoreError> {
        let state = self.state.read().await;
        if !state.results.contains_key(&result_id) {
            return Err(StoreError::ResultNotFound(result_id));
        }
        Ok(state
            .events
            .get(&result_id)
            .map(|log| {
                log.iter()
                    .filter(|e| e.seq > after_seq)
                    .take(limit.max(0) as usize)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_research(&self, research_id: EntityId) -> Result<ResearchDetail, StoreError> {
        let state = self.state.read().await;
        let research = state
            .research
            .get(&research_id)
            .cloned()
            .ok_or(StoreError::ResearchNotFound(research_id))?;
        Ok(ResearchDetail::new(research, state.results_of(research_id)))
    }

    async fn create_research(
        &self,
        input: NewResearch,
    ) -> Result<(Research, ResearchResult), StoreError> {
        let now = Utc::now();
        let question = input.question.trim().to_string();
        let research = Research {
            id: new_id(),
            title: title_from_question(&question),
            question,
            user_id: input.user_id,
            created_at: now,
            updated_at: now,
        };

        let mut state = self.state.write().await;
        state.research.insert(research.id, research.clone());
        let result = state.insert_next_version(research.id, now);
        Ok((research, result))
    }

    async fn create_version(&self, research_id: EntityId) -> Result<ResearchResult, StoreError> {
        let mut state = self.state.write().await;
        if !state.research.contains_key(&research_id) {
            return Err(StoreError::ResearchNotFound(research_id));
        }
        Ok(state.insert_next_version(research_id, Utc::now()))
    }

    async fn delete_result(&self, result_id: EntityId) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state
            .results
            .remove(&result_id)
            .ok_or(StoreError::ResultNotFound(result_id))?;
        state.events.remove(&result_id);
        Ok(())
    }

    async fn list_research(
        &self,
        user_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<ResearchSummary>, StoreError> {
        let state = self.state.read().await;
        let mut research: Vec<&Research> = state
            .research
            .values()
            .filter(|r| user_id.is_none() || r.user_id.as_deref() == user_id)
            .collect();
        research.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        Ok(research
            .into_iter()
            .take(limit.clamp(1, MAX_LIMIT) as usize)
            .map(|r| {
                let results = state.results_of(r.id);
                ResearchSummary {
                    research: r.clone(),
                    current_result: select_current(&results).cloned(),
                }
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Job queue
// ---------------------------------------------------------------------------

struct MemoryJob {
    payload: ResearchJob,
    /// Never `Delayed`; delay is expressed through `available_at`.
    state: JobState,
    retry: RetryPolicy,
    attempts_made: u32,
    stalled_count: u32,
    available_at: Instant,
    locked_by: Option<String>,
    locked_until: Option<Instant>,
    failed_reason: Option<String>,
    return_value: Option<serde_json::Value>,
    created_at: Timestamp,
    updated_at: Timestamp,
    finished_at: Option<Timestamp>,
    finished_instant: Option<Instant>,
    /// Insertion order, for FIFO claims among equally available jobs.
    order: u64,
}

impl MemoryJob {
    fn is_held_by(&self, worker_id: &str) -> bool {
        self.state == JobState::Active && self.locked_by.as_deref() == Some(worker_id)
    }

    fn activate(
        &mut self,
        key: &str,
        worker_id: &str,
        lock_duration: Duration,
        now: Instant,
    ) -> ClaimedJob {
        self.state = JobState::Active;
        self.attempts_made += 1;
        self.locked_by = Some(worker_id.to_string());
        self.locked_until = Some(now + lock_duration);
        self.updated_at = Utc::now();

        ClaimedJob {
            key: key.to_string(),
            payload: self.payload.clone(),
            attempts_made: self.attempts_made,
            locked_until: Utc::now()
                + chrono::Duration::from_std(lock_duration)
                    .unwrap_or_else(|_| chrono::Duration::zero()),
        }
    }

    fn release(&mut self) {
        self.locked_by = None;
        self.locked_until = None;
        self.updated_at = Utc::now();
    }

    fn finish(&mut self, state: JobState, now: Instant) {
        self.state = state;
        self.finished_at = Some(Utc::now());
        self.finished_instant = Some(now);
        self.release();
    }

    fn record(&self, key: &str, now: Instant) -> JobRecord {
        let wait = self.available_at.saturating_duration_since(now);
        let state = match self.state {
            JobState::Waiting if !wait.is_zero() => JobState::Delayed,
            state => state,
        };
        JobRecord {
            key: key.to_string(),
            state,
            payload: self.payload.clone(),
            attempts_made: self.attempts_made,
            max_attempts: self.retry.attempts,
            stalled_count: self.stalled_count,
            failed_reason: self.failed_reason.clone(),
            return_value: self.return_value.clone(),
            available_at: Utc::now()
                + chrono::Duration::from_std(wait).unwrap_or_else(|_| chrono::Duration::zero()),
            created_at: self.created_at,
            updated_at: self.updated_at,
            finished_at: self.finished_at,
        }
    }
}

/// [`JobQueue`] held in process memory.
pub struct MemoryJobQueue {
    jobs: Mutex<HashMap<String, MemoryJob>>,
    reachable: AtomicBool,
    next_order: AtomicU64,
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            reachable: AtomicBool::new(true),
            next_order: AtomicU64::new(0),
        }
    }
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the queue backend going away (or coming back).
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    fn check_reachable(&self) -> Result<(), QueueError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(QueueError::Unavailable("queue backend unreachable".into()))
        }
    }

    fn lock_lost(key: &str, worker_id: &str) -> QueueError {
        QueueError::LockLost {
            key: key.to_string(),
            worker_id: worker_id.to_string(),
        }
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn ping(&self) -> Result<(), QueueError> {
        self.check_reachable()
    }

    async fn enqueue(&self, job: NewJob) -> Result<JobHandle, QueueError> {
        self.check_reachable()?;
        let key = job.key();
        let mut jobs = self.jobs.lock().await;

        let created_at = match jobs.get(&key) {
            Some(existing) if existing.state == JobState::Active => {
                return Err(QueueError::Conflict { key });
            }
            Some(existing) if !existing.state.is_finished() => existing.created_at,
            _ => Utc::now(),
        };

        jobs.insert(
            key.clone(),
            MemoryJob {
                payload: job.payload,
                state: JobState::Waiting,
                retry: job.retry,
                attempts_made: 0,
                stalled_count: 0,
                available_at: Instant::now(),
                locked_by: None,
                locked_until: None,
                failed_reason: None,
                return_value: None,
                created_at,
                updated_at: Utc::now(),
                finished_at: None,
                finished_instant: None,
                order: self.next_order.fetch_add(1, Ordering::SeqCst),
            },
        );

        tracing::debug!(key = %key, "Job enqueued");
        Ok(JobHandle {
            key,
            state: JobState::Waiting,
        })
    }

    async fn claim(
        &self,
        worker_id: &str,
        lock_duration: Duration,
    ) -> Result<Option<ClaimedJob>, QueueError> {
        self.check_reachable()?;
        let now = Instant::now();
        let mut jobs = self.jobs.lock().await;

        let Some(key) = jobs
            .iter()
            .filter(|(_, j)| j.state == JobState::Waiting && j.available_at <= now)
            .min_by_key(|(_, j)| (j.available_at, j.order))
            .map(|(k, _)| k.clone())
        else {
            return Ok(None);
        };

        Ok(jobs
            .get_mut(&key)
            .map(|job| job.activate(&key, worker_id, lock_duration, now)))
    }

    async fn claim_key(
        &self,
        key: &str,
        worker_id: &str,
        lock_duration: Duration,
    ) -> Result<Option<ClaimedJob>, QueueError> {
        self.check_reachable()?;
        let now = Instant::now();
        let mut jobs = self.jobs.lock().await;
        Ok(jobs
            .get_mut(key)
            .filter(|j| j.state == JobState::Waiting && j.available_at <= now)
            .map(|job| job.activate(key, worker_id, lock_duration, now)))
    }

    async fn extend_lock(
        &self,
        key: &str,
        worker_id: &str,
        lock_duration: Duration,
    ) -> Result<bool, QueueError> {
        self.check_reachable()?;
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(key) {
            Some(job) if job.is_held_by(worker_id) => {
                job.locked_until = Some(Instant::now() + lock_duration);
                job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete(
        &self,
        key: &str,
        worker_id: &str,
        return_value: serde_json::Value,
    ) -> Result<(), QueueError> {
        self.check_reachable()?;
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(key)
            .filter(|j| j.is_held_by(worker_id))
            .ok_or_else(|| Self::lock_lost(key, worker_id))?;
        job.return_value = Some(return_value);
        job.finish(JobState::Completed, Instant::now());
        Ok(())
    }

    async fn fail(
        &self,
        key: &str,
        worker_id: &str,
        reason: &str,
    ) -> Result<FailOutcome, QueueError> {
        self.check_reachable()?;
        let now = Instant::now();
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(key)
            .filter(|j| j.is_held_by(worker_id))
            .ok_or_else(|| Self::lock_lost(key, worker_id))?;

        job.failed_reason = Some(reason.to_string());
        match job.retry.retry_delay(job.attempts_made) {
            Some(delay) => {
                job.state = JobState::Waiting;
                job.available_at = now + delay;
                job.release();
                Ok(FailOutcome::Retrying { delay })
            }
            None => {
                job.finish(JobState::Failed, now);
                Ok(FailOutcome::Exhausted)
            }
        }
    }

    async fn release(&self, key: &str, worker_id: &str) -> Result<bool, QueueError> {
        self.check_reachable()?;
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(key) {
            Some(job) if job.is_held_by(worker_id) => {
                job.state = JobState::Waiting;
                job.available_at = Instant::now();
                job.attempts_made = job.attempts_made.saturating_sub(1);
                job.release();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn recover_stalled(&self, max_stalled_count: u32) -> Result<Vec<StalledJob>, QueueError> {
        self.check_reachable()?;
        let now = Instant::now();
        let mut jobs = self.jobs.lock().await;

        let mut stalled = Vec::new();
        for (key, job) in jobs.iter_mut() {
            let expired = job.state == JobState::Active
                && job.locked_until.is_some_and(|until| until < now);
            if !expired {
                continue;
            }

            job.stalled_count += 1;
            job.attempts_made = job.attempts_made.saturating_sub(1);
            let action = if job.stalled_count > max_stalled_count {
                job.failed_reason = Some(STALLED_LIMIT_REASON.to_string());
                job.finish(JobState::Failed, now);
                StalledAction::Failed
            } else {
                job.state = JobState::Waiting;
                job.available_at = now;
                job.release();
                StalledAction::Requeued
            };
            stalled.push(StalledJob {
                key: key.clone(),
                action,
            });
        }

        Ok(stalled)
    }

    async fn prune_completed(&self, max_age: Duration, max_count: u64) -> Result<u64, QueueError> {
        self.check_reachable()?;
        let now = Instant::now();
        let mut jobs = self.jobs.lock().await;

        let mut completed: Vec<(String, Instant)> = jobs
            .iter()
            .filter(|(_, j)| j.state == JobState::Completed)
            .filter_map(|(k, j)| j.finished_instant.map(|at| (k.clone(), at)))
            .collect();
        completed.sort_by(|a, b| b.1.cmp(&a.1));

        let mut removed = 0;
        for (index, (key, finished)) in completed.into_iter().enumerate() {
            let too_old = now.saturating_duration_since(finished) > max_age;
            let over_count = index as u64 >= max_count;
            if too_old || over_count {
                jobs.remove(&key);
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn get(&self, key: &str) -> Result<Option<JobRecord>, QueueError> {
        self.check_reachable()?;
        let jobs = self.jobs.lock().await;
        Ok(jobs.get(key).map(|job| job.record(key, Instant::now())))
    }
}
