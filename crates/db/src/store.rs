//! The Result Store contract and its PostgreSQL adapter.

use std::collections::HashMap;

use async_trait::async_trait;
use quarry_core::error::CoreError;
use quarry_core::progress::{ProgressUpdate, SequencedUpdate};
use quarry_core::research::{select_current, title_from_question, STATUS_INITIALIZING};
use quarry_core::types::{new_id, EntityId};

use crate::models::research::{
    NewResearch, Research, ResearchDetail, ResearchResult, ResearchSummary, ResultEventRow,
    ResultPatch,
};
use crate::repositories::{ResearchRepo, ResultRepo};
use crate::DbPool;

/// Errors raised by a [`ResultStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Research {0} not found")]
    ResearchNotFound(EntityId),

    #[error("Result {0} not found")]
    ResultNotFound(EntityId),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid stored value: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ResearchNotFound(id) => CoreError::NotFound {
                entity: "Research",
                id,
            },
            StoreError::ResultNotFound(id) => CoreError::NotFound {
                entity: "ResearchResult",
                id,
            },
            StoreError::Unavailable(msg) => CoreError::Unavailable(msg),
            other => CoreError::Internal(other.to_string()),
        }
    }
}

/// Persistent storage for research and their versioned results.
///
/// Every adapter enforces the same merge policies on [`ResultStore::record`]:
/// absent patch fields are untouched, empty attachment batches are ignored,
/// and progress never decreases. Each call reads or writes one row
/// atomically, so concurrent readers always observe a consistent snapshot.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;

    async fn get(&self, result_id: EntityId) -> Result<ResearchResult, StoreError>;

    /// Merge a patch without logging any progress update.
    async fn update(
        &self,
        result_id: EntityId,
        patch: ResultPatch,
    ) -> Result<ResearchResult, StoreError> {
        self.record(result_id, patch, &[]).await
    }

    /// Merge a patch and append `updates` to the result's progress log in
    /// one atomic step. The returned row's `last_event_seq` is the sequence
    /// of the last appended entry.
    async fn record(
        &self,
        result_id: EntityId,
        patch: ResultPatch,
        updates: &[ProgressUpdate],
    ) -> Result<ResearchResult, StoreError>;

    /// Log entries with `seq > after_seq`, ascending, at most `limit`.
    async fn events_since(
        &self,
        result_id: EntityId,
        after_seq: i64,
        limit: i64,
    ) -> Result<Vec<SequencedUpdate>, StoreError>;

    async fn get_research(&self, research_id: EntityId) -> Result<ResearchDetail, StoreError>;

    /// Create a research and its first result (version 1, `initializing`).
    async fn create_research(
        &self,
        input: NewResearch,
    ) -> Result<(Research, ResearchResult), StoreError>;

    /// Create the next result version of an existing research.
    async fn create_version(&self, research_id: EntityId) -> Result<ResearchResult, StoreError>;

    async fn delete_result(&self, result_id: EntityId) -> Result<(), StoreError>;

    /// Research newest first, each with its current result.
    async fn list_research(
        &self,
        user_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<ResearchSummary>, StoreError>;
}

/// Decode stored log rows, skipping (and logging) rows that no longer
/// deserialize.
pub(crate) fn decode_events(result_id: EntityId, rows: Vec<ResultEventRow>) -> Vec<SequencedUpdate> {
    rows.into_iter()
        .filter_map(|row| match serde_json::from_value::<ProgressUpdate>(row.payload) {
            Ok(update) => Some(SequencedUpdate {
                seq: row.seq,
                update,
                created_at: row.created_at,
            }),
            Err(e) => {
                tracing::warn!(
                    result_id = %result_id,
                    seq = row.seq,
                    error = %e,
                    "Skipping undecodable progress log entry",
                );
                None
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// PostgreSQL adapter
// ---------------------------------------------------------------------------

/// [`ResultStore`] backed by PostgreSQL.
#[derive(Clone)]
pub struct PgResultStore {
    pool: DbPool,
}

impl PgResultStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ResultStore for PgResultStore {
    async fn ping(&self) -> Result<(), StoreError> {
        crate::health_check(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    async fn get(&self, result_id: EntityId) -> Result<ResearchResult, StoreError> {
        ResultRepo::find_by_id(&self.pool, result_id)
            .await?
            .ok_or(StoreError::ResultNotFound(result_id))
    }

    async fn record(
        &self,
        result_id: EntityId,
        patch: ResultPatch,
        updates: &[ProgressUpdate],
    ) -> Result<ResearchResult, StoreError> {
        let payloads = updates
            .iter()
            .map(|u| serde_json::to_value(u).map(|v| (u.kind(), v)))
            .collect::<Result<Vec<_>, _>>()?;

        let mut tx = self.pool.begin().await?;
        let row = ResultRepo::apply_patch(&mut *tx, result_id, &patch, payloads.len() as i64)
            .await?
            .ok_or(StoreError::ResultNotFound(result_id))?;

        let first_seq = row.last_event_seq - payloads.len() as i64 + 1;
        for (offset, (kind, payload)) in payloads.iter().enumerate() {
            ResultRepo::append_event(&mut *tx, result_id, first_seq + offset as i64, kind, payload)
                .await?;
        }
        tx.commit().await?;

        Ok(row)
    }

    async fn events_since(
        &self,
        result_id: EntityId,
        after_seq: i64,
        limit: i64,
    ) -> Result<Vec<SequencedUpdate>, StoreError> {
        let rows = ResultRepo::events_since(&self.pool, result_id, after_seq, limit).await?;
        Ok(decode_events(result_id, rows))
    }

    async fn get_research(&self, research_id: EntityId) -> Result<ResearchDetail, StoreError> {
        let research = ResearchRepo::find_by_id(&self.pool, research_id)
            .await?
            .ok_or(StoreError::ResearchNotFound(research_id))?;
        let results = ResultRepo::list_by_research(&self.pool, research_id).await?;
        Ok(ResearchDetail::new(research, results))
    }

    async fn create_research(
        &self,
        input: NewResearch,
    ) -> Result<(Research, ResearchResult), StoreError> {
        let question = input.question.trim();
        let title = title_from_question(question);

        let mut tx = self.pool.begin().await?;
        let research = ResearchRepo::create(
            &mut *tx,
            new_id(),
            &title,
            question,
            input.user_id.as_deref(),
        )
        .await?;
        let result =
            ResultRepo::create_next_version(&mut *tx, new_id(), research.id, STATUS_INITIALIZING)
                .await?;
        tx.commit().await?;

        Ok((research, result))
    }

    async fn create_version(&self, research_id: EntityId) -> Result<ResearchResult, StoreError> {
        if ResearchRepo::find_by_id(&self.pool, research_id)
            .await?
            .is_none()
        {
            return Err(StoreError::ResearchNotFound(research_id));
        }
        let result =
            ResultRepo::create_next_version(&self.pool, new_id(), research_id, STATUS_INITIALIZING)
                .await?;
        Ok(result)
    }

    async fn delete_result(&self, result_id: EntityId) -> Result<(), StoreError> {
        if ResultRepo::delete(&self.pool, result_id).await? {
            Ok(())
        } else {
            Err(StoreError::ResultNotFound(result_id))
        }
    }

    async fn list_research(
        &self,
        user_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<ResearchSummary>, StoreError> {
        let research = ResearchRepo::list_recent(&self.pool, user_id, limit).await?;
        let ids: Vec<EntityId> = research.iter().map(|r| r.id).collect();

        let mut by_research: HashMap<EntityId, Vec<ResearchResult>> = HashMap::new();
        for result in ResultRepo::list_by_research_ids(&self.pool, &ids).await? {
            by_research.entry(result.research_id).or_default().push(result);
        }

        Ok(research
            .into_iter()
            .map(|research| {
                let current_result = by_research
                    .get(&research.id)
                    .and_then(|results| select_current(results).cloned());
                ResearchSummary {
                    research,
                    current_result,
                }
            })
            .collect())
    }
}
