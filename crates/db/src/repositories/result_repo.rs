//! Repository for the `research_results` and `result_events` tables.

use quarry_core::types::EntityId;
use sqlx::types::Json;
use sqlx::{PgExecutor, PgPool};

use crate::models::research::{ResearchResult, ResultEventRow, ResultPatch};

/// Column list shared across queries to avoid repetition.
const COLUMNS: &str = "id, research_id, version, markdown_content, data, \
    sources, related, tasks, status, is_complete, progress, last_event_seq, \
    created_at, updated_at";

/// Provides version management, merging updates and the progress log.
pub struct ResultRepo;

impl ResultRepo {
    // ── Versions ─────────────────────────────────────────────────────

    /// Insert the next result version for a research, auto-assigning the
    /// version number.
    pub async fn create_next_version<'e, E: PgExecutor<'e>>(
        executor: E,
        id: EntityId,
        research_id: EntityId,
        status: &str,
    ) -> Result<ResearchResult, sqlx::Error> {
        let query = format!(
            "INSERT INTO research_results (id, research_id, version, status)
             VALUES (
                $1,
                $2,
                (SELECT COALESCE(MAX(version), 0) + 1 FROM research_results WHERE research_id = $2),
                $3
             )
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, ResearchResult>(&query)
            .bind(id)
            .bind(research_id)
            .bind(status)
            .fetch_one(executor)
            .await
    }

    pub async fn find_by_id(
        pool: &PgPool,
        id: EntityId,
    ) -> Result<Option<ResearchResult>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM research_results WHERE id = $1");
        sqlx::query_as::<_, ResearchResult>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// All versions of one research, ascending.
    pub async fn list_by_research(
        pool: &PgPool,
        research_id: EntityId,
    ) -> Result<Vec<ResearchResult>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM research_results \
             WHERE research_id = $1 \
             ORDER BY version ASC"
        );
        sqlx::query_as::<_, ResearchResult>(&query)
            .bind(research_id)
            .fetch_all(pool)
            .await
    }

    /// All versions of several research rows, ascending per research.
    pub async fn list_by_research_ids(
        pool: &PgPool,
        research_ids: &[EntityId],
    ) -> Result<Vec<ResearchResult>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM research_results \
             WHERE research_id = ANY($1) \
             ORDER BY research_id, version ASC"
        );
        sqlx::query_as::<_, ResearchResult>(&query)
            .bind(research_ids)
            .fetch_all(pool)
            .await
    }

    /// Hard-delete a result. Returns `true` if a row was removed.
    pub async fn delete(pool: &PgPool, id: EntityId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM research_results WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ── Merging updates ──────────────────────────────────────────────

    /// Merge `patch` into a result in one statement and reserve `appended`
    /// log sequence numbers.
    ///
    /// Absent fields keep their value, empty `sources`/`related`/`tasks`
    /// arrays are ignored and `progress` only moves forward (clamped to
    /// 0..=100). The returned row's `last_event_seq` is the last reserved
    /// sequence. Returns `None` if the result does not exist.
    pub async fn apply_patch<'e, E: PgExecutor<'e>>(
        executor: E,
        id: EntityId,
        patch: &ResultPatch,
        appended: i64,
    ) -> Result<Option<ResearchResult>, sqlx::Error> {
        let query = format!(
            "UPDATE research_results SET \
                markdown_content = COALESCE($2, markdown_content), \
                data = COALESCE($3, data), \
                sources = CASE WHEN $4::JSONB IS NULL OR jsonb_array_length($4::JSONB) = 0 \
                    THEN sources ELSE $4::JSONB END, \
                related = CASE WHEN $5::JSONB IS NULL OR jsonb_array_length($5::JSONB) = 0 \
                    THEN related ELSE $5::JSONB END, \
                tasks = CASE WHEN $6::JSONB IS NULL OR jsonb_array_length($6::JSONB) = 0 \
                    THEN tasks ELSE $6::JSONB END, \
                status = COALESCE($7, status), \
                is_complete = COALESCE($8, is_complete), \
                progress = CASE WHEN $9::SMALLINT IS NULL THEN progress \
                    ELSE GREATEST(progress, LEAST(GREATEST($9::SMALLINT, 0), 100)::SMALLINT) END, \
                last_event_seq = last_event_seq + $10, \
                updated_at = NOW() \
             WHERE id = $1 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, ResearchResult>(&query)
            .bind(id)
            .bind(patch.markdown_content.as_deref())
            .bind(patch.data.as_ref())
            .bind(patch.sources.as_ref().map(Json))
            .bind(patch.related.as_ref().map(Json))
            .bind(patch.tasks.as_ref().map(Json))
            .bind(patch.status.as_deref())
            .bind(patch.is_complete)
            .bind(patch.progress)
            .bind(appended)
            .fetch_optional(executor)
            .await
    }

    // ── Progress log ─────────────────────────────────────────────────

    /// Append one serialized progress update at `seq`.
    pub async fn append_event<'e, E: PgExecutor<'e>>(
        executor: E,
        result_id: EntityId,
        seq: i64,
        kind: &str,
        payload: &serde_json::Value,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO result_events (result_id, seq, kind, payload) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(result_id)
        .bind(seq)
        .bind(kind)
        .bind(payload)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Log entries with `seq > after_seq`, ascending, at most `limit`.
    pub async fn events_since(
        pool: &PgPool,
        result_id: EntityId,
        after_seq: i64,
        limit: i64,
    ) -> Result<Vec<ResultEventRow>, sqlx::Error> {
        sqlx::query_as::<_, ResultEventRow>(
            "SELECT seq, payload, created_at FROM result_events \
             WHERE result_id = $1 AND seq > $2 \
             ORDER BY seq ASC \
             LIMIT $3",
        )
        .bind(result_id)
        .bind(after_seq)
        .bind(limit)
        .fetch_all(pool)
        .await
    }
}
