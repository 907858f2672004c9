//! Repository for the `research` table.

use quarry_core::types::EntityId;
use sqlx::{PgExecutor, PgPool};

use crate::models::research::Research;

/// Column list shared across queries to avoid repetition.
const COLUMNS: &str = "id, title, question, user_id, created_at, updated_at";

/// Maximum page size for research listing.
pub const MAX_LIMIT: i64 = 100;

/// Default page size for research listing.
pub const DEFAULT_LIMIT: i64 = 20;

/// Provides insert and lookup operations for research rows.
pub struct ResearchRepo;

impl ResearchRepo {
    /// Insert a research row. Title and question are immutable afterwards.
    pub async fn create<'e, E: PgExecutor<'e>>(
        executor: E,
        id: EntityId,
        title: &str,
        question: &str,
        user_id: Option<&str>,
    ) -> Result<Research, sqlx::Error> {
        let query = format!(
            "INSERT INTO research (id, title, question, user_id) \
             VALUES ($1, $2, $3, $4) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Research>(&query)
            .bind(id)
            .bind(title)
            .bind(question)
            .bind(user_id)
            .fetch_one(executor)
            .await
    }

    /// Find a research by id.
    pub async fn find_by_id(pool: &PgPool, id: EntityId) -> Result<Option<Research>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM research WHERE id = $1");
        sqlx::query_as::<_, Research>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// List research newest first, optionally restricted to one user.
    ///
    /// `limit` is clamped to `1..=MAX_LIMIT`.
    pub async fn list_recent(
        pool: &PgPool,
        user_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<Research>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM research \
             WHERE ($1::TEXT IS NULL OR user_id = $1) \
             ORDER BY created_at DESC, id DESC \
             LIMIT $2"
        );
        sqlx::query_as::<_, Research>(&query)
            .bind(user_id)
            .bind(limit.clamp(1, MAX_LIMIT))
            .fetch_all(pool)
            .await
    }
}
