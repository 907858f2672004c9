use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use quarry_core::error::CoreError;
use quarry_db::queue::QueueError;
use quarry_db::store::StoreError;
use serde_json::json;

use crate::engine::dispatcher::SubmissionError;

/// Application-level error type for HTTP handlers.
///
/// Wraps [`CoreError`] for domain errors and adds variants for the store,
/// the job queue and HTTP-specific failures. Implements [`IntoResponse`] to
/// produce consistent JSON error responses.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// A domain-level error from `quarry_core`.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// A Result Store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A job could not be submitted.
    #[error(transparent)]
    Submission(#[from] SubmissionError),

    /// A job queue read failed.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// A bad request with a human-readable message.
    #[error("Bad request: {0}")]
    BadRequest(String),
}

/// Convenience type alias for handler return values.
pub type AppResult<T> = Result<T, AppError>;

type Classified = (StatusCode, &'static str, String);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            // --- CoreError variants ---
            AppError::Core(core) => classify_core_error(core),

            // --- Store errors ---
            AppError::Store(StoreError::Database(err)) => classify_sqlx_error(&err),
            AppError::Store(other) => classify_core_error(other.into()),

            // --- Queue errors ---
            AppError::Submission(err) => match err {
                SubmissionError::Unavailable(msg) => {
                    tracing::error!(error = %msg, "Job queue unavailable");
                    (
                        StatusCode::SERVICE_UNAVAILABLE,
                        "QUEUE_UNAVAILABLE",
                        "The job queue is unavailable, try again later".to_string(),
                    )
                }
                SubmissionError::InvalidPayload(msg) => {
                    (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg)
                }
                conflict @ SubmissionError::Conflict { .. } => {
                    (StatusCode::CONFLICT, "CONFLICT", conflict.to_string())
                }
            },
            AppError::Queue(QueueError::Unavailable(msg)) => {
                tracing::error!(error = %msg, "Job queue unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "QUEUE_UNAVAILABLE",
                    "The job queue is unavailable, try again later".to_string(),
                )
            }
            AppError::Queue(QueueError::Database(err)) => classify_sqlx_error(&err),
            AppError::Queue(other) => internal(&other.to_string()),

            // --- HTTP-specific errors ---
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
        };

        let body = json!({
            "error": message,
            "code": code,
        });

        (status, axum::Json(body)).into_response()
    }
}

fn classify_core_error(core: CoreError) -> Classified {
    match core {
        CoreError::NotFound { entity, id } => (
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            format!("{entity} with id {id} not found"),
        ),
        CoreError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg),
        CoreError::Unavailable(msg) => {
            tracing::error!(error = %msg, "Dependency unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "UNAVAILABLE",
                "A required service is unavailable, try again later".to_string(),
            )
        }
        CoreError::Internal(msg) => internal(&msg),
    }
}

fn internal(msg: &str) -> Classified {
    tracing::error!(error = %msg, "Internal error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL_ERROR",
        "An internal error occurred".to_string(),
    )
}

/// Classify a sqlx error into an HTTP status, error code, and message.
///
/// - `RowNotFound` maps to 404.
/// - Unique constraint violations (constraint name starting with `uq_`) map to 409.
/// - Pool exhaustion and I/O failures map to 503.
/// - Everything else maps to 500 with a sanitized message.
fn classify_sqlx_error(err: &sqlx::Error) -> Classified {
    match err {
        sqlx::Error::RowNotFound => (
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            "Resource not found".to_string(),
        ),
        sqlx::Error::Database(db_err) => {
            // PostgreSQL unique constraint violation: error code 23505
            if db_err.code().as_deref() == Some("23505") {
                let constraint = db_err.constraint().unwrap_or("unknown");
                if constraint.starts_with("uq_") {
                    return (
                        StatusCode::CONFLICT,
                        "CONFLICT",
                        format!("Duplicate value violates unique constraint: {constraint}"),
                    );
                }
            }
            tracing::error!(error = %db_err, "Database error");
            internal_sanitized()
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            tracing::error!(error = %err, "Database unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "UNAVAILABLE",
                "The database is unavailable, try again later".to_string(),
            )
        }
        other => {
            tracing::error!(error = %other, "Database error");
            internal_sanitized()
        }
    }
}

fn internal_sanitized() -> Classified {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL_ERROR",
        "An internal error occurred".to_string(),
    )
}
