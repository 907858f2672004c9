//! Handlers for the `/research` resource.
//!
//! Creating a research (or a follow-up version) writes the result row and
//! submits its generation job in one request. The queue is pinged before
//! anything is written, and a result whose job could not be submitted is
//! deleted again.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use quarry_core::error::CoreError;
use quarry_core::research::{validate_question, ResearchQuestion};
use quarry_core::types::EntityId;
use quarry_db::models::job::JobHandle;
use quarry_db::models::research::{NewResearch, Research, ResearchResult};
use quarry_db::repositories::research_repo::{DEFAULT_LIMIT, MAX_LIMIT};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::middleware::caller::CallerId;
use crate::response::DataResponse;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// Body of `POST /research` and `POST /research/{id}/followups`.
#[derive(Debug, Deserialize)]
pub struct QuestionRequest {
    pub question: String,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
}

/// A research created together with its first result and job.
#[derive(Debug, Serialize)]
pub struct CreatedResearch {
    pub research: Research,
    pub result: ResearchResult,
    pub job: JobHandle,
}

/// A follow-up result version and its job.
#[derive(Debug, Serialize)]
pub struct CreatedVersion {
    pub result: ResearchResult,
    pub job: JobHandle,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn question_of(input: QuestionRequest) -> AppResult<ResearchQuestion> {
    let question = validate_question(&input.question)?.to_string();
    Ok(ResearchQuestion {
        question,
        model: input.model.filter(|m| !m.trim().is_empty()),
    })
}

/// Submit the job of a freshly created result, deleting the result when
/// submission fails.
async fn submit_or_discard(
    state: &AppState,
    result: &ResearchResult,
    question: ResearchQuestion,
    caller: &CallerId,
) -> Result<JobHandle, AppError> {
    let user_id = caller.as_deref().unwrap_or_default();
    match state
        .dispatcher
        .submit(result.research_id, question, user_id, result.id)
        .await
    {
        Ok(job) => Ok(job),
        Err(err) => {
            if let Err(e) = state.store.delete_result(result.id).await {
                tracing::error!(
                    result_id = %result.id,
                    error = %e,
                    "Failed to discard result after submission error",
                );
            }
            Err(err.into())
        }
    }
}

// ---------------------------------------------------------------------------
// Create
// ---------------------------------------------------------------------------

/// POST /api/v1/research
///
/// Create a research with its first result version and submit the
/// generation job. Returns 201 with the research, result and job handle.
pub async fn create_research(
    caller: CallerId,
    State(state): State<AppState>,
    Json(input): Json<QuestionRequest>,
) -> AppResult<impl IntoResponse> {
    let question = question_of(input)?;
    state.dispatcher.ensure_reachable().await?;

    let (research, result) = state
        .store
        .create_research(NewResearch {
            question: question.question.clone(),
            user_id: caller.0.clone(),
        })
        .await?;

    let job = submit_or_discard(&state, &result, question, &caller).await?;

    tracing::info!(
        research_id = %research.id,
        result_id = %result.id,
        user_id = ?caller.0,
        "Research created",
    );

    Ok((
        StatusCode::CREATED,
        Json(DataResponse {
            data: CreatedResearch {
                research,
                result,
                job,
            },
        }),
    ))
}

/// POST /api/v1/research/{id}/followups
///
/// Create the next result version of an existing research and submit its
/// job. Returns 201 with the new result and job handle.
pub async fn create_followup(
    caller: CallerId,
    State(state): State<AppState>,
    Path(research_id): Path<EntityId>,
    Json(input): Json<QuestionRequest>,
) -> AppResult<impl IntoResponse> {
    let question = question_of(input)?;

    // 404 before touching the queue.
    state.store.get_research(research_id).await?;
    state.dispatcher.ensure_reachable().await?;

    let result = state.store.create_version(research_id).await?;
    let job = submit_or_discard(&state, &result, question, &caller).await?;

    tracing::info!(
        research_id = %research_id,
        result_id = %result.id,
        version = result.version,
        "Follow-up version created",
    );

    Ok((
        StatusCode::CREATED,
        Json(DataResponse {
            data: CreatedVersion { result, job },
        }),
    ))
}

// ---------------------------------------------------------------------------
// Read
// ---------------------------------------------------------------------------

/// GET /api/v1/research
///
/// Recent research of the caller, newest first, each with its current
/// result. Supports an optional `limit` query parameter (default 20, max 100).
pub async fn list_research(
    caller: CallerId,
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> AppResult<impl IntoResponse> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let items = state.store.list_research(caller.as_deref(), limit).await?;
    Ok(Json(DataResponse { data: items }))
}

/// GET /api/v1/research/{id}
///
/// The research with every result version and its current result.
pub async fn get_research(
    State(state): State<AppState>,
    Path(research_id): Path<EntityId>,
) -> AppResult<impl IntoResponse> {
    let detail = state.store.get_research(research_id).await?;
    Ok(Json(DataResponse { data: detail }))
}

/// GET /api/v1/research/{id}/sources
///
/// Sources of the current result; empty while none arrived yet.
pub async fn get_sources(
    State(state): State<AppState>,
    Path(research_id): Path<EntityId>,
) -> AppResult<impl IntoResponse> {
    let detail = state.store.get_research(research_id).await?;
    let sources = detail.current_result.map(|r| r.sources).unwrap_or_default();
    Ok(Json(DataResponse { data: sources }))
}

/// GET /api/v1/research/{id}/related
pub async fn get_related(
    State(state): State<AppState>,
    Path(research_id): Path<EntityId>,
) -> AppResult<impl IntoResponse> {
    let detail = state.store.get_research(research_id).await?;
    let related = detail.current_result.map(|r| r.related).unwrap_or_default();
    Ok(Json(DataResponse { data: related }))
}

/// GET /api/v1/research/{id}/job
///
/// The queue record of the research's generation job.
pub async fn get_job(
    State(state): State<AppState>,
    Path(research_id): Path<EntityId>,
) -> AppResult<impl IntoResponse> {
    let record = state
        .dispatcher
        .job_status(research_id)
        .await?
        .ok_or(AppError::Core(CoreError::NotFound {
            entity: "Job",
            id: research_id,
        }))?;
    Ok(Json(DataResponse { data: record }))
}
