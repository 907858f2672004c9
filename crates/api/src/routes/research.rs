//! Route definitions for the `/research` resource.
//!
//! The caller id is read from the `x-user-id` header where a handler needs it.

use axum::routing::{get, post};
use axum::Router;

use crate::handlers::{research, stream};
use crate::state::AppState;

/// Routes mounted at `/research`.
///
/// ```text
/// GET    /                  -> list_research
/// POST   /                  -> create_research
/// GET    /{id}              -> get_research
/// POST   /{id}/followups    -> create_followup
/// GET    /{id}/sources      -> get_sources
/// GET    /{id}/related      -> get_related
/// GET    /{id}/job          -> get_job
/// GET    /{id}/stream       -> stream_research
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/",
            get(research::list_research).post(research::create_research),
        )
        .route("/{id}", get(research::get_research))
        .route("/{id}/followups", post(research::create_followup))
        .route("/{id}/sources", get(research::get_sources))
        .route("/{id}/related", get(research::get_related))
        .route("/{id}/job", get(research::get_job))
        .route("/{id}/stream", get(stream::stream_research))
}
