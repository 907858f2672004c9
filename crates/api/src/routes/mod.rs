pub mod health;
pub mod research;

use axum::Router;

use crate::state::AppState;

/// Build the `/api/v1` route tree.
///
/// Route hierarchy:
///
/// ```text
/// /research                                 list, create
/// /research/{id}                            detail with every version
/// /research/{id}/followups                  create next version (POST)
/// /research/{id}/sources                    sources of the current result
/// /research/{id}/related                    related items of the current result
/// /research/{id}/job                        queue record of the research's job
/// /research/{id}/stream                     SSE progress relay
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        // Research, result versions and their generation jobs.
        .nest("/research", research::router())
}
