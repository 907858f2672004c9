//! Handler for `GET /research/{id}/stream`, the SSE relay endpoint.

use std::convert::Infallible;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, Sse};
use futures::{Stream, StreamExt};
use quarry_core::error::CoreError;
use quarry_core::types::EntityId;
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{AppError, AppResult};
use crate::relay::{FrameSink, RelayConnection, RelayMode, RelayRequest};
use crate::state::AppState;

const LAST_EVENT_ID: &str = "last-event-id";

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    #[serde(default)]
    pub mode: RelayMode,
    /// Follow this result version instead of the current one.
    pub result_id: Option<EntityId>,
}

fn last_event_id(headers: &HeaderMap) -> AppResult<Option<i64>> {
    headers
        .get(LAST_EVENT_ID)
        .map(|value| {
            value
                .to_str()
                .ok()
                .and_then(|v| v.trim().parse::<i64>().ok())
                .filter(|seq| *seq >= 0)
                .ok_or_else(|| AppError::BadRequest("Invalid Last-Event-ID header".into()))
        })
        .transpose()
}

/// GET /api/v1/research/{id}/stream
///
/// Relay the generation progress of one result version as Server-Sent
/// Events. `mode=live` subscribes to in-process progress and may run the
/// generation itself; `mode=poll` (default) reads the progress log every
/// poll interval. A `Last-Event-ID` header resumes after that log sequence.
pub async fn stream_research(
    State(state): State<AppState>,
    Path(research_id): Path<EntityId>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let last_event_id = last_event_id(&headers)?;
    let detail = state.store.get_research(research_id).await?;

    let result = match query.result_id {
        Some(result_id) => detail
            .results
            .into_iter()
            .find(|r| r.id == result_id)
            .ok_or(CoreError::NotFound {
                entity: "ResearchResult",
                id: result_id,
            })?,
        None => detail.current_result.ok_or(CoreError::NotFound {
            entity: "ResearchResult",
            id: research_id,
        })?,
    };

    let config = state.relay_config.as_ref().clone();
    let (sink, rx) = FrameSink::channel(config.channel_capacity, config.loss_timeout);
    let request = RelayRequest {
        research_id,
        result_id: result.id,
        mode: query.mode,
        last_event_id,
    };

    tracing::info!(
        research_id = %research_id,
        result_id = %result.id,
        mode = ?query.mode,
        last_event_id = ?last_event_id,
        "Relay connection opened",
    );

    let connection = RelayConnection::new(
        request,
        state.relay_deps(),
        config,
        sink,
        state.shutdown.child_token(),
    );
    tokio::spawn(connection.run());

    let stream = ReceiverStream::new(rx).map(|frame| Ok::<Event, Infallible>(frame.to_event()));
    Ok(Sse::new(stream))
}
