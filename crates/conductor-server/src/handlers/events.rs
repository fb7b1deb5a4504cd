//! Push stream of task events, filtered by job id.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::auth::{ensure_job_read, AuthUser};
use crate::error::ApiError;
use crate::handlers::jobs::require_job;
use crate::serve_cmd::AppState;

/// `GET /api/jobs/:id/events`: live SSE stream of `{task_event}` records
/// for one job. No replay; subscribers see transitions from now on.
pub async fn job_events(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let job = require_job(&state, id).await?;
    ensure_job_read(&state.pool, &user, &job).await?;

    let receiver = state.orchestrator.events().subscribe();
    let stream = BroadcastStream::new(receiver).filter_map(move |item| match item {
        Ok(event) if event.job_id == id => {
            let data = serde_json::to_string(&serde_json::json!({"task_event": event}))
                .unwrap_or_else(|_| "{}".to_owned());
            Some(Ok(Event::default().event("task_event").data(data)))
        }
        Ok(_) => None,
        // A lagged subscriber missed events; surface a marker so the
        // client can refetch state instead of trusting the stream.
        Err(BroadcastStreamRecvError::Lagged(missed)) => Some(Ok(Event::default()
            .event("lagged")
            .data(missed.to_string()))),
    });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    ))
}
