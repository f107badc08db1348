use std::convert::Infallible;
use std::time::Duration;

use futures::stream::{self, Stream};
use serde::Deserialize;
use serde_json::json;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::IntervalStream;
use tracing::{debug, warn};
use warp::Filter;
use warp::sse::Event;

use super::tasks::status_body;
use super::{AppState, with_state};
use crate::errors::ServiceError;
use crate::results::TaskResults;

pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
pub struct SseQuery {
  pub task_id: String,
}

pub fn sse_route(state: AppState) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path("sse")
    .and(warp::path::end())
    .and(warp::get())
    .and(warp::query::<SseQuery>())
    .and(with_state(state))
    .map(|query: SseQuery, state: AppState| {
      let events = status_events(state.results, query.task_id, POLL_INTERVAL);
      warp::sse::reply(warp::sse::keep_alive().stream(events))
    })
}

/// Polls the status record and emits one `status` event per tick. The stream
/// ends after a terminal snapshot or once the record is gone.
pub fn status_events(
  results: TaskResults,
  task_id: String,
  every: Duration,
) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
  let ticks = IntervalStream::new(tokio::time::interval(every));
  stream::unfold(
    (ticks, results, task_id, false),
    |(mut ticks, results, task_id, finished)| async move {
      if finished {
        return None;
      }
      ticks.next().await?;
      let (event, finished) = match results.get_status(&task_id).await {
        Ok(snapshot) => {
          debug!(task_id = %task_id, state = %snapshot.state(), "Streaming status");
          let event = Event::default().event("status").data(status_body(&snapshot).to_string());
          (event, snapshot.is_terminal())
        }
        // Only an unreachable store can recover between polls.
        Err(e) if !e.is_retryable() => (error_event(&e), true),
        Err(e) => {
          warn!(task_id = %task_id, error = %e, "Status poll failed");
          (error_event(&e), false)
        }
      };
      Some((Ok(event), (ticks, results, task_id, finished)))
    },
  )
}

fn error_event(err: &ServiceError) -> Event {
  Event::default()
    .event("error")
    .data(json!({"error": err.kind(), "message": err.to_string()}).to_string())
}
