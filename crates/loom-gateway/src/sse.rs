//! Bridges an engine [`EventStream`] onto an axum SSE response.

use axum::http::header::{HeaderValue, CACHE_CONTROL, CONNECTION};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use loom_core::{EventEmitter, EventStream, LoomResult, SequencedEvent};
use serde_json::Value;
use std::convert::Infallible;

/// Engine events never exceed this many unsent frames per request.
pub const EVENT_BUFFER: usize = 256;

pub fn frame(event: &SequencedEvent) -> Event {
    Event::default()
        .id(event.seq.to_string())
        .event(event.event.name())
        .data(event.payload().to_string())
}

/// Streams `events` until the emitter side finishes. Dropping the response body cancels
/// the request.
pub fn respond(events: EventStream) -> Response {
    let stream = events.map(|event| Ok::<_, Infallible>(frame(&event)));
    let mut response = Sse::new(stream).into_response();
    let headers = response.headers_mut();
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    response
}

/// Sends the single terminal event for a finished pipeline.
pub async fn finish(emitter: &EventEmitter, outcome: LoomResult<Value>) {
    let sent = match outcome {
        Ok(result) => emitter.done(result).await,
        Err(err) => {
            tracing::error!(target: "loom::gateway", error = %err, "pipeline failed");
            emitter.error(err.to_string()).await
        }
    };
    if let Err(err) = sent {
        tracing::debug!(target: "loom::gateway", error = %err, "client left before the terminal event");
    }
}
