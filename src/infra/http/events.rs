use std::convert::Infallible;

use async_stream::stream;
use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::{Stream, StreamExt};
use tracing::{debug, warn};

use super::HttpState;

const EVENT_NAME: &str = "invalidation";

/// Relay every hub message to out-of-process contexts as Server-Sent Events.
pub(super) async fn coherence_events(
    State(state): State<HttpState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut messages = state.articles.hub().stream();
    let shutdown = state.shutdown.clone();

    let stream = stream! {
        loop {
            let message = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = messages.next() => match next {
                    Some(message) => message,
                    None => break,
                },
            };

            match Event::default()
                .event(EVENT_NAME)
                .id(message.version_token.to_string())
                .json_data(&message)
            {
                Ok(event) => yield Ok(event),
                Err(err) => warn!(error = %err, "invalidation could not be encoded as an event"),
            }
        }
        debug!("coherence event stream closed");
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}
