//! §6 wire protocol: one SSE `data:` frame set per event, where the first
//! character of the first line is the event-type code and everything after
//! (including any embedded newlines) is the payload. `axum::response::sse`
//! already splits a multi-line `data` string across multiple `data:` lines
//! terminated by a blank line, so encoding an [`convo_hub::Event`] is just
//! string concatenation.

use std::convert::Infallible;

use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use convo_hub::Event;
use futures_util::Stream;
use std::time::Duration;

pub fn encode(event: &Event) -> SseEvent {
    SseEvent::default().data(format!("{}{}", event.code, event.payload))
}

/// Wrap a raw stream of hub events into an Axum SSE response, matching the
/// `sse_heartbeat_secs` config knob with a keep-alive comment so idle
/// connections (the browser waiting on a long-running turn) aren't reaped
/// by an intermediate proxy.
pub fn response<S>(heartbeat_secs: u64, stream: S) -> Sse<S>
where
    S: Stream<Item = Result<SseEvent, Infallible>> + Send + 'static,
{
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(heartbeat_secs))
            .text("keep-alive"),
    )
}
