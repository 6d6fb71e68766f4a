pub mod error;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub use error::HubError;

/// Bound on a subscriber's outstanding event queue. A writer that falls
/// this far behind is dropped rather than allowed to block the
/// broadcaster (§5: "a writer must never block the broadcaster").
const WRITER_BUFFER: usize = 256;

/// One SSE frame: a single-character event-type code (§6) and its payload.
#[derive(Debug, Clone)]
pub struct Event {
    pub code: char,
    pub payload: String,
}

impl Event {
    pub fn new(code: char, payload: impl Into<String>) -> Self {
        Self {
            code,
            payload: payload.into(),
        }
    }
}

/// Handle identifying one subscriber within a session's writer set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WriterId(u64);

struct WriterEntry {
    sender: mpsc::Sender<Event>,
    refcount: usize,
}

/// Per-session multiplexer: attaches subscribers, broadcasts typed events,
/// reference-counts writers so a writer outlives the HTTP request that
/// created it (the orchestrator holds its own reference for post-stream
/// work such as session-name inference).
#[derive(Default)]
pub struct SseHub {
    sessions: DashMap<String, HashMap<u64, WriterEntry>>,
    next_id: AtomicU64,
}

impl SseHub {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Create a fresh writer for `session_id` with one reference held by
    /// the caller. Returns the receiving half to drain into an SSE
    /// response.
    pub fn subscribe(&self, session_id: &str) -> (WriterId, mpsc::Receiver<Event>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(WRITER_BUFFER);
        self.sessions
            .entry(session_id.to_string())
            .or_default()
            .insert(id, WriterEntry {
                sender: tx,
                refcount: 1,
            });
        (WriterId(id), rx)
    }

    /// Take out an additional reference on an existing writer so it
    /// survives past the request that originally subscribed it.
    pub fn add(&self, session_id: &str, writer: WriterId) {
        if let Some(mut entry) = self.sessions.get_mut(session_id) {
            if let Some(w) = entry.get_mut(&writer.0) {
                w.refcount += 1;
            }
        }
    }

    /// Release one reference. The writer (and its channel) is dropped
    /// once the count reaches zero, which closes the SSE stream for any
    /// consumer still reading from it.
    pub fn remove(&self, session_id: &str, writer: WriterId) {
        let mut drop_session = false;
        if let Some(mut entry) = self.sessions.get_mut(session_id) {
            if let Some(w) = entry.get_mut(&writer.0) {
                w.refcount = w.refcount.saturating_sub(1);
                if w.refcount == 0 {
                    entry.remove(&writer.0);
                }
            }
            drop_session = entry.is_empty();
        }
        if drop_session {
            self.sessions.remove(session_id);
        }
    }

    /// Best-effort fan-out: a writer whose buffer is full or whose
    /// receiver is gone is dropped silently rather than blocking the
    /// broadcaster or the other subscribers.
    pub fn broadcast(&self, session_id: &str, event: Event) {
        let Some(mut entry) = self.sessions.get_mut(session_id) else {
            return;
        };
        let mut dead = Vec::new();
        for (id, writer) in entry.iter() {
            if writer.sender.try_send(event.clone()).is_err() {
                warn!(session_id, writer_id = id, "dropping slow SSE writer");
                dead.push(*id);
            }
        }
        for id in dead {
            entry.remove(&id);
        }
        if entry.is_empty() {
            debug!(session_id, "no subscribers left after broadcast");
        }
    }

    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.sessions
            .get(session_id)
            .map(|e| e.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_reaches_subscriber() {
        let hub = SseHub::new();
        let (_id, mut rx) = hub.subscribe("s1");
        hub.broadcast("s1", Event::new('X', ""));
        let got = rx.recv().await.unwrap();
        assert_eq!(got.code, 'X');
    }

    #[tokio::test]
    async fn late_subscriber_only_sees_events_after_joining() {
        let hub = SseHub::new();
        let (_id1, mut rx1) = hub.subscribe("s1");
        hub.broadcast("s1", Event::new('M', "A"));

        let (_id2, mut rx2) = hub.subscribe("s1");
        hub.broadcast("s1", Event::new('M', "B"));

        assert_eq!(rx1.recv().await.unwrap().payload, "A");
        assert_eq!(rx1.recv().await.unwrap().payload, "B");
        assert_eq!(rx2.recv().await.unwrap().payload, "B");
    }

    #[tokio::test]
    async fn refcount_keeps_writer_alive_past_first_remove() {
        let hub = SseHub::new();
        let (id, mut rx) = hub.subscribe("s1");
        hub.add("s1", id);
        hub.remove("s1", id);
        hub.broadcast("s1", Event::new('X', ""));
        assert_eq!(rx.recv().await.unwrap().code, 'X');
    }

    #[tokio::test]
    async fn full_buffer_drops_the_writer_without_blocking() {
        let hub = SseHub::new();
        let (_id, _rx) = hub.subscribe("s1");
        for _ in 0..(WRITER_BUFFER + 10) {
            hub.broadcast("s1", Event::new('M', "x"));
        }
        assert_eq!(hub.subscriber_count("s1"), 0);
    }
}
