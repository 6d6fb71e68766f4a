use std::sync::Arc;

use convo_hub::{SseHub, WriterId};

/// Releases one reference on a hub writer when dropped — whether the
/// stream runs to completion or the client disconnects mid-turn. Mirrors
/// §4.5's subscriber lifecycle: the HTTP handler holds exactly one
/// reference for the lifetime of its own connection.
pub struct WriterGuard {
    hub: Arc<SseHub>,
    session_id: String,
    writer_id: WriterId,
}

impl WriterGuard {
    pub fn new(hub: Arc<SseHub>, session_id: String, writer_id: WriterId) -> Self {
        Self {
            hub,
            session_id,
            writer_id,
        }
    }
}

impl Drop for WriterGuard {
    fn drop(&mut self) {
        self.hub.remove(&self.session_id, self.writer_id);
    }
}

/// Run a turn-starting future to completion on a detached task, the
/// "background task per streaming turn" of §5. The turn's own persistence
/// and broadcasting happen inside `fut` (the orchestrator/branch-ops call);
/// this wrapper only has to handle a setup failure that occurs *before* any
/// provider dispatch (e.g. a store error opening the chain) by surfacing it
/// as an `E` event, and to release the hub reference the caller took out
/// for this task once it's done, win or lose.
pub fn spawn_background_turn<Fut, E>(
    hub: Arc<SseHub>,
    registry: Arc<convo_registry::CallRegistry>,
    session_id: String,
    writer_id: WriterId,
    fut: Fut,
) where
    Fut: std::future::Future<Output = Result<convo_agent::TurnOutcome, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = fut.await {
            let message = e.to_string();
            tracing::warn!(session_id = %session_id, error = %message, "turn ended in error");
            hub.broadcast(&session_id, convo_hub::Event::new('E', message));
            registry.fail(&session_id).ok();
        }
        hub.remove(&session_id, writer_id);
    });
}
