pub mod error;

use chrono::{DateTime, Utc};
use convo_core::types::CallState;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

pub use error::RegistryError;
use error::Result;

struct CallEntry {
    cancel: CancellationToken,
    start_time: DateTime<Utc>,
    state: CallState,
}

/// Process-wide table of the one active call per session. Multiple HTTP
/// handlers converge on the same session, so `start` is exclusive: only
/// one registration may hold `Running` at a time.
#[derive(Default)]
pub struct CallRegistry {
    calls: DashMap<String, CallEntry>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self {
            calls: DashMap::new(),
        }
    }

    #[instrument(skip(self, cancel))]
    pub fn start(&self, session_id: &str, cancel: CancellationToken) -> Result<()> {
        if let Some(existing) = self.calls.get(session_id) {
            if existing.state == CallState::Running {
                return Err(RegistryError::AlreadyActive(session_id.to_string()));
            }
        }
        self.calls.insert(
            session_id.to_string(),
            CallEntry {
                cancel,
                start_time: Utc::now(),
                state: CallState::Running,
            },
        );
        debug!(session_id, "call started");
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn cancel(&self, session_id: &str) -> Result<()> {
        let entry = self
            .calls
            .get(session_id)
            .ok_or_else(|| RegistryError::NotActive(session_id.to_string()))?;
        entry.cancel.cancel();
        Ok(())
    }

    pub fn complete(&self, session_id: &str) -> Result<()> {
        self.set_terminal(session_id, CallState::Completed)
    }

    pub fn fail(&self, session_id: &str) -> Result<()> {
        self.set_terminal(session_id, CallState::Failed)
    }

    pub fn mark_canceled(&self, session_id: &str) -> Result<()> {
        self.set_terminal(session_id, CallState::Canceled)
    }

    fn set_terminal(&self, session_id: &str, state: CallState) -> Result<()> {
        let mut entry = self
            .calls
            .get_mut(session_id)
            .ok_or_else(|| RegistryError::NotActive(session_id.to_string()))?;
        entry.state = state;
        Ok(())
    }

    pub fn remove(&self, session_id: &str) {
        self.calls.remove(session_id);
    }

    pub fn has_active(&self, session_id: &str) -> bool {
        self.calls
            .get(session_id)
            .map(|e| e.state == CallState::Running)
            .unwrap_or(false)
    }

    pub fn start_time(&self, session_id: &str) -> Option<DateTime<Utc>> {
        self.calls.get(session_id).map(|e| e.start_time)
    }

    pub fn elapsed_seconds(&self, session_id: &str) -> Option<i64> {
        self.start_time(session_id)
            .map(|t| (Utc::now() - t).num_seconds())
    }

    /// Count of sessions currently holding a `Running` call — used by the
    /// `/health` liveness probe.
    pub fn active_count(&self) -> usize {
        self.calls.iter().filter(|e| e.state == CallState::Running).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_fails_when_already_active() {
        let reg = CallRegistry::new();
        reg.start("s1", CancellationToken::new()).unwrap();
        let err = reg.start("s1", CancellationToken::new()).unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyActive(_)));
    }

    #[test]
    fn complete_then_start_again_succeeds() {
        let reg = CallRegistry::new();
        reg.start("s1", CancellationToken::new()).unwrap();
        reg.complete("s1").unwrap();
        assert!(!reg.has_active("s1"));
        reg.start("s1", CancellationToken::new()).unwrap();
        assert!(reg.has_active("s1"));
    }

    #[test]
    fn cancel_triggers_the_stored_token() {
        let reg = CallRegistry::new();
        let token = CancellationToken::new();
        reg.start("s1", token.clone()).unwrap();
        reg.cancel("s1").unwrap();
        assert!(token.is_cancelled());
    }

    #[test]
    fn remove_clears_the_entry() {
        let reg = CallRegistry::new();
        reg.start("s1", CancellationToken::new()).unwrap();
        reg.remove("s1");
        assert!(!reg.has_active("s1"));
        assert!(reg.start_time("s1").is_none());
    }
}
