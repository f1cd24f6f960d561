//! Correlation between visible terminals and backend sessions.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info};

use crate::backend::{SessionCanceller, SessionId};

/// Identifier of a terminal owned by the trigger surface.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TerminalId(String);

impl TerminalId {
    /// Wraps a terminal identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrowed identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TerminalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TerminalId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Maps terminal ids to the sessions they display.
///
/// The registry never owns sessions; closing a terminal cancels the
/// correlated session through the [`SessionCanceller`].
pub struct TerminalRegistry {
    correlations: Mutex<HashMap<TerminalId, SessionId>>,
    canceller: Arc<dyn SessionCanceller>,
}

impl fmt::Debug for TerminalRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TerminalRegistry")
            .field("terminals", &self.len())
            .finish_non_exhaustive()
    }
}

impl TerminalRegistry {
    /// Creates an empty registry cancelling through `canceller`.
    #[must_use]
    pub fn new(canceller: Arc<dyn SessionCanceller>) -> Self {
        Self {
            correlations: Mutex::new(HashMap::new()),
            canceller,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TerminalId, SessionId>> {
        self.correlations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Correlates `terminal` with `session`, returning any previous session.
    pub fn register(&self, terminal: TerminalId, session: SessionId) -> Option<SessionId> {
        debug!(%terminal, %session, "terminal registered");
        self.lock().insert(terminal, session)
    }

    /// Session displayed by `terminal`, if any.
    #[must_use]
    pub fn session_for(&self, terminal: &TerminalId) -> Option<SessionId> {
        self.lock().get(terminal).copied()
    }

    /// Number of tracked terminals.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` when no terminal is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Handles a terminal closing.
    ///
    /// Unknown ids are ignored. Returns `true` when a session was
    /// interrupted.
    pub async fn on_terminal_closed(&self, terminal: &TerminalId) -> bool {
        let Some(session) = self.lock().remove(terminal) else {
            debug!(%terminal, "ignoring close of untracked terminal");
            return false;
        };
        let interrupted = self.canceller.cancel(session).await;
        info!(%terminal, %session, interrupted, "terminal closed");
        interrupted
    }

    /// Drops every correlation pointing at `session`.
    pub fn forget_session(&self, session: SessionId) {
        self.lock().retain(|_, tracked| *tracked != session);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::backend::CancelFuture;

    #[derive(Default)]
    struct RecordingCanceller {
        cancelled: Mutex<Vec<SessionId>>,
    }

    impl SessionCanceller for RecordingCanceller {
        fn cancel(&self, session: SessionId) -> CancelFuture<'_> {
            self.cancelled
                .lock()
                .expect("cancel log")
                .push(session);
            Box::pin(async { true })
        }
    }

    fn registry() -> (TerminalRegistry, Arc<RecordingCanceller>) {
        let canceller = Arc::new(RecordingCanceller::default());
        (TerminalRegistry::new(canceller.clone()), canceller)
    }

    #[tokio::test]
    async fn closing_a_tracked_terminal_cancels_its_session() {
        let (terminals, canceller) = registry();
        let session = SessionId::new();
        assert_eq!(terminals.register(TerminalId::from("t1"), session), None);

        assert!(terminals.on_terminal_closed(&TerminalId::from("t1")).await);
        assert_eq!(*canceller.cancelled.lock().expect("log"), vec![session]);
        assert!(terminals.is_empty());
    }

    #[tokio::test]
    async fn closing_an_unknown_terminal_is_a_no_op() {
        let (terminals, canceller) = registry();
        terminals.register(TerminalId::from("t1"), SessionId::new());

        assert!(!terminals.on_terminal_closed(&TerminalId::from("t2")).await);
        assert!(canceller.cancelled.lock().expect("log").is_empty());
        assert_eq!(terminals.len(), 1);
    }

    #[test]
    fn forgetting_a_session_drops_every_terminal_showing_it() {
        let (terminals, _canceller) = registry();
        let first = SessionId::new();
        let second = SessionId::new();
        terminals.register(TerminalId::from("a"), first);
        terminals.register(TerminalId::from("b"), first);
        terminals.register(TerminalId::from("c"), second);

        terminals.forget_session(first);
        assert_eq!(terminals.len(), 1);
        assert_eq!(terminals.session_for(&TerminalId::from("c")), Some(second));
        assert_eq!(terminals.session_for(&TerminalId::from("a")), None);
    }

    #[test]
    fn re_registering_returns_the_previous_session() {
        let (terminals, _canceller) = registry();
        let first = SessionId::new();
        let second = SessionId::new();
        terminals.register(TerminalId::new("t"), first);
        assert_eq!(terminals.register(TerminalId::new("t"), second), Some(first));
        assert_eq!(terminals.session_for(&TerminalId::new("t")), Some(second));
    }
}
