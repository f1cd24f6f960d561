//! Session lifecycle shared by every runner backend.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{BackendKind, ExecutionRequest, RunError, RunnerBackend};
use crate::sink::{LogSink, Notifier};

/// Identifier of one playbook run.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generates a fresh random identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Lifecycle of a backend session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SessionState {
    /// Created but not yet dispatched.
    Idle,
    /// Dispatched; the backend is preparing the run.
    Starting,
    /// A remote environment is being provisioned (cloud shell only).
    Provisioning,
    /// The interpreter is running.
    Running,
    /// The interpreter exited; the caller decides whether the code is an error.
    Completed {
        /// Exit code, absent when the process was signalled.
        exit_code: Option<i32>,
    },
    /// The run aborted before or while running.
    Failed {
        /// Human-readable failure description.
        reason: String,
    },
    /// The session was cancelled, typically by closing its terminal.
    Interrupted,
}

impl SessionState {
    /// Returns `true` for `Completed`, `Failed`, and `Interrupted`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Failed { .. } | Self::Interrupted
        )
    }

    /// Returns `true` when moving from `self` to `next` is a legal transition.
    #[must_use]
    pub const fn permits(&self, next: &Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (Self::Idle, Self::Starting)
            | (Self::Starting, Self::Provisioning)
            | (Self::Starting | Self::Provisioning, Self::Running)
            | (Self::Running, Self::Completed { .. })
            | (Self::Starting | Self::Provisioning | Self::Running, Self::Failed { .. })
            | (_, Self::Interrupted) => true,
            _ => false,
        }
    }
}

/// Per-session progress reporter handed to backends.
pub struct SessionProgress {
    id: SessionId,
    kind: BackendKind,
    state: watch::Sender<SessionState>,
    sink: Arc<dyn LogSink>,
}

impl fmt::Debug for SessionProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionProgress")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl SessionProgress {
    /// Creates an idle session reporting into `sink`.
    #[must_use]
    pub fn new(kind: BackendKind, sink: Arc<dyn LogSink>) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            id: SessionId::new(),
            kind,
            state,
            sink,
        }
    }

    /// Session identifier.
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Backend driving this session.
    #[must_use]
    pub const fn kind(&self) -> BackendKind {
        self.kind
    }

    /// Sink receiving this session's output.
    #[must_use]
    pub fn sink(&self) -> &dyn LogSink {
        self.sink.as_ref()
    }

    /// Current state snapshot.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Subscribes to state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Moves to `next` when the transition is legal; returns whether it did.
    ///
    /// Terminal states absorb later transitions, so a run finishing after
    /// an interruption leaves the session `Interrupted`.
    pub fn advance(&self, next: SessionState) -> bool {
        let mut previous = None;
        let changed = self.state.send_if_modified(|current| {
            if current.permits(&next) {
                previous = Some(std::mem::replace(current, next.clone()));
                true
            } else {
                false
            }
        });
        if changed {
            debug!(session = %self.id, kind = %self.kind, from = ?previous, to = ?next, "session transition");
        } else {
            debug!(session = %self.id, rejected = ?next, "ignored session transition");
        }
        changed
    }
}

/// Future returned by [`SessionCanceller::cancel`].
pub type CancelFuture<'a> = Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

/// Cancellation path invoked when a correlated terminal closes.
pub trait SessionCanceller: Send + Sync {
    /// Interrupts `session`; returns `true` when it was still active.
    fn cancel(&self, session: SessionId) -> CancelFuture<'_>;
}

struct SessionEntry {
    progress: Arc<SessionProgress>,
    task: Option<JoinHandle<()>>,
}

/// Owns every backend session and dispatches runs to registered backends.
pub struct SessionManager {
    backends: HashMap<BackendKind, Arc<dyn RunnerBackend>>,
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
    sink: Arc<dyn LogSink>,
    notifier: Arc<dyn Notifier>,
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.backends.keys().copied().collect();
        kinds.sort();
        f.debug_struct("SessionManager")
            .field("backends", &kinds)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Creates a manager with no registered backends.
    #[must_use]
    pub fn new(sink: Arc<dyn LogSink>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            backends: HashMap::new(),
            sessions: Mutex::new(HashMap::new()),
            sink,
            notifier,
        }
    }

    /// Registers `backend`, replacing any runner for the same kind.
    #[must_use]
    pub fn with_backend(mut self, backend: Arc<dyn RunnerBackend>) -> Self {
        self.backends.insert(backend.kind(), backend);
        self
    }

    /// Starts a run in the background and returns its session id.
    ///
    /// Must be called from within a Tokio runtime. Progress is observable
    /// through the sink and [`SessionManager::subscribe`]. Sessions that
    /// already reached a terminal state are dropped here, so a finished
    /// session stays queryable until the next dispatch.
    ///
    /// # Errors
    ///
    /// Returns [`RunError::NoBackend`] when no runner handles the request's
    /// backend kind.
    pub fn run_playbook(&self, request: ExecutionRequest) -> Result<SessionId, RunError> {
        let backend = self
            .backends
            .get(&request.kind)
            .cloned()
            .ok_or(RunError::NoBackend { kind: request.kind })?;

        let progress = Arc::new(SessionProgress::new(request.kind, Arc::clone(&self.sink)));
        let id = progress.id();
        progress.advance(SessionState::Starting);
        info!(session = %id, kind = %request.kind, playbook = ?request.playbook, "dispatching playbook run");

        let task = tokio::spawn(drive(
            backend,
            request,
            Arc::clone(&progress),
            Arc::clone(&self.notifier),
        ));

        let mut sessions = self.lock_sessions();
        sessions.retain(|_, entry| !entry.progress.state().is_terminal());
        sessions.insert(
            id,
            SessionEntry {
                progress,
                task: Some(task),
            },
        );
        Ok(id)
    }

    /// Interrupts a session and waits until its task has been torn down.
    ///
    /// Any connection lease held by the run is released before this returns.
    pub async fn interrupt(&self, id: SessionId) -> bool {
        let Some((progress, task)) = self
            .lock_sessions()
            .get_mut(&id)
            .map(|entry| (Arc::clone(&entry.progress), entry.task.take()))
        else {
            return false;
        };

        if !progress.advance(SessionState::Interrupted) {
            return false;
        }

        if let Some(handle) = task {
            handle.abort();
            if let Err(err) = handle.await
                && !err.is_cancelled()
            {
                warn!(session = %id, error = %err, "session task failed during cancellation");
            }
        }

        progress
            .sink()
            .append(&format!("[{}] session {id} interrupted", progress.kind()));
        info!(session = %id, "session interrupted");
        true
    }

    /// Current state of a session.
    #[must_use]
    pub fn state(&self, id: SessionId) -> Option<SessionState> {
        self.lock_sessions()
            .get(&id)
            .map(|entry| entry.progress.state())
    }

    /// Subscribes to a session's state changes.
    #[must_use]
    pub fn subscribe(&self, id: SessionId) -> Option<watch::Receiver<SessionState>> {
        self.lock_sessions()
            .get(&id)
            .map(|entry| entry.progress.subscribe())
    }

    /// Waits until the session reaches a terminal state and returns it.
    pub async fn wait(&self, id: SessionId) -> Option<SessionState> {
        let mut receiver = self.subscribe(id)?;
        let state = receiver
            .wait_for(SessionState::is_terminal)
            .await
            .ok()
            .map(|state| state.clone());
        state.or_else(|| self.state(id))
    }

    /// Number of sessions that have not reached a terminal state.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.lock_sessions()
            .values()
            .filter(|entry| !entry.progress.state().is_terminal())
            .count()
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, SessionEntry>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SessionCanceller for SessionManager {
    fn cancel(&self, session: SessionId) -> CancelFuture<'_> {
        Box::pin(self.interrupt(session))
    }
}

async fn drive(
    backend: Arc<dyn RunnerBackend>,
    request: ExecutionRequest,
    progress: Arc<SessionProgress>,
    notifier: Arc<dyn Notifier>,
) {
    let kind = progress.kind();
    let result = backend.run_playbook(&request, &progress).await;
    match result {
        Ok(outcome) => {
            let line = outcome.exit_code.map_or_else(
                || format!("[{kind}] playbook terminated by a signal"),
                |code| format!("[{kind}] playbook finished with exit code {code}"),
            );
            progress.sink().append(&line);
            progress.advance(SessionState::Completed {
                exit_code: outcome.exit_code,
            });
        }
        Err(err) => {
            let message = err.to_string();
            progress
                .sink()
                .append(&format!("[{kind}] playbook run failed: {message}"));
            notifier.notify_error(&message);
            progress.advance(SessionState::Failed { reason: message });
        }
    }
}
