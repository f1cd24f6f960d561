//! Single inbound event channel for the trigger surface.
//!
//! Every trigger kind (run commands, explicit syncs, configuration changes,
//! file saves, terminal closes) arrives as one [`CoreEvent`]. The loop hands
//! each event to its own task so a slow sync never delays a terminal close.
//! Configuration changes, run dispatch and terminal registration happen on
//! the loop itself, so a later `TerminalClosed` always finds the session it
//! refers to.

use std::fmt;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::backend::{BackendKind, ExecutionRequest, SessionId, SessionManager};
use crate::sink::{LogSink, Notifier};
use crate::sync::{SyncEngine, TransportFactory};
use crate::terminal::{TerminalId, TerminalRegistry};

/// Capacity of the inbound event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Trigger delivered to the core.
#[derive(Clone, Debug, PartialEq)]
pub enum CoreEvent {
    /// Run a playbook; `None` selects the workspace default.
    Run {
        /// Backend to run on.
        kind: BackendKind,
        /// Playbook to run.
        playbook: Option<Utf8PathBuf>,
        /// Terminal that will display the run.
        terminal: Option<TerminalId>,
    },
    /// Sync the whole workspace to the configured destination.
    SyncWorkspace {
        /// Remove destination files missing locally.
        delete_orphans: bool,
    },
    /// New raw sync settings.
    ConfigurationChanged(Value),
    /// A file was saved.
    FileSaved(Utf8PathBuf),
    /// A terminal closed.
    TerminalClosed(TerminalId),
    /// Correlate an existing session with a terminal.
    RegisterTerminal {
        /// Terminal displaying the session.
        terminal: TerminalId,
        /// Session being displayed.
        session: SessionId,
    },
}

/// Components the event loop dispatches to.
pub struct Core {
    workspace: Utf8PathBuf,
    sessions: Arc<SessionManager>,
    terminals: Arc<TerminalRegistry>,
    sync: Arc<SyncEngine>,
    transports: Option<Arc<dyn TransportFactory>>,
    sink: Arc<dyn LogSink>,
    notifier: Arc<dyn Notifier>,
}

impl fmt::Debug for Core {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Core")
            .field("workspace", &self.workspace)
            .field("sessions", &self.sessions)
            .field("terminals", &self.terminals)
            .field("sync", &self.sync)
            .field("transports", &self.transports.is_some())
            .finish_non_exhaustive()
    }
}

/// Collaborators handed to [`Core::new`].
pub struct CoreParts {
    /// Workspace root.
    pub workspace: Utf8PathBuf,
    /// Session manager owning backend runs.
    pub sessions: Arc<SessionManager>,
    /// Terminal correlation table.
    pub terminals: Arc<TerminalRegistry>,
    /// Sync engine.
    pub sync: Arc<SyncEngine>,
    /// Destination opener; `None` disables syncing.
    pub transports: Option<Arc<dyn TransportFactory>>,
    /// Progress sink.
    pub sink: Arc<dyn LogSink>,
    /// User-visible notifications.
    pub notifier: Arc<dyn Notifier>,
}

impl Core {
    /// Assembles the core.
    #[must_use]
    pub fn new(parts: CoreParts) -> Self {
        let CoreParts {
            workspace,
            sessions,
            terminals,
            sync,
            transports,
            sink,
            notifier,
        } = parts;
        Self {
            workspace,
            sessions,
            terminals,
            sync,
            transports,
            sink,
            notifier,
        }
    }

    /// Workspace root.
    #[must_use]
    pub fn workspace(&self) -> &Utf8Path {
        &self.workspace
    }

    /// Session manager.
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Terminal registry.
    #[must_use]
    pub fn terminals(&self) -> &Arc<TerminalRegistry> {
        &self.terminals
    }

    /// Sync engine.
    #[must_use]
    pub fn sync(&self) -> &Arc<SyncEngine> {
        &self.sync
    }

    fn fail(&self, message: &str) {
        self.sink.append(message);
        self.notifier.notify_error(message);
    }

    /// Handles one event to completion.
    ///
    /// For runs this waits until the session ends, then drops its terminal
    /// correlation.
    pub async fn handle(&self, event: CoreEvent) {
        debug!(?event, "handling core event");
        match event {
            CoreEvent::Run {
                kind,
                playbook,
                terminal,
            } => {
                if let Some(session) = self.start_run(kind, playbook, terminal.as_ref()) {
                    self.settle(session).await;
                }
            }
            CoreEvent::SyncWorkspace { delete_orphans } => {
                self.sync_workspace(delete_orphans).await;
            }
            CoreEvent::ConfigurationChanged(value) => self.configure(&value),
            CoreEvent::FileSaved(path) => self.file_saved(&path).await,
            CoreEvent::TerminalClosed(terminal) => {
                self.terminals.on_terminal_closed(&terminal).await;
            }
            CoreEvent::RegisterTerminal { terminal, session } => {
                self.terminals.register(terminal, session);
            }
        }
    }

    /// Dispatches a run and correlates it with `terminal`.
    ///
    /// Returns the session only when a terminal was given, since only then
    /// is there a correlation to drop once the run ends.
    fn start_run(
        &self,
        kind: BackendKind,
        playbook: Option<Utf8PathBuf>,
        terminal: Option<&TerminalId>,
    ) -> Option<SessionId> {
        let request =
            ExecutionRequest::new(kind, self.workspace.clone()).with_playbook(playbook);
        let session = match self.sessions.run_playbook(request) {
            Ok(session) => session,
            Err(err) => {
                self.fail(&format!("[{kind}] {err}"));
                return None;
            }
        };
        let terminal_id = terminal?;
        self.terminals.register(terminal_id.clone(), session);
        Some(session)
    }

    async fn settle(&self, session: SessionId) {
        let outcome = self.sessions.wait(session).await;
        debug!(%session, ?outcome, "session settled");
        self.terminals.forget_session(session);
    }

    async fn sync_workspace(&self, delete_orphans: bool) {
        let Some(factory) = &self.transports else {
            self.fail("[sync] no sync destination is configured");
            return;
        };
        let settings = self.sync.settings();
        let transport = match factory
            .open(&self.workspace, settings.settings.destination.as_deref())
            .await
        {
            Ok(transport) => transport,
            Err(err) => {
                self.fail(&format!("[sync] failed: {err}"));
                return;
            }
        };
        match self
            .sync
            .sync_workspace(&self.workspace, transport, delete_orphans)
            .await
        {
            Ok(result) => {
                result.report(self.sink.as_ref());
                if !result.is_success() {
                    self.notifier.notify_error(&format!(
                        "workspace sync finished with {} failed file(s)",
                        result.failures.len()
                    ));
                }
            }
            Err(err) => self.fail(&format!("[sync] failed: {err}")),
        }
    }

    fn configure(&self, value: &Value) {
        if let Err(err) = self.sync.apply_settings(value) {
            self.fail(&format!("[sync] {err}; syncing disabled"));
        }
    }

    async fn file_saved(&self, path: &Utf8Path) {
        if let Err(reason) = self.sync.copy_decision(&self.workspace, path) {
            debug!(%path, %reason, "save not synced");
            return;
        }
        let Some(factory) = &self.transports else {
            return;
        };
        let settings = self.sync.settings();
        let transport = match factory
            .open(&self.workspace, settings.settings.destination.as_deref())
            .await
        {
            Ok(transport) => transport,
            Err(err) => {
                self.fail(&format!("[sync] failed to copy {path}: {err}"));
                return;
            }
        };
        let result = self.sync.copy_file(&self.workspace, path, transport).await;
        if result.is_success() {
            if !result.transferred.is_empty() {
                result.report(self.sink.as_ref());
            }
        } else {
            result.report(self.sink.as_ref());
            self.notifier
                .notify_error(&format!("failed to copy {path} to the sync destination"));
        }
    }
}

/// Spawns the dispatch loop and returns its sender and handle.
///
/// The loop ends once every sender is dropped; events already dispatched
/// keep running in their own tasks.
#[must_use]
pub fn spawn_event_loop(core: Arc<Core>) -> (mpsc::Sender<CoreEvent>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<CoreEvent>(EVENT_CHANNEL_CAPACITY);
    let handle = tokio::spawn(async move {
        info!(workspace = %core.workspace(), "core event loop started");
        while let Some(event) = rx.recv().await {
            match event {
                CoreEvent::ConfigurationChanged(value) => core.configure(&value),
                CoreEvent::RegisterTerminal { terminal, session } => {
                    core.terminals.register(terminal, session);
                }
                CoreEvent::Run {
                    kind,
                    playbook,
                    terminal,
                } => {
                    if let Some(session) = core.start_run(kind, playbook, terminal.as_ref()) {
                        let worker = Arc::clone(&core);
                        tokio::spawn(async move { worker.settle(session).await });
                    }
                }
                other => {
                    let worker = Arc::clone(&core);
                    tokio::spawn(async move { worker.handle(other).await });
                }
            }
        }
        info!("core event channel closed");
    });
    (tx, handle)
}
