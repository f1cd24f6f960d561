//! Runs the interpreter on a remote host over a pooled SSH connection.

use std::collections::BTreeMap;
use std::sync::Arc;

use shell_escape::unix::escape;
use tracing::{info, warn};

use super::{
    BackendKind, ExecutionRequest, RunError, RunFuture, RunnerBackend, SessionProgress,
    SessionState,
};
use crate::connection::{ConnectionError, ConnectionLease, ConnectionManager, HostSpec};
use crate::exec::ProcessOutcome;
use crate::sync::{SshTransport, SyncEngine, remote_workspace_path};

/// Remote-shell runner.
pub struct RemoteShellRunner {
    host: HostSpec,
    remote_root: String,
    interpreter: String,
    default_playbook: String,
    connections: ConnectionManager,
    auto_sync: Option<Arc<SyncEngine>>,
}

impl std::fmt::Debug for RemoteShellRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteShellRunner")
            .field("host", &self.host)
            .field("remote_root", &self.remote_root)
            .field("interpreter", &self.interpreter)
            .field("auto_sync", &self.auto_sync.is_some())
            .finish_non_exhaustive()
    }
}

impl RemoteShellRunner {
    /// Creates a runner for `host`, placing workspaces below `remote_root`.
    #[must_use]
    pub fn new(
        host: HostSpec,
        remote_root: impl Into<String>,
        connections: ConnectionManager,
    ) -> Self {
        Self {
            host,
            remote_root: remote_root.into(),
            interpreter: String::from("ansible-playbook"),
            default_playbook: String::from("site.yml"),
            connections,
            auto_sync: None,
        }
    }

    /// Overrides the remote interpreter.
    #[must_use]
    pub fn with_interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.interpreter = interpreter.into();
        self
    }

    /// Overrides the playbook used when a request names none.
    #[must_use]
    pub fn with_default_playbook(mut self, playbook: impl Into<String>) -> Self {
        self.default_playbook = playbook.into();
        self
    }

    /// Syncs the workspace through `engine` before every run.
    #[must_use]
    pub fn with_auto_sync(mut self, engine: Arc<SyncEngine>) -> Self {
        self.auto_sync = Some(engine);
        self
    }

    fn remote_dir(&self, request: &ExecutionRequest) -> String {
        let destination = self
            .auto_sync
            .as_ref()
            .and_then(|engine| engine.settings().settings.destination.clone());
        destination
            .unwrap_or_else(|| remote_workspace_path(&self.remote_root, &request.working_dir))
    }

    async fn pre_sync(
        &self,
        request: &ExecutionRequest,
        progress: &SessionProgress,
        remote_dir: &str,
    ) {
        let Some(engine) = &self.auto_sync else {
            return;
        };
        let sink = progress.sink();
        sink.append(&format!(
            "[sync] syncing {} to {}:{remote_dir}",
            request.working_dir, self.host
        ));

        let lease = match self.connections.acquire(&self.host).await {
            Ok(lease) => lease,
            Err(err) => {
                warn!(host = %self.host, error = %err, "pre-run sync could not connect");
                sink.append(&format!("[sync] failed: {err}"));
                return;
            }
        };
        let transport = Arc::new(SshTransport::new(lease, remote_dir));
        match engine
            .sync_workspace(&request.working_dir, transport, false)
            .await
        {
            Ok(result) => {
                result.report(sink);
                if !result.is_success() {
                    warn!(
                        host = %self.host,
                        failures = result.failures.len(),
                        "pre-run sync incomplete; continuing"
                    );
                }
            }
            Err(err) => {
                warn!(host = %self.host, error = %err, "pre-run sync failed; continuing");
                sink.append(&format!("[sync] failed: {err}"));
            }
        }
    }

    fn invocation(
        &self,
        request: &ExecutionRequest,
        remote_dir: &str,
    ) -> Result<String, RunError> {
        let playbook = request.playbook_in_workspace(&self.default_playbook)?;
        Ok(shell_invocation(
            remote_dir,
            &request.env,
            &self.interpreter,
            playbook.as_str(),
        ))
    }

    async fn ensure_remote_dir(
        &self,
        lease: &ConnectionLease,
        remote_dir: &str,
    ) -> Result<(), RunError> {
        let output = lease
            .connection()
            .capture(&format!("mkdir -p {}", escape(remote_dir.into())))
            .await?;
        if output.is_success() {
            return Ok(());
        }
        Err(RunError::from(ConnectionError::Command {
            host: self.host.to_string(),
            message: format!(
                "could not create {remote_dir}: {}",
                output.stderr.trim()
            ),
        }))
    }

    async fn execute(
        &self,
        request: &ExecutionRequest,
        progress: &SessionProgress,
    ) -> Result<ProcessOutcome, RunError> {
        let remote_dir = self.remote_dir(request);
        let command = self.invocation(request, &remote_dir)?;

        let lease = self.connections.acquire(&self.host).await?;
        self.pre_sync(request, progress, &remote_dir).await;
        self.ensure_remote_dir(&lease, &remote_dir).await?;

        info!(host = %self.host, %command, "running remote playbook");
        progress.sink().append(&format!("> {command}"));
        progress.advance(SessionState::Running);
        let outcome = lease.connection().exec(&command, progress.sink()).await?;
        lease.release();
        Ok(outcome)
    }
}

impl RunnerBackend for RemoteShellRunner {
    fn kind(&self) -> BackendKind {
        BackendKind::RemoteShell
    }

    fn run_playbook<'a>(
        &'a self,
        request: &'a ExecutionRequest,
        progress: &'a SessionProgress,
    ) -> RunFuture<'a> {
        Box::pin(self.execute(request, progress))
    }
}

/// Builds `cd <dir> && [env K=V...] <interpreter> <playbook>` with every
/// word shell-escaped.
pub(super) fn shell_invocation(
    remote_dir: &str,
    env: &BTreeMap<String, String>,
    interpreter: &str,
    playbook: &str,
) -> String {
    let mut command = format!("cd {} &&", escape(remote_dir.into()));
    if !env.is_empty() {
        command.push_str(" env");
        for (key, value) in env {
            command.push(' ');
            command.push_str(&escape(format!("{key}={value}").into()));
        }
    }
    command.push(' ');
    command.push_str(&escape(interpreter.into()));
    command.push(' ');
    command.push_str(&escape(playbook.into()));
    command
}
