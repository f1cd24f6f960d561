//! Runs the interpreter inside a container image.
//!
//! The workspace is bind-mounted read-write at a fixed path inside the
//! container and the playbook is addressed relative to that mount. A runtime
//! that cannot be reached fails the run; there is no fallback to the local
//! interpreter.

use std::sync::Arc;

use tracing::{debug, warn};

use super::{
    BackendKind, ExecutionRequest, RunError, RunFuture, RunnerBackend, SessionProgress,
    SessionState,
};
use crate::exec::{CommandRunner, CommandSpec, ExecError, ProcessOutcome};

/// Container image runner.
pub struct ContainerRunner {
    runtime: String,
    image: String,
    mount_path: String,
    interpreter: String,
    default_playbook: String,
    runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for ContainerRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerRunner")
            .field("runtime", &self.runtime)
            .field("image", &self.image)
            .field("mount_path", &self.mount_path)
            .field("interpreter", &self.interpreter)
            .finish_non_exhaustive()
    }
}

impl ContainerRunner {
    /// Creates a runner for `image` using the given container runtime.
    #[must_use]
    pub fn new(
        runtime: impl Into<String>,
        image: impl Into<String>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            runtime: runtime.into(),
            image: image.into(),
            mount_path: String::from("/workspace"),
            interpreter: String::from("ansible-playbook"),
            default_playbook: String::from("site.yml"),
            runner,
        }
    }

    /// Overrides the mount point of the workspace inside the container.
    #[must_use]
    pub fn with_mount_path(mut self, mount_path: impl Into<String>) -> Self {
        self.mount_path = mount_path.into();
        self
    }

    /// Overrides the interpreter invoked inside the container.
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

    fn unavailable(&self, message: impl Into<String>) -> RunError {
        RunError::EnvironmentUnavailable {
            runtime: self.runtime.clone(),
            message: message.into(),
        }
    }

    async fn probe_runtime(&self) -> Result<(), RunError> {
        let spec =
            CommandSpec::new(&self.runtime).args(["version", "--format", "{{.Server.Version}}"]);
        let output = match self.runner.capture(&spec).await {
            Ok(output) => output,
            Err(ExecError::Launch { .. }) => {
                return Err(self.unavailable("runtime executable not found"));
            }
            Err(err) => return Err(self.unavailable(err.to_string())),
        };

        if output.is_success() {
            debug!(
                runtime = %self.runtime,
                version = %output.stdout.trim(),
                "container runtime reachable"
            );
            return Ok(());
        }

        let detail = output.stderr.trim();
        warn!(
            runtime = %self.runtime,
            code = ?output.code,
            stderr = %detail,
            "container runtime probe failed"
        );
        Err(self.unavailable(if detail.is_empty() {
            format!("probe exited with {:?}", output.code)
        } else {
            detail.to_owned()
        }))
    }

    fn run_spec(&self, request: &ExecutionRequest) -> Result<CommandSpec, RunError> {
        let playbook = request.playbook_in_workspace(&self.default_playbook)?;
        let mut spec = CommandSpec::new(&self.runtime)
            .args(["run", "--rm", "-v"])
            .arg(format!("{}:{}", request.working_dir, self.mount_path))
            .arg("-w")
            .arg(self.mount_path.as_str());
        for (key, value) in &request.env {
            spec = spec.arg("-e").arg(format!("{key}={value}"));
        }
        Ok(spec
            .arg(self.image.as_str())
            .arg(self.interpreter.as_str())
            .arg(playbook.as_str()))
    }

    async fn execute(
        &self,
        request: &ExecutionRequest,
        progress: &SessionProgress,
    ) -> Result<ProcessOutcome, RunError> {
        let spec = self.run_spec(request)?;
        self.probe_runtime().await?;

        progress.advance(SessionState::Running);
        let outcome = self.runner.run(&spec, progress.sink()).await?;
        Ok(outcome)
    }
}

impl RunnerBackend for ContainerRunner {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    fn run_playbook<'a>(
        &'a self,
        request: &'a ExecutionRequest,
        progress: &'a SessionProgress,
    ) -> RunFuture<'a> {
        Box::pin(self.execute(request, progress))
    }
}
