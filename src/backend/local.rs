//! Runs the interpreter installed on the local machine.

use std::sync::Arc;

use tracing::debug;

use super::{
    BackendKind, ExecutionRequest, RunError, RunFuture, RunnerBackend, SessionProgress,
    SessionState,
};
use crate::exec::{CommandRunner, CommandSpec, ProcessOutcome, resolve_program_on_path};

/// Local interpreter runner.
pub struct LocalRunner {
    interpreter: String,
    default_playbook: String,
    runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for LocalRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRunner")
            .field("interpreter", &self.interpreter)
            .field("default_playbook", &self.default_playbook)
            .finish_non_exhaustive()
    }
}

impl LocalRunner {
    /// Creates a runner invoking `interpreter` through `runner`.
    #[must_use]
    pub fn new(
        interpreter: impl Into<String>,
        default_playbook: impl Into<String>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            interpreter: interpreter.into(),
            default_playbook: default_playbook.into(),
            runner,
        }
    }

    async fn execute(
        &self,
        request: &ExecutionRequest,
        progress: &SessionProgress,
    ) -> Result<ProcessOutcome, RunError> {
        let program = resolve_program_on_path(&self.interpreter)?;
        let playbook = request.playbook_path(&self.default_playbook);
        debug!(interpreter = %program, %playbook, "resolved local interpreter");

        let spec = CommandSpec::new(program.as_str())
            .arg(playbook.as_str())
            .current_dir(request.working_dir.clone())
            .envs(&request.env);

        progress.advance(SessionState::Running);
        let outcome = self.runner.run(&spec, progress.sink()).await?;
        Ok(outcome)
    }
}

impl RunnerBackend for LocalRunner {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn run_playbook<'a>(
        &'a self,
        request: &'a ExecutionRequest,
        progress: &'a SessionProgress,
    ) -> RunFuture<'a> {
        Box::pin(self.execute(request, progress))
    }
}
