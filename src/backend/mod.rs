//! Playbook runners for the supported execution targets.
//!
//! Every target implements [`RunnerBackend`]; the [`SessionManager`] drives
//! them through one shared lifecycle (`Idle → Starting → [Provisioning →]
//! Running → {Completed, Failed, Interrupted}`) and owns the resulting
//! sessions.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

use crate::connection::ConnectionError;
use crate::exec::{ExecError, ProcessOutcome};

mod cloud_shell;
mod container;
mod local;
mod remote;
mod session;

pub use cloud_shell::{
    Account, AccountProvider, CLOUD_ACCOUNT_ENV, CloudShellConnector, CloudShellRunner,
    EnvAccountProvider, cloud_shell_host,
};
pub use container::ContainerRunner;
pub use local::LocalRunner;
pub use remote::RemoteShellRunner;
pub use session::{
    CancelFuture, SessionCanceller, SessionId, SessionManager, SessionProgress, SessionState,
};

/// Execution target for a playbook run.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum BackendKind {
    /// Interpreter installed on the local machine.
    Local,
    /// Interpreter inside a container image.
    Container,
    /// Interpreter on a remote host reached over SSH.
    RemoteShell,
    /// Interpreter inside a managed cloud shell.
    CloudShell,
}

impl BackendKind {
    /// Stable lowercase identifier used in configuration and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Container => "container",
            Self::RemoteShell => "ssh",
            Self::CloudShell => "cloud-shell",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "container" | "docker" => Ok(Self::Container),
            "ssh" | "remote" | "remote-shell" => Ok(Self::RemoteShell),
            "cloud-shell" | "cloudshell" => Ok(Self::CloudShell),
            other => Err(format!(
                "unknown backend {other} (expected local, container, ssh, or cloud-shell)"
            )),
        }
    }
}

/// A single user-triggered playbook run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExecutionRequest {
    /// Target backend.
    pub kind: BackendKind,
    /// Playbook to run; `None` selects the workspace default.
    pub playbook: Option<Utf8PathBuf>,
    /// Workspace directory the run is rooted in.
    pub working_dir: Utf8PathBuf,
    /// Environment overlay passed to the interpreter.
    pub env: BTreeMap<String, String>,
}

impl ExecutionRequest {
    /// Creates a request for the workspace default playbook.
    #[must_use]
    pub fn new(kind: BackendKind, working_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            kind,
            playbook: None,
            working_dir: working_dir.into(),
            env: BTreeMap::new(),
        }
    }

    /// Selects an explicit playbook.
    #[must_use]
    pub fn with_playbook(mut self, playbook: Option<Utf8PathBuf>) -> Self {
        self.playbook = playbook;
        self
    }

    /// Adds one environment variable to the overlay.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Absolute path of the playbook, falling back to `default_playbook`.
    #[must_use]
    pub fn playbook_path(&self, default_playbook: &str) -> Utf8PathBuf {
        let chosen = self
            .playbook
            .clone()
            .unwrap_or_else(|| Utf8PathBuf::from(default_playbook));
        if chosen.is_absolute() {
            chosen
        } else {
            self.working_dir.join(chosen)
        }
    }

    /// Playbook path relative to the workspace.
    ///
    /// # Errors
    ///
    /// Returns [`RunError::InvalidRequest`] when the playbook lies outside
    /// the working directory.
    pub fn playbook_in_workspace(&self, default_playbook: &str) -> Result<Utf8PathBuf, RunError> {
        let absolute = self.playbook_path(default_playbook);
        absolute
            .strip_prefix(&self.working_dir)
            .map(Utf8Path::to_path_buf)
            .map_err(|_| RunError::InvalidRequest {
                message: format!(
                    "playbook {absolute} is outside the workspace {}",
                    self.working_dir
                ),
            })
    }
}

/// Errors that abort a single playbook run.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RunError {
    /// The interpreter or a required executable is missing.
    #[error("executable not found: {program}")]
    Launch {
        /// Program that could not be launched.
        program: String,
    },
    /// A required runtime (for example the container engine) is unreachable.
    #[error("{runtime} is unavailable: {message}")]
    EnvironmentUnavailable {
        /// Runtime that was probed.
        runtime: String,
        /// Probe failure details.
        message: String,
    },
    /// Credential or account resolution failed.
    #[error("authentication failed: {message}")]
    Auth {
        /// Description of the failure.
        message: String,
    },
    /// The remote session was unreachable or dropped.
    #[error(transparent)]
    Connection(ConnectionError),
    /// Supervising the process failed after launch.
    #[error("process failure: {message}")]
    Process {
        /// Description of the failure.
        message: String,
    },
    /// The request cannot be honoured by the chosen backend.
    #[error("invalid run request: {message}")]
    InvalidRequest {
        /// Description of the problem.
        message: String,
    },
    /// No runner is registered for the requested backend.
    #[error("no runner registered for backend {kind}")]
    NoBackend {
        /// Backend that was requested.
        kind: BackendKind,
    },
}

impl From<ExecError> for RunError {
    fn from(value: ExecError) -> Self {
        match value {
            ExecError::Launch { program } => Self::Launch { program },
            ExecError::Io { program, message } => Self::Process {
                message: format!("{program}: {message}"),
            },
        }
    }
}

impl From<ConnectionError> for RunError {
    fn from(value: ConnectionError) -> Self {
        match value {
            ConnectionError::Auth { host, message } => Self::Auth {
                message: format!("{host}: {message}"),
            },
            other => Self::Connection(other),
        }
    }
}

/// Future returned by [`RunnerBackend::run_playbook`].
pub type RunFuture<'a> = Pin<Box<dyn Future<Output = Result<ProcessOutcome, RunError>> + Send + 'a>>;

/// Capability shared by every execution target.
pub trait RunnerBackend: Send + Sync {
    /// Backend this runner implements.
    fn kind(&self) -> BackendKind;

    /// Runs the requested playbook, reporting lifecycle changes through
    /// `progress` and output through its sink.
    ///
    /// Implementations must advance `progress` to
    /// [`SessionState::Running`] immediately before the interpreter starts.
    fn run_playbook<'a>(
        &'a self,
        request: &'a ExecutionRequest,
        progress: &'a SessionProgress,
    ) -> RunFuture<'a>;
}

#[cfg(test)]
mod tests;
