//! Command description, outcomes, and the runner abstraction.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::process::ExitStatus;

use camino::Utf8PathBuf;
use shell_escape::unix::escape;
use thiserror::Error;

use crate::sink::LogSink;

/// Fully resolved description of an external command.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommandSpec {
    /// Program to execute, either a bare name or a path.
    pub program: String,
    /// Arguments passed verbatim to the program.
    pub args: Vec<OsString>,
    /// Working directory; inherits the caller's when absent.
    pub working_dir: Option<Utf8PathBuf>,
    /// Environment overlay applied on top of the inherited environment.
    pub env: BTreeMap<String, String>,
    /// File fed to the process on stdin; stdin is closed when absent.
    pub stdin: Option<Utf8PathBuf>,
}

impl CommandSpec {
    /// Starts a command for `program` with no arguments.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, value: impl Into<OsString>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(values.into_iter().map(Into::into));
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Feeds the contents of `path` to the process on stdin.
    #[must_use]
    pub fn stdin_file(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.stdin = Some(path.into());
        self
    }

    /// Adds environment variables to the overlay.
    #[must_use]
    pub fn envs(mut self, vars: &BTreeMap<String, String>) -> Self {
        self.env
            .extend(vars.iter().map(|(key, value)| (key.clone(), value.clone())));
        self
    }

    /// Renders the resolved argument list as a shell-like line for audit logs.
    #[must_use]
    pub fn command_line(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(escape(self.program.as_str().into()).into_owned());
        for arg in &self.args {
            let lossy = arg.to_string_lossy();
            parts.push(escape(lossy).into_owned());
        }
        if let Some(path) = &self.stdin {
            parts.push(format!("< {}", escape(path.as_str().into())));
        }
        parts.join(" ")
    }
}

/// Outcome of a process that ran to completion.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ProcessOutcome {
    /// Exit code, absent when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    /// Whether the process ended without reporting an exit code.
    pub signalled: bool,
}

impl ProcessOutcome {
    /// Builds an outcome from an exit code.
    #[must_use]
    pub const fn exited(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            signalled: false,
        }
    }

    /// Builds an outcome for a process terminated by a signal.
    #[must_use]
    pub const fn signalled() -> Self {
        Self {
            exit_code: None,
            signalled: true,
        }
    }

    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.exit_code, Some(0))
    }
}

impl From<ExitStatus> for ProcessOutcome {
    fn from(status: ExitStatus) -> Self {
        status.code().map_or_else(Self::signalled, Self::exited)
    }
}

/// Captured result of a short-lived probe command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

/// Errors raised before or while supervising a process.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ExecError {
    /// The executable could not be found.
    #[error("executable not found: {program}")]
    Launch {
        /// Program that could not be launched.
        program: String,
    },
    /// Spawning or waiting on the process failed for another reason.
    #[error("failed to run {program}: {message}")]
    Io {
        /// Program being supervised.
        program: String,
        /// Operating system error string.
        message: String,
    },
}

impl ExecError {
    pub(crate) fn from_io(program: &str, err: &io::Error) -> Self {
        if err.kind() == io::ErrorKind::NotFound {
            return Self::Launch {
                program: program.to_owned(),
            };
        }
        Self::Io {
            program: program.to_owned(),
            message: err.to_string(),
        }
    }
}

/// Future returned by [`CommandRunner`] operations.
pub type ExecFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ExecError>> + Send + 'a>>;

/// Abstraction over process execution to support fakes in tests.
pub trait CommandRunner: Send + Sync {
    /// Runs the command, streaming stdout and stderr into `sink` line by line.
    ///
    /// A non-zero exit is reported through [`ProcessOutcome`], not as an
    /// error.
    fn run<'a>(&'a self, spec: &'a CommandSpec, sink: &'a dyn LogSink)
    -> ExecFuture<'a, ProcessOutcome>;

    /// Runs the command to completion and captures its output.
    fn capture<'a>(&'a self, spec: &'a CommandSpec) -> ExecFuture<'a, CommandOutput>;
}
