//! Spawning and supervising external commands.
//!
//! [`ProcessExecutor`] launches one process per call, logs the resolved
//! argument list before spawning, and streams stdout and stderr into a
//! [`LogSink`] as lines arrive. It never retries; callers own that policy.

use std::ffi::OsStr;
use std::process::Stdio;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::sink::LogSink;

mod types;

pub use types::{CommandOutput, CommandRunner, CommandSpec, ExecError, ExecFuture, ProcessOutcome};

/// Real command runner backed by `tokio::process`.
///
/// Children are spawned with `kill_on_drop`, so dropping a running future
/// (for example when a session is cancelled) terminates the process.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessExecutor;

impl ProcessExecutor {
    fn command(spec: &CommandSpec) -> Command {
        let mut command = Command::new(&spec.program);
        command.args(&spec.args).envs(&spec.env).kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }
        command
    }

    fn stdin(spec: &CommandSpec) -> Result<Stdio, ExecError> {
        let Some(path) = &spec.stdin else {
            return Ok(Stdio::null());
        };
        std::fs::File::open(path)
            .map(Stdio::from)
            .map_err(|err| ExecError::Io {
                program: spec.program.clone(),
                message: format!("cannot open {path} for stdin: {err}"),
            })
    }

    async fn run_streaming(
        spec: &CommandSpec,
        sink: &dyn LogSink,
    ) -> Result<ProcessOutcome, ExecError> {
        let line = spec.command_line();
        info!(program = %spec.program, command = %line, "spawning process");
        sink.append(&format!("> {line}"));

        let mut child = Self::command(spec)
            .stdin(Self::stdin(spec)?)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| ExecError::from_io(&spec.program, &err))?;

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx.clone()));
        }
        drop(tx);

        while let Some(output_line) = rx.recv().await {
            sink.append(&output_line);
        }

        let status = child
            .wait()
            .await
            .map_err(|err| ExecError::from_io(&spec.program, &err))?;
        let outcome = ProcessOutcome::from(status);
        info!(
            program = %spec.program,
            exit_code = ?outcome.exit_code,
            signalled = outcome.signalled,
            "process exited"
        );
        Ok(outcome)
    }

    async fn run_captured(spec: &CommandSpec) -> Result<CommandOutput, ExecError> {
        debug!(command = %spec.command_line(), "running probe command");
        let output = Self::command(spec)
            .stdin(Self::stdin(spec)?)
            .output()
            .await
            .map_err(|err| ExecError::from_io(&spec.program, &err))?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

impl CommandRunner for ProcessExecutor {
    fn run<'a>(
        &'a self,
        spec: &'a CommandSpec,
        sink: &'a dyn LogSink,
    ) -> ExecFuture<'a, ProcessOutcome> {
        Box::pin(Self::run_streaming(spec, sink))
    }

    fn capture<'a>(&'a self, spec: &'a CommandSpec) -> ExecFuture<'a, CommandOutput> {
        Box::pin(Self::run_captured(spec))
    }
}

async fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let decoded = String::from_utf8_lossy(&buf);
                let line = decoded.trim_end_matches(['\n', '\r']).to_owned();
                if tx.send(line).is_err() {
                    break;
                }
            }
            Err(err) => {
                debug!(error = %err, "output stream closed with an error");
                break;
            }
        }
    }
}

/// Resolves `program` to an executable path.
///
/// Names containing a path separator are checked for existence directly;
/// bare names are searched for in `search_path` (normally the `PATH`
/// variable).
///
/// # Errors
///
/// Returns [`ExecError::Launch`] when no matching file exists.
pub fn resolve_program(
    program: &str,
    search_path: Option<&OsStr>,
) -> Result<Utf8PathBuf, ExecError> {
    let not_found = || ExecError::Launch {
        program: program.to_owned(),
    };

    if program.trim().is_empty() {
        return Err(not_found());
    }

    if program.contains('/') {
        let candidate = Utf8Path::new(program);
        return if candidate.is_file() {
            Ok(candidate.to_path_buf())
        } else {
            Err(not_found())
        };
    }

    let search_path = search_path.ok_or_else(not_found)?;
    std::env::split_paths(search_path)
        .filter_map(|dir| Utf8PathBuf::from_path_buf(dir).ok())
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
        .ok_or_else(not_found)
}

/// Resolves `program` against the current process `PATH`.
///
/// # Errors
///
/// Returns [`ExecError::Launch`] when the program cannot be found.
pub fn resolve_program_on_path(program: &str) -> Result<Utf8PathBuf, ExecError> {
    let path = std::env::var_os("PATH");
    resolve_program(program, path.as_deref())
}
