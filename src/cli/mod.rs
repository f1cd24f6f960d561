//! Command-line interface definitions for the `playrun` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Args, Parser, ValueEnum};

/// Top-level CLI for the `playrun` binary.
#[derive(Debug, Parser)]
#[command(
    name = "playrun",
    about = "Run playbooks locally, in a container, over SSH, or in a cloud shell",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Run a playbook on the selected backend.
    #[command(name = "run", about = "Run a playbook on the selected backend")]
    Run(RunCommand),
    /// Sync the workspace to the configured SSH destination.
    #[command(name = "sync", about = "Sync the workspace to the remote host")]
    Sync(SyncCommand),
    /// Copy one saved file to the configured SSH destination.
    #[command(name = "copy", about = "Copy one file to the remote host")]
    Copy(CopyCommand),
}

/// Options shared by every subcommand.
#[derive(Debug, Args)]
pub(crate) struct CommonArgs {
    /// Workspace root; defaults to the current directory.
    #[arg(long, value_name = "DIR")]
    pub(crate) workspace: Option<String>,
    /// Diagnostic log level; overrides `PLAYRUN_LOG`.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub(crate) log_level: Option<LogLevel>,
}

/// Arguments for the `playrun run` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct RunCommand {
    /// Backend executing the playbook.
    #[arg(long, short, value_enum, default_value_t = BackendArg::Local)]
    pub(crate) backend: BackendArg,
    /// Extra environment for the interpreter, as KEY=VALUE.
    #[arg(long = "env", short = 'e', value_name = "KEY=VALUE")]
    pub(crate) env: Vec<String>,
    /// Playbook to run; defaults to the configured default playbook.
    #[arg(value_name = "PLAYBOOK")]
    pub(crate) playbook: Option<String>,
    #[command(flatten)]
    pub(crate) common: CommonArgs,
}

/// Arguments for the `playrun sync` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct SyncCommand {
    /// Remove remote files that no longer exist locally.
    #[arg(long)]
    pub(crate) delete: bool,
    #[command(flatten)]
    pub(crate) common: CommonArgs,
}

/// Arguments for the `playrun copy` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct CopyCommand {
    /// File to copy, absolute or relative to the workspace.
    #[arg(value_name = "PATH")]
    pub(crate) path: String,
    #[command(flatten)]
    pub(crate) common: CommonArgs,
}

/// Backends selectable from the command line.
#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub(crate) enum BackendArg {
    /// Interpreter on this machine.
    Local,
    /// Interpreter inside a container image.
    Container,
    /// Interpreter on the configured SSH host.
    Ssh,
    /// Interpreter inside a provisioned cloud shell.
    CloudShell,
}

/// Log levels accepted by `--log-level`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub(crate) enum LogLevel {
    /// Errors only.
    Error,
    /// Warnings and errors.
    Warn,
    /// Informational messages.
    Info,
    /// Debug output.
    Debug,
    /// Everything.
    Trace,
}
