//! Binary entry point for the `playrun` CLI.

use std::io::{self, Write};
use std::process;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use thiserror::Error;
use tracing::{Level, debug};

use playrun::backend::{
    BackendKind, CloudShellConnector, CloudShellRunner, ContainerRunner, EnvAccountProvider,
    ExecutionRequest, LocalRunner, RemoteShellRunner, RunError, RunnerBackend, SessionManager,
    SessionState,
};
use playrun::config::RunnerConfig;
use playrun::connection::{ConnectionManager, IdentityFileResolver, SshConnector};
use playrun::exec::{CommandRunner, ProcessExecutor};
use playrun::logging::init_logging;
use playrun::sink::{LogSink, Notifier, TracingNotifier, WriterSink};
use playrun::sync::{
    FingerprintCache, SshTransportFactory, SyncEngine, Transport, TransportFactory,
};

mod cli;

use cli::{BackendArg, Cli, CommonArgs, CopyCommand, LogLevel, RunCommand, SyncCommand};

/// Exit code reported when a run is interrupted with Ctrl-C.
const INTERRUPTED_EXIT_CODE: i32 = 130;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("run failed: {0}")]
    Run(#[from] RunError),
    #[error("sync failed: {0}")]
    Sync(String),
}

/// Shared wiring for every subcommand.
struct Context {
    config: RunnerConfig,
    workspace: Utf8PathBuf,
    sink: Arc<dyn LogSink>,
    notifier: Arc<dyn Notifier>,
    sync: Arc<SyncEngine>,
    runner: Arc<dyn CommandRunner>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let level = common_args(&cli).log_level.map(level_from_log_level);
    if let Err(err) = init_logging(level) {
        writeln!(io::stderr(), "{err}").ok();
    }

    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    match cli {
        Cli::Run(command) => run_command(command).await,
        Cli::Sync(command) => sync_command(command).await,
        Cli::Copy(command) => copy_command(command).await,
    }
}

const fn common_args(cli: &Cli) -> &CommonArgs {
    match cli {
        Cli::Run(command) => &command.common,
        Cli::Sync(command) => &command.common,
        Cli::Copy(command) => &command.common,
    }
}

const fn level_from_log_level(level: LogLevel) -> Level {
    match level {
        LogLevel::Error => Level::ERROR,
        LogLevel::Warn => Level::WARN,
        LogLevel::Info => Level::INFO,
        LogLevel::Debug => Level::DEBUG,
        LogLevel::Trace => Level::TRACE,
    }
}

const fn backend_kind(arg: BackendArg) -> BackendKind {
    match arg {
        BackendArg::Local => BackendKind::Local,
        BackendArg::Container => BackendKind::Container,
        BackendArg::Ssh => BackendKind::RemoteShell,
        BackendArg::CloudShell => BackendKind::CloudShell,
    }
}

fn config_error(err: impl std::fmt::Display) -> CliError {
    CliError::Config(err.to_string())
}

fn load_context(common: &CommonArgs) -> Result<Context, CliError> {
    let config = RunnerConfig::load_without_cli_args().map_err(config_error)?;
    config.validate().map_err(config_error)?;
    let workspace = resolve_workspace(common.workspace.as_deref())?;

    let sink: Arc<dyn LogSink> = Arc::new(WriterSink::stdout());
    let notifier: Arc<dyn Notifier> = Arc::new(TracingNotifier);
    let sync = Arc::new(SyncEngine::new(
        FingerprintCache::global(),
        config.sync_concurrency,
    ));
    // Bad sync settings leave the engine on its disabled defaults.
    let applied = config
        .sync_settings_value()
        .map_err(|err| err.to_string())
        .and_then(|settings| sync.apply_settings(&settings).map_err(|err| err.to_string()));
    if let Err(err) = applied {
        let message = format!("[sync] {err}; syncing disabled");
        sink.append(&message);
        notifier.notify_error(&message);
    }

    Ok(Context {
        config,
        workspace,
        sink,
        notifier,
        sync,
        runner: Arc::new(ProcessExecutor),
    })
}

fn resolve_workspace(raw: Option<&str>) -> Result<Utf8PathBuf, CliError> {
    let cwd = std::env::current_dir().map_err(config_error)?;
    let base = Utf8PathBuf::from_path_buf(cwd)
        .map_err(|path| CliError::Config(format!("non UTF-8 directory: {}", path.display())))?;
    let workspace = raw.map_or_else(|| base.clone(), |dir| base.join(dir));
    if !workspace.is_dir() {
        return Err(CliError::InvalidArgument(format!(
            "workspace {workspace} is not a directory"
        )));
    }
    Ok(workspace)
}

fn ssh_connections(context: &Context) -> ConnectionManager {
    ConnectionManager::new(
        SshConnector::new(
            context.config.ssh_options(),
            context.config.control_dir(),
            Arc::clone(&context.runner),
        ),
        IdentityFileResolver,
    )
}

fn build_backend(kind: BackendKind, context: &Context) -> Result<Arc<dyn RunnerBackend>, CliError> {
    let config = &context.config;
    let backend: Arc<dyn RunnerBackend> = match kind {
        BackendKind::Local => Arc::new(LocalRunner::new(
            config.interpreter.as_str(),
            config.default_playbook.as_str(),
            Arc::clone(&context.runner),
        )),
        BackendKind::Container => Arc::new(
            ContainerRunner::new(
                config.container_runtime.as_str(),
                config.container_image.as_str(),
                Arc::clone(&context.runner),
            )
            .with_mount_path(config.container_mount_path.as_str())
            .with_interpreter(config.interpreter.as_str())
            .with_default_playbook(config.default_playbook.as_str()),
        ),
        BackendKind::RemoteShell => {
            let host = config.ssh_host_spec().map_err(config_error)?;
            let runner = RemoteShellRunner::new(
                host,
                config.remote_root.as_str(),
                ssh_connections(context),
            )
            .with_interpreter(config.interpreter.as_str())
            .with_default_playbook(config.default_playbook.as_str());
            if config.auto_sync {
                Arc::new(runner.with_auto_sync(Arc::clone(&context.sync)))
            } else {
                Arc::new(runner)
            }
        }
        BackendKind::CloudShell => {
            let connections = ConnectionManager::new(
                CloudShellConnector::new(
                    config.cloud_shell_bin.as_str(),
                    Arc::clone(&context.runner),
                ),
                IdentityFileResolver,
            );
            Arc::new(
                CloudShellRunner::new(Arc::new(EnvAccountProvider), connections)
                    .with_interpreter(config.interpreter.as_str())
                    .with_default_playbook(config.default_playbook.as_str()),
            )
        }
    };
    Ok(backend)
}

fn parse_env(pairs: &[String]) -> Result<Vec<(String, String)>, CliError> {
    pairs
        .iter()
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok((key.trim().to_owned(), value.to_owned()))
            }
            _ => Err(CliError::InvalidArgument(format!(
                "expected KEY=VALUE, got {pair}"
            ))),
        })
        .collect()
}

fn exit_code_for(state: Option<&SessionState>) -> i32 {
    match state {
        Some(SessionState::Completed {
            exit_code: Some(code),
        }) => *code,
        Some(SessionState::Interrupted) => INTERRUPTED_EXIT_CODE,
        _ => 1,
    }
}

async fn run_command(args: RunCommand) -> Result<i32, CliError> {
    let env = parse_env(&args.env)?;
    let context = load_context(&args.common)?;
    let kind = backend_kind(args.backend);
    let backend = build_backend(kind, &context)?;
    let sessions = SessionManager::new(Arc::clone(&context.sink), Arc::clone(&context.notifier))
        .with_backend(backend);

    let request = env.into_iter().fold(
        ExecutionRequest::new(kind, context.workspace.clone())
            .with_playbook(args.playbook.map(Utf8PathBuf::from)),
        |request, (key, value)| request.with_env(key, value),
    );
    let session = sessions.run_playbook(request)?;

    let state = tokio::select! {
        state = sessions.wait(session) => state,
        _ = tokio::signal::ctrl_c() => {
            debug!(%session, "interrupt requested");
            sessions.interrupt(session).await;
            sessions.state(session)
        }
    };
    Ok(exit_code_for(state.as_ref()))
}

async fn open_transport(context: &Context) -> Result<Arc<dyn Transport>, CliError> {
    let host = context.config.ssh_host_spec().map_err(config_error)?;
    let factory = SshTransportFactory::new(
        ssh_connections(context),
        host,
        context.config.remote_root.as_str(),
    );
    let settings = context.sync.settings();
    factory
        .open(&context.workspace, settings.settings.destination.as_deref())
        .await
        .map_err(|err| CliError::Sync(err.to_string()))
}

async fn sync_command(args: SyncCommand) -> Result<i32, CliError> {
    let context = load_context(&args.common)?;
    let transport = open_transport(&context).await?;
    let result = context
        .sync
        .sync_workspace(&context.workspace, transport, args.delete)
        .await
        .map_err(|err| CliError::Sync(err.to_string()))?;
    result.report(context.sink.as_ref());
    Ok(i32::from(!result.is_success()))
}

async fn copy_command(args: CopyCommand) -> Result<i32, CliError> {
    let context = load_context(&args.common)?;
    let path = absolute_in(&context.workspace, &args.path);
    if let Err(reason) = context.sync.copy_decision(&context.workspace, &path) {
        context.sink.append(&format!("[sync] skipped {path}: {reason}"));
        return Ok(0);
    }
    let transport = open_transport(&context).await?;
    let result = context
        .sync
        .copy_file(&context.workspace, &path, transport)
        .await;
    result.report(context.sink.as_ref());
    Ok(i32::from(!result.is_success()))
}

fn absolute_in(workspace: &Utf8Path, raw: &str) -> Utf8PathBuf {
    let path = Utf8Path::new(raw);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace.join(path)
    }
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
