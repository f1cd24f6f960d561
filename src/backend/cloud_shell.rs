//! Runs the interpreter inside a managed cloud shell.
//!
//! Shells are opened through a launcher executable on behalf of the
//! signed-in account. The launcher protocol is:
//!
//! * `connect --account <name> --tenant <tenant>` prints a session id,
//! * `status --session <id>` exits zero while the shell is up,
//! * `exec --session <id> -- sh -c <command>` runs a command,
//! * `upload --session <id> <local> <remote>` copies a file in,
//! * `disconnect --session <id>` tears the shell down.
//!
//! Opening a shell is slow, so runs report [`SessionState::Provisioning`]
//! until the connection is up.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use camino::Utf8Path;
use shell_escape::unix::escape;
use tracing::{debug, info, warn};

use super::remote::shell_invocation;
use super::{
    BackendKind, ExecutionRequest, RunError, RunFuture, RunnerBackend, SessionProgress,
    SessionState,
};
use crate::connection::{
    ConnectionError, ConnectionFuture, ConnectionManager, Connector, Credentials, HostSpec,
    RemoteConnection,
};
use crate::exec::{CommandOutput, CommandRunner, CommandSpec, ProcessOutcome};
use crate::sink::LogSink;

/// Environment variable naming the signed-in cloud account.
pub const CLOUD_ACCOUNT_ENV: &str = "PLAYRUN_CLOUD_ACCOUNT";

const DEFAULT_TENANT: &str = "default";

/// Signed-in cloud account.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Account {
    /// Account (user) name.
    pub name: String,
    /// Tenant or directory the account belongs to.
    pub tenant: Option<String>,
}

impl Account {
    /// Parses `name` or `name@tenant`; blank input yields `None`.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        let (name, tenant) = match trimmed.split_once('@') {
            Some((name, tenant)) if !tenant.trim().is_empty() => {
                (name.trim(), Some(tenant.trim().to_owned()))
            }
            Some((name, _)) => (name.trim(), None),
            None => (trimmed, None),
        };
        if name.is_empty() {
            return None;
        }
        Some(Self {
            name: name.to_owned(),
            tenant,
        })
    }
}

/// Source of the currently signed-in account.
pub trait AccountProvider: Send + Sync {
    /// Returns the signed-in account, if any.
    fn current_account(&self) -> Option<Account>;
}

/// Reads the account from [`CLOUD_ACCOUNT_ENV`].
#[derive(Clone, Copy, Debug, Default)]
pub struct EnvAccountProvider;

impl AccountProvider for EnvAccountProvider {
    fn current_account(&self) -> Option<Account> {
        std::env::var(CLOUD_ACCOUNT_ENV)
            .ok()
            .and_then(|raw| Account::parse(&raw))
    }
}

/// Pool key for an account's cloud shell.
#[must_use]
pub fn cloud_shell_host(account: &Account) -> HostSpec {
    HostSpec::new(
        account.name.clone(),
        account.tenant.as_deref().unwrap_or(DEFAULT_TENANT),
        0,
    )
}

/// Opens cloud shells through the launcher executable.
pub struct CloudShellConnector {
    launcher: String,
    runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for CloudShellConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudShellConnector")
            .field("launcher", &self.launcher)
            .finish_non_exhaustive()
    }
}

impl CloudShellConnector {
    /// Creates a connector driving `launcher`.
    #[must_use]
    pub fn new(launcher: impl Into<String>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            launcher: launcher.into(),
            runner,
        }
    }

    async fn open(&self, host: &HostSpec) -> Result<Arc<dyn RemoteConnection>, ConnectionError> {
        let spec = CommandSpec::new(&self.launcher)
            .arg("connect")
            .arg("--account")
            .arg(host.user.as_str())
            .arg("--tenant")
            .arg(host.host.as_str());
        let connect_error = |message: String| ConnectionError::Connect {
            host: host.to_string(),
            message,
        };

        let output = self
            .runner
            .capture(&spec)
            .await
            .map_err(|err| connect_error(err.to_string()))?;
        if !output.is_success() {
            return Err(connect_error(format!(
                "{} exited with {:?}: {}",
                self.launcher,
                output.code,
                output.stderr.trim()
            )));
        }

        let session = output.stdout.trim().to_owned();
        if session.is_empty() {
            return Err(connect_error(String::from("launcher returned no session id")));
        }
        info!(%host, %session, "cloud shell provisioned");
        Ok(Arc::new(CloudShellConnection {
            host: host.clone(),
            launcher: self.launcher.clone(),
            session,
            runner: Arc::clone(&self.runner),
            closed: AtomicBool::new(false),
        }))
    }
}

impl Connector for CloudShellConnector {
    fn connect<'a>(
        &'a self,
        host: &'a HostSpec,
        _credentials: &'a Credentials,
    ) -> ConnectionFuture<'a, Arc<dyn RemoteConnection>> {
        Box::pin(self.open(host))
    }
}

struct CloudShellConnection {
    host: HostSpec,
    launcher: String,
    session: String,
    runner: Arc<dyn CommandRunner>,
    closed: AtomicBool,
}

impl std::fmt::Debug for CloudShellConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudShellConnection")
            .field("host", &self.host)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl CloudShellConnection {
    fn launcher(&self, subcommand: &str) -> CommandSpec {
        CommandSpec::new(&self.launcher)
            .arg(subcommand)
            .arg("--session")
            .arg(self.session.as_str())
    }

    fn exec_spec(&self, command: &str) -> CommandSpec {
        self.launcher("exec").args(["--", "sh", "-c", command])
    }

    fn ensure_open(&self) -> Result<(), ConnectionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConnectionError::Dropped {
                host: self.host.to_string(),
            });
        }
        Ok(())
    }

    fn command_error(&self, message: impl Into<String>) -> ConnectionError {
        ConnectionError::Command {
            host: self.host.to_string(),
            message: message.into(),
        }
    }

    async fn probe(&self) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        self.runner
            .capture(&self.launcher("status"))
            .await
            .is_ok_and(|output| output.is_success())
    }

    async fn exec_streaming(
        &self,
        command: &str,
        sink: &dyn LogSink,
    ) -> Result<ProcessOutcome, ConnectionError> {
        self.ensure_open()?;
        self.runner
            .run(&self.exec_spec(command), sink)
            .await
            .map_err(|err| self.command_error(err.to_string()))
    }

    async fn exec_captured(&self, command: &str) -> Result<CommandOutput, ConnectionError> {
        self.ensure_open()?;
        self.runner
            .capture(&self.exec_spec(command))
            .await
            .map_err(|err| self.command_error(err.to_string()))
    }

    async fn copy(&self, local: &Utf8Path, remote_path: &str) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        let spec = self
            .launcher("upload")
            .arg(local.as_str())
            .arg(remote_path);
        let output = self
            .runner
            .capture(&spec)
            .await
            .map_err(|err| self.command_error(err.to_string()))?;
        if output.is_success() {
            return Ok(());
        }
        Err(self.command_error(format!(
            "upload of {local} exited with {:?}: {}",
            output.code,
            output.stderr.trim()
        )))
    }
}

impl RemoteConnection for CloudShellConnection {
    fn is_alive(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        Box::pin(self.probe())
    }

    fn exec<'a>(
        &'a self,
        command: &'a str,
        sink: &'a dyn LogSink,
    ) -> ConnectionFuture<'a, ProcessOutcome> {
        Box::pin(self.exec_streaming(command, sink))
    }

    fn capture<'a>(&'a self, command: &'a str) -> ConnectionFuture<'a, CommandOutput> {
        Box::pin(self.exec_captured(command))
    }

    fn upload<'a>(
        &'a self,
        local: &'a Utf8Path,
        remote_path: &'a str,
    ) -> ConnectionFuture<'a, ()> {
        Box::pin(self.copy(local, remote_path))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(
                host = %self.host,
                session = %self.session,
                "no runtime to disconnect cloud shell"
            );
            return;
        };
        let runner = Arc::clone(&self.runner);
        let spec = self.launcher("disconnect");
        let session = self.session.clone();
        handle.spawn(async move {
            match runner.capture(&spec).await {
                Ok(output) if output.is_success() => {
                    debug!(%session, "cloud shell disconnected");
                }
                Ok(output) => {
                    warn!(
                        %session,
                        stderr = %output.stderr.trim(),
                        "cloud shell disconnect failed"
                    );
                }
                Err(err) => warn!(%session, error = %err, "cloud shell disconnect failed"),
            }
        });
    }
}

/// Cloud shell runner.
pub struct CloudShellRunner {
    accounts: Arc<dyn AccountProvider>,
    connections: ConnectionManager,
    remote_root: String,
    interpreter: String,
    default_playbook: String,
}

impl std::fmt::Debug for CloudShellRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudShellRunner")
            .field("remote_root", &self.remote_root)
            .field("interpreter", &self.interpreter)
            .finish_non_exhaustive()
    }
}

impl CloudShellRunner {
    /// Creates a runner using its own connection pool.
    #[must_use]
    pub fn new(accounts: Arc<dyn AccountProvider>, connections: ConnectionManager) -> Self {
        Self {
            accounts,
            connections,
            remote_root: String::from("playrun"),
            interpreter: String::from("ansible-playbook"),
            default_playbook: String::from("site.yml"),
        }
    }

    /// Overrides the directory playbooks are uploaded to inside the shell.
    #[must_use]
    pub fn with_remote_root(mut self, remote_root: impl Into<String>) -> Self {
        self.remote_root = remote_root.into();
        self
    }

    /// Overrides the interpreter.
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

    async fn execute(
        &self,
        request: &ExecutionRequest,
        progress: &SessionProgress,
    ) -> Result<ProcessOutcome, RunError> {
        let account = self.accounts.current_account().ok_or_else(|| RunError::Auth {
            message: String::from("no cloud account is signed in"),
        })?;
        let local_playbook = request.playbook_path(&self.default_playbook);
        let file_name = local_playbook
            .file_name()
            .ok_or_else(|| RunError::InvalidRequest {
                message: format!("playbook path {local_playbook} has no file name"),
            })?
            .to_owned();

        progress.advance(SessionState::Provisioning);
        progress.sink().append(&format!(
            "[{}] provisioning cloud shell for {}",
            BackendKind::CloudShell,
            account.name
        ));
        let host = cloud_shell_host(&account);
        let lease = self.connections.acquire(&host).await?;
        let connection = lease.connection();

        let root = self.remote_root.trim_end_matches('/');
        let prepared = connection
            .capture(&format!("mkdir -p {}", escape(root.into())))
            .await?;
        if !prepared.is_success() {
            return Err(RunError::from(ConnectionError::Command {
                host: host.to_string(),
                message: format!("could not create {root}: {}", prepared.stderr.trim()),
            }));
        }
        connection
            .upload(&local_playbook, &format!("{root}/{file_name}"))
            .await?;

        let command = shell_invocation(root, &request.env, &self.interpreter, &file_name);
        progress.sink().append(&format!("> {command}"));
        progress.advance(SessionState::Running);
        let outcome = connection.exec(&command, progress.sink()).await?;
        lease.release();
        Ok(outcome)
    }
}

impl RunnerBackend for CloudShellRunner {
    fn kind(&self) -> BackendKind {
        BackendKind::CloudShell
    }

    fn run_playbook<'a>(
        &'a self,
        request: &'a ExecutionRequest,
        progress: &'a SessionProgress,
    ) -> RunFuture<'a> {
        Box::pin(self.execute(request, progress))
    }
}
