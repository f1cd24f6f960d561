//! OpenSSH-backed connections multiplexed over a control master.
//!
//! Each pooled connection is one `ssh -M -N` master process. Commands and
//! uploads reuse its control socket, so a pooled lease costs no additional
//! handshakes. The master exiting (network drop, remote close) makes the
//! connection report itself as broken.

use std::ffi::OsString;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use shell_escape::unix::escape;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::time::sleep;
use tracing::{debug, warn};
use uuid::Uuid;

use super::types::{
    ConnectionError, ConnectionFuture, Connector, Credentials, HostSpec, RemoteConnection,
};
use crate::exec::{CommandOutput, CommandRunner, CommandSpec, ProcessOutcome};
use crate::sink::LogSink;

const READY_ATTEMPTS: u32 = 50;
const READY_INTERVAL: Duration = Duration::from_millis(200);

/// SSH client options shared by every connection the connector opens.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshOptions {
    /// Path to the `ssh` executable.
    pub ssh_bin: String,
    /// Whether to force batch mode to avoid password prompts.
    pub batch_mode: bool,
    /// Whether to enforce host key checking.
    pub strict_host_key_checking: bool,
    /// Known hosts file override; empty leaves the client default.
    pub known_hosts_file: String,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            ssh_bin: String::from("ssh"),
            batch_mode: true,
            strict_host_key_checking: false,
            known_hosts_file: String::from("/dev/null"),
        }
    }
}

impl SshOptions {
    pub(super) fn common_args(&self, credentials: &Credentials) -> Vec<OsString> {
        let mut args = Vec::new();

        if let Some(identity_file) = &credentials.identity_file {
            args.push(OsString::from("-i"));
            args.push(OsString::from(identity_file.as_str()));
        }

        if self.batch_mode {
            args.push(OsString::from("-o"));
            args.push(OsString::from("BatchMode=yes"));
        }

        if !self.strict_host_key_checking {
            args.push(OsString::from("-o"));
            args.push(OsString::from("StrictHostKeyChecking=no"));
        }

        if !self.known_hosts_file.trim().is_empty() {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!(
                "UserKnownHostsFile={}",
                self.known_hosts_file
            )));
        }

        args
    }
}

/// Opens control-master SSH connections.
pub struct SshConnector {
    options: SshOptions,
    control_dir: Utf8PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for SshConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConnector")
            .field("options", &self.options)
            .field("control_dir", &self.control_dir)
            .finish_non_exhaustive()
    }
}

impl SshConnector {
    /// Creates a connector placing control sockets under `control_dir`.
    #[must_use]
    pub fn new(
        options: SshOptions,
        control_dir: impl Into<Utf8PathBuf>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            options,
            control_dir: control_dir.into(),
            runner,
        }
    }

    async fn open(
        &self,
        host: &HostSpec,
        credentials: &Credentials,
    ) -> Result<Arc<dyn RemoteConnection>, ConnectionError> {
        let socket = self
            .control_dir
            .join(format!("playrun-{}.sock", Uuid::new_v4().simple()));
        let mut master = Command::new(&self.options.ssh_bin);
        master
            .args(["-M", "-N", "-S"])
            .arg(socket.as_str())
            .args(["-o", "ControlPersist=no", "-p"])
            .arg(host.port.to_string())
            .args(self.options.common_args(credentials))
            .arg(host.destination())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(%host, %socket, "starting ssh control master");
        let child = master.spawn().map_err(|err| ConnectionError::Connect {
            host: host.to_string(),
            message: format!("failed to spawn {}: {err}", self.options.ssh_bin),
        })?;

        let connection = SshConnection {
            host: host.clone(),
            options: self.options.clone(),
            socket,
            runner: Arc::clone(&self.runner),
            master: Mutex::new(Some(child)),
        };
        connection.wait_until_ready().await?;
        Ok(Arc::new(connection))
    }
}

impl Connector for SshConnector {
    fn connect<'a>(
        &'a self,
        host: &'a HostSpec,
        credentials: &'a Credentials,
    ) -> ConnectionFuture<'a, Arc<dyn RemoteConnection>> {
        Box::pin(self.open(host, credentials))
    }
}

/// One control-master session to a host.
struct SshConnection {
    host: HostSpec,
    options: SshOptions,
    socket: Utf8PathBuf,
    runner: Arc<dyn CommandRunner>,
    master: Mutex<Option<Child>>,
}

impl std::fmt::Debug for SshConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConnection")
            .field("host", &self.host)
            .field("socket", &self.socket)
            .finish_non_exhaustive()
    }
}

impl SshConnection {
    fn ssh(&self) -> CommandSpec {
        CommandSpec::new(&self.options.ssh_bin)
            .arg("-S")
            .arg(self.socket.as_str())
            .arg("-p")
            .arg(self.host.port.to_string())
    }

    fn check_spec(&self) -> CommandSpec {
        self.ssh()
            .args(["-O", "check"])
            .arg(self.host.destination())
    }

    fn remote_spec(&self, command: &str) -> CommandSpec {
        self.ssh().arg(self.host.destination()).arg(command)
    }

    fn master_exited(&self) -> bool {
        let mut guard = self.master.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_mut() {
            Some(child) => !matches!(child.try_wait(), Ok(None)),
            None => true,
        }
    }

    async fn wait_until_ready(&self) -> Result<(), ConnectionError> {
        for _ in 0..READY_ATTEMPTS {
            if self.master_exited() {
                let stderr = self.take_master_stderr().await;
                return Err(ConnectionError::Connect {
                    host: self.host.to_string(),
                    message: format!("ssh master exited: {}", stderr.trim()),
                });
            }

            let ready = self
                .runner
                .capture(&self.check_spec())
                .await
                .is_ok_and(|output| output.is_success());
            if ready {
                return Ok(());
            }
            sleep(READY_INTERVAL).await;
        }

        self.close();
        Err(ConnectionError::Connect {
            host: self.host.to_string(),
            message: String::from("timed out waiting for the ssh control master"),
        })
    }

    async fn take_master_stderr(&self) -> String {
        let stderr = self
            .master
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
            .and_then(|child| child.stderr.take());
        let mut text = String::new();
        if let Some(mut pipe) = stderr {
            pipe.read_to_string(&mut text).await.ok();
        }
        text
    }

    async fn probe(&self) -> bool {
        if self.master_exited() {
            return false;
        }
        self.runner
            .capture(&self.check_spec())
            .await
            .is_ok_and(|output| output.is_success())
    }

    fn command_error(&self, message: impl Into<String>) -> ConnectionError {
        ConnectionError::Command {
            host: self.host.to_string(),
            message: message.into(),
        }
    }

    async fn exec_streaming(
        &self,
        command: &str,
        sink: &dyn LogSink,
    ) -> Result<ProcessOutcome, ConnectionError> {
        if self.master_exited() {
            return Err(ConnectionError::Dropped {
                host: self.host.to_string(),
            });
        }
        self.runner
            .run(&self.remote_spec(command), sink)
            .await
            .map_err(|err| self.command_error(err.to_string()))
    }

    async fn exec_captured(&self, command: &str) -> Result<CommandOutput, ConnectionError> {
        if self.master_exited() {
            return Err(ConnectionError::Dropped {
                host: self.host.to_string(),
            });
        }
        self.runner
            .capture(&self.remote_spec(command))
            .await
            .map_err(|err| self.command_error(err.to_string()))
    }

    /// Streams `local` into `cat` on the remote side so the target path goes
    /// through the same shell quoting as every other remote command.
    fn upload_spec(&self, local: &Utf8Path, remote_path: &str) -> CommandSpec {
        self.remote_spec(&format!("cat > {}", escape(remote_path.into())))
            .stdin_file(local)
    }

    async fn copy(&self, local: &Utf8Path, remote_path: &str) -> Result<(), ConnectionError> {
        let output = self
            .runner
            .capture(&self.upload_spec(local, remote_path))
            .await
            .map_err(|err| self.command_error(err.to_string()))?;
        if output.is_success() {
            return Ok(());
        }
        Err(self.command_error(format!(
            "upload of {local} to {remote_path} exited with {:?}: {}",
            output.code,
            output.stderr.trim()
        )))
    }
}

impl RemoteConnection for SshConnection {
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
        if let Some(mut child) = self
            .master
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            && let Err(err) = child.start_kill()
        {
            warn!(host = %self.host, error = %err, "failed to stop ssh control master");
        }
        std::fs::remove_file(&self.socket).ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedRunner;

    fn connection(runner: &ScriptedRunner) -> SshConnection {
        SshConnection {
            host: HostSpec::new("deploy", "build.example.com", 22),
            options: SshOptions::default(),
            socket: Utf8PathBuf::from("/run/playrun/ctl.sock"),
            runner: Arc::new(runner.clone()),
            master: Mutex::new(None),
        }
    }

    #[tokio::test]
    async fn uploads_stream_through_the_remote_shell() {
        let runner = ScriptedRunner::new();
        connection(&runner)
            .upload(Utf8Path::new("/work/my vars.yml"), "/srv/work/my vars.yml")
            .await
            .expect("upload succeeds");

        let invocations = runner.invocations();
        let [invocation] = invocations.as_slice() else {
            panic!("expected one invocation, got {invocations:?}");
        };
        assert_eq!(
            invocation.command_string(),
            "ssh -S /run/playrun/ctl.sock -p 22 deploy@build.example.com cat > '/srv/work/my vars.yml'"
        );
        assert_eq!(
            invocation.stdin.as_deref(),
            Some(Utf8Path::new("/work/my vars.yml"))
        );
    }

    #[tokio::test]
    async fn rejected_uploads_report_the_remote_error() {
        let runner = ScriptedRunner::new();
        runner.push_output(1, "");
        let err = connection(&runner)
            .upload(Utf8Path::new("/work/site.yml"), "/srv/work/site.yml")
            .await
            .expect_err("upload fails");
        assert!(
            matches!(&err, ConnectionError::Command { message, .. } if message.contains("/srv/work/site.yml")),
            "{err}"
        );
    }
}
