//! Test support utilities shared across unit and integration tests.
//!
//! Every fake here is cheap to clone; clones share their recorded state so a
//! test can hand one handle to the code under test and inspect another.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::ffi::OsString;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};

use crate::backend::{Account, AccountProvider};
use crate::connection::{
    ConnectionError, ConnectionFuture, Connector, CredentialResolver, Credentials, HostSpec,
    RemoteConnection,
};
use crate::exec::{CommandOutput, CommandRunner, CommandSpec, ExecError, ExecFuture, ProcessOutcome};
use crate::sink::{LogSink, Notifier};
use crate::sync::{Transport, TransportError, TransportFuture};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Builds a captured output with the given exit code and stdout.
#[must_use]
pub fn output(code: i32, stdout: &str) -> CommandOutput {
    CommandOutput {
        code: Some(code),
        stdout: stdout.to_owned(),
        stderr: String::new(),
    }
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Working directory, if one was set.
    pub working_dir: Option<Utf8PathBuf>,
    /// Environment overlay.
    pub env: BTreeMap<String, String>,
    /// File fed on stdin, if any.
    pub stdin: Option<Utf8PathBuf>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl From<&CommandSpec> for CommandInvocation {
    fn from(spec: &CommandSpec) -> Self {
        Self {
            program: spec.program.clone(),
            args: spec.args.clone(),
            working_dir: spec.working_dir.clone(),
            env: spec.env.clone(),
            stdin: spec.stdin.clone(),
        }
    }
}

#[derive(Clone, Debug)]
enum Scripted {
    Output(CommandOutput),
    Error(ExecError),
    Pending,
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Unscripted calls succeed with empty output. For streamed runs the
/// scripted stdout is appended to the sink line by line.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<Scripted>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        lock(&self.invocations).clone()
    }

    /// Queues a completed process.
    pub fn push_output(&self, code: i32, stdout: &str) {
        lock(&self.responses).push_back(Scripted::Output(output(code, stdout)));
    }

    /// Queues a launch failure for `program`.
    pub fn push_missing(&self, program: &str) {
        lock(&self.responses).push_back(Scripted::Error(ExecError::Launch {
            program: program.to_owned(),
        }));
    }

    /// Queues a call that never completes.
    pub fn push_pending(&self) {
        lock(&self.responses).push_back(Scripted::Pending);
    }

    fn next(&self, spec: &CommandSpec) -> Scripted {
        lock(&self.invocations).push(CommandInvocation::from(spec));
        lock(&self.responses)
            .pop_front()
            .unwrap_or_else(|| Scripted::Output(output(0, "")))
    }
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(
        &'a self,
        spec: &'a CommandSpec,
        sink: &'a dyn LogSink,
    ) -> ExecFuture<'a, ProcessOutcome> {
        let scripted = self.next(spec);
        Box::pin(async move {
            match scripted {
                Scripted::Output(out) => {
                    for line in out.stdout.lines() {
                        sink.append(line);
                    }
                    Ok(out.code.map_or_else(ProcessOutcome::signalled, ProcessOutcome::exited))
                }
                Scripted::Error(err) => Err(err),
                Scripted::Pending => std::future::pending().await,
            }
        })
    }

    fn capture<'a>(&'a self, spec: &'a CommandSpec) -> ExecFuture<'a, CommandOutput> {
        let scripted = self.next(spec);
        Box::pin(async move {
            match scripted {
                Scripted::Output(out) => Ok(out),
                Scripted::Error(err) => Err(err),
                Scripted::Pending => std::future::pending().await,
            }
        })
    }
}

/// Behaviour shared by a [`FakeConnector`] and every connection it opens.
#[derive(Debug, Default)]
struct FakeBehaviour {
    connects: AtomicUsize,
    refuse: AtomicBool,
    block_exec: AtomicBool,
    exec_code: Mutex<i32>,
    exec_output: Mutex<Vec<String>>,
    captures: Mutex<Vec<(String, CommandOutput)>>,
    failing_uploads: Mutex<BTreeSet<String>>,
    opened: Mutex<Vec<Arc<FakeConnection>>>,
}

/// Connector opening in-memory [`FakeConnection`]s.
#[derive(Clone, Debug, Default)]
pub struct FakeConnector {
    behaviour: Arc<FakeBehaviour>,
}

impl FakeConnector {
    /// Creates a connector whose connections succeed with no output.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful and failed connect attempts.
    #[must_use]
    pub fn connects(&self) -> usize {
        self.behaviour.connects.load(Ordering::SeqCst)
    }

    /// Makes subsequent connect attempts fail.
    pub fn refuse_connections(&self, refuse: bool) {
        self.behaviour.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Makes `exec` hang after recording its command.
    pub fn block_exec(&self, block: bool) {
        self.behaviour.block_exec.store(block, Ordering::SeqCst);
    }

    /// Output lines and exit code produced by `exec`.
    pub fn set_exec_result(&self, lines: &[&str], code: i32) {
        *lock(&self.behaviour.exec_output) = lines.iter().map(|line| (*line).to_owned()).collect();
        *lock(&self.behaviour.exec_code) = code;
    }

    /// Answers `capture` calls whose command contains `needle`.
    pub fn respond_to(&self, needle: &str, response: CommandOutput) {
        lock(&self.behaviour.captures).push((needle.to_owned(), response));
    }

    /// Fails uploads whose remote path contains `needle`.
    pub fn fail_uploads_matching(&self, needle: &str) {
        lock(&self.behaviour.failing_uploads).insert(needle.to_owned());
    }

    /// Most recently opened connection.
    #[must_use]
    pub fn last(&self) -> Option<Arc<FakeConnection>> {
        lock(&self.behaviour.opened).last().cloned()
    }
}

impl Connector for FakeConnector {
    fn connect<'a>(
        &'a self,
        host: &'a HostSpec,
        _credentials: &'a Credentials,
    ) -> ConnectionFuture<'a, Arc<dyn RemoteConnection>> {
        Box::pin(async move {
            self.behaviour.connects.fetch_add(1, Ordering::SeqCst);
            if self.behaviour.refuse.load(Ordering::SeqCst) {
                return Err(ConnectionError::Connect {
                    host: host.to_string(),
                    message: String::from("connection refused"),
                });
            }
            let connection = Arc::new(FakeConnection {
                host: host.clone(),
                behaviour: Arc::clone(&self.behaviour),
                alive: AtomicBool::new(true),
                closes: AtomicUsize::new(0),
                commands: Mutex::new(Vec::new()),
                uploads: Mutex::new(Vec::new()),
            });
            lock(&self.behaviour.opened).push(Arc::clone(&connection));
            let opened: Arc<dyn RemoteConnection> = connection;
            Ok(opened)
        })
    }
}

/// In-memory remote session recording everything sent to it.
#[derive(Debug)]
pub struct FakeConnection {
    host: HostSpec,
    behaviour: Arc<FakeBehaviour>,
    alive: AtomicBool,
    closes: AtomicUsize,
    commands: Mutex<Vec<String>>,
    uploads: Mutex<Vec<(Utf8PathBuf, String)>>,
}

impl FakeConnection {
    /// Simulates the session dropping.
    pub fn drop_session(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    /// Number of `close` calls.
    #[must_use]
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Commands passed to `exec` and `capture`, in order.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        lock(&self.commands).clone()
    }

    /// Uploads as `(local, remote)` pairs, in order.
    #[must_use]
    pub fn uploads(&self) -> Vec<(Utf8PathBuf, String)> {
        lock(&self.uploads).clone()
    }

    fn record(&self, command: &str) {
        lock(&self.commands).push(command.to_owned());
    }
}

impl RemoteConnection for FakeConnection {
    fn is_alive(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        let alive = self.alive.load(Ordering::SeqCst);
        Box::pin(async move { alive })
    }

    fn exec<'a>(
        &'a self,
        command: &'a str,
        sink: &'a dyn LogSink,
    ) -> ConnectionFuture<'a, ProcessOutcome> {
        Box::pin(async move {
            self.record(command);
            if self.behaviour.block_exec.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            let lines = lock(&self.behaviour.exec_output).clone();
            for line in lines {
                sink.append(&line);
            }
            Ok(ProcessOutcome::exited(*lock(&self.behaviour.exec_code)))
        })
    }

    fn capture<'a>(&'a self, command: &'a str) -> ConnectionFuture<'a, CommandOutput> {
        Box::pin(async move {
            self.record(command);
            let scripted = lock(&self.behaviour.captures)
                .iter()
                .find(|(needle, _)| command.contains(needle.as_str()))
                .map(|(_, response)| response.clone());
            Ok(scripted.unwrap_or_else(|| output(0, "")))
        })
    }

    fn upload<'a>(
        &'a self,
        local: &'a Utf8Path,
        remote_path: &'a str,
    ) -> ConnectionFuture<'a, ()> {
        Box::pin(async move {
            let failing = lock(&self.behaviour.failing_uploads)
                .iter()
                .any(|needle| remote_path.contains(needle.as_str()));
            if failing {
                return Err(ConnectionError::Command {
                    host: self.host.to_string(),
                    message: format!("upload of {remote_path} rejected"),
                });
            }
            lock(&self.uploads).push((local.to_path_buf(), remote_path.to_owned()));
            Ok(())
        })
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.alive.store(false, Ordering::SeqCst);
    }
}

/// Resolver counting its lookups; can be told to fail.
#[derive(Clone, Debug, Default)]
pub struct CountingResolver {
    calls: Arc<AtomicUsize>,
    fail: Arc<AtomicBool>,
}

impl CountingResolver {
    /// Creates a resolver returning empty credentials.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of lookups performed.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Makes subsequent lookups fail.
    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl CredentialResolver for CountingResolver {
    fn resolve(&self, host: &HostSpec) -> Result<Credentials, ConnectionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(ConnectionError::Auth {
                host: host.to_string(),
                message: String::from("no key available"),
            });
        }
        Ok(Credentials::default())
    }
}

/// Destination kept entirely in memory.
#[derive(Clone, Debug, Default)]
pub struct MemoryTransport {
    key: String,
    files: Arc<Mutex<BTreeMap<Utf8PathBuf, Vec<u8>>>>,
    uploads: Arc<Mutex<Vec<Utf8PathBuf>>>,
    removals: Arc<Mutex<Vec<Utf8PathBuf>>>,
    lists: Arc<AtomicUsize>,
    failing: Arc<Mutex<BTreeSet<Utf8PathBuf>>>,
    truncating: Arc<Mutex<BTreeSet<Utf8PathBuf>>>,
}

impl MemoryTransport {
    /// Creates an empty destination identified by `key`.
    #[must_use]
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_owned(),
            ..Self::default()
        }
    }

    /// Seeds a file already present at the destination.
    pub fn seed(&self, relative: &str, contents: &[u8]) {
        lock(&self.files).insert(Utf8PathBuf::from(relative), contents.to_vec());
    }

    /// Makes uploads of `relative` fail.
    pub fn fail_upload(&self, relative: &str) {
        lock(&self.failing).insert(Utf8PathBuf::from(relative));
    }

    /// Makes uploads of `relative` write a partial file and then fail.
    pub fn truncate_upload(&self, relative: &str) {
        lock(&self.truncating).insert(Utf8PathBuf::from(relative));
    }

    /// Lets every upload succeed again.
    pub fn heal(&self) {
        lock(&self.failing).clear();
        lock(&self.truncating).clear();
    }

    /// Destination contents.
    #[must_use]
    pub fn files(&self) -> BTreeMap<Utf8PathBuf, Vec<u8>> {
        lock(&self.files).clone()
    }

    /// Successful uploads, in completion order.
    #[must_use]
    pub fn uploads(&self) -> Vec<Utf8PathBuf> {
        lock(&self.uploads).clone()
    }

    /// Removed paths, in completion order.
    #[must_use]
    pub fn removals(&self) -> Vec<Utf8PathBuf> {
        lock(&self.removals).clone()
    }

    /// Total number of transport calls of any kind.
    #[must_use]
    pub fn calls(&self) -> usize {
        lock(&self.uploads).len() + lock(&self.removals).len() + self.lists.load(Ordering::SeqCst)
    }
}

impl Transport for MemoryTransport {
    fn destination_key(&self) -> String {
        self.key.clone()
    }

    fn upload<'a>(
        &'a self,
        local: &'a Utf8Path,
        relative: &'a Utf8Path,
    ) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            if lock(&self.failing).contains(relative) {
                return Err(TransportError::Io {
                    path: relative.to_path_buf(),
                    message: String::from("permission denied"),
                });
            }
            let contents = tokio::fs::read(local)
                .await
                .map_err(|err| TransportError::Io {
                    path: local.to_path_buf(),
                    message: err.to_string(),
                })?;
            if lock(&self.truncating).contains(relative) {
                let partial = contents.get(..contents.len() / 2).unwrap_or_default();
                lock(&self.files).insert(relative.to_path_buf(), partial.to_vec());
                return Err(TransportError::Io {
                    path: relative.to_path_buf(),
                    message: String::from("connection reset mid-transfer"),
                });
            }
            lock(&self.files).insert(relative.to_path_buf(), contents);
            lock(&self.uploads).push(relative.to_path_buf());
            Ok(())
        })
    }

    fn remove<'a>(&'a self, relative: &'a Utf8Path) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            lock(&self.files).remove(relative);
            lock(&self.removals).push(relative.to_path_buf());
            Ok(())
        })
    }

    fn list(&self) -> TransportFuture<'_, Vec<Utf8PathBuf>> {
        Box::pin(async move {
            self.lists.fetch_add(1, Ordering::SeqCst);
            Ok(lock(&self.files).keys().cloned().collect())
        })
    }
}

/// Account provider returning a fixed account.
#[derive(Clone, Debug, Default)]
pub struct StaticAccountProvider {
    account: Arc<Mutex<Option<Account>>>,
}

impl StaticAccountProvider {
    /// Creates a provider returning `account`.
    #[must_use]
    pub fn new(account: Option<Account>) -> Self {
        Self {
            account: Arc::new(Mutex::new(account)),
        }
    }
}

impl AccountProvider for StaticAccountProvider {
    fn current_account(&self) -> Option<Account> {
        lock(&self.account).clone()
    }
}

/// Notifier recording every message.
#[derive(Clone, Debug, Default)]
pub struct MemoryNotifier {
    messages: Arc<Mutex<Vec<String>>>,
}

impl MemoryNotifier {
    /// Creates an empty notifier.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages received so far.
    #[must_use]
    pub fn messages(&self) -> Vec<String> {
        lock(&self.messages).clone()
    }
}

impl Notifier for MemoryNotifier {
    fn notify_error(&self, message: &str) {
        lock(&self.messages).push(message.to_owned());
    }
}
