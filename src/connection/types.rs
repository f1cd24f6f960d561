//! Host specifications, connection traits, and connection errors.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

use crate::exec::{CommandOutput, ProcessOutcome};
use crate::sink::LogSink;

/// Identifies one remote endpoint; the connection pool keys on this value.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct HostSpec {
    /// Remote user to authenticate as.
    pub user: String,
    /// Hostname or address.
    pub host: String,
    /// TCP port for the shell service.
    pub port: u16,
    /// Optional private key used for authentication.
    pub identity_file: Option<String>,
}

impl HostSpec {
    /// Creates a host specification without an identity file.
    #[must_use]
    pub fn new(user: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
            port,
            identity_file: None,
        }
    }

    /// Sets the identity file used for authentication.
    #[must_use]
    pub fn with_identity_file(mut self, path: impl Into<String>) -> Self {
        self.identity_file = Some(path.into());
        self
    }

    /// Returns the `user@host` form used by OpenSSH.
    #[must_use]
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

impl fmt::Display for HostSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// Authentication material resolved for a host.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Credentials {
    /// Expanded identity file, when one is configured.
    pub identity_file: Option<Utf8PathBuf>,
}

/// Observable health of a pooled connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    /// The connection answered its liveness probe.
    Live,
    /// The connection dropped and must not be reused.
    Broken,
}

/// Errors raised while establishing or using a remote connection.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConnectionError {
    /// Credential lookup failed; never retried.
    #[error("authentication material for {host} unavailable: {message}")]
    Auth {
        /// Host whose credentials could not be resolved.
        host: String,
        /// Description of the failure.
        message: String,
    },
    /// The remote session could not be opened.
    #[error("failed to connect to {host}: {message}")]
    Connect {
        /// Host that could not be reached.
        host: String,
        /// Description of the failure.
        message: String,
    },
    /// The session dropped while in use.
    #[error("connection to {host} dropped")]
    Dropped {
        /// Host whose session dropped.
        host: String,
    },
    /// A command could not be issued over the connection.
    #[error("command on {host} failed: {message}")]
    Command {
        /// Host the command targeted.
        host: String,
        /// Description of the failure.
        message: String,
    },
}

/// Future returned by connection operations.
pub type ConnectionFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, ConnectionError>> + Send + 'a>>;

/// A live session to a remote shell.
pub trait RemoteConnection: Send + Sync + fmt::Debug {
    /// Probes whether the session is still usable.
    fn is_alive(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>>;

    /// Runs `command` remotely, streaming its output into `sink`.
    fn exec<'a>(
        &'a self,
        command: &'a str,
        sink: &'a dyn LogSink,
    ) -> ConnectionFuture<'a, ProcessOutcome>;

    /// Runs `command` remotely and captures its output.
    fn capture<'a>(&'a self, command: &'a str) -> ConnectionFuture<'a, CommandOutput>;

    /// Copies a local file to `remote_path`.
    fn upload<'a>(&'a self, local: &'a Utf8Path, remote_path: &'a str)
    -> ConnectionFuture<'a, ()>;

    /// Tears the session down. Must not block.
    fn close(&self);
}

/// Opens new remote sessions for the pool.
pub trait Connector: Send + Sync {
    /// Establishes a session to `host` using the resolved credentials.
    fn connect<'a>(
        &'a self,
        host: &'a HostSpec,
        credentials: &'a Credentials,
    ) -> ConnectionFuture<'a, Arc<dyn RemoteConnection>>;
}

/// Resolves authentication material for a host.
pub trait CredentialResolver: Send + Sync {
    /// Looks up credentials for `host`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Auth`] when no usable material exists.
    fn resolve(&self, host: &HostSpec) -> Result<Credentials, ConnectionError>;
}
