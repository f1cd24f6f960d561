//! Destinations a sync plan is applied to.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use shell_escape::unix::escape;
use thiserror::Error;
use tracing::debug;

use super::plan::walk_files;
use super::settings::IgnoreSet;
use crate::connection::{ConnectionError, ConnectionLease, ConnectionManager, HostSpec};

/// Errors raised by a single transport operation.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TransportError {
    /// Local filesystem access failed.
    #[error("{path}: {message}")]
    Io {
        /// Path being accessed.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// The remote side rejected or could not run the operation.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

impl TransportError {
    fn io(path: &Utf8Path, err: &io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}

/// Future returned by [`Transport`] operations.
pub type TransportFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// Applies individual file operations at a destination root.
pub trait Transport: Send + Sync {
    /// Stable identity of the destination; keys the fingerprint cache and
    /// the per-destination sync gate.
    fn destination_key(&self) -> String;

    /// Copies the local file to `relative` below the destination root,
    /// creating parent directories as needed.
    fn upload<'a>(&'a self, local: &'a Utf8Path, relative: &'a Utf8Path)
    -> TransportFuture<'a, ()>;

    /// Removes `relative` below the destination root.
    fn remove<'a>(&'a self, relative: &'a Utf8Path) -> TransportFuture<'a, ()>;

    /// Lists every file below the destination root as relative paths.
    fn list(&self) -> TransportFuture<'_, Vec<Utf8PathBuf>>;
}

/// Directory-to-directory transport on the local filesystem.
#[derive(Clone, Debug)]
pub struct LocalTransport {
    root: Utf8PathBuf,
}

impl LocalTransport {
    /// Targets `root`, which is created on first upload.
    #[must_use]
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn open_root(root: &Utf8Path) -> Result<Dir, TransportError> {
        Dir::create_ambient_dir_all(root, ambient_authority())
            .map_err(|err| TransportError::io(root, &err))?;
        Dir::open_ambient_dir(root, ambient_authority())
            .map_err(|err| TransportError::io(root, &err))
    }

    fn copy_blocking(
        root: &Utf8Path,
        local: &Utf8Path,
        relative: &Utf8Path,
    ) -> Result<(), TransportError> {
        let contents = std::fs::read(local).map_err(|err| TransportError::io(local, &err))?;
        let dir = Self::open_root(root)?;
        if let Some(parent) = relative.parent()
            && !parent.as_str().is_empty()
        {
            dir.create_dir_all(parent)
                .map_err(|err| TransportError::io(&root.join(parent), &err))?;
        }
        dir.write(relative, contents)
            .map_err(|err| TransportError::io(&root.join(relative), &err))
    }

    fn remove_blocking(root: &Utf8Path, relative: &Utf8Path) -> Result<(), TransportError> {
        let dir = Self::open_root(root)?;
        match dir.remove_file(relative) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(TransportError::io(&root.join(relative), &err)),
        }
    }

    async fn blocking<T, F>(&self, task: F) -> Result<T, TransportError>
    where
        T: Send + 'static,
        F: FnOnce(Utf8PathBuf) -> Result<T, TransportError> + Send + 'static,
    {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || task(root))
            .await
            .map_err(|err| TransportError::Io {
                path: self.root.clone(),
                message: err.to_string(),
            })?
    }
}

impl Transport for LocalTransport {
    fn destination_key(&self) -> String {
        format!("local:{}", self.root)
    }

    fn upload<'a>(
        &'a self,
        local: &'a Utf8Path,
        relative: &'a Utf8Path,
    ) -> TransportFuture<'a, ()> {
        let source = local.to_path_buf();
        let target = relative.to_path_buf();
        Box::pin(self.blocking(move |root| Self::copy_blocking(&root, &source, &target)))
    }

    fn remove<'a>(&'a self, relative: &'a Utf8Path) -> TransportFuture<'a, ()> {
        let target = relative.to_path_buf();
        Box::pin(self.blocking(move |root| Self::remove_blocking(&root, &target)))
    }

    fn list(&self) -> TransportFuture<'_, Vec<Utf8PathBuf>> {
        Box::pin(self.blocking(|root| {
            if !root.is_dir() {
                return Ok(Vec::new());
            }
            walk_files(&root, &IgnoreSet::empty()).map_err(|err| TransportError::io(&root, &err))
        }))
    }
}

/// Transport writing through a pooled remote-shell connection.
#[derive(Debug)]
pub struct SshTransport {
    lease: ConnectionLease,
    root: String,
}

impl SshTransport {
    /// Targets `root` on the host the lease belongs to.
    #[must_use]
    pub fn new(lease: ConnectionLease, root: impl Into<String>) -> Self {
        Self {
            lease,
            root: root.into(),
        }
    }

    /// Remote root directory.
    #[must_use]
    pub fn root(&self) -> &str {
        &self.root
    }

    fn remote_path(&self, relative: &Utf8Path) -> String {
        format!("{}/{relative}", self.root.trim_end_matches('/'))
    }

    async fn run_checked(&self, command: &str) -> Result<String, TransportError> {
        let output = self.lease.connection().capture(command).await?;
        if output.is_success() {
            return Ok(output.stdout);
        }
        Err(TransportError::Connection(ConnectionError::Command {
            host: self.lease.host().to_string(),
            message: format!(
                "`{command}` exited with {:?}: {}",
                output.code,
                output.stderr.trim()
            ),
        }))
    }

    async fn copy(&self, local: &Utf8Path, relative: &Utf8Path) -> Result<(), TransportError> {
        let target = self.remote_path(relative);
        if let Some((parent, _)) = target.rsplit_once('/')
            && !parent.is_empty()
        {
            self.run_checked(&format!("mkdir -p {}", escape(parent.into())))
                .await?;
        }
        debug!(host = %self.lease.host(), %local, %target, "uploading file");
        self.lease.connection().upload(local, &target).await?;
        Ok(())
    }

    async fn delete(&self, relative: &Utf8Path) -> Result<(), TransportError> {
        let target = self.remote_path(relative);
        self.run_checked(&format!("rm -f -- {}", escape(target.as_str().into())))
            .await?;
        Ok(())
    }

    async fn listing(&self) -> Result<Vec<Utf8PathBuf>, TransportError> {
        let root = escape(self.root.as_str().into());
        let stdout = self
            .run_checked(&format!(
                "if [ -d {root} ]; then cd {root} && find . -type f -print0; fi"
            ))
            .await?;
        // NUL-separated so names with spaces or newlines survive intact.
        let mut paths: Vec<Utf8PathBuf> = stdout
            .split('\0')
            .filter(|entry| !entry.is_empty())
            .map(|entry| Utf8PathBuf::from(entry.strip_prefix("./").unwrap_or(entry)))
            .collect();
        paths.sort();
        Ok(paths)
    }
}

impl Transport for SshTransport {
    fn destination_key(&self) -> String {
        format!("ssh:{}:{}", self.lease.host(), self.root)
    }

    fn upload<'a>(
        &'a self,
        local: &'a Utf8Path,
        relative: &'a Utf8Path,
    ) -> TransportFuture<'a, ()> {
        Box::pin(self.copy(local, relative))
    }

    fn remove<'a>(&'a self, relative: &'a Utf8Path) -> TransportFuture<'a, ()> {
        Box::pin(self.delete(relative))
    }

    fn list(&self) -> TransportFuture<'_, Vec<Utf8PathBuf>> {
        Box::pin(self.listing())
    }
}

/// Default remote directory for a workspace: `<root>/<workspace name>`.
#[must_use]
pub fn remote_workspace_path(remote_root: &str, workspace: &Utf8Path) -> String {
    let name = workspace.file_name().unwrap_or("workspace");
    format!("{}/{name}", remote_root.trim_end_matches('/'))
}

/// Opens a transport for a workspace on demand.
///
/// Save-triggered copies consult the sync settings before asking for a
/// transport, so skipped copies never touch the destination.
pub trait TransportFactory: Send + Sync {
    /// Opens a transport for `workspace`, honouring a destination override.
    fn open<'a>(
        &'a self,
        workspace: &'a Utf8Path,
        destination: Option<&'a str>,
    ) -> TransportFuture<'a, Arc<dyn Transport>>;
}

/// Opens [`SshTransport`]s through a shared connection pool.
#[derive(Clone, Debug)]
pub struct SshTransportFactory {
    connections: ConnectionManager,
    host: HostSpec,
    remote_root: String,
}

impl SshTransportFactory {
    /// Creates a factory for `host`, placing workspaces below `remote_root`.
    #[must_use]
    pub fn new(
        connections: ConnectionManager,
        host: HostSpec,
        remote_root: impl Into<String>,
    ) -> Self {
        Self {
            connections,
            host,
            remote_root: remote_root.into(),
        }
    }

    async fn open_ssh(
        &self,
        workspace: &Utf8Path,
        destination: Option<&str>,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let root = destination.map_or_else(
            || remote_workspace_path(&self.remote_root, workspace),
            str::to_owned,
        );
        let lease = self.connections.acquire(&self.host).await?;
        Ok(Arc::new(SshTransport::new(lease, root)))
    }
}

impl TransportFactory for SshTransportFactory {
    fn open<'a>(
        &'a self,
        workspace: &'a Utf8Path,
        destination: Option<&'a str>,
    ) -> TransportFuture<'a, Arc<dyn Transport>> {
        Box::pin(self.open_ssh(workspace, destination))
    }
}

/// Opens [`LocalTransport`]s below a fixed directory.
#[derive(Clone, Debug)]
pub struct LocalTransportFactory {
    root: Utf8PathBuf,
}

impl LocalTransportFactory {
    /// Places workspaces below `root`.
    #[must_use]
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, workspace: &Utf8Path, destination: Option<&str>) -> Arc<dyn Transport> {
        let target = destination.map_or_else(
            || Utf8PathBuf::from(remote_workspace_path(self.root.as_str(), workspace)),
            Utf8PathBuf::from,
        );
        Arc::new(LocalTransport::new(target))
    }
}

impl TransportFactory for LocalTransportFactory {
    fn open<'a>(
        &'a self,
        workspace: &'a Utf8Path,
        destination: Option<&'a str>,
    ) -> TransportFuture<'a, Arc<dyn Transport>> {
        let transport = self.resolve(workspace, destination);
        Box::pin(async move { Ok::<_, TransportError>(transport) })
    }
}
