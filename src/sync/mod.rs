//! Fingerprint-based workspace synchronisation.
//!
//! [`SyncEngine`] walks a local tree, compares every file with the
//! [`FingerprintCache`] entry for the destination, and uploads only the files
//! whose content changed. Transfers run with bounded concurrency; each cache
//! entry is written strictly after its own upload was acknowledged, so the
//! cache never runs ahead of the destination. A failed transfer drops the
//! entry, since the destination may now hold a partial file. Failures are
//! collected per file and never abort the rest of the plan.
//!
//! Syncs to the same destination are serialised: a second sync queues
//! behind the one in flight. Syncs to different destinations run
//! concurrently.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::sink::LogSink;

mod fingerprint;
mod plan;
mod settings;
mod transport;

pub use fingerprint::{Fingerprint, FingerprintCache};
pub use plan::{ChangeKind, FileDelta, Snapshot, SyncPlan, build_plan, scan, walk_files};
pub use settings::{ActiveSettings, IgnoreSet, ResolvedSettings, SyncSettings, SyncSettingsError};
pub use transport::{
    LocalTransport, LocalTransportFactory, SshTransport, SshTransportFactory, Transport,
    TransportError, TransportFactory, TransportFuture, remote_workspace_path,
};

/// Default number of concurrent transfers.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Failure of a single file operation; never aborts the batch.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{path}: {message}")]
pub struct TransferFailure {
    /// Path relative to the source root.
    pub path: Utf8PathBuf,
    /// Description of the failure.
    pub message: String,
}

/// Errors that prevent a sync from being planned at all.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SyncError {
    /// The source directory does not exist.
    #[error("sync source directory missing: {path}")]
    MissingSource {
        /// Path that was expected to be synchronised.
        path: Utf8PathBuf,
    },
    /// Listing the source tree failed.
    #[error("failed to walk {path}: {message}")]
    Walk {
        /// Root being walked.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
}

/// Why a save-triggered copy was skipped without touching the destination.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SkipReason {
    /// Syncing is disabled in the active settings.
    Disabled,
    /// The path matches an ignore pattern.
    Ignored,
    /// The path is outside the workspace root.
    OutsideWorkspace,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disabled => "sync disabled",
            Self::Ignored => "path ignored",
            Self::OutsideWorkspace => "path outside workspace",
        })
    }
}

/// Outcome of one sync or copy operation.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SyncResult {
    /// Destination key the operation targeted.
    pub destination: String,
    /// Files uploaded and acknowledged, sorted.
    pub transferred: Vec<Utf8PathBuf>,
    /// Orphans removed from the destination, sorted.
    pub deleted: Vec<Utf8PathBuf>,
    /// Files skipped because their fingerprint was already acknowledged.
    pub unchanged: usize,
    /// Set when a copy short-circuited.
    pub skipped: Option<SkipReason>,
    /// Per-file failures, sorted by path.
    pub failures: Vec<TransferFailure>,
}

impl SyncResult {
    fn skipped(reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            ..Self::default()
        }
    }

    /// Returns `true` when no file failed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Writes a summary followed by one line per failure to `sink`.
    pub fn report(&self, sink: &dyn LogSink) {
        if let Some(reason) = self.skipped {
            sink.append(&format!("[sync] skipped: {reason}"));
            return;
        }
        sink.append(&format!(
            "[sync] {}: {} transferred, {} deleted, {} unchanged, {} failed",
            self.destination,
            self.transferred.len(),
            self.deleted.len(),
            self.unchanged,
            self.failures.len()
        ));
        for failure in &self.failures {
            sink.append(&format!("[sync] failed {failure}"));
        }
    }

    fn finish(&mut self) {
        self.transferred.sort();
        self.deleted.sort();
        self.failures.sort_by(|a, b| a.path.cmp(&b.path));
    }
}

enum Applied {
    Uploaded(Utf8PathBuf),
    Deleted(Utf8PathBuf),
    Failed(TransferFailure),
}

/// Plans and applies workspace syncs.
pub struct SyncEngine {
    cache: Arc<FingerprintCache>,
    settings: ActiveSettings,
    concurrency: usize,
    gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncEngine")
            .field("settings", &self.settings)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

impl Default for SyncEngine {
    fn default() -> Self {
        Self::new(FingerprintCache::global(), DEFAULT_CONCURRENCY)
    }
}

impl SyncEngine {
    /// Creates an engine with disabled settings.
    ///
    /// A concurrency of zero is treated as one.
    #[must_use]
    pub fn new(cache: Arc<FingerprintCache>, concurrency: usize) -> Self {
        Self {
            cache,
            settings: ActiveSettings::default(),
            concurrency: concurrency.max(1),
            gates: Mutex::new(HashMap::new()),
        }
    }

    /// Installs initial settings.
    #[must_use]
    pub fn with_settings(self, settings: ResolvedSettings) -> Self {
        self.settings.replace(settings);
        self
    }

    /// Fingerprint cache backing this engine.
    #[must_use]
    pub fn cache(&self) -> &FingerprintCache {
        &self.cache
    }

    /// Snapshot of the active settings.
    #[must_use]
    pub fn settings(&self) -> Arc<ResolvedSettings> {
        self.settings.current()
    }

    /// Replaces the active settings from a raw configuration value.
    ///
    /// # Errors
    ///
    /// Returns [`SyncSettingsError::Invalid`] after falling back to disabled
    /// settings.
    pub fn apply_settings(&self, value: &Value) -> Result<(), SyncSettingsError> {
        self.settings.apply_value(value)
    }

    fn gate(&self, destination: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(gates.entry(destination.to_owned()).or_default())
    }

    /// Syncs `source` to `transport`.
    ///
    /// Orphan deletion is destructive and only happens when
    /// `delete_orphans` is set.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::MissingSource`] when `source` is not a directory
    /// and [`SyncError::Walk`] when the tree cannot be listed. Per-file
    /// problems are reported in [`SyncResult::failures`].
    pub async fn sync_folder(
        &self,
        source: &Utf8Path,
        transport: Arc<dyn Transport>,
        ignore: &IgnoreSet,
        delete_orphans: bool,
    ) -> Result<SyncResult, SyncError> {
        if !source.is_dir() {
            return Err(SyncError::MissingSource {
                path: source.to_path_buf(),
            });
        }

        let destination = transport.destination_key();
        let gate = self.gate(&destination);
        let _serialised = gate.lock().await;
        info!(%source, %destination, delete_orphans, "starting folder sync");

        let snapshot = Self::snapshot(source, ignore).await?;
        let mut plan = build_plan(source, &destination, &snapshot, &self.cache);

        let mut result = SyncResult {
            destination: destination.clone(),
            unchanged: plan.unchanged,
            failures: snapshot.unreadable.clone(),
            ..SyncResult::default()
        };

        if delete_orphans {
            match transport.list().await {
                Ok(remote) => plan.add_orphans(remote, &snapshot.paths(), ignore),
                Err(err) => result.failures.push(TransferFailure {
                    path: Utf8PathBuf::from("."),
                    message: format!("failed to list destination: {err}"),
                }),
            }
        }

        debug!(
            %destination,
            deltas = plan.deltas.len(),
            unchanged = plan.unchanged,
            "sync planned"
        );
        self.apply(plan, transport, &mut result).await;
        result.finish();
        info!(
            %destination,
            transferred = result.transferred.len(),
            deleted = result.deleted.len(),
            failed = result.failures.len(),
            "folder sync finished"
        );
        Ok(result)
    }

    /// Syncs a workspace using the active ignore patterns.
    ///
    /// Explicit syncs run regardless of the `enabled` flag, which governs
    /// save-triggered copies only.
    ///
    /// # Errors
    ///
    /// See [`SyncEngine::sync_folder`].
    pub async fn sync_workspace(
        &self,
        workspace: &Utf8Path,
        transport: Arc<dyn Transport>,
        delete_orphans: bool,
    ) -> Result<SyncResult, SyncError> {
        let settings = self.settings();
        self.sync_folder(workspace, transport, &settings.ignore, delete_orphans)
            .await
    }

    /// Decides whether a saved file would be copied.
    ///
    /// Returns the path relative to `workspace` when it would.
    ///
    /// # Errors
    ///
    /// Returns the [`SkipReason`] when the copy must not happen.
    pub fn copy_decision(
        &self,
        workspace: &Utf8Path,
        path: &Utf8Path,
    ) -> Result<Utf8PathBuf, SkipReason> {
        let settings = self.settings();
        if !settings.settings.enabled {
            return Err(SkipReason::Disabled);
        }
        let relative = path
            .strip_prefix(workspace)
            .map_err(|_| SkipReason::OutsideWorkspace)?;
        if relative.as_str().is_empty() {
            return Err(SkipReason::OutsideWorkspace);
        }
        if settings.ignore.is_ignored(relative) {
            return Err(SkipReason::Ignored);
        }
        Ok(relative.to_path_buf())
    }

    /// Copies one saved file.
    ///
    /// Skipped copies make no transport calls at all. An unchanged file is
    /// counted in [`SyncResult::unchanged`] without being uploaded.
    pub async fn copy_file(
        &self,
        workspace: &Utf8Path,
        path: &Utf8Path,
        transport: Arc<dyn Transport>,
    ) -> SyncResult {
        let relative = match self.copy_decision(workspace, path) {
            Ok(relative) => relative,
            Err(reason) => {
                debug!(%path, %reason, "copy skipped");
                return SyncResult::skipped(reason);
            }
        };

        let destination = transport.destination_key();
        let gate = self.gate(&destination);
        let _serialised = gate.lock().await;

        let mut result = SyncResult {
            destination: destination.clone(),
            ..SyncResult::default()
        };

        let local = path.to_path_buf();
        let hashed = tokio::task::spawn_blocking(move || Fingerprint::of_file(&local)).await;
        let fingerprint = match hashed {
            Ok(Ok(fingerprint)) => fingerprint,
            Ok(Err(err)) => {
                result.failures.push(TransferFailure {
                    path: relative,
                    message: format!("failed to read: {err}"),
                });
                return result;
            }
            Err(err) => {
                result.failures.push(TransferFailure {
                    path: relative,
                    message: err.to_string(),
                });
                return result;
            }
        };

        if self.cache.get(&destination, &relative).as_ref() == Some(&fingerprint) {
            result.unchanged = 1;
            return result;
        }

        match transport.upload(path, &relative).await {
            Ok(()) => {
                self.cache.record(&destination, &relative, fingerprint);
                info!(%destination, path = %relative, "copied saved file");
                result.transferred.push(relative);
            }
            Err(err) => {
                self.cache.forget(&destination, &relative);
                warn!(%destination, path = %relative, error = %err, "copy failed");
                result.failures.push(TransferFailure {
                    path: relative,
                    message: err.to_string(),
                });
            }
        }
        result
    }

    async fn snapshot(source: &Utf8Path, ignore: &IgnoreSet) -> Result<Snapshot, SyncError> {
        let root = source.to_path_buf();
        let patterns = ignore.clone();
        let walk_error = |message: String| SyncError::Walk {
            path: source.to_path_buf(),
            message,
        };
        tokio::task::spawn_blocking(move || scan(&root, &patterns))
            .await
            .map_err(|err| walk_error(err.to_string()))?
            .map_err(|err| walk_error(err.to_string()))
    }

    async fn apply(
        &self,
        plan: SyncPlan,
        transport: Arc<dyn Transport>,
        result: &mut SyncResult,
    ) {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        let destination = plan.destination;

        for delta in plan.deltas {
            let slots = Arc::clone(&permits);
            let target = Arc::clone(&transport);
            let cache = Arc::clone(&self.cache);
            let key = destination.clone();
            let local = plan.source.join(&delta.path);
            tasks.spawn(async move {
                let Ok(_permit) = slots.acquire_owned().await else {
                    return Applied::Failed(TransferFailure {
                        path: delta.path,
                        message: String::from("transfer queue closed"),
                    });
                };
                apply_delta(delta, &local, target.as_ref(), &cache, &key).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Applied::Uploaded(path)) => result.transferred.push(path),
                Ok(Applied::Deleted(path)) => result.deleted.push(path),
                Ok(Applied::Failed(failure)) => result.failures.push(failure),
                Err(err) => result.failures.push(TransferFailure {
                    path: Utf8PathBuf::from("."),
                    message: format!("transfer task failed: {err}"),
                }),
            }
        }
    }
}

async fn apply_delta(
    delta: FileDelta,
    local: &Utf8Path,
    transport: &dyn Transport,
    cache: &FingerprintCache,
    destination: &str,
) -> Applied {
    let FileDelta {
        path,
        change,
        fingerprint,
    } = delta;
    let outcome = match change {
        ChangeKind::Added | ChangeKind::Modified => transport.upload(local, &path).await,
        ChangeKind::Deleted => transport.remove(&path).await,
    };

    match (outcome, change, fingerprint) {
        (Ok(()), ChangeKind::Deleted, _) => {
            cache.forget(destination, &path);
            debug!(%destination, %path, "removed orphan");
            Applied::Deleted(path)
        }
        (Ok(()), _, Some(acknowledged)) => {
            cache.record(destination, &path, acknowledged);
            debug!(%destination, %path, %change, "uploaded");
            Applied::Uploaded(path)
        }
        (Ok(()), _, None) => Applied::Uploaded(path),
        (Err(err), _, _) => {
            cache.forget(destination, &path);
            warn!(%destination, %path, %change, error = %err, "transfer failed");
            Applied::Failed(TransferFailure {
                path,
                message: err.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests;
