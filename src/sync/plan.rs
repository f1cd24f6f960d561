//! Delta planning between a local tree and a destination.

use std::collections::BTreeSet;
use std::fmt;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

use super::fingerprint::{Fingerprint, FingerprintCache};
use super::settings::IgnoreSet;
use super::TransferFailure;

/// How a file differs from the destination's acknowledged state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChangeKind {
    /// Not yet present at the destination.
    Added,
    /// Present with a different fingerprint.
    Modified,
    /// Present at the destination only.
    Deleted,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Added => "added",
            Self::Modified => "modified",
            Self::Deleted => "deleted",
        })
    }
}

/// One pending change.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileDelta {
    /// Path relative to the source root.
    pub path: Utf8PathBuf,
    /// Kind of change.
    pub change: ChangeKind,
    /// Local fingerprint; absent for deletions.
    pub fingerprint: Option<Fingerprint>,
}

/// Ordered set of deltas from `source` to `destination`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SyncPlan {
    /// Local root.
    pub source: Utf8PathBuf,
    /// Destination key the cache was consulted for.
    pub destination: String,
    /// Deltas sorted by relative path.
    pub deltas: Vec<FileDelta>,
    /// Files whose cached fingerprint already matches.
    pub unchanged: usize,
}

impl SyncPlan {
    /// Returns `true` when nothing needs transferring or deleting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    /// Queues deletions for destination files missing from the local tree.
    ///
    /// Ignored paths are left alone on the destination.
    pub fn add_orphans(
        &mut self,
        remote: impl IntoIterator<Item = Utf8PathBuf>,
        local: &BTreeSet<Utf8PathBuf>,
        ignore: &IgnoreSet,
    ) {
        for path in remote {
            if local.contains(&path) || ignore.is_ignored(&path) {
                continue;
            }
            self.deltas.push(FileDelta {
                path,
                change: ChangeKind::Deleted,
                fingerprint: None,
            });
        }
        self.deltas.sort_by(|a, b| a.path.cmp(&b.path));
        self.deltas.dedup_by(|a, b| a.path == b.path);
    }
}

/// Result of walking and fingerprinting the source tree.
#[derive(Debug, Default)]
pub struct Snapshot {
    /// Fingerprinted files keyed by relative path.
    pub files: Vec<(Utf8PathBuf, Fingerprint)>,
    /// Files that could not be read.
    pub unreadable: Vec<TransferFailure>,
}

impl Snapshot {
    /// Relative paths of every file in the snapshot, readable or not.
    #[must_use]
    pub fn paths(&self) -> BTreeSet<Utf8PathBuf> {
        self.files
            .iter()
            .map(|(path, _)| path.clone())
            .chain(self.unreadable.iter().map(|failure| failure.path.clone()))
            .collect()
    }
}

/// Walks `source`, skipping ignored entries, and fingerprints every file.
///
/// # Errors
///
/// Returns the I/O error raised while listing a directory.
pub fn scan(source: &Utf8Path, ignore: &IgnoreSet) -> io::Result<Snapshot> {
    let mut snapshot = Snapshot::default();
    for relative in walk_files(source, ignore)? {
        let absolute = source.join(&relative);
        match Fingerprint::of_file(&absolute) {
            Ok(fingerprint) => snapshot.files.push((relative, fingerprint)),
            Err(err) => snapshot.unreadable.push(TransferFailure {
                path: relative,
                message: format!("failed to read: {err}"),
            }),
        }
    }
    Ok(snapshot)
}

/// Lists regular files below `root` as sorted relative paths.
///
/// Symbolic links are not followed; ignored directories are not entered.
///
/// # Errors
///
/// Returns the I/O error raised while listing a directory.
pub fn walk_files(root: &Utf8Path, ignore: &IgnoreSet) -> io::Result<Vec<Utf8PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![Utf8PathBuf::new()];
    while let Some(dir) = pending.pop() {
        for item in root.join(&dir).read_dir_utf8()? {
            let entry = item?;
            let relative = dir.join(entry.file_name());
            if ignore.is_ignored(&relative) {
                debug!(path = %relative, "skipping ignored path");
                continue;
            }
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                pending.push(relative);
            } else if file_type.is_file() {
                files.push(relative);
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Compares a snapshot with the cache entries for `destination`.
#[must_use]
pub fn build_plan(
    source: &Utf8Path,
    destination: &str,
    snapshot: &Snapshot,
    cache: &FingerprintCache,
) -> SyncPlan {
    let mut deltas = Vec::new();
    let mut unchanged = 0;
    for (path, fingerprint) in &snapshot.files {
        let change = match cache.get(destination, path) {
            Some(known) if known == *fingerprint => {
                unchanged += 1;
                continue;
            }
            Some(_) => ChangeKind::Modified,
            None => ChangeKind::Added,
        };
        deltas.push(FileDelta {
            path: path.clone(),
            change,
            fingerprint: Some(fingerprint.clone()),
        });
    }
    deltas.sort_by(|a, b| a.path.cmp(&b.path));
    SyncPlan {
        source: source.to_path_buf(),
        destination: destination.to_owned(),
        deltas,
        unchanged,
    }
}
