//! Content fingerprints and the process-wide cache of acknowledged uploads.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use blake3::Hasher;
use camino::{Utf8Path, Utf8PathBuf};

/// Content hash plus byte length of one file.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Fingerprint {
    /// Hex-encoded blake3 digest.
    pub hash: String,
    /// Size in bytes.
    pub len: u64,
}

impl Fingerprint {
    /// Hashes `path` in fixed-size chunks.
    ///
    /// # Errors
    ///
    /// Returns the I/O error raised while opening or reading the file.
    pub fn of_file(path: &Utf8Path) -> io::Result<Self> {
        let mut file = File::open(path)?;
        let mut hasher = Hasher::new();
        let mut buf = [0_u8; 8192];
        let mut len = 0_u64;
        loop {
            let read = file.read(&mut buf)?;
            if read == 0 {
                break;
            }
            hasher.update(buf.get(..read).unwrap_or_default());
            len += read as u64;
        }
        Ok(Self {
            hash: hasher.finalize().to_hex().to_string(),
            len,
        })
    }

    /// Fingerprints an in-memory buffer.
    #[must_use]
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self {
            hash: blake3::hash(bytes).to_hex().to_string(),
            len: bytes.len() as u64,
        }
    }
}

type CacheKey = (String, Utf8PathBuf);

/// Last acknowledged fingerprint per destination and relative path.
///
/// Entries are written only after the matching transfer succeeded and
/// removed only after an acknowledged remote delete.
#[derive(Debug, Default)]
pub struct FingerprintCache {
    entries: RwLock<HashMap<CacheKey, Fingerprint>>,
}

static GLOBAL: OnceLock<Arc<FingerprintCache>> = OnceLock::new();

impl FingerprintCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache shared by the whole process.
    #[must_use]
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Self::new())))
    }

    /// Looks up the acknowledged fingerprint of `relative` at `destination`.
    #[must_use]
    pub fn get(&self, destination: &str, relative: &Utf8Path) -> Option<Fingerprint> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(destination.to_owned(), relative.to_path_buf()))
            .cloned()
    }

    /// Records an acknowledged upload.
    pub fn record(&self, destination: &str, relative: &Utf8Path, fingerprint: Fingerprint) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((destination.to_owned(), relative.to_path_buf()), fingerprint);
    }

    /// Drops the entry after an acknowledged remote delete.
    pub fn forget(&self, destination: &str, relative: &Utf8Path) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(destination.to_owned(), relative.to_path_buf()));
    }

    /// Relative paths cached for `destination`, sorted.
    #[must_use]
    pub fn paths(&self, destination: &str) -> Vec<Utf8PathBuf> {
        let mut paths: Vec<_> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .filter(|(dest, _)| dest == destination)
            .map(|(_, path)| path.clone())
            .collect();
        paths.sort();
        paths
    }
}
