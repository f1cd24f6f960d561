//! Temporary workspace helpers for integration tests.
//!
//! Shared through `#[path = "common/workspace.rs"] mod workspace;` so no extra
//! integration test binary is created.

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;

/// Temporary workspace directory named `name`.
pub struct Workspace {
    _dir: TempDir,
    /// Parent directory, useful for sibling destinations.
    pub scratch: Utf8PathBuf,
    /// Workspace root.
    pub root: Utf8PathBuf,
}

impl Workspace {
    pub fn new(name: &str) -> Self {
        let dir = TempDir::new().expect("tempdir");
        let scratch = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 tempdir");
        let root = scratch.join(name);
        std::fs::create_dir_all(&root).expect("create workspace");
        Self {
            _dir: dir,
            scratch,
            root,
        }
    }

    pub fn write(&self, relative: &str, contents: &str) -> Utf8PathBuf {
        let path = self.root.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create parent");
        }
        std::fs::write(&path, contents).expect("write file");
        path
    }
}

/// Lists every file below `root` as sorted relative paths.
pub fn tree(root: &Utf8Path) -> Vec<String> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in dir.read_dir_utf8().expect("readable dir") {
            let path = entry.expect("dir entry").into_path();
            if path.is_dir() {
                pending.push(path);
            } else {
                let relative = path.strip_prefix(root).expect("below root");
                files.push(relative.to_string());
            }
        }
    }
    files.sort();
    files
}
