//! Directory plumbing and the per-directory instance lock.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::StorageError;

/// Name of the lockfile created in both the data and index root.
pub const LOCKFILE: &str = ".lockfile";

/// Prefixes of the rotated payload files, used by [`dir_clean_payload`].
const PAYLOAD_PREFIXES: [&str; 2] = ["zdb-data-", "zdb-index-"];

pub fn dir_exists(path: &Path) -> bool {
    path.is_dir()
}

pub fn file_exists(path: &Path) -> bool {
    path.is_file()
}

/// Creates a directory and any missing parents.
pub fn dir_create(path: &Path) -> std::io::Result<()> {
    fs::create_dir_all(path)
}

/// Removes a directory tree.
pub fn dir_remove(path: &Path) -> std::io::Result<()> {
    fs::remove_dir_all(path)
}

/// Removes the rotated data/index files of a directory, keeping everything
/// else (notably the namespace descriptor).
pub fn dir_clean_payload(path: &Path) -> std::io::Result<usize> {
    let mut removed = 0;

    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };

        if PAYLOAD_PREFIXES.iter().any(|p| name.starts_with(p)) {
            tracing::debug!(file = %entry.path().display(), "removing payload file");
            fs::remove_file(entry.path())?;
            removed += 1;
        }
    }

    Ok(removed)
}

/// Exclusive advisory lock on a storage root.
///
/// Only one instance may use a data or index directory at a time; the lock
/// file descriptor stays open for the process lifetime and the lock is
/// released when the guard drops.
#[derive(Debug)]
pub struct DirLock {
    file: File,
    path: PathBuf,
}

impl DirLock {
    /// Creates `<root>/.lockfile` and takes the exclusive lock.
    ///
    /// Fails with [`StorageError::Locked`] when another instance already
    /// holds it.
    pub fn acquire(root: &Path) -> Result<DirLock, StorageError> {
        let path = root.join(LOCKFILE);
        tracing::debug!(lockfile = %path.display(), "checking lockfile");

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        if file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked { path });
        }

        Ok(DirLock { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}
