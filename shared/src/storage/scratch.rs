//! Per-instance scratch directories for in-flight downloads.
//!
//! Every connection owns one directory under the scratch root, named
//! `{pid}-{thread}-{uuid}` so that instances in the same or in different
//! processes sharing a filesystem never collide. The directory is removed when
//! it is released explicitly, when its owner is dropped, or when the process
//! drains the live-directory registry on exit.

use dashmap::DashSet;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::LazyLock;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

static LIVE_SCRATCH_DIRS: LazyLock<DashSet<PathBuf>> = LazyLock::new(DashSet::new);

#[derive(Debug, Error)]
pub enum ScratchError {
    #[error("Scratch directory {0} already exists")]
    AlreadyExists(PathBuf),
    #[error("Failed to create scratch directory {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Result of a cleanup step. Cleanup never fails the caller's operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CleanupOutcome {
    Removed,
    NothingToClean,
    Failed(String),
}

impl CleanupOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, CleanupOutcome::Failed(_))
    }
}

/// Delete a file or directory tree, treating "already gone" as success.
pub fn remove_path(path: &Path) -> CleanupOutcome {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => CleanupOutcome::Removed,
        Err(e) if e.kind() == io::ErrorKind::NotFound => CleanupOutcome::NothingToClean,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "could not remove scratch path");
            CleanupOutcome::Failed(e.to_string())
        }
    }
}

#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
    released: AtomicBool,
}

impl ScratchDir {
    /// Create a new, empty directory under `root` that no other instance uses.
    pub fn allocate(root: &Path) -> Result<Self, ScratchError> {
        fs::create_dir_all(root).map_err(|source| ScratchError::Create {
            path: root.to_path_buf(),
            source,
        })?;

        let path = root.join(instance_name());
        fs::create_dir(&path).map_err(|source| {
            if source.kind() == io::ErrorKind::AlreadyExists {
                ScratchError::AlreadyExists(path.clone())
            } else {
                ScratchError::Create {
                    path: path.clone(),
                    source,
                }
            }
        })?;

        LIVE_SCRATCH_DIRS.insert(path.clone());
        debug!(path = %path.display(), "allocated scratch directory");

        Ok(Self {
            path,
            released: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove this instance's directory. Safe to call any number of times.
    pub fn release_own(&self) -> CleanupOutcome {
        if self.released.swap(true, Ordering::SeqCst) {
            return CleanupOutcome::NothingToClean;
        }
        LIVE_SCRATCH_DIRS.remove(&self.path);

        let outcome = remove_path(&self.path);
        if outcome == CleanupOutcome::Removed {
            info!(path = %self.path.display(), "cleaned up own scratch directory");
        }
        outcome
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        self.release_own();
    }
}

/// Remove every scratch directory still registered by this process.
///
/// Registered once by the binary and run on normal exit and on Ctrl-C.
pub fn release_all_live() -> Vec<(PathBuf, CleanupOutcome)> {
    release_live_under(Path::new(""))
}

/// Remove the registered scratch directories that live under `root`.
pub fn release_live_under(root: &Path) -> Vec<(PathBuf, CleanupOutcome)> {
    let paths: Vec<PathBuf> = LIVE_SCRATCH_DIRS
        .iter()
        .map(|p| p.key().clone())
        .filter(|p| p.starts_with(root))
        .collect();
    paths
        .into_iter()
        .map(|path| {
            LIVE_SCRATCH_DIRS.remove(&path);
            let outcome = remove_path(&path);
            (path, outcome)
        })
        .collect()
}

pub fn is_live(path: &Path) -> bool {
    LIVE_SCRATCH_DIRS.contains(path)
}

fn instance_name() -> String {
    let thread_id: String = format!("{:?}", std::thread::current().id())
        .chars()
        .filter(char::is_ascii_digit)
        .collect();
    format!("{}-{}-{}", std::process::id(), thread_id, Uuid::new_v4())
}
