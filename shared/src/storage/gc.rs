use super::scratch::{remove_path, CleanupOutcome};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// Configuration for scratch garbage collection
#[derive(Debug, Clone)]
pub struct ScratchGcConfig {
    /// Parent directory holding every instance's scratch directory
    pub root: PathBuf,
    /// Sibling directories last modified longer ago than this are removed
    pub max_age: Duration,
}

/// Result of a reclaim pass
#[derive(Debug, Default, Serialize)]
pub struct ReclaimReport {
    /// Directories removed by this pass
    pub removed: Vec<PathBuf>,
    /// Directories younger than the threshold, or our own
    pub kept: usize,
    /// Entries that vanished before we got to them
    pub already_gone: usize,
    /// Errors encountered during removal
    pub errors: Vec<String>,
}

/// Reclaims scratch directories left behind by crashed or earlier instances.
///
/// Several instances may reclaim the same root at once; a directory removed by
/// somebody else in the meantime counts as handled.
pub struct ScratchGc {
    config: ScratchGcConfig,
}

impl ScratchGc {
    pub fn new(config: ScratchGcConfig) -> Self {
        Self { config }
    }

    pub fn reclaim_stale(&self, own: Option<&Path>) -> ReclaimReport {
        self.reclaim_stale_at(own, SystemTime::now())
    }

    /// Same as [`ScratchGc::reclaim_stale`], with ages measured against `now`.
    pub fn reclaim_stale_at(&self, own: Option<&Path>, now: SystemTime) -> ReclaimReport {
        let mut report = ReclaimReport::default();

        let entries = match fs::read_dir(&self.config.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return report,
            Err(e) => {
                warn!(root = %self.config.root.display(), error = %e, "scratch reclaim failed");
                report.errors.push(e.to_string());
                return report;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if own.is_some_and(|own| own == path.as_path()) {
                report.kept += 1;
                continue;
            }

            let modified = match entry.metadata().and_then(|m| {
                if m.is_dir() {
                    m.modified().map(Some)
                } else {
                    Ok(None)
                }
            }) {
                Ok(Some(modified)) => modified,
                Ok(None) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    report.already_gone += 1;
                    continue;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "could not inspect scratch directory");
                    report.errors.push(format!("{}: {}", path.display(), e));
                    continue;
                }
            };

            // Modification times in the future count as fresh
            let age = now.duration_since(modified).unwrap_or_default();
            if age <= self.config.max_age {
                report.kept += 1;
                continue;
            }

            match remove_path(&path) {
                CleanupOutcome::Removed => {
                    info!(path = %path.display(), age_secs = age.as_secs(), "cleaned old scratch directory");
                    report.removed.push(path);
                }
                CleanupOutcome::NothingToClean => {
                    debug!(path = %path.display(), "scratch directory already removed");
                    report.already_gone += 1;
                }
                CleanupOutcome::Failed(e) => {
                    report.errors.push(format!("{}: {}", path.display(), e));
                }
            }
        }

        if !report.removed.is_empty() || !report.errors.is_empty() {
            info!(
                "Scratch reclaim completed: removed={}, kept={}, already_gone={}, errors={}",
                report.removed.len(),
                report.kept,
                report.already_gone,
                report.errors.len()
            );
        }

        report
    }
}
