use crate::keys::{object_key, ShardedKey};
use crate::local_write::{copy_with_retry, is_jpeg_path, WriteOutcome, WriteRetryPolicy};
use crate::storage::{StorageClient, StorageError};
use crate::transcode::{TranscodeReport, TranscodeTarget, Transcoder};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub collection: String,
    pub output_dir: PathBuf,
    pub target: TranscodeTarget,
    /// Refetch even when the output already satisfies the target
    pub overwrite: bool,
    pub write_policy: WriteRetryPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ItemStatus {
    Saved {
        path: PathBuf,
        /// `None` when the original bytes were copied unchanged
        transcode: Option<TranscodeReport>,
    },
    NotFound,
    AlreadyPresent {
        path: PathBuf,
    },
    Failed {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemReport {
    pub key: String,
    /// Full object key that was checked, if the input formed a valid key
    pub object_key: Option<String>,
    pub status: ItemStatus,
}

#[derive(Debug, Default, Serialize)]
pub struct BatchReport {
    /// One entry per processed input key, in input order
    pub items: Vec<ItemReport>,
    /// The run stopped early; keys after the last item were not processed
    pub cancelled: bool,
}

impl BatchReport {
    /// Paths of the files written by this run.
    pub fn saved_paths(&self) -> Vec<&Path> {
        self.items
            .iter()
            .filter_map(|item| match &item.status {
                ItemStatus::Saved { path, .. } => Some(path.as_path()),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, predicate: impl Fn(&ItemStatus) -> bool) -> usize {
        self.items.iter().filter(|item| predicate(&item.status)).count()
    }
}

/// Output file for `filename`. Transcoded output is always JPEG; a
/// non-JPEG original keeps its full name with `.jpg` appended, so
/// `ab12.png` and `ab12.tif` never share an output.
pub fn output_path(output_dir: &Path, filename: &str, target: &TranscodeTarget) -> PathBuf {
    let path = output_dir.join(filename);
    if target.is_passthrough() || is_jpeg_path(&path) {
        path
    } else {
        output_dir.join(format!("{}.jpg", filename))
    }
}

/// Whether an existing output already meets the target: within the size
/// budget and, when resizing, at exactly the requested dimensions.
fn already_satisfied(dest: &Path, target: &TranscodeTarget) -> bool {
    let Ok(meta) = std::fs::metadata(dest) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    if let Some(max_kb) = target.max_size_kb {
        if meta.len() as f64 / 1024.0 > max_kb as f64 {
            return false;
        }
    }
    match target.resize_to {
        Some(dims) => image::image_dimensions(dest).ok() == Some(dims),
        None => true,
    }
}

enum ItemError {
    Stop(StorageError),
    Failed(String),
}

impl From<StorageError> for ItemError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Cancelled | StorageError::DeadlineExceeded(_) => ItemError::Stop(e),
            other => ItemError::Failed(other.to_string()),
        }
    }
}

/// Fetches a list of originals from one collection and writes them locally.
pub struct BatchFetcher<'a> {
    client: &'a StorageClient,
    options: BatchOptions,
}

impl<'a> BatchFetcher<'a> {
    pub fn new(client: &'a StorageClient, options: BatchOptions) -> Self {
        Self { client, options }
    }

    pub async fn run(&self, keys: &[String]) -> BatchReport {
        let mut report = BatchReport::default();

        if let Err(e) = tokio::fs::create_dir_all(&self.options.output_dir).await {
            error!(
                output_dir = %self.options.output_dir.display(),
                error = %e,
                "could not create output directory"
            );
            let reason = format!("output directory unavailable: {}", e);
            report.items = keys
                .iter()
                .map(|key| ItemReport {
                    key: key.clone(),
                    object_key: None,
                    status: ItemStatus::Failed {
                        reason: reason.clone(),
                    },
                })
                .collect();
            return report;
        }

        info!(
            collection = %self.options.collection,
            keys = keys.len(),
            output_dir = %self.options.output_dir.display(),
            "starting batch"
        );

        // Output path -> key that wrote it during this run
        let mut written = HashMap::new();
        for key in keys {
            match self.process(key, &mut written).await {
                Ok(item) => report.items.push(item),
                Err(e) => {
                    warn!(key = %key, error = %e, "batch stopped");
                    report.cancelled = true;
                    break;
                }
            }
        }

        info!(
            saved = report.count(|s| matches!(s, ItemStatus::Saved { .. })),
            not_found = report.count(|s| matches!(s, ItemStatus::NotFound)),
            already_present = report.count(|s| matches!(s, ItemStatus::AlreadyPresent { .. })),
            failed = report.count(|s| matches!(s, ItemStatus::Failed { .. })),
            cancelled = report.cancelled,
            "batch finished"
        );
        report
    }

    /// Process one key. Only cancellation is returned as an error.
    async fn process(
        &self,
        key: &str,
        written: &mut HashMap<PathBuf, String>,
    ) -> Result<ItemReport, StorageError> {
        let sharded = match ShardedKey::new(&self.options.collection, key) {
            Ok(sharded) => sharded,
            Err(e) => {
                error!(key = %key, error = %e, "invalid key");
                return Ok(ItemReport {
                    key: key.to_string(),
                    object_key: None,
                    status: ItemStatus::Failed {
                        reason: e.to_string(),
                    },
                });
            }
        };
        let rel = sharded.relative_key();
        let full_key = object_key(&self.client.config().prefix, &rel);

        let status = match self.fetch(key, &sharded, &rel, written).await {
            Ok(status) => status,
            Err(ItemError::Stop(e)) => return Err(e),
            Err(ItemError::Failed(reason)) => {
                error!(key = %key, object_key = %full_key, reason = %reason, "item failed");
                ItemStatus::Failed { reason }
            }
        };

        Ok(ItemReport {
            key: key.to_string(),
            object_key: Some(full_key),
            status,
        })
    }

    async fn fetch(
        &self,
        key: &str,
        sharded: &ShardedKey,
        rel: &str,
        written: &mut HashMap<PathBuf, String>,
    ) -> Result<ItemStatus, ItemError> {
        let target = &self.options.target;
        let dest = output_path(&self.options.output_dir, sharded.filename(), target);

        if let Some(owner) = written.get(&dest).filter(|owner| owner.as_str() != key) {
            return Err(ItemError::Failed(format!(
                "output {} was already written for {} in this run",
                dest.display(),
                owner
            )));
        }

        if !self.options.overwrite && already_satisfied(&dest, target) {
            debug!(key = %rel, path = %dest.display(), "output already present, skipping");
            return Ok(ItemStatus::AlreadyPresent { path: dest });
        }

        if !self.client.exists(rel).await? {
            info!(key = %rel, "object not found");
            return Ok(ItemStatus::NotFound);
        }

        let downloaded = self.client.download_to_scratch(rel).await?;
        let result = self.write_output(&downloaded, &dest).await;
        self.client.release_download(&downloaded);

        let transcode = result.map_err(ItemError::Failed)?;
        info!(key = %rel, path = %dest.display(), "saved");
        written.insert(dest.clone(), key.to_string());
        Ok(ItemStatus::Saved {
            path: dest,
            transcode,
        })
    }

    /// Transcode or copy the downloaded file to `dest` on the blocking pool.
    async fn write_output(
        &self,
        downloaded: &Path,
        dest: &Path,
    ) -> Result<Option<TranscodeReport>, String> {
        let downloaded = downloaded.to_path_buf();
        let dest = dest.to_path_buf();
        let target = self.options.target.clone();
        let policy = WriteRetryPolicy {
            cancel: self.client.cancel_token().clone(),
            ..self.options.write_policy.clone()
        };

        let task = tokio::task::spawn_blocking(move || {
            if target.is_passthrough() {
                return match copy_with_retry(&downloaded, &dest, &policy) {
                    WriteOutcome::Written { .. } => Ok(None),
                    WriteOutcome::GaveUp { last_error, .. } => Err(last_error),
                };
            }

            let image = image::open(&downloaded).map_err(|e| format!("decode failed: {}", e))?;
            let scratch = downloaded
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(std::env::temp_dir);
            Transcoder::new(scratch, policy)
                .apply(&image, &target, &dest)
                .map_err(|e| e.to_string())
        });

        task.await
            .map_err(|e| format!("write task failed: {}", e))?
    }
}
