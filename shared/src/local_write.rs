//! Writes of final output files, retried for a bounded amount of wall-clock
//! time. Local disks and network mounts fail differently from the remote
//! store: a stuck write has to give up eventually so the batch can move on.

use crate::config::{parse_var, ConfigError};
use crate::storage::scratch::remove_path;
use crate::utils::generate_ulid;
use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use serde::Serialize;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

#[derive(Debug, Clone)]
pub struct WriteRetryPolicy {
    /// Pause between attempts
    pub delay: Duration,
    /// No new attempt is started once this much time has passed
    pub ceiling: Duration,
    /// Checked before every retry; a cancelled token gives up immediately
    pub cancel: CancellationToken,
}

impl Default for WriteRetryPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(2),
            ceiling: Duration::from_secs(60),
            cancel: CancellationToken::new(),
        }
    }
}

impl WriteRetryPolicy {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            delay: Duration::from_millis(parse_var("WRITE_RETRY_DELAY_MS", 2000)?),
            ceiling: Duration::from_secs(parse_var("WRITE_RETRY_CEILING_SECS", 60)?),
            ..Self::default()
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum WriteOutcome {
    Written {
        attempts: u32,
    },
    GaveUp {
        attempts: u32,
        elapsed: Duration,
        last_error: String,
    },
}

impl WriteOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, WriteOutcome::Written { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            WriteOutcome::Written { attempts } | WriteOutcome::GaveUp { attempts, .. } => {
                *attempts
            }
        }
    }
}

fn retry_until_ceiling<F>(
    what: &str,
    dst: &Path,
    policy: &WriteRetryPolicy,
    mut write: F,
) -> WriteOutcome
where
    F: FnMut() -> io::Result<()>,
{
    let started = Instant::now();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let error = match write() {
            Ok(()) => {
                debug!(what, dst = %dst.display(), attempts, "local write succeeded");
                return WriteOutcome::Written { attempts };
            }
            Err(e) => e,
        };

        let elapsed = started.elapsed();
        let cancelled = policy.cancel.is_cancelled();
        if cancelled || elapsed >= policy.ceiling {
            error!(
                what,
                dst = %dst.display(),
                attempts,
                elapsed_ms = elapsed.as_millis() as u64,
                cancelled,
                error = %error,
                "local write failed permanently"
            );
            return WriteOutcome::GaveUp {
                attempts,
                elapsed,
                last_error: error.to_string(),
            };
        }

        warn!(
            what,
            dst = %dst.display(),
            attempt = attempts,
            error = %error,
            "local write failed, retrying in {:?}",
            policy.delay
        );
        sleep(policy.delay);
    }
}

/// Hidden sibling of `dst` that keeps its extension, so format detection
/// still works on it.
fn staging_path(dst: &Path) -> PathBuf {
    let name = dst
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dst.with_file_name(format!(".{}.part-{}", generate_ulid(), name))
}

/// Run `write` against a staging file and rename it over `dst`, so `dst` is
/// either absent, the previous content, or complete.
fn write_atomically<F>(dst: &Path, write: F) -> io::Result<()>
where
    F: FnOnce(&Path) -> io::Result<()>,
{
    let staging = staging_path(dst);
    let result = write(&staging).and_then(|()| fs::rename(&staging, dst));
    if result.is_err() {
        remove_path(&staging);
    }
    result
}

/// Copy `src` to `dst`, retrying until the policy ceiling.
pub fn copy_with_retry(src: &Path, dst: &Path, policy: &WriteRetryPolicy) -> WriteOutcome {
    retry_until_ceiling("copy", dst, policy, || {
        write_atomically(dst, |staging| fs::copy(src, staging).map(|_| ()))
    })
}

/// Encode `image` and write it to `dst`, retrying until the policy ceiling.
///
/// JPEG destinations are encoded at `quality`; any other extension uses the
/// format implied by the extension.
pub fn save_with_retry(
    image: &DynamicImage,
    dst: &Path,
    quality: u8,
    policy: &WriteRetryPolicy,
) -> WriteOutcome {
    let jpeg = is_jpeg_path(dst);
    retry_until_ceiling("save", dst, policy, || {
        write_atomically(dst, |staging| save_image(image, staging, jpeg, quality))
    })
}

pub fn is_jpeg_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("jpg") || e.eq_ignore_ascii_case("jpeg"))
}

/// Encode `image` as JPEG at `quality` into `writer`.
pub fn encode_jpeg<W: Write>(image: &DynamicImage, quality: u8, writer: W) -> io::Result<()> {
    JpegEncoder::new_with_quality(writer, quality)
        .encode_image(&image.to_rgb8())
        .map_err(io::Error::other)
}

fn save_image(image: &DynamicImage, path: &Path, jpeg: bool, quality: u8) -> io::Result<()> {
    if jpeg {
        let mut writer = BufWriter::new(fs::File::create(path)?);
        encode_jpeg(image, quality, &mut writer)?;
        writer.flush()
    } else {
        image.save(path).map_err(io::Error::other)
    }
}
