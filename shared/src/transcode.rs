//! Size-constrained JPEG transcoding.
//!
//! The quality search walks down from the requested quality, coarsely while
//! the encoded size is far over budget and one step at a time near it. It
//! never attempts the floor quality itself. When no quality fits, the
//! smallest attempt is written anyway and reported as [`TranscodeStatus::Partial`].

use crate::local_write::{
    copy_with_retry, encode_jpeg, save_with_retry, WriteOutcome, WriteRetryPolicy,
};
use crate::storage::scratch::remove_path;
use crate::utils::generate_ulid;
use image::imageops::FilterType;
use image::{DynamicImage, ImageError};
use serde::Serialize;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Lowest quality the search would reach; never attempted itself.
pub const QUALITY_FLOOR: u8 = 20;
pub const DEFAULT_QUALITY: u8 = 80;
/// Overshoot beyond which the search drops quality in coarse steps.
const COARSE_OVERSHOOT_KB: f64 = 300.0;
const COARSE_STEP: u8 = 5;

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("Quality must be between 1 and 100, got {0}")]
    InvalidQuality(u8),
    #[error("Image error: {0}")]
    Image(#[from] ImageError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to write {path}: {reason}")]
    WriteFailed { path: PathBuf, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscodeTarget {
    pub max_size_kb: Option<u64>,
    pub quality: u8,
    pub resize_to: Option<(u32, u32)>,
}

impl Default for TranscodeTarget {
    fn default() -> Self {
        Self {
            max_size_kb: None,
            quality: DEFAULT_QUALITY,
            resize_to: None,
        }
    }
}

impl TranscodeTarget {
    /// Nothing to do: the original bytes can be copied through unchanged.
    pub fn is_passthrough(&self) -> bool {
        self.max_size_kb.is_none() && self.resize_to.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TranscodeStatus {
    /// Fits the size budget
    Success,
    /// Nothing fit above the floor; the smallest attempt was written
    Partial,
    /// Resized without a size budget
    Resized,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscodeReport {
    pub status: TranscodeStatus,
    /// Size of the written file in binary kilobytes
    pub size_kb: f64,
    /// Quality of the written file
    pub quality: u8,
    /// Every quality that was encoded, in order
    pub ladder: Vec<u8>,
}

/// Next quality to try after an attempt of `size_kb` against `max_size_kb`.
pub fn next_quality(quality: u8, size_kb: f64, max_size_kb: f64) -> u8 {
    if size_kb - max_size_kb > COARSE_OVERSHOOT_KB {
        quality.saturating_sub(COARSE_STEP)
    } else {
        quality.saturating_sub(1)
    }
}

fn size_kb(path: &Path) -> io::Result<f64> {
    Ok(fs::metadata(path)?.len() as f64 / 1024.0)
}

fn check_quality(quality: u8) -> Result<(), TranscodeError> {
    if (1..=100).contains(&quality) {
        Ok(())
    } else {
        Err(TranscodeError::InvalidQuality(quality))
    }
}

#[derive(Debug, Clone)]
pub struct Transcoder {
    scratch_dir: PathBuf,
    write_policy: WriteRetryPolicy,
}

impl Transcoder {
    /// Intermediate encodes are written to `scratch_dir`, which must exist.
    pub fn new(scratch_dir: impl Into<PathBuf>, write_policy: WriteRetryPolicy) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
            write_policy,
        }
    }

    pub fn resize_only(&self, image: &DynamicImage, (width, height): (u32, u32)) -> DynamicImage {
        image.resize_exact(width, height, FilterType::Lanczos3)
    }

    /// Apply `target` to `image` and write the result to `dest`.
    ///
    /// Returns `None` for a passthrough target; the caller copies the
    /// original bytes instead.
    pub fn apply(
        &self,
        image: &DynamicImage,
        target: &TranscodeTarget,
        dest: &Path,
    ) -> Result<Option<TranscodeReport>, TranscodeError> {
        check_quality(target.quality)?;

        let resized = target.resize_to.map(|dims| self.resize_only(image, dims));
        let image = resized.as_ref().unwrap_or(image);

        if let Some(max_size_kb) = target.max_size_kb {
            return self
                .compress_to_budget(image, target.quality, max_size_kb, dest)
                .map(Some);
        }
        if resized.is_none() {
            return Ok(None);
        }

        let outcome = save_with_retry(image, dest, target.quality, &self.write_policy);
        ensure_written(outcome, dest)?;

        Ok(Some(TranscodeReport {
            status: TranscodeStatus::Resized,
            size_kb: size_kb(dest)?,
            quality: target.quality,
            ladder: vec![target.quality],
        }))
    }

    /// Search for the highest quality not above `start_quality` whose JPEG
    /// encoding fits in `max_size_kb`, and write it to `dest`.
    pub fn compress_to_budget(
        &self,
        image: &DynamicImage,
        start_quality: u8,
        max_size_kb: u64,
        dest: &Path,
    ) -> Result<TranscodeReport, TranscodeError> {
        check_quality(start_quality)?;

        let attempt_path = self
            .scratch_dir
            .join(format!("enc_{}.jpg", generate_ulid()));
        let result = self.search(image, start_quality, max_size_kb as f64, &attempt_path, dest);
        remove_path(&attempt_path);
        result
    }

    fn search(
        &self,
        image: &DynamicImage,
        start_quality: u8,
        budget_kb: f64,
        attempt_path: &Path,
        dest: &Path,
    ) -> Result<TranscodeReport, TranscodeError> {
        let mut ladder = Vec::new();
        let mut quality = start_quality;
        let mut last: Option<(u8, f64)> = None;

        while quality > QUALITY_FLOOR {
            self.encode_to(image, quality, attempt_path)?;
            let size = size_kb(attempt_path)?;
            ladder.push(quality);
            debug!(quality, size_kb = size, budget_kb, "encoded attempt");

            if size <= budget_kb {
                ensure_written(copy_with_retry(attempt_path, dest, &self.write_policy), dest)?;
                info!(
                    dest = %dest.display(),
                    quality,
                    size_kb = size,
                    passes = ladder.len(),
                    "compressed within budget"
                );
                return Ok(TranscodeReport {
                    status: TranscodeStatus::Success,
                    size_kb: size,
                    quality,
                    ladder,
                });
            }

            last = Some((quality, size));
            quality = next_quality(quality, size, budget_kb);
        }

        let (quality, size) = match last {
            Some(last) => last,
            // Start quality at or below the floor: one encode, written as-is
            None => {
                self.encode_to(image, start_quality, attempt_path)?;
                ladder.push(start_quality);
                (start_quality, size_kb(attempt_path)?)
            }
        };

        ensure_written(copy_with_retry(attempt_path, dest, &self.write_policy), dest)?;
        warn!(
            dest = %dest.display(),
            quality,
            size_kb = size,
            budget_kb,
            "could not reach size budget, wrote smallest attempt"
        );

        Ok(TranscodeReport {
            status: TranscodeStatus::Partial,
            size_kb: size,
            quality,
            ladder,
        })
    }

    fn encode_to(&self, image: &DynamicImage, quality: u8, path: &Path) -> Result<(), TranscodeError> {
        let mut writer = BufWriter::new(fs::File::create(path)?);
        encode_jpeg(image, quality, &mut writer)?;
        writer.flush()?;
        Ok(())
    }
}

fn ensure_written(outcome: WriteOutcome, dest: &Path) -> Result<(), TranscodeError> {
    match outcome {
        WriteOutcome::Written { .. } => Ok(()),
        WriteOutcome::GaveUp { last_error, .. } => Err(TranscodeError::WriteFailed {
            path: dest.to_path_buf(),
            reason: last_error,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Pseudo-random pixels compress badly, which keeps JPEG sizes predictable.
    fn noise_image(width: u32, height: u32) -> DynamicImage {
        let mut state: u32 = 0x2545_f491;
        let img = RgbImage::from_fn(width, height, |_, _| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            let [r, g, b, _] = state.to_le_bytes();
            Rgb([r, g, b])
        });
        DynamicImage::ImageRgb8(img)
    }

    fn transcoder(dir: &TempDir) -> Transcoder {
        Transcoder::new(
            dir.path(),
            WriteRetryPolicy {
                delay: Duration::from_millis(10),
                ceiling: Duration::from_millis(50),
                ..WriteRetryPolicy::default()
            },
        )
    }

    fn scratch_is_empty(dir: &TempDir) -> bool {
        fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .all(|e| !e.file_name().to_string_lossy().starts_with("enc_"))
    }

    #[test]
    fn test_next_quality_steps() {
        assert_eq!(next_quality(80, 900.0, 200.0), 75);
        assert_eq!(next_quality(80, 500.0, 200.0), 79);
        assert_eq!(next_quality(80, 200.5, 200.0), 79);
        assert_eq!(next_quality(3, 10_000.0, 1.0), 0);
    }

    #[test]
    fn test_first_quality_fits_in_one_pass() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("out.jpg");

        let report = transcoder(&dir)
            .compress_to_budget(&noise_image(64, 64), 80, 1_000_000, &dest)
            .unwrap();

        assert_eq!(report.status, TranscodeStatus::Success);
        assert_eq!(report.ladder, vec![80]);
        assert_eq!(report.quality, 80);
        assert_eq!(fs::metadata(&dest).unwrap().len() as f64 / 1024.0, report.size_kb);
        assert!(scratch_is_empty(&dir));
    }

    #[test]
    fn test_unreachable_budget_writes_floor_attempt() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("out.jpg");

        let report = transcoder(&dir)
            .compress_to_budget(&noise_image(96, 96), 35, 1, &dest)
            .unwrap();

        assert_eq!(report.status, TranscodeStatus::Partial);
        assert!(dest.exists());
        assert!(report.ladder.windows(2).all(|w| w[0] > w[1]));
        assert!(report.ladder.iter().all(|&q| q > QUALITY_FLOOR));
        assert!(report.ladder.len() <= usize::from(35 - QUALITY_FLOOR));
        assert_eq!(report.quality, *report.ladder.last().unwrap());
        assert_eq!(report.quality, QUALITY_FLOOR + 1);
        assert!(scratch_is_empty(&dir));
    }

    #[test]
    fn test_search_lands_on_highest_fitting_quality() {
        let dir = TempDir::new().unwrap();
        let image = noise_image(96, 96);
        let tc = transcoder(&dir);

        // Budget set just above what quality 60 produces
        let reference = dir.path().join("reference.jpg");
        tc.encode_to(&image, 60, &reference).unwrap();
        let budget = (size_kb(&reference).unwrap().ceil()) as u64;

        let dest = dir.path().join("out.jpg");
        let report = tc.compress_to_budget(&image, 70, budget, &dest).unwrap();

        assert_eq!(report.status, TranscodeStatus::Success);
        assert!(report.quality >= 60);
        assert!(report.size_kb <= budget as f64);
        assert!(report.ladder.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn test_start_at_floor_encodes_once() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("out.jpg");

        let report = transcoder(&dir)
            .compress_to_budget(&noise_image(32, 32), QUALITY_FLOOR, 1_000_000, &dest)
            .unwrap();

        assert_eq!(report.status, TranscodeStatus::Partial);
        assert_eq!(report.ladder, vec![QUALITY_FLOOR]);
        assert!(dest.exists());
    }

    #[test]
    fn test_rejects_out_of_range_quality() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("out.jpg");
        let tc = transcoder(&dir);
        let image = noise_image(8, 8);

        assert!(matches!(
            tc.compress_to_budget(&image, 0, 100, &dest),
            Err(TranscodeError::InvalidQuality(0))
        ));
        assert!(matches!(
            tc.compress_to_budget(&image, 101, 100, &dest),
            Err(TranscodeError::InvalidQuality(101))
        ));
    }

    #[test]
    fn test_apply_resize_without_budget() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("out.jpg");
        let target = TranscodeTarget {
            resize_to: Some((20, 10)),
            ..TranscodeTarget::default()
        };

        let report = transcoder(&dir)
            .apply(&noise_image(64, 48), &target, &dest)
            .unwrap()
            .unwrap();

        assert_eq!(report.status, TranscodeStatus::Resized);
        let written = image::open(&dest).unwrap();
        assert_eq!((written.width(), written.height()), (20, 10));
    }

    #[test]
    fn test_apply_passthrough_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("out.jpg");

        let report = transcoder(&dir)
            .apply(&noise_image(8, 8), &TranscodeTarget::default(), &dest)
            .unwrap();

        assert!(report.is_none());
        assert!(!dest.exists());
    }

    #[test]
    fn test_write_failure_surfaces() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"").unwrap();

        let result = transcoder(&dir).compress_to_budget(
            &noise_image(8, 8),
            80,
            1_000_000,
            &blocker.join("out.jpg"),
        );
        assert!(matches!(result, Err(TranscodeError::WriteFailed { .. })));
        assert!(scratch_is_empty(&dir));
    }
}
