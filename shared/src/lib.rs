pub mod batch;
pub mod config;
pub mod keys;
pub mod local_write;
pub mod retry;
pub mod storage;
pub mod telemetry;
pub mod transcode;
pub mod utils;

pub use batch::{BatchFetcher, BatchOptions, BatchReport, ItemReport, ItemStatus};
pub use config::{ConfigError, StorageConfig};
pub use keys::{KeyError, ShardedKey};
pub use local_write::{WriteOutcome, WriteRetryPolicy};
pub use retry::{Backoff, RetryPolicy};
pub use storage::{CleanupOutcome, ScratchDir, StorageClient, StorageError};
pub use transcode::{TranscodeReport, TranscodeStatus, TranscodeTarget, Transcoder};
