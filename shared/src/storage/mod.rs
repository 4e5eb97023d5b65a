pub mod client;
pub mod gc;
pub mod memory;
pub mod response;
pub mod s3;
pub mod scratch;

use async_trait::async_trait;
use bytes::Bytes;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncRead;

pub use client::StorageClient;
pub use scratch::{CleanupOutcome, ScratchDir};

#[derive(Debug, Error)]
pub enum StorageError {
    /// Connection refused, endpoint unreachable, connection closed or read timeout.
    #[error("Transient storage error: {0}")]
    Transient(String),
    #[error("Content not found: {0}")]
    NotFound(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Storage error: {0}")]
    Backend(String),
    #[error("Bucket {0} does not exist and could not be created")]
    BucketUnavailable(String),
    #[error("Remote storage is not enabled")]
    Disabled,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Storage operation cancelled")]
    Cancelled,
    #[error("Retry deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHead {
    pub content_length: u64,
    pub content_type: Option<String>,
}

/// Readable body of a remote object. Dropping it closes the underlying stream.
pub struct ObjectBody {
    pub head: ObjectHead,
    pub reader: Pin<Box<dyn AsyncRead + Send>>,
}

impl std::fmt::Debug for ObjectBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectBody")
            .field("head", &self.head)
            .finish_non_exhaustive()
    }
}

/// A handle to a single bucket of an S3-compatible store.
#[async_trait]
pub trait ObjectBackend: Send + Sync {
    fn bucket(&self) -> &str;

    async fn head_bucket(&self) -> Result<(), StorageError>;

    async fn create_bucket(&self) -> Result<(), StorageError>;

    /// Object metadata, `StorageError::NotFound` when the key is absent
    async fn head_object(&self, key: &str) -> Result<ObjectHead, StorageError>;

    async fn get_object(&self, key: &str) -> Result<ObjectBody, StorageError>;

    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        content_type: Option<&str>,
    ) -> Result<(), StorageError>;

    async fn delete_object(&self, key: &str) -> Result<(), StorageError>;

    async fn presign_get(&self, key: &str, expires_in: Duration) -> Result<String, StorageError>;
}

/// Creates backend handles. Called again whenever a handle is discarded after
/// a connection-level failure.
#[async_trait]
pub trait BackendFactory: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn ObjectBackend>, StorageError>;
}
