use super::gc::{ReclaimReport, ScratchGc, ScratchGcConfig};
use super::response::{build_stream_response, chunk_stream, ChunkStream};
use super::s3::S3BackendFactory;
use super::scratch::{remove_path, CleanupOutcome, ScratchDir};
use super::{BackendFactory, ObjectBackend, StorageError};
use crate::config::StorageConfig;
use crate::keys::object_key;
use crate::retry::Backoff;
use crate::utils::{dotted_extension, generate_ulid};
use axum::response::Response;
use bytes::Bytes;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const DOWNLOAD_BUFFER_SIZE: usize = 64 * 1024;

/// Connection to the remote store.
///
/// Owns a lazily created backend handle and a private scratch directory.
/// Every remote call goes through the [`Backoff`] policy; a transient failure
/// discards the handle so the next attempt reconnects.
pub struct StorageClient {
    config: StorageConfig,
    factory: Option<Arc<dyn BackendFactory>>,
    handle: Mutex<Option<Arc<dyn ObjectBackend>>>,
    backoff: Backoff,
    scratch: Option<ScratchDir>,
}

impl StorageClient {
    /// Connect to the S3-compatible endpoint from `config`, or build a
    /// disabled client when no endpoint is configured.
    pub fn new(config: StorageConfig, cancel: CancellationToken) -> Result<Self, StorageError> {
        let factory = config
            .is_enabled()
            .then(|| Arc::new(S3BackendFactory::new(config.clone())) as Arc<dyn BackendFactory>);
        Self::with_factory(config, factory, cancel)
    }

    pub fn with_factory(
        config: StorageConfig,
        factory: Option<Arc<dyn BackendFactory>>,
        cancel: CancellationToken,
    ) -> Result<Self, StorageError> {
        // Reclaim before allocating so our own directory is never a candidate
        let gc = ScratchGc::new(ScratchGcConfig {
            root: config.scratch_root.clone(),
            max_age: config.stale_scratch_age(),
        });
        gc.reclaim_stale(None);

        let scratch = match factory {
            Some(_) => Some(
                ScratchDir::allocate(&config.scratch_root)
                    .map_err(|e| StorageError::Config(e.to_string()))?,
            ),
            None => {
                info!("S3_ENDPOINT not set, remote storage disabled");
                None
            }
        };

        Ok(Self {
            backoff: Backoff::new(config.retry.clone(), cancel),
            config,
            factory,
            handle: Mutex::new(None),
            scratch,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.factory.is_some()
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn scratch_path(&self) -> Option<&Path> {
        self.scratch.as_ref().map(ScratchDir::path)
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        self.backoff.cancel_token()
    }

    /// Run another stale-scratch pass, e.g. from a long-lived server.
    pub fn reclaim_stale_scratch(&self) -> ReclaimReport {
        ScratchGc::new(ScratchGcConfig {
            root: self.config.scratch_root.clone(),
            max_age: self.config.stale_scratch_age(),
        })
        .reclaim_stale(self.scratch_path())
    }

    /// Reclaim stale sibling scratch directories every `period` until the
    /// client's cancellation token fires. The first pass runs immediately.
    pub fn spawn_scratch_reclaimer(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            // interval() panics on a zero period
            let mut interval = tokio::time::interval(period.max(Duration::from_secs(1)));
            loop {
                tokio::select! {
                    _ = client.cancel_token().cancelled() => break,
                    _ = interval.tick() => {
                        let report = client.reclaim_stale_scratch();
                        debug!(
                            removed = report.removed.len(),
                            errors = report.errors.len(),
                            "periodic scratch reclaim"
                        );
                    }
                }
            }
        })
    }

    /// Remove this connection's scratch directory.
    pub fn release_scratch(&self) -> CleanupOutcome {
        match &self.scratch {
            Some(scratch) => scratch.release_own(),
            None => CleanupOutcome::NothingToClean,
        }
    }

    fn full_key(&self, rel: &str) -> String {
        object_key(&self.config.prefix, rel)
    }

    async fn get_handle(&self) -> Result<Arc<dyn ObjectBackend>, StorageError> {
        let factory = self.factory.as_ref().ok_or(StorageError::Disabled)?;

        let mut guard = self.handle.lock().await;
        if let Some(handle) = guard.as_ref() {
            return Ok(Arc::clone(handle));
        }

        let backend = factory.connect().await?;
        self.ensure_bucket(backend.as_ref()).await?;
        *guard = Some(Arc::clone(&backend));

        debug!(bucket = %self.config.bucket, "storage handle ready");
        Ok(backend)
    }

    async fn ensure_bucket(&self, backend: &dyn ObjectBackend) -> Result<(), StorageError> {
        let bucket = backend.bucket().to_string();

        match backend.head_bucket().await {
            Ok(()) => return Ok(()),
            Err(StorageError::NotFound(_)) => {}
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => {
                error!(severity = "critical", bucket = %bucket, error = %e, "bucket is not accessible");
                return Err(StorageError::BucketUnavailable(bucket));
            }
        }

        info!(bucket = %bucket, "bucket missing, creating it");
        let created = async {
            backend.create_bucket().await?;
            tokio::time::sleep(self.config.bucket_grace).await;
            backend.head_bucket().await
        }
        .await;

        match created {
            Ok(()) => Ok(()),
            Err(e) if e.is_transient() => Err(e),
            Err(e) => {
                error!(
                    severity = "critical",
                    bucket = %bucket,
                    error = %e,
                    "bucket does not exist and could not be created"
                );
                Err(StorageError::BucketUnavailable(bucket))
            }
        }
    }

    async fn discard_handle(&self) {
        if self.handle.lock().await.take().is_some() {
            debug!("discarded storage handle after connection failure");
        }
    }

    /// One attempt of `operation` against the current handle.
    async fn attempt<T, F, Fut>(&self, operation: &F) -> Result<T, StorageError>
    where
        F: Fn(Arc<dyn ObjectBackend>) -> Fut,
        Fut: std::future::Future<Output = Result<T, StorageError>>,
    {
        let result = match self.get_handle().await {
            Ok(handle) => operation(handle).await,
            Err(e) => Err(e),
        };
        if matches!(&result, Err(e) if e.is_transient()) {
            self.discard_handle().await;
        }
        result
    }

    async fn call<T, F, Fut>(&self, op: &str, operation: F) -> Result<T, StorageError>
    where
        F: Fn(Arc<dyn ObjectBackend>) -> Fut,
        Fut: std::future::Future<Output = Result<T, StorageError>>,
    {
        let operation = &operation;
        self.backoff
            .run(op, || async move { self.attempt(operation).await })
            .await
    }

    /// Whether the object exists. Always `false` when remote storage is disabled.
    pub async fn exists(&self, rel: &str) -> Result<bool, StorageError> {
        if !self.is_enabled() {
            return Ok(false);
        }
        let key = self.full_key(rel);
        let key = key.as_str();

        self.call("exists", |backend| async move {
            match backend.head_object(key).await {
                Ok(_) => Ok(true),
                Err(StorageError::NotFound(_)) => Ok(false),
                Err(e) => Err(e),
            }
        })
        .await
    }

    /// Validate that the original exists before handing out its key.
    pub async fn orig_location<'a>(&self, rel: &'a str) -> Result<&'a str, StorageError> {
        if self.is_enabled() && !self.exists(rel).await? {
            return Err(StorageError::NotFound(rel.to_string()));
        }
        Ok(rel)
    }

    /// Download an object into this connection's scratch directory.
    ///
    /// The caller owns the returned file and must release it with
    /// [`StorageClient::release_download`]. A failed transfer leaves no file
    /// behind.
    pub async fn download_to_scratch(&self, rel: &str) -> Result<PathBuf, StorageError> {
        let scratch = self.scratch_path().ok_or(StorageError::Disabled)?;
        let key = self.full_key(rel);
        let key = key.as_str();
        let tmp_path = scratch.join(format!("s3dl_{}{}", generate_ulid(), dotted_extension(rel)));
        let tmp = tmp_path.as_path();

        let result = self
            .call("download", |backend| async move {
                let mut body = backend.get_object(key).await?;
                let mut file = tokio::fs::File::create(tmp).await?;
                let mut buf = vec![0u8; DOWNLOAD_BUFFER_SIZE];
                let mut copied = 0u64;
                loop {
                    // Read errors are dropped connections; write errors are local
                    let n = body
                        .reader
                        .read(&mut buf)
                        .await
                        .map_err(|e| StorageError::Transient(format!("{}: {}", key, e)))?;
                    if n == 0 {
                        break;
                    }
                    file.write_all(&buf[..n]).await?;
                    copied += n as u64;
                }
                file.sync_all().await?;
                Ok(copied)
            })
            .await;

        match result {
            Ok(bytes) => {
                debug!(key, path = %tmp_path.display(), bytes, "downloaded object to scratch");
                Ok(tmp_path)
            }
            Err(e) => {
                self.release_download(&tmp_path);
                Err(e)
            }
        }
    }

    /// Delete a file returned by [`StorageClient::download_to_scratch`].
    pub fn release_download(&self, path: &Path) -> CleanupOutcome {
        let outcome = remove_path(path);
        if let CleanupOutcome::Failed(e) = &outcome {
            warn!(path = %path.display(), error = %e, "could not delete scratch file");
        }
        outcome
    }

    /// Upload the full content of `source` to `rel`, overwriting any existing object.
    pub async fn upload<R>(&self, rel: &str, source: &mut R) -> Result<(), StorageError>
    where
        R: AsyncRead + AsyncSeek + Unpin + Send,
    {
        if !self.is_enabled() {
            return Err(StorageError::Disabled);
        }
        source.seek(io::SeekFrom::Start(0)).await?;
        let mut buf = Vec::new();
        source.read_to_end(&mut buf).await?;

        let body = Bytes::from(buf);
        let body = &body;
        let key = self.full_key(rel);
        let key = key.as_str();
        let content_type = mime_guess::from_path(rel).first_raw();

        self.call("upload", |backend| async move {
            backend.put_object(key, body.clone(), content_type).await
        })
        .await
    }

    /// Delete the object. There is no local fallback when remote storage is disabled.
    pub async fn delete(&self, rel: &str) -> Result<(), StorageError> {
        if !self.is_enabled() {
            return Err(StorageError::Disabled);
        }
        let key = self.full_key(rel);
        let key = key.as_str();

        self.call("delete", |backend| async move { backend.delete_object(key).await })
            .await
    }

    /// Time-limited signed GET URL, `None` when remote storage is disabled.
    pub async fn presigned_url(&self, rel: &str) -> Result<Option<String>, StorageError> {
        if !self.is_enabled() {
            return Ok(None);
        }
        let key = self.full_key(rel);
        let key = key.as_str();
        let expiry = self.config.url_expiry;

        self.call("presigned_url", |backend| async move {
            backend.presign_get(key, expiry).await
        })
        .await
        .map(Some)
    }

    /// Open the object and read it lazily in chunks of the configured size.
    pub async fn stream_read(
        &self,
        rel: &str,
    ) -> Result<ChunkStream, StorageError> {
        let key = self.full_key(rel);
        let key = key.as_str();

        let body = self
            .call("stream_read", |backend| async move { backend.get_object(key).await })
            .await?;
        Ok(Box::pin(chunk_stream(body.reader, self.config.chunk_size)))
    }

    /// Stream an object as an HTTP response without staging it on disk.
    pub async fn stream_response(
        &self,
        rel: &str,
        download_name: Option<&str>,
    ) -> Result<Response, StorageError> {
        let key = self.full_key(rel);
        let key_ref = key.as_str();

        let head = self
            .call("stream_head", |backend| async move { backend.head_object(key_ref).await })
            .await?;
        let body = self
            .call("stream_get", |backend| async move { backend.get_object(key_ref).await })
            .await?;

        build_stream_response(
            &head,
            &key,
            download_name,
            chunk_stream(body.reader, self.config.chunk_size),
        )
        .map_err(|e| StorageError::Backend(format!("Failed to build response: {}", e)))
    }
}

impl Drop for StorageClient {
    fn drop(&mut self) {
        self.release_scratch();
    }
}
