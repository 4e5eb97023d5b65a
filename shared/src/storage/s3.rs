use super::{BackendFactory, ObjectBackend, ObjectBody, ObjectHead, StorageError};
use crate::config::StorageConfig;
use async_trait::async_trait;
use aws_config::retry::RetryConfig;
use aws_config::timeout::TimeoutConfig;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::{primitives::ByteStream, Client as S3Client};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const READ_TIMEOUT: Duration = Duration::from_secs(600);
const SDK_MAX_ATTEMPTS: u32 = 10;

#[derive(Debug, Clone)]
pub struct S3Storage {
    client: S3Client,
    bucket: String,
}

impl S3Storage {
    pub async fn new(config: &StorageConfig) -> Result<Self, StorageError> {
        let endpoint_url = config.endpoint.clone().ok_or(StorageError::Disabled)?;

        let mut config_loader = aws_config::from_env()
            .retry_config(RetryConfig::adaptive().with_max_attempts(SDK_MAX_ATTEMPTS))
            .timeout_config(
                TimeoutConfig::builder()
                    .connect_timeout(CONNECT_TIMEOUT)
                    .read_timeout(READ_TIMEOUT)
                    .build(),
            );

        if let Some(region) = &config.region {
            config_loader = config_loader.region(aws_config::Region::new(region.clone()));
        }

        if let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) {
            config_loader = config_loader.credentials_provider(Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                "image-fetcher",
            ));
        }

        let sdk_config = config_loader.load().await;

        // Custom endpoints (MinIO, Ceph, LocalStack) need path-style addressing
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .endpoint_url(endpoint_url)
            .force_path_style(true)
            .build();

        Ok(Self {
            client: S3Client::from_conf(s3_config),
            bucket: config.bucket.clone(),
        })
    }
}

/// Map an SDK error onto the storage taxonomy. Only connection-level
/// failures are transient.
fn classify<E>(err: SdkError<E, HttpResponse>, what: &str) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    match &err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) | SdkError::ResponseError(_) => {
            StorageError::Transient(format!("{}: {}", what, DisplayErrorContext(&err)))
        }
        SdkError::ServiceError(ctx) => {
            let status = ctx.raw().status().as_u16();
            let code = ctx.err().code().unwrap_or_default();
            debug!(what, status, code, "S3 service error");
            match (status, code) {
                (404, _) | (_, "NoSuchKey") | (_, "NoSuchBucket") | (_, "NotFound") => {
                    StorageError::NotFound(what.to_string())
                }
                (403, _) | (_, "AccessDenied") => StorageError::PermissionDenied(what.to_string()),
                _ => StorageError::Backend(format!("{}: {}", what, DisplayErrorContext(&err))),
            }
        }
        _ => StorageError::Backend(format!("{}: {}", what, DisplayErrorContext(&err))),
    }
}

#[async_trait]
impl ObjectBackend for S3Storage {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn head_bucket(&self) -> Result<(), StorageError> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| classify(e, &self.bucket))?;
        Ok(())
    }

    async fn create_bucket(&self) -> Result<(), StorageError> {
        self.client
            .create_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| classify(e, &self.bucket))?;

        debug!("Created S3 bucket: bucket={}", self.bucket);
        Ok(())
    }

    async fn head_object(&self, key: &str) -> Result<ObjectHead, StorageError> {
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(e, key))?;

        Ok(ObjectHead {
            content_length: output.content_length().unwrap_or(0).max(0) as u64,
            content_type: output.content_type().map(str::to_string),
        })
    }

    async fn get_object(&self, key: &str) -> Result<ObjectBody, StorageError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(e, key))?;

        let head = ObjectHead {
            content_length: output.content_length().unwrap_or(0).max(0) as u64,
            content_type: output.content_type().map(str::to_string),
        };

        Ok(ObjectBody {
            head,
            reader: Box::pin(output.body.into_async_read()),
        })
    }

    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        content_type: Option<&str>,
    ) -> Result<(), StorageError> {
        let size_bytes = body.len();

        let mut put_request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body));

        if let Some(ct) = content_type {
            put_request = put_request.content_type(ct);
        }

        put_request.send().await.map_err(|e| classify(e, key))?;

        debug!(
            "Stored content in S3: bucket={}, key={}, size_bytes={}",
            self.bucket, key, size_bytes
        );
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(e, key))?;

        debug!("Deleted content from S3: bucket={}, key={}", self.bucket, key);
        Ok(())
    }

    async fn presign_get(&self, key: &str, expires_in: Duration) -> Result<String, StorageError> {
        let presigning = PresigningConfig::expires_in(expires_in)
            .map_err(|e| StorageError::Config(format!("Invalid presign expiry: {}", e)))?;

        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| classify(e, key))?;

        Ok(request.uri().to_string())
    }
}

/// Builds a fresh SDK client from the connection settings on every connect.
#[derive(Debug, Clone)]
pub struct S3BackendFactory {
    config: StorageConfig,
}

impl S3BackendFactory {
    pub fn new(config: StorageConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl BackendFactory for S3BackendFactory {
    async fn connect(&self) -> Result<Arc<dyn ObjectBackend>, StorageError> {
        let storage = S3Storage::new(&self.config).await?;
        Ok(Arc::new(storage))
    }
}
