use super::{BackendFactory, ObjectBackend, ObjectBody, ObjectHead, StorageError};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    content_type: Option<String>,
}

/// In-memory bucket used in tests and local dry runs.
///
/// Transient failures can be injected with [`MemoryBackend::fail_next`]; each
/// injected failure is consumed by one call, whatever the operation.
#[derive(Debug)]
pub struct MemoryBackend {
    bucket: String,
    objects: DashMap<String, StoredObject>,
    bucket_exists: AtomicBool,
    allow_bucket_creation: AtomicBool,
    pending_failures: AtomicU32,
    connects: AtomicU32,
    calls: AtomicU32,
}

impl MemoryBackend {
    pub fn new(bucket: &str) -> Arc<Self> {
        Arc::new(Self {
            bucket: bucket.to_string(),
            objects: DashMap::new(),
            bucket_exists: AtomicBool::new(true),
            allow_bucket_creation: AtomicBool::new(true),
            pending_failures: AtomicU32::new(0),
            connects: AtomicU32::new(0),
            calls: AtomicU32::new(0),
        })
    }

    /// A backend whose bucket does not exist yet.
    pub fn without_bucket(bucket: &str, allow_creation: bool) -> Arc<Self> {
        let backend = Self::new(bucket);
        backend.bucket_exists.store(false, Ordering::SeqCst);
        backend
            .allow_bucket_creation
            .store(allow_creation, Ordering::SeqCst);
        backend
    }

    pub fn insert(&self, key: &str, data: impl Into<Bytes>, content_type: Option<&str>) {
        self.objects.insert(
            key.to_string(),
            StoredObject {
                data: data.into(),
                content_type: content_type.map(str::to_string),
            },
        );
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.objects.get(key).map(|o| o.data.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.contains_key(key)
    }

    pub fn bucket_exists(&self) -> bool {
        self.bucket_exists.load(Ordering::SeqCst)
    }

    /// Make the next `n` calls fail with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.pending_failures.store(n, Ordering::SeqCst);
    }

    /// Number of handles handed out by [`MemoryBackend::factory`].
    pub fn connect_count(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    /// Number of backend calls made, including failed ones.
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn factory(self: &Arc<Self>) -> Arc<dyn BackendFactory> {
        Arc::new(MemoryFactory {
            backend: Arc::clone(self),
        })
    }

    fn enter(&self, what: &str) -> Result<(), StorageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StorageError::Transient(format!("{}: connection reset", what)));
        }
        if !self.bucket_exists() && what != "head_bucket" && what != "create_bucket" {
            return Err(StorageError::NotFound(self.bucket.clone()));
        }
        Ok(())
    }

    fn lookup(&self, key: &str) -> Result<StoredObject, StorageError> {
        self.objects
            .get(key)
            .map(|o| o.value().clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }
}

#[async_trait]
impl ObjectBackend for MemoryBackend {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn head_bucket(&self) -> Result<(), StorageError> {
        self.enter("head_bucket")?;
        if self.bucket_exists() {
            Ok(())
        } else {
            Err(StorageError::NotFound(self.bucket.clone()))
        }
    }

    async fn create_bucket(&self) -> Result<(), StorageError> {
        self.enter("create_bucket")?;
        if !self.allow_bucket_creation.load(Ordering::SeqCst) {
            return Err(StorageError::PermissionDenied(self.bucket.clone()));
        }
        self.bucket_exists.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn head_object(&self, key: &str) -> Result<ObjectHead, StorageError> {
        self.enter("head_object")?;
        let object = self.lookup(key)?;
        Ok(ObjectHead {
            content_length: object.data.len() as u64,
            content_type: object.content_type,
        })
    }

    async fn get_object(&self, key: &str) -> Result<ObjectBody, StorageError> {
        self.enter("get_object")?;
        let object = self.lookup(key)?;
        Ok(ObjectBody {
            head: ObjectHead {
                content_length: object.data.len() as u64,
                content_type: object.content_type,
            },
            reader: Box::pin(Cursor::new(object.data)),
        })
    }

    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        content_type: Option<&str>,
    ) -> Result<(), StorageError> {
        self.enter("put_object")?;
        self.insert(key, body, content_type);
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<(), StorageError> {
        self.enter("delete_object")?;
        self.objects.remove(key);
        Ok(())
    }

    async fn presign_get(&self, key: &str, expires_in: Duration) -> Result<String, StorageError> {
        self.enter("presign_get")?;
        Ok(format!(
            "memory://{}/{}?X-Amz-Expires={}",
            self.bucket,
            urlencoding::encode(key),
            expires_in.as_secs()
        ))
    }
}

struct MemoryFactory {
    backend: Arc<MemoryBackend>,
}

#[async_trait]
impl BackendFactory for MemoryFactory {
    async fn connect(&self) -> Result<Arc<dyn ObjectBackend>, StorageError> {
        self.backend.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::clone(&self.backend) as Arc<dyn ObjectBackend>)
    }
}
