//! In-memory object storage double

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{ObjectStorage, ObjectStorageFactory, StorageTarget};
use crate::error::{Error, Result};

#[derive(Clone, Debug, Default)]
struct Bucket {
    tags: BTreeMap<String, String>,
    objects: BTreeMap<String, usize>,
    versioning: Option<String>,
}

#[derive(Default)]
struct Inner {
    buckets: BTreeMap<String, Bucket>,
    server: Option<String>,
    fail_with: Option<String>,
    upload_delay: Option<std::time::Duration>,
}

/// Shared in-memory buckets; clones observe the same state
#[derive(Clone, Default)]
pub struct MemoryObjectStorage {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryObjectStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Pre-create a bucket with tags
    pub fn seed_bucket(&self, name: &str, tags: &[(&str, &str)]) {
        self.lock().buckets.insert(
            name.to_string(),
            Bucket {
                tags: tags.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
                ..Default::default()
            },
        );
    }

    pub fn has_bucket(&self, name: &str) -> bool {
        self.lock().buckets.contains_key(name)
    }

    pub fn object_count(&self, bucket: &str) -> usize {
        self.lock().buckets.get(bucket).map(|b| b.objects.len()).unwrap_or(0)
    }

    pub fn set_server_header(&self, server: &str) {
        self.lock().server = Some(server.to_string());
    }

    /// Make every call fail with a provider error
    pub fn fail_with(&self, message: &str) {
        self.lock().fail_with = Some(message.to_string());
    }

    pub fn set_upload_delay(&self, delay: std::time::Duration) {
        self.lock().upload_delay = Some(delay);
    }

    fn check(&self) -> Result<()> {
        match &self.lock().fail_with {
            Some(msg) => Err(Error::provider(msg.clone())),
            None => Ok(()),
        }
    }

    fn no_bucket(bucket: &str) -> Error {
        Error::provider(format!("NoSuchBucket: {bucket}"))
    }
}

#[async_trait]
impl ObjectStorage for MemoryObjectStorage {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        self.check()?;
        Ok(self.has_bucket(bucket))
    }

    async fn bucket_tags(&self, bucket: &str) -> Result<BTreeMap<String, String>> {
        self.check()?;
        self.lock()
            .buckets
            .get(bucket)
            .map(|b| b.tags.clone())
            .ok_or_else(|| Self::no_bucket(bucket))
    }

    async fn create_bucket(&self, bucket: &str, tags: &BTreeMap<String, String>) -> Result<()> {
        self.check()?;
        let mut inner = self.lock();
        if inner.buckets.contains_key(bucket) {
            return Err(Error::provider(format!("BucketAlreadyExists: {bucket}")));
        }
        inner.buckets.insert(
            bucket.to_string(),
            Bucket {
                tags: tags.clone(),
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<()> {
        self.check()?;
        self.lock().buckets.remove(bucket);
        Ok(())
    }

    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<()> {
        self.check()?;
        let delay = self.lock().upload_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut inner = self.lock();
        let b = inner.buckets.get_mut(bucket).ok_or_else(|| Self::no_bucket(bucket))?;
        b.objects.insert(key.to_string(), body.len());
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.check()?;
        if let Some(b) = self.lock().buckets.get_mut(bucket) {
            b.objects.remove(key);
        }
        Ok(())
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        self.check()?;
        self.lock()
            .buckets
            .get(bucket)
            .map(|b| b.objects.keys().filter(|k| k.starts_with(prefix)).cloned().collect())
            .ok_or_else(|| Self::no_bucket(bucket))
    }

    async fn bucket_versioning(&self, bucket: &str) -> Result<Option<String>> {
        self.check()?;
        self.lock()
            .buckets
            .get(bucket)
            .map(|b| b.versioning.clone())
            .ok_or_else(|| Self::no_bucket(bucket))
    }

    async fn server_header(&self) -> Result<Option<String>> {
        self.check()?;
        Ok(self.lock().server.clone())
    }
}

impl ObjectStorageFactory for MemoryObjectStorage {
    fn client(&self, target: &StorageTarget) -> Result<Arc<dyn ObjectStorage>> {
        match target.provider.as_str() {
            "aws" => Ok(Arc::new(self.clone())),
            other => Err(Error::provider(format!(
                "unable to determine bucket client for provider {other:?}"
            ))),
        }
    }
}
