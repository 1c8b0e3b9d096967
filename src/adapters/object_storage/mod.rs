//! Object storage clients used for bucket lifecycle and probes

mod memory;
mod s3;
pub mod sigv4;

pub use memory::MemoryObjectStorage;
pub use s3::{S3Client, S3ClientFactory};

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::credentials::AwsProfile;
use crate::Result;

/// Tag written on buckets created for a CloudStorage
pub const OWNER_TAG: &str = "oadp.openshift.io/cloudstorage-uid";

/// Where and how to reach a bucket
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StorageTarget {
    pub provider: String,
    pub region: String,
    /// Custom endpoint (`s3Url`); AWS is used when absent
    pub endpoint: Option<String>,
    pub credentials: Option<AwsProfile>,
    pub skip_tls_verify: bool,
}

/// Bucket operations against one provider endpoint
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool>;

    async fn bucket_tags(&self, bucket: &str) -> Result<BTreeMap<String, String>>;

    async fn create_bucket(&self, bucket: &str, tags: &BTreeMap<String, String>) -> Result<()>;

    async fn delete_bucket(&self, bucket: &str) -> Result<()>;

    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<()>;

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()>;

    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>>;

    /// Versioning status (`Enabled`, `Suspended`) if configured
    async fn bucket_versioning(&self, bucket: &str) -> Result<Option<String>>;

    /// `Server` response header of the endpoint root
    async fn server_header(&self) -> Result<Option<String>>;
}

/// Builds object storage clients for a target
pub trait ObjectStorageFactory: Send + Sync {
    fn client(&self, target: &StorageTarget) -> Result<Arc<dyn ObjectStorage>>;
}

/// Map an endpoint `Server` header to a vendor name
pub fn detect_vendor(server_header: &str) -> String {
    let lower = server_header.to_ascii_lowercase();
    if lower.contains("amazon") {
        "AWS".to_string()
    } else if lower.contains("minio") {
        "MinIO".to_string()
    } else if lower.contains("ceph") {
        "Ceph".to_string()
    } else {
        server_header.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendors_from_server_header() {
        assert_eq!(detect_vendor("AmazonS3"), "AWS");
        assert_eq!(detect_vendor("MinIO"), "MinIO");
        assert_eq!(detect_vendor("Ceph Object Gateway (squid)"), "Ceph");
        assert_eq!(detect_vendor("nginx"), "nginx");
    }
}
