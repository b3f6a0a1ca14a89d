pub mod aws_s3;

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use color_eyre::Result;
use mockall::automock;

/// Durable object storage for validated artifacts. Checksums are
/// hex-encoded SHA-256 throughout; backends translate to whatever encoding
/// their API expects.
#[automock]
#[async_trait]
pub trait DataStorage: Send + Sync {
    /// Streams a file to `key`, attaching `checksum` so the store verifies
    /// the payload on ingest.
    async fn put_file(&self, key: &str, path: &Path, checksum: &str) -> Result<()>;

    /// Small sidecar documents (checksum files, metadata).
    async fn put_bytes(&self, key: &str, data: Bytes) -> Result<()>;

    /// Checksum of the remote object, `None` when the key does not exist.
    /// This is the read-back used to confirm uploads; a non-error `put`
    /// alone never counts as success.
    async fn head(&self, key: &str) -> Result<Option<String>>;
}

/// Trait method to represent the config struct needed for initialisation
/// of the data storage client.
pub trait DataStorageConfig {
    fn new_from_settings(settings: &impl crate::utils::settings::Settings) -> Self;
}
