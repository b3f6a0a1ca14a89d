use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::ChecksumMode;
use aws_sdk_s3::Client;
use base64::Engine;
use bytes::Bytes;
use color_eyre::eyre::eyre;
use color_eyre::Result;

use crate::config::ProviderConfig;
use crate::data_storage::aws_s3::config::AWSS3Config;
use crate::data_storage::{DataStorage, DataStorageConfig};
use crate::utils::settings::Settings;

pub mod config;

/// AWSS3 represents the AWS S3 client object containing the client and the
/// bucket it writes to.
pub struct AWSS3 {
    client: Client,
    bucket: String,
}

impl AWSS3 {
    /// To init the struct with main settings
    pub async fn new_with_settings(settings: &impl Settings, provider_config: Arc<ProviderConfig>) -> Self {
        let s3_config = AWSS3Config::new_from_settings(settings);
        let aws_config = provider_config.get_aws_client_or_panic();
        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(aws_config);
        // this is necessary for it to work with localstack in test cases
        s3_config_builder.set_force_path_style(Some(true));
        let client = Client::from_conf(s3_config_builder.build());
        Self { client, bucket: s3_config.bucket_name }
    }
}

fn hex_to_b64(hex_digest: &str) -> Result<String> {
    let raw = hex::decode(hex_digest)?;
    Ok(base64::engine::general_purpose::STANDARD.encode(raw))
}

fn b64_to_hex(b64_digest: &str) -> Result<String> {
    let raw = base64::engine::general_purpose::STANDARD.decode(b64_digest)?;
    Ok(hex::encode(raw))
}

#[async_trait]
impl DataStorage for AWSS3 {
    async fn put_file(&self, key: &str, path: &Path, checksum: &str) -> Result<()> {
        let body = ByteStream::from_path(path).await.map_err(|e| eyre!("failed to open {}: {}", path.display(), e))?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .checksum_sha256(hex_to_b64(checksum)?)
            .send()
            .await?;

        tracing::debug!(bucket = %self.bucket, key, "Uploaded file to object storage");
        Ok(())
    }

    async fn put_bytes(&self, key: &str, data: Bytes) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .content_type("application/json")
            .send()
            .await?;

        tracing::debug!(bucket = %self.bucket, key, "Uploaded sidecar to object storage");
        Ok(())
    }

    async fn head(&self, key: &str) -> Result<Option<String>> {
        let response = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .checksum_mode(ChecksumMode::Enabled)
            .send()
            .await;

        match response {
            Ok(head) => match head.checksum_sha256() {
                Some(b64) => Ok(Some(b64_to_hex(b64)?)),
                // object exists but was written without a checksum; report
                // a sentinel that will never match, forcing re-upload
                None => Ok(Some(String::new())),
            },
            Err(e) => {
                let service_err = e.into_service_error();
                if service_err.is_not_found() {
                    Ok(None)
                } else {
                    Err(eyre!("head_object failed: {}", service_err))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_encodings_round_trip() {
        let hex_digest = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
        let b64 = hex_to_b64(hex_digest).unwrap();
        assert_eq!(b64_to_hex(&b64).unwrap(), hex_digest);
    }
}
