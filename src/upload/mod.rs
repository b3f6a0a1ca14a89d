use bytes::Bytes;

use crate::config::Config;
use crate::jobs::types::SnapshotArtifact;
use crate::jobs::JobError;
use crate::queue::job_queue::ArtifactQueueMessage;

/// Content-addressed object key: the checksum in the key means a re-run of
/// the same artifact lands on the same object, and a different build of
/// the same epoch can never silently overwrite it.
pub fn object_key(chain: &str, artifact: &SnapshotArtifact) -> String {
    format!("{}/{}/{}", chain, artifact.checksum, artifact.file_name())
}

/// Transfers a validated artifact to object storage and deletes the local
/// copy once (and only once) the remote checksum read-back matches.
/// A non-error put response alone never counts as success. On any failure
/// the file stays on disk for retry or operator recovery.
pub async fn upload(config: &Config, message: &ArtifactQueueMessage) -> Result<(), JobError> {
    let artifact = &message.artifact;
    let storage = config.storage();
    let chain = &config.params().chain;
    let key = object_key(chain, artifact);

    let already_stored = storage
        .head(&key)
        .await
        .map_err(|e| JobError::UploadFailed(e.to_string()))?
        .is_some_and(|remote| remote == artifact.checksum);

    if already_stored {
        tracing::warn!(key, "Artifact already in object storage, skipping transfer");
    } else {
        storage
            .put_file(&key, &artifact.file_path, &artifact.checksum)
            .await
            .map_err(|e| JobError::UploadFailed(e.to_string()))?;

        // read-back: the store must report the object with our checksum
        match storage.head(&key).await.map_err(|e| JobError::UploadFailed(e.to_string()))? {
            Some(remote) if remote == artifact.checksum => {}
            Some(remote) => {
                return Err(JobError::UploadFailed(format!(
                    "remote checksum mismatch for {}: local {}, remote {}",
                    key, artifact.checksum, remote
                )));
            }
            None => {
                return Err(JobError::UploadFailed(format!("object {} missing after upload", key)));
            }
        }
    }

    upload_sidecars(config, &key, message).await?;

    // local deletion strictly after confirmed success
    tokio::fs::remove_file(&artifact.file_path)
        .await
        .map_err(|e| JobError::UploadFailed(format!("uploaded but failed to remove local copy: {}", e)))?;
    tracing::info!(key, path = %artifact.file_path.display(), "Artifact uploaded and local copy removed");

    Ok(())
}

/// Checksum and metadata documents published next to the artifact, so
/// downstream consumers can verify a download without the pipeline.
async fn upload_sidecars(config: &Config, key: &str, message: &ArtifactQueueMessage) -> Result<(), JobError> {
    let storage = config.storage();

    let checksum_key = format!("{}.sha256sum", key);
    storage
        .put_bytes(&checksum_key, Bytes::from(message.artifact.checksum.clone()))
        .await
        .map_err(|e| JobError::UploadFailed(format!("sidecar {} failed: {}", checksum_key, e)))?;

    if let Some(metadata) = &message.metadata {
        let metadata_key = format!("{}.metadata.json", key);
        let body = serde_json::to_vec_pretty(metadata).map_err(|e| JobError::Other(e.to_string().into()))?;
        storage
            .put_bytes(&metadata_key, Bytes::from(body))
            .await
            .map_err(|e| JobError::UploadFailed(format!("sidecar {} failed: {}", metadata_key, e)))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use chrono::Utc;
    use uuid::Uuid;

    use super::*;

    #[test]
    fn object_key_is_content_addressed() {
        let artifact = SnapshotArtifact {
            job_id: Uuid::new_v4(),
            file_path: PathBuf::from("/data/snapshots/latest/calibnet_snapshot_2026-08-07_height_1050.forest.car.zst"),
            epoch_height: 1050,
            checksum: "abc123".to_string(),
            size_bytes: 1,
            produced_at: Utc::now(),
        };
        assert_eq!(
            object_key("calibnet", &artifact),
            "calibnet/abc123/calibnet_snapshot_2026-08-07_height_1050.forest.car.zst"
        );
    }
}
