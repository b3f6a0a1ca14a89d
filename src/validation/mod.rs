use serde_json::{json, Value};

use crate::config::Config;
use crate::jobs::types::SnapshotArtifact;
use crate::jobs::JobError;
use crate::utils::checksum::sha256_file;

/// Result of validating a produced artifact. `Valid` carries the metadata
/// sidecar the uploader publishes next to the artifact.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationOutcome {
    Valid { metadata: Value },
    Invalid { reason: String },
}

/// Re-checks a produced snapshot independently of the builder's own
/// bookkeeping: the file checksum is recomputed, the archive is inspected
/// without the node, and the state root is cross-checked against the
/// node's view when the node can serve that height.
///
/// `Err` is reserved for transient trouble (node or toolchain unreachable)
/// where retrying validation makes sense; a structurally wrong artifact is
/// an `Invalid` outcome and gets rebuilt.
pub async fn validate(config: &Config, artifact: &SnapshotArtifact) -> Result<ValidationOutcome, JobError> {
    let recomputed = sha256_file(&artifact.file_path)
        .await
        .map_err(|e| JobError::NodeUnavailable(format!("cannot read artifact {}: {}", artifact.file_path.display(), e)))?;
    if recomputed != artifact.checksum {
        return Ok(ValidationOutcome::Invalid {
            reason: format!("checksum mismatch: recorded {}, recomputed {}", artifact.checksum, recomputed),
        });
    }

    let info = match config.archive_node().inspect_archive(&artifact.file_path).await {
        Ok(info) => info,
        Err(crate::node::NodeError::InspectionFailed(reason)) => {
            // the toolchain could open the file but rejected it
            return Ok(ValidationOutcome::Invalid { reason });
        }
        Err(e) => return Err(e.into()),
    };

    if info.epoch != artifact.epoch_height {
        return Ok(ValidationOutcome::Invalid {
            reason: format!("archive anchored at epoch {}, expected {}", info.epoch, artifact.epoch_height),
        });
    }

    // The node's view is a cross-check, not a requirement: an archive node
    // mid-resync simply cannot answer, and the artifact checks above stand
    // on their own.
    if let (Some(archive_root), Some(node_root)) =
        (&info.state_root, config.archive_node().state_root_at(artifact.epoch_height).await?)
    {
        if *archive_root != node_root {
            return Ok(ValidationOutcome::Invalid {
                reason: format!("state root mismatch at {}: archive {}, node {}", artifact.epoch_height, archive_root, node_root),
            });
        }
    }

    let metadata = build_metadata(config, artifact, &info.fields);
    Ok(ValidationOutcome::Valid { metadata })
}

/// Metadata sidecar published next to the artifact: the toolchain's own
/// report plus the pipeline's checksum and validation stamp.
fn build_metadata(
    config: &Config,
    artifact: &SnapshotArtifact,
    archive_fields: &std::collections::HashMap<String, String>,
) -> Value {
    json!({
        "archive": archive_fields,
        "epoch": artifact.epoch_height,
        "size_bytes": artifact.size_bytes,
        "sha256sum": artifact.checksum,
        "validation": {
            "success": true,
            "validated_at": config.clock().now().to_rfc3339(),
        },
    })
}
