use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::jobs::types::{JobKind, SnapshotArtifact, SnapshotJob};
use crate::jobs::{export_snapshot_artifact, JobError, SnapshotJobHandler};

pub const LATEST_SUBDIR: &str = "latest";

/// Exports a snapshot anchored near the current chain head, a safety margin
/// behind it so the exported tipset is final by the time the export runs.
/// Recurs on the configured delay.
pub struct LatestBuildHandler;

#[async_trait]
impl SnapshotJobHandler for LatestBuildHandler {
    fn kind(&self) -> JobKind {
        JobKind::BuildLatest
    }

    async fn process(
        &self,
        config: &Config,
        job: &SnapshotJob,
        cancel: &CancellationToken,
    ) -> Result<Option<SnapshotArtifact>, JobError> {
        tracing::info!(job_id = %job.id, epoch = job.target_epoch(), "Exporting latest snapshot");
        let artifact = export_snapshot_artifact(config, job, LATEST_SUBDIR, cancel).await?;
        Ok(Some(artifact))
    }
}
