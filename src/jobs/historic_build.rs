use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::jobs::types::{JobKind, SnapshotArtifact, SnapshotJob};
use crate::jobs::{export_snapshot_artifact, JobError, SnapshotJobHandler};

pub const HISTORIC_SUBDIR: &str = "historic";

/// Exports a snapshot for a past epoch window. Backfill work: admitted only
/// for windows above the persisted watermark and below the node's synced
/// height, so an export can never outrun the chain.
pub struct HistoricBuildHandler;

#[async_trait]
impl SnapshotJobHandler for HistoricBuildHandler {
    fn kind(&self) -> JobKind {
        JobKind::BuildHistoric
    }

    async fn process(
        &self,
        config: &Config,
        job: &SnapshotJob,
        cancel: &CancellationToken,
    ) -> Result<Option<SnapshotArtifact>, JobError> {
        tracing::info!(
            job_id = %job.id,
            start_epoch = job.start_epoch,
            end_epoch = ?job.end_epoch,
            "Exporting historic snapshot window"
        );
        let artifact = export_snapshot_artifact(config, job, HISTORIC_SUBDIR, cancel).await?;
        Ok(Some(artifact))
    }
}
