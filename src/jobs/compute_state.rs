use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::jobs::types::{JobKind, SnapshotArtifact, SnapshotJob};
use crate::jobs::{JobError, SnapshotJobHandler};

/// Materializes chain state for an epoch batch ahead of the exporters.
/// Produces no artifact; its only output is node-side state plus the
/// compute watermark the scheduler advances on success.
pub struct ComputeStateHandler;

#[async_trait]
impl SnapshotJobHandler for ComputeStateHandler {
    fn kind(&self) -> JobKind {
        JobKind::ComputeState
    }

    async fn process(
        &self,
        config: &Config,
        job: &SnapshotJob,
        cancel: &CancellationToken,
    ) -> Result<Option<SnapshotArtifact>, JobError> {
        let node = config.archive_node();
        let batch_size = config.params().compute_batch_size;
        let start_epoch = job.start_epoch;

        tracing::info!(start_epoch, batch_size, "Computing state for epoch batch");

        if cancel.is_cancelled() {
            return Err(JobError::Cancelled { id: job.id });
        }

        match node.compute_state(start_epoch, batch_size).await {
            Ok(()) => return Ok(None),
            Err(e) => {
                tracing::warn!(start_epoch, batch_size, error = %e, "Batch compute failed, retrying per epoch");
            }
        }

        // Whole-batch computation can fail on a single bad epoch; walking
        // the batch one epoch at a time isolates it.
        for epoch in start_epoch..start_epoch + batch_size {
            if cancel.is_cancelled() {
                return Err(JobError::Cancelled { id: job.id });
            }
            node.compute_state(epoch, 1).await?;
        }

        Ok(None)
    }
}
