use std::fmt;

use async_trait::async_trait;
use color_eyre::eyre::eyre;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Config;
use crate::jobs::types::{JobKind, JobStatus, SnapshotArtifact, SnapshotJob};
use crate::node::NodeError;

pub mod compute_state;
pub mod historic_build;
pub mod latest_build;
pub mod types;

use compute_state::ComputeStateHandler;
use historic_build::HistoricBuildHandler;
use latest_build::LatestBuildHandler;

/// Error types for job-related operations in the pipeline. `AdmissionDenied`
/// is deliberately absent: a denied admission is an expected scheduling
/// outcome, not an error (see `scheduler::AdmissionDenied`).
#[derive(thiserror::Error, Debug)]
pub enum JobError {
    /// Indicates the requested job could not be found in the registry
    #[error("Failed to find job with id {id:?}")]
    JobNotFound { id: Uuid },

    /// Indicates the job is in an invalid status for the requested operation
    #[error("Invalid status {status:?} for job with id {id:?}. Cannot process.")]
    InvalidStatus { id: Uuid, status: JobStatus },

    /// Transient: the node could not be reached; retried with backoff
    #[error("Node unavailable: {0}")]
    NodeUnavailable(String),

    /// The node reported an error mid-export; the partial file is discarded
    #[error("Export failed: {0}")]
    ExportFailed(String),

    /// A produced artifact failed validation and must be rebuilt
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// Transient: the artifact could not be confirmed in object storage
    #[error("Upload failed: {0}")]
    UploadFailed(String),

    /// Terminal: the job consumed its attempt budget
    #[error("Attempts exhausted for job {id:?} after {attempts} attempts")]
    AttemptsExhausted { id: Uuid, attempts: u64 },

    /// The stage exceeded its configured maximum duration
    #[error("Stage timed out after {secs}s for job {id:?}")]
    StageTimeout { id: Uuid, secs: u64 },

    /// Operator-triggered cooperative cancellation
    #[error("Job {id:?} cancelled")]
    Cancelled { id: Uuid },

    /// Wraps general errors that don't fit other categories
    #[error("Other error: {0}")]
    Other(#[from] OtherError),
}

impl From<NodeError> for JobError {
    fn from(e: NodeError) -> Self {
        match e {
            NodeError::Unavailable(msg) => JobError::NodeUnavailable(msg),
            NodeError::ExportFailed(msg) => JobError::ExportFailed(msg),
            NodeError::InspectionFailed(msg) => JobError::ValidationFailed(msg),
        }
    }
}

impl JobError {
    /// Whether another attempt may fix this. Terminal and programming
    /// errors are not retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            JobError::NodeUnavailable(_)
                | JobError::ExportFailed(_)
                | JobError::ValidationFailed(_)
                | JobError::UploadFailed(_)
                | JobError::StageTimeout { .. }
        )
    }
}

/// Wrapper type for `Other(<>)` job errors, keeping the eyre chain intact.
#[derive(Debug)]
pub struct OtherError(color_eyre::eyre::Error);

impl fmt::Display for OtherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for OtherError {}

impl From<color_eyre::eyre::Error> for OtherError {
    fn from(err: color_eyre::eyre::Error) -> Self {
        OtherError(err)
    }
}

impl From<String> for OtherError {
    fn from(error_string: String) -> Self {
        OtherError(eyre!(error_string))
    }
}

impl From<color_eyre::Report> for JobError {
    fn from(err: color_eyre::Report) -> Self {
        JobError::Other(OtherError(err))
    }
}

/// A node-driving stage. Implementations hold no state; everything they
/// need arrives through the config and the job. The caller (scheduler)
/// owns timeouts, attempt accounting and the node lock.
#[async_trait]
pub trait SnapshotJobHandler: Send + Sync {
    fn kind(&self) -> JobKind;

    /// Drive the node for this job. Builder kinds return the produced
    /// artifact; compute-state returns `None`. On any failure or
    /// cancellation, no partial output file may remain on disk.
    async fn process(
        &self,
        config: &Config,
        job: &SnapshotJob,
        cancel: &CancellationToken,
    ) -> Result<Option<SnapshotArtifact>, JobError>;
}

/// To get the handler for a job kind.
pub fn handler_for_kind(kind: JobKind) -> Box<dyn SnapshotJobHandler> {
    match kind {
        JobKind::ComputeState => Box::new(ComputeStateHandler),
        JobKind::BuildHistoric => Box::new(HistoricBuildHandler),
        JobKind::BuildLatest => Box::new(LatestBuildHandler),
    }
}

/// Removes a partial output file, logging rather than masking the original
/// failure if the cleanup itself fails.
pub(crate) async fn discard_partial_file(path: &std::path::Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::info!(path = %path.display(), "Removed partial snapshot file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::error!(path = %path.display(), error = %e, "Failed to remove partial snapshot file"),
    }
}

/// Date tag for snapshot filenames, derived from the chain genesis
/// timestamp and the epoch cadence.
pub(crate) fn epoch_to_date(genesis_timestamp: i64, seconds_per_epoch: u64, epoch: u64) -> String {
    let unix = genesis_timestamp + (epoch as i64) * (seconds_per_epoch as i64);
    chrono::DateTime::from_timestamp(unix, 0).map(|d| d.format("%Y-%m-%d").to_string()).unwrap_or_default()
}

/// Exports the job's epoch window to the per-kind directory and wraps the
/// result in an artifact. Shared by the historic and latest builders; the
/// rules are identical for both: reuse an existing file, otherwise export,
/// and never leave a partial file behind on failure or cancellation.
pub(crate) async fn export_snapshot_artifact(
    config: &Config,
    job: &SnapshotJob,
    subdir: &str,
    cancel: &CancellationToken,
) -> Result<SnapshotArtifact, JobError> {
    let params = config.params();
    let node = config.archive_node();
    let epoch = job.target_epoch();

    let genesis_timestamp = node.genesis_timestamp().await?;
    let date = epoch_to_date(genesis_timestamp, params.seconds_per_epoch, epoch);
    let folder = params.snapshot_dir.join(subdir);
    tokio::fs::create_dir_all(&folder).await.map_err(|e| JobError::ExportFailed(e.to_string()))?;

    let file_path =
        folder.join(format!("{}_snapshot_{}_height_{}.forest.car.zst", params.chain, date, epoch));

    if tokio::fs::try_exists(&file_path).await.unwrap_or(false) {
        tracing::warn!(path = %file_path.display(), "Snapshot file already exists, reusing");
    } else {
        if cancel.is_cancelled() {
            return Err(JobError::Cancelled { id: job.id });
        }
        if let Err(e) = node.export_snapshot(job.start_epoch, epoch, &job.format, &file_path).await {
            discard_partial_file(&file_path).await;
            return Err(e.into());
        }
        if cancel.is_cancelled() {
            discard_partial_file(&file_path).await;
            return Err(JobError::Cancelled { id: job.id });
        }
    }

    let checksum = match crate::utils::checksum::sha256_file(&file_path).await {
        Ok(c) => c,
        Err(e) => {
            discard_partial_file(&file_path).await;
            return Err(JobError::ExportFailed(format!("checksum of {} failed: {}", file_path.display(), e)));
        }
    };
    let size_bytes = tokio::fs::metadata(&file_path).await.map_err(|e| JobError::ExportFailed(e.to_string()))?.len();

    Ok(SnapshotArtifact {
        job_id: job.id,
        file_path,
        epoch_height: epoch,
        checksum,
        size_bytes,
        produced_at: config.clock().now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_date_advances_with_epochs() {
        // genesis at 2020-01-01T00:00:00Z, 30s epochs
        let genesis = 1_577_836_800;
        assert_eq!(epoch_to_date(genesis, 30, 0), "2020-01-01");
        // 2880 epochs per day
        assert_eq!(epoch_to_date(genesis, 30, 2880), "2020-01-02");
        assert_eq!(epoch_to_date(genesis, 30, 2880 * 365), "2020-12-31");
    }

    #[test]
    fn node_errors_map_onto_the_taxonomy() {
        let e: JobError = NodeError::Unavailable("conn refused".into()).into();
        assert!(matches!(e, JobError::NodeUnavailable(_)));
        assert!(e.is_retryable());

        let e: JobError = NodeError::ExportFailed("exit 1".into()).into();
        assert!(matches!(e, JobError::ExportFailed(_)));

        let e = JobError::AttemptsExhausted { id: Uuid::new_v4(), attempts: 3 };
        assert!(!e.is_retryable());
    }
}
