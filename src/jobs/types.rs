use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use uuid::Uuid;

/// The kind of snapshot-producing work a job performs. All three kinds
/// drive the archive node and are therefore serialized by the node lock.
#[derive(Serialize, Deserialize, Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    /// Materializing chain state for an epoch batch so that exports
    /// covering those epochs can run
    ComputeState,
    /// Exporting a snapshot for a past epoch window (backfill)
    BuildHistoric,
    /// Exporting a snapshot near the current chain head (recurring)
    BuildLatest,
}

impl JobKind {
    /// Kinds that hand their output to validation and upload. Compute-state
    /// produces no artifact.
    pub fn produces_artifact(&self) -> bool {
        !matches!(self, JobKind::ComputeState)
    }
}

#[derive(Serialize, Deserialize, Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Admitted by the scheduler and queued for its build stage
    Created,
    /// The build stage holds the node lock and is exporting
    Building,
    /// Artifact produced, awaiting validation
    PendingValidation,
    /// Artifact validated, awaiting upload
    PendingUpload,
    /// Terminal: artifact uploaded and confirmed (or state computed)
    Succeeded,
    /// Terminal: attempts exhausted
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

/// A unit of snapshot work, created by the scheduler when admission
/// conditions hold and owned by it until a terminal state.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SnapshotJob {
    pub id: Uuid,
    pub kind: JobKind,
    /// First epoch covered by the job
    pub start_epoch: u64,
    /// Last epoch covered; `None` for compute-state batches, which cover
    /// `start_epoch .. start_epoch + batch_size`
    pub end_epoch: Option<u64>,
    /// Snapshot format tag passed through to the node export
    pub format: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    /// Build attempts consumed so far, across export, validation-triggered
    /// rebuilds and upload retries
    pub attempts: u64,
}

impl SnapshotJob {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The epoch the produced snapshot is anchored at.
    pub fn target_epoch(&self) -> u64 {
        self.end_epoch.unwrap_or(self.start_epoch)
    }
}

/// A produced snapshot file. Immutable once created; moves through
/// validation and upload by reference (path + checksum), never copied.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SnapshotArtifact {
    pub job_id: Uuid,
    pub file_path: PathBuf,
    pub epoch_height: u64,
    /// Hex-encoded SHA-256 over the full file
    pub checksum: String,
    pub size_bytes: u64,
    pub produced_at: DateTime<Utc>,
}

impl SnapshotArtifact {
    pub fn file_name(&self) -> String {
        self.file_path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
    }
}

/// The pipeline stage an event refers to.
#[derive(Serialize, Deserialize, Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    ComputeState,
    BuildHistoric,
    BuildLatest,
    Validate,
    Upload,
}

impl From<JobKind> for PipelineStage {
    fn from(kind: JobKind) -> Self {
        match kind {
            JobKind::ComputeState => PipelineStage::ComputeState,
            JobKind::BuildHistoric => PipelineStage::BuildHistoric,
            JobKind::BuildLatest => PipelineStage::BuildLatest,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Started,
    Retrying,
    Failed,
    Succeeded,
}

/// Append-only lifecycle record, published through the broker and consumed
/// by the notifier. Never mutated after publish.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StageEvent {
    pub job_id: Uuid,
    pub stage: PipelineStage,
    pub outcome: StageOutcome,
    pub attempt: u64,
    pub timestamp: DateTime<Utc>,
    pub detail: String,
}

/// Advisory progress update for operator channels. Never gates admission.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct EtaUpdate {
    pub current_height: u64,
    pub target_height: u64,
    /// `None` when the estimator has too few samples or the node is stalled
    pub eta_seconds: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

/// Everything the notifier consumes from the stage-events queue.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum PipelineEvent {
    Stage(StageEvent),
    Eta(EtaUpdate),
}
