use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Config;
use crate::jobs::types::{
    EtaUpdate, JobKind, JobStatus, PipelineEvent, PipelineStage, SnapshotJob, StageEvent, StageOutcome,
};
use crate::jobs::{handler_for_kind, JobError};
use crate::progress::ProgressTracker;
use crate::queue::job_queue::{processing_queue_for, ArtifactQueueMessage, JobQueueMessage};
use crate::queue::QueueType;
use crate::state_store::PersistedState;
use crate::upload;
use crate::validation::{self, ValidationOutcome};

pub mod lock;

use lock::NodeLock;

/// Ticks between advisory ETA events on the notification channel.
const ETA_PUBLISH_EVERY_TICKS: u64 = 20;

/// Why an admission attempt was refused. An expected scheduling outcome,
/// not an error: callers log it and try again on a later tick.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum AdmissionDenied {
    #[error("node-access lock is held by another job")]
    NodeLockHeld,
    #[error("a {0} job is already in flight")]
    JobInFlight(JobKind),
    #[error("free disk space {free} below configured floor {floor}")]
    DiskBelowFloor { free: u64, floor: u64 },
    #[error("chain height not observed yet")]
    HeightUnknown,
    #[error("caught up with the chain head, nothing to do")]
    CaughtUp,
    #[error("window ending at {end_epoch} is beyond synced height {height}")]
    WindowBeyondSyncedHeight { end_epoch: u64, height: u64 },
    #[error("state not computed through epoch {end_epoch} yet (computed through {compute_watermark})")]
    StateNotComputed { end_epoch: u64, compute_watermark: u64 },
    #[error("{remaining_secs}s remaining until the next latest build")]
    DelayNotElapsed { remaining_secs: u64 },
}

/// Operator-facing snapshot of the pipeline, served by the status route.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub current_height: Option<u64>,
    pub historic_watermark: u64,
    pub compute_watermark: u64,
    pub next_historic_window_end: u64,
    pub eta_to_next_window_secs: Option<u64>,
    pub node_data_dir: std::path::PathBuf,
    pub jobs: Vec<SnapshotJob>,
}

/// Owns job admission, the node-access lock, watermarks and the retry
/// policy. Stages receive it by reference; nothing scheduling-related lives
/// in ambient globals. Single-writer: only scheduler methods mutate the
/// registry and the persisted state.
pub struct Scheduler {
    config: Arc<Config>,
    node_lock: NodeLock,
    progress: Mutex<ProgressTracker>,
    registry: Mutex<HashMap<Uuid, SnapshotJob>>,
    cancellations: Mutex<HashMap<Uuid, CancellationToken>>,
    state: Mutex<PersistedState>,
    tick_counter: AtomicU64,
}

impl Scheduler {
    /// Loads persisted watermarks so scheduling decisions survive a restart.
    pub async fn new(config: Arc<Config>) -> color_eyre::Result<Self> {
        let state = config.state_store().load().await?;
        tracing::info!(
            historic_watermark = state.historic_watermark,
            compute_watermark = state.compute_watermark,
            "Loaded scheduler state"
        );
        Ok(Self {
            config,
            node_lock: NodeLock::new(),
            progress: Mutex::new(ProgressTracker::default()),
            registry: Mutex::new(HashMap::new()),
            cancellations: Mutex::new(HashMap::new()),
            state: Mutex::new(state),
            tick_counter: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// One pass of the coordination loop: observe the node, then offer
    /// admission to each kind in priority order. Compute-state first (it
    /// feeds the builders), historic next (backfill is time-insensitive but
    /// long), latest last.
    pub async fn tick(&self) {
        match self.config.archive_node().current_height().await {
            Ok(height) => self.record_height(height),
            Err(e) => tracing::warn!(error = %e, "Failed to poll node height"),
        }

        let tick = self.tick_counter.fetch_add(1, Ordering::Relaxed);
        if tick % ETA_PUBLISH_EVERY_TICKS == 0 {
            self.publish_eta_update().await;
        }

        // Backfill work only needs epochs the node already has; a latest
        // build near the head is pointless until the node is caught up.
        let synced = match self.config.archive_node().is_synced().await {
            Ok(synced) => synced,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to poll node sync status");
                false
            }
        };

        for kind in [JobKind::ComputeState, JobKind::BuildHistoric, JobKind::BuildLatest] {
            if kind == JobKind::BuildLatest && !synced {
                tracing::debug!(%kind, "Node not synced, skipping latest-build admission");
                continue;
            }
            match self.try_admit(kind) {
                Ok(job) => {
                    tracing::info!(job_id = %job.id, %kind, start_epoch = job.start_epoch, "Admitted job");
                    if let Err(e) = self.enqueue_job(&job, None).await {
                        // roll the admission back so the kind is not wedged
                        tracing::error!(job_id = %job.id, error = %e, "Failed to enqueue admitted job, rolling back");
                        self.node_lock.release(job.id);
                        self.registry.lock().expect("registry lock poisoned").remove(&job.id);
                        self.cancellations.lock().expect("cancellations lock poisoned").remove(&job.id);
                    }
                }
                Err(reason) => tracing::debug!(%kind, %reason, "Admission denied"),
            }
        }
    }

    /// Feeds a height observation into the progress tracker.
    pub fn record_height(&self, height: u64) {
        let now = self.config.clock().now();
        self.progress.lock().expect("progress lock poisoned").sample(now, height);
    }

    /// Attempts to admit one job of `kind`. Admission both creates the job
    /// and takes the node lock for it; the caller must enqueue it (or roll
    /// back) afterwards.
    pub fn try_admit(&self, kind: JobKind) -> Result<SnapshotJob, AdmissionDenied> {
        {
            let registry = self.registry.lock().expect("registry lock poisoned");
            if registry.values().any(|j| j.kind == kind && !j.is_terminal()) {
                return Err(AdmissionDenied::JobInFlight(kind));
            }
        }
        if !self.node_lock.is_free() {
            return Err(AdmissionDenied::NodeLockHeld);
        }

        let params = self.config.params();
        let free = self.config.disk_guard().free_bytes(&params.snapshot_dir);
        if free < params.disk_floor_bytes {
            return Err(AdmissionDenied::DiskBelowFloor { free, floor: params.disk_floor_bytes });
        }

        let current_height = self
            .progress
            .lock()
            .expect("progress lock poisoned")
            .current_height()
            .ok_or(AdmissionDenied::HeightUnknown)?;
        let state = self.state.lock().expect("state lock poisoned").clone();

        let (start_epoch, end_epoch) = match kind {
            JobKind::ComputeState => {
                // batch-aligned, as the node computes state in fixed strides
                let start = (state.compute_watermark / params.compute_batch_size) * params.compute_batch_size;
                if start + params.compute_batch_size > current_height {
                    return Err(AdmissionDenied::CaughtUp);
                }
                (start, None)
            }
            JobKind::BuildHistoric => {
                let start = state.historic_watermark + 1;
                let end = state.historic_watermark + params.historic_window_epochs;
                if end > current_height {
                    // denied rather than admitted to stall mid-export
                    return Err(AdmissionDenied::WindowBeyondSyncedHeight { end_epoch: end, height: current_height });
                }
                if end > state.compute_watermark {
                    return Err(AdmissionDenied::StateNotComputed {
                        end_epoch: end,
                        compute_watermark: state.compute_watermark,
                    });
                }
                (start, Some(end))
            }
            JobKind::BuildLatest => {
                if let Some(last) = state.last_run.get(&JobKind::BuildLatest) {
                    let elapsed = self.config.clock().now().signed_duration_since(*last);
                    let delay = chrono::Duration::from_std(params.latest_build_delay).unwrap_or(chrono::Duration::MAX);
                    if elapsed < delay {
                        let remaining = (delay - elapsed).num_seconds().max(0) as u64;
                        return Err(AdmissionDenied::DelayNotElapsed { remaining_secs: remaining });
                    }
                }
                if current_height <= params.latest_safety_margin {
                    return Err(AdmissionDenied::CaughtUp);
                }
                let end = current_height - params.latest_safety_margin;
                (end.saturating_sub(params.latest_export_depth), Some(end))
            }
        };

        let job = SnapshotJob {
            id: Uuid::new_v4(),
            kind,
            start_epoch,
            end_epoch,
            format: params.snapshot_format.clone(),
            status: JobStatus::Created,
            created_at: self.config.clock().now(),
            attempts: 0,
        };

        if !self.node_lock.try_acquire(job.id) {
            return Err(AdmissionDenied::NodeLockHeld);
        }

        let mut registry = self.registry.lock().expect("registry lock poisoned");
        registry.retain(|_, j| !(j.kind == kind && j.is_terminal()));
        registry.insert(job.id, job.clone());
        drop(registry);
        self.cancellations.lock().expect("cancellations lock poisoned").insert(job.id, CancellationToken::new());

        Ok(job)
    }

    /// Runs the node-driving stage of a job. Invoked by the per-kind
    /// processing-queue consumers. Stage failures are fully handled here
    /// (backoff re-queue or terminal failure); an `Err` means the job
    /// could not be driven at all.
    pub async fn process_job(&self, id: Uuid) -> Result<(), JobError> {
        let job = self.get_job(id)?;
        if job.status != JobStatus::Created {
            return Err(JobError::InvalidStatus { id, status: job.status });
        }

        // Re-queued builds arrive without the lock admission took for the
        // first attempt. Push back rather than burn an attempt if another
        // kind holds the node right now.
        let holds_lock = self.node_lock.holder() == Some(id);
        if !holds_lock && !self.node_lock.try_acquire(id) {
            tracing::info!(job_id = %id, "Node busy, deferring re-queued job");
            self.enqueue_job(&job, Some(self.config.params().backoff.base_delay)).await?;
            return Ok(());
        }

        self.update_status(id, JobStatus::Building)?;
        let stage = PipelineStage::from(job.kind);
        self.publish_stage_event(id, stage, StageOutcome::Started, job.attempts + 1, String::new()).await;

        let cancel = self.cancellation_for(id);
        let handler = handler_for_kind(job.kind);
        let timeout = self.config.params().build_timeout;

        let result = match tokio::time::timeout(timeout, handler.process(&self.config, &job, &cancel)).await {
            Ok(result) => result,
            Err(_elapsed) => {
                cancel.cancel();
                self.discard_job_output(&job).await;
                Err(JobError::StageTimeout { id, secs: timeout.as_secs() })
            }
        };

        match result {
            Ok(Some(artifact)) => {
                // node-driving portion is done; let the other kinds at it
                // while this artifact validates and uploads
                self.node_lock.release(id);
                self.update_status(id, JobStatus::PendingValidation)?;
                self.publish_stage_event(id, stage, StageOutcome::Succeeded, job.attempts + 1, artifact.file_name())
                    .await;
                let message = ArtifactQueueMessage { artifact, metadata: None };
                self.send_json(QueueType::SnapshotValidation, &message, None).await?;
            }
            Ok(None) => {
                self.complete_job(id).await?;
            }
            Err(e) => {
                self.handle_stage_failure(id, stage, e).await?;
            }
        }
        Ok(())
    }

    /// Validation stage, invoked by the validation-queue consumer. Always
    /// precedes upload for an artifact: the upload queue is only fed from
    /// here, and only on a Valid outcome.
    pub async fn run_validation(&self, message: ArtifactQueueMessage) -> Result<(), JobError> {
        let artifact = message.artifact;
        let job = self.get_job(artifact.job_id)?;
        if job.status != JobStatus::PendingValidation {
            return Err(JobError::InvalidStatus { id: job.id, status: job.status });
        }

        self.publish_stage_event(job.id, PipelineStage::Validate, StageOutcome::Started, job.attempts + 1, String::new())
            .await;

        let timeout = self.config.params().validation_timeout;
        let outcome = match tokio::time::timeout(timeout, validation::validate(&self.config, &artifact)).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                // transient inspection trouble: retry validation itself
                return self
                    .retry_artifact_stage(
                        job.id,
                        PipelineStage::Validate,
                        QueueType::SnapshotValidation,
                        ArtifactQueueMessage { artifact, metadata: None },
                        e,
                    )
                    .await;
            }
            Err(_elapsed) => {
                return self
                    .retry_artifact_stage(
                        job.id,
                        PipelineStage::Validate,
                        QueueType::SnapshotValidation,
                        ArtifactQueueMessage { artifact, metadata: None },
                        JobError::StageTimeout { id: job.id, secs: timeout.as_secs() },
                    )
                    .await;
            }
        };

        match outcome {
            ValidationOutcome::Valid { metadata } => {
                self.update_status(job.id, JobStatus::PendingUpload)?;
                self.publish_stage_event(
                    job.id,
                    PipelineStage::Validate,
                    StageOutcome::Succeeded,
                    job.attempts + 1,
                    artifact.file_name(),
                )
                .await;
                let message = ArtifactQueueMessage { artifact, metadata: Some(metadata) };
                self.send_json(QueueType::SnapshotUpload, &message, None).await?;
            }
            ValidationOutcome::Invalid { reason } => {
                // invalid artifacts are deleted and rebuilt from scratch
                crate::jobs::discard_partial_file(&artifact.file_path).await;
                self.handle_stage_failure(job.id, PipelineStage::Validate, JobError::ValidationFailed(reason)).await?;
            }
        }
        Ok(())
    }

    /// Upload stage, invoked by the upload-queue consumer. The uploader
    /// deletes the local file only after the remote checksum read-back
    /// matches; on failure the artifact is retained for retry or operator
    /// intervention.
    pub async fn run_upload(&self, message: ArtifactQueueMessage) -> Result<(), JobError> {
        let job = self.get_job(message.artifact.job_id)?;
        if job.status != JobStatus::PendingUpload {
            return Err(JobError::InvalidStatus { id: job.id, status: job.status });
        }

        self.publish_stage_event(job.id, PipelineStage::Upload, StageOutcome::Started, job.attempts + 1, String::new())
            .await;

        let timeout = self.config.params().upload_timeout;
        let result = match tokio::time::timeout(timeout, upload::upload(&self.config, &message)).await {
            Ok(result) => result,
            Err(_elapsed) => Err(JobError::StageTimeout { id: job.id, secs: timeout.as_secs() }),
        };

        match result {
            Ok(()) => {
                self.publish_stage_event(
                    job.id,
                    PipelineStage::Upload,
                    StageOutcome::Succeeded,
                    job.attempts + 1,
                    message.artifact.file_name(),
                )
                .await;
                self.complete_job(job.id).await?;
            }
            Err(e) => {
                self.retry_artifact_stage(job.id, PipelineStage::Upload, QueueType::SnapshotUpload, message, e)
                    .await?;
            }
        }
        Ok(())
    }

    /// Marks a job terminal-successful, records the last-run timestamp and
    /// advances the watermarks. The scheduler is the only writer of either.
    pub async fn complete_job(&self, id: Uuid) -> Result<(), JobError> {
        let job = self.get_job(id)?;
        self.update_status(id, JobStatus::Succeeded)?;
        self.node_lock.release(id);
        self.cancellations.lock().expect("cancellations lock poisoned").remove(&id);

        let now = self.config.clock().now();
        let params = self.config.params();
        let state_snapshot = {
            let mut state = self.state.lock().expect("state lock poisoned");
            state.last_run.insert(job.kind, now);
            match job.kind {
                JobKind::ComputeState => {
                    let computed_through = job.start_epoch + params.compute_batch_size;
                    state.compute_watermark = state.compute_watermark.max(computed_through);
                }
                JobKind::BuildHistoric => {
                    state.historic_watermark = state.historic_watermark.max(job.target_epoch());
                }
                JobKind::BuildLatest => {}
            }
            state.clone()
        };
        self.config.state_store().save(&state_snapshot).await?;

        if job.kind == JobKind::ComputeState {
            self.publish_stage_event(
                id,
                PipelineStage::ComputeState,
                StageOutcome::Succeeded,
                job.attempts + 1,
                format!("computed through epoch {}", job.start_epoch + params.compute_batch_size),
            )
            .await;
        }

        tracing::info!(job_id = %id, kind = %job.kind, "Job completed");
        Ok(())
    }

    /// Cooperative cancellation: flips the job's token; the active stage
    /// notices at its next safe point and leaves no partial artifact.
    pub fn cancel_job(&self, id: Uuid) -> Result<(), JobError> {
        let registry = self.registry.lock().expect("registry lock poisoned");
        if !registry.contains_key(&id) {
            return Err(JobError::JobNotFound { id });
        }
        drop(registry);
        self.cancellation_for(id).cancel();
        tracing::info!(job_id = %id, "Cancellation requested");
        Ok(())
    }

    pub fn status(&self) -> StatusReport {
        let state = self.state.lock().expect("state lock poisoned").clone();
        let progress = self.progress.lock().expect("progress lock poisoned");
        let next_window_end = state.historic_watermark + self.config.params().historic_window_epochs;
        StatusReport {
            current_height: progress.current_height(),
            historic_watermark: state.historic_watermark,
            compute_watermark: state.compute_watermark,
            next_historic_window_end: next_window_end,
            eta_to_next_window_secs: progress.estimate_completion(next_window_end).map(|d| d.as_secs()),
            node_data_dir: self.config.archive_node().data_dir(),
            jobs: self.registry.lock().expect("registry lock poisoned").values().cloned().collect(),
        }
    }

    pub fn get_job(&self, id: Uuid) -> Result<SnapshotJob, JobError> {
        self.registry
            .lock()
            .expect("registry lock poisoned")
            .get(&id)
            .cloned()
            .ok_or(JobError::JobNotFound { id })
    }

    // ---- internals ----

    /// Shared failure path: counts the attempt, re-queues the build with
    /// backoff while the budget lasts, otherwise marks the job Failed. The
    /// node lock is always released so other kinds can proceed.
    async fn handle_stage_failure(&self, id: Uuid, stage: PipelineStage, error: JobError) -> Result<(), JobError> {
        self.node_lock.release(id);

        if matches!(error, JobError::Cancelled { .. }) {
            self.update_status(id, JobStatus::Failed)?;
            self.publish_stage_event(id, stage, StageOutcome::Failed, self.get_job(id)?.attempts, "cancelled".into())
                .await;
            return Ok(());
        }

        let (job, attempts) = self.increment_attempts(id)?;
        let backoff = self.config.params().backoff;

        if error.is_retryable() && backoff.allows_retry(attempts) {
            self.update_status(id, JobStatus::Created)?;
            self.publish_stage_event(id, stage, StageOutcome::Retrying, attempts, error.to_string()).await;
            self.enqueue_job(&job, Some(backoff.delay_for(attempts))).await?;
        } else {
            self.update_status(id, JobStatus::Failed)?;
            self.cancellations.lock().expect("cancellations lock poisoned").remove(&id);
            self.publish_stage_event(id, stage, StageOutcome::Failed, attempts, error.to_string()).await;
            tracing::error!(job_id = %id, %stage, attempts, error = %error, "Job failed terminally");
        }
        Ok(())
    }

    /// Retry path for validation/upload stages: the artifact stays intact
    /// and its message is re-queued to the same stage with backoff.
    async fn retry_artifact_stage(
        &self,
        id: Uuid,
        stage: PipelineStage,
        queue: QueueType,
        message: ArtifactQueueMessage,
        error: JobError,
    ) -> Result<(), JobError> {
        let (_, attempts) = self.increment_attempts(id)?;
        let backoff = self.config.params().backoff;

        if error.is_retryable() && backoff.allows_retry(attempts) {
            self.publish_stage_event(id, stage, StageOutcome::Retrying, attempts, error.to_string()).await;
            self.send_json(queue, &message, Some(backoff.delay_for(attempts))).await?;
        } else {
            // terminal: the artifact is retained on disk for the operator,
            // never silently dropped
            self.update_status(id, JobStatus::Failed)?;
            self.cancellations.lock().expect("cancellations lock poisoned").remove(&id);
            self.publish_stage_event(id, stage, StageOutcome::Failed, attempts, error.to_string()).await;
            tracing::error!(
                job_id = %id,
                %stage,
                attempts,
                artifact = %message.artifact.file_path.display(),
                error = %error,
                "Stage failed terminally, artifact retained on disk"
            );
        }
        Ok(())
    }

    async fn enqueue_job(&self, job: &SnapshotJob, delay: Option<Duration>) -> Result<(), JobError> {
        let message = JobQueueMessage { id: job.id };
        self.send_json(processing_queue_for(job.kind), &message, delay).await
    }

    async fn send_json<T: serde::Serialize>(
        &self,
        queue: QueueType,
        message: &T,
        delay: Option<Duration>,
    ) -> Result<(), JobError> {
        let payload = serde_json::to_string(message).map_err(|e| JobError::Other(e.to_string().into()))?;
        self.config.queue().send_message_to_queue(queue, payload, delay).await?;
        Ok(())
    }

    /// Stage events are advisory for the notifier; a publish failure is
    /// logged and dropped so it can never fail a stage.
    async fn publish_stage_event(
        &self,
        job_id: Uuid,
        stage: PipelineStage,
        outcome: StageOutcome,
        attempt: u64,
        detail: String,
    ) {
        let event = PipelineEvent::Stage(StageEvent {
            job_id,
            stage,
            outcome,
            attempt,
            timestamp: self.config.clock().now(),
            detail,
        });
        self.publish_event(event).await;
    }

    async fn publish_eta_update(&self) {
        let (current, target, eta) = {
            let state = self.state.lock().expect("state lock poisoned");
            let progress = self.progress.lock().expect("progress lock poisoned");
            let target = state.historic_watermark + self.config.params().historic_window_epochs;
            let Some(current) = progress.current_height() else { return };
            (current, target, progress.estimate_completion(target))
        };
        if target <= current {
            return;
        }
        let event = PipelineEvent::Eta(EtaUpdate {
            current_height: current,
            target_height: target,
            eta_seconds: eta.map(|d| d.as_secs()),
            timestamp: self.config.clock().now(),
        });
        self.publish_event(event).await;
    }

    async fn publish_event(&self, event: PipelineEvent) {
        match serde_json::to_string(&event) {
            Ok(payload) => {
                if let Err(e) =
                    self.config.queue().send_message_to_queue(QueueType::PipelineEvents, payload, None).await
                {
                    tracing::warn!(error = %e, "Failed to publish pipeline event, dropping");
                }
            }
            Err(e) => tracing::error!(error = %e, "Failed to serialize pipeline event"),
        }
    }

    fn update_status(&self, id: Uuid, status: JobStatus) -> Result<(), JobError> {
        let mut registry = self.registry.lock().expect("registry lock poisoned");
        let job = registry.get_mut(&id).ok_or(JobError::JobNotFound { id })?;
        job.status = status;
        Ok(())
    }

    fn increment_attempts(&self, id: Uuid) -> Result<(SnapshotJob, u64), JobError> {
        let mut registry = self.registry.lock().expect("registry lock poisoned");
        let job = registry.get_mut(&id).ok_or(JobError::JobNotFound { id })?;
        job.attempts += 1;
        Ok((job.clone(), job.attempts))
    }

    fn cancellation_for(&self, id: Uuid) -> CancellationToken {
        self.cancellations
            .lock()
            .expect("cancellations lock poisoned")
            .entry(id)
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    /// Best-effort cleanup of whatever a timed-out export left behind:
    /// anything in the kind's directory anchored at the job's epoch is a
    /// partial file (a completed file would have short-circuited the
    /// export).
    async fn discard_job_output(&self, job: &SnapshotJob) {
        let subdir = match job.kind {
            JobKind::BuildHistoric => crate::jobs::historic_build::HISTORIC_SUBDIR,
            JobKind::BuildLatest => crate::jobs::latest_build::LATEST_SUBDIR,
            JobKind::ComputeState => return,
        };
        let folder = self.config.params().snapshot_dir.join(subdir);
        let needle = format!("height_{}", job.target_epoch());

        let Ok(mut entries) = tokio::fs::read_dir(&folder).await else { return };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_name().to_string_lossy().contains(&needle) {
                crate::jobs::discard_partial_file(&entry.path()).await;
            }
        }
    }
}
