use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::jobs::types::{JobKind, JobStatus, PipelineEvent, PipelineStage, StageOutcome};
use crate::node::{ArchiveInfo, MockArchiveNode, NodeError};
use crate::queue::job_queue::ArtifactQueueMessage;
use crate::queue::QueueType;
use crate::scheduler::Scheduler;
use crate::state_store::PersistedState;
use crate::tests::common::{default_node, TestHarness};
use crate::upload::object_key;

const PLENTY_OF_DISK: u64 = 1 << 40;

/// Node double whose export really writes a file and whose inspection
/// agrees with the build window.
fn exporting_node(anchored_epoch: u64) -> MockArchiveNode {
    let mut node = default_node();
    node.expect_export_snapshot().returning(|_, _, _, path| {
        std::fs::write(path, b"snapshot-bytes").unwrap();
        Ok(())
    });
    node.expect_inspect_archive().returning(move |_| {
        Ok(ArchiveInfo {
            epoch: anchored_epoch,
            state_root: Some("bafyroot".to_string()),
            fields: HashMap::from([("CAR format".to_string(), "zstd".to_string())]),
        })
    });
    node.expect_state_root_at().returning(|_| Ok(Some("bafyroot".to_string())));
    node
}

async fn historic_scheduler(harness: &TestHarness, node: MockArchiveNode) -> Arc<Scheduler> {
    harness
        .seed_state(&PersistedState { historic_watermark: 1_000, compute_watermark: 1_100, ..Default::default() })
        .await;
    let scheduler = Arc::new(Scheduler::new(harness.config_with(node, PLENTY_OF_DISK)).await.unwrap());
    scheduler.record_height(1_100);
    scheduler
}

fn last_message_to(harness: &TestHarness, queue: QueueType) -> ArtifactQueueMessage {
    let sent = harness.queue.sent_to(queue);
    serde_json::from_str(&sent.last().expect("no message on queue").payload).unwrap()
}

fn stage_trace(harness: &TestHarness) -> Vec<(PipelineStage, StageOutcome)> {
    harness
        .queue
        .events()
        .into_iter()
        .filter_map(|e| match e {
            PipelineEvent::Stage(s) => Some((s.stage, s.outcome)),
            PipelineEvent::Eta(_) => None,
        })
        .collect()
}

#[tokio::test]
async fn historic_window_builds_validates_uploads_and_advances_the_watermark() {
    let harness = TestHarness::new();
    let scheduler = historic_scheduler(&harness, exporting_node(1_050)).await;

    // build
    let job = scheduler.try_admit(JobKind::BuildHistoric).unwrap();
    assert_eq!((job.start_epoch, job.end_epoch), (1_001, Some(1_050)));
    scheduler.process_job(job.id).await.unwrap();

    let validation_msg = last_message_to(&harness, QueueType::SnapshotValidation);
    let artifact = validation_msg.artifact.clone();
    assert_eq!(artifact.epoch_height, 1_050);
    assert!(artifact.file_path.exists());
    assert!(artifact.file_name().contains("height_1050"));

    // validate
    scheduler.run_validation(validation_msg).await.unwrap();
    let upload_msg = last_message_to(&harness, QueueType::SnapshotUpload);
    assert!(upload_msg.metadata.is_some(), "validator must attach the metadata sidecar");

    // upload
    scheduler.run_upload(upload_msg).await.unwrap();

    let key = object_key("calibnet", &artifact);
    assert!(harness.storage.contains(&key));
    assert!(harness.storage.contains(&format!("{}.sha256sum", key)));
    assert!(harness.storage.contains(&format!("{}.metadata.json", key)));
    assert!(!artifact.file_path.exists(), "local copy must be removed after confirmed upload");

    assert_eq!(harness.persisted_state().await.historic_watermark, 1_050);
    assert_eq!(scheduler.get_job(job.id).unwrap().status, JobStatus::Succeeded);
    assert!(harness.persisted_state().await.last_run.contains_key(&JobKind::BuildHistoric));
}

#[tokio::test]
async fn validation_always_precedes_upload_in_the_event_trace() {
    let harness = TestHarness::new();
    let scheduler = historic_scheduler(&harness, exporting_node(1_050)).await;

    let job = scheduler.try_admit(JobKind::BuildHistoric).unwrap();
    scheduler.process_job(job.id).await.unwrap();
    scheduler.run_validation(last_message_to(&harness, QueueType::SnapshotValidation)).await.unwrap();
    scheduler.run_upload(last_message_to(&harness, QueueType::SnapshotUpload)).await.unwrap();

    let trace = stage_trace(&harness);
    let position = |stage, outcome| trace.iter().position(|&t| t == (stage, outcome)).unwrap();

    assert!(
        position(PipelineStage::BuildHistoric, StageOutcome::Succeeded)
            < position(PipelineStage::Validate, StageOutcome::Started)
    );
    assert!(
        position(PipelineStage::Validate, StageOutcome::Succeeded)
            < position(PipelineStage::Upload, StageOutcome::Started)
    );
}

#[tokio::test]
async fn failed_export_leaves_no_partial_file_and_retries_with_backoff() {
    let harness = TestHarness::new();
    let mut node = default_node();
    node.expect_export_snapshot().returning(|_, _, _, path| {
        std::fs::write(path, b"truncated").unwrap();
        Err(NodeError::ExportFailed("node crashed mid-export".to_string()))
    });
    let scheduler = historic_scheduler(&harness, node).await;

    let job = scheduler.try_admit(JobKind::BuildHistoric).unwrap();
    scheduler.process_job(job.id).await.unwrap();

    let historic_dir = harness.snapshot_dir.join("historic");
    let leftovers: Vec<_> = std::fs::read_dir(&historic_dir).unwrap().collect();
    assert!(leftovers.is_empty(), "partial export output must be removed");

    let retried = scheduler.get_job(job.id).unwrap();
    assert_eq!(retried.status, JobStatus::Created);
    assert_eq!(retried.attempts, 1);

    let requeued = harness.queue.sent_to(QueueType::HistoricBuildProcessing);
    assert_eq!(requeued.len(), 1);
    assert!(requeued[0].delay.is_some(), "retry must be delayed by the backoff policy");

    // second failure exhausts the 2-attempt budget
    scheduler.process_job(job.id).await.unwrap();
    assert_eq!(scheduler.get_job(job.id).unwrap().status, JobStatus::Failed);
    assert!(stage_trace(&harness).contains(&(PipelineStage::BuildHistoric, StageOutcome::Failed)));
}

#[tokio::test]
async fn invalid_artifact_is_deleted_and_the_job_requeued_for_rebuild() {
    let harness = TestHarness::new();
    // inspection reports the wrong anchor epoch
    let scheduler = historic_scheduler(&harness, exporting_node(999)).await;

    let job = scheduler.try_admit(JobKind::BuildHistoric).unwrap();
    scheduler.process_job(job.id).await.unwrap();

    let validation_msg = last_message_to(&harness, QueueType::SnapshotValidation);
    let artifact_path = validation_msg.artifact.file_path.clone();
    scheduler.run_validation(validation_msg).await.unwrap();

    assert!(!artifact_path.exists(), "invalid artifact must be deleted");
    assert!(harness.queue.sent_to(QueueType::SnapshotUpload).is_empty(), "invalid artifact must never reach upload");

    let requeued = scheduler.get_job(job.id).unwrap();
    assert_eq!(requeued.status, JobStatus::Created);
    assert_eq!(requeued.attempts, 1);
    assert_eq!(harness.queue.sent_to(QueueType::HistoricBuildProcessing).len(), 1);
}

#[tokio::test]
async fn upload_checksum_mismatch_exhausts_attempts_and_retains_the_artifact() {
    let harness = TestHarness::new();
    let scheduler = historic_scheduler(&harness, exporting_node(1_050)).await;

    let job = scheduler.try_admit(JobKind::BuildHistoric).unwrap();
    scheduler.process_job(job.id).await.unwrap();
    scheduler.run_validation(last_message_to(&harness, QueueType::SnapshotValidation)).await.unwrap();

    harness.storage.corrupt_head_reports();
    let upload_msg = last_message_to(&harness, QueueType::SnapshotUpload);
    let artifact_path = upload_msg.artifact.file_path.clone();

    // first mismatch: retried
    scheduler.run_upload(upload_msg).await.unwrap();
    assert_eq!(scheduler.get_job(job.id).unwrap().attempts, 1);
    assert_eq!(scheduler.get_job(job.id).unwrap().status, JobStatus::PendingUpload);

    // second mismatch: attempts exhausted, artifact retained for the operator
    let retry_msg = last_message_to(&harness, QueueType::SnapshotUpload);
    scheduler.run_upload(retry_msg).await.unwrap();

    let failed = scheduler.get_job(job.id).unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.attempts, 2);
    assert!(artifact_path.exists(), "artifact must be retained on disk after terminal upload failure");
    assert!(stage_trace(&harness).contains(&(PipelineStage::Upload, StageOutcome::Failed)));
}

#[tokio::test]
async fn cancelled_job_terminates_without_output() {
    let harness = TestHarness::new();
    // export must never run; a cancelled job stops at the first safe point
    let scheduler = historic_scheduler(&harness, default_node()).await;

    let job = scheduler.try_admit(JobKind::BuildHistoric).unwrap();
    scheduler.cancel_job(job.id).unwrap();
    scheduler.process_job(job.id).await.unwrap();

    assert_eq!(scheduler.get_job(job.id).unwrap().status, JobStatus::Failed);
    let historic_dir = harness.snapshot_dir.join("historic");
    let leftovers: Vec<_> =
        std::fs::read_dir(&historic_dir).map(|d| d.collect()).unwrap_or_default();
    assert!(leftovers.is_empty());

    // the lock is free again for other kinds
    assert!(scheduler.try_admit(JobKind::BuildLatest).is_ok());
}

#[tokio::test]
async fn artifact_for_an_unknown_job_is_surfaced_not_swallowed() {
    let harness = TestHarness::new();
    let scheduler = historic_scheduler(&harness, exporting_node(1_050)).await;

    let message = ArtifactQueueMessage {
        artifact: crate::jobs::types::SnapshotArtifact {
            job_id: uuid::Uuid::new_v4(),
            file_path: PathBuf::from("/nonexistent/snapshot.forest.car.zst"),
            epoch_height: 1_050,
            checksum: "abc".to_string(),
            size_bytes: 1,
            produced_at: chrono::Utc::now(),
        },
        metadata: None,
    };
    let err = scheduler.run_validation(message).await.unwrap_err();
    assert!(matches!(err, crate::jobs::JobError::JobNotFound { .. }));
}
