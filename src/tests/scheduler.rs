use std::sync::Arc;
use std::time::Duration;

use rstest::rstest;

use crate::jobs::types::{JobKind, JobStatus};
use crate::queue::QueueType;
use crate::scheduler::{AdmissionDenied, Scheduler};
use crate::state_store::PersistedState;
use crate::tests::common::{default_node, TestHarness};

const PLENTY_OF_DISK: u64 = 1 << 40;

async fn scheduler_with(harness: &TestHarness, node: crate::node::MockArchiveNode, free_disk: u64) -> Arc<Scheduler> {
    Arc::new(Scheduler::new(harness.config_with(node, free_disk)).await.unwrap())
}

#[tokio::test]
async fn admission_requires_an_observed_height() {
    let harness = TestHarness::new();
    let scheduler = scheduler_with(&harness, default_node(), PLENTY_OF_DISK).await;

    assert_eq!(scheduler.try_admit(JobKind::ComputeState).unwrap_err(), AdmissionDenied::HeightUnknown);
}

#[tokio::test]
async fn disk_below_floor_denies_admission_and_creates_no_job() {
    let harness = TestHarness::new();
    // floor in test params is 1024 bytes
    let scheduler = scheduler_with(&harness, default_node(), 100).await;
    scheduler.record_height(5_000);

    let denied = scheduler.try_admit(JobKind::BuildLatest).unwrap_err();
    assert!(matches!(denied, AdmissionDenied::DiskBelowFloor { free: 100, floor: 1024 }));
    assert!(scheduler.status().jobs.is_empty());
}

#[tokio::test]
async fn node_lock_serializes_kinds_and_registry_serializes_per_kind() {
    let harness = TestHarness::new();
    let scheduler = scheduler_with(&harness, default_node(), PLENTY_OF_DISK).await;
    scheduler.record_height(5_000);

    let job = scheduler.try_admit(JobKind::ComputeState).unwrap();
    assert_eq!(job.status, JobStatus::Created);

    // the node lock refuses every other kind while compute-state holds it
    assert_eq!(scheduler.try_admit(JobKind::BuildLatest).unwrap_err(), AdmissionDenied::NodeLockHeld);
    // and the registry refuses a second job of the same kind
    assert_eq!(
        scheduler.try_admit(JobKind::ComputeState).unwrap_err(),
        AdmissionDenied::JobInFlight(JobKind::ComputeState)
    );
}

#[tokio::test]
async fn concurrent_admission_attempts_grant_at_most_one_job() {
    let harness = TestHarness::new();
    let scheduler = scheduler_with(&harness, default_node(), PLENTY_OF_DISK).await;
    scheduler.record_height(5_000);

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let scheduler = Arc::clone(&scheduler);
            let kind = if i % 2 == 0 { JobKind::ComputeState } else { JobKind::BuildLatest };
            std::thread::spawn(move || scheduler.try_admit(kind).is_ok())
        })
        .collect();

    let admitted = handles.into_iter().map(|h| h.join().unwrap()).filter(|&g| g).count();
    assert_eq!(admitted, 1);
}

#[rstest]
#[case(1_040, AdmissionDenied::WindowBeyondSyncedHeight { end_epoch: 1_050, height: 1_040 })]
#[tokio::test]
async fn historic_window_beyond_synced_height_is_denied(#[case] height: u64, #[case] expected: AdmissionDenied) {
    let harness = TestHarness::new();
    harness
        .seed_state(&PersistedState { historic_watermark: 1_000, compute_watermark: 5_000, ..Default::default() })
        .await;
    let scheduler = scheduler_with(&harness, default_node(), PLENTY_OF_DISK).await;
    scheduler.record_height(height);

    assert_eq!(scheduler.try_admit(JobKind::BuildHistoric).unwrap_err(), expected);
}

#[tokio::test]
async fn historic_build_waits_for_computed_state() {
    let harness = TestHarness::new();
    harness
        .seed_state(&PersistedState { historic_watermark: 1_000, compute_watermark: 1_020, ..Default::default() })
        .await;
    let scheduler = scheduler_with(&harness, default_node(), PLENTY_OF_DISK).await;
    scheduler.record_height(2_000);

    assert_eq!(
        scheduler.try_admit(JobKind::BuildHistoric).unwrap_err(),
        AdmissionDenied::StateNotComputed { end_epoch: 1_050, compute_watermark: 1_020 }
    );
}

#[tokio::test]
async fn latest_build_respects_the_configured_delay() {
    let harness = TestHarness::new();
    // nothing left to compute or backfill, so only latest is eligible
    harness
        .seed_state(&PersistedState { historic_watermark: 5_000, compute_watermark: 5_100, ..Default::default() })
        .await;
    let scheduler = scheduler_with(&harness, default_node(), PLENTY_OF_DISK).await;
    scheduler.record_height(5_100);

    // t=0: no previous run, admitted
    let job = scheduler.try_admit(JobKind::BuildLatest).unwrap();
    assert_eq!(job.end_epoch, Some(5_090));
    scheduler.complete_job(job.id).await.unwrap();

    // t=1s: inside the 300s delay
    harness.clock.advance(Duration::from_secs(1));
    assert!(matches!(
        scheduler.try_admit(JobKind::BuildLatest).unwrap_err(),
        AdmissionDenied::DelayNotElapsed { .. }
    ));

    // t=301s: admitted again
    harness.clock.advance(Duration::from_secs(300));
    assert!(scheduler.try_admit(JobKind::BuildLatest).is_ok());
}

#[tokio::test]
async fn compute_state_has_priority_on_the_tick() {
    let harness = TestHarness::new();
    let mut node = default_node();
    node.expect_current_height().returning(|| Ok(2_000));
    node.expect_is_synced().returning(|| Ok(true));

    let scheduler = scheduler_with(&harness, node, PLENTY_OF_DISK).await;
    scheduler.tick().await;
    // a second tick must not admit anything further while the first job runs
    harness.clock.advance(Duration::from_secs(30));
    scheduler.tick().await;

    assert_eq!(harness.queue.sent_to(QueueType::ComputeStateProcessing).len(), 1);
    assert!(harness.queue.sent_to(QueueType::HistoricBuildProcessing).is_empty());
    assert!(harness.queue.sent_to(QueueType::LatestBuildProcessing).is_empty());

    let jobs = scheduler.status().jobs;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].kind, JobKind::ComputeState);
}

#[tokio::test]
async fn completing_a_compute_job_advances_the_compute_watermark() {
    let harness = TestHarness::new();
    let scheduler = scheduler_with(&harness, default_node(), PLENTY_OF_DISK).await;
    scheduler.record_height(2_000);

    let job = scheduler.try_admit(JobKind::ComputeState).unwrap();
    assert_eq!(job.start_epoch, 0);
    scheduler.complete_job(job.id).await.unwrap();

    // batch size is 50 in the test params
    assert_eq!(harness.persisted_state().await.compute_watermark, 50);
    assert_eq!(scheduler.get_job(job.id).unwrap().status, JobStatus::Succeeded);
}
