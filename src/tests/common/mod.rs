use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use omniqueue::{Delivery, QueueError};
use tempfile::TempDir;

use crate::alerts::MockAlerts;
use crate::config::{Config, PipelineParams};
use crate::data_storage::DataStorage;
use crate::disk::StaticDiskGuard;
use crate::jobs::types::PipelineEvent;
use crate::node::MockArchiveNode;
use crate::queue::{QueueProvider, QueueType};
use crate::state_store::JsonFileStore;
use crate::utils::backoff::BackoffPolicy;
use crate::utils::clock::Clock;

/// Queue double that records every send and never yields a delivery.
/// Scenario tests drive stages directly and assert on the recorded
/// topology and event order.
#[derive(Clone, Default)]
pub struct RecordingQueue {
    sent: Arc<Mutex<Vec<SentMessage>>>,
}

#[derive(Debug, Clone)]
pub struct SentMessage {
    pub queue: QueueType,
    pub payload: String,
    pub delay: Option<Duration>,
}

impl RecordingQueue {
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, queue: QueueType) -> Vec<SentMessage> {
        self.sent().into_iter().filter(|m| m.queue == queue).collect()
    }

    /// Stage/ETA events in publish order.
    pub fn events(&self) -> Vec<PipelineEvent> {
        self.sent_to(QueueType::PipelineEvents)
            .iter()
            .map(|m| serde_json::from_str(&m.payload).expect("unparseable pipeline event"))
            .collect()
    }
}

#[async_trait]
impl QueueProvider for RecordingQueue {
    async fn send_message_to_queue(
        &self,
        queue: QueueType,
        payload: String,
        delay: Option<Duration>,
    ) -> color_eyre::Result<()> {
        self.sent.lock().unwrap().push(SentMessage { queue, payload, delay });
        Ok(())
    }

    async fn consume_message_from_queue(&self, _queue: QueueType) -> Result<Delivery, QueueError> {
        Err(QueueError::NoData)
    }
}

/// In-memory object store with an injectable lying `head`, for exercising
/// the uploader's read-back verification.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    objects: Arc<Mutex<HashMap<String, String>>>,
    corrupt_head: Arc<AtomicBool>,
}

impl MemoryStorage {
    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    /// Makes `head` report a bogus checksum for every stored object.
    pub fn corrupt_head_reports(&self) {
        self.corrupt_head.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl DataStorage for MemoryStorage {
    async fn put_file(&self, key: &str, path: &Path, checksum: &str) -> color_eyre::Result<()> {
        // the file must exist; the store keeps only its checksum
        tokio::fs::metadata(path).await?;
        self.objects.lock().unwrap().insert(key.to_string(), checksum.to_string());
        Ok(())
    }

    async fn put_bytes(&self, key: &str, data: bytes::Bytes) -> color_eyre::Result<()> {
        self.objects.lock().unwrap().insert(key.to_string(), crate::utils::checksum::sha256_bytes(&data));
        Ok(())
    }

    async fn head(&self, key: &str) -> color_eyre::Result<Option<String>> {
        let stored = self.objects.lock().unwrap().get(key).cloned();
        match stored {
            Some(_) if self.corrupt_head.load(Ordering::SeqCst) => Ok(Some("0000corrupt".to_string())),
            other => Ok(other),
        }
    }
}

/// Settable clock so delay and backoff scenarios run without sleeping.
#[derive(Clone)]
pub struct TestClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl TestClock {
    pub fn at_epoch_start() -> Self {
        Self { now: Arc::new(Mutex::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap())) }
    }

    pub fn advance(&self, delta: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += chrono::Duration::from_std(delta).unwrap();
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Small, fast pipeline tunables against a tempdir snapshot volume.
pub fn test_params(snapshot_dir: &Path) -> PipelineParams {
    PipelineParams {
        chain: "calibnet".to_string(),
        snapshot_dir: snapshot_dir.to_path_buf(),
        snapshot_format: "v1".to_string(),
        seconds_per_epoch: 30,
        compute_batch_size: 50,
        historic_window_epochs: 50,
        latest_safety_margin: 10,
        latest_export_depth: 40,
        latest_build_delay: Duration::from_secs(300),
        disk_floor_bytes: 1024,
        backoff: BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(10), 2),
        build_timeout: Duration::from_secs(5),
        validation_timeout: Duration::from_secs(5),
        upload_timeout: Duration::from_secs(5),
        poll_interval: Duration::from_secs(1),
    }
}

/// Alerts double that swallows everything.
pub fn noop_alerts() -> MockAlerts {
    let mut alerts = MockAlerts::new();
    alerts.expect_send_alert_message().returning(|_| Ok(()));
    alerts
}

/// Node double with benign defaults for the calls every build makes.
pub fn default_node() -> MockArchiveNode {
    let mut node = MockArchiveNode::new();
    node.expect_genesis_timestamp().returning(|| Ok(1_598_306_400));
    node.expect_data_dir().return_const(PathBuf::from("/data/forest"));
    node
}

pub struct TestHarness {
    pub queue: RecordingQueue,
    pub storage: MemoryStorage,
    pub clock: TestClock,
    pub snapshot_dir: PathBuf,
    pub state_path: PathBuf,
    // dropped with the harness, removing the volume
    _tempdir: TempDir,
}

impl TestHarness {
    pub fn new() -> Self {
        let tempdir = tempfile::tempdir().unwrap();
        let snapshot_dir = tempdir.path().join("snapshots");
        std::fs::create_dir_all(&snapshot_dir).unwrap();
        Self {
            queue: RecordingQueue::default(),
            storage: MemoryStorage::default(),
            clock: TestClock::at_epoch_start(),
            state_path: tempdir.path().join("scheduler-state.json"),
            snapshot_dir,
            _tempdir: tempdir,
        }
    }

    /// Assembles a config around the harness doubles and the given node
    /// mock, with plenty of disk unless the test says otherwise.
    pub fn config_with(&self, node: MockArchiveNode, free_disk: u64) -> Arc<Config> {
        Arc::new(Config::new(
            Box::new(node),
            Box::new(StaticDiskGuard::new(free_disk)),
            Box::new(self.queue.clone()),
            Box::new(self.storage.clone()),
            Box::new(noop_alerts()),
            Box::new(JsonFileStore::new(self.state_path.clone())),
            Box::new(self.clock.clone()),
            test_params(&self.snapshot_dir),
        ))
    }

    pub async fn seed_state(&self, state: &crate::state_store::PersistedState) {
        use crate::state_store::StateStore;
        JsonFileStore::new(self.state_path.clone()).save(state).await.unwrap();
    }

    pub async fn persisted_state(&self) -> crate::state_store::PersistedState {
        use crate::state_store::StateStore;
        JsonFileStore::new(self.state_path.clone()).load().await.unwrap()
    }
}
