pub mod job_queue;
pub mod sqs;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use color_eyre::Result as EyreResult;
use mockall::automock;
use omniqueue::{Delivery, QueueError};
use strum_macros::Display;

use crate::jobs::JobError;
use crate::scheduler::Scheduler;

/// The durable topics the pipeline runs on. One processing queue per
/// node-driving kind, one queue each for the validation and upload
/// hand-offs, and one for lifecycle events.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueType {
    #[strum(serialize = "compute_state_processing")]
    ComputeStateProcessing,
    #[strum(serialize = "historic_build_processing")]
    HistoricBuildProcessing,
    #[strum(serialize = "latest_build_processing")]
    LatestBuildProcessing,
    #[strum(serialize = "snapshot_validation")]
    SnapshotValidation,
    #[strum(serialize = "snapshot_upload")]
    SnapshotUpload,
    #[strum(serialize = "pipeline_events")]
    PipelineEvents,
}

/// Dead-letter wiring for a pipeline queue: deliveries rejected more than
/// `max_receive_count` times land on `dlq_name` for operator inspection.
pub struct DlqConfig<'a> {
    pub dlq_name: &'a str,
    pub max_receive_count: u32,
}

/// Provisioning description for one pipeline queue.
pub struct QueueConfig<'a> {
    pub name: String,
    pub visibility_timeout: u32,
    pub dlq_config: Option<DlqConfig<'a>>,
}

/// The QueueProvider trait is used to define the methods that a queue
/// should implement to be used as the pipeline's broker. Delivery is
/// at-least-once; consumers ack only after their side effects are durable.
#[automock]
#[async_trait]
pub trait QueueProvider: Send + Sync {
    async fn send_message_to_queue(&self, queue: QueueType, payload: String, delay: Option<Duration>)
        -> EyreResult<()>;
    async fn consume_message_from_queue(&self, queue: QueueType) -> Result<Delivery, QueueError>;
}

pub async fn init_consumers(scheduler: Arc<Scheduler>) -> Result<(), JobError> {
    job_queue::init_consumers(scheduler).await
}
