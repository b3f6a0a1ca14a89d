use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::eyre::Context;
use omniqueue::{Delivery, QueueError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::time::sleep;
use uuid::Uuid;

use crate::jobs::types::{JobKind, PipelineEvent, SnapshotArtifact};
use crate::jobs::{JobError, OtherError};
use crate::notifier;
use crate::queue::QueueType;
use crate::scheduler::Scheduler;

#[derive(Error, Debug)]
pub enum ConsumptionError {
    #[error("Failed to consume message from queue, error {error_msg:?}")]
    FailedToConsumeFromQueue { error_msg: String },

    #[error("Failed to handle job with id {job_id:?}. Error: {error_msg:?}")]
    FailedToHandleJob { job_id: Uuid, error_msg: String },

    #[error("Other error: {0}")]
    Other(#[from] OtherError),
}

/// Payload of the per-kind processing queues: the job id; the scheduler's
/// registry owns the job itself.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobQueueMessage {
    pub id: Uuid,
}

/// Payload of the validation and upload queues: the artifact by reference
/// (path + checksum) plus, after validation, the metadata sidecar.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ArtifactQueueMessage {
    pub artifact: SnapshotArtifact,
    pub metadata: Option<Value>,
}

pub fn processing_queue_for(kind: JobKind) -> QueueType {
    match kind {
        JobKind::ComputeState => QueueType::ComputeStateProcessing,
        JobKind::BuildHistoric => QueueType::HistoricBuildProcessing,
        JobKind::BuildLatest => QueueType::LatestBuildProcessing,
    }
}

#[derive(Debug)]
enum DeliveryReturnType {
    Message(Delivery),
    NoMessage,
}

/// To get the delivery from the message queue using the queue name
async fn get_delivery_from_queue(
    queue: QueueType,
    scheduler: &Scheduler,
) -> Result<DeliveryReturnType, ConsumptionError> {
    match scheduler.config().queue().consume_message_from_queue(queue).await {
        Ok(d) => Ok(DeliveryReturnType::Message(d)),
        Err(QueueError::NoData) => Ok(DeliveryReturnType::NoMessage),
        Err(e) => Err(ConsumptionError::FailedToConsumeFromQueue { error_msg: e.to_string() }),
    }
}

fn parse_message<T: for<'de> Deserialize<'de>>(message: &Delivery) -> Result<Option<T>, ConsumptionError> {
    message.payload_serde_json().wrap_err("Payload Serde Error").map_err(|e| ConsumptionError::Other(OtherError::from(e)))
}

pub async fn consume_job_from_queue<F, Fut>(
    queue: QueueType,
    handler: F,
    scheduler: Arc<Scheduler>,
) -> Result<(), ConsumptionError>
where
    F: FnOnce(Arc<Scheduler>, Uuid) -> Fut,
    F: Send + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send,
{
    tracing::trace!(queue = %queue, "Attempting to consume job from queue");

    let delivery = get_delivery_from_queue(queue, &scheduler).await?;
    let message = match delivery {
        DeliveryReturnType::Message(message) => message,
        DeliveryReturnType::NoMessage => return Ok(()),
    };

    let Some(job_message) = parse_message::<JobQueueMessage>(&message)? else {
        tracing::warn!(queue = %queue, "Received empty job message");
        return Ok(());
    };

    tracing::info!(queue = %queue, job_id = %job_message.id, "Processing job message");
    tokio::spawn(async move {
        if let Err(e) = handle_job_message(job_message, message, handler, scheduler).await {
            tracing::error!("Failed to handle job message. Error: {:?}", e);
        }
    });

    Ok(())
}

async fn handle_job_message<F, Fut>(
    job_message: JobQueueMessage,
    message: Delivery,
    handler: F,
    scheduler: Arc<Scheduler>,
) -> Result<(), ConsumptionError>
where
    F: FnOnce(Arc<Scheduler>, Uuid) -> Fut,
    Fut: Future<Output = Result<(), JobError>>,
{
    match handler(scheduler.clone(), job_message.id).await {
        Ok(()) => {
            ack(message).await?;
            Ok(())
        }
        Err(e) => {
            tracing::error!("Failed to handle job with id {:?}. Error: {:?}", job_message.id, e);
            if let Err(alert_err) = scheduler.config().alerts().send_alert_message(e.to_string()).await {
                tracing::warn!(error = %alert_err, "Failed to deliver failure alert, dropping");
            }
            // retries are driven by the scheduler's explicit re-queues, so
            // the delivery is acked rather than nacked into a redelivery loop
            ack(message).await?;
            Err(ConsumptionError::FailedToHandleJob { job_id: job_message.id, error_msg: e.to_string() })
        }
    }
}

pub async fn consume_artifact_from_queue<F, Fut>(
    queue: QueueType,
    handler: F,
    scheduler: Arc<Scheduler>,
) -> Result<(), ConsumptionError>
where
    F: FnOnce(Arc<Scheduler>, ArtifactQueueMessage) -> Fut,
    F: Send + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send,
{
    let delivery = get_delivery_from_queue(queue, &scheduler).await?;
    let message = match delivery {
        DeliveryReturnType::Message(message) => message,
        DeliveryReturnType::NoMessage => return Ok(()),
    };

    let Some(artifact_message) = parse_message::<ArtifactQueueMessage>(&message)? else {
        tracing::warn!(queue = %queue, "Received empty artifact message");
        return Ok(());
    };

    let job_id = artifact_message.artifact.job_id;
    tracing::info!(queue = %queue, %job_id, "Processing artifact message");
    tokio::spawn(async move {
        match handler(scheduler.clone(), artifact_message).await {
            Ok(()) => {
                if let Err(e) = ack(message).await {
                    tracing::error!(%job_id, "Failed to ack artifact message. Error: {:?}", e);
                }
            }
            Err(e) => {
                tracing::error!(%job_id, "Failed to handle artifact message. Error: {:?}", e);
                if let Err(alert_err) = scheduler.config().alerts().send_alert_message(e.to_string()).await {
                    tracing::warn!(error = %alert_err, "Failed to deliver failure alert, dropping");
                }
                if let Err(ack_err) = ack(message).await {
                    tracing::error!(%job_id, "Failed to ack artifact message. Error: {:?}", ack_err);
                }
            }
        }
    });

    Ok(())
}

/// Pipeline-event consumption feeds the notifier only; everything here is
/// best-effort by contract.
pub async fn consume_event_from_queue(queue: QueueType, scheduler: Arc<Scheduler>) -> Result<(), ConsumptionError> {
    let delivery = get_delivery_from_queue(queue, &scheduler).await?;
    let message = match delivery {
        DeliveryReturnType::Message(message) => message,
        DeliveryReturnType::NoMessage => return Ok(()),
    };

    let Some(event) = parse_message::<PipelineEvent>(&message)? else {
        return Ok(());
    };

    tokio::spawn(async move {
        notifier::handle_event(scheduler.config(), event).await;
        if let Err(e) = ack(message).await {
            tracing::warn!("Failed to ack pipeline event. Error: {:?}", e);
        }
    });

    Ok(())
}

async fn ack(message: Delivery) -> Result<(), ConsumptionError> {
    message
        .ack()
        .await
        .map_err(|(e, _)| e)
        .wrap_err("Queue Error")
        .map_err(|e| ConsumptionError::Other(OtherError::from(e)))
}

async fn handle_process_job(scheduler: Arc<Scheduler>, id: Uuid) -> Result<(), JobError> {
    scheduler.process_job(id).await
}

async fn handle_validation(scheduler: Arc<Scheduler>, message: ArtifactQueueMessage) -> Result<(), JobError> {
    scheduler.run_validation(message).await
}

async fn handle_upload(scheduler: Arc<Scheduler>, message: ArtifactQueueMessage) -> Result<(), JobError> {
    scheduler.run_upload(message).await
}

macro_rules! spawn_consumer {
    ($queue_type:expr, $handler:expr, $consume_function:expr, $scheduler:expr) => {
        let scheduler_clone = $scheduler.clone();
        tokio::spawn(async move {
            loop {
                match $consume_function($queue_type, $handler, scheduler_clone.clone()).await {
                    Ok(_) => {}
                    Err(e) => tracing::error!("Failed to consume from queue {:?}. Error: {:?}", $queue_type, e),
                }
                sleep(Duration::from_millis(500)).await;
            }
        });
    };
}

pub async fn init_consumers(scheduler: Arc<Scheduler>) -> Result<(), JobError> {
    spawn_consumer!(QueueType::ComputeStateProcessing, handle_process_job, consume_job_from_queue, scheduler);
    spawn_consumer!(QueueType::HistoricBuildProcessing, handle_process_job, consume_job_from_queue, scheduler);
    spawn_consumer!(QueueType::LatestBuildProcessing, handle_process_job, consume_job_from_queue, scheduler);

    spawn_consumer!(QueueType::SnapshotValidation, handle_validation, consume_artifact_from_queue, scheduler);
    spawn_consumer!(QueueType::SnapshotUpload, handle_upload, consume_artifact_from_queue, scheduler);

    let events_scheduler = scheduler.clone();
    tokio::spawn(async move {
        loop {
            if let Err(e) = consume_event_from_queue(QueueType::PipelineEvents, events_scheduler.clone()).await {
                tracing::error!("Failed to consume from queue PipelineEvents. Error: {:?}", e);
            }
            sleep(Duration::from_millis(500)).await;
        }
    });

    Ok(())
}
