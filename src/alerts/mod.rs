use async_trait::async_trait;
use mockall::automock;

pub mod aws_sns;

/// Outbound notification channel. Best-effort by contract: callers log and
/// drop delivery failures, they never retry or fail a pipeline stage.
#[automock]
#[async_trait]
pub trait Alerts: Send + Sync {
    /// To send an alert message to the operator channel
    async fn send_alert_message(&self, message_body: String) -> color_eyre::Result<()>;
}
