use async_trait::async_trait;
use aws_sdk_sns::Client;

use crate::alerts::Alerts;
use crate::config::ProviderConfig;
use crate::utils::settings::Settings;

pub struct AWSSNS {
    client: Client,
    topic_arn: String,
}

impl AWSSNS {
    /// To create a new SNS client
    pub async fn new_with_settings(settings: &impl Settings, provider_config: std::sync::Arc<ProviderConfig>) -> Self {
        let config = provider_config.get_aws_client_or_panic();
        AWSSNS { client: Client::new(config), topic_arn: settings.get_settings_or_panic("AWS_SNS_ARN") }
    }
}

#[async_trait]
impl Alerts for AWSSNS {
    async fn send_alert_message(&self, message_body: String) -> color_eyre::Result<()> {
        self.client.publish().topic_arn(&self.topic_arn).message(message_body).send().await?;
        Ok(())
    }
}
