use crate::config::Config;
use crate::jobs::types::{PipelineEvent, StageOutcome};
use crate::utils::secs_to_dhms;

/// Fire-and-forget sink for pipeline events: format, post, and on failure
/// log and drop. Nothing here may ever fail or retry a pipeline stage.
pub async fn handle_event(config: &Config, event: PipelineEvent) {
    let message = format_event(&config.params().chain, &event);
    if let Err(e) = config.alerts().send_alert_message(message).await {
        tracing::warn!(error = %e, "Failed to deliver notification, dropping");
    }
}

fn format_event(chain: &str, event: &PipelineEvent) -> String {
    match event {
        PipelineEvent::Stage(stage_event) => {
            let emoji = match stage_event.outcome {
                StageOutcome::Started => ":information_source:",
                StageOutcome::Retrying => ":warning:",
                StageOutcome::Failed => ":x:",
                StageOutcome::Succeeded => ":white_check_mark:",
            };
            let mut message = format!(
                "{} [{}] {} {} for job {} (attempt {})",
                emoji, chain, stage_event.stage, stage_event.outcome, stage_event.job_id, stage_event.attempt
            );
            if !stage_event.detail.is_empty() {
                message.push_str(&format!(": {}", stage_event.detail));
            }
            if stage_event.outcome == StageOutcome::Failed {
                message.push_str(" — operator action required");
            }
            message
        }
        PipelineEvent::Eta(eta) => {
            let estimate = match eta.eta_seconds {
                Some(secs) => secs_to_dhms(secs),
                None => "unknown".to_string(),
            };
            format!(
                ":information_source: [{}] height {}/{} — ETA to next window: {}",
                chain, eta.current_height, eta.target_height, estimate
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::jobs::types::{EtaUpdate, PipelineStage, StageEvent};

    #[test]
    fn failed_events_call_for_the_operator() {
        let event = PipelineEvent::Stage(StageEvent {
            job_id: Uuid::nil(),
            stage: PipelineStage::Upload,
            outcome: StageOutcome::Failed,
            attempt: 3,
            timestamp: Utc::now(),
            detail: "remote checksum mismatch".to_string(),
        });
        let message = format_event("calibnet", &event);
        assert!(message.starts_with(":x:"));
        assert!(message.contains("remote checksum mismatch"));
        assert!(message.contains("operator action required"));
    }

    #[test]
    fn eta_formats_unknown_and_known() {
        let mut eta = EtaUpdate { current_height: 10, target_height: 100, eta_seconds: None, timestamp: Utc::now() };
        assert!(format_event("calibnet", &PipelineEvent::Eta(eta.clone())).contains("unknown"));

        eta.eta_seconds = Some(3_661);
        assert!(format_event("calibnet", &PipelineEvent::Eta(eta)).contains("1h 1m 1s"));
    }
}
