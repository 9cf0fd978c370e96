use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;

use super::{StepContext, NOTIFY_COMPLETION_LOG, SEND_EMAIL};
use crate::errors::NotificationError;
use crate::services::{EmailMessage, Mailer};
use crate::training::Metrics;

/// How a notification step ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationOutcome {
    /// Step name.
    pub step: String,
    /// Error text when the step failed.
    pub error: Option<String>,
}

impl NotificationOutcome {
    /// Whether the step completed.
    #[must_use]
    pub const fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    fn from_result(step: &str, result: Result<(), NotificationError>) -> Self {
        Self {
            step: step.to_string(),
            error: result.err().map(|err| err.to_string()),
        }
    }
}

/// Writes the training metrics to the operational log.
pub async fn log_completion(ctx: &StepContext<'_>, metrics: &Metrics) -> NotificationOutcome {
    ctx.started(NOTIFY_COMPLETION_LOG).await;
    ctx.log(
        LogLevel::Info,
        "Model training complete!",
        json!({ "run_id": ctx.run_id, "metrics": metrics }),
    );
    ctx.succeeded(NOTIFY_COMPLETION_LOG, json!({ "metrics": metrics }))
        .await;
    NotificationOutcome::from_result(NOTIFY_COMPLETION_LOG, Ok(()))
}

/// Sends the fixed completion e-mail. Metric values are not included.
pub async fn send_email(ctx: &StepContext<'_>, mailer: &dyn Mailer) -> NotificationOutcome {
    ctx.started(SEND_EMAIL).await;
    let message = EmailMessage::completion(&ctx.config.notification);
    let result = mailer
        .send(&message)
        .await
        .map_err(|source| NotificationError {
            step: SEND_EMAIL,
            source,
        });
    match &result {
        Ok(()) => {
            ctx.succeeded(SEND_EMAIL, json!({ "to": message.to })).await;
        }
        Err(err) => ctx.failed(SEND_EMAIL, err).await,
    }
    NotificationOutcome::from_result(SEND_EMAIL, result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::services::MemoryMailer;
    use crate::telemetry::PipelineTelemetry;
    use tempfile::tempdir;
    use uuid::Uuid;

    #[tokio::test]
    async fn log_step_records_metrics() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pipeline.log");
        let telemetry = PipelineTelemetry::builder("duration-pipeline")
            .log_path(&path)
            .build()
            .unwrap();
        let config = PipelineConfig::default();
        let ctx = StepContext::new(Uuid::new_v4(), &config, Some(&telemetry));

        let outcome = log_completion(&ctx, &Metrics::in_sample(321.5)).await;
        assert!(outcome.succeeded());
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("Model training complete!"));
        assert!(content.contains("321.5"));
        assert!(content.contains("notify_completion_log.succeeded"));
    }

    #[tokio::test]
    async fn email_step_sends_fixed_message() {
        let config = PipelineConfig::default();
        let ctx = StepContext::new(Uuid::new_v4(), &config, None);
        let mailer = MemoryMailer::new();

        let outcome = send_email(&ctx, &mailer).await;
        assert!(outcome.succeeded());
        let sent = mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "London Bikes Model Training Complete");
        assert!(!sent[0].html_body.contains("mse"));
    }

    #[tokio::test]
    async fn email_failure_is_reported_not_raised() {
        let config = PipelineConfig::default();
        let ctx = StepContext::new(Uuid::new_v4(), &config, None);
        let outcome = send_email(&ctx, &MemoryMailer::failing("relay unavailable")).await;
        assert!(!outcome.succeeded());
        assert_eq!(outcome.step, "send_email");
        assert!(outcome.error.unwrap().contains("relay unavailable"));
    }
}
