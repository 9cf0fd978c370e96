use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;
use thiserror::Error;

use crate::config::NotificationSettings;
use crate::telemetry::PipelineTelemetry;

/// Errors raised while delivering mail.
#[derive(Debug, Error)]
pub enum MailError {
    /// Network or HTTP client failure.
    #[error("transport error: {0}")]
    Transport(String),
    /// The relay refused the message.
    #[error("mail relay rejected message: {0}")]
    Rejected(String),
}

/// A single outbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailMessage {
    /// Recipient address.
    pub to: String,
    /// Subject line.
    pub subject: String,
    /// HTML body.
    pub html_body: String,
}

impl EmailMessage {
    /// The completion message described by the notification settings.
    #[must_use]
    pub fn completion(settings: &NotificationSettings) -> Self {
        Self {
            to: settings.recipient.clone(),
            subject: settings.subject.clone(),
            html_body: settings.body.clone(),
        }
    }
}

/// Outbound mail transport.
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Delivers `message`.
    async fn send(&self, message: &EmailMessage) -> Result<(), MailError>;
}

#[derive(Serialize)]
struct RelayRequest<'a> {
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
}

/// JSON mail relay: `POST {endpoint}` with `{to, subject, html}`.
#[derive(Debug, Clone)]
pub struct HttpMailRelay {
    client: Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpMailRelay {
    /// Builds a relay client.
    pub fn new(
        endpoint: impl Into<String>,
        timeout_ms: u64,
        token: Option<String>,
    ) -> Result<Self, MailError> {
        let client = Client::builder()
            .user_agent("bikes-duration-pipeline/0.1")
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|err| MailError::Transport(err.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            token,
        })
    }
}

#[async_trait]
impl Mailer for HttpMailRelay {
    async fn send(&self, message: &EmailMessage) -> Result<(), MailError> {
        let payload = RelayRequest {
            to: [&message.to],
            subject: &message.subject,
            html: &message.html_body,
        };
        let mut req = self.client.post(&self.endpoint).json(&payload);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let response = req
            .send()
            .await
            .map_err(|err| MailError::Transport(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MailError::Rejected(format!(
                "{status}: {}",
                body.chars().take(512).collect::<String>()
            )));
        }
        Ok(())
    }
}

/// Writes the message to the operational log instead of sending it.
#[derive(Debug, Clone, Default)]
pub struct LogMailer {
    telemetry: Option<PipelineTelemetry>,
}

impl LogMailer {
    /// Logs through `telemetry`, or nowhere when `None`.
    #[must_use]
    pub const fn new(telemetry: Option<PipelineTelemetry>) -> Self {
        Self { telemetry }
    }
}

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, message: &EmailMessage) -> Result<(), MailError> {
        crate::telemetry::log(
            self.telemetry.as_ref(),
            LogLevel::Info,
            "mail.logged",
            json!({
                "to": message.to,
                "subject": message.subject,
                "html": message.html_body,
            }),
        );
        Ok(())
    }
}

/// Records messages in memory; optionally fails every send.
#[derive(Debug, Default)]
pub struct MemoryMailer {
    sent: Mutex<Vec<EmailMessage>>,
    failure: Option<String>,
}

impl MemoryMailer {
    /// Mailer that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mailer that rejects every message with `reason`.
    #[must_use]
    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            sent: Mutex::default(),
            failure: Some(reason.into()),
        }
    }

    /// Messages accepted so far.
    #[must_use]
    pub fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Mailer for MemoryMailer {
    async fn send(&self, message: &EmailMessage) -> Result<(), MailError> {
        if let Some(reason) = &self.failure {
            return Err(MailError::Rejected(reason.clone()));
        }
        self.sent.lock().push(message.clone());
        Ok(())
    }
}
