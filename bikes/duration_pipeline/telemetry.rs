use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use serde_json::Value;
use shared_event_bus::{EventPublisher, EventRecord, FileEventPublisher};
use shared_logging::{JsonLogger, LogLevel, LogRecord};
use uuid::Uuid;

use crate::config::TelemetrySettings;

/// Builder for pipeline telemetry sinks.
pub struct PipelineTelemetryBuilder {
    module: String,
    log_path: Option<PathBuf>,
    echo: bool,
    min_level: LogLevel,
    event_publisher: Option<Arc<dyn EventPublisher>>,
}

impl PipelineTelemetryBuilder {
    /// Creates the builder.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            log_path: None,
            echo: false,
            min_level: LogLevel::Debug,
            event_publisher: None,
        }
    }

    /// Sets the log path.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Mirrors log lines to stderr.
    #[must_use]
    pub const fn echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Lowest level written to the log.
    #[must_use]
    pub const fn min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Sets the event publisher.
    #[must_use]
    pub fn event_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.event_publisher = Some(publisher);
        self
    }

    /// Applies file-based settings; a configured event log becomes the publisher.
    pub fn settings(mut self, settings: &TelemetrySettings) -> Result<Self> {
        self.log_path = Some(settings.log_path.clone());
        self.echo = settings.echo;
        self.min_level = settings.min_level;
        if let Some(path) = &settings.event_log {
            self.event_publisher = Some(Arc::new(FileEventPublisher::new(path)?));
        }
        Ok(self)
    }

    /// Builds the telemetry handle.
    pub fn build(self) -> Result<PipelineTelemetry> {
        let logger = match self.log_path {
            Some(path) => Some(
                JsonLogger::new(path)?
                    .with_min_level(self.min_level)
                    .with_echo(self.echo),
            ),
            None => None,
        };
        Ok(PipelineTelemetry {
            inner: Arc::new(TelemetryInner {
                module: self.module,
                logger,
                publisher: self.event_publisher,
            }),
        })
    }
}

/// Telemetry handle shared by the orchestrator and its steps.
#[derive(Clone)]
pub struct PipelineTelemetry {
    inner: Arc<TelemetryInner>,
}

impl fmt::Debug for PipelineTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineTelemetry")
            .field("module", &self.inner.module)
            .finish_non_exhaustive()
    }
}

struct TelemetryInner {
    module: String,
    logger: Option<JsonLogger>,
    publisher: Option<Arc<dyn EventPublisher>>,
}

impl PipelineTelemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> PipelineTelemetryBuilder {
        PipelineTelemetryBuilder::new(module)
    }

    /// Logs structured metadata.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
        if let Some(logger) = &self.inner.logger {
            let record = LogRecord::new(&self.inner.module, level, message).with_metadata(&metadata);
            logger.log(&record)?;
        }
        Ok(())
    }

    /// Emits an event tied to a run.
    pub async fn event(&self, run_id: Uuid, event_type: &str, payload: Value) -> Result<()> {
        if let Some(publisher) = &self.inner.publisher {
            let record = EventRecord::new(&self.inner.module, event_type, payload).for_run(run_id);
            publisher.publish(record).await?;
        }
        Ok(())
    }
}

/// Best-effort logging for an optional handle; telemetry never fails a run.
pub(crate) fn log(
    telemetry: Option<&PipelineTelemetry>,
    level: LogLevel,
    message: &str,
    metadata: Value,
) {
    if let Some(tel) = telemetry {
        if let Err(err) = tel.log(level, message, metadata) {
            eprintln!("telemetry log failed: {err:?}");
        }
    }
}

/// Best-effort event emission for an optional handle.
pub(crate) async fn event(
    telemetry: Option<&PipelineTelemetry>,
    run_id: Uuid,
    event_type: &str,
    payload: Value,
) {
    if let Some(tel) = telemetry {
        if let Err(err) = tel.event(run_id, event_type, payload).await {
            eprintln!("telemetry event publish failed: {err:?}");
        }
    }
}
