use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::errors::PipelineError;
use crate::services::{
    BigQueryWarehouse, GcsObjectStore, HttpMailRelay, LogMailer, Mailer, ObjectLocation,
    ObjectStore, TableRef, Warehouse,
};
use crate::steps::{self, notify, NotificationOutcome, StepContext};
use crate::telemetry::{self, PipelineTelemetry};
use crate::training::Metrics;

/// Lifecycle state of a run, as recorded in run manifests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Started, not yet finished.
    Running,
    /// Every step completed.
    Succeeded,
    /// Artifacts were written but a notification step failed.
    NotificationsFailed,
    /// A fatal step failed.
    Failed,
}

impl RunStatus {
    /// Manifest label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::NotificationsFailed => "notifications_failed",
            Self::Failed => "failed",
        }
    }
}

/// Summary of a run that got past training.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// Run identifier.
    pub run_id: Uuid,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// Completion time.
    pub finished_at: DateTime<Utc>,
    /// Feature table the model was trained on.
    pub table: TableRef,
    /// Feature-build job id, when reported.
    pub job_id: Option<String>,
    /// Training rows.
    pub rows: usize,
    /// Metrics passed to the notification steps.
    pub metrics: Metrics,
    /// Uploaded artifacts.
    pub artifacts: Vec<ObjectLocation>,
    /// Outcome of each notification step.
    pub notifications: Vec<NotificationOutcome>,
}

impl RunReport {
    /// `Succeeded`, or `NotificationsFailed` when any notification failed.
    #[must_use]
    pub fn status(&self) -> RunStatus {
        if self.notifications.iter().all(NotificationOutcome::succeeded) {
            RunStatus::Succeeded
        } else {
            RunStatus::NotificationsFailed
        }
    }
}

/// Builder for [`DurationPipeline`].
pub struct DurationPipelineBuilder {
    config: PipelineConfig,
    warehouse: Option<Arc<dyn Warehouse>>,
    object_store: Option<Arc<dyn ObjectStore>>,
    mailer: Option<Arc<dyn Mailer>>,
    telemetry: Option<PipelineTelemetry>,
}

impl DurationPipelineBuilder {
    /// Starts from a validated configuration.
    #[must_use]
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            warehouse: None,
            object_store: None,
            mailer: None,
            telemetry: None,
        }
    }

    /// Warehouse used for the feature build and table read.
    #[must_use]
    pub fn warehouse(mut self, warehouse: Arc<dyn Warehouse>) -> Self {
        self.warehouse = Some(warehouse);
        self
    }

    /// Artifact destination.
    #[must_use]
    pub fn object_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.object_store = Some(store);
        self
    }

    /// Completion e-mail transport.
    #[must_use]
    pub fn mailer(mut self, mailer: Arc<dyn Mailer>) -> Self {
        self.mailer = Some(mailer);
        self
    }

    /// Telemetry sink.
    #[must_use]
    pub fn telemetry(mut self, telemetry: PipelineTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Fills unset services with the cloud clients described by the
    /// configuration. Without a relay endpoint the e-mail is only logged.
    pub fn cloud_defaults(mut self) -> Result<Self> {
        let token = self.config.credentials.google_access_token.clone();
        if self.warehouse.is_none() {
            let warehouse = BigQueryWarehouse::new(&self.config.warehouse, token.clone())
                .context("building warehouse client")?;
            self.warehouse = Some(Arc::new(warehouse));
        }
        if self.object_store.is_none() {
            let store = GcsObjectStore::new(&self.config.storage, token)
                .context("building storage client")?;
            self.object_store = Some(Arc::new(store));
        }
        if self.mailer.is_none() {
            let notification = &self.config.notification;
            let mailer: Arc<dyn Mailer> = match &notification.relay_endpoint {
                Some(endpoint) => Arc::new(
                    HttpMailRelay::new(
                        endpoint,
                        notification.timeout_ms,
                        self.config.credentials.mail_relay_token.clone(),
                    )
                    .context("building mail relay client")?,
                ),
                None => Arc::new(LogMailer::new(self.telemetry.clone())),
            };
            self.mailer = Some(mailer);
        }
        Ok(self)
    }

    /// Builds the pipeline; every service must be set.
    pub fn build(self) -> Result<DurationPipeline> {
        Ok(DurationPipeline {
            warehouse: self.warehouse.context("pipeline requires a warehouse")?,
            object_store: self
                .object_store
                .context("pipeline requires an object store")?,
            mailer: self.mailer.context("pipeline requires a mailer")?,
            config: self.config,
            telemetry: self.telemetry,
        })
    }
}

/// Feature build, training and notification fan-out, wired to its services.
pub struct DurationPipeline {
    config: PipelineConfig,
    warehouse: Arc<dyn Warehouse>,
    object_store: Arc<dyn ObjectStore>,
    mailer: Arc<dyn Mailer>,
    telemetry: Option<PipelineTelemetry>,
}

impl DurationPipeline {
    /// Returns a builder.
    #[must_use]
    pub fn builder(config: PipelineConfig) -> DurationPipelineBuilder {
        DurationPipelineBuilder::new(config)
    }

    /// Configuration the pipeline runs with.
    #[must_use]
    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Runs once under a fresh run id.
    pub async fn run(&self) -> Result<RunReport, PipelineError> {
        self.run_with_id(Uuid::new_v4()).await
    }

    /// Runs once under `run_id`.
    pub async fn run_with_id(&self, run_id: Uuid) -> Result<RunReport, PipelineError> {
        let started_at = Utc::now();
        let tel = self.telemetry.as_ref();
        telemetry::log(
            tel,
            LogLevel::Info,
            "pipeline.started",
            json!({ "run_id": run_id, "table": self.config.warehouse.table }),
        );
        telemetry::event(tel, run_id, "pipeline.run.started", json!({})).await;

        let result = self.execute(run_id, started_at).await;
        match &result {
            Ok(report) => {
                let status = report.status();
                let level = if status == RunStatus::Succeeded {
                    LogLevel::Info
                } else {
                    LogLevel::Warn
                };
                telemetry::log(
                    tel,
                    level,
                    "pipeline.finished",
                    json!({ "run_id": run_id, "status": status.as_str(), "metrics": report.metrics }),
                );
                telemetry::event(
                    tel,
                    run_id,
                    "pipeline.run.finished",
                    json!({ "status": status.as_str() }),
                )
                .await;
            }
            Err(err) => {
                telemetry::log(
                    tel,
                    LogLevel::Error,
                    "pipeline.failed",
                    json!({ "run_id": run_id, "step": err.step(), "error": err.to_string() }),
                );
                telemetry::event(
                    tel,
                    run_id,
                    "pipeline.run.failed",
                    json!({ "step": err.step(), "error": err.to_string() }),
                )
                .await;
            }
        }
        result
    }

    async fn execute(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<RunReport, PipelineError> {
        let ctx = StepContext::new(run_id, &self.config, self.telemetry.as_ref());

        let built = steps::build_features::run(&ctx, self.warehouse.as_ref()).await?;
        let trained = steps::train::run(
            &ctx,
            self.warehouse.as_ref(),
            self.object_store.as_ref(),
            &built.table,
        )
        .await?;

        let (logged, emailed) = tokio::join!(
            notify::log_completion(&ctx, &trained.metrics),
            notify::send_email(&ctx, self.mailer.as_ref()),
        );

        Ok(RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            table: built.table,
            job_id: built.job_id,
            rows: trained.rows,
            metrics: trained.metrics,
            artifacts: trained.artifacts,
            notifications: vec![logged, emailed],
        })
    }
}
