//! Pipeline steps. Each step logs `<step>.started`, then `<step>.succeeded`
//! or `<step>.failed`, and mirrors those as `pipeline.step.*` events.

/// Feature table materialization.
pub mod build_features;
/// Model fit and artifact upload.
pub mod train;
/// Completion log line and e-mail.
pub mod notify;

use std::fmt::Display;

use serde_json::{json, Value};
use shared_logging::LogLevel;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::telemetry::{self, PipelineTelemetry};

pub use build_features::FeatureBuildOutput;
pub use notify::NotificationOutcome;
pub use train::TrainOutput;

/// Step name of the feature build.
pub const BUILD_FEATURES: &str = "build_features";
/// Step name of the training step.
pub const TRAIN_MODEL: &str = "train_model";
/// Step name of the completion log step.
pub const NOTIFY_COMPLETION_LOG: &str = "notify_completion_log";
/// Step name of the e-mail step.
pub const SEND_EMAIL: &str = "send_email";

/// Inputs shared by every step of one run.
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    /// Run identifier stamped on every event.
    pub run_id: Uuid,
    /// Run configuration.
    pub config: &'a PipelineConfig,
    /// Optional telemetry sink.
    pub telemetry: Option<&'a PipelineTelemetry>,
}

impl<'a> StepContext<'a> {
    /// Creates a context.
    #[must_use]
    pub const fn new(
        run_id: Uuid,
        config: &'a PipelineConfig,
        telemetry: Option<&'a PipelineTelemetry>,
    ) -> Self {
        Self {
            run_id,
            config,
            telemetry,
        }
    }

    pub(crate) fn log(&self, level: LogLevel, message: &str, metadata: Value) {
        telemetry::log(self.telemetry, level, message, metadata);
    }

    pub(crate) async fn started(&self, step: &str) {
        self.log(
            LogLevel::Info,
            &format!("{step}.started"),
            json!({ "run_id": self.run_id }),
        );
        telemetry::event(
            self.telemetry,
            self.run_id,
            "pipeline.step.started",
            json!({ "step": step }),
        )
        .await;
    }

    pub(crate) async fn succeeded(&self, step: &str, detail: Value) {
        self.log(
            LogLevel::Info,
            &format!("{step}.succeeded"),
            json!({ "run_id": self.run_id, "detail": detail }),
        );
        telemetry::event(
            self.telemetry,
            self.run_id,
            "pipeline.step.succeeded",
            json!({ "step": step, "detail": detail }),
        )
        .await;
    }

    pub(crate) async fn failed(&self, step: &str, error: &(dyn Display + Sync)) {
        let error = error.to_string();
        self.log(
            LogLevel::Error,
            &format!("{step}.failed"),
            json!({ "run_id": self.run_id, "error": error }),
        );
        telemetry::event(
            self.telemetry,
            self.run_id,
            "pipeline.step.failed",
            json!({ "step": step, "error": error }),
        )
        .await;
    }
}
