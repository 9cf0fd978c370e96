#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Weekly London bike-hire duration pipeline: warehouse feature build, least-squares
//! training, artifact upload and completion notifications.

/// Pipeline configuration (TOML file plus environment overrides).
#[path = "../config.rs"]
pub mod config;

/// Weekly cron trigger.
#[path = "../schedule.rs"]
pub mod schedule;

/// Telemetry helpers for logging/event emission.
#[path = "../telemetry.rs"]
pub mod telemetry;

/// Warehouse, object storage and mail clients.
#[path = "../services/main.rs"]
pub mod services;

/// Feature table contract and the feature-build script.
#[path = "../features.rs"]
pub mod features;

/// Dataset extraction, model fit and metrics.
#[path = "../training/main.rs"]
pub mod training;

/// Fatal run errors.
#[path = "../errors.rs"]
pub mod errors;

/// Individual pipeline steps.
#[path = "../steps/main.rs"]
pub mod steps;

/// Run orchestration.
#[path = "../orchestrator.rs"]
pub mod orchestrator;

pub use config::PipelineConfig;
pub use errors::{NotificationError, PipelineError};
pub use features::{FeatureQuery, FeatureRow};
pub use orchestrator::{DurationPipeline, DurationPipelineBuilder, RunReport, RunStatus};
pub use schedule::WeeklySchedule;
pub use telemetry::{PipelineTelemetry, PipelineTelemetryBuilder};
pub use training::{LinearModel, Metrics, TrainingSet};
