use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, ensure, Context, Result};
use serde::{Deserialize, Serialize};
use shared_logging::LogLevel;

use crate::schedule::WeeklySchedule;

/// Environment variables consulted by [`PipelineConfig::apply_overrides`].
pub mod env_keys {
    /// Warehouse project identifier.
    pub const PROJECT_ID: &str = "PROJECT_ID";
    /// Warehouse dataset name.
    pub const BQ_DATASET: &str = "BQ_DATASET";
    /// Warehouse region / location hint.
    pub const BQ_LOCATION: &str = "BQ_LOCATION";
    /// Object-storage bucket.
    pub const GCS_BUCKET: &str = "GCS_BUCKET";
    /// Sampling fraction.
    pub const SAMPLE_FRAC: &str = "SAMPLE_FRAC";
    /// OAuth bearer token used for warehouse and storage calls.
    pub const GOOGLE_OAUTH_ACCESS_TOKEN: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";
    /// Bearer token for the mail relay.
    pub const MAIL_RELAY_TOKEN: &str = "MAIL_RELAY_TOKEN";
}

/// Complete pipeline configuration, built once at process start.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Warehouse location and table naming.
    #[serde(default)]
    pub warehouse: WarehouseSettings,
    /// Row sampling applied by the feature build.
    #[serde(default)]
    pub sampling: SamplingSettings,
    /// Artifact bucket and object keys.
    #[serde(default)]
    pub storage: StorageSettings,
    /// Completion e-mail.
    #[serde(default)]
    pub notification: NotificationSettings,
    /// Trigger schedule.
    #[serde(default)]
    pub schedule: ScheduleSettings,
    /// Model evaluation.
    #[serde(default)]
    pub evaluation: EvaluationSettings,
    /// Log and event sinks.
    #[serde(default)]
    pub telemetry: TelemetrySettings,
    /// Secrets; only ever read from the environment.
    #[serde(skip)]
    pub credentials: Credentials,
}

impl PipelineConfig {
    /// Loads configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading pipeline config {}", path.display()))?;
        let mut config =
            Self::from_toml_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        if let Some(dir) = path.parent() {
            config.telemetry.resolve_relative_to(dir);
        }
        Ok(config)
    }

    /// Parses configuration from TOML text.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Loads the optional file, applies process environment overrides and validates.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Applies key/value overrides; `lookup` returns `None` for unset keys.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        if let Some(value) = lookup(env_keys::PROJECT_ID) {
            self.warehouse.project_id = value;
        }
        if let Some(value) = lookup(env_keys::BQ_DATASET) {
            self.warehouse.dataset = value;
        }
        if let Some(value) = lookup(env_keys::BQ_LOCATION) {
            self.warehouse.location = value;
        }
        if let Some(value) = lookup(env_keys::GCS_BUCKET) {
            self.storage.bucket = value;
        }
        if let Some(value) = lookup(env_keys::SAMPLE_FRAC) {
            self.sampling.fraction = value
                .parse()
                .with_context(|| format!("{} must be a number, got '{value}'", env_keys::SAMPLE_FRAC))?;
        }
        if let Some(value) = lookup(env_keys::GOOGLE_OAUTH_ACCESS_TOKEN) {
            self.credentials.google_access_token = Some(value);
        }
        if let Some(value) = lookup(env_keys::MAIL_RELAY_TOKEN) {
            self.credentials.mail_relay_token = Some(value);
        }
        Ok(())
    }

    /// Rejects configurations that would produce a malformed query or run.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("warehouse.project_id", &self.warehouse.project_id),
            ("warehouse.dataset", &self.warehouse.dataset),
            ("warehouse.table", &self.warehouse.table),
            ("warehouse.source_table", &self.warehouse.source_table),
            ("warehouse.location", &self.warehouse.location),
        ] {
            ensure!(!value.trim().is_empty(), "{name} must not be empty");
            ensure!(!value.contains('`'), "{name} must not contain backticks");
        }
        for (name, value) in [
            ("storage.bucket", &self.storage.bucket),
            ("storage.model_object", &self.storage.model_object),
            ("storage.metrics_object", &self.storage.metrics_object),
            ("notification.recipient", &self.notification.recipient),
        ] {
            ensure!(!value.trim().is_empty(), "{name} must not be empty");
        }
        ensure!(
            self.storage.model_object != self.storage.metrics_object,
            "model and metrics objects must use different keys"
        );
        let fraction = self.sampling.fraction;
        if !(fraction > 0.0 && fraction <= 1.0) {
            bail!("sampling.fraction must be in (0, 1], got {fraction}");
        }
        ensure!(
            self.sampling.min_duration_sec < self.sampling.max_duration_sec,
            "sampling.min_duration_sec must be below sampling.max_duration_sec"
        );
        ensure!(
            (0.0..=0.5).contains(&self.evaluation.holdout_fraction),
            "evaluation.holdout_fraction must be in [0, 0.5]"
        );
        WeeklySchedule::parse(&self.schedule.cron).context("invalid schedule.cron")?;
        Ok(())
    }
}

/// Warehouse project, dataset and tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarehouseSettings {
    /// Project that owns the dataset and runs the jobs.
    #[serde(default = "default_project_id")]
    pub project_id: String,
    /// Dataset the feature table lives in.
    #[serde(default = "default_dataset")]
    pub dataset: String,
    /// Region hint passed with every job.
    #[serde(default = "default_location")]
    pub location: String,
    /// Materialized feature table.
    #[serde(default = "default_table")]
    pub table: String,
    /// Fully qualified public source table.
    #[serde(default = "default_source_table")]
    pub source_table: String,
    /// REST endpoint root.
    #[serde(default = "default_bigquery_endpoint")]
    pub endpoint: String,
    /// Per-request HTTP timeout in milliseconds.
    #[serde(default = "default_http_timeout_ms")]
    pub timeout_ms: u64,
    /// Server-side wait per `jobs.query` / `getQueryResults` call.
    #[serde(default = "default_query_wait_ms")]
    pub query_wait_ms: u64,
    /// Upper bound on completion polls before the job is reported as failed.
    #[serde(default = "default_max_polls")]
    pub max_polls: u32,
}

impl Default for WarehouseSettings {
    fn default() -> Self {
        Self {
            project_id: default_project_id(),
            dataset: default_dataset(),
            location: default_location(),
            table: default_table(),
            source_table: default_source_table(),
            endpoint: default_bigquery_endpoint(),
            timeout_ms: default_http_timeout_ms(),
            query_wait_ms: default_query_wait_ms(),
            max_polls: default_max_polls(),
        }
    }
}

/// Source-row sampling and filtering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingSettings {
    /// Probability threshold for `RAND() < fraction`.
    #[serde(default = "default_sample_fraction")]
    pub fraction: f64,
    /// Shortest trip kept, inclusive.
    #[serde(default = "default_min_duration")]
    pub min_duration_sec: u32,
    /// Longest trip kept, inclusive.
    #[serde(default = "default_max_duration")]
    pub max_duration_sec: u32,
}

impl Default for SamplingSettings {
    fn default() -> Self {
        Self {
            fraction: default_sample_fraction(),
            min_duration_sec: default_min_duration(),
            max_duration_sec: default_max_duration(),
        }
    }
}

/// Artifact destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Bucket receiving both artifacts.
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// Object key of the serialized model.
    #[serde(default = "default_model_object")]
    pub model_object: String,
    /// Object key of the metrics record.
    #[serde(default = "default_metrics_object")]
    pub metrics_object: String,
    /// JSON API endpoint root.
    #[serde(default = "default_storage_endpoint")]
    pub endpoint: String,
    /// Per-request HTTP timeout in milliseconds.
    #[serde(default = "default_http_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            bucket: default_bucket(),
            model_object: default_model_object(),
            metrics_object: default_metrics_object(),
            endpoint: default_storage_endpoint(),
            timeout_ms: default_http_timeout_ms(),
        }
    }
}

/// Completion e-mail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationSettings {
    /// Fixed recipient.
    #[serde(default = "default_recipient")]
    pub recipient: String,
    /// Subject line.
    #[serde(default = "default_subject")]
    pub subject: String,
    /// HTML body.
    #[serde(default = "default_body")]
    pub body: String,
    /// Mail relay endpoint; without one the message is only logged.
    #[serde(default)]
    pub relay_endpoint: Option<String>,
    /// Per-request HTTP timeout in milliseconds.
    #[serde(default = "default_http_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            recipient: default_recipient(),
            subject: default_subject(),
            body: default_body(),
            relay_endpoint: None,
            timeout_ms: default_http_timeout_ms(),
        }
    }
}

/// Trigger schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleSettings {
    /// Cron expression, 5 or 6 fields, evaluated in UTC.
    #[serde(default = "default_cron")]
    pub cron: String,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            cron: default_cron(),
        }
    }
}

/// Evaluation options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationSettings {
    /// Share of rows held out for an extra `holdout_mse` metric; 0 keeps in-sample only.
    #[serde(default)]
    pub holdout_fraction: f64,
    /// Seed for the holdout shuffle.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for EvaluationSettings {
    fn default() -> Self {
        Self {
            holdout_fraction: 0.0,
            seed: default_seed(),
        }
    }
}

/// Log and event sinks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySettings {
    /// JSONL operational log.
    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,
    /// Optional JSONL event log.
    #[serde(default)]
    pub event_log: Option<PathBuf>,
    /// Mirror log lines to stderr.
    #[serde(default = "default_true")]
    pub echo: bool,
    /// Lowest level written.
    #[serde(default)]
    pub min_level: LogLevel,
}

impl TelemetrySettings {
    fn resolve_relative_to(&mut self, dir: &Path) {
        if self.log_path.is_relative() {
            self.log_path = dir.join(&self.log_path);
        }
        if let Some(path) = self.event_log.as_mut() {
            if path.is_relative() {
                *path = dir.join(&*path);
            }
        }
    }
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            log_path: default_log_path(),
            event_log: None,
            echo: true,
            min_level: LogLevel::Info,
        }
    }
}

/// Secrets sourced from the environment.
#[derive(Clone, Default)]
pub struct Credentials {
    /// OAuth access token for warehouse and storage.
    pub google_access_token: Option<String>,
    /// Bearer token for the mail relay.
    pub mail_relay_token: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |value: &Option<String>| value.as_ref().map(|_| "<redacted>");
        f.debug_struct("Credentials")
            .field("google_access_token", &redact(&self.google_access_token))
            .field("mail_relay_token", &redact(&self.mail_relay_token))
            .finish()
    }
}

fn default_project_id() -> String {
    "penguin-ml-api".into()
}

fn default_dataset() -> String {
    "ml_staging".into()
}

fn default_location() -> String {
    "EU".into()
}

fn default_table() -> String {
    "duration_feature_sampled".into()
}

fn default_source_table() -> String {
    "bigquery-public-data.london_bicycles.cycle_hire".into()
}

fn default_bigquery_endpoint() -> String {
    "https://bigquery.googleapis.com/bigquery/v2".into()
}

fn default_storage_endpoint() -> String {
    "https://storage.googleapis.com".into()
}

fn default_bucket() -> String {
    "europe-west2-ml-composer-en-a0e5b8cb-bucket".into()
}

fn default_model_object() -> String {
    "model.json".into()
}

fn default_metrics_object() -> String {
    "metrics.json".into()
}

fn default_recipient() -> String {
    "ml-alerts@example.com".into()
}

fn default_subject() -> String {
    "London Bikes Model Training Complete".into()
}

fn default_body() -> String {
    "Model training complete! Check GCS for model and metrics.".into()
}

fn default_cron() -> String {
    "0 0 * * SUN".into()
}

fn default_log_path() -> PathBuf {
    PathBuf::from("logs/pipeline.log.jsonl")
}

const fn default_sample_fraction() -> f64 {
    0.001
}

const fn default_min_duration() -> u32 {
    60
}

const fn default_max_duration() -> u32 {
    3600
}

const fn default_http_timeout_ms() -> u64 {
    60_000
}

const fn default_query_wait_ms() -> u64 {
    10_000
}

const fn default_max_polls() -> u32 {
    120
}

const fn default_seed() -> u64 {
    17
}

const fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn defaults_match_the_published_workflow() {
        let config = PipelineConfig::default();
        assert_eq!(config.warehouse.project_id, "penguin-ml-api");
        assert_eq!(config.warehouse.dataset, "ml_staging");
        assert_eq!(config.warehouse.location, "EU");
        assert!((config.sampling.fraction - 0.001).abs() < f64::EPSILON);
        assert_eq!(config.storage.model_object, "model.json");
        assert_eq!(config.storage.metrics_object, "metrics.json");
        config.validate().unwrap();
    }

    #[test]
    fn loads_partial_file_and_resolves_log_paths() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pipeline.toml");
        fs::write(
            &path,
            r#"
[warehouse]
dataset = "bikes_weekly"

[sampling]
fraction = 0.01

[telemetry]
log_path = "logs/run.jsonl"
event_log = "/var/log/bikes/events.jsonl"
min_level = "WARN"
"#,
        )
        .unwrap();
        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.warehouse.dataset, "bikes_weekly");
        assert_eq!(config.warehouse.project_id, "penguin-ml-api");
        assert!((config.sampling.fraction - 0.01).abs() < f64::EPSILON);
        assert_eq!(config.telemetry.log_path, dir.path().join("logs/run.jsonl"));
        assert_eq!(
            config.telemetry.event_log.as_deref(),
            Some(Path::new("/var/log/bikes/events.jsonl"))
        );
        assert_eq!(config.telemetry.min_level, LogLevel::Warn);
    }

    #[test]
    fn sample_config_is_valid() {
        let config =
            PipelineConfig::from_toml_str(include_str!("pipeline.example.toml")).unwrap();
        config.validate().unwrap();
        assert!(config.notification.relay_endpoint.is_none());
        assert_eq!(config.schedule.cron, "0 0 * * SUN");
    }

    #[test]
    fn environment_overrides_take_precedence() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("PROJECT_ID", "bikes-prod"),
            ("BQ_DATASET", "features"),
            ("BQ_LOCATION", "europe-west2"),
            ("GCS_BUCKET", "bikes-artifacts"),
            ("SAMPLE_FRAC", "0.05"),
            ("GOOGLE_OAUTH_ACCESS_TOKEN", "ya29.token"),
            ("MAIL_RELAY_TOKEN", "  "),
        ]);
        let mut config = PipelineConfig::default();
        config
            .apply_overrides(|key| vars.get(key).map(ToString::to_string))
            .unwrap();
        assert_eq!(config.warehouse.project_id, "bikes-prod");
        assert_eq!(config.warehouse.dataset, "features");
        assert_eq!(config.warehouse.location, "europe-west2");
        assert_eq!(config.storage.bucket, "bikes-artifacts");
        assert!((config.sampling.fraction - 0.05).abs() < f64::EPSILON);
        assert_eq!(config.credentials.google_access_token.as_deref(), Some("ya29.token"));
        assert!(config.credentials.mail_relay_token.is_none());
        assert!(!format!("{:?}", config.credentials).contains("ya29"));
    }

    #[test]
    fn rejects_unparsable_sample_fraction() {
        let mut config = PipelineConfig::default();
        let err = config
            .apply_overrides(|key| (key == "SAMPLE_FRAC").then(|| "ten percent".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("SAMPLE_FRAC"));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = PipelineConfig::default();
        config.sampling.fraction = 0.0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.sampling.min_duration_sec = 3600;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.warehouse.dataset = "ml`staging".into();
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.evaluation.holdout_fraction = 0.8;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.schedule.cron = "every sunday".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn accepts_unix_numeric_sunday() {
        let mut config = PipelineConfig::default();
        config.schedule.cron = "0 0 * * 0".into();
        config.validate().unwrap();
    }
}
