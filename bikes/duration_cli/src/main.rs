use std::{
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use anyhow::{bail, Context, Result};
use bikes_duration_pipeline::{
    services::LocalObjectStore, DurationPipeline, FeatureQuery, Metrics, PipelineConfig,
    PipelineTelemetry, RunStatus, WeeklySchedule,
};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::runtime::Runtime;
use uuid::Uuid;

const DEFAULT_MANIFEST: &str = "runs/index.jsonl";

#[derive(Parser, Debug)]
#[command(name = "bikes-duration", version, about = "London bike-hire trip-duration pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Runs the pipeline once.
    Run(RunArgs),
    /// Runs the pipeline at every cron fire time; missed fire times are skipped.
    Schedule(RunArgs),
    /// Prints upcoming fire times.
    NextRuns {
        /// Number of fire times to print.
        #[arg(long, default_value_t = 5)]
        count: usize,
        /// TOML configuration; environment overrides apply on top.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Prints the rendered feature-build script.
    Sql {
        /// TOML configuration; environment overrides apply on top.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Lists recent runs.
    History {
        /// Number of entries to display.
        #[arg(long, default_value_t = 10)]
        limit: usize,
        /// Run manifest (JSON lines) to read.
        #[arg(long, default_value = DEFAULT_MANIFEST)]
        manifest: PathBuf,
    },
    /// Shows one run.
    Status {
        /// Run identifier, as printed by `run` and `history`.
        run_id: String,
        /// Run manifest (JSON lines) to read.
        #[arg(long, default_value = DEFAULT_MANIFEST)]
        manifest: PathBuf,
    },
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    /// TOML configuration; environment overrides apply on top.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Artifact store: `gcs` or `local:DIR`.
    #[arg(long, default_value = "gcs")]
    store: StoreChoice,
    /// Run manifest (JSON lines) each run is recorded in.
    #[arg(long, default_value = DEFAULT_MANIFEST)]
    manifest: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum StoreChoice {
    Gcs,
    Local(PathBuf),
}

impl FromStr for StoreChoice {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.split_once(':') {
            None if raw == "gcs" => Ok(Self::Gcs),
            Some(("local", dir)) if !dir.is_empty() => Ok(Self::Local(PathBuf::from(dir))),
            _ => Err(format!("expected `gcs` or `local:DIR`, got `{raw}`")),
        }
    }
}

impl StoreChoice {
    fn label(&self) -> String {
        match self {
            Self::Gcs => "gcs".into(),
            Self::Local(dir) => format!("local:{}", dir.display()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
struct RunManifestEntry {
    run_id: String,
    trigger: String,
    submitted_at: DateTime<Utc>,
    config: Option<PathBuf>,
    store: String,
    status: RunStatus,
    #[serde(default)]
    finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    metrics: Option<Metrics>,
    #[serde(default)]
    error: Option<String>,
}

impl RunManifestEntry {
    fn new(run_id: Uuid, trigger: &str, args: &RunArgs) -> Self {
        Self {
            run_id: run_id.to_string(),
            trigger: trigger.into(),
            submitted_at: Utc::now(),
            config: args.config.clone(),
            store: args.store.label(),
            status: RunStatus::Running,
            finished_at: None,
            metrics: None,
            error: None,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => handle_run(&args),
        Commands::Schedule(args) => handle_schedule(&args),
        Commands::NextRuns { count, config } => {
            let config = PipelineConfig::resolve(config.as_deref())?;
            let schedule = WeeklySchedule::parse(&config.schedule.cron)?;
            for fire in schedule.upcoming_after(Utc::now(), count) {
                println!("{}", fire.to_rfc3339());
            }
            Ok(())
        }
        Commands::Sql { config } => {
            let config = PipelineConfig::resolve(config.as_deref())?;
            let query = FeatureQuery::from_config(&config)?;
            print!("{}", query.render());
            Ok(())
        }
        Commands::History { limit, manifest } => {
            let entries = read_manifest(&manifest)?;
            for entry in entries.into_iter().rev().take(limit) {
                let mse = entry
                    .metrics
                    .as_ref()
                    .and_then(Metrics::mse)
                    .map_or_else(|| "-".to_string(), |mse| format!("{mse:.2}"));
                println!(
                    "{} | {} | {} | {} | mse={}",
                    entry.run_id,
                    entry.trigger,
                    entry.status.as_str(),
                    entry.submitted_at,
                    mse
                );
            }
            Ok(())
        }
        Commands::Status { run_id, manifest } => {
            let entries = read_manifest(&manifest)?;
            if let Some(entry) = entries.into_iter().find(|e| e.run_id == run_id) {
                println!("{}", serde_json::to_string_pretty(&entry)?);
            } else {
                println!("run {run_id} not found");
            }
            Ok(())
        }
    }
}

fn build_pipeline(config: PipelineConfig, store: &StoreChoice) -> Result<DurationPipeline> {
    let telemetry = PipelineTelemetry::builder("bikes-duration")
        .settings(&config.telemetry)?
        .build()?;
    let mut builder = DurationPipeline::builder(config).telemetry(telemetry);
    if let StoreChoice::Local(dir) = store {
        builder = builder.object_store(Arc::new(LocalObjectStore::new(dir)));
    }
    builder.cloud_defaults()?.build()
}

fn handle_run(args: &RunArgs) -> Result<()> {
    let config = PipelineConfig::resolve(args.config.as_deref())?;
    let pipeline = build_pipeline(config, &args.store)?;
    let runtime = Runtime::new()?;
    let status = runtime.block_on(run_once(&pipeline, args, "manual"))?;
    match status {
        RunStatus::Succeeded => Ok(()),
        other => bail!("run finished with status {}", other.as_str()),
    }
}

fn handle_schedule(args: &RunArgs) -> Result<()> {
    let config = PipelineConfig::resolve(args.config.as_deref())?;
    let schedule = WeeklySchedule::parse(&config.schedule.cron)?;
    let pipeline = build_pipeline(config, &args.store)?;
    let runtime = Runtime::new()?;
    runtime.block_on(async {
        loop {
            let (fire, wait) = next_fire(&schedule, Utc::now())?;
            println!("next run at {}", fire.to_rfc3339());
            tokio::select! {
                () = tokio::time::sleep(wait) => {}
                signal = tokio::signal::ctrl_c() => {
                    signal.context("listening for ctrl-c")?;
                    println!("scheduler stopped");
                    return Ok(());
                }
            }
            if let Err(err) = run_once(&pipeline, args, "schedule").await {
                eprintln!("scheduled run could not be recorded: {err:?}");
            }
        }
    })
}

/// Next fire time strictly after `now` and how long to wait for it. Fire
/// times that passed while a run was in progress are never returned.
fn next_fire(
    schedule: &WeeklySchedule,
    now: DateTime<Utc>,
) -> Result<(DateTime<Utc>, std::time::Duration)> {
    let fire = schedule.next_after(now)?;
    let wait = (fire - now).to_std().unwrap_or_default();
    Ok((fire, wait))
}

/// Runs the pipeline once, recording the run in the manifest.
async fn run_once(pipeline: &DurationPipeline, args: &RunArgs, trigger: &str) -> Result<RunStatus> {
    let run_id = Uuid::new_v4();
    let entry = RunManifestEntry::new(run_id, trigger, args);
    append_manifest(&args.manifest, &entry)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "event": "run_started",
            "run_id": entry.run_id,
            "trigger": entry.trigger,
            "store": entry.store,
        }))?
    );

    match pipeline.run_with_id(run_id).await {
        Ok(report) => {
            let status = report.status();
            update_entry(&args.manifest, &entry.run_id, |e| {
                e.status = status;
                e.finished_at = Some(report.finished_at);
                e.metrics = Some(report.metrics.clone());
                e.error = report
                    .notifications
                    .iter()
                    .find_map(|outcome| outcome.error.clone());
            })?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(status)
        }
        Err(err) => {
            update_entry(&args.manifest, &entry.run_id, |e| {
                e.status = RunStatus::Failed;
                e.finished_at = Some(Utc::now());
                e.error = Some(err.to_string());
            })?;
            eprintln!(
                "{}",
                json!({
                    "event": "run_failed",
                    "run_id": entry.run_id,
                    "step": err.step(),
                    "error": err.to_string(),
                })
            );
            Ok(RunStatus::Failed)
        }
    }
}

fn append_manifest(path: &Path, entry: &RunManifestEntry) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening manifest {}", path.display()))?;
    serde_json::to_writer(&mut file, entry)?;
    file.write_all(b"\n")?;
    Ok(())
}

fn read_manifest(path: &Path) -> Result<Vec<RunManifestEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path).with_context(|| format!("opening manifest {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: RunManifestEntry = serde_json::from_str(&line)
            .with_context(|| format!("parsing manifest line in {}", path.display()))?;
        entries.push(entry);
    }
    Ok(entries)
}

fn update_entry<F>(path: &Path, run_id: &str, update: F) -> Result<()>
where
    F: Fn(&mut RunManifestEntry),
{
    let mut entries = read_manifest(path)?;
    let mut changed = false;
    for entry in &mut entries {
        if entry.run_id == run_id {
            update(entry);
            changed = true;
        }
    }
    if !changed {
        return Ok(());
    }
    let mut file = File::create(path)?;
    for entry in entries {
        serde_json::to_writer(&mut file, &entry)?;
        file.write_all(b"\n")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bikes_duration_pipeline::features::{target_table, FEATURE_TABLE_COLUMNS};
    use bikes_duration_pipeline::services::{MemoryMailer, MemoryWarehouse, TableData};
    use chrono::TimeZone;
    use serde_json::Value;
    use tempfile::tempdir;

    fn args(manifest: PathBuf, store: StoreChoice) -> RunArgs {
        RunArgs {
            config: None,
            store,
            manifest,
        }
    }

    fn feature_table() -> TableData {
        let rows = (0..30u32)
            .map(|i| {
                let hour = (i * 5) % 24;
                let dow = 1 + i % 7;
                let month = 1 + (i * 7) % 12;
                let weekend = u32::from(dow == 1 || dow == 7);
                let duration = 300 + 8 * hour + 20 * dow + 3 * month + 60 * weekend;
                [duration, hour, dow, month, weekend]
                    .iter()
                    .map(|v| Value::String(v.to_string()))
                    .chain([Value::String("A".into()), Value::String("B".into())])
                    .collect()
            })
            .collect();
        TableData::new(
            FEATURE_TABLE_COLUMNS.iter().map(ToString::to_string).collect(),
            rows,
        )
    }

    fn memory_pipeline(store_dir: &Path, mailer: MemoryMailer) -> DurationPipeline {
        let config = PipelineConfig::default();
        let warehouse = MemoryWarehouse::new().with_table(&target_table(&config), feature_table());
        DurationPipeline::builder(config)
            .warehouse(Arc::new(warehouse))
            .object_store(Arc::new(LocalObjectStore::new(store_dir)))
            .mailer(Arc::new(mailer))
            .build()
            .unwrap()
    }

    #[test]
    fn every_argument_has_help_text() {
        let command = <Cli as clap::CommandFactory>::command();
        for sub in command.get_subcommands() {
            for arg in sub.get_arguments() {
                assert!(
                    arg.get_help().is_some(),
                    "{} --{} has no help text",
                    sub.get_name(),
                    arg.get_id()
                );
            }
        }
    }

    #[test]
    fn parses_store_choices() {
        assert_eq!("gcs".parse::<StoreChoice>().unwrap(), StoreChoice::Gcs);
        assert_eq!(
            "local:/tmp/artifacts".parse::<StoreChoice>().unwrap(),
            StoreChoice::Local(PathBuf::from("/tmp/artifacts"))
        );
        assert!("local:".parse::<StoreChoice>().is_err());
        assert!("s3".parse::<StoreChoice>().is_err());
    }

    #[test]
    fn cli_accepts_documented_subcommands() {
        let cli = Cli::try_parse_from(["bikes-duration", "run", "--store", "local:out"]).unwrap();
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.store, StoreChoice::Local(PathBuf::from("out")));
                assert_eq!(args.manifest, PathBuf::from(DEFAULT_MANIFEST));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(Cli::try_parse_from(["bikes-duration", "next-runs", "--count", "3"]).is_ok());
        assert!(Cli::try_parse_from(["bikes-duration", "status", "abc"]).is_ok());
        assert!(Cli::try_parse_from(["bikes-duration", "run", "--store", "ftp"]).is_err());
    }

    #[test]
    fn next_fire_skips_missed_runs() {
        let schedule = WeeklySchedule::parse("0 0 * * SUN").unwrap();
        // A run that finished Monday 2024-01-08 03:00, after the Sunday fire time.
        let now = Utc.with_ymd_and_hms(2024, 1, 8, 3, 0, 0).unwrap();
        let (fire, wait) = next_fire(&schedule, now).unwrap();
        assert_eq!(fire, Utc.with_ymd_and_hms(2024, 1, 14, 0, 0, 0).unwrap());
        assert_eq!(wait, std::time::Duration::from_secs((5 * 24 + 21) * 3600));
    }

    #[test]
    fn manifest_updates_in_place() {
        let dir = tempdir().unwrap();
        let manifest = dir.path().join("runs/index.jsonl");
        let run_args = args(manifest.clone(), StoreChoice::Gcs);
        let first = RunManifestEntry::new(Uuid::new_v4(), "manual", &run_args);
        let second = RunManifestEntry::new(Uuid::new_v4(), "schedule", &run_args);
        append_manifest(&manifest, &first).unwrap();
        append_manifest(&manifest, &second).unwrap();

        update_entry(&manifest, &first.run_id, |e| e.status = RunStatus::Failed).unwrap();
        let entries = read_manifest(&manifest).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].status, RunStatus::Failed);
        assert_eq!(entries[1].status, RunStatus::Running);
        assert!(read_manifest(&dir.path().join("absent.jsonl")).unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_once_records_success() {
        let dir = tempdir().unwrap();
        let manifest = dir.path().join("index.jsonl");
        let store_dir = dir.path().join("objects");
        let run_args = args(manifest.clone(), StoreChoice::Local(store_dir.clone()));
        let pipeline = memory_pipeline(&store_dir, MemoryMailer::new());

        let status = run_once(&pipeline, &run_args, "manual").await.unwrap();
        assert_eq!(status, RunStatus::Succeeded);

        let entries = read_manifest(&manifest).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, RunStatus::Succeeded);
        assert!(entries[0].metrics.as_ref().and_then(Metrics::mse).is_some());

        let bucket = store_dir.join(&pipeline.config().storage.bucket);
        assert!(bucket.join("model.json").exists());
        let metrics: Value =
            serde_json::from_str(&fs::read_to_string(bucket.join("metrics.json")).unwrap()).unwrap();
        assert!(metrics["mse"].is_number());
    }

    #[tokio::test]
    async fn run_once_records_notification_failure() {
        let dir = tempdir().unwrap();
        let manifest = dir.path().join("index.jsonl");
        let store_dir = dir.path().join("objects");
        let run_args = args(manifest.clone(), StoreChoice::Local(store_dir.clone()));
        let pipeline = memory_pipeline(&store_dir, MemoryMailer::failing("550 mailbox unavailable"));

        let status = run_once(&pipeline, &run_args, "schedule").await.unwrap();
        assert_eq!(status, RunStatus::NotificationsFailed);
        let entry = read_manifest(&manifest).unwrap().remove(0);
        assert_eq!(entry.status, RunStatus::NotificationsFailed);
        assert!(entry.error.unwrap().contains("550"));
        assert_eq!(entry.trigger, "schedule");
    }
}
