use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;

use super::{StepContext, TRAIN_MODEL};
use crate::errors::PipelineError;
use crate::services::{ObjectLocation, ObjectStore, TableRef, Warehouse};
use crate::training::{self, Metrics, TrainingSet};

const JSON_CONTENT_TYPE: &str = "application/json";

/// Result of the training step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainOutput {
    /// Metrics handed to the notification steps.
    pub metrics: Metrics,
    /// Rows the model was fitted on.
    pub rows: usize,
    /// Uploaded objects: model first, then metrics.
    pub artifacts: Vec<ObjectLocation>,
}

/// Reads the feature table, fits the model and uploads model and metrics.
pub async fn run(
    ctx: &StepContext<'_>,
    warehouse: &dyn Warehouse,
    store: &dyn ObjectStore,
    table: &TableRef,
) -> Result<TrainOutput, PipelineError> {
    ctx.started(TRAIN_MODEL).await;
    let result = execute(ctx, warehouse, store, table).await;
    match &result {
        Ok(output) => {
            ctx.succeeded(
                TRAIN_MODEL,
                json!({
                    "rows": output.rows,
                    "metrics": output.metrics,
                    "artifacts": output.artifacts.iter().map(ToString::to_string).collect::<Vec<_>>(),
                }),
            )
            .await;
        }
        Err(err) => ctx.failed(TRAIN_MODEL, err).await,
    }
    result
}

async fn execute(
    ctx: &StepContext<'_>,
    warehouse: &dyn Warehouse,
    store: &dyn ObjectStore,
    table: &TableRef,
) -> Result<TrainOutput, PipelineError> {
    let config = ctx.config;
    let data = warehouse
        .read_table(table, &config.warehouse.location)
        .await
        .map_err(PipelineError::Load)?;
    ctx.log(
        LogLevel::Info,
        "train_model.loaded",
        json!({ "table": table.qualified(), "rows": data.len() }),
    );

    let set = TrainingSet::from_table(&data)?;
    let outcome = training::train(&set, &config.evaluation)?;
    if outcome.holdout_rows > 0 {
        ctx.log(
            LogLevel::Warn,
            "train_model.holdout_enabled",
            json!({
                "holdout_rows": outcome.holdout_rows,
                "note": "mse is measured on the fitted rows only; holdout_mse is reported separately",
            }),
        );
    }
    ctx.log(LogLevel::Info, "train_model.fitted", json!({ "summary": outcome.summary() }));

    let model_json = outcome
        .model
        .to_json()
        .map_err(|source| PipelineError::Serialize { artifact: "model", source })?;
    let metrics_json = outcome
        .metrics
        .to_json()
        .map_err(|source| PipelineError::Serialize { artifact: "metrics", source })?;

    let storage = &config.storage;
    let model_location = ObjectLocation::new(&storage.bucket, &storage.model_object);
    let metrics_location = ObjectLocation::new(&storage.bucket, &storage.metrics_object);

    let scratch = tempfile::tempdir()?;
    let model_path = scratch.path().join("model.json");
    let metrics_path = scratch.path().join("metrics.json");
    tokio::fs::write(&model_path, model_json).await?;
    tokio::fs::write(&metrics_path, metrics_json).await?;

    upload(ctx, store, &model_location, &model_path).await?;
    upload(ctx, store, &metrics_location, &metrics_path).await?;

    Ok(TrainOutput {
        metrics: outcome.metrics,
        rows: outcome.model.rows,
        artifacts: vec![model_location, metrics_location],
    })
}

async fn upload(
    ctx: &StepContext<'_>,
    store: &dyn ObjectStore,
    location: &ObjectLocation,
    source: &Path,
) -> Result<(), PipelineError> {
    store.upload_file(location, source, JSON_CONTENT_TYPE).await?;
    ctx.log(
        LogLevel::Info,
        "train_model.uploaded",
        json!({ "object": location.to_string() }),
    );
    Ok(())
}
