use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{StepContext, BUILD_FEATURES};
use crate::errors::PipelineError;
use crate::features::FeatureQuery;
use crate::services::{TableRef, Warehouse};

/// Result of the feature build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureBuildOutput {
    /// The replaced feature table.
    pub table: TableRef,
    /// Warehouse job id, when reported.
    pub job_id: Option<String>,
}

/// Replaces the sampled feature table with one warehouse script.
pub async fn run(
    ctx: &StepContext<'_>,
    warehouse: &dyn Warehouse,
) -> Result<FeatureBuildOutput, PipelineError> {
    ctx.started(BUILD_FEATURES).await;
    let result = execute(ctx, warehouse).await;
    match &result {
        Ok(output) => {
            ctx.succeeded(
                BUILD_FEATURES,
                json!({ "table": output.table.qualified(), "job_id": output.job_id }),
            )
            .await;
        }
        Err(err) => ctx.failed(BUILD_FEATURES, err).await,
    }
    result
}

async fn execute(
    ctx: &StepContext<'_>,
    warehouse: &dyn Warehouse,
) -> Result<FeatureBuildOutput, PipelineError> {
    let query = FeatureQuery::from_config(ctx.config)?;
    let job = query.job(&ctx.config.warehouse.location);
    let summary = warehouse
        .execute(&job)
        .await
        .map_err(PipelineError::FeatureBuild)?;
    Ok(FeatureBuildOutput {
        table: query.target().clone(),
        job_id: summary.job_id,
    })
}
