//! Model training: table extraction, least-squares fit and evaluation.

/// Feature table to design matrix conversion.
pub mod dataset;
/// Metric record and error functions.
pub mod metrics;
/// Linear model and solver.
pub mod model;

use serde::{Deserialize, Serialize};

pub use dataset::{DatasetError, TrainingSet};
pub use metrics::{mean_squared_error, Metrics, HOLDOUT_MSE_KEY, MSE_KEY};
pub use model::{FitError, LinearModel};

use crate::config::EvaluationSettings;

/// A fitted model with its metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingOutcome {
    /// Fitted model.
    pub model: LinearModel,
    /// In-sample `mse`, plus `holdout_mse` when a holdout is configured.
    pub metrics: Metrics,
    /// Rows held out of the fit.
    pub holdout_rows: usize,
}

impl TrainingOutcome {
    /// Renders a concise summary string.
    #[must_use]
    pub fn summary(&self) -> String {
        let metrics = self
            .metrics
            .iter()
            .map(|(key, value)| format!("{key}={value:.4}"))
            .collect::<Vec<_>>()
            .join(" ");
        format!(
            "[duration] model=linear_regression rows={} {metrics}",
            self.model.rows
        )
    }
}

/// Fits the model and evaluates it.
///
/// Without a holdout the model sees every row and `mse` is in-sample. With
/// one, `mse` is measured on the rows the model was fitted on and
/// `holdout_mse` on the rest.
pub fn train(set: &TrainingSet, evaluation: &EvaluationSettings) -> Result<TrainingOutcome, FitError> {
    let (fit_set, holdout) = set.split_holdout(evaluation.holdout_fraction, evaluation.seed);
    let model = LinearModel::fit(&fit_set)?;
    let in_sample = mean_squared_error(model.predict(fit_set.features()).view(), fit_set.targets())
        .ok_or(FitError::Empty)?;
    let mut metrics = Metrics::in_sample(in_sample);
    let mut holdout_rows = 0;
    if let Some(holdout) = holdout {
        if let Some(mse) =
            mean_squared_error(model.predict(holdout.features()).view(), holdout.targets())
        {
            metrics = metrics.with(HOLDOUT_MSE_KEY, mse);
            holdout_rows = holdout.len();
        }
    }
    Ok(TrainingOutcome {
        model,
        metrics,
        holdout_rows,
    })
}
