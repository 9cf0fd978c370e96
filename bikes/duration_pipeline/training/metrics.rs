use indexmap::IndexMap;
use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};

/// In-sample mean squared error.
pub const MSE_KEY: &str = "mse";
/// Mean squared error on the held-out rows, when a holdout is configured.
pub const HOLDOUT_MSE_KEY: &str = "holdout_mse";

/// Evaluation metrics, serialized as a flat JSON object in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metrics(IndexMap<String, f64>);

impl Metrics {
    /// Metrics holding only the in-sample `mse`.
    #[must_use]
    pub fn in_sample(mse: f64) -> Self {
        Self::default().with(MSE_KEY, mse)
    }

    /// Adds or replaces a metric.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: f64) -> Self {
        self.0.insert(key.into(), value);
        self
    }

    /// Value of `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<f64> {
        self.0.get(key).copied()
    }

    /// In-sample mean squared error.
    #[must_use]
    pub fn mse(&self) -> Option<f64> {
        self.get(MSE_KEY)
    }

    /// Metrics in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(key, value)| (key.as_str(), *value))
    }

    /// JSON text written to the metrics object.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Mean of squared residuals, or `None` when the inputs are empty or differ
/// in length.
#[must_use]
pub fn mean_squared_error(
    predictions: ArrayView1<'_, f64>,
    targets: ArrayView1<'_, f64>,
) -> Option<f64> {
    if predictions.len() != targets.len() {
        return None;
    }
    let residuals = &predictions - &targets;
    residuals.mapv(|r| r * r).mean()
}
