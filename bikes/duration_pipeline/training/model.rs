use chrono::{DateTime, Utc};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::dataset::TrainingSet;
use crate::features::FEATURE_COLUMNS;

/// Relative pivot size below which the normal equations are treated as singular.
const PIVOT_TOLERANCE: f64 = 1e-10;

/// Failures while fitting the regression.
#[derive(Debug, Error)]
pub enum FitError {
    /// No rows to fit.
    #[error("cannot fit a model on an empty training set")]
    Empty,
    /// Fewer rows than parameters, or linearly dependent / constant features.
    #[error("design matrix is singular ({rows} rows, {parameters} parameters)")]
    Degenerate {
        /// Rows in the training set.
        rows: usize,
        /// Coefficients plus intercept.
        parameters: usize,
    },
    /// The solution contains NaN or infinity.
    #[error("fitted coefficients are not finite")]
    NonFinite,
}

/// Ordinary least squares model with an intercept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    /// Input names, aligned with `coefficients`.
    pub feature_names: Vec<String>,
    /// One weight per input.
    pub coefficients: Vec<f64>,
    /// Bias term.
    pub intercept: f64,
    /// Rows the model was fitted on.
    pub rows: usize,
    /// Fit time.
    pub trained_at: DateTime<Utc>,
}

impl LinearModel {
    /// Fits `duration_sec ~ hour + dow + month + is_weekend`.
    ///
    /// Features and target are centred first, so the intercept drops out of
    /// the normal equations and is recovered from the means.
    pub fn fit(set: &TrainingSet) -> Result<Self, FitError> {
        let x = set.features();
        let y = set.targets();
        let rows = x.nrows();
        let parameters = x.ncols() + 1;
        if rows == 0 {
            return Err(FitError::Empty);
        }
        if rows < parameters {
            return Err(FitError::Degenerate { rows, parameters });
        }
        let x_mean = x.mean_axis(Axis(0)).ok_or(FitError::Empty)?;
        let y_mean = y.mean().ok_or(FitError::Empty)?;
        let xc = &x - &x_mean;
        let yc = y.mapv(|v| v - y_mean);

        let gram = xc.t().dot(&xc);
        let moment = xc.t().dot(&yc);
        let coefficients =
            solve(gram, moment).ok_or(FitError::Degenerate { rows, parameters })?;
        let intercept = y_mean - x_mean.dot(&coefficients);
        if !intercept.is_finite() || coefficients.iter().any(|c| !c.is_finite()) {
            return Err(FitError::NonFinite);
        }
        Ok(Self {
            feature_names: FEATURE_COLUMNS.iter().map(ToString::to_string).collect(),
            coefficients: coefficients.to_vec(),
            intercept,
            rows,
            trained_at: Utc::now(),
        })
    }

    /// Predicts one duration per feature row.
    #[must_use]
    pub fn predict(&self, features: ArrayView2<'_, f64>) -> Array1<f64> {
        let weights = ArrayView1::from(&self.coefficients[..]);
        features.dot(&weights) + self.intercept
    }

    /// Predicts a single trip.
    #[must_use]
    pub fn predict_one(&self, features: &[f64]) -> f64 {
        features
            .iter()
            .zip(&self.coefficients)
            .map(|(feature, weight)| feature * weight)
            .sum::<f64>()
            + self.intercept
    }

    /// Pretty JSON artifact.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Solves `a * x = b` by Gaussian elimination with partial pivoting.
/// Returns `None` when a pivot is negligible relative to the matrix scale.
fn solve(mut a: Array2<f64>, mut b: Array1<f64>) -> Option<Array1<f64>> {
    let n = b.len();
    let scale = a.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
    if scale <= 0.0 {
        return None;
    }
    let tolerance = scale * PIVOT_TOLERANCE;

    for col in 0..n {
        let pivot_row = (col..n).max_by(|&i, &j| a[[i, col]].abs().total_cmp(&a[[j, col]].abs()))?;
        if a[[pivot_row, col]].abs() <= tolerance {
            return None;
        }
        if pivot_row != col {
            for k in 0..n {
                a.swap([col, k], [pivot_row, k]);
            }
            b.swap(col, pivot_row);
        }
        for row in col + 1..n {
            let factor = a[[row, col]] / a[[col, col]];
            for k in col..n {
                a[[row, k]] -= factor * a[[col, k]];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = Array1::<f64>::zeros(n);
    for row in (0..n).rev() {
        let tail: f64 = (row + 1..n).map(|k| a[[row, k]] * x[k]).sum();
        x[row] = (b[row] - tail) / a[[row, row]];
    }
    Some(x)
}
