use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::{rngs::SmallRng, seq::SliceRandom, SeedableRng};
use serde_json::Value;
use thiserror::Error;

use crate::features::{check_feature, FeatureRow, RangeViolation, FEATURE_COLUMNS, TARGET_COLUMN};
use crate::services::TableData;

/// Reasons a feature table cannot be used for training.
#[derive(Debug, Error)]
pub enum DatasetError {
    /// The table has no rows.
    #[error("feature table is empty")]
    Empty,
    /// A required column is absent.
    #[error("feature table is missing column '{0}'")]
    MissingColumn(String),
    /// A cell is null or not a number.
    #[error("row {row}: column '{column}' is not numeric ({value})")]
    NotNumeric {
        /// Zero-based row index.
        row: usize,
        /// Column name.
        column: &'static str,
        /// Offending cell, JSON-encoded.
        value: String,
    },
    /// A feature lies outside its documented range.
    #[error("row {row}: {violation}")]
    OutOfRange {
        /// Zero-based row index.
        row: usize,
        /// Details.
        violation: RangeViolation,
    },
}

/// Design matrix and target vector, one row per trip.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSet {
    features: Array2<f64>,
    targets: Array1<f64>,
}

impl TrainingSet {
    /// Extracts the four features and the target from a warehouse table.
    ///
    /// Cells may be JSON numbers or numeric strings; the warehouse encodes
    /// integers and floats as strings.
    pub fn from_table(table: &TableData) -> Result<Self, DatasetError> {
        let target_idx = table
            .column_index(TARGET_COLUMN)
            .ok_or_else(|| DatasetError::MissingColumn(TARGET_COLUMN.into()))?;
        let mut feature_idx = [0usize; FEATURE_COLUMNS.len()];
        for (slot, column) in feature_idx.iter_mut().zip(FEATURE_COLUMNS) {
            *slot = table
                .column_index(column)
                .ok_or_else(|| DatasetError::MissingColumn(column.into()))?;
        }
        if table.is_empty() {
            return Err(DatasetError::Empty);
        }

        let mut features = Array2::<f64>::zeros((table.len(), FEATURE_COLUMNS.len()));
        let mut targets = Array1::<f64>::zeros(table.len());
        for (row_idx, row) in table.rows.iter().enumerate() {
            targets[row_idx] = numeric_cell(row, target_idx, row_idx, TARGET_COLUMN)?;
            for (col, (&idx, column)) in feature_idx.iter().zip(FEATURE_COLUMNS).enumerate() {
                let value = numeric_cell(row, idx, row_idx, column)?;
                check_feature(column, value).map_err(|violation| DatasetError::OutOfRange {
                    row: row_idx,
                    violation,
                })?;
                features[[row_idx, col]] = value;
            }
        }
        Ok(Self { features, targets })
    }

    /// Builds a set from already-derived rows.
    #[must_use]
    pub fn from_rows(rows: &[FeatureRow]) -> Self {
        let mut features = Array2::<f64>::zeros((rows.len(), FEATURE_COLUMNS.len()));
        let mut targets = Array1::<f64>::zeros(rows.len());
        for (idx, row) in rows.iter().enumerate() {
            features.row_mut(idx).assign(&ArrayView1::from(&row.features()[..]));
            targets[idx] = f64::from(row.duration_sec);
        }
        Self { features, targets }
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Whether there are no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Feature matrix, columns in `FEATURE_COLUMNS` order.
    #[must_use]
    pub fn features(&self) -> ArrayView2<'_, f64> {
        self.features.view()
    }

    /// Target vector.
    #[must_use]
    pub fn targets(&self) -> ArrayView1<'_, f64> {
        self.targets.view()
    }

    /// Shuffles rows with a seeded RNG and moves `fraction` of them into a
    /// holdout set. Returns `None` for the holdout when `fraction` is zero or
    /// the set is too small to spare a row.
    #[must_use]
    pub fn split_holdout(&self, fraction: f64, seed: u64) -> (Self, Option<Self>) {
        let total = self.len();
        if fraction <= 0.0 || total < 2 {
            return (self.clone(), None);
        }
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let holdout = ((total as f64) * fraction).round().clamp(1.0, (total - 1) as f64) as usize;
        let mut order: Vec<usize> = (0..total).collect();
        order.shuffle(&mut SmallRng::seed_from_u64(seed));
        let (test_idx, train_idx) = order.split_at(holdout);
        (self.select(train_idx), Some(self.select(test_idx)))
    }

    fn select(&self, indices: &[usize]) -> Self {
        Self {
            features: self.features.select(Axis(0), indices),
            targets: self.targets.select(Axis(0), indices),
        }
    }
}

fn numeric_cell(
    row: &[Value],
    idx: usize,
    row_idx: usize,
    column: &'static str,
) -> Result<f64, DatasetError> {
    let cell = row.get(idx).unwrap_or(&Value::Null);
    let parsed = match cell {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed
        .filter(|value| value.is_finite())
        .ok_or_else(|| DatasetError::NotNumeric {
            row: row_idx,
            column,
            value: cell.to_string(),
        })
}
