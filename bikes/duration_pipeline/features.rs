//! Feature table definition and the SQL script that materializes it.
//!
//! The warehouse derives every feature; [`FeatureRow::derive`] repeats the
//! same derivation locally so the column contract can be checked without a
//! warehouse. `dow` follows the warehouse `DAYOFWEEK` convention: Sunday = 1
//! through Saturday = 7.

use std::ops::RangeInclusive;

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{PipelineConfig, SamplingSettings};
use crate::services::{QueryJob, TableRef};

/// Regression target.
pub const TARGET_COLUMN: &str = "duration_sec";

/// Model inputs, in coefficient order.
pub const FEATURE_COLUMNS: [&str; 4] = ["hour", "dow", "month", "is_weekend"];

/// Every column of the materialized table, in table order.
pub const FEATURE_TABLE_COLUMNS: [&str; 7] = [
    "duration_sec",
    "hour",
    "dow",
    "month",
    "is_weekend",
    "start_station_name",
    "end_station_name",
];

/// Valid values of a numeric feature column, or `None` for other columns.
#[must_use]
pub fn feature_range(column: &str) -> Option<RangeInclusive<f64>> {
    match column {
        "hour" => Some(0.0..=23.0),
        "dow" => Some(1.0..=7.0),
        "month" => Some(1.0..=12.0),
        "is_weekend" => Some(0.0..=1.0),
        _ => None,
    }
}

/// A value outside its column's documented range.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{column} = {value} is outside {min}..={max}")]
pub struct RangeViolation {
    /// Offending column.
    pub column: &'static str,
    /// Offending value.
    pub value: f64,
    /// Lowest valid value.
    pub min: f64,
    /// Highest valid value.
    pub max: f64,
}

/// Checks `value` against the range of feature `column`.
pub fn check_feature(column: &'static str, value: f64) -> Result<(), RangeViolation> {
    let Some(range) = feature_range(column) else {
        return Ok(());
    };
    if range.contains(&value) && value.fract().abs() <= f64::EPSILON {
        return Ok(());
    }
    Err(RangeViolation {
        column,
        value,
        min: *range.start(),
        max: *range.end(),
    })
}

/// One row of the sampled feature table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureRow {
    /// Trip duration in seconds.
    pub duration_sec: u32,
    /// Start hour, 0-23.
    pub hour: u32,
    /// Day of week, Sunday = 1 .. Saturday = 7.
    pub dow: u32,
    /// Month, 1-12.
    pub month: u32,
    /// 1 on Saturday or Sunday.
    pub is_weekend: u32,
    /// Start station.
    pub start_station_name: String,
    /// End station.
    pub end_station_name: String,
}

impl FeatureRow {
    /// Derives the feature columns from a trip's start instant.
    #[must_use]
    pub fn derive(
        start: DateTime<Utc>,
        duration_sec: u32,
        stations: (&str, &str),
    ) -> Self {
        let dow = start.weekday().number_from_sunday();
        Self {
            duration_sec,
            hour: start.hour(),
            dow,
            month: start.month(),
            is_weekend: u32::from(dow == 1 || dow == 7),
            start_station_name: stations.0.to_string(),
            end_station_name: stations.1.to_string(),
        }
    }

    /// Checks every feature against its documented range.
    pub fn validate(&self) -> Result<(), RangeViolation> {
        for (column, value) in FEATURE_COLUMNS.into_iter().zip(self.features()) {
            check_feature(column, value)?;
        }
        Ok(())
    }

    /// Inputs in [`FEATURE_COLUMNS`] order.
    #[must_use]
    pub fn features(&self) -> [f64; 4] {
        [
            f64::from(self.hour),
            f64::from(self.dow),
            f64::from(self.month),
            f64::from(self.is_weekend),
        ]
    }
}

/// A source trip before filtering.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceTrip {
    /// Trip start.
    pub start_date: Option<DateTime<Utc>>,
    /// Duration in seconds.
    pub duration: Option<i64>,
    /// Start station.
    pub start_station_name: Option<String>,
    /// End station.
    pub end_station_name: Option<String>,
}

impl SourceTrip {
    /// Applies the deterministic part of the feature filter (everything
    /// except sampling) and derives the row for trips that pass.
    #[must_use]
    pub fn feature_row(&self, sampling: &SamplingSettings) -> Option<FeatureRow> {
        let duration = self.duration?;
        let range = i64::from(sampling.min_duration_sec)..=i64::from(sampling.max_duration_sec);
        if !range.contains(&duration) {
            return None;
        }
        let start = self.start_date?;
        let from = self.start_station_name.as_deref()?;
        let to = self.end_station_name.as_deref()?;
        let duration = u32::try_from(duration).ok()?;
        Some(FeatureRow::derive(start, duration, (from, to)))
    }
}

/// Rejected feature-build parameters.
#[derive(Debug, Error)]
pub enum FeatureQueryError {
    /// Identifier would break out of its quoting.
    #[error("identifier {0:?} contains a backtick")]
    UnsafeIdentifier(String),
    /// Sampling fraction outside (0, 1].
    #[error("sampling fraction {0} must be in (0, 1]")]
    Fraction(f64),
}

/// The feature-build script and its parameters.
#[derive(Debug, Clone)]
pub struct FeatureQuery {
    source_table: String,
    target: TableRef,
    sampling: SamplingSettings,
}

impl FeatureQuery {
    /// Builds the query for `target`, sampling from `source_table`.
    pub fn new(
        source_table: impl Into<String>,
        target: TableRef,
        sampling: SamplingSettings,
    ) -> Result<Self, FeatureQueryError> {
        let source_table = source_table.into();
        for ident in [
            &source_table,
            &target.project,
            &target.dataset,
            &target.table,
        ] {
            if ident.contains('`') {
                return Err(FeatureQueryError::UnsafeIdentifier(ident.clone()));
            }
        }
        if !(sampling.fraction > 0.0 && sampling.fraction <= 1.0) {
            return Err(FeatureQueryError::Fraction(sampling.fraction));
        }
        Ok(Self {
            source_table,
            target,
            sampling,
        })
    }

    /// Query described by a pipeline configuration.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, FeatureQueryError> {
        Self::new(
            config.warehouse.source_table.clone(),
            target_table(config),
            config.sampling.clone(),
        )
    }

    /// Table the script replaces.
    #[must_use]
    pub const fn target(&self) -> &TableRef {
        &self.target
    }

    /// Renders the two-statement script.
    #[must_use]
    pub fn render(&self) -> String {
        format!(
            "CREATE SCHEMA IF NOT EXISTS {dataset};
CREATE OR REPLACE TABLE {target} AS
WITH base AS (
  SELECT
    duration AS duration_sec,
    start_date,
    start_station_name,
    end_station_name
  FROM `{source}`
  WHERE duration BETWEEN {min} AND {max}
    AND start_date IS NOT NULL
    AND start_station_name IS NOT NULL
    AND end_station_name IS NOT NULL
    AND RAND() < {fraction}
)
SELECT
  duration_sec,
  EXTRACT(HOUR FROM start_date) AS hour,
  EXTRACT(DAYOFWEEK FROM start_date) AS dow,
  EXTRACT(MONTH FROM start_date) AS month,
  CASE WHEN EXTRACT(DAYOFWEEK FROM start_date) IN (1,7) THEN 1 ELSE 0 END AS is_weekend,
  start_station_name,
  end_station_name
FROM base;
",
            dataset = self.target.quoted_dataset(),
            target = self.target,
            source = self.source_table,
            min = self.sampling.min_duration_sec,
            max = self.sampling.max_duration_sec,
            fraction = self.sampling.fraction,
        )
    }

    /// Standard-SQL job for the rendered script.
    #[must_use]
    pub fn job(&self, location: &str) -> QueryJob {
        QueryJob::standard(self.render(), location)
    }
}

/// The materialized feature table named by `config`.
#[must_use]
pub fn target_table(config: &PipelineConfig) -> TableRef {
    TableRef::new(
        &config.warehouse.project_id,
        &config.warehouse.dataset,
        &config.warehouse.table,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn trip(start: DateTime<Utc>, duration: i64) -> SourceTrip {
        SourceTrip {
            start_date: Some(start),
            duration: Some(duration),
            start_station_name: Some("Hyde Park Corner, Hyde Park".into()),
            end_station_name: Some("Waterloo Station 3, Waterloo".into()),
        }
    }

    #[test]
    fn renders_default_script() {
        let query = FeatureQuery::from_config(&PipelineConfig::default()).unwrap();
        let sql = query.render();
        assert!(sql.starts_with("CREATE SCHEMA IF NOT EXISTS `penguin-ml-api.ml_staging`;\n"));
        assert!(sql.contains(
            "CREATE OR REPLACE TABLE `penguin-ml-api.ml_staging.duration_feature_sampled` AS"
        ));
        assert!(sql.contains("FROM `bigquery-public-data.london_bicycles.cycle_hire`"));
        assert!(sql.contains("WHERE duration BETWEEN 60 AND 3600"));
        assert!(sql.contains("AND RAND() < 0.001\n"));
        assert!(sql.contains("IN (1,7) THEN 1 ELSE 0 END AS is_weekend"));
        assert!(!sql.contains("INSERT"));
    }

    #[test]
    fn script_selects_exactly_the_table_columns() {
        let sql = FeatureQuery::from_config(&PipelineConfig::default())
            .unwrap()
            .render();
        let select = sql.rsplit("SELECT\n").next().unwrap();
        let aliases: Vec<&str> = select
            .lines()
            .take_while(|line| !line.starts_with("FROM"))
            .map(|line| {
                let line = line.trim().trim_end_matches(',');
                line.rsplit(" AS ").next().unwrap_or(line)
            })
            .collect();
        assert_eq!(aliases, FEATURE_TABLE_COLUMNS);
    }

    #[test]
    fn rendering_is_stable_across_runs() {
        let config = PipelineConfig::default();
        let first = FeatureQuery::from_config(&config).unwrap().job("EU");
        let second = FeatureQuery::from_config(&config).unwrap().job("EU");
        assert_eq!(first, second);
        assert!(!first.use_legacy_sql);
    }

    #[test]
    fn rejects_backticks_and_bad_fraction() {
        let target = TableRef::new("p", "d", "t");
        assert!(matches!(
            FeatureQuery::new("evil`; DROP", target.clone(), SamplingSettings::default()),
            Err(FeatureQueryError::UnsafeIdentifier(_))
        ));
        let sampling = SamplingSettings {
            fraction: 1.5,
            ..SamplingSettings::default()
        };
        assert!(matches!(
            FeatureQuery::new("src", target, sampling),
            Err(FeatureQueryError::Fraction(_))
        ));
    }

    #[test]
    fn derives_weekday_and_weekend_rows() {
        // Saturday 2024-06-15 18:45 UTC
        let saturday = Utc.with_ymd_and_hms(2024, 6, 15, 18, 45, 0).unwrap();
        let row = FeatureRow::derive(saturday, 900, ("A", "B"));
        assert_eq!((row.hour, row.dow, row.month, row.is_weekend), (18, 7, 6, 1));
        row.validate().unwrap();

        // Sunday 2024-01-07 00:10 UTC
        let sunday = Utc.with_ymd_and_hms(2024, 1, 7, 0, 10, 0).unwrap();
        let row = FeatureRow::derive(sunday, 900, ("A", "B"));
        assert_eq!((row.dow, row.is_weekend), (1, 1));

        // Wednesday 2024-01-03 08:00 UTC
        let wednesday = Utc.with_ymd_and_hms(2024, 1, 3, 8, 0, 0).unwrap();
        let row = FeatureRow::derive(wednesday, 900, ("A", "B"));
        assert_eq!((row.dow, row.is_weekend), (4, 0));
    }

    #[test]
    fn every_day_of_a_week_stays_in_range() {
        let monday = Utc.with_ymd_and_hms(2024, 1, 1, 23, 59, 0).unwrap();
        for offset in 0..7 {
            let start = monday + chrono::Duration::days(offset);
            let row = FeatureRow::derive(start, 60, ("A", "B"));
            row.validate().unwrap();
            assert_eq!(row.is_weekend == 1, matches!(row.dow, 1 | 7));
        }
    }

    #[test]
    fn validate_rejects_out_of_range_values() {
        let start = Utc.with_ymd_and_hms(2024, 1, 3, 8, 0, 0).unwrap();
        let mut row = FeatureRow::derive(start, 900, ("A", "B"));
        row.dow = 0;
        let err = row.validate().unwrap_err();
        assert_eq!(err.column, "dow");
        assert!(check_feature("hour", 24.0).is_err());
        assert!(check_feature("month", 6.5).is_err());
        assert!(check_feature("duration_sec", 1e9).is_ok());
    }

    #[test]
    fn source_filter_matches_script_predicates() {
        let sampling = SamplingSettings::default();
        let start = Utc.with_ymd_and_hms(2024, 3, 12, 7, 30, 0).unwrap();
        assert!(trip(start, 60).feature_row(&sampling).is_some());
        assert!(trip(start, 3600).feature_row(&sampling).is_some());
        assert!(trip(start, 59).feature_row(&sampling).is_none());
        assert!(trip(start, 3601).feature_row(&sampling).is_none());

        let mut missing_station = trip(start, 600);
        missing_station.end_station_name = None;
        assert!(missing_station.feature_row(&sampling).is_none());

        let mut missing_start = trip(start, 600);
        missing_start.start_date = None;
        assert!(missing_start.feature_row(&sampling).is_none());
    }
}
