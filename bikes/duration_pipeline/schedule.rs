//! Cron trigger for the weekly run.
//!
//! Accepts standard 5-field Unix expressions (minute, hour, day-of-month,
//! month, day-of-week) and converts them to the 6-field form (with seconds)
//! the `cron` crate expects. Numeric weekdays in a 5-field expression use the
//! Unix numbering (0 or 7 = Sunday, 1 = Monday) and are renumbered to the
//! crate's 1 = Sunday scale; 6-field expressions are passed through as-is.
//! Fire times are evaluated in UTC. Missed fire times are never replayed:
//! the next run is always the first fire time strictly after "now".

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use thiserror::Error;

/// Errors raised while parsing or evaluating a schedule.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// Expression rejected by the cron parser.
    #[error("invalid cron expression '{expr}': {reason}")]
    Invalid {
        /// Expression as configured.
        expr: String,
        /// Parser message.
        reason: String,
    },
    /// Expression parses but never fires.
    #[error("cron expression '{0}' has no upcoming fire time")]
    Exhausted(String),
}

fn normalize_cron_expr(cron_expr: &str) -> String {
    let mut fields: Vec<String> = cron_expr.split_whitespace().map(str::to_string).collect();
    if fields.len() == 5 {
        fields[4] = unix_day_of_week(&fields[4]);
        format!("0 {}", fields.join(" "))
    } else {
        fields.join(" ")
    }
}

/// Renumbers a Unix day-of-week field (0-7, Sunday = 0 or 7) to the
/// `cron` crate's 1-7 scale (Sunday = 1). Names, `*` and steps are kept.
fn unix_day_of_week(field: &str) -> String {
    field
        .split(',')
        .map(|item| {
            let (range, step) = match item.split_once('/') {
                Some((range, step)) => (range, Some(step)),
                None => (item, None),
            };
            let mut renumbered = match range.split_once('-') {
                Some((start, end)) => match (start.parse::<u8>(), end.parse::<u8>()) {
                    (Ok(0), Ok(7)) => "1-7".to_string(),
                    // A range ending on the second Sunday wraps past Saturday.
                    (Ok(start), Ok(7)) if (1..7).contains(&start) && step.is_none() => {
                        format!("{}-7,1", start + 1)
                    }
                    _ => format!("{}-{}", unix_day(start), unix_day(end)),
                },
                None => unix_day(range),
            };
            if let Some(step) = step {
                renumbered.push('/');
                renumbered.push_str(step);
            }
            renumbered
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn unix_day(token: &str) -> String {
    match token.parse::<u8>() {
        Ok(0 | 7) => "1".to_string(),
        Ok(day) if day < 7 => (day + 1).to_string(),
        _ => token.to_string(),
    }
}

/// Parsed trigger schedule.
#[derive(Debug, Clone)]
pub struct WeeklySchedule {
    expr: String,
    schedule: Schedule,
}

impl WeeklySchedule {
    /// Parses a 5- or 6-field cron expression.
    pub fn parse(cron_expr: &str) -> Result<Self, ScheduleError> {
        let normalized = normalize_cron_expr(cron_expr);
        let schedule = Schedule::from_str(&normalized).map_err(|err| ScheduleError::Invalid {
            expr: cron_expr.to_string(),
            reason: err.to_string(),
        })?;
        Ok(Self {
            expr: cron_expr.to_string(),
            schedule,
        })
    }

    /// Expression as configured.
    #[must_use]
    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// First fire time strictly after `instant`.
    pub fn next_after(&self, instant: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        self.schedule
            .after(&instant)
            .next()
            .ok_or_else(|| ScheduleError::Exhausted(self.expr.clone()))
    }

    /// The next `count` fire times after `instant`.
    #[must_use]
    pub fn upcoming_after(&self, instant: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        self.schedule.after(&instant).take(count).collect()
    }
}
