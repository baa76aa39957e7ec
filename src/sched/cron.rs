// src/sched/cron.rs

//! Next-run-time computation from cron expressions and one-shot delays.
//!
//! Tasks use the standard 5-field dialect (minute, hour, day-of-month,
//! month, day-of-week). The `cron` crate wants a 7-field expression, so a
//! seconds field of `0` and a year field of `*` are wrapped around the
//! user's five.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;

use crate::errors::{Result, TaskforgeError};

fn invalid(expression: &str, reason: impl Into<String>) -> TaskforgeError {
    TaskforgeError::InvalidCron {
        expression: expression.to_string(),
        reason: reason.into(),
    }
}

/// Parse a 5-field cron expression into a [`Schedule`].
pub fn parse_cron(expression: &str) -> Result<Schedule> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(invalid(
            expression,
            format!("expected 5 fields, got {}", fields.len()),
        ));
    }

    let normalized = format!("0 {} *", fields.join(" "));
    Schedule::from_str(&normalized).map_err(|err| invalid(expression, err.to_string()))
}

/// First firing of `expression` strictly after `after`.
pub fn next_cron_firing(expression: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let schedule = parse_cron(expression)?;
    schedule
        .after(&after)
        .next()
        .ok_or_else(|| invalid(expression, "no future firing"))
}

/// Compute the initial `next_run_time` for a new task.
///
/// - cron expression: next firing after `now`;
/// - `delay_seconds >= 0`: `now + delay`;
/// - neither: `now`, i.e. run on the next dispatch tick.
pub fn compute_next_run_time(
    cron_expression: Option<&str>,
    delay_seconds: Option<i64>,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    if let Some(expression) = cron_expression {
        return next_cron_firing(expression, now);
    }
    if let Some(delay) = delay_seconds {
        if delay < 0 {
            return Err(TaskforgeError::InvalidArgs(
                "delay_seconds must be non-negative".to_string(),
            ));
        }
        return Ok(now + Duration::seconds(delay));
    }
    Ok(now)
}
