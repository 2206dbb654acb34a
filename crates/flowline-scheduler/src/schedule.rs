//! Trigger-time arithmetic for schedule expressions.
//!
//! Accepted cron forms:
//!
//! | Form                      | Example            | Notes                                   |
//! |---------------------------|--------------------|-----------------------------------------|
//! | 5-field standard cron     | `0 19 * * *`       | seconds default to 0, Sunday is 0 or 7  |
//! |                           | `0 0 1 * 1`        | day-of-month OR day-of-week when both set |
//! | 6/7-field cron            | `0 0 19 * * * *`   | seconds first, Sunday is 1              |
//! | descriptor                | `@daily`           | yearly, annually, monthly, weekly, daily, midnight, hourly |
//! | constant delay            | `@every 1h30m`     | Go-style duration, whole seconds, min 1s |
//!
//! Fixed-rate schedules behave like `@every` with `value * unit`.

use std::str::FromStr;

use chrono::{DateTime, Duration, SubsecRound, Utc};
use tracing::debug;

use crate::error::{Result, SchedulerError};
use crate::types::{SchedulableEntity, ScheduleExpression};

/// Parsed, ready-to-evaluate form of a [`ScheduleExpression`].
#[derive(Debug, Clone)]
pub enum Cadence {
    /// Fires at the earliest next time of any member schedule. A 5-field
    /// expression restricting both day fields becomes two members.
    Cron(Vec<cron::Schedule>),
    /// Fires every `delay` after the previous trigger, aligned to whole seconds.
    ConstantDelay(Duration),
}

impl Cadence {
    pub fn parse(expression: &ScheduleExpression) -> Result<Self> {
        match expression {
            ScheduleExpression::Cron { expression } => parse_cron(expression),
            ScheduleExpression::FixedRate(rate) => Ok(Cadence::ConstantDelay(rate.interval()?)),
        }
    }

    /// First trigger strictly after `from`, or `None` once the schedule is exhausted.
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Cadence::Cron(schedules) => schedules
                .iter()
                .filter_map(|schedule| schedule.after(&from).next())
                .min(),
            Cadence::ConstantDelay(delay) => from.trunc_subsecs(0).checked_add_signed(*delay),
        }
    }
}

/// Next trigger time strictly after `from`.
pub fn scheduled_time(schedule: &SchedulableEntity, from: DateTime<Utc>) -> Result<DateTime<Utc>> {
    Cadence::parse(&schedule.expression)?
        .next_after(from)
        .ok_or_else(|| {
            SchedulerError::InvalidSchedule(format!(
                "{} has no trigger after {}",
                schedule.expression, from
            ))
        })
}

/// Every trigger in `(from, to]`, oldest first.
///
/// Each step moves strictly forward, so the loop ends even for one-second
/// rates over a long outage.
pub fn catch_up_times(
    schedule: &SchedulableEntity,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<DateTime<Utc>>> {
    let cadence = Cadence::parse(&schedule.expression)?;
    let mut times = Vec::new();
    let mut cursor = from;

    while cursor < to {
        let Some(next) = cadence.next_after(cursor) else {
            break;
        };
        if next > to {
            break;
        }
        times.push(next);
        cursor = next;
    }

    debug!(
        schedule = %schedule.id,
        count = times.len(),
        %from,
        %to,
        "computed catch-up times"
    );
    Ok(times)
}

fn parse_cron(expression: &str) -> Result<Cadence> {
    let trimmed = expression.trim();
    let invalid = |reason: String| SchedulerError::InvalidCron {
        expression: expression.to_string(),
        reason,
    };

    if let Some(spec) = trimmed.strip_prefix("@every") {
        let delay = parse_go_duration(spec.trim()).map_err(invalid)?;
        return Ok(Cadence::ConstantDelay(delay));
    }

    let schedules = normalize(trimmed)
        .map_err(invalid)?
        .iter()
        .map(|normalized| cron::Schedule::from_str(normalized).map_err(|e| invalid(e.to_string())))
        .collect::<Result<Vec<_>>>()?;
    Ok(Cadence::Cron(schedules))
}

/// Rewrite descriptors and 5-field expressions into the seconds-first form.
///
/// Standard cron fires when *either* restricted day field matches, while the
/// seconds-first grammar requires both, so that case splits into one
/// expression per day field.
fn normalize(expression: &str) -> std::result::Result<Vec<String>, String> {
    if expression.starts_with('@') {
        let expanded = match expression {
            "@yearly" | "@annually" => "0 0 0 1 1 *",
            "@monthly" => "0 0 0 1 * *",
            "@weekly" => "0 0 0 * * 1",
            "@daily" | "@midnight" => "0 0 0 * * *",
            "@hourly" => "0 0 * * * *",
            other => return Err(format!("unknown descriptor {other}")),
        };
        return Ok(vec![expanded.to_string()]);
    }

    let fields: Vec<&str> = expression.split_whitespace().collect();
    match fields.len() {
        5 => {
            let (minute, hour, day_of_month, month) = (fields[0], fields[1], fields[2], fields[3]);
            let day_of_week = translate_day_of_week(fields[4]);
            let standard = |dom: &str, dow: &str| format!("0 {minute} {hour} {dom} {month} {dow}");
            if is_restricted(day_of_month) && is_restricted(fields[4]) {
                Ok(vec![standard(day_of_month, "*"), standard("*", &day_of_week)])
            } else {
                Ok(vec![standard(day_of_month, &day_of_week)])
            }
        }
        6 | 7 => Ok(vec![fields.join(" ")]),
        n => Err(format!("expected 5, 6 or 7 fields, found {n}")),
    }
}

/// A day field starting with `*` (or `?`) matches every day.
fn is_restricted(field: &str) -> bool {
    !(field.starts_with('*') || field.starts_with('?'))
}

/// Standard cron numbers weekdays 0-7 from Sunday; the seconds-first grammar
/// numbers them 1-7 from Sunday.
fn translate_day_of_week(field: &str) -> String {
    field
        .split(',')
        .map(|item| {
            let (range, step) = match item.split_once('/') {
                Some((range, step)) => (range, Some(step)),
                None => (item, None),
            };
            let range = match range.split_once('-') {
                // 5-7 wraps past Saturday into Sunday.
                Some((start, "7")) if step.is_none() => format!("{}-7,1", shift_day(start)),
                Some((start, end)) => format!("{}-{}", shift_day(start), shift_day(end)),
                None => shift_day(range),
            };
            match step {
                Some(step) => format!("{range}/{step}"),
                None => range,
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn shift_day(token: &str) -> String {
    match token.parse::<u8>() {
        Ok(day) => ((day % 7) + 1).to_string(),
        Err(_) => token.to_string(),
    }
}

/// Longest accepted `@every` delay: one hundred years.
const MAX_EVERY_SECONDS: i64 = 100 * 366 * 24 * 3600;

/// Parse durations like `90s`, `1h30m` or `1.5h`. The result is truncated to
/// whole seconds with a floor of one second.
fn parse_go_duration(spec: &str) -> std::result::Result<Duration, String> {
    if spec.is_empty() {
        return Err("missing duration after @every".to_string());
    }

    let mut total_nanos: f64 = 0.0;
    let mut rest = spec;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| format!("missing unit in duration {spec}"))?;
        if number_len == 0 {
            return Err(format!("expected a number in duration {spec}"));
        }
        let value: f64 = rest[..number_len]
            .parse()
            .map_err(|_| format!("bad number in duration {spec}"))?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60.0 * 1e9,
            "h" => 3600.0 * 1e9,
            other => return Err(format!("unknown unit '{other}' in duration {spec}")),
        };
        total_nanos += value * scale;
        rest = &rest[unit_len..];
    }

    let seconds = (total_nanos / 1e9).floor();
    if !seconds.is_finite() || seconds > MAX_EVERY_SECONDS as f64 {
        return Err(format!("duration {spec} is too long"));
    }
    Duration::try_seconds((seconds as i64).max(1))
        .ok_or_else(|| format!("duration {spec} is out of range"))
}
