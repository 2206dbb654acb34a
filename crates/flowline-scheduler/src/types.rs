use std::fmt;

use chrono::{DateTime, Duration, Utc};
use flowline_core::Identifier;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Result, SchedulerError};

/// Time unit of a fixed-rate schedule. Stored as an integer code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixedRateUnit {
    Minute,
    Hour,
    Day,
    /// A code written by a newer authoring API that this build does not understand.
    Unknown(i32),
}

impl FixedRateUnit {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => FixedRateUnit::Minute,
            1 => FixedRateUnit::Hour,
            2 => FixedRateUnit::Day,
            other => FixedRateUnit::Unknown(other),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            FixedRateUnit::Minute => 0,
            FixedRateUnit::Hour => 1,
            FixedRateUnit::Day => 2,
            FixedRateUnit::Unknown(code) => *code,
        }
    }

    /// Length of one unit.
    pub fn duration(&self) -> Result<Duration> {
        match self {
            FixedRateUnit::Minute => Ok(Duration::minutes(1)),
            FixedRateUnit::Hour => Ok(Duration::hours(1)),
            FixedRateUnit::Day => Ok(Duration::days(1)),
            FixedRateUnit::Unknown(code) => Err(SchedulerError::UnsupportedUnit(*code)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedRate {
    pub value: u32,
    pub unit: FixedRateUnit,
}

impl FixedRate {
    /// `value * unit`, rejecting zero-length rates that would never advance.
    pub fn interval(&self) -> Result<Duration> {
        if self.value == 0 {
            return Err(SchedulerError::InvalidSchedule(
                "fixed rate value must be greater than zero".to_string(),
            ));
        }
        let unit = self.unit.duration()?;
        i32::try_from(self.value)
            .ok()
            .and_then(|value| unit.checked_mul(value))
            .ok_or_else(|| {
                SchedulerError::InvalidSchedule(format!("fixed rate value {} too large", self.value))
            })
    }
}

/// When a schedule fires: either a cron expression or a fixed rate, never both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleExpression {
    Cron { expression: String },
    FixedRate(FixedRate),
}

impl fmt::Display for ScheduleExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleExpression::Cron { expression } => write!(f, "cron({expression})"),
            ScheduleExpression::FixedRate(rate) => {
                write!(f, "rate({} x {:?})", rate.value, rate.unit)
            }
        }
    }
}

/// A launch plan version that should be executed on a schedule.
///
/// Read-only from the scheduler's point of view; rows are written by the
/// schedule-authoring API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulableEntity {
    pub id: Identifier,
    pub expression: ScheduleExpression,
    /// Name of the workflow input that receives the trigger time. Empty means none.
    pub kickoff_time_input_arg: String,
    /// `None` and `Some(false)` both mean the schedule must not fire.
    pub active: Option<bool>,
    pub created_at: DateTime<Utc>,
    /// Changes only on an active/inactive transition; anchors catch-up.
    pub updated_at: DateTime<Utc>,
}

impl SchedulableEntity {
    pub fn is_active(&self) -> bool {
        self.active == Some(true)
    }

    pub fn key(&self) -> ScheduleKey {
        ScheduleKey::for_identifier(&self.id)
    }

    /// Digest of everything that shapes the timer. The active flag and
    /// timestamps are excluded so flipping them never reinstalls a timer.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.id.to_string().as_bytes());
        match &self.expression {
            ScheduleExpression::Cron { expression } => {
                hasher.update(b"cron:");
                hasher.update(expression.as_bytes());
            }
            ScheduleExpression::FixedRate(rate) => {
                hasher.update(b"rate:");
                hasher.update(rate.value.to_be_bytes());
                hasher.update(rate.unit.code().to_be_bytes());
            }
        }
        hasher.update(b"arg:");
        hasher.update(self.kickoff_time_input_arg.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Stable snapshot / timer key derived from a schedule's identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScheduleKey(pub String);

impl ScheduleKey {
    /// Hex of the first 16 bytes of SHA-256 over `project:domain:name:version`.
    pub fn for_identifier(id: &Identifier) -> Self {
        let digest = Sha256::digest(id.to_string().as_bytes());
        Self(hex::encode(&digest[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScheduleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ScheduleKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}
