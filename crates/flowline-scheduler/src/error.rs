use thiserror::Error;

use crate::client::ExecutionError;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A cron expression could not be parsed.
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    /// A fixed-rate schedule uses a unit code the scheduler does not know.
    #[error("Unsupported fixed-rate unit: {0}")]
    UnsupportedUnit(i32),

    /// The schedule definition is otherwise unusable (no expression, zero rate, ...).
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// The snapshot envelope carries a version this build cannot read.
    #[error("Unknown snapshot version: {0}")]
    UnknownSnapshotVersion(u32),

    #[error("Corrupt snapshot: {0}")]
    CorruptSnapshot(String),

    /// The downstream execution API rejected the request after all retries.
    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    /// Firing a missed trigger failed; live scheduling must not start.
    #[error("Catch-up failed for schedule {schedule}: {source}")]
    CatchUp {
        schedule: String,
        #[source]
        source: Box<SchedulerError>,
    },

    /// The surrounding task was cancelled before the operation finished.
    #[error("Operation cancelled")]
    Cancelled,

    /// A lock guarding shared state was poisoned by a panicking holder.
    #[error("Store lock poisoned")]
    StorePoisoned,
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
