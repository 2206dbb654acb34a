//! `flowline-scheduler`: native workflow scheduler with SQLite persistence.
//!
//! # Overview
//!
//! Schedules live in the `schedulable_entities` table. On startup the
//! [`executor::ScheduledExecutor`] restores the last checkpointed
//! [`snapshot::Snapshot`], fires every trigger missed while the process was
//! down, then keeps live timers in sync with the table and persists the
//! snapshot on a fixed interval.
//!
//! # Schedule expressions
//!
//! | Form                  | Behaviour                                              |
//! |-----------------------|--------------------------------------------------------|
//! | 5-field cron          | Standard cron, seconds pinned to zero                  |
//! | 6/7-field cron        | Cron with seconds (and optional year)                  |
//! | `@daily`, `@hourly`.. | Descriptor shorthands                                  |
//! | `@every 90s`          | Constant delay, whole seconds                          |
//! | Fixed rate            | `value` minutes, hours or days, constant delay         |

pub mod catchup;
pub mod checkpointer;
pub mod client;
pub mod codec;
pub mod db;
pub mod error;
pub mod executor;
pub mod firer;
pub mod limiter;
pub mod metrics;
pub mod registerer;
pub mod repository;
pub mod schedule;
pub mod snapshot;
pub mod timer;
pub mod types;

pub use client::{ExecutionClient, ExecutionError, HttpExecutionClient};
pub use codec::{SnapshotCodec, VersionedSnapshot};
pub use db::SqliteScheduleStore;
pub use error::{Result, SchedulerError};
pub use executor::{ExecutorConfig, ScheduledExecutor};
pub use snapshot::Snapshot;
pub use timer::{TimerEngine, TokioTimerEngine};
pub use types::{FixedRate, FixedRateUnit, SchedulableEntity, ScheduleExpression, ScheduleKey};
