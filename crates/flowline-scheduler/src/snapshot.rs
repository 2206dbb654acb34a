//! Last-fired bookkeeping shared by catch-up, live fires and checkpoints.
//!
//! Backed by a sharded `DashMap`: a per-key update only locks that key's
//! shard, and a checkpoint read walks shards one at a time, so neither side
//! ever waits on a map-wide lock.

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::types::ScheduleKey;

/// Map from schedule key to the last trigger time that was successfully fired.
#[derive(Debug, Default)]
pub struct Snapshot {
    entries: DashMap<ScheduleKey, DateTime<Utc>>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (ScheduleKey, DateTime<Utc>)>) -> Self {
        let snapshot = Self::new();
        for (key, time) in entries {
            snapshot.update_last_execution_time(&key, time);
        }
        snapshot
    }

    pub fn last_execution_time(&self, key: &ScheduleKey) -> Option<DateTime<Utc>> {
        self.entries.get(key).map(|t| *t)
    }

    /// Record `time` for `key` unless an equal or later time is already stored.
    ///
    /// Returns `true` when the stored value moved forward.
    pub fn update_last_execution_time(&self, key: &ScheduleKey, time: DateTime<Utc>) -> bool {
        let mut advanced = false;
        self.entries
            .entry(key.clone())
            .and_modify(|current| {
                if time > *current {
                    *current = time;
                    advanced = true;
                }
            })
            .or_insert_with(|| {
                advanced = true;
                time
            });
        advanced
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Point-in-time copy of all entries, sorted by key.
    pub fn entries(&self) -> Vec<(ScheduleKey, DateTime<Utc>)> {
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}
