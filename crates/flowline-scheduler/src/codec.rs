//! Versioned on-disk format for [`Snapshot`].
//!
//! Layout: a 4-byte big-endian version number followed by the payload.
//! Version 1 payload is a JSON array of `{key, last_execution_time}` objects.
//! Readers branch on the version and refuse anything they do not know.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};
use crate::snapshot::Snapshot;
use crate::types::ScheduleKey;

pub const SNAPSHOT_VERSION_V1: u32 = 1;

const VERSION_PREFIX_LEN: usize = 4;

/// Envelope around serialized snapshot bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedSnapshot {
    pub version: u32,
    pub payload: Vec<u8>,
}

impl VersionedSnapshot {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(VERSION_PREFIX_LEN + self.payload.len());
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < VERSION_PREFIX_LEN {
            return Err(SchedulerError::CorruptSnapshot(format!(
                "envelope is {} bytes, shorter than the version prefix",
                bytes.len()
            )));
        }
        let (prefix, payload) = bytes.split_at(VERSION_PREFIX_LEN);
        let mut version = [0u8; VERSION_PREFIX_LEN];
        version.copy_from_slice(prefix);
        Ok(Self {
            version: u32::from_be_bytes(version),
            payload: payload.to_vec(),
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotEntryV1 {
    key: String,
    last_execution_time: DateTime<Utc>,
}

/// Writes snapshots in one configured version; reads every known version.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotCodec {
    version: u32,
}

impl SnapshotCodec {
    pub fn new(version: u32) -> Result<Self> {
        match version {
            SNAPSHOT_VERSION_V1 => Ok(Self { version }),
            other => Err(SchedulerError::UnknownSnapshotVersion(other)),
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn serialize(&self, snapshot: &Snapshot) -> Result<Vec<u8>> {
        let payload = match self.version {
            SNAPSHOT_VERSION_V1 => write_v1(snapshot)?,
            other => return Err(SchedulerError::UnknownSnapshotVersion(other)),
        };
        Ok(VersionedSnapshot {
            version: self.version,
            payload,
        }
        .encode())
    }

    pub fn deserialize(&self, bytes: &[u8]) -> Result<Snapshot> {
        let envelope = VersionedSnapshot::decode(bytes)?;
        match envelope.version {
            SNAPSHOT_VERSION_V1 => read_v1(&envelope.payload),
            other => Err(SchedulerError::UnknownSnapshotVersion(other)),
        }
    }
}

impl Default for SnapshotCodec {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION_V1,
        }
    }
}

fn write_v1(snapshot: &Snapshot) -> Result<Vec<u8>> {
    let entries: Vec<SnapshotEntryV1> = snapshot
        .entries()
        .into_iter()
        .map(|(key, last_execution_time)| SnapshotEntryV1 {
            key: key.0,
            last_execution_time,
        })
        .collect();
    serde_json::to_vec(&entries).map_err(|e| SchedulerError::CorruptSnapshot(e.to_string()))
}

fn read_v1(payload: &[u8]) -> Result<Snapshot> {
    let entries: Vec<SnapshotEntryV1> = serde_json::from_slice(payload)
        .map_err(|e| SchedulerError::CorruptSnapshot(e.to_string()))?;
    Ok(Snapshot::from_entries(entries.into_iter().map(|e| {
        (ScheduleKey(e.key), e.last_execution_time)
    })))
}
