use async_trait::async_trait;

use crate::error::Result;
use crate::types::SchedulableEntity;

/// Source of truth for schedule definitions.
#[async_trait]
pub trait ScheduleRepository: Send + Sync {
    /// Every schedule row, active or not.
    async fn list_all(&self) -> Result<Vec<SchedulableEntity>>;
}

/// Append-only store for serialized snapshots.
#[async_trait]
pub trait SnapshotRepository: Send + Sync {
    async fn write_latest(&self, snapshot: &[u8]) -> Result<()>;

    /// The most recently written snapshot, or `None` if nothing was ever written.
    async fn read_latest(&self) -> Result<Option<Vec<u8>>>;
}
