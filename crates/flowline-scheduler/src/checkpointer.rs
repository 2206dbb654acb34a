//! Periodic persistence of the in-memory [`Snapshot`].

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::SnapshotCodec;
use crate::error::Result;
use crate::metrics::SchedulerMetrics;
use crate::repository::SnapshotRepository;
use crate::snapshot::Snapshot;

pub struct Checkpointer {
    store: Arc<dyn SnapshotRepository>,
    codec: SnapshotCodec,
    snapshot: Arc<Snapshot>,
    metrics: Arc<SchedulerMetrics>,
    interval: Duration,
}

impl Checkpointer {
    pub fn new(
        store: Arc<dyn SnapshotRepository>,
        codec: SnapshotCodec,
        snapshot: Arc<Snapshot>,
        metrics: Arc<SchedulerMetrics>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            codec,
            snapshot,
            metrics,
            interval,
        }
    }

    /// Load the latest checkpoint.
    ///
    /// Never fails: a missing, unreadable or undecodable checkpoint yields an
    /// empty snapshot, so catch-up falls back to each schedule's `updated_at`.
    pub async fn read_checkpoint(
        store: &dyn SnapshotRepository,
        codec: &SnapshotCodec,
        metrics: &SchedulerMetrics,
    ) -> Snapshot {
        let bytes = match store.read_latest().await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                info!("no checkpoint found, starting with an empty snapshot");
                return Snapshot::new();
            }
            Err(e) => {
                metrics.checkpoint_read_failures.inc();
                warn!(err = %e, "failed to read checkpoint, starting with an empty snapshot");
                return Snapshot::new();
            }
        };

        match codec.deserialize(&bytes) {
            Ok(snapshot) => {
                info!(entries = snapshot.len(), "checkpoint restored");
                snapshot
            }
            Err(e) => {
                metrics.checkpoint_read_failures.inc();
                warn!(err = %e, bytes = bytes.len(), "failed to decode checkpoint, starting with an empty snapshot");
                Snapshot::new()
            }
        }
    }

    /// Serialize and persist the current snapshot.
    ///
    /// Returns `Ok(false)` without touching the store when there is nothing
    /// to save yet.
    pub async fn write_checkpoint(&self) -> Result<bool> {
        if self.snapshot.is_empty() {
            debug!("snapshot empty, checkpoint skipped");
            return Ok(false);
        }
        let bytes = self.codec.serialize(&self.snapshot)?;
        self.store.write_latest(&bytes).await?;
        self.metrics.checkpoint_writes.inc();
        debug!(entries = self.snapshot.len(), bytes = bytes.len(), "checkpoint written");
        Ok(true)
    }

    /// Write a checkpoint every tick until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(interval = ?self.interval, "checkpointer started");
        let mut ticker = tokio::time::interval(self.interval);
        // The first tick completes immediately; nothing has been fired yet.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match AssertUnwindSafe(self.write_checkpoint()).catch_unwind().await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    self.metrics.checkpoint_write_failures.inc();
                    error!(err = %e, "checkpoint write failed");
                }
                Err(_) => {
                    self.metrics.loop_panics.inc();
                    error!("checkpointer panicked, continuing");
                }
            }
        }
        info!("checkpointer stopped");
    }
}
