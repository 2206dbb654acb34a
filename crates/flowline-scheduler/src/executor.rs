//! Top-level orchestrator: restore, catch up, then schedule live until cancelled.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use flowline_core::FlowlineConfig;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::catchup::Catchuper;
use crate::checkpointer::Checkpointer;
use crate::client::ExecutionClient;
use crate::codec::SnapshotCodec;
use crate::error::{Result, SchedulerError};
use crate::firer::{ExecutionFirer, RetryPolicy};
use crate::limiter::{build_limiter, RateLimit};
use crate::metrics::SchedulerMetrics;
use crate::registerer::Registerer;
use crate::repository::{ScheduleRepository, SnapshotRepository};
use crate::timer::{TimerEngine, TokioTimerEngine};

/// Everything the executor needs from the process configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorConfig {
    pub registerer_interval: Duration,
    pub checkpoint_interval: Duration,
    pub rate_limit: RateLimit,
    pub retry: RetryPolicy,
    pub snapshot_version: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            registerer_interval: Duration::from_secs(30),
            checkpoint_interval: Duration::from_secs(30),
            rate_limit: RateLimit::default(),
            retry: RetryPolicy::default(),
            snapshot_version: crate::codec::SNAPSHOT_VERSION_V1,
        }
    }
}

impl ExecutorConfig {
    pub fn from_config(config: &FlowlineConfig) -> Self {
        let scheduler = &config.scheduler;
        Self {
            registerer_interval: Duration::from_secs(scheduler.registerer_interval_secs.max(1)),
            checkpoint_interval: Duration::from_secs(scheduler.checkpoint_interval_secs.max(1)),
            rate_limit: RateLimit {
                requests_per_second: scheduler.rate_limit.requests_per_second,
                burst: scheduler.rate_limit.burst,
            },
            retry: RetryPolicy {
                max_attempts: scheduler.retry.max_attempts,
                backoff: Duration::from_millis(scheduler.retry.backoff_ms),
                attempt_timeout: Duration::from_secs(config.admin.request_timeout_secs.max(1)),
            },
            snapshot_version: scheduler.snapshot_version,
        }
    }
}

/// Owns every scheduler component for one run.
pub struct ScheduledExecutor {
    config: ExecutorConfig,
    schedules: Arc<dyn ScheduleRepository>,
    snapshots: Arc<dyn SnapshotRepository>,
    client: Arc<dyn ExecutionClient>,
    timer: Arc<dyn TimerEngine>,
    metrics: Arc<SchedulerMetrics>,
}

impl ScheduledExecutor {
    pub fn new(
        config: ExecutorConfig,
        schedules: Arc<dyn ScheduleRepository>,
        snapshots: Arc<dyn SnapshotRepository>,
        client: Arc<dyn ExecutionClient>,
    ) -> Self {
        Self {
            config,
            schedules,
            snapshots,
            client,
            timer: Arc::new(TokioTimerEngine::new()),
            metrics: Arc::new(SchedulerMetrics::new()),
        }
    }

    /// Replace the default Tokio-backed timer engine.
    pub fn with_timer_engine(mut self, timer: Arc<dyn TimerEngine>) -> Self {
        self.timer = timer;
        self
    }

    pub fn metrics(&self) -> Arc<SchedulerMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Run until `cancel` fires.
    ///
    /// A catch-up failure is returned before any live scheduling starts.
    /// Cancellation, including during catch-up, is a clean `Ok(())`.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let codec = SnapshotCodec::new(self.config.snapshot_version)?;
        let snapshot = Arc::new(
            Checkpointer::read_checkpoint(self.snapshots.as_ref(), &codec, &self.metrics).await,
        );
        let schedules = self.schedules.list_all().await?;
        info!(
            schedules = schedules.len(),
            checkpointed = snapshot.len(),
            "scheduler state loaded"
        );

        let limiter = Arc::new(build_limiter(&self.config.rate_limit));
        let firer = Arc::new(ExecutionFirer::new(
            Arc::clone(&self.client),
            self.config.retry,
            Arc::clone(&self.metrics),
        ));

        let catchuper = Catchuper::new(
            Arc::clone(&self.timer),
            Arc::clone(&firer),
            Arc::clone(&limiter),
            Arc::clone(&snapshot),
            Arc::clone(&self.metrics),
        );
        match catchuper.run(&cancel, &schedules, Utc::now()).await {
            Ok(_) => {}
            Err(SchedulerError::Cancelled) => {
                info!("cancelled during catch-up, exiting");
                return Ok(());
            }
            Err(e) => {
                error!(err = %e, "catch-up failed, live scheduling not started");
                return Err(e);
            }
        }

        let registerer = Arc::new(Registerer::new(
            Arc::clone(&self.schedules),
            Arc::clone(&self.timer),
            firer,
            limiter,
            Arc::clone(&snapshot),
            Arc::clone(&self.metrics),
            self.config.registerer_interval,
        ));
        let checkpointer = Arc::new(Checkpointer::new(
            Arc::clone(&self.snapshots),
            codec,
            Arc::clone(&snapshot),
            Arc::clone(&self.metrics),
            self.config.checkpoint_interval,
        ));

        let registerer_task = tokio::spawn(Arc::clone(&registerer).run(cancel.child_token()));
        let checkpointer_task = tokio::spawn(Arc::clone(&checkpointer).run(cancel.child_token()));
        info!("scheduler running");

        cancel.cancelled().await;
        info!("shutdown requested, stopping scheduler");

        self.timer.deregister_all();
        for (name, task) in [("registerer", registerer_task), ("checkpointer", checkpointer_task)] {
            if let Err(e) = task.await {
                warn!(task = name, err = %e, "loop task ended abnormally");
            }
        }

        if let Err(e) = checkpointer.write_checkpoint().await {
            self.metrics.checkpoint_write_failures.inc();
            error!(err = %e, "final checkpoint write failed");
        }
        info!(metrics = ?self.metrics.snapshot(), "scheduler stopped");
        Ok(())
    }
}
