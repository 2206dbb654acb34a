//! Turns a (schedule, trigger time) pair into an idempotent create-execution call.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use flowline_core::Identifier;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{
    ExecutionClient, ExecutionCreateRequest, ExecutionError, ExecutionMetadata, ExecutionMode,
    ExecutionSpec, Literal,
};
use crate::error::{Result, SchedulerError};
use crate::metrics::SchedulerMetrics;
use crate::types::SchedulableEntity;

/// Length of generated execution names, including the leading `f`.
pub const EXECUTION_NAME_LEN: usize = 20;

/// Constant-backoff retry budget for a single fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
    /// Bound on each individual create-execution call.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            backoff: Duration::from_secs(1),
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireOutcome {
    Created,
    /// An earlier attempt for the same trigger already landed.
    AlreadyExists,
    /// The schedule was deactivated before the trigger fired.
    SkippedInactive,
}

/// Execution name for one logical trigger: `f` followed by 19 hex chars of
/// SHA-256 over the identifier and the trigger instant.
pub fn execution_name(id: &Identifier, scheduled_time: DateTime<Utc>) -> String {
    let material = format!(
        "{}:{}.{:09}",
        id,
        scheduled_time.timestamp(),
        scheduled_time.timestamp_subsec_nanos()
    );
    let digest = hex::encode(Sha256::digest(material.as_bytes()));
    format!("f{}", &digest[..EXECUTION_NAME_LEN - 1])
}

pub fn build_request(
    schedule: &SchedulableEntity,
    scheduled_time: DateTime<Utc>,
) -> ExecutionCreateRequest {
    let mut inputs = BTreeMap::new();
    if !schedule.kickoff_time_input_arg.is_empty() {
        inputs.insert(
            schedule.kickoff_time_input_arg.clone(),
            Literal::Datetime(scheduled_time),
        );
    }

    ExecutionCreateRequest {
        project: schedule.id.project.clone(),
        domain: schedule.id.domain.clone(),
        name: execution_name(&schedule.id, scheduled_time),
        spec: ExecutionSpec {
            launch_plan: schedule.id.clone(),
            metadata: ExecutionMetadata {
                mode: ExecutionMode::Scheduled,
                scheduled_at: scheduled_time,
            },
            inputs,
        },
    }
}

pub struct ExecutionFirer {
    client: Arc<dyn ExecutionClient>,
    retry: RetryPolicy,
    metrics: Arc<SchedulerMetrics>,
}

impl ExecutionFirer {
    pub fn new(
        client: Arc<dyn ExecutionClient>,
        retry: RetryPolicy,
        metrics: Arc<SchedulerMetrics>,
    ) -> Self {
        Self {
            client,
            retry,
            metrics,
        }
    }

    /// Submit the execution for `scheduled_time`, retrying transient failures.
    ///
    /// "Already exists" counts as success. Cancellation aborts both an
    /// in-flight attempt and the backoff sleep.
    pub async fn fire(
        &self,
        cancel: &CancellationToken,
        schedule: &SchedulableEntity,
        scheduled_time: DateTime<Utc>,
    ) -> Result<FireOutcome> {
        if !schedule.is_active() {
            self.metrics.inactive_skips.inc();
            debug!(schedule = %schedule.id, %scheduled_time, "schedule inactive, not firing");
            return Ok(FireOutcome::SkippedInactive);
        }

        let req = build_request(schedule, scheduled_time);
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SchedulerError::Cancelled),
                res = tokio::time::timeout(self.retry.attempt_timeout, self.client.create_execution(&req)) => {
                    res.unwrap_or_else(|_| Err(ExecutionError::Timeout(self.retry.attempt_timeout)))
                }
            };

            let err = match result {
                Ok(_) => {
                    self.metrics.executions_fired.inc();
                    info!(
                        schedule = %schedule.id,
                        execution = %req.name,
                        %scheduled_time,
                        attempt,
                        "execution created"
                    );
                    return Ok(FireOutcome::Created);
                }
                Err(e) if e.is_already_exists() => {
                    self.metrics.executions_already_existed.inc();
                    info!(
                        schedule = %schedule.id,
                        execution = %req.name,
                        %scheduled_time,
                        "execution already exists, treating as fired"
                    );
                    return Ok(FireOutcome::AlreadyExists);
                }
                Err(e) => e,
            };

            if attempt >= max_attempts {
                self.metrics.execution_failures.inc();
                error!(
                    schedule = %schedule.id,
                    execution = %req.name,
                    %scheduled_time,
                    attempts = max_attempts,
                    err = %err,
                    "giving up on execution"
                );
                return Err(SchedulerError::Execution(err));
            }

            self.metrics.fire_retries.inc();
            warn!(
                schedule = %schedule.id,
                execution = %req.name,
                attempt,
                err = %err,
                "create execution failed, retrying"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SchedulerError::Cancelled),
                _ = tokio::time::sleep(self.retry.backoff) => {}
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::ScriptedClient;
    use super::*;
    use crate::types::test_support::cron_schedule;
    use chrono::TimeZone;

    fn trigger() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 19, 0, 0).unwrap()
    }

    fn firer(client: Arc<ScriptedClient>, max_attempts: u32) -> (ExecutionFirer, Arc<SchedulerMetrics>) {
        let metrics = Arc::new(SchedulerMetrics::new());
        let retry = RetryPolicy {
            max_attempts,
            backoff: Duration::from_secs(1),
            attempt_timeout: Duration::from_secs(5),
        };
        (ExecutionFirer::new(client, retry, Arc::clone(&metrics)), metrics)
    }

    #[test]
    fn execution_name_is_deterministic_and_well_formed() {
        let s = cron_schedule("daily", "0 19 * * *", Some(true));
        let a = execution_name(&s.id, trigger());
        let b = execution_name(&s.id, trigger());
        assert_eq!(a, b);
        assert_eq!(a.len(), EXECUTION_NAME_LEN);
        assert!(a.starts_with('f'));
        assert!(a.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn execution_name_varies_with_time_and_version() {
        let s = cron_schedule("daily", "0 19 * * *", Some(true));
        let base = execution_name(&s.id, trigger());
        assert_ne!(base, execution_name(&s.id, trigger() + chrono::Duration::days(1)));

        let mut other = s.id.clone();
        other.version = "v2".into();
        assert_ne!(base, execution_name(&other, trigger()));
    }

    #[test]
    fn request_injects_kickoff_time() {
        let s = cron_schedule("daily", "0 19 * * *", Some(true));
        let req = build_request(&s, trigger());
        assert_eq!(req.spec.metadata.mode, ExecutionMode::Scheduled);
        assert_eq!(
            req.spec.inputs.get("kickoff_time"),
            Some(&Literal::Datetime(trigger()))
        );

        let mut no_arg = s.clone();
        no_arg.kickoff_time_input_arg.clear();
        assert!(build_request(&no_arg, trigger()).spec.inputs.is_empty());
    }

    #[tokio::test]
    async fn duplicate_fire_is_success() {
        let client = Arc::new(ScriptedClient::with_script(vec![
            Ok(()),
            Err(ExecutionError::AlreadyExists),
        ]));
        let (firer, metrics) = firer(Arc::clone(&client), 3);
        let s = cron_schedule("daily", "0 19 * * *", Some(true));
        let cancel = CancellationToken::new();

        assert_eq!(
            firer.fire(&cancel, &s, trigger()).await.unwrap(),
            FireOutcome::Created
        );
        assert_eq!(
            firer.fire(&cancel, &s, trigger()).await.unwrap(),
            FireOutcome::AlreadyExists
        );

        let names = client.names();
        assert_eq!(names.len(), 2);
        assert_eq!(names[0], names[1]);
        assert_eq!(metrics.snapshot().execution_failures, 0);
        assert_eq!(metrics.snapshot().fire_retries, 0);
    }

    #[tokio::test]
    async fn inactive_schedule_never_reaches_the_api() {
        let client = Arc::new(ScriptedClient::default());
        let (firer, metrics) = firer(Arc::clone(&client), 3);
        let cancel = CancellationToken::new();

        for active in [Some(false), None] {
            let s = cron_schedule("paused", "0 19 * * *", active);
            assert_eq!(
                firer.fire(&cancel, &s, trigger()).await.unwrap(),
                FireOutcome::SkippedInactive
            );
        }
        assert_eq!(client.calls(), 0);
        assert_eq!(metrics.snapshot().inactive_skips, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried() {
        let client = Arc::new(ScriptedClient::with_script(vec![
            Err(ExecutionError::Api {
                status: 503,
                message: "unavailable".into(),
            }),
            Err(ExecutionError::Unavailable("connection reset".into())),
        ]));
        let (firer, metrics) = firer(Arc::clone(&client), 5);
        let s = cron_schedule("daily", "0 19 * * *", Some(true));

        let outcome = firer
            .fire(&CancellationToken::new(), &s, trigger())
            .await
            .unwrap();
        assert_eq!(outcome, FireOutcome::Created);
        assert_eq!(client.calls(), 3);
        assert_eq!(metrics.snapshot().fire_retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_surfaces_the_error() {
        let client = Arc::new(ScriptedClient::failing());
        let (firer, metrics) = firer(Arc::clone(&client), 4);
        let s = cron_schedule("daily", "0 19 * * *", Some(true));

        let err = firer
            .fire(&CancellationToken::new(), &s, trigger())
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Execution(_)));
        assert_eq!(client.calls(), 4);
        assert_eq!(metrics.snapshot().execution_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_the_retry_loop() {
        let client = Arc::new(ScriptedClient::failing());
        let (firer, _) = firer(Arc::clone(&client), 30);
        let s = cron_schedule("daily", "0 19 * * *", Some(true));
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2_500)).await;
            canceller.cancel();
        });

        let err = firer.fire(&cancel, &s, trigger()).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Cancelled));
        assert!(client.calls() < 30);
    }
}
