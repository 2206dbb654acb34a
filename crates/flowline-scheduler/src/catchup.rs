//! Startup recovery: fire every trigger missed while the scheduler was down.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use governor::DefaultDirectRateLimiter;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::{Result, SchedulerError};
use crate::firer::{ExecutionFirer, FireOutcome};
use crate::limiter;
use crate::metrics::SchedulerMetrics;
use crate::snapshot::Snapshot;
use crate::timer::TimerEngine;
use crate::types::SchedulableEntity;

pub struct Catchuper {
    timer: Arc<dyn TimerEngine>,
    firer: Arc<ExecutionFirer>,
    limiter: Arc<DefaultDirectRateLimiter>,
    snapshot: Arc<Snapshot>,
    metrics: Arc<SchedulerMetrics>,
}

impl Catchuper {
    pub fn new(
        timer: Arc<dyn TimerEngine>,
        firer: Arc<ExecutionFirer>,
        limiter: Arc<DefaultDirectRateLimiter>,
        snapshot: Arc<Snapshot>,
        metrics: Arc<SchedulerMetrics>,
    ) -> Self {
        Self {
            timer,
            firer,
            limiter,
            snapshot,
            metrics,
        }
    }

    /// Where catch-up for `schedule` starts: the later of its last activation
    /// and its last confirmed fire.
    pub fn catch_up_from(schedule: &SchedulableEntity, snapshot: &Snapshot) -> DateTime<Utc> {
        match snapshot.last_execution_time(&schedule.key()) {
            Some(last_fired) if last_fired > schedule.updated_at => last_fired,
            _ => schedule.updated_at,
        }
    }

    /// Fire missed triggers for every active schedule, one schedule at a time.
    ///
    /// Returns the number of executions submitted. The first fire failure
    /// aborts the whole pass.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        schedules: &[SchedulableEntity],
        now: DateTime<Utc>,
    ) -> Result<usize> {
        info!(schedules = schedules.len(), %now, "catch-up started");
        let mut fired = 0;
        for schedule in schedules.iter().filter(|s| s.is_active()) {
            fired += self.catch_up_schedule(cancel, schedule, now).await?;
        }
        info!(fired, "catch-up finished");
        Ok(fired)
    }

    async fn catch_up_schedule(
        &self,
        cancel: &CancellationToken,
        schedule: &SchedulableEntity,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let key = schedule.key();
        let from = Self::catch_up_from(schedule, &self.snapshot);

        let times = match self.timer.catch_up_times(schedule, from, now) {
            Ok(times) => times,
            Err(e) => {
                // Definitional problems skip this schedule only.
                error!(schedule = %schedule.id, err = %e, "cannot compute catch-up times, skipping");
                return Ok(0);
            }
        };
        if times.is_empty() {
            return Ok(0);
        }
        info!(schedule = %schedule.id, %key, missed = times.len(), %from, "catching up schedule");

        let mut fired = 0;
        for scheduled_time in times {
            limiter::acquire(&self.limiter, cancel).await?;
            match self.firer.fire(cancel, schedule, scheduled_time).await {
                Ok(FireOutcome::SkippedInactive) => {}
                Ok(_) => {
                    self.snapshot.update_last_execution_time(&key, scheduled_time);
                    self.metrics.catchup_fires.inc();
                    fired += 1;
                }
                Err(SchedulerError::Cancelled) => return Err(SchedulerError::Cancelled),
                Err(e) => {
                    error!(schedule = %schedule.id, %scheduled_time, err = %e, "catch-up fire failed");
                    return Err(SchedulerError::CatchUp {
                        schedule: schedule.id.to_string(),
                        source: Box::new(e),
                    });
                }
            }
        }
        Ok(fired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ExecutionError;
    use crate::firer::test_support::ScriptedClient;
    use crate::firer::RetryPolicy;
    use crate::limiter::{build_limiter, RateLimit};
    use crate::timer::TokioTimerEngine;
    use crate::types::test_support::cron_schedule;
    use chrono::{Duration, TimeZone};

    fn at(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, d, h, 0, 0).unwrap()
    }

    struct Harness {
        catchuper: Catchuper,
        client: Arc<ScriptedClient>,
        snapshot: Arc<Snapshot>,
    }

    fn harness(client: ScriptedClient) -> Harness {
        let client = Arc::new(client);
        let metrics = Arc::new(SchedulerMetrics::new());
        let firer = Arc::new(ExecutionFirer::new(
            Arc::clone(&client) as Arc<dyn crate::client::ExecutionClient>,
            RetryPolicy {
                max_attempts: 2,
                backoff: std::time::Duration::from_millis(10),
                attempt_timeout: std::time::Duration::from_secs(1),
            },
            Arc::clone(&metrics),
        ));
        let snapshot = Arc::new(Snapshot::new());
        let catchuper = Catchuper::new(
            Arc::new(TokioTimerEngine::new()),
            firer,
            Arc::new(build_limiter(&RateLimit {
                requests_per_second: 1_000,
                burst: 100,
            })),
            Arc::clone(&snapshot),
            metrics,
        );
        Harness {
            catchuper,
            client,
            snapshot,
        }
    }

    #[test]
    fn catch_up_starts_at_the_later_anchor() {
        let mut s = cron_schedule("daily", "0 19 * * *", Some(true));
        s.updated_at = at(1, 12);
        let snapshot = Snapshot::new();
        assert_eq!(Catchuper::catch_up_from(&s, &snapshot), at(1, 12));

        snapshot.update_last_execution_time(&s.key(), at(2, 19));
        assert_eq!(Catchuper::catch_up_from(&s, &snapshot), at(2, 19));

        // a fire recorded before the schedule was re-activated is ignored
        s.updated_at = at(3, 12);
        assert_eq!(Catchuper::catch_up_from(&s, &snapshot), at(3, 12));
    }

    #[tokio::test]
    async fn fires_missed_triggers_in_order_and_advances_snapshot() {
        let h = harness(ScriptedClient::default());
        let mut s = cron_schedule("daily", "0 19 * * *", Some(true));
        s.updated_at = at(1, 19);
        let now = at(1, 19) + Duration::hours(49);

        let fired = h
            .catchuper
            .run(&CancellationToken::new(), &[s.clone()], now)
            .await
            .unwrap();

        assert_eq!(fired, 2);
        let requests = h.client.requests.lock().unwrap().clone();
        let times: Vec<_> = requests.iter().map(|r| r.spec.metadata.scheduled_at).collect();
        assert_eq!(times, vec![at(2, 19), at(3, 19)]);
        assert_eq!(h.snapshot.last_execution_time(&s.key()), Some(at(3, 19)));
    }

    #[tokio::test]
    async fn resumes_after_last_confirmed_fire() {
        let h = harness(ScriptedClient::default());
        let mut s = cron_schedule("daily", "0 19 * * *", Some(true));
        s.updated_at = at(1, 0);
        h.snapshot.update_last_execution_time(&s.key(), at(2, 19));

        let fired = h
            .catchuper
            .run(&CancellationToken::new(), &[s], at(4, 0))
            .await
            .unwrap();
        assert_eq!(fired, 1);
        assert_eq!(h.client.requests.lock().unwrap()[0].spec.metadata.scheduled_at, at(3, 19));
    }

    #[tokio::test]
    async fn inactive_and_malformed_schedules_are_skipped() {
        let h = harness(ScriptedClient::default());
        let mut paused = cron_schedule("paused", "0 19 * * *", Some(false));
        paused.updated_at = at(1, 0);
        let mut unset = cron_schedule("unset", "0 19 * * *", None);
        unset.updated_at = at(1, 0);
        let mut broken = cron_schedule("broken", "99 99 * * *", Some(true));
        broken.updated_at = at(1, 0);
        let mut oversized = cron_schedule("oversized", "@every 99999999999999h", Some(true));
        oversized.updated_at = at(1, 0);

        let fired = h
            .catchuper
            .run(
                &CancellationToken::new(),
                &[paused, unset, broken, oversized],
                at(4, 0),
            )
            .await
            .unwrap();
        assert_eq!(fired, 0);
        assert_eq!(h.client.calls(), 0);
    }

    #[tokio::test]
    async fn already_existing_execution_still_advances_snapshot() {
        let h = harness(ScriptedClient::with_script(vec![Err(
            ExecutionError::AlreadyExists,
        )]));
        let mut s = cron_schedule("daily", "0 19 * * *", Some(true));
        s.updated_at = at(1, 12);

        h.catchuper
            .run(&CancellationToken::new(), &[s.clone()], at(2, 0))
            .await
            .unwrap();
        assert_eq!(h.snapshot.last_execution_time(&s.key()), Some(at(1, 19)));
    }

    #[tokio::test]
    async fn downstream_failure_aborts_catch_up() {
        let h = harness(ScriptedClient::failing());
        let mut first = cron_schedule("first", "0 19 * * *", Some(true));
        first.updated_at = at(1, 12);
        let mut second = cron_schedule("second", "0 19 * * *", Some(true));
        second.updated_at = at(1, 12);

        let err = h
            .catchuper
            .run(&CancellationToken::new(), &[first.clone(), second], at(3, 0))
            .await
            .unwrap_err();

        assert!(matches!(err, SchedulerError::CatchUp { .. }));
        // two attempts on the first trigger of the first schedule, then stop
        assert_eq!(h.client.calls(), 2);
        assert!(h.snapshot.last_execution_time(&first.key()).is_none());
    }
}
