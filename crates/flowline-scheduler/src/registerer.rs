//! Keeps live timers in step with the schedule table.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use governor::DefaultDirectRateLimiter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::catchup::Catchuper;
use crate::error::{Result, SchedulerError};
use crate::firer::{ExecutionFirer, FireOutcome};
use crate::limiter;
use crate::metrics::SchedulerMetrics;
use crate::repository::ScheduleRepository;
use crate::snapshot::Snapshot;
use crate::timer::{FireCallback, TimerEngine};
use crate::types::SchedulableEntity;

/// Outcome of one reconciliation pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub registered: usize,
    pub deregistered: usize,
    pub failed: usize,
}

pub struct Registerer {
    schedules: Arc<dyn ScheduleRepository>,
    timer: Arc<dyn TimerEngine>,
    firer: Arc<ExecutionFirer>,
    limiter: Arc<DefaultDirectRateLimiter>,
    snapshot: Arc<Snapshot>,
    metrics: Arc<SchedulerMetrics>,
    interval: Duration,
}

impl Registerer {
    pub fn new(
        schedules: Arc<dyn ScheduleRepository>,
        timer: Arc<dyn TimerEngine>,
        firer: Arc<ExecutionFirer>,
        limiter: Arc<DefaultDirectRateLimiter>,
        snapshot: Arc<Snapshot>,
        metrics: Arc<SchedulerMetrics>,
        interval: Duration,
    ) -> Self {
        Self {
            schedules,
            timer,
            firer,
            limiter,
            snapshot,
            metrics,
            interval,
        }
    }

    /// Reconcile on every tick until `cancel` fires. The first tick is immediate.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(interval = ?self.interval, "registerer started");
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match AssertUnwindSafe(self.reconcile(&cancel)).catch_unwind().await {
                Ok(Ok(report)) => debug!(?report, "reconciliation pass finished"),
                Ok(Err(e)) => error!(err = %e, "reconciliation pass failed"),
                Err(_) => {
                    self.metrics.loop_panics.inc();
                    error!("registerer panicked during reconciliation, continuing");
                }
            }
        }
        info!("registerer stopped");
    }

    /// One pass: register every active schedule, deregister the rest.
    /// A failure on one schedule never blocks the others.
    ///
    /// New timers resume from the schedule's last fire (or activation), so
    /// triggers that fell between catch-up and this pass are still fired.
    pub async fn reconcile(&self, cancel: &CancellationToken) -> Result<ReconcileReport> {
        let schedules = self.schedules.list_all().await?;
        let mut report = ReconcileReport::default();

        for schedule in &schedules {
            if !schedule.is_active() {
                if self.timer.deregister(schedule) {
                    self.metrics.deregistrations.inc();
                    report.deregistered += 1;
                }
                continue;
            }

            let resume_from = Catchuper::catch_up_from(schedule, &self.snapshot);
            match self
                .timer
                .register(schedule, resume_from, self.fire_callback(cancel))
            {
                Ok(()) => {
                    self.metrics.registrations.inc();
                    report.registered += 1;
                }
                Err(e) => {
                    self.metrics.registration_failures.inc();
                    report.failed += 1;
                    error!(schedule = %schedule.id, err = %e, "failed to register schedule");
                }
            }
        }
        Ok(report)
    }

    /// Callback run on every live trigger.
    fn fire_callback(&self, cancel: &CancellationToken) -> FireCallback {
        let firer = Arc::clone(&self.firer);
        let limiter = Arc::clone(&self.limiter);
        let snapshot = Arc::clone(&self.snapshot);
        let cancel = cancel.clone();

        Arc::new(move |schedule: SchedulableEntity, scheduled_time: DateTime<Utc>| {
            let firer = Arc::clone(&firer);
            let limiter = Arc::clone(&limiter);
            let snapshot = Arc::clone(&snapshot);
            let cancel = cancel.clone();
            Box::pin(async move {
                // Deactivated after registration but before the deregister landed.
                if !schedule.is_active() {
                    debug!(schedule = %schedule.id, %scheduled_time, "trigger for inactive schedule ignored");
                    return;
                }
                if limiter::acquire(&limiter, &cancel).await.is_err() {
                    return;
                }
                match firer.fire(&cancel, &schedule, scheduled_time).await {
                    Ok(FireOutcome::SkippedInactive) => {}
                    Ok(_) => {
                        snapshot.update_last_execution_time(&schedule.key(), scheduled_time);
                    }
                    Err(SchedulerError::Cancelled) => {
                        debug!(schedule = %schedule.id, "live fire cancelled by shutdown");
                    }
                    Err(e) => {
                        warn!(schedule = %schedule.id, %scheduled_time, err = %e, "live fire failed");
                    }
                }
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firer::test_support::ScriptedClient;
    use crate::firer::RetryPolicy;
    use crate::limiter::{build_limiter, RateLimit};
    use crate::types::test_support::cron_schedule;
    use crate::types::ScheduleKey;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct StaticSchedules(Mutex<Vec<SchedulableEntity>>);

    #[async_trait]
    impl ScheduleRepository for StaticSchedules {
        async fn list_all(&self) -> Result<Vec<SchedulableEntity>> {
            Ok(self.0.lock().unwrap().clone())
        }
    }

    /// Panics on the first listing, then serves the wrapped schedules.
    struct PanicOnce {
        inner: StaticSchedules,
        panicked: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl ScheduleRepository for PanicOnce {
        async fn list_all(&self) -> Result<Vec<SchedulableEntity>> {
            if !self.panicked.swap(true, std::sync::atomic::Ordering::SeqCst) {
                panic!("schedule listing blew up");
            }
            self.inner.list_all().await
        }
    }

    /// Records calls; registering a schedule named "poison" fails.
    #[derive(Default)]
    struct RecordingTimer {
        registered: Mutex<Vec<(ScheduleKey, DateTime<Utc>)>>,
        deregistered: Mutex<Vec<ScheduleKey>>,
        live: Mutex<std::collections::HashSet<ScheduleKey>>,
        callbacks: Mutex<Vec<FireCallback>>,
    }

    impl RecordingTimer {
        fn registered_keys(&self) -> Vec<ScheduleKey> {
            self.registered
                .lock()
                .unwrap()
                .iter()
                .map(|(key, _)| key.clone())
                .collect()
        }
    }

    impl TimerEngine for RecordingTimer {
        fn register(
            &self,
            schedule: &SchedulableEntity,
            resume_from: DateTime<Utc>,
            callback: FireCallback,
        ) -> Result<()> {
            if schedule.id.name == "poison" {
                return Err(SchedulerError::InvalidCron {
                    expression: "poison".into(),
                    reason: "test".into(),
                });
            }
            self.registered
                .lock()
                .unwrap()
                .push((schedule.key(), resume_from));
            self.live.lock().unwrap().insert(schedule.key());
            self.callbacks.lock().unwrap().push(callback);
            Ok(())
        }

        fn deregister(&self, schedule: &SchedulableEntity) -> bool {
            self.deregistered.lock().unwrap().push(schedule.key());
            self.live.lock().unwrap().remove(&schedule.key())
        }

        fn deregister_all(&self) {}
    }

    struct Harness {
        registerer: Registerer,
        timer: Arc<RecordingTimer>,
        client: Arc<ScriptedClient>,
        snapshot: Arc<Snapshot>,
        metrics: Arc<SchedulerMetrics>,
    }

    fn harness(schedules: Vec<SchedulableEntity>) -> Harness {
        harness_with(Arc::new(StaticSchedules(Mutex::new(schedules))))
    }

    fn harness_with(schedules: Arc<dyn ScheduleRepository>) -> Harness {
        let client = Arc::new(ScriptedClient::default());
        let timer = Arc::new(RecordingTimer::default());
        let snapshot = Arc::new(Snapshot::new());
        let metrics = Arc::new(SchedulerMetrics::new());
        let firer = Arc::new(ExecutionFirer::new(
            Arc::clone(&client) as Arc<dyn crate::client::ExecutionClient>,
            RetryPolicy::default(),
            Arc::clone(&metrics),
        ));
        let registerer = Registerer::new(
            schedules,
            Arc::clone(&timer) as Arc<dyn TimerEngine>,
            firer,
            Arc::new(build_limiter(&RateLimit::default())),
            Arc::clone(&snapshot),
            Arc::clone(&metrics),
            Duration::from_secs(30),
        );
        Harness {
            registerer,
            timer,
            client,
            snapshot,
            metrics,
        }
    }

    #[tokio::test]
    async fn active_registered_inactive_deregistered() {
        let on = cron_schedule("on", "* * * * *", Some(true));
        let off = cron_schedule("off", "* * * * *", Some(false));
        let unset = cron_schedule("unset", "* * * * *", None);
        let h = harness(vec![on.clone(), off.clone(), unset.clone()]);

        let report = h.registerer.reconcile(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.registered, 1);
        assert_eq!(h.timer.registered_keys(), vec![on.key()]);
        assert_eq!(
            *h.timer.deregistered.lock().unwrap(),
            vec![off.key(), unset.key()]
        );
        // Neither inactive row ever had a timer.
        assert_eq!(report.deregistered, 0);
        assert_eq!(h.metrics.snapshot().deregistrations, 0);
    }

    #[tokio::test]
    async fn only_real_deactivations_are_counted() {
        let on = cron_schedule("on", "* * * * *", Some(true));
        let never = cron_schedule("never", "* * * * *", Some(false));
        let schedules = Arc::new(StaticSchedules(Mutex::new(vec![on.clone(), never])));
        let h = harness_with(Arc::clone(&schedules) as Arc<dyn ScheduleRepository>);
        let cancel = CancellationToken::new();

        h.registerer.reconcile(&cancel).await.unwrap();
        schedules.0.lock().unwrap()[0].active = Some(false);

        let report = h.registerer.reconcile(&cancel).await.unwrap();
        assert_eq!(report.deregistered, 1);
        let report = h.registerer.reconcile(&cancel).await.unwrap();
        assert_eq!(report.deregistered, 0);
        assert_eq!(h.metrics.snapshot().deregistrations, 1);
    }

    #[tokio::test]
    async fn timer_resumes_from_last_fire_or_activation() {
        let fired = cron_schedule("fired", "@every 20s", Some(true));
        let fresh = cron_schedule("fresh", "@every 20s", Some(true));
        let h = harness(vec![fired.clone(), fresh.clone()]);
        let last = fired.updated_at + chrono::Duration::hours(5);
        h.snapshot.update_last_execution_time(&fired.key(), last);

        h.registerer.reconcile(&CancellationToken::new()).await.unwrap();

        assert_eq!(
            *h.timer.registered.lock().unwrap(),
            vec![(fired.key(), last), (fresh.key(), fresh.updated_at)]
        );
    }

    #[tokio::test]
    async fn one_bad_schedule_does_not_block_the_rest() {
        let poison = cron_schedule("poison", "* * * * *", Some(true));
        let healthy = cron_schedule("healthy", "* * * * *", Some(true));
        let h = harness(vec![poison, healthy.clone()]);

        let report = h.registerer.reconcile(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.registered, 1);
        assert_eq!(h.timer.registered_keys(), vec![healthy.key()]);
        assert_eq!(h.metrics.snapshot().registration_failures, 1);
    }

    #[tokio::test]
    async fn callback_fires_and_records_snapshot() {
        let s = cron_schedule("on", "* * * * *", Some(true));
        let h = harness(vec![s.clone()]);
        h.registerer.reconcile(&CancellationToken::new()).await.unwrap();

        let callback = h.timer.callbacks.lock().unwrap()[0].clone();
        let at = chrono::TimeZone::with_ymd_and_hms(&Utc, 2024, 3, 1, 10, 5, 0).unwrap();
        callback(s.clone(), at).await;

        assert_eq!(h.client.calls(), 1);
        assert_eq!(h.snapshot.last_execution_time(&s.key()), Some(at));
    }

    #[tokio::test]
    async fn callback_rechecks_active_flag() {
        let s = cron_schedule("on", "* * * * *", Some(true));
        let h = harness(vec![s.clone()]);
        h.registerer.reconcile(&CancellationToken::new()).await.unwrap();

        let callback = h.timer.callbacks.lock().unwrap()[0].clone();
        let mut deactivated = s.clone();
        deactivated.active = Some(false);
        callback(deactivated, Utc::now()).await;

        assert_eq!(h.client.calls(), 0);
        assert!(h.snapshot.is_empty());
    }

    #[tokio::test]
    async fn run_exits_on_cancel() {
        let h = harness(vec![cron_schedule("on", "* * * * *", Some(true))]);
        let registerer = Arc::new(h.registerer);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(Arc::clone(&registerer).run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(h.timer.registered.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn run_survives_a_panicking_pass() {
        let on = cron_schedule("on", "* * * * *", Some(true));
        let schedules = PanicOnce {
            inner: StaticSchedules(Mutex::new(vec![on.clone()])),
            panicked: Default::default(),
        };
        let mut h = harness_with(Arc::new(schedules));
        h.registerer.interval = Duration::from_millis(20);
        let registerer = Arc::new(h.registerer);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(Arc::clone(&registerer).run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(h.metrics.snapshot().loop_panics, 1);
        assert!(h.timer.registered_keys().contains(&on.key()));
    }
}
