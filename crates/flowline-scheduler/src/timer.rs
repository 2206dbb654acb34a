//! Live timers for registered schedules.
//!
//! Each registration owns a Tokio task that sleeps until the next trigger
//! and hands the callback the *planned* instant, not the wake-up time, so
//! scheduler jitter never leaks into execution names or inputs.
//!
//! A timer resumes from the instant it is given rather than from "now", and
//! runs its callback to completion before computing the next trigger. A late
//! wake-up (slow catch-up, suspend, clock jump) therefore replays the missed
//! triggers one at a time, in order, instead of dropping or stampeding them.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, SchedulerError};
use crate::schedule::{self, Cadence};
use crate::types::{SchedulableEntity, ScheduleKey};

/// Invoked once per trigger with the latest known entity and the planned time.
pub type FireCallback =
    Arc<dyn Fn(SchedulableEntity, DateTime<Utc>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Narrow seam over the timer implementation so it can be swapped or faked.
pub trait TimerEngine: Send + Sync {
    /// Install a timer for `schedule` whose first trigger is the first one
    /// strictly after `resume_from`. Registering an unchanged schedule again
    /// only refreshes the stored entity; a changed definition replaces the timer.
    fn register(
        &self,
        schedule: &SchedulableEntity,
        resume_from: DateTime<Utc>,
        callback: FireCallback,
    ) -> Result<()>;

    /// Remove the timer for `schedule`. Returns `false` if none was installed.
    fn deregister(&self, schedule: &SchedulableEntity) -> bool;

    /// Remove every timer. Used on shutdown.
    fn deregister_all(&self);

    fn scheduled_time(
        &self,
        schedule: &SchedulableEntity,
        from: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        schedule::scheduled_time(schedule, from)
    }

    fn catch_up_times(
        &self,
        schedule: &SchedulableEntity,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>> {
        schedule::catch_up_times(schedule, from, to)
    }
}

struct TimerJob {
    fingerprint: String,
    entity: Arc<RwLock<SchedulableEntity>>,
    cancel: CancellationToken,
}

impl TimerJob {
    fn refresh(&self, schedule: &SchedulableEntity) -> Result<()> {
        let mut entity = self
            .entity
            .write()
            .map_err(|_| SchedulerError::StorePoisoned)?;
        *entity = schedule.clone();
        Ok(())
    }
}

/// [`TimerEngine`] backed by one Tokio task per schedule.
pub struct TokioTimerEngine {
    jobs: DashMap<ScheduleKey, TimerJob>,
}

impl TokioTimerEngine {
    pub fn new() -> Self {
        Self {
            jobs: DashMap::new(),
        }
    }

    pub fn is_registered(&self, key: &ScheduleKey) -> bool {
        self.jobs.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn start(
        schedule: &SchedulableEntity,
        cadence: Cadence,
        resume_from: DateTime<Utc>,
        callback: FireCallback,
    ) -> TimerJob {
        let job = TimerJob {
            fingerprint: schedule.fingerprint(),
            entity: Arc::new(RwLock::new(schedule.clone())),
            cancel: CancellationToken::new(),
        };
        tokio::spawn(run_timer(
            schedule.key(),
            cadence,
            resume_from,
            Arc::clone(&job.entity),
            callback,
            job.cancel.clone(),
        ));
        job
    }
}

impl Default for TokioTimerEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerEngine for TokioTimerEngine {
    fn register(
        &self,
        schedule: &SchedulableEntity,
        resume_from: DateTime<Utc>,
        callback: FireCallback,
    ) -> Result<()> {
        let key = schedule.key();
        let fingerprint = schedule.fingerprint();

        match self.jobs.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().fingerprint == fingerprint {
                    return occupied.get().refresh(schedule);
                }
                let cadence = Cadence::parse(&schedule.expression)?;
                // An edited definition applies from now on, it is not downtime.
                let resume_from = resume_from.max(Utc::now());
                let previous = occupied.insert(Self::start(schedule, cadence, resume_from, callback));
                previous.cancel.cancel();
                info!(schedule = %schedule.id, %key, "schedule definition changed, timer replaced");
            }
            Entry::Vacant(vacant) => {
                let cadence = Cadence::parse(&schedule.expression)?;
                vacant.insert(Self::start(schedule, cadence, resume_from, callback));
                info!(
                    schedule = %schedule.id,
                    %key,
                    expression = %schedule.expression,
                    %resume_from,
                    "timer registered"
                );
            }
        }
        Ok(())
    }

    fn deregister(&self, schedule: &SchedulableEntity) -> bool {
        let key = schedule.key();
        match self.jobs.remove(&key) {
            Some((_, job)) => {
                job.cancel.cancel();
                info!(schedule = %schedule.id, %key, "timer deregistered");
                true
            }
            None => false,
        }
    }

    fn deregister_all(&self) {
        let count = self.jobs.len();
        self.jobs.retain(|_, job| {
            job.cancel.cancel();
            false
        });
        if count > 0 {
            info!(count, "all timers deregistered");
        }
    }
}

async fn run_timer(
    key: ScheduleKey,
    cadence: Cadence,
    resume_from: DateTime<Utc>,
    entity: Arc<RwLock<SchedulableEntity>>,
    callback: FireCallback,
    cancel: CancellationToken,
) {
    let mut from = resume_from;
    loop {
        let Some(next) = cadence.next_after(from) else {
            warn!(%key, "schedule has no further triggers, timer stopping");
            return;
        };

        let wait = (next - Utc::now()).to_std().unwrap_or_default();
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(%key, "timer cancelled");
                return;
            }
            _ = tokio::time::sleep(wait) => {}
        }

        let current = match entity.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        debug!(%key, scheduled_time = %next, "timer fired");
        callback(current, next).await;
        from = next;
    }
}
