//! Cron Scheduler: named, persisted recurring triggers over the Queue Manager.
//!
//! Each active [`CronSchedule`] record is paired with one repeatable trigger
//! in the broker. Brokers key triggers by content (`job_name:pattern`), so
//! two active schedules on the same queue with the same job and pattern share
//! one trigger; it is removed only when the last of them goes away. When one
//! of them goes, the trigger is re-registered from a remaining schedule so it
//! never fires with a removed schedule's payload or owner.
//!
//! Firing is driven by [`CronScheduler::tick`], which the service runs on an
//! interval via [`CronScheduler::spawn_ticker`]. Periods missed while the
//! process was down collapse into a single firing.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use taskforge_core::{CronPattern, CronSchedule, JobOptions, JobPayload, PrincipalId, ScheduleId};

use crate::broker::{BrokerError, FiredTrigger, MessageBroker, RepeatableTrigger};
use crate::queue::QueueManager;
use crate::side_effect::fire_and_log;
use crate::store::{ScheduleRepository, StoreError};

#[derive(Debug, Clone, thiserror::Error)]
pub enum ScheduleError {
    #[error("invalid cron pattern: {0}")]
    InvalidPattern(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("schedule not found: {0}")]
    NotFound(ScheduleId),

    #[error("no message broker is configured")]
    BrokerUnavailable,

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What to schedule; see [`CronScheduler::add_cron_job`].
#[derive(Debug, Clone, PartialEq)]
pub struct CronJobSpec {
    pub name: String,
    pub pattern: String,
    pub queue: String,
    pub job_name: String,
    pub payload: JobPayload,
}

impl CronJobSpec {
    pub fn new(
        name: impl Into<String>,
        pattern: impl Into<String>,
        queue: impl Into<String>,
        job_name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            pattern: pattern.into(),
            queue: queue.into(),
            job_name: job_name.into(),
            payload: JobPayload::new(),
        }
    }

    pub fn with_payload(mut self, payload: JobPayload) -> Self {
        self.payload = payload;
        self
    }

    fn validate(&self) -> Result<CronPattern, ScheduleError> {
        for (field, value) in [("name", &self.name), ("queue", &self.queue), ("job name", &self.job_name)] {
            if value.trim().is_empty() {
                return Err(ScheduleError::InvalidInput(format!("{field} must not be empty")));
            }
        }
        CronPattern::parse(&self.pattern).map_err(|e| ScheduleError::InvalidPattern(e.to_string()))
    }
}

fn trigger_for(schedule: &CronSchedule) -> RepeatableTrigger {
    RepeatableTrigger::new(
        &schedule.queue,
        &schedule.job_name,
        &schedule.pattern,
        schedule.payload.clone(),
        JobOptions::for_principal(schedule.owner),
    )
}

fn next_run(pattern: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    CronPattern::parse(pattern).ok().and_then(|p| p.next_after(now))
}

#[derive(Clone)]
pub struct CronScheduler {
    queue: Arc<QueueManager>,
    repo: Arc<dyn ScheduleRepository>,
}

impl std::fmt::Debug for CronScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CronScheduler")
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl CronScheduler {
    pub fn new(queue: Arc<QueueManager>, repo: Arc<dyn ScheduleRepository>) -> Self {
        Self { queue, repo }
    }

    fn broker(&self) -> Result<&Arc<dyn MessageBroker>, ScheduleError> {
        self.queue.broker().ok_or(ScheduleError::BrokerUnavailable)
    }

    /// Another active schedule that needs `schedule`'s trigger, if any.
    async fn sharing_schedule(&self, schedule: &CronSchedule) -> Result<Option<CronSchedule>, ScheduleError> {
        let key = schedule.trigger_key();
        Ok(self
            .repo
            .list(None)
            .await?
            .into_iter()
            .find(|s| s.id != schedule.id && s.is_active && s.queue == schedule.queue && s.trigger_key() == key))
    }

    /// Remove `schedule`'s broker trigger. If another schedule shares it, the
    /// trigger is registered again from that schedule.
    async fn release_trigger(&self, broker: &Arc<dyn MessageBroker>, schedule: &CronSchedule) -> Result<(), ScheduleError> {
        let survivor = self.sharing_schedule(schedule).await?;
        broker.remove_repeatable(&schedule.queue, &schedule.trigger_key()).await?;
        if let Some(survivor) = survivor {
            debug!(schedule_id = %schedule.id, survivor_id = %survivor.id, key = %survivor.trigger_key(), "trigger shared; re-registered from remaining schedule");
            broker.add_repeatable(trigger_for(&survivor)).await?;
        }
        Ok(())
    }

    /// Create or replace the schedule named `spec.name` for `owner`.
    ///
    /// The pattern is checked before the broker or the store is touched. If
    /// the record cannot be written, the trigger registered here is removed
    /// again.
    #[instrument(skip_all, fields(name = %spec.name, pattern = %spec.pattern, queue = %spec.queue), err)]
    pub async fn add_cron_job(&self, spec: CronJobSpec, owner: PrincipalId) -> Result<CronSchedule, ScheduleError> {
        let pattern = spec.validate()?;
        let broker = self.broker()?;

        let mut schedule = CronSchedule::new(spec.name, owner, spec.pattern, spec.queue, spec.job_name, spec.payload);
        schedule.next_run_at = pattern.next_after(Utc::now());

        let previous = self.repo.find_by_name(&schedule.name, owner).await?;
        if let Some(previous) = &previous {
            schedule.id = previous.id;
            schedule.created_at = previous.created_at;
        }
        let trigger_unchanged = previous.as_ref().is_some_and(|p| {
            p.is_active && p.queue == schedule.queue && p.trigger_key() == schedule.trigger_key() && p.payload == schedule.payload
        });
        if let Some(previous) = previous.as_ref().filter(|p| p.is_active && !trigger_unchanged) {
            self.release_trigger(broker, previous).await?;
        }

        let newly_registered = !trigger_unchanged && self.sharing_schedule(&schedule).await?.is_none();
        broker.add_repeatable(trigger_for(&schedule)).await?;

        let (queue, key) = (schedule.queue.clone(), schedule.trigger_key());
        match self.repo.upsert(schedule).await {
            Ok(stored) => {
                info!(schedule_id = %stored.id, next_run_at = ?stored.next_run_at, "cron schedule saved");
                Ok(stored)
            }
            Err(e) => {
                // The stored record still describes the previous trigger.
                if newly_registered {
                    fire_and_log("schedule.rollback", broker.remove_repeatable(&queue, &key)).await;
                }
                if let Some(previous) = previous.filter(|p| p.is_active && !trigger_unchanged) {
                    fire_and_log("schedule.rollback", broker.add_repeatable(trigger_for(&previous))).await;
                }
                Err(e.into())
            }
        }
    }

    /// Delete the schedule and its trigger. `Ok(false)` when it does not exist.
    #[instrument(skip(self), err)]
    pub async fn remove_cron_job(&self, id: ScheduleId) -> Result<bool, ScheduleError> {
        let Some(schedule) = self.repo.get(id).await? else {
            return Ok(false);
        };
        if schedule.is_active {
            if let Some(broker) = self.queue.broker() {
                self.release_trigger(broker, &schedule).await?;
            }
        }
        let deleted = self.repo.delete(id).await?;
        info!(schedule_id = %id, name = %schedule.name, "cron schedule removed");
        Ok(deleted)
    }

    /// Pause or resume a schedule without losing its configuration.
    ///
    /// Asking for the state the schedule is already in changes nothing.
    #[instrument(skip(self), err)]
    pub async fn toggle_schedule(&self, id: ScheduleId, is_active: bool) -> Result<CronSchedule, ScheduleError> {
        let mut schedule = self.repo.get(id).await?.ok_or(ScheduleError::NotFound(id))?;
        if schedule.is_active == is_active {
            debug!(schedule_id = %id, is_active, "schedule already in requested state");
            return Ok(schedule);
        }
        let broker = self.broker()?;

        if is_active {
            let pattern = CronPattern::parse(&schedule.pattern).map_err(|e| ScheduleError::InvalidPattern(e.to_string()))?;
            let newly_registered = self.sharing_schedule(&schedule).await?.is_none();
            broker.add_repeatable(trigger_for(&schedule)).await?;
            schedule.is_active = true;
            schedule.next_run_at = pattern.next_after(Utc::now());
            schedule.updated_at = Utc::now();
            if let Err(e) = self.repo.update(&schedule).await {
                if newly_registered {
                    fire_and_log(
                        "schedule.rollback",
                        broker.remove_repeatable(&schedule.queue, &schedule.trigger_key()),
                    )
                    .await;
                }
                return Err(e.into());
            }
        } else {
            self.release_trigger(broker, &schedule).await?;
            schedule.is_active = false;
            schedule.next_run_at = None;
            schedule.updated_at = Utc::now();
            self.repo.update(&schedule).await?;
        }

        info!(schedule_id = %id, is_active, "cron schedule toggled");
        Ok(schedule)
    }

    /// All schedules, or only `owner`'s.
    pub async fn list_schedules(&self, owner: Option<PrincipalId>) -> Result<Vec<CronSchedule>, ScheduleError> {
        Ok(self.repo.list(owner).await?)
    }

    pub async fn get(&self, id: ScheduleId) -> Result<CronSchedule, ScheduleError> {
        self.repo.get(id).await?.ok_or(ScheduleError::NotFound(id))
    }

    /// Re-register the trigger of every active schedule.
    ///
    /// Run at startup so schedules survive a broker that lost its state.
    /// Registration is idempotent; one failing schedule does not stop the rest.
    pub async fn restore(&self) -> Result<usize, ScheduleError> {
        let Some(broker) = self.queue.broker() else {
            warn!("no message broker configured; cron schedules not restored");
            return Ok(0);
        };

        let now = Utc::now();
        let mut restored = 0;
        for mut schedule in self.repo.list(None).await?.into_iter().filter(|s| s.is_active) {
            if let Err(e) = broker.add_repeatable(trigger_for(&schedule)).await {
                warn!(schedule_id = %schedule.id, error = %e, "failed to restore cron trigger");
                continue;
            }
            restored += 1;

            let next = next_run(&schedule.pattern, now);
            if schedule.next_run_at != next {
                schedule.next_run_at = next;
                schedule.updated_at = now;
                fire_and_log("schedule.next_run", self.repo.update(&schedule)).await;
            }
        }
        info!(restored, "cron schedules restored");
        Ok(restored)
    }

    /// Fire due triggers, then record the run on the matching schedules.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<Vec<FiredTrigger>, ScheduleError> {
        let Some(broker) = self.queue.broker() else {
            return Ok(Vec::new());
        };
        let fired = broker.fire_due_repeatables(now).await?;
        if fired.is_empty() {
            return Ok(fired);
        }

        let schedules = match self.repo.list(None).await {
            Ok(schedules) => schedules,
            Err(e) => {
                warn!(error = %e, "fired triggers but could not load schedules");
                return Ok(fired);
            }
        };
        for trigger in &fired {
            debug!(queue = %trigger.queue, key = %trigger.key, job_id = %trigger.job_id, "cron trigger fired");
            for schedule in schedules
                .iter()
                .filter(|s| s.is_active && s.queue == trigger.queue && s.trigger_key() == trigger.key)
            {
                let mut schedule = schedule.clone();
                schedule.last_run_at = Some(trigger.fired_at);
                schedule.next_run_at = trigger.next_fire_at;
                schedule.updated_at = now;
                fire_and_log("schedule.last_run", self.repo.update(&schedule)).await;
            }
        }
        Ok(fired)
    }

    /// Run [`CronScheduler::tick`] every `every` until `shutdown` flips to true.
    pub fn spawn_ticker(self: Arc<Self>, every: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        if let Err(e) = self.tick(Utc::now()).await {
                            warn!(error = %e, "cron tick failed");
                        }
                    }
                }
            }
            debug!("cron ticker stopped");
        })
    }
}
