//! In-memory broker for tests and single-process deployments.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use taskforge_core::{BrokerJobId, CronPattern, JobState, retry_delay_after, should_retry};

use super::{
    BrokerError, BrokerJob, EnqueueRequest, FailOutcome, FiredTrigger, JobRange, MessageBroker,
    QueueMetrics, RepeatableTrigger,
};

/// Completed jobs kept per queue before the oldest are purged.
pub const DEFAULT_KEEP_COMPLETED: usize = 1_000;

#[derive(Debug, Default)]
struct QueueState {
    jobs: HashMap<BrokerJobId, BrokerJob>,
    paused: bool,
    repeatables: BTreeMap<String, RepeatableTrigger>,
    completed: VecDeque<BrokerJobId>,
    /// Last heartbeat of each active job.
    leases: HashMap<BrokerJobId, DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Inner {
    queues: HashMap<String, QueueState>,
    next_id: u64,
    next_sequence: u64,
}

impl Inner {
    fn queue_mut(&mut self, queue: &str) -> &mut QueueState {
        self.queues.entry(queue.to_string()).or_default()
    }

    fn insert(&mut self, request: EnqueueRequest, now: DateTime<Utc>) -> BrokerJobId {
        self.next_id += 1;
        self.next_sequence += 1;
        let id = BrokerJobId::new(self.next_id.to_string());
        let ready_at = after_ms(now, request.options.delay_ms);
        let job = BrokerJob {
            id: id.clone(),
            queue: request.queue.clone(),
            name: request.name,
            state: request.options.initial_state(),
            payload: request.payload,
            options: request.options,
            audit_id: request.audit_id,
            attempts_made: 0,
            sequence: self.next_sequence,
            failed_reason: None,
            return_value: None,
            created_at: now,
            ready_at,
            processed_at: None,
            finished_at: None,
        };
        self.queue_mut(&request.queue).jobs.insert(id.clone(), job);
        id
    }
}

/// `now + ms`, saturating at the latest representable instant.
pub(crate) fn after_ms(now: DateTime<Utc>, ms: u64) -> DateTime<Utc> {
    i64::try_from(ms)
        .ok()
        .and_then(chrono::Duration::try_milliseconds)
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// State a job reports to readers: a delayed job whose delay elapsed counts
/// as waiting.
fn visible_state(job: &BrokerJob, now: DateTime<Utc>) -> JobState {
    match job.state {
        JobState::Delayed if job.ready_at <= now => JobState::Waiting,
        other => other,
    }
}

/// Process-local [`MessageBroker`].
///
/// Job ids are sequential strings (`"1"`, `"2"`, ...) shared across queues.
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    inner: Arc<Mutex<Inner>>,
    keep_completed: usize,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            keep_completed: DEFAULT_KEEP_COMPLETED,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Keep at most `keep_completed` completed jobs per queue.
    pub fn with_retention(mut self, keep_completed: usize) -> Self {
        self.keep_completed = keep_completed;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn active_job<'a>(
        inner: &'a mut Inner,
        queue: &str,
        id: &BrokerJobId,
    ) -> Result<&'a mut BrokerJob, BrokerError> {
        let job = inner
            .queues
            .get_mut(queue)
            .and_then(|q| q.jobs.get_mut(id))
            .ok_or_else(|| BrokerError::NotFound(id.clone()))?;
        if job.state != JobState::Active {
            return Err(BrokerError::NotActive(id.clone()));
        }
        Ok(job)
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<BrokerJobId, BrokerError> {
        let queue = request.queue.clone();
        let id = self.lock().insert(request, Utc::now());
        debug!(queue = %queue, job_id = %id, "job enqueued");
        Ok(id)
    }

    async fn pull_next(&self, queue: &str) -> Result<Option<BrokerJob>, BrokerError> {
        let now = Utc::now();
        let mut inner = self.lock();
        let Some(state) = inner.queues.get_mut(queue) else {
            return Ok(None);
        };
        if state.paused {
            return Ok(None);
        }

        let next = state
            .jobs
            .values()
            .filter(|job| job.is_ready(now))
            .min_by_key(|job| job.dispatch_key())
            .map(|job| job.id.clone());

        let Some(job) = next.and_then(|id| state.jobs.get_mut(&id)) else {
            return Ok(None);
        };
        job.state = JobState::Active;
        job.processed_at = Some(now);
        let job = job.clone();
        state.leases.insert(job.id.clone(), now);
        Ok(Some(job))
    }

    async fn complete(&self, queue: &str, id: &BrokerJobId, result: JsonValue) -> Result<(), BrokerError> {
        let now = Utc::now();
        let mut inner = self.lock();
        let job = Self::active_job(&mut inner, queue, id)?;
        job.state = JobState::Completed;
        job.attempts_made += 1;
        job.return_value = Some(result);
        job.finished_at = Some(now);

        let state = inner.queue_mut(queue);
        state.leases.remove(id);
        state.completed.push_back(id.clone());
        while state.completed.len() > self.keep_completed {
            if let Some(old) = state.completed.pop_front() {
                state.jobs.remove(&old);
            }
        }
        Ok(())
    }

    async fn fail(&self, queue: &str, id: &BrokerJobId, error: &str) -> Result<FailOutcome, BrokerError> {
        let now = Utc::now();
        let mut inner = self.lock();
        if let Some(state) = inner.queues.get_mut(queue) {
            state.leases.remove(id);
        }
        let job = Self::active_job(&mut inner, queue, id)?;
        job.attempts_made += 1;
        job.failed_reason = Some(error.to_string());
        job.processed_at = None;

        if should_retry(job.attempts_made, job.options.max_attempts) {
            let delay_ms = retry_delay_after(job.attempts_made, &job.options.backoff);
            job.state = if delay_ms > 0 {
                JobState::Delayed
            } else {
                JobState::Waiting
            };
            job.ready_at = after_ms(now, delay_ms);
            debug!(queue = %queue, job_id = %id, attempts_made = job.attempts_made, delay_ms, "retry scheduled");
            Ok(FailOutcome::Retrying {
                attempts_made: job.attempts_made,
                delay_ms,
            })
        } else {
            job.state = JobState::Failed;
            job.finished_at = Some(now);
            Ok(FailOutcome::Exhausted {
                attempts_made: job.attempts_made,
            })
        }
    }

    async fn get_job(&self, queue: &str, id: &BrokerJobId) -> Result<Option<BrokerJob>, BrokerError> {
        let now = Utc::now();
        let inner = self.lock();
        Ok(inner
            .queues
            .get(queue)
            .and_then(|q| q.jobs.get(id))
            .map(|job| {
                let mut job = job.clone();
                job.state = visible_state(&job, now);
                job
            }))
    }

    async fn list_jobs(&self, queue: &str, state: JobState, range: JobRange) -> Result<Vec<BrokerJob>, BrokerError> {
        let now = Utc::now();
        let inner = self.lock();
        let Some(q) = inner.queues.get(queue) else {
            return Ok(Vec::new());
        };

        let mut jobs: Vec<BrokerJob> = q
            .jobs
            .values()
            .filter(|job| visible_state(job, now) == state)
            .cloned()
            .map(|mut job| {
                job.state = state;
                job
            })
            .collect();

        match state {
            JobState::Waiting => jobs.sort_by_key(|j| j.dispatch_key()),
            JobState::Delayed => jobs.sort_by_key(|j| (j.ready_at, j.sequence)),
            JobState::Active => jobs.sort_by_key(|j| (j.processed_at, j.sequence)),
            _ => jobs.sort_by(|a, b| b.finished_at.cmp(&a.finished_at).then(b.sequence.cmp(&a.sequence))),
        }
        Ok(range.slice(jobs))
    }

    async fn remove_job(&self, queue: &str, id: &BrokerJobId) -> Result<bool, BrokerError> {
        let mut inner = self.lock();
        let Some(q) = inner.queues.get_mut(queue) else {
            return Ok(false);
        };
        match q.jobs.get(id) {
            None => Ok(false),
            Some(job) if job.state == JobState::Active => Err(BrokerError::JobActive(id.clone())),
            Some(_) => {
                q.jobs.remove(id);
                q.completed.retain(|c| c != id);
                Ok(true)
            }
        }
    }

    async fn pause(&self, queue: &str) -> Result<(), BrokerError> {
        self.lock().queue_mut(queue).paused = true;
        info!(queue = %queue, "queue paused");
        Ok(())
    }

    async fn resume(&self, queue: &str) -> Result<(), BrokerError> {
        self.lock().queue_mut(queue).paused = false;
        info!(queue = %queue, "queue resumed");
        Ok(())
    }

    async fn is_paused(&self, queue: &str) -> Result<bool, BrokerError> {
        Ok(self.lock().queues.get(queue).is_some_and(|q| q.paused))
    }

    async fn counts(&self, queue: &str) -> Result<QueueMetrics, BrokerError> {
        let now = Utc::now();
        let inner = self.lock();
        let mut metrics = QueueMetrics::default();
        let Some(q) = inner.queues.get(queue) else {
            return Ok(metrics);
        };
        metrics.paused = q.paused;
        for job in q.jobs.values() {
            match visible_state(job, now) {
                JobState::Waiting => metrics.waiting += 1,
                JobState::Delayed => metrics.delayed += 1,
                JobState::Active => metrics.active += 1,
                JobState::Completed => metrics.completed += 1,
                JobState::Failed | JobState::DeadLettered => metrics.failed += 1,
            }
        }
        Ok(metrics)
    }

    async fn add_repeatable(&self, mut trigger: RepeatableTrigger) -> Result<(), BrokerError> {
        let pattern = CronPattern::parse(&trigger.pattern)
            .map_err(|e| BrokerError::InvalidPattern(e.to_string()))?;
        let mut inner = self.lock();
        let q = inner.queue_mut(&trigger.queue);
        if q.repeatables.contains_key(&trigger.key) {
            debug!(queue = %trigger.queue, key = %trigger.key, "repeatable already registered");
            return Ok(());
        }
        trigger.next_fire_at = pattern.next_after(Utc::now());
        q.repeatables.insert(trigger.key.clone(), trigger);
        Ok(())
    }

    async fn remove_repeatable(&self, queue: &str, key: &str) -> Result<bool, BrokerError> {
        let mut inner = self.lock();
        Ok(inner
            .queues
            .get_mut(queue)
            .is_some_and(|q| q.repeatables.remove(key).is_some()))
    }

    async fn list_repeatables(&self, queue: &str) -> Result<Vec<RepeatableTrigger>, BrokerError> {
        let inner = self.lock();
        Ok(inner
            .queues
            .get(queue)
            .map(|q| q.repeatables.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn fire_due_repeatables(&self, now: DateTime<Utc>) -> Result<Vec<FiredTrigger>, BrokerError> {
        let mut inner = self.lock();

        let due: Vec<RepeatableTrigger> = inner
            .queues
            .values()
            .flat_map(|q| q.repeatables.values())
            .filter(|t| t.next_fire_at.is_some_and(|at| at <= now))
            .cloned()
            .collect();

        let mut fired = Vec::with_capacity(due.len());
        for trigger in due {
            let mut options = trigger.options.clone();
            options.delay_ms = 0;
            let request = EnqueueRequest::new(&trigger.queue, &trigger.job_name, trigger.payload.clone(), options);
            let job_id = inner.insert(request, now);

            // Missed periods collapse into this one firing.
            let next_fire_at = match CronPattern::parse(&trigger.pattern) {
                Ok(pattern) => pattern.next_after(now),
                Err(e) => {
                    warn!(key = %trigger.key, error = %e, "repeatable has an unparsable pattern");
                    None
                }
            };
            if let Some(stored) = inner.queue_mut(&trigger.queue).repeatables.get_mut(&trigger.key) {
                stored.next_fire_at = next_fire_at;
            }

            fired.push(FiredTrigger {
                key: trigger.key,
                queue: trigger.queue,
                job_id,
                fired_at: now,
                next_fire_at,
            });
        }
        Ok(fired)
    }

    async fn extend_lease(&self, queue: &str, id: &BrokerJobId) -> Result<bool, BrokerError> {
        let now = Utc::now();
        let mut inner = self.lock();
        let Some(state) = inner.queues.get_mut(queue) else {
            return Ok(false);
        };
        let active = state.jobs.get(id).is_some_and(|job| job.state == JobState::Active);
        if active {
            state.leases.insert(id.clone(), now);
        }
        Ok(active)
    }

    async fn recover_stalled(&self, stalled_after: Duration) -> Result<usize, BrokerError> {
        let now = Utc::now();
        let threshold = chrono::Duration::from_std(stalled_after).unwrap_or(chrono::Duration::MAX);
        let mut inner = self.lock();
        let mut recovered = 0;
        for (queue, state) in inner.queues.iter_mut() {
            let leases = &mut state.leases;
            for job in state.jobs.values_mut() {
                if job.state != JobState::Active {
                    continue;
                }
                let heartbeat = leases.get(&job.id).copied().or(job.processed_at);
                if heartbeat.is_some_and(|at| now - at >= threshold) {
                    warn!(queue = %queue, job_id = %job.id, "stalled job returned to waiting");
                    job.state = JobState::Waiting;
                    job.ready_at = now;
                    job.processed_at = None;
                    leases.remove(&job.id);
                    recovered += 1;
                }
            }
        }
        Ok(recovered)
    }
}
