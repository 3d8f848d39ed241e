//! Message broker boundary.
//!
//! The broker is the single source of truth for which jobs are waiting,
//! delayed or active. Everything the services need from it is captured by
//! [`MessageBroker`]; implementations decide how to store it:
//!
//! - [`InMemoryBroker`]: process-local, used by tests and single-node dev.
//! - `RedisBroker` (feature `redis`): shared state in Redis for multi-process
//!   deployments.
//!
//! ## Retry scheduling
//!
//! `fail()` owns the retry decision: it counts the finished try, and either
//! moves the job back to `delayed` using the Backoff Calculator or leaves it
//! `failed` for good. The returned [`FailOutcome`] tells the caller which one
//! happened so it can dead-letter exhausted jobs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use taskforge_core::{AuditId, BrokerJobId, JobOptions, JobPayload, JobState};

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use in_memory::InMemoryBroker;
#[cfg(feature = "redis")]
pub use self::redis::RedisBroker;

/// Broker operation error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("job not found: {0}")]
    NotFound(BrokerJobId),

    #[error("job {0} is active and cannot be removed")]
    JobActive(BrokerJobId),

    #[error("job {0} is not active")]
    NotActive(BrokerJobId),

    #[error("invalid repeat pattern: {0}")]
    InvalidPattern(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("broker backend error: {0}")]
    Backend(String),
}

/// A job as the broker holds it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerJob {
    pub id: BrokerJobId,
    pub queue: String,
    pub name: String,
    pub payload: JobPayload,
    pub options: JobOptions,
    /// Link to the persisted audit mirror, when one was written.
    pub audit_id: Option<AuditId>,
    pub state: JobState,
    /// Finished tries so far.
    pub attempts_made: u32,
    /// Dispatch tie-breaker: FIFO among equal priority.
    pub sequence: u64,
    pub failed_reason: Option<String>,
    pub return_value: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
    /// Earliest time the job may be dispatched.
    pub ready_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl BrokerJob {
    /// Eligible for dispatch at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        matches!(self.state, JobState::Waiting | JobState::Delayed) && self.ready_at <= now
    }

    /// Dispatch order key: priority first (lower wins), then FIFO.
    pub fn dispatch_key(&self) -> (i32, u64) {
        (self.options.priority, self.sequence)
    }
}

/// Everything needed to put a job on a queue.
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueRequest {
    pub queue: String,
    pub name: String,
    pub payload: JobPayload,
    pub options: JobOptions,
    pub audit_id: Option<AuditId>,
}

impl EnqueueRequest {
    pub fn new(queue: impl Into<String>, name: impl Into<String>, payload: JobPayload, options: JobOptions) -> Self {
        Self {
            queue: queue.into(),
            name: name.into(),
            payload,
            options,
            audit_id: None,
        }
    }

    pub fn with_audit_id(mut self, audit_id: AuditId) -> Self {
        self.audit_id = Some(audit_id);
        self
    }
}

/// What `fail()` decided for a failed try.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Attempts remain; the job is delayed by `delay_ms`.
    Retrying { attempts_made: u32, delay_ms: u64 },
    /// The budget is spent; the job stays `failed`.
    Exhausted { attempts_made: u32 },
}

impl FailOutcome {
    pub fn attempts_made(&self) -> u32 {
        match self {
            FailOutcome::Retrying { attempts_made, .. } | FailOutcome::Exhausted { attempts_made } => {
                *attempts_made
            }
        }
    }
}

/// Inclusive index range for listings (`start..=end`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRange {
    pub start: usize,
    pub end: usize,
}

impl Default for JobRange {
    fn default() -> Self {
        Self { start: 0, end: 49 }
    }
}

impl JobRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Apply the range to an already ordered list.
    pub fn slice<T>(&self, items: Vec<T>) -> Vec<T> {
        if self.end < self.start {
            return Vec::new();
        }
        items
            .into_iter()
            .skip(self.start)
            .take((self.end - self.start).saturating_add(1))
            .collect()
    }
}

/// Job counts per state for one queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub paused: bool,
}

/// A recurring trigger registered with the broker.
///
/// Keyed by content (`"{job_name}:{pattern}"`), not by any external id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepeatableTrigger {
    pub key: String,
    pub queue: String,
    pub job_name: String,
    pub pattern: String,
    pub payload: JobPayload,
    pub options: JobOptions,
    pub next_fire_at: Option<DateTime<Utc>>,
}

impl RepeatableTrigger {
    pub fn new(
        queue: impl Into<String>,
        job_name: impl Into<String>,
        pattern: impl Into<String>,
        payload: JobPayload,
        options: JobOptions,
    ) -> Self {
        let job_name = job_name.into();
        let pattern = pattern.into();
        Self {
            key: taskforge_core::trigger_key(&job_name, &pattern),
            queue: queue.into(),
            job_name,
            pattern,
            payload,
            options,
            next_fire_at: None,
        }
    }
}

/// A trigger that produced a job during `fire_due_repeatables`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiredTrigger {
    pub key: String,
    pub queue: String,
    pub job_id: BrokerJobId,
    pub fired_at: DateTime<Utc>,
    pub next_fire_at: Option<DateTime<Utc>>,
}

/// Priority/delay-capable job broker.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Add a job; returns the broker-assigned id.
    async fn enqueue(&self, request: EnqueueRequest) -> Result<BrokerJobId, BrokerError>;

    /// Move the next eligible job of `queue` to `active` and return it.
    ///
    /// Eligible = waiting, or delayed with its delay elapsed. Order is
    /// priority (lower first), then FIFO. Paused queues return `None`.
    async fn pull_next(&self, queue: &str) -> Result<Option<BrokerJob>, BrokerError>;

    /// Ack an active job as completed.
    async fn complete(&self, queue: &str, id: &BrokerJobId, result: JsonValue) -> Result<(), BrokerError>;

    /// Record a failed try and schedule a retry if attempts remain.
    async fn fail(&self, queue: &str, id: &BrokerJobId, error: &str) -> Result<FailOutcome, BrokerError>;

    async fn get_job(&self, queue: &str, id: &BrokerJobId) -> Result<Option<BrokerJob>, BrokerError>;

    async fn list_jobs(&self, queue: &str, state: JobState, range: JobRange) -> Result<Vec<BrokerJob>, BrokerError>;

    /// Remove a non-active job. `Ok(false)` when it does not exist.
    async fn remove_job(&self, queue: &str, id: &BrokerJobId) -> Result<bool, BrokerError>;

    /// Stop dispatching from `queue` without dropping queued jobs.
    async fn pause(&self, queue: &str) -> Result<(), BrokerError>;

    async fn resume(&self, queue: &str) -> Result<(), BrokerError>;

    async fn is_paused(&self, queue: &str) -> Result<bool, BrokerError>;

    async fn counts(&self, queue: &str) -> Result<QueueMetrics, BrokerError>;

    /// Register a repeatable trigger. Registering an existing key is a no-op.
    async fn add_repeatable(&self, trigger: RepeatableTrigger) -> Result<(), BrokerError>;

    /// Remove a repeatable trigger by key. `Ok(false)` when absent.
    async fn remove_repeatable(&self, queue: &str, key: &str) -> Result<bool, BrokerError>;

    async fn list_repeatables(&self, queue: &str) -> Result<Vec<RepeatableTrigger>, BrokerError>;

    /// Enqueue a job for every trigger due at `now` and advance its next fire time.
    async fn fire_due_repeatables(&self, now: DateTime<Utc>) -> Result<Vec<FiredTrigger>, BrokerError>;

    /// Heartbeat for an active job: restart its stall clock.
    ///
    /// `Ok(false)` when the job is no longer active (finished, or already
    /// handed back by [`MessageBroker::recover_stalled`]).
    async fn extend_lease(&self, queue: &str, id: &BrokerJobId) -> Result<bool, BrokerError>;

    /// Return active jobs whose lease was not renewed for `stalled_after` to
    /// waiting. The interrupted try is not counted.
    async fn recover_stalled(&self, stalled_after: Duration) -> Result<usize, BrokerError>;
}

#[async_trait]
impl<B> MessageBroker for Arc<B>
where
    B: MessageBroker + ?Sized,
{
    async fn enqueue(&self, request: EnqueueRequest) -> Result<BrokerJobId, BrokerError> {
        (**self).enqueue(request).await
    }

    async fn pull_next(&self, queue: &str) -> Result<Option<BrokerJob>, BrokerError> {
        (**self).pull_next(queue).await
    }

    async fn complete(&self, queue: &str, id: &BrokerJobId, result: JsonValue) -> Result<(), BrokerError> {
        (**self).complete(queue, id, result).await
    }

    async fn fail(&self, queue: &str, id: &BrokerJobId, error: &str) -> Result<FailOutcome, BrokerError> {
        (**self).fail(queue, id, error).await
    }

    async fn get_job(&self, queue: &str, id: &BrokerJobId) -> Result<Option<BrokerJob>, BrokerError> {
        (**self).get_job(queue, id).await
    }

    async fn list_jobs(&self, queue: &str, state: JobState, range: JobRange) -> Result<Vec<BrokerJob>, BrokerError> {
        (**self).list_jobs(queue, state, range).await
    }

    async fn remove_job(&self, queue: &str, id: &BrokerJobId) -> Result<bool, BrokerError> {
        (**self).remove_job(queue, id).await
    }

    async fn pause(&self, queue: &str) -> Result<(), BrokerError> {
        (**self).pause(queue).await
    }

    async fn resume(&self, queue: &str) -> Result<(), BrokerError> {
        (**self).resume(queue).await
    }

    async fn is_paused(&self, queue: &str) -> Result<bool, BrokerError> {
        (**self).is_paused(queue).await
    }

    async fn counts(&self, queue: &str) -> Result<QueueMetrics, BrokerError> {
        (**self).counts(queue).await
    }

    async fn add_repeatable(&self, trigger: RepeatableTrigger) -> Result<(), BrokerError> {
        (**self).add_repeatable(trigger).await
    }

    async fn remove_repeatable(&self, queue: &str, key: &str) -> Result<bool, BrokerError> {
        (**self).remove_repeatable(queue, key).await
    }

    async fn list_repeatables(&self, queue: &str) -> Result<Vec<RepeatableTrigger>, BrokerError> {
        (**self).list_repeatables(queue).await
    }

    async fn fire_due_repeatables(&self, now: DateTime<Utc>) -> Result<Vec<FiredTrigger>, BrokerError> {
        (**self).fire_due_repeatables(now).await
    }

    async fn extend_lease(&self, queue: &str, id: &BrokerJobId) -> Result<bool, BrokerError> {
        (**self).extend_lease(queue, id).await
    }

    async fn recover_stalled(&self, stalled_after: Duration) -> Result<usize, BrokerError> {
        (**self).recover_stalled(stalled_after).await
    }
}
