//! Persistent store boundary: job audit mirror, dead letters, cron schedules.
//!
//! Three record shapes, three traits. Adapters:
//! - [`InMemoryStores`]: `RwLock` maps, for tests and dev.
//! - [`PostgresStores`]: sqlx over the `migrations/` schema.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use taskforge_core::{
    AuditId, BrokerJobId, CronSchedule, DeadLetterEntry, DeadLetterId, DeadLetterStats, JobAuditRecord,
    JobState, PrincipalId, ScheduleId,
};

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryStores;
pub use postgres::PostgresStores;

/// Store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// A lifecycle transition applied to a [`JobAuditRecord`].
#[derive(Debug, Clone, PartialEq)]
pub enum AuditUpdate {
    /// The broker accepted the job.
    Enqueued { broker_job_id: BrokerJobId },
    Active { started_at: DateTime<Utc> },
    Completed {
        result: JsonValue,
        attempts_made: u32,
        at: DateTime<Utc>,
    },
    /// `terminal` marks the last try: the record gets its `completed_at`.
    Failed {
        error: String,
        attempts_made: u32,
        terminal: bool,
        at: DateTime<Utc>,
    },
    /// Enqueue never reached the broker.
    Rejected { error: String, at: DateTime<Utc> },
}

impl AuditUpdate {
    /// Fold this update into a record.
    pub fn apply_to(&self, record: &mut JobAuditRecord) {
        match self {
            AuditUpdate::Enqueued { broker_job_id } => {
                record.broker_job_id = Some(broker_job_id.clone());
            }
            AuditUpdate::Active { started_at } => {
                record.state = JobState::Active;
                record.started_at = Some(*started_at);
            }
            AuditUpdate::Completed {
                result,
                attempts_made,
                at,
            } => {
                record.state = JobState::Completed;
                record.result = Some(result.clone());
                record.record_attempts(*attempts_made);
                record.completed_at = Some(*at);
            }
            AuditUpdate::Failed {
                error,
                attempts_made,
                terminal,
                at,
            } => {
                record.state = if *terminal {
                    JobState::DeadLettered
                } else {
                    JobState::Failed
                };
                record.error = Some(error.clone());
                record.record_attempts(*attempts_made);
                if *terminal {
                    record.completed_at = Some(*at);
                }
            }
            AuditUpdate::Rejected { error, at } => {
                record.state = JobState::Failed;
                record.error = Some(error.clone());
                record.completed_at = Some(*at);
            }
        }
    }
}

/// Listing filter for unresolved dead letters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterFilter {
    pub queue: Option<String>,
    pub principal: Option<PrincipalId>,
    pub limit: usize,
}

/// Default page size for dead-letter listings.
pub const DEFAULT_DEAD_LETTER_LIMIT: usize = 50;

impl Default for DeadLetterFilter {
    fn default() -> Self {
        Self {
            queue: None,
            principal: None,
            limit: DEFAULT_DEAD_LETTER_LIMIT,
        }
    }
}

impl DeadLetterFilter {
    pub fn for_queue(queue: impl Into<String>) -> Self {
        Self {
            queue: Some(queue.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, entry: &DeadLetterEntry) -> bool {
        !entry.is_resolved()
            && self.queue.as_deref().is_none_or(|q| q == entry.queue)
            && self.principal.is_none_or(|p| p == entry.principal)
    }
}

/// Job audit mirror. Writers treat every call as best-effort.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn insert(&self, record: JobAuditRecord) -> Result<AuditId, StoreError>;

    async fn get(&self, id: AuditId) -> Result<Option<JobAuditRecord>, StoreError>;

    /// Apply a transition. Missing records are `StoreError::NotFound`.
    async fn apply(&self, id: AuditId, update: AuditUpdate) -> Result<(), StoreError>;
}

/// Authoritative dead-letter records.
#[async_trait]
pub trait DeadLetterRepository: Send + Sync {
    async fn insert(&self, entry: DeadLetterEntry) -> Result<DeadLetterId, StoreError>;

    async fn get(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>, StoreError>;

    /// Unresolved entries matching `filter`, newest first.
    async fn list_unresolved(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterEntry>, StoreError>;

    /// Set `resolved_at` if it is still unset. Returns whether this call set it.
    async fn mark_resolved(&self, id: DeadLetterId, at: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Clear `resolved_at` if it still equals `at`. Undoes a claim made by
    /// [`DeadLetterRepository::mark_resolved`]; returns whether it did.
    async fn reopen(&self, id: DeadLetterId, at: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Unresolved entry already recorded for this broker job, if any.
    async fn find_unresolved_by_job(
        &self,
        queue: &str,
        broker_job_id: &BrokerJobId,
    ) -> Result<Option<DeadLetterEntry>, StoreError>;

    async fn stats(&self) -> Result<DeadLetterStats, StoreError>;
}

/// Authoritative cron schedule records, unique per `(name, owner)`.
#[async_trait]
pub trait ScheduleRepository: Send + Sync {
    /// Insert, or replace the record with the same `(name, owner)`.
    ///
    /// On replace the stored id and `created_at` are kept; the returned
    /// record is what is now persisted.
    async fn upsert(&self, schedule: CronSchedule) -> Result<CronSchedule, StoreError>;

    async fn get(&self, id: ScheduleId) -> Result<Option<CronSchedule>, StoreError>;

    async fn find_by_name(&self, name: &str, owner: PrincipalId) -> Result<Option<CronSchedule>, StoreError>;

    /// All schedules, or only `owner`'s, ordered by name.
    async fn list(&self, owner: Option<PrincipalId>) -> Result<Vec<CronSchedule>, StoreError>;

    /// Overwrite an existing record by id.
    async fn update(&self, schedule: &CronSchedule) -> Result<(), StoreError>;

    async fn delete(&self, id: ScheduleId) -> Result<bool, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskforge_core::{JobOptions, JobPayload};

    fn record() -> JobAuditRecord {
        JobAuditRecord::new("q", "j", JobPayload::new(), &JobOptions::default(), PrincipalId::new())
    }

    #[test]
    fn terminal_failure_dead_letters_and_closes_record() {
        let mut r = record();
        let at = Utc::now();
        AuditUpdate::Failed {
            error: "boom".into(),
            attempts_made: 3,
            terminal: true,
            at,
        }
        .apply_to(&mut r);
        assert_eq!(r.state, JobState::DeadLettered);
        assert_eq!(r.completed_at, Some(at));
        assert_eq!(r.attempts_made, 3);
    }

    #[test]
    fn retryable_failure_leaves_record_open() {
        let mut r = record();
        AuditUpdate::Failed {
            error: "boom".into(),
            attempts_made: 1,
            terminal: false,
            at: Utc::now(),
        }
        .apply_to(&mut r);
        assert_eq!(r.state, JobState::Failed);
        assert!(r.completed_at.is_none());
    }

    #[test]
    fn filter_skips_resolved_and_other_queues() {
        let principal = PrincipalId::new();
        let mut entry = DeadLetterEntry::new("emails", "send", BrokerJobId::new("1"), JobPayload::new(), "x", 3, principal);
        assert!(DeadLetterFilter::for_queue("emails").matches(&entry));
        assert!(!DeadLetterFilter::for_queue("billing").matches(&entry));

        entry.resolved_at = Some(Utc::now());
        assert!(!DeadLetterFilter::default().matches(&entry));
    }
}
