//! Permanent failure records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{BrokerJobId, DeadLetterId, PrincipalId};
use crate::job::JobPayload;

/// A job that exhausted its attempts.
///
/// `resolved_at` is set exactly once, by manual resolution or by a
/// successful requeue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: DeadLetterId,
    pub queue: String,
    pub job_name: String,
    pub broker_job_id: BrokerJobId,
    pub payload: JobPayload,
    pub error: String,
    pub attempts_made: u32,
    pub principal: PrincipalId,
    pub failed_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl DeadLetterEntry {
    pub fn new(
        queue: impl Into<String>,
        job_name: impl Into<String>,
        broker_job_id: BrokerJobId,
        payload: JobPayload,
        error: impl Into<String>,
        attempts_made: u32,
        principal: PrincipalId,
    ) -> Self {
        Self {
            id: DeadLetterId::new(),
            queue: queue.into(),
            job_name: job_name.into(),
            broker_job_id,
            payload,
            error: error.into(),
            attempts_made,
            principal,
            failed_at: Utc::now(),
            resolved_at: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}

/// Counters for dashboards and alerting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterStats {
    pub total: u64,
    pub unresolved: u64,
    /// Unresolved entries per queue.
    pub by_queue: BTreeMap<String, u64>,
}

impl DeadLetterStats {
    /// Fold a set of entries into counters.
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a DeadLetterEntry>) -> Self {
        let mut stats = Self::default();
        for entry in entries {
            stats.total += 1;
            if !entry.is_resolved() {
                stats.unresolved += 1;
                *stats.by_queue.entry(entry.queue.clone()).or_insert(0) += 1;
            }
        }
        stats
    }
}
