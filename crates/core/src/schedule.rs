//! Recurring trigger definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{PrincipalId, ScheduleId};
use crate::job::JobPayload;

/// A persisted cron schedule, unique per `(name, owner)`.
///
/// While `is_active` is true a matching repeatable trigger is registered in
/// the broker; deactivation removes the trigger but keeps this record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronSchedule {
    pub id: ScheduleId,
    pub name: String,
    pub owner: PrincipalId,
    pub pattern: String,
    pub queue: String,
    pub job_name: String,
    pub payload: JobPayload,
    pub is_active: bool,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CronSchedule {
    pub fn new(
        name: impl Into<String>,
        owner: PrincipalId,
        pattern: impl Into<String>,
        queue: impl Into<String>,
        job_name: impl Into<String>,
        payload: JobPayload,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ScheduleId::new(),
            name: name.into(),
            owner,
            pattern: pattern.into(),
            queue: queue.into(),
            job_name: job_name.into(),
            payload,
            is_active: true,
            next_run_at: None,
            last_run_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Key the broker uses for this schedule's repeatable trigger.
    ///
    /// Brokers key repeats by content, so this is derived from the job name
    /// and pattern rather than from the schedule id.
    pub fn trigger_key(&self) -> String {
        trigger_key(&self.job_name, &self.pattern)
    }
}

/// Content key of a repeatable trigger.
pub fn trigger_key(job_name: &str, pattern: &str) -> String {
    format!("{job_name}:{pattern}")
}
