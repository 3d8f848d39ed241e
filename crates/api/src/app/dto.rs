use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use taskforge_core::{
    AuditId, BackoffKind, BackoffPolicy, BrokerJobId, DEFAULT_MAX_ATTEMPTS, JobOptions, JobPayload, JobState,
    PrincipalId,
};
use taskforge_infra::broker::{BrokerJob, JobRange};
use taskforge_infra::queue::EnqueuedJob;
use taskforge_infra::store::DeadLetterFilter;
use taskforge_infra::side_effect::SideEffect;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Default, Deserialize)]
pub struct BackoffRequest {
    #[serde(rename = "type")]
    pub kind: Option<BackoffKind>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub jitter: Option<bool>,
}

impl BackoffRequest {
    pub fn into_policy(self) -> BackoffPolicy {
        let defaults = BackoffPolicy::default();
        BackoffPolicy {
            kind: self.kind.unwrap_or(defaults.kind),
            base_delay_ms: self.base_delay_ms.unwrap_or(defaults.base_delay_ms),
            max_delay_ms: self.max_delay_ms.unwrap_or(defaults.max_delay_ms),
            jitter: self.jitter.unwrap_or(defaults.jitter),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AddJobRequest {
    pub name: String,
    #[serde(default)]
    pub payload: JobPayload,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub delay_ms: u64,
    pub max_attempts: Option<u32>,
    pub backoff: Option<BackoffRequest>,
    pub timeout_ms: Option<u64>,
}

impl AddJobRequest {
    /// Options for a job submitted by `principal`.
    pub fn options(&mut self, principal: PrincipalId) -> JobOptions {
        let mut options = JobOptions::for_principal(principal)
            .with_priority(self.priority)
            .with_delay_ms(self.delay_ms)
            .with_max_attempts(self.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS));
        if let Some(backoff) = self.backoff.take() {
            options = options.with_backoff(backoff.into_policy());
        }
        if let Some(timeout_ms) = self.timeout_ms {
            options = options.with_timeout_ms(timeout_ms);
        }
        options
    }
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub state: Option<String>,
    pub start: Option<usize>,
    pub end: Option<usize>,
}

impl ListJobsQuery {
    pub fn state(&self) -> Result<JobState, String> {
        match self.state.as_deref() {
            None => Ok(JobState::Waiting),
            Some(raw) => raw.parse::<JobState>().map_err(|e| e.to_string()),
        }
    }

    pub fn range(&self) -> JobRange {
        let defaults = JobRange::default();
        JobRange::new(
            self.start.unwrap_or(defaults.start),
            self.end.unwrap_or(defaults.end),
        )
    }
}

#[derive(Debug, Deserialize)]
pub struct ListDeadLettersQuery {
    pub queue: Option<String>,
    pub principal: Option<String>,
    pub limit: Option<usize>,
}

impl ListDeadLettersQuery {
    pub fn filter(&self) -> Result<DeadLetterFilter, String> {
        let principal = match self.principal.as_deref() {
            None => None,
            Some(raw) => Some(raw.parse::<PrincipalId>().map_err(|e| format!("invalid principal: {e}"))?),
        };
        let defaults = DeadLetterFilter::default();
        Ok(DeadLetterFilter {
            queue: self.queue.clone(),
            principal,
            limit: self.limit.unwrap_or(defaults.limit),
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateScheduleRequest {
    pub name: String,
    pub pattern: String,
    pub queue: String,
    pub job_name: String,
    #[serde(default)]
    pub payload: JobPayload,
}

#[derive(Debug, Deserialize)]
pub struct ToggleScheduleRequest {
    pub is_active: bool,
}

#[derive(Debug, Deserialize)]
pub struct ListSchedulesQuery {
    /// Include every owner's schedules, not only the caller's.
    #[serde(default)]
    pub all: bool,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct AddJobResponse {
    pub job_id: BrokerJobId,
    pub audit_id: Option<AuditId>,
    pub audit: SideEffect<AuditId>,
}

impl From<EnqueuedJob> for AddJobResponse {
    fn from(job: EnqueuedJob) -> Self {
        Self {
            job_id: job.job_id.clone(),
            audit_id: job.audit_id(),
            audit: job.audit,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub id: BrokerJobId,
    pub queue: String,
    pub name: String,
    pub state: JobState,
    pub payload: JobPayload,
    pub priority: i32,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub audit_id: Option<AuditId>,
    pub failed_reason: Option<String>,
    pub return_value: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
    pub ready_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<BrokerJob> for JobResponse {
    fn from(job: BrokerJob) -> Self {
        Self {
            priority: job.options.priority,
            max_attempts: job.options.max_attempts,
            id: job.id,
            queue: job.queue,
            name: job.name,
            state: job.state,
            payload: job.payload,
            attempts_made: job.attempts_made,
            audit_id: job.audit_id,
            failed_reason: job.failed_reason,
            return_value: job.return_value,
            created_at: job.created_at,
            ready_at: job.ready_at,
            processed_at: job.processed_at,
            finished_at: job.finished_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn add_job_request_fills_defaults() {
        let mut req: AddJobRequest = serde_json::from_value(json!({ "name": "send" })).unwrap();
        let principal = PrincipalId::new();
        let options = req.options(principal);
        assert_eq!(options.principal, Some(principal));
        assert_eq!(options.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(options.backoff, BackoffPolicy::default());
        assert!(req.payload.is_empty());
    }

    #[test]
    fn partial_backoff_keeps_other_defaults() {
        let mut req: AddJobRequest = serde_json::from_value(json!({
            "name": "send",
            "backoff": { "base_delay_ms": 100, "jitter": false }
        }))
        .unwrap();
        let backoff = req.options(PrincipalId::new()).backoff;
        assert_eq!(backoff.base_delay_ms, 100);
        assert!(!backoff.jitter);
        assert_eq!(backoff.max_delay_ms, BackoffPolicy::default().max_delay_ms);
    }

    #[test]
    fn list_query_parses_state_and_range() {
        let q = ListJobsQuery {
            state: Some("dead_lettered".into()),
            start: Some(5),
            end: None,
        };
        assert_eq!(q.state(), Ok(JobState::DeadLettered));
        assert_eq!(q.range(), JobRange::new(5, 49));
        let bad = ListJobsQuery { state: Some("done".into()), start: None, end: None };
        assert!(bad.state().is_err());
    }
}
