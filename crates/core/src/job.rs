//! Job submission options, lifecycle states and the persisted audit mirror.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::backoff::BackoffPolicy;
use crate::error::{DomainError, DomainResult};
use crate::id::{AuditId, BrokerJobId, PrincipalId};

/// Opaque key/value payload handed to the job handler.
pub type JobPayload = serde_json::Map<String, JsonValue>;

/// Default try budget for a new job.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Job lifecycle state.
///
/// `waiting → active → {completed | failed}`; a failed job with budget left
/// returns to `delayed`/`waiting`, otherwise it ends `dead_lettered`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    /// Sub-state of waiting: not eligible until its delay elapses.
    Delayed,
    Active,
    Completed,
    Failed,
    DeadLettered,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::DeadLettered => "dead_lettered",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::DeadLettered)
    }
}

impl core::fmt::Display for JobState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobState::Waiting),
            "delayed" => Ok(JobState::Delayed),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "dead_lettered" => Ok(JobState::DeadLettered),
            other => Err(DomainError::validation(format!("unknown job state '{other}'"))),
        }
    }
}

/// Options accepted when enqueueing a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Lower number = dispatched first.
    #[serde(default)]
    pub priority: i32,
    /// Milliseconds before the job becomes eligible.
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: BackoffPolicy,
    /// Submitting principal (required at enqueue time).
    #[serde(default)]
    pub principal: Option<PrincipalId>,
    /// Per-try handler deadline; a timeout counts as a failed try.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            delay_ms: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: BackoffPolicy::default(),
            principal: None,
            timeout_ms: None,
        }
    }
}

impl JobOptions {
    pub fn for_principal(principal: PrincipalId) -> Self {
        Self {
            principal: Some(principal),
            ..Self::default()
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// State the job starts in once enqueued.
    pub fn initial_state(&self) -> JobState {
        if self.delay_ms > 0 {
            JobState::Delayed
        } else {
            JobState::Waiting
        }
    }

    /// Validate before anything touches the broker or the store.
    pub fn validate(&self) -> DomainResult<PrincipalId> {
        let principal = self
            .principal
            .ok_or_else(|| DomainError::validation("submitting principal is required"))?;
        if self.max_attempts == 0 {
            return Err(DomainError::validation("max_attempts must be at least 1"));
        }
        if self.timeout_ms == Some(0) {
            return Err(DomainError::validation("timeout_ms must be positive"));
        }
        Ok(principal)
    }
}

/// Persisted, best-effort mirror of a job's lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobAuditRecord {
    pub id: AuditId,
    /// Filled in once the broker accepted the job.
    pub broker_job_id: Option<BrokerJobId>,
    pub queue: String,
    pub job_name: String,
    pub payload: JobPayload,
    pub priority: i32,
    pub max_attempts: u32,
    pub attempts_made: u32,
    pub state: JobState,
    pub result: Option<JsonValue>,
    pub error: Option<String>,
    pub principal: PrincipalId,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobAuditRecord {
    pub fn new(
        queue: impl Into<String>,
        job_name: impl Into<String>,
        payload: JobPayload,
        options: &JobOptions,
        principal: PrincipalId,
    ) -> Self {
        Self {
            id: AuditId::new(),
            broker_job_id: None,
            queue: queue.into(),
            job_name: job_name.into(),
            payload,
            priority: options.priority,
            max_attempts: options.max_attempts,
            attempts_made: 0,
            state: options.initial_state(),
            result: None,
            error: None,
            principal,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Attempts only ever grow, even if hooks arrive out of order.
    pub fn record_attempts(&mut self, attempts_made: u32) {
        self.attempts_made = self.attempts_made.max(attempts_made);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let options = JobOptions::default();
        assert_eq!(options.priority, 0);
        assert_eq!(options.delay_ms, 0);
        assert_eq!(options.max_attempts, 3);
        assert_eq!(options.backoff, BackoffPolicy::default());
        assert_eq!(options.initial_state(), JobState::Waiting);
    }

    #[test]
    fn delayed_jobs_start_delayed() {
        let options = JobOptions::for_principal(PrincipalId::new()).with_delay_ms(500);
        assert_eq!(options.initial_state(), JobState::Delayed);
    }

    #[test]
    fn principal_is_required() {
        assert!(matches!(
            JobOptions::default().validate(),
            Err(DomainError::Validation(_))
        ));
        let principal = PrincipalId::new();
        assert_eq!(JobOptions::for_principal(principal).validate(), Ok(principal));
    }

    #[test]
    fn zero_attempt_budget_is_rejected() {
        let options = JobOptions::for_principal(PrincipalId::new()).with_max_attempts(0);
        assert!(options.validate().is_err());
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let options: JobOptions = serde_json::from_str(r#"{"priority": 5}"#).unwrap();
        assert_eq!(options.priority, 5);
        assert_eq!(options.max_attempts, 3);
        assert!(options.backoff.jitter);
    }

    #[test]
    fn attempts_never_decrease() {
        let mut record = JobAuditRecord::new(
            "q",
            "j",
            JobPayload::new(),
            &JobOptions::default(),
            PrincipalId::new(),
        );
        record.record_attempts(2);
        record.record_attempts(1);
        assert_eq!(record.attempts_made, 2);
    }

    #[test]
    fn state_parses_from_wire_name() {
        assert_eq!("dead_lettered".parse::<JobState>(), Ok(JobState::DeadLettered));
        assert!("paused".parse::<JobState>().is_err());
    }
}
