//! `taskforge-core`: job queue domain building blocks.
//!
//! This crate contains **pure** primitives (no infrastructure concerns): typed
//! identifiers, the error model, retry backoff math, the cron planner and the
//! record shapes shared by the broker, the stores and the services.

pub mod backoff;
pub mod cron;
pub mod dead_letter;
pub mod error;
pub mod id;
pub mod job;
pub mod schedule;

pub use backoff::{BackoffKind, BackoffPolicy, compute_delay, compute_delay_with, retry_delay_after, should_retry};
pub use cron::{CronPattern, compute_next_run, is_valid_pattern};
pub use dead_letter::{DeadLetterEntry, DeadLetterStats};
pub use error::{DomainError, DomainResult};
pub use id::{AuditId, BrokerJobId, DeadLetterId, PrincipalId, ScheduleId};
pub use job::{DEFAULT_MAX_ATTEMPTS, JobAuditRecord, JobOptions, JobPayload, JobState};
pub use schedule::{CronSchedule, trigger_key};
