//! Postgres-backed stores.
//!
//! Schema lives in `migrations/0001_taskforge.sql`; [`PostgresStores::migrate`]
//! applies it idempotently.
//!
//! ## Error mapping
//!
//! | SQLx error | Code | StoreError |
//! |------------|------|------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (other) | any | `Backend` |
//! | RowNotFound | n/a | `NotFound` |
//! | PoolClosed / Io / other | n/a | `Backend` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use taskforge_core::{
    AuditId, BrokerJobId, CronSchedule, DeadLetterEntry, DeadLetterId, DeadLetterStats, JobAuditRecord,
    JobPayload, JobState, PrincipalId, ScheduleId,
};

use super::{AuditStore, AuditUpdate, DeadLetterFilter, DeadLetterRepository, ScheduleRepository, StoreError};

const SCHEMA: &str = include_str!("../../migrations/0001_taskforge.sql");

/// All three stores over one connection pool.
#[derive(Debug, Clone)]
pub struct PostgresStores {
    pool: Arc<PgPool>,
}

impl PostgresStores {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    /// Connect with a small default pool.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create tables and indexes if missing.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Conflict(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::RowNotFound => StoreError::NotFound(format!("row not found in {operation}")),
        sqlx::Error::PoolClosed => StoreError::Backend(format!("connection pool closed in {operation}")),
        other => StoreError::Backend(format!("sqlx error in {operation}: {other}")),
    }
}

fn payload_value(payload: &JobPayload) -> JsonValue {
    JsonValue::Object(payload.clone())
}

fn payload_from(value: JsonValue) -> JobPayload {
    match value {
        JsonValue::Object(map) => map,
        _ => JobPayload::new(),
    }
}

fn to_i32(n: u32) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

fn to_u32(n: i32) -> u32 {
    u32::try_from(n).unwrap_or(0)
}

// SQLx row types

#[derive(Debug)]
struct AuditRow {
    id: Uuid,
    broker_job_id: Option<String>,
    queue: String,
    job_name: String,
    payload: JsonValue,
    priority: i32,
    max_attempts: i32,
    attempts_made: i32,
    state: String,
    result: Option<JsonValue>,
    error: Option<String>,
    principal_id: Uuid,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for AuditRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(AuditRow {
            id: row.try_get("id")?,
            broker_job_id: row.try_get("broker_job_id")?,
            queue: row.try_get("queue")?,
            job_name: row.try_get("job_name")?,
            payload: row.try_get("payload")?,
            priority: row.try_get("priority")?,
            max_attempts: row.try_get("max_attempts")?,
            attempts_made: row.try_get("attempts_made")?,
            state: row.try_get("state")?,
            result: row.try_get("result")?,
            error: row.try_get("error")?,
            principal_id: row.try_get("principal_id")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }
}

impl TryFrom<AuditRow> for JobAuditRecord {
    type Error = StoreError;

    fn try_from(row: AuditRow) -> Result<Self, Self::Error> {
        let state: JobState = row
            .state
            .parse()
            .map_err(|e| StoreError::Backend(format!("bad audit state: {e}")))?;
        Ok(JobAuditRecord {
            id: AuditId::from_uuid(row.id),
            broker_job_id: row.broker_job_id.map(BrokerJobId::new),
            queue: row.queue,
            job_name: row.job_name,
            payload: payload_from(row.payload),
            priority: row.priority,
            max_attempts: to_u32(row.max_attempts),
            attempts_made: to_u32(row.attempts_made),
            state,
            result: row.result,
            error: row.error,
            principal: PrincipalId::from_uuid(row.principal_id),
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(Debug)]
struct DeadLetterRow {
    id: Uuid,
    queue: String,
    job_name: String,
    broker_job_id: String,
    payload: JsonValue,
    error: String,
    attempts_made: i32,
    principal_id: Uuid,
    failed_at: DateTime<Utc>,
    resolved_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for DeadLetterRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(DeadLetterRow {
            id: row.try_get("id")?,
            queue: row.try_get("queue")?,
            job_name: row.try_get("job_name")?,
            broker_job_id: row.try_get("broker_job_id")?,
            payload: row.try_get("payload")?,
            error: row.try_get("error")?,
            attempts_made: row.try_get("attempts_made")?,
            principal_id: row.try_get("principal_id")?,
            failed_at: row.try_get("failed_at")?,
            resolved_at: row.try_get("resolved_at")?,
        })
    }
}

impl From<DeadLetterRow> for DeadLetterEntry {
    fn from(row: DeadLetterRow) -> Self {
        DeadLetterEntry {
            id: DeadLetterId::from_uuid(row.id),
            queue: row.queue,
            job_name: row.job_name,
            broker_job_id: BrokerJobId::new(row.broker_job_id),
            payload: payload_from(row.payload),
            error: row.error,
            attempts_made: to_u32(row.attempts_made),
            principal: PrincipalId::from_uuid(row.principal_id),
            failed_at: row.failed_at,
            resolved_at: row.resolved_at,
        }
    }
}

#[derive(Debug)]
struct ScheduleRow {
    id: Uuid,
    name: String,
    owner_id: Uuid,
    pattern: String,
    queue: String,
    job_name: String,
    payload: JsonValue,
    is_active: bool,
    next_run_at: Option<DateTime<Utc>>,
    last_run_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for ScheduleRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(ScheduleRow {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            owner_id: row.try_get("owner_id")?,
            pattern: row.try_get("pattern")?,
            queue: row.try_get("queue")?,
            job_name: row.try_get("job_name")?,
            payload: row.try_get("payload")?,
            is_active: row.try_get("is_active")?,
            next_run_at: row.try_get("next_run_at")?,
            last_run_at: row.try_get("last_run_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl From<ScheduleRow> for CronSchedule {
    fn from(row: ScheduleRow) -> Self {
        CronSchedule {
            id: ScheduleId::from_uuid(row.id),
            name: row.name,
            owner: PrincipalId::from_uuid(row.owner_id),
            pattern: row.pattern,
            queue: row.queue,
            job_name: row.job_name,
            payload: payload_from(row.payload),
            is_active: row.is_active,
            next_run_at: row.next_run_at,
            last_run_at: row.last_run_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

const DEAD_LETTER_COLUMNS: &str =
    "id, queue, job_name, broker_job_id, payload, error, attempts_made, principal_id, failed_at, resolved_at";

const SCHEDULE_COLUMNS: &str = "id, name, owner_id, pattern, queue, job_name, payload, is_active, \
     next_run_at, last_run_at, created_at, updated_at";

#[async_trait]
impl AuditStore for PostgresStores {
    #[instrument(skip(self, record), fields(audit_id = %record.id, queue = %record.queue), err)]
    async fn insert(&self, record: JobAuditRecord) -> Result<AuditId, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO job_audits (
                id, broker_job_id, queue, job_name, payload, priority, max_attempts,
                attempts_made, state, result, error, principal_id, created_at, started_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(record.broker_job_id.as_ref().map(|id| id.as_str().to_string()))
        .bind(&record.queue)
        .bind(&record.job_name)
        .bind(payload_value(&record.payload))
        .bind(record.priority)
        .bind(to_i32(record.max_attempts))
        .bind(to_i32(record.attempts_made))
        .bind(record.state.as_str())
        .bind(&record.result)
        .bind(&record.error)
        .bind(record.principal.as_uuid())
        .bind(record.created_at)
        .bind(record.started_at)
        .bind(record.completed_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("audit_insert", e))?;
        Ok(record.id)
    }

    async fn get(&self, id: AuditId) -> Result<Option<JobAuditRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM job_audits WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("audit_get", e))?;
        row.map(|row| {
            AuditRow::from_row(&row)
                .map_err(|e| StoreError::Backend(format!("failed to deserialize audit row: {e}")))
                .and_then(JobAuditRecord::try_from)
        })
        .transpose()
    }

    #[instrument(skip(self, update), fields(audit_id = %id), err)]
    async fn apply(&self, id: AuditId, update: AuditUpdate) -> Result<(), StoreError> {
        let query = match &update {
            AuditUpdate::Enqueued { broker_job_id } => {
                sqlx::query("UPDATE job_audits SET broker_job_id = $2 WHERE id = $1")
                    .bind(id.as_uuid())
                    .bind(broker_job_id.as_str().to_string())
            }
            AuditUpdate::Active { started_at } => {
                sqlx::query("UPDATE job_audits SET state = $2, started_at = $3 WHERE id = $1")
                    .bind(id.as_uuid())
                    .bind(JobState::Active.as_str())
                    .bind(*started_at)
            }
            AuditUpdate::Completed {
                result,
                attempts_made,
                at,
            } => sqlx::query(
                r#"
                UPDATE job_audits
                SET state = $2, result = $3, attempts_made = GREATEST(attempts_made, $4), completed_at = $5
                WHERE id = $1
                "#,
            )
            .bind(id.as_uuid())
            .bind(JobState::Completed.as_str())
            .bind(result.clone())
            .bind(to_i32(*attempts_made))
            .bind(*at),
            AuditUpdate::Failed {
                error,
                attempts_made,
                terminal,
                at,
            } => {
                let state = if *terminal {
                    JobState::DeadLettered
                } else {
                    JobState::Failed
                };
                sqlx::query(
                    r#"
                    UPDATE job_audits
                    SET state = $2, error = $3, attempts_made = GREATEST(attempts_made, $4),
                        completed_at = COALESCE($5, completed_at)
                    WHERE id = $1
                    "#,
                )
                .bind(id.as_uuid())
                .bind(state.as_str())
                .bind(error.clone())
                .bind(to_i32(*attempts_made))
                .bind(terminal.then_some(*at))
            }
            AuditUpdate::Rejected { error, at } => sqlx::query(
                "UPDATE job_audits SET state = $2, error = $3, completed_at = $4 WHERE id = $1",
            )
            .bind(id.as_uuid())
            .bind(JobState::Failed.as_str())
            .bind(error.clone())
            .bind(*at),
        };

        let result = query
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("audit_apply", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("audit {id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl DeadLetterRepository for PostgresStores {
    #[instrument(skip(self, entry), fields(queue = %entry.queue, broker_job_id = %entry.broker_job_id), err)]
    async fn insert(&self, entry: DeadLetterEntry) -> Result<DeadLetterId, StoreError> {
        sqlx::query(&format!(
            "INSERT INTO dead_letters ({DEAD_LETTER_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"
        ))
        .bind(entry.id.as_uuid())
        .bind(&entry.queue)
        .bind(&entry.job_name)
        .bind(entry.broker_job_id.as_str())
        .bind(payload_value(&entry.payload))
        .bind(&entry.error)
        .bind(to_i32(entry.attempts_made))
        .bind(entry.principal.as_uuid())
        .bind(entry.failed_at)
        .bind(entry.resolved_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("dead_letter_insert", e))?;
        Ok(entry.id)
    }

    async fn get(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>, StoreError> {
        let row = sqlx::query(&format!("SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("dead_letter_get", e))?;
        row.map(|row| {
            DeadLetterRow::from_row(&row)
                .map(DeadLetterEntry::from)
                .map_err(|e| StoreError::Backend(format!("failed to deserialize dead letter row: {e}")))
        })
        .transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_unresolved(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {DEAD_LETTER_COLUMNS}
            FROM dead_letters
            WHERE resolved_at IS NULL
              AND ($1::text IS NULL OR queue = $1)
              AND ($2::uuid IS NULL OR principal_id = $2)
            ORDER BY failed_at DESC, id DESC
            LIMIT $3
            "#
        ))
        .bind(filter.queue.as_deref())
        .bind(filter.principal.map(|p| *p.as_uuid()))
        .bind(i64::try_from(filter.limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("dead_letter_list", e))?;

        rows.iter()
            .map(|row| {
                DeadLetterRow::from_row(row)
                    .map(DeadLetterEntry::from)
                    .map_err(|e| StoreError::Backend(format!("failed to deserialize dead letter row: {e}")))
            })
            .collect()
    }

    #[instrument(skip(self), fields(entry_id = %id), err)]
    async fn mark_resolved(&self, id: DeadLetterId, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE dead_letters SET resolved_at = $2 WHERE id = $1 AND resolved_at IS NULL")
            .bind(id.as_uuid())
            .bind(at)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("dead_letter_resolve", e))?;
        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match DeadLetterRepository::get(self, id).await? {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(format!("dead letter {id}"))),
        }
    }

    #[instrument(skip(self), fields(entry_id = %id), err)]
    async fn reopen(&self, id: DeadLetterId, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE dead_letters SET resolved_at = NULL WHERE id = $1 AND resolved_at = $2")
            .bind(id.as_uuid())
            .bind(at)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("dead_letter_reopen", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_unresolved_by_job(
        &self,
        queue: &str,
        broker_job_id: &BrokerJobId,
    ) -> Result<Option<DeadLetterEntry>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters \
             WHERE queue = $1 AND broker_job_id = $2 AND resolved_at IS NULL"
        ))
        .bind(queue)
        .bind(broker_job_id.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("dead_letter_find", e))?;
        row.map(|row| {
            DeadLetterRow::from_row(&row)
                .map(DeadLetterEntry::from)
                .map_err(|e| StoreError::Backend(format!("failed to deserialize dead letter row: {e}")))
        })
        .transpose()
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<DeadLetterStats, StoreError> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters")
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("dead_letter_stats", e))?;
        let rows = sqlx::query(
            "SELECT queue, COUNT(*) AS unresolved FROM dead_letters WHERE resolved_at IS NULL GROUP BY queue",
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("dead_letter_stats", e))?;

        let mut stats = DeadLetterStats {
            total: u64::try_from(total).unwrap_or(0),
            ..DeadLetterStats::default()
        };
        for row in rows {
            let queue: String = row
                .try_get("queue")
                .map_err(|e| map_sqlx_error("dead_letter_stats", e))?;
            let count: i64 = row
                .try_get("unresolved")
                .map_err(|e| map_sqlx_error("dead_letter_stats", e))?;
            let count = u64::try_from(count).unwrap_or(0);
            stats.unresolved += count;
            stats.by_queue.insert(queue, count);
        }
        Ok(stats)
    }
}

#[async_trait]
impl ScheduleRepository for PostgresStores {
    #[instrument(skip(self, schedule), fields(name = %schedule.name, owner = %schedule.owner), err)]
    async fn upsert(&self, schedule: CronSchedule) -> Result<CronSchedule, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO cron_schedules ({SCHEDULE_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, now())
            ON CONFLICT (name, owner_id) DO UPDATE SET
                pattern = EXCLUDED.pattern,
                queue = EXCLUDED.queue,
                job_name = EXCLUDED.job_name,
                payload = EXCLUDED.payload,
                is_active = EXCLUDED.is_active,
                next_run_at = EXCLUDED.next_run_at,
                last_run_at = COALESCE(EXCLUDED.last_run_at, cron_schedules.last_run_at),
                updated_at = now()
            RETURNING {SCHEDULE_COLUMNS}
            "#
        ))
        .bind(schedule.id.as_uuid())
        .bind(&schedule.name)
        .bind(schedule.owner.as_uuid())
        .bind(&schedule.pattern)
        .bind(&schedule.queue)
        .bind(&schedule.job_name)
        .bind(payload_value(&schedule.payload))
        .bind(schedule.is_active)
        .bind(schedule.next_run_at)
        .bind(schedule.last_run_at)
        .bind(schedule.created_at)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("schedule_upsert", e))?;

        ScheduleRow::from_row(&row)
            .map(CronSchedule::from)
            .map_err(|e| StoreError::Backend(format!("failed to deserialize schedule row: {e}")))
    }

    async fn get(&self, id: ScheduleId) -> Result<Option<CronSchedule>, StoreError> {
        let row = sqlx::query(&format!("SELECT {SCHEDULE_COLUMNS} FROM cron_schedules WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("schedule_get", e))?;
        row.map(|row| {
            ScheduleRow::from_row(&row)
                .map(CronSchedule::from)
                .map_err(|e| StoreError::Backend(format!("failed to deserialize schedule row: {e}")))
        })
        .transpose()
    }

    async fn find_by_name(&self, name: &str, owner: PrincipalId) -> Result<Option<CronSchedule>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM cron_schedules WHERE name = $1 AND owner_id = $2"
        ))
        .bind(name)
        .bind(owner.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("schedule_find", e))?;
        row.map(|row| {
            ScheduleRow::from_row(&row)
                .map(CronSchedule::from)
                .map_err(|e| StoreError::Backend(format!("failed to deserialize schedule row: {e}")))
        })
        .transpose()
    }

    #[instrument(skip(self), err)]
    async fn list(&self, owner: Option<PrincipalId>) -> Result<Vec<CronSchedule>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM cron_schedules \
             WHERE ($1::uuid IS NULL OR owner_id = $1) ORDER BY name ASC, created_at ASC"
        ))
        .bind(owner.map(|o| *o.as_uuid()))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("schedule_list", e))?;
        rows.iter()
            .map(|row| {
                ScheduleRow::from_row(row)
                    .map(CronSchedule::from)
                    .map_err(|e| StoreError::Backend(format!("failed to deserialize schedule row: {e}")))
            })
            .collect()
    }

    #[instrument(skip(self, schedule), fields(schedule_id = %schedule.id), err)]
    async fn update(&self, schedule: &CronSchedule) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE cron_schedules
            SET pattern = $2, queue = $3, job_name = $4, payload = $5, is_active = $6,
                next_run_at = $7, last_run_at = $8, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(schedule.id.as_uuid())
        .bind(&schedule.pattern)
        .bind(&schedule.queue)
        .bind(&schedule.job_name)
        .bind(payload_value(&schedule.payload))
        .bind(schedule.is_active)
        .bind(schedule.next_run_at)
        .bind(schedule.last_run_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("schedule_update", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("schedule {}", schedule.id)));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(schedule_id = %id), err)]
    async fn delete(&self, id: ScheduleId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM cron_schedules WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("schedule_delete", e))?;
        Ok(result.rows_affected() > 0)
    }
}
