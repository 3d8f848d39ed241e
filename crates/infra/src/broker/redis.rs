//! Redis-backed broker (shared queue state across processes).
//!
//! ## Key layout
//!
//! All keys live under a configurable prefix (default `taskforge`):
//!
//! | Key | Type | Contents |
//! |-----|------|----------|
//! | `{prefix}:queues` | set | every queue name ever used |
//! | `{prefix}:ids` | string | id/sequence counter (`INCR`) |
//! | `{prefix}:{queue}:wait` | zset | eligible job ids, scored by priority then sequence |
//! | `{prefix}:{queue}:delayed` | zset | delayed job ids, scored by ready time (ms) |
//! | `{prefix}:{queue}:active` | zset | active job ids, scored by last heartbeat (ms) |
//! | `{prefix}:{queue}:completed` | zset | completed job ids, scored by finish time |
//! | `{prefix}:{queue}:failed` | zset | exhausted job ids, scored by finish time |
//! | `{prefix}:{queue}:score` | hash | job id → wait score |
//! | `{prefix}:{queue}:paused` | string | present while paused |
//! | `{prefix}:{queue}:repeat` | hash | trigger key → trigger JSON |
//! | `{prefix}:{queue}:job:{id}` | string | job JSON |
//!
//! Moving ids between the sorted sets is done in Lua so that two processes
//! never pull the same job.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use serde_json::Value as JsonValue;
use tracing::{debug, info, instrument, warn};

use taskforge_core::{BrokerJobId, CronPattern, JobState, retry_delay_after, should_retry};

use super::in_memory::{DEFAULT_KEEP_COMPLETED, after_ms};
use super::{
    BrokerError, BrokerJob, EnqueueRequest, FailOutcome, FiredTrigger, JobRange, MessageBroker,
    QueueMetrics, RepeatableTrigger,
};

/// Default key prefix.
const DEFAULT_PREFIX: &str = "taskforge";

/// Priorities are clamped to this magnitude so the wait score stays exact in an f64.
const PRIORITY_LIMIT: i64 = 1 << 20;

/// How long a fired-trigger claim is kept.
const FIRE_CLAIM_TTL_MS: u64 = 24 * 60 * 60 * 1000;

/// Promote due delayed jobs into the wait set.
/// KEYS: delayed, wait, score. ARGV: now_ms.
const PROMOTE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for _, id in ipairs(due) do
  local score = redis.call('HGET', KEYS[3], id)
  if score then
    redis.call('ZADD', KEYS[2], score, id)
  end
  redis.call('ZREM', KEYS[1], id)
end
return #due
"#;

/// Promote, then pop the best waiting job into the active set.
/// KEYS: delayed, wait, score, active, paused. ARGV: now_ms.
const PULL_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[5]) == 1 then
  return false
end
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for _, id in ipairs(due) do
  local score = redis.call('HGET', KEYS[3], id)
  if score then
    redis.call('ZADD', KEYS[2], score, id)
  end
  redis.call('ZREM', KEYS[1], id)
end
local popped = redis.call('ZPOPMIN', KEYS[2])
if #popped == 0 then
  return false
end
redis.call('ZADD', KEYS[4], ARGV[1], popped[1])
return popped[1]
"#;

impl From<redis::RedisError> for BrokerError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout() {
            BrokerError::Unavailable(e.to_string())
        } else {
            BrokerError::Backend(e.to_string())
        }
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, BrokerError> {
    serde_json::to_string(value).map_err(|e| BrokerError::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, BrokerError> {
    serde_json::from_str(raw).map_err(|e| BrokerError::Serialization(e.to_string()))
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn wait_score(priority: i32, sequence: u64) -> f64 {
    let priority = i64::from(priority).clamp(-PRIORITY_LIMIT, PRIORITY_LIMIT);
    (priority as f64) * 4_294_967_296.0 + (sequence % (1 << 32)) as f64
}

/// [`MessageBroker`] over Redis.
#[derive(Clone)]
pub struct RedisBroker {
    conn: MultiplexedConnection,
    prefix: String,
    keep_completed: usize,
    promote: redis::Script,
    pull: redis::Script,
}

impl std::fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBroker")
            .field("prefix", &self.prefix)
            .field("keep_completed", &self.keep_completed)
            .finish()
    }
}

impl RedisBroker {
    /// Connect to `redis_url` and share one multiplexed connection.
    pub async fn connect(redis_url: impl AsRef<str>, prefix: Option<String>) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            conn,
            prefix: prefix.unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
            keep_completed: DEFAULT_KEEP_COMPLETED,
            promote: redis::Script::new(PROMOTE_SCRIPT),
            pull: redis::Script::new(PULL_SCRIPT),
        })
    }

    pub fn with_retention(mut self, keep_completed: usize) -> Self {
        self.keep_completed = keep_completed;
        self
    }

    fn key(&self, queue: &str, suffix: &str) -> String {
        format!("{}:{}:{}", self.prefix, queue, suffix)
    }

    fn job_key(&self, queue: &str, id: &BrokerJobId) -> String {
        format!("{}:{}:job:{}", self.prefix, queue, id)
    }

    fn queues_key(&self) -> String {
        format!("{}:queues", self.prefix)
    }

    async fn load(&self, queue: &str, id: &BrokerJobId) -> Result<Option<BrokerJob>, BrokerError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.job_key(queue, id))
            .query_async(&mut conn)
            .await?;
        raw.as_deref().map(from_json).transpose()
    }

    async fn store(&self, job: &BrokerJob) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(self.job_key(&job.queue, &job.id))
            .arg(to_json(job)?)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn promote_due(&self, queue: &str, now: DateTime<Utc>) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .promote
            .key(self.key(queue, "delayed"))
            .key(self.key(queue, "wait"))
            .key(self.key(queue, "score"))
            .arg(millis(now))
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Take `id` out of the active set; errors when it was not active.
    async fn release_active(&self, queue: &str, id: &BrokerJobId) -> Result<BrokerJob, BrokerError> {
        let job = self
            .load(queue, id)
            .await?
            .ok_or_else(|| BrokerError::NotFound(id.clone()))?;
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("ZREM")
            .arg(self.key(queue, "active"))
            .arg(id.as_str())
            .query_async(&mut conn)
            .await?;
        if removed == 0 {
            return Err(BrokerError::NotActive(id.clone()));
        }
        Ok(job)
    }

    async fn insert(&self, request: EnqueueRequest, now: DateTime<Utc>) -> Result<BrokerJobId, BrokerError> {
        let mut conn = self.conn.clone();
        let sequence: u64 = redis::cmd("INCR")
            .arg(format!("{}:ids", self.prefix))
            .query_async(&mut conn)
            .await?;
        let id = BrokerJobId::new(sequence.to_string());
        let state = request.options.initial_state();
        let ready_at = after_ms(now, request.options.delay_ms);
        let score = wait_score(request.options.priority, sequence);
        let queue = request.queue.clone();

        let job = BrokerJob {
            id: id.clone(),
            queue: request.queue,
            name: request.name,
            payload: request.payload,
            options: request.options,
            audit_id: request.audit_id,
            state,
            attempts_made: 0,
            sequence,
            failed_reason: None,
            return_value: None,
            created_at: now,
            ready_at,
            processed_at: None,
            finished_at: None,
        };

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("SADD").arg(self.queues_key()).arg(&queue).ignore()
            .cmd("SET").arg(self.job_key(&queue, &id)).arg(to_json(&job)?).ignore()
            .cmd("HSET").arg(self.key(&queue, "score")).arg(id.as_str()).arg(score).ignore();
        if state == JobState::Delayed {
            pipe.cmd("ZADD").arg(self.key(&queue, "delayed")).arg(millis(ready_at)).arg(id.as_str()).ignore();
        } else {
            pipe.cmd("ZADD").arg(self.key(&queue, "wait")).arg(score).arg(id.as_str()).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(id)
    }

    async fn known_queues(&self) -> Result<Vec<String>, BrokerError> {
        let mut conn = self.conn.clone();
        Ok(redis::cmd("SMEMBERS")
            .arg(self.queues_key())
            .query_async(&mut conn)
            .await?)
    }

    async fn trim_completed(&self, queue: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let total: usize = redis::cmd("ZCARD")
            .arg(self.key(queue, "completed"))
            .query_async(&mut conn)
            .await?;
        if total <= self.keep_completed {
            return Ok(());
        }
        let purged: Vec<(String, f64)> = redis::cmd("ZPOPMIN")
            .arg(self.key(queue, "completed"))
            .arg(total - self.keep_completed)
            .query_async(&mut conn)
            .await?;
        for (id, _) in purged {
            let id = BrokerJobId::new(id);
            let _: () = redis::pipe()
                .cmd("DEL").arg(self.job_key(queue, &id)).ignore()
                .cmd("HDEL").arg(self.key(queue, "score")).arg(id.as_str()).ignore()
                .query_async(&mut conn)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl MessageBroker for RedisBroker {
    #[instrument(skip(self, request), fields(queue = %request.queue, job_name = %request.name), err)]
    async fn enqueue(&self, request: EnqueueRequest) -> Result<BrokerJobId, BrokerError> {
        let id = self.insert(request, Utc::now()).await?;
        debug!(job_id = %id, "job enqueued");
        Ok(id)
    }

    #[instrument(skip(self), err)]
    async fn pull_next(&self, queue: &str) -> Result<Option<BrokerJob>, BrokerError> {
        let now = Utc::now();
        let mut conn = self.conn.clone();
        let popped: Option<String> = self
            .pull
            .key(self.key(queue, "delayed"))
            .key(self.key(queue, "wait"))
            .key(self.key(queue, "score"))
            .key(self.key(queue, "active"))
            .key(self.key(queue, "paused"))
            .arg(millis(now))
            .invoke_async(&mut conn)
            .await?;
        let Some(id) = popped.map(BrokerJobId::new) else {
            return Ok(None);
        };

        let Some(mut job) = self.load(queue, &id).await? else {
            warn!(queue = %queue, job_id = %id, "popped id without job body; dropping");
            let _: i64 = redis::cmd("ZREM")
                .arg(self.key(queue, "active"))
                .arg(id.as_str())
                .query_async(&mut conn)
                .await?;
            return Ok(None);
        };
        job.state = JobState::Active;
        job.processed_at = Some(now);
        self.store(&job).await?;
        Ok(Some(job))
    }

    #[instrument(skip(self, result), err)]
    async fn complete(&self, queue: &str, id: &BrokerJobId, result: JsonValue) -> Result<(), BrokerError> {
        let now = Utc::now();
        let mut job = self.release_active(queue, id).await?;
        job.state = JobState::Completed;
        job.attempts_made += 1;
        job.return_value = Some(result);
        job.finished_at = Some(now);
        self.store(&job).await?;

        let mut conn = self.conn.clone();
        let _: () = redis::cmd("ZADD")
            .arg(self.key(queue, "completed"))
            .arg(millis(now))
            .arg(id.as_str())
            .query_async(&mut conn)
            .await?;
        self.trim_completed(queue).await
    }

    #[instrument(skip(self, error), err)]
    async fn fail(&self, queue: &str, id: &BrokerJobId, error: &str) -> Result<FailOutcome, BrokerError> {
        let now = Utc::now();
        let mut job = self.release_active(queue, id).await?;
        job.attempts_made += 1;
        job.failed_reason = Some(error.to_string());
        job.processed_at = None;

        let mut conn = self.conn.clone();
        if should_retry(job.attempts_made, job.options.max_attempts) {
            let delay_ms = retry_delay_after(job.attempts_made, &job.options.backoff);
            job.state = JobState::Delayed;
            job.ready_at = after_ms(now, delay_ms);
            self.store(&job).await?;
            let _: () = redis::cmd("ZADD")
                .arg(self.key(queue, "delayed"))
                .arg(millis(job.ready_at))
                .arg(id.as_str())
                .query_async(&mut conn)
                .await?;
            Ok(FailOutcome::Retrying {
                attempts_made: job.attempts_made,
                delay_ms,
            })
        } else {
            job.state = JobState::Failed;
            job.finished_at = Some(now);
            self.store(&job).await?;
            let _: () = redis::cmd("ZADD")
                .arg(self.key(queue, "failed"))
                .arg(millis(now))
                .arg(id.as_str())
                .query_async(&mut conn)
                .await?;
            Ok(FailOutcome::Exhausted {
                attempts_made: job.attempts_made,
            })
        }
    }

    async fn get_job(&self, queue: &str, id: &BrokerJobId) -> Result<Option<BrokerJob>, BrokerError> {
        let now = Utc::now();
        Ok(self.load(queue, id).await?.map(|mut job| {
            if job.state == JobState::Delayed && job.ready_at <= now {
                job.state = JobState::Waiting;
            }
            job
        }))
    }

    async fn list_jobs(&self, queue: &str, state: JobState, range: JobRange) -> Result<Vec<BrokerJob>, BrokerError> {
        if range.end < range.start {
            return Ok(Vec::new());
        }
        self.promote_due(queue, Utc::now()).await?;
        let (suffix, newest_first) = match state {
            JobState::Waiting => ("wait", false),
            JobState::Delayed => ("delayed", false),
            JobState::Active => ("active", false),
            JobState::Completed => ("completed", true),
            JobState::Failed => ("failed", true),
            JobState::DeadLettered => return Ok(Vec::new()),
        };

        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd(if newest_first { "ZREVRANGE" } else { "ZRANGE" })
            .arg(self.key(queue, suffix))
            .arg(range.start)
            .arg(range.end)
            .query_async(&mut conn)
            .await?;

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(mut job) = self.load(queue, &BrokerJobId::new(id)).await? {
                job.state = state;
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    #[instrument(skip(self), err)]
    async fn remove_job(&self, queue: &str, id: &BrokerJobId) -> Result<bool, BrokerError> {
        let mut conn = self.conn.clone();
        let active: Option<f64> = redis::cmd("ZSCORE")
            .arg(self.key(queue, "active"))
            .arg(id.as_str())
            .query_async(&mut conn)
            .await?;
        if active.is_some() {
            return Err(BrokerError::JobActive(id.clone()));
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for suffix in ["wait", "delayed", "completed", "failed"] {
            pipe.cmd("ZREM").arg(self.key(queue, suffix)).arg(id.as_str()).ignore();
        }
        pipe.cmd("HDEL").arg(self.key(queue, "score")).arg(id.as_str()).ignore();
        pipe.cmd("DEL").arg(self.job_key(queue, id));
        let (deleted,): (i64,) = pipe.query_async(&mut conn).await?;
        Ok(deleted > 0)
    }

    async fn pause(&self, queue: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(self.key(queue, "paused"))
            .arg(1)
            .query_async(&mut conn)
            .await?;
        info!(queue = %queue, "queue paused");
        Ok(())
    }

    async fn resume(&self, queue: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("DEL")
            .arg(self.key(queue, "paused"))
            .query_async(&mut conn)
            .await?;
        info!(queue = %queue, "queue resumed");
        Ok(())
    }

    async fn is_paused(&self, queue: &str) -> Result<bool, BrokerError> {
        let mut conn = self.conn.clone();
        Ok(redis::cmd("EXISTS")
            .arg(self.key(queue, "paused"))
            .query_async(&mut conn)
            .await?)
    }

    async fn counts(&self, queue: &str) -> Result<QueueMetrics, BrokerError> {
        self.promote_due(queue, Utc::now()).await?;
        let mut conn = self.conn.clone();
        let (waiting, delayed, active, completed, failed, paused): (u64, u64, u64, u64, u64, bool) = redis::pipe()
            .cmd("ZCARD").arg(self.key(queue, "wait"))
            .cmd("ZCARD").arg(self.key(queue, "delayed"))
            .cmd("ZCARD").arg(self.key(queue, "active"))
            .cmd("ZCARD").arg(self.key(queue, "completed"))
            .cmd("ZCARD").arg(self.key(queue, "failed"))
            .cmd("EXISTS").arg(self.key(queue, "paused"))
            .query_async(&mut conn)
            .await?;
        Ok(QueueMetrics {
            waiting,
            delayed,
            active,
            completed,
            failed,
            paused,
        })
    }

    #[instrument(skip(self, trigger), fields(queue = %trigger.queue, key = %trigger.key), err)]
    async fn add_repeatable(&self, mut trigger: RepeatableTrigger) -> Result<(), BrokerError> {
        let pattern = CronPattern::parse(&trigger.pattern)
            .map_err(|e| BrokerError::InvalidPattern(e.to_string()))?;
        trigger.next_fire_at = pattern.next_after(Utc::now());

        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SADD")
            .arg(self.queues_key())
            .arg(&trigger.queue)
            .query_async(&mut conn)
            .await?;
        let added: bool = redis::cmd("HSETNX")
            .arg(self.key(&trigger.queue, "repeat"))
            .arg(&trigger.key)
            .arg(to_json(&trigger)?)
            .query_async(&mut conn)
            .await?;
        if !added {
            debug!("repeatable already registered");
        }
        Ok(())
    }

    async fn remove_repeatable(&self, queue: &str, key: &str) -> Result<bool, BrokerError> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("HDEL")
            .arg(self.key(queue, "repeat"))
            .arg(key)
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn list_repeatables(&self, queue: &str) -> Result<Vec<RepeatableTrigger>, BrokerError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = redis::cmd("HVALS")
            .arg(self.key(queue, "repeat"))
            .query_async(&mut conn)
            .await?;
        let mut triggers = raw
            .iter()
            .map(|r| from_json::<RepeatableTrigger>(r))
            .collect::<Result<Vec<_>, _>>()?;
        triggers.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(triggers)
    }

    #[instrument(skip(self), err)]
    async fn fire_due_repeatables(&self, now: DateTime<Utc>) -> Result<Vec<FiredTrigger>, BrokerError> {
        let mut fired = Vec::new();
        for queue in self.known_queues().await? {
            for mut trigger in self.list_repeatables(&queue).await? {
                let Some(due_at) = trigger.next_fire_at.filter(|at| *at <= now) else {
                    continue;
                };

                // One process wins each (trigger, instant) pair.
                let mut conn = self.conn.clone();
                let claimed: Option<String> = redis::cmd("SET")
                    .arg(format!("{}:{}:fired:{}:{}", self.prefix, queue, trigger.key, millis(due_at)))
                    .arg(1)
                    .arg("NX")
                    .arg("PX")
                    .arg(FIRE_CLAIM_TTL_MS)
                    .query_async(&mut conn)
                    .await?;
                if claimed.is_none() {
                    continue;
                }

                let mut options = trigger.options.clone();
                options.delay_ms = 0;
                let request = EnqueueRequest::new(&queue, &trigger.job_name, trigger.payload.clone(), options);
                let job_id = self.insert(request, now).await?;

                trigger.next_fire_at = CronPattern::parse(&trigger.pattern)
                    .ok()
                    .and_then(|p| p.next_after(now));
                let _: () = redis::cmd("HSET")
                    .arg(self.key(&queue, "repeat"))
                    .arg(&trigger.key)
                    .arg(to_json(&trigger)?)
                    .query_async(&mut conn)
                    .await?;

                fired.push(FiredTrigger {
                    key: trigger.key,
                    queue: queue.clone(),
                    job_id,
                    fired_at: now,
                    next_fire_at: trigger.next_fire_at,
                });
            }
        }
        Ok(fired)
    }

    #[instrument(skip(self), err)]
    async fn extend_lease(&self, queue: &str, id: &BrokerJobId) -> Result<bool, BrokerError> {
        let mut conn = self.conn.clone();
        // XX: only touch ids still in the active set.
        let _: i64 = redis::cmd("ZADD")
            .arg(self.key(queue, "active"))
            .arg("XX")
            .arg(millis(Utc::now()))
            .arg(id.as_str())
            .query_async(&mut conn)
            .await?;
        let score: Option<f64> = redis::cmd("ZSCORE")
            .arg(self.key(queue, "active"))
            .arg(id.as_str())
            .query_async(&mut conn)
            .await?;
        Ok(score.is_some())
    }

    #[instrument(skip(self), err)]
    async fn recover_stalled(&self, stalled_after: Duration) -> Result<usize, BrokerError> {
        let now = Utc::now();
        let cutoff = millis(now) - i64::try_from(stalled_after.as_millis()).unwrap_or(i64::MAX / 2);
        let mut recovered = 0;
        for queue in self.known_queues().await? {
            let mut conn = self.conn.clone();
            let stalled: Vec<String> = redis::cmd("ZRANGEBYSCORE")
                .arg(self.key(&queue, "active"))
                .arg("-inf")
                .arg(cutoff)
                .query_async(&mut conn)
                .await?;
            for id in stalled {
                let id = BrokerJobId::new(id);
                let removed: i64 = redis::cmd("ZREM")
                    .arg(self.key(&queue, "active"))
                    .arg(id.as_str())
                    .query_async(&mut conn)
                    .await?;
                if removed == 0 {
                    continue;
                }
                let Some(mut job) = self.load(&queue, &id).await? else {
                    continue;
                };
                job.state = JobState::Waiting;
                job.ready_at = now;
                job.processed_at = None;
                self.store(&job).await?;
                let _: () = redis::cmd("ZADD")
                    .arg(self.key(&queue, "wait"))
                    .arg(wait_score(job.options.priority, job.sequence))
                    .arg(id.as_str())
                    .query_async(&mut conn)
                    .await?;
                warn!(queue = %queue, job_id = %id, "stalled job returned to waiting");
                recovered += 1;
            }
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_score_orders_priority_before_sequence() {
        assert!(wait_score(0, 10) < wait_score(1, 1));
        assert!(wait_score(-5, 999) < wait_score(0, 1));
        assert!(wait_score(3, 1) < wait_score(3, 2));
    }

    #[test]
    fn extreme_priorities_are_clamped() {
        assert_eq!(wait_score(i32::MAX, 1), wait_score(1 << 21, 1));
    }
}
