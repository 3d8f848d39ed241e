//! Worker pool: per-queue execution slots over a [`MessageBroker`].
//!
//! Each registered queue gets `concurrency` Tokio tasks. A slot loops:
//!
//! 1. pull the next eligible job (sleep `poll_interval` when idle or paused),
//! 2. on-active hook (audit → `active`),
//! 3. run the handler, raced against the job's timeout, renewing the
//!    job's lease every third of `stalled_after` while it runs,
//! 4. ack or fail the job in the broker, then the completed/failed hook.
//!
//! Hooks are best-effort: a failing audit or dead-letter write is logged and
//! never reaches the broker. A job whose budget is spent gets exactly one
//! unresolved dead-letter entry, recorded through [`DeadLetterService`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use taskforge_core::{BrokerJobId, DeadLetterId, PrincipalId, should_retry};

use crate::broker::{BrokerError, BrokerJob, FailOutcome, MessageBroker};
use crate::dead_letter::DeadLetterService;
use crate::side_effect::{SideEffect, fire_and_log};
use crate::store::{AuditStore, AuditUpdate};

use super::handler::{HandlerError, JobContext, JobHandler};

/// Worker pool configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Sleep between polls when a queue has nothing eligible.
    pub poll_interval: Duration,
    /// Deadline for jobs that do not set `timeout_ms`.
    pub job_timeout: Option<Duration>,
    /// Active jobs whose lease is older than this are handed back by the
    /// sweeper. Running handlers renew the lease.
    pub stalled_after: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            job_timeout: None,
            stalled_after: Some(Duration::from_secs(30)),
        }
    }
}

impl WorkerConfig {
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = Some(timeout);
        self
    }

    pub fn with_stalled_after(mut self, stalled_after: Option<Duration>) -> Self {
        self.stalled_after = stalled_after;
        self
    }
}

/// Per-queue counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub concurrency: usize,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self, concurrency: usize) -> WorkerStats {
        WorkerStats {
            concurrency,
            processed: self.processed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

/// What one pass of [`WorkerPool::process_next`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Nothing eligible (or the queue is paused).
    Idle,
    Completed { job_id: BrokerJobId },
    Retrying {
        job_id: BrokerJobId,
        attempts_made: u32,
        delay_ms: u64,
    },
    /// Budget spent. `entry` is `None` when the dead-letter write failed.
    DeadLettered {
        job_id: BrokerJobId,
        attempts_made: u32,
        entry: Option<DeadLetterId>,
    },
}

struct Processor {
    handler: Arc<dyn JobHandler>,
    counters: Arc<Counters>,
    concurrency: usize,
    slots: Vec<JoinHandle<()>>,
}

/// Shared by every slot.
struct Runtime {
    broker: Arc<dyn MessageBroker>,
    audit: Arc<dyn AuditStore>,
    dead_letters: Arc<DeadLetterService>,
    config: WorkerConfig,
}

/// Executes queued jobs with registered handlers.
pub struct WorkerPool {
    runtime: Arc<Runtime>,
    processors: Mutex<HashMap<String, Processor>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("queues", &self.queues())
            .field("config", &self.runtime.config)
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl WorkerPool {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        audit: Arc<dyn AuditStore>,
        dead_letters: Arc<DeadLetterService>,
        config: WorkerConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            runtime: Arc::new(Runtime {
                broker,
                audit,
                dead_letters,
                config,
            }),
            processors: Mutex::new(HashMap::new()),
            sweeper: Mutex::new(None),
            shutdown,
        }
    }

    /// Attach `handler` to `queue` with `concurrency` slots.
    ///
    /// A queue takes one processor per pool; registering it again is a
    /// no-op that returns `false`. With `concurrency == 0` no slots are
    /// spawned and the queue is driven by [`WorkerPool::process_next`].
    pub fn register_processor(&self, queue: impl Into<String>, handler: impl JobHandler + 'static, concurrency: usize) -> bool {
        let queue = queue.into();
        if *self.shutdown.borrow() {
            warn!(queue = %queue, "worker pool is shut down; processor not registered");
            return false;
        }

        let mut processors = lock(&self.processors);
        if processors.contains_key(&queue) {
            warn!(queue = %queue, "processor already registered; ignoring");
            return false;
        }

        let handler: Arc<dyn JobHandler> = Arc::new(handler);
        let counters = Arc::new(Counters::default());
        let slots = (0..concurrency)
            .map(|slot| {
                tokio::spawn(run_slot(
                    self.runtime.clone(),
                    queue.clone(),
                    handler.clone(),
                    counters.clone(),
                    slot,
                    self.shutdown.subscribe(),
                ))
            })
            .collect();

        info!(queue = %queue, concurrency, "processor registered");
        processors.insert(
            queue,
            Processor {
                handler,
                counters,
                concurrency,
                slots,
            },
        );
        true
    }

    /// Run at most one job of `queue` on the calling task.
    pub async fn process_next(&self, queue: &str) -> Result<ProcessOutcome, BrokerError> {
        let (handler, counters) = {
            let processors = lock(&self.processors);
            let processor = processors
                .get(queue)
                .ok_or_else(|| BrokerError::Backend(format!("no processor registered for queue '{queue}'")))?;
            (processor.handler.clone(), processor.counters.clone())
        };
        self.runtime.process_next(queue, &handler, &counters).await
    }

    pub fn stats(&self, queue: &str) -> Option<WorkerStats> {
        lock(&self.processors)
            .get(queue)
            .map(|p| p.counters.snapshot(p.concurrency))
    }

    pub fn queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = lock(&self.processors).keys().cloned().collect();
        queues.sort();
        queues
    }

    /// Start the background task that hands stalled jobs back to the broker.
    ///
    /// Returns `false` when disabled by config or already running.
    pub fn start_stalled_sweeper(&self) -> bool {
        let Some(stalled_after) = self.runtime.config.stalled_after else {
            return false;
        };
        let mut sweeper = lock(&self.sweeper);
        if sweeper.is_some() {
            return false;
        }

        let broker = self.runtime.broker.clone();
        let mut shutdown = self.shutdown.subscribe();
        *sweeper = Some(tokio::spawn(async move {
            let mut every = tokio::time::interval((stalled_after / 2).max(Duration::from_millis(10)));
            every.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = every.tick() => {
                        match broker.recover_stalled(stalled_after).await {
                            Ok(0) => {}
                            Ok(n) => info!(recovered = n, "stalled jobs recovered"),
                            Err(e) => warn!(error = %e, "stalled job sweep failed"),
                        }
                    }
                }
            }
        }));
        true
    }

    /// Stop pulling new jobs and wait for slots to finish the job in hand.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);

        let slots: Vec<JoinHandle<()>> = lock(&self.processors)
            .values_mut()
            .flat_map(|p| p.slots.drain(..))
            .collect();
        let sweeper = lock(&self.sweeper).take();

        for slot in slots {
            if let Err(e) = slot.await {
                warn!(error = %e, "worker slot ended abnormally");
            }
        }
        if let Some(sweeper) = sweeper {
            let _ = sweeper.await;
        }
        info!("worker pool stopped");
    }
}

async fn run_slot(
    runtime: Arc<Runtime>,
    queue: String,
    handler: Arc<dyn JobHandler>,
    counters: Arc<Counters>,
    slot: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(queue = %queue, slot, "worker slot started");
    loop {
        if *shutdown.borrow() {
            break;
        }

        let idle = match runtime.process_next(&queue, &handler, &counters).await {
            Ok(ProcessOutcome::Idle) => true,
            Ok(_) => false,
            Err(e) => {
                warn!(queue = %queue, slot, error = %e, "broker call failed in worker slot");
                true
            }
        };

        if idle {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(runtime.config.poll_interval) => {}
            }
        }
    }
    debug!(queue = %queue, slot, "worker slot stopped");
}

/// Run the handler in its own task so a panic or timeout ends only this try.
async fn run_handler(
    handler: Arc<dyn JobHandler>,
    context: JobContext,
    timeout: Option<Duration>,
) -> Result<JsonValue, HandlerError> {
    let task = tokio::spawn(async move { handler.handle(&context).await });
    let abort = task.abort_handle();

    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, task).await {
            Ok(joined) => joined,
            Err(_) => {
                abort.abort();
                return Err(HandlerError::Timeout(limit));
            }
        },
        None => task.await,
    };

    joined.unwrap_or_else(|e| Err(HandlerError::Failed(format!("handler aborted: {e}"))))
}

impl Runtime {
    async fn process_next(
        &self,
        queue: &str,
        handler: &Arc<dyn JobHandler>,
        counters: &Counters,
    ) -> Result<ProcessOutcome, BrokerError> {
        let Some(job) = self.broker.pull_next(queue).await? else {
            return Ok(ProcessOutcome::Idle);
        };
        Counters::bump(&counters.processed);
        self.on_active(&job).await;

        let timeout = job
            .options
            .timeout_ms
            .map(Duration::from_millis)
            .or(self.config.job_timeout);
        let result = self
            .with_heartbeat(&job, run_handler(handler.clone(), JobContext::from(&job), timeout))
            .await;

        match result {
            Ok(value) => {
                self.broker.complete(queue, &job.id, value.clone()).await?;
                Counters::bump(&counters.succeeded);
                self.on_completed(&job, value).await;
                Ok(ProcessOutcome::Completed { job_id: job.id })
            }
            Err(handler_error) => {
                let error = handler_error.to_string();
                let outcome = self.broker.fail(queue, &job.id, &error).await?;
                Counters::bump(&counters.failed);
                let attempts_made = outcome.attempts_made();
                let exhausted = !should_retry(attempts_made, job.options.max_attempts);
                self.on_failed(&job, &error, attempts_made, exhausted).await;

                match outcome {
                    FailOutcome::Retrying { delay_ms, .. } if !exhausted => {
                        Counters::bump(&counters.retried);
                        debug!(queue = %queue, job_id = %job.id, attempts_made, delay_ms, error = %error, "job failed; retry scheduled");
                        Ok(ProcessOutcome::Retrying {
                            job_id: job.id,
                            attempts_made,
                            delay_ms,
                        })
                    }
                    _ => {
                        let entry = self.dead_letter(&job, &error, attempts_made).await;
                        if entry.is_some() {
                            Counters::bump(&counters.dead_lettered);
                        }
                        Ok(ProcessOutcome::DeadLettered {
                            job_id: job.id,
                            attempts_made,
                            entry,
                        })
                    }
                }
            }
        }
    }

    /// Await `work` while renewing the job's lease so the sweeper leaves it alone.
    async fn with_heartbeat<T>(&self, job: &BrokerJob, work: impl Future<Output = T>) -> T {
        let Some(stalled_after) = self.config.stalled_after else {
            return work.await;
        };
        let mut beat = tokio::time::interval((stalled_after / 3).max(Duration::from_millis(5)));
        beat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick is immediate; pull_next just set the lease.
        beat.tick().await;

        tokio::pin!(work);
        loop {
            tokio::select! {
                out = &mut work => return out,
                _ = beat.tick() => match self.broker.extend_lease(&job.queue, &job.id).await {
                    Ok(true) => {}
                    Ok(false) => warn!(queue = %job.queue, job_id = %job.id, "lease lost; job is no longer active"),
                    Err(e) => warn!(queue = %job.queue, job_id = %job.id, error = %e, "lease renewal failed"),
                },
            }
        }
    }

    /// Apply `update` to the job's audit record, if it has one.
    async fn audit(&self, label: &str, job: &BrokerJob, update: AuditUpdate) -> SideEffect<()> {
        match job.audit_id {
            Some(audit_id) => fire_and_log(label, self.audit.apply(audit_id, update)).await,
            None => SideEffect::Skipped,
        }
    }

    async fn on_active(&self, job: &BrokerJob) -> SideEffect<()> {
        self.audit("audit.active", job, AuditUpdate::Active { started_at: Utc::now() })
            .await
    }

    async fn on_completed(&self, job: &BrokerJob, result: JsonValue) -> SideEffect<()> {
        let update = AuditUpdate::Completed {
            result,
            attempts_made: job.attempts_made + 1,
            at: Utc::now(),
        };
        self.audit("audit.completed", job, update).await
    }

    async fn on_failed(&self, job: &BrokerJob, error: &str, attempts_made: u32, terminal: bool) -> SideEffect<()> {
        let update = AuditUpdate::Failed {
            error: error.to_string(),
            attempts_made,
            terminal,
            at: Utc::now(),
        };
        self.audit("audit.failed", job, update).await
    }

    /// Record the permanent failure once per broker job.
    async fn dead_letter(&self, job: &BrokerJob, error: &str, attempts_made: u32) -> Option<DeadLetterId> {
        let recorded = self
            .dead_letters
            .add_entry(
                &job.queue,
                &job.name,
                job.id.clone(),
                job.payload.clone(),
                error,
                attempts_made,
                job.options.principal.unwrap_or_else(PrincipalId::system),
            )
            .await;
        match recorded {
            Ok(id) => Some(id),
            Err(e) => {
                error!(queue = %job.queue, job_id = %job.id, error = %e, "failed to record dead letter");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{EnqueueRequest, InMemoryBroker};
    use crate::queue::QueueManager;
    use crate::store::{DeadLetterRepository, InMemoryStores};
    use crate::worker::handler::handler_fn;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use taskforge_core::{BackoffPolicy, JobOptions, JobPayload, JobState};

    fn pool(broker: Arc<InMemoryBroker>, stores: Arc<InMemoryStores>, config: WorkerConfig) -> WorkerPool {
        let queue = Arc::new(QueueManager::new(Some(broker.clone()), stores.clone()));
        let dead_letters = Arc::new(DeadLetterService::new(stores.clone(), queue));
        WorkerPool::new(broker, stores, dead_letters, config)
    }

    async fn enqueue(broker: &InMemoryBroker, options: JobOptions) -> BrokerJobId {
        broker
            .enqueue(EnqueueRequest::new("q", "job", JobPayload::new(), options))
            .await
            .unwrap()
    }

    fn options() -> JobOptions {
        JobOptions::for_principal(PrincipalId::new())
    }

    #[tokio::test]
    async fn duplicate_registration_is_ignored() {
        let pool = pool(InMemoryBroker::arc(), InMemoryStores::arc(), WorkerConfig::default());
        let ok = || handler_fn(|_| async { Ok::<_, HandlerError>(json!(null)) });
        assert!(pool.register_processor("q", ok(), 0));
        assert!(!pool.register_processor("q", ok(), 0));
        assert_eq!(pool.queues(), vec!["q".to_string()]);
    }

    #[tokio::test]
    async fn successful_job_completes() {
        let broker = InMemoryBroker::arc();
        let pool = pool(broker.clone(), InMemoryStores::arc(), WorkerConfig::default());
        pool.register_processor("q", handler_fn(|job| async move { Ok(json!({ "ran": job.name })) }), 0);

        let id = enqueue(&broker, options()).await;
        assert_eq!(pool.process_next("q").await.unwrap(), ProcessOutcome::Completed { job_id: id.clone() });
        assert_eq!(pool.process_next("q").await.unwrap(), ProcessOutcome::Idle);

        let job = broker.get_job("q", &id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.return_value, Some(json!({ "ran": "job" })));
        assert_eq!(pool.stats("q").unwrap().succeeded, 1);
    }

    #[tokio::test]
    async fn exhausted_job_is_dead_lettered_once() {
        let broker = InMemoryBroker::arc();
        let stores = InMemoryStores::arc();
        let pool = pool(broker.clone(), stores.clone(), WorkerConfig::default());
        pool.register_processor("q", handler_fn(|_| async { Err(HandlerError::failed("nope")) }), 0);

        let policy = BackoffPolicy::fixed(0).without_jitter();
        enqueue(&broker, options().with_max_attempts(3).with_backoff(policy)).await;

        let mut outcomes = Vec::new();
        for _ in 0..4 {
            outcomes.push(pool.process_next("q").await.unwrap());
        }
        assert!(matches!(outcomes[0], ProcessOutcome::Retrying { attempts_made: 1, .. }));
        assert!(matches!(outcomes[1], ProcessOutcome::Retrying { attempts_made: 2, .. }));
        assert!(matches!(
            outcomes[2],
            ProcessOutcome::DeadLettered { attempts_made: 3, entry: Some(_), .. }
        ));
        assert_eq!(outcomes[3], ProcessOutcome::Idle);

        let stats = stores.stats().await.unwrap();
        assert_eq!(stats.unresolved, 1);
        assert_eq!(pool.stats("q").unwrap().dead_lettered, 1);
    }

    #[tokio::test]
    async fn timeout_counts_as_failed_try() {
        let broker = InMemoryBroker::arc();
        let stores = InMemoryStores::arc();
        let pool = pool(broker.clone(), stores.clone(), WorkerConfig::default());
        pool.register_processor(
            "q",
            handler_fn(|_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(json!(null))
            }),
            0,
        );

        enqueue(&broker, options().with_max_attempts(1).with_timeout_ms(20)).await;
        let outcome = pool.process_next("q").await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::DeadLettered { attempts_made: 1, .. }));

        let entries = stores.list_unresolved(&Default::default()).await.unwrap();
        assert_eq!(entries[0].error, "job timed out after 20ms");
    }

    #[tokio::test]
    async fn panicking_handler_is_a_failed_try() {
        let broker = InMemoryBroker::arc();
        let pool = pool(broker.clone(), InMemoryStores::arc(), WorkerConfig::default());
        pool.register_processor(
            "q",
            handler_fn(|job| async move {
                if job.name == "job" {
                    panic!("handler bug");
                }
                Ok(json!(null))
            }),
            0,
        );

        let id = enqueue(&broker, options().with_max_attempts(2)).await;
        let outcome = pool.process_next("q").await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Retrying { attempts_made: 1, .. }));
        let job = broker.get_job("q", &id).await.unwrap().unwrap();
        assert!(job.failed_reason.unwrap().starts_with("handler aborted"));
    }

    #[tokio::test]
    async fn slots_drain_queue_and_stop_on_shutdown() {
        let broker = InMemoryBroker::arc();
        let config = WorkerConfig::default().with_poll_interval(Duration::from_millis(5));
        let pool = pool(broker.clone(), InMemoryStores::arc(), config);
        let seen = Arc::new(AtomicU32::new(0));
        let counter = seen.clone();
        pool.register_processor(
            "q",
            handler_fn(move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(null))
                }
            }),
            3,
        );

        for _ in 0..10 {
            enqueue(&broker, options()).await;
        }
        for _ in 0..200 {
            if seen.load(Ordering::SeqCst) == 10 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        pool.shutdown().await;

        assert_eq!(seen.load(Ordering::SeqCst), 10);
        assert_eq!(broker.counts("q").await.unwrap().completed, 10);
        assert!(!pool.register_processor("other", handler_fn(|_| async { Ok(json!(null)) }), 1));
    }

    #[tokio::test]
    async fn long_job_outlives_stall_window_without_rerun() {
        let broker = InMemoryBroker::arc();
        let config = WorkerConfig::default()
            .with_stalled_after(Some(Duration::from_millis(50)))
            .with_poll_interval(Duration::from_millis(10));
        let pool = pool(broker.clone(), InMemoryStores::arc(), config);
        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();
        pool.register_processor(
            "q",
            handler_fn(move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    Ok(json!(null))
                }
            }),
            2,
        );
        assert!(pool.start_stalled_sweeper());

        let id = enqueue(&broker, options()).await;
        for _ in 0..200 {
            let job = broker.get_job("q", &id).await.unwrap().unwrap();
            if job.state == JobState::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        pool.shutdown().await;

        assert_eq!(broker.get_job("q", &id).await.unwrap().unwrap().state, JobState::Completed);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats("q").unwrap().succeeded, 1);
    }

    #[tokio::test]
    async fn hooks_skip_jobs_without_audit_record() {
        let broker = InMemoryBroker::arc();
        let pool = pool(broker.clone(), InMemoryStores::arc(), WorkerConfig::default());
        enqueue(&broker, options()).await;

        let job = broker.pull_next("q").await.unwrap().unwrap();
        assert!(job.audit_id.is_none());
        assert_eq!(pool.runtime.on_active(&job).await, SideEffect::Skipped);
        assert_eq!(pool.runtime.on_failed(&job, "boom", 1, false).await, SideEffect::Skipped);
    }

    #[tokio::test]
    async fn sweeper_respects_config() {
        let pool = pool(
            InMemoryBroker::arc(),
            InMemoryStores::arc(),
            WorkerConfig::default().with_stalled_after(None),
        );
        assert!(!pool.start_stalled_sweeper());
    }
}
