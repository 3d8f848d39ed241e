use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use taskforge_infra::broker::{InMemoryBroker, MessageBroker};
use taskforge_infra::config::{BrokerKind, TaskforgeConfig};
use taskforge_infra::cron_scheduler::CronScheduler;
use taskforge_infra::dead_letter::DeadLetterService;
use taskforge_infra::queue::QueueManager;
use taskforge_infra::store::{AuditStore, DeadLetterRepository, InMemoryStores, PostgresStores, ScheduleRepository};
use taskforge_infra::worker::{CapabilityHandler, EchoCapability, HandlerRegistry, WorkerConfig, WorkerPool};

/// Everything the HTTP handlers need, shared behind one `Arc`.
pub struct AppServices {
    pub config: TaskforgeConfig,
    pub queue: Arc<QueueManager>,
    pub dead_letters: Arc<DeadLetterService>,
    pub scheduler: Arc<CronScheduler>,
    /// `None` when no broker is configured: nothing to consume from.
    pub workers: Option<Arc<WorkerPool>>,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for AppServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppServices")
            .field("config", &self.config)
            .field("broker_available", &self.queue.is_available())
            .finish_non_exhaustive()
    }
}

struct Stores {
    audit: Arc<dyn AuditStore>,
    dead_letters: Arc<dyn DeadLetterRepository>,
    schedules: Arc<dyn ScheduleRepository>,
}

async fn build_stores(config: &TaskforgeConfig) -> anyhow::Result<Stores> {
    match &config.database_url {
        Some(url) => {
            let stores = Arc::new(PostgresStores::connect(url).await.context("connecting to postgres")?);
            stores.migrate().await.context("running migrations")?;
            tracing::info!("using postgres stores");
            Ok(Stores {
                audit: stores.clone(),
                dead_letters: stores.clone(),
                schedules: stores,
            })
        }
        None => {
            let stores = InMemoryStores::arc();
            Ok(Stores {
                audit: stores.clone(),
                dead_letters: stores.clone(),
                schedules: stores,
            })
        }
    }
}

async fn build_broker(config: &TaskforgeConfig) -> anyhow::Result<Option<Arc<dyn MessageBroker>>> {
    match config.broker {
        BrokerKind::None => {
            tracing::warn!("no message broker configured; queue operations will degrade");
            Ok(None)
        }
        BrokerKind::Memory => Ok(Some(in_memory_broker(config))),
        BrokerKind::Redis => {
            #[cfg(feature = "redis")]
            {
                let url = config.redis_url.as_deref().context("REDIS_URL must be set")?;
                let broker = taskforge_infra::broker::RedisBroker::connect(url, None)
                    .await
                    .context("connecting to redis")?
                    .with_retention(config.keep_completed);
                tracing::info!("using redis broker");
                Ok(Some(Arc::new(broker)))
            }
            #[cfg(not(feature = "redis"))]
            {
                tracing::warn!("TASKFORGE_BROKER=redis but redis feature not enabled, falling back to in-memory");
                Ok(Some(in_memory_broker(config)))
            }
        }
    }
}

fn in_memory_broker(config: &TaskforgeConfig) -> Arc<dyn MessageBroker> {
    Arc::new(InMemoryBroker::new().with_retention(config.keep_completed))
}

/// Handlers every worker queue runs with.
pub fn default_handlers() -> HandlerRegistry {
    HandlerRegistry::new()
        .with("system.echo", CapabilityHandler::new().with(EchoCapability))
        .with("capability.*", CapabilityHandler::new().with(EchoCapability))
}

pub async fn build_services(config: TaskforgeConfig) -> anyhow::Result<AppServices> {
    let stores = build_stores(&config).await?;
    let broker = build_broker(&config).await?;

    let queue = Arc::new(QueueManager::new(broker.clone(), stores.audit.clone()));
    let dead_letters = Arc::new(DeadLetterService::new(stores.dead_letters, queue.clone()));
    let scheduler = Arc::new(CronScheduler::new(queue.clone(), stores.schedules));

    let workers = broker.map(|broker| {
        let mut worker_config = WorkerConfig::default()
            .with_poll_interval(config.poll_interval)
            .with_stalled_after(Some(config.stalled_after));
        if let Some(timeout) = config.job_timeout {
            worker_config = worker_config.with_job_timeout(timeout);
        }
        Arc::new(WorkerPool::new(broker, stores.audit, dead_letters.clone(), worker_config))
    });

    let (shutdown, _) = watch::channel(false);
    Ok(AppServices {
        config,
        queue,
        dead_letters,
        scheduler,
        workers,
        shutdown,
    })
}

impl AppServices {
    /// Register processors for the configured queues, re-arm persisted
    /// schedules and start the cron ticker.
    pub async fn start(&self) -> anyhow::Result<Vec<JoinHandle<()>>> {
        if let Some(workers) = &self.workers {
            for spec in &self.config.queues {
                workers.register_processor(spec.name.clone(), default_handlers().into_handler(), spec.concurrency);
            }
            workers.start_stalled_sweeper();
        }

        if self.queue.is_available() {
            self.scheduler.restore().await.context("restoring schedules")?;
        }

        let ticker = self
            .scheduler
            .clone()
            .spawn_ticker(self.config.cron_tick, self.shutdown.subscribe());
        Ok(vec![ticker])
    }

    /// Stop the ticker and drain the worker slots.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        if let Some(workers) = &self.workers {
            workers.shutdown().await;
        }
    }
}
