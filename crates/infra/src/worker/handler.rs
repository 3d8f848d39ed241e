//! Job handlers and the name → handler registry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use taskforge_core::{AuditId, BrokerJobId, JobPayload, PrincipalId};

use crate::broker::BrokerJob;

/// What a handler sees of the job it runs.
#[derive(Debug, Clone, PartialEq)]
pub struct JobContext {
    pub id: BrokerJobId,
    pub queue: String,
    pub name: String,
    pub payload: JobPayload,
    /// Tries finished before this one.
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub principal: Option<PrincipalId>,
    pub audit_id: Option<AuditId>,
}

impl From<&BrokerJob> for JobContext {
    fn from(job: &BrokerJob) -> Self {
        Self {
            id: job.id.clone(),
            queue: job.queue.clone(),
            name: job.name.clone(),
            payload: job.payload.clone(),
            attempts_made: job.attempts_made,
            max_attempts: job.options.max_attempts,
            principal: job.options.principal,
            audit_id: job.audit_id,
        }
    }
}

impl JobContext {
    /// 1-based number of the try in progress.
    pub fn attempt(&self) -> u32 {
        self.attempts_made + 1
    }

    /// Required string field of the payload.
    pub fn str_field(&self, key: &str) -> Result<&str, HandlerError> {
        self.payload
            .get(key)
            .and_then(JsonValue::as_str)
            .ok_or_else(|| HandlerError::InvalidPayload(format!("missing string field '{key}'")))
    }
}

/// A failed try. Every variant feeds the retry / dead-letter path.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("job timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("no handler registered for job '{0}'")]
    NoHandler(String),
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        HandlerError::Failed(msg.into())
    }
}

/// Business logic invoked for each job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &JobContext) -> Result<JsonValue, HandlerError>;
}

#[async_trait]
impl<H: JobHandler + ?Sized> JobHandler for Arc<H> {
    async fn handle(&self, job: &JobContext) -> Result<JsonValue, HandlerError> {
        (**self).handle(job).await
    }
}

/// Adapter for async closures; see [`handler_fn`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<JsonValue, HandlerError>> + Send,
{
    async fn handle(&self, job: &JobContext) -> Result<JsonValue, HandlerError> {
        (self.0)(job.clone()).await
    }
}

/// Wrap an async closure as a [`JobHandler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<JsonValue, HandlerError>> + Send,
{
    FnHandler(f)
}

/// Job name → handler.
///
/// Lookup order: exact name, then the longest `prefix.*` pattern, then `*`.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("HandlerRegistry").field("handlers", &names).finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `pattern`, replacing any previous one.
    pub fn register(&mut self, pattern: impl Into<String>, handler: impl JobHandler + 'static) -> &mut Self {
        self.handlers.insert(pattern.into(), Arc::new(handler));
        self
    }

    pub fn with(mut self, pattern: impl Into<String>, handler: impl JobHandler + 'static) -> Self {
        self.register(pattern, handler);
        self
    }

    pub fn get(&self, job_name: &str) -> Option<&Arc<dyn JobHandler>> {
        if let Some(handler) = self.handlers.get(job_name) {
            return Some(handler);
        }

        let category = self
            .handlers
            .iter()
            .filter_map(|(pattern, handler)| {
                let prefix = pattern.strip_suffix(".*")?;
                job_name
                    .strip_prefix(prefix)
                    .filter(|rest| rest.starts_with('.'))
                    .map(|_| (prefix.len(), handler))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, handler)| handler);

        category.or_else(|| self.handlers.get("*"))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn into_handler(self) -> RegistryHandler {
        RegistryHandler {
            registry: Arc::new(self),
        }
    }
}

/// Dispatches by job name; unknown names fail with [`HandlerError::NoHandler`].
#[derive(Debug, Clone)]
pub struct RegistryHandler {
    registry: Arc<HandlerRegistry>,
}

impl RegistryHandler {
    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }
}

#[async_trait]
impl JobHandler for RegistryHandler {
    async fn handle(&self, job: &JobContext) -> Result<JsonValue, HandlerError> {
        match self.registry.get(&job.name) {
            Some(handler) => handler.handle(job).await,
            None => Err(HandlerError::NoHandler(job.name.clone())),
        }
    }
}
