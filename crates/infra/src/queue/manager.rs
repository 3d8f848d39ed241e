use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument, warn};

use taskforge_core::{AuditId, BrokerJobId, DomainError, JobAuditRecord, JobOptions, JobPayload, JobState};

use crate::broker::{BrokerError, BrokerJob, EnqueueRequest, JobRange, MessageBroker, QueueMetrics};
use crate::side_effect::{SideEffect, fire_and_log};
use crate::store::{AuditStore, AuditUpdate};

/// Public Queue Manager error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("no message broker is configured")]
    BrokerUnavailable,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl From<DomainError> for QueueError {
    fn from(e: DomainError) -> Self {
        QueueError::InvalidInput(e.to_string())
    }
}

/// A job the broker accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueuedJob {
    pub job_id: BrokerJobId,
    /// Outcome of the best-effort audit insert.
    pub audit: SideEffect<AuditId>,
}

impl EnqueuedJob {
    pub fn audit_id(&self) -> Option<AuditId> {
        self.audit.as_applied().copied()
    }
}

pub type AddJobResult = Result<EnqueuedJob, QueueError>;

/// Submits jobs to the broker and mirrors them to the audit store.
///
/// Built without a broker it stays usable: submissions fail with
/// [`QueueError::BrokerUnavailable`] and reads return neutral values.
#[derive(Clone)]
pub struct QueueManager {
    broker: Option<Arc<dyn MessageBroker>>,
    audit: Arc<dyn AuditStore>,
}

impl std::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager")
            .field("broker", &self.broker.is_some())
            .finish_non_exhaustive()
    }
}

fn validate_name(kind: &str, value: &str) -> Result<(), QueueError> {
    if value.trim().is_empty() {
        return Err(QueueError::InvalidInput(format!("{kind} must not be empty")));
    }
    Ok(())
}

impl QueueManager {
    pub fn new(broker: Option<Arc<dyn MessageBroker>>, audit: Arc<dyn AuditStore>) -> Self {
        Self { broker, audit }
    }

    pub fn is_available(&self) -> bool {
        self.broker.is_some()
    }

    pub fn broker(&self) -> Option<&Arc<dyn MessageBroker>> {
        self.broker.as_ref()
    }

    pub fn audit_store(&self) -> &Arc<dyn AuditStore> {
        &self.audit
    }

    /// Audit first (best-effort), then enqueue.
    #[instrument(skip_all, fields(queue = %queue, job_name = %job_name))]
    pub async fn add_job(&self, queue: &str, job_name: &str, payload: JobPayload, options: JobOptions) -> AddJobResult {
        validate_name("queue name", queue)?;
        validate_name("job name", job_name)?;
        let principal = options.validate()?;
        let broker = self.broker.as_ref().ok_or(QueueError::BrokerUnavailable)?;

        let record = JobAuditRecord::new(queue, job_name, payload.clone(), &options, principal);
        let audit = fire_and_log("audit.insert", self.audit.insert(record)).await;

        let mut request = EnqueueRequest::new(queue, job_name, payload, options);
        if let Some(audit_id) = audit.as_applied() {
            request = request.with_audit_id(*audit_id);
        }

        match broker.enqueue(request).await {
            Ok(job_id) => {
                if let Some(audit_id) = audit.as_applied() {
                    fire_and_log(
                        "audit.enqueued",
                        self.audit.apply(
                            *audit_id,
                            AuditUpdate::Enqueued {
                                broker_job_id: job_id.clone(),
                            },
                        ),
                    )
                    .await;
                }
                info!(job_id = %job_id, "job added");
                Ok(EnqueuedJob { job_id, audit })
            }
            Err(e) => {
                warn!(error = %e, "broker rejected job");
                if let Some(audit_id) = audit.as_applied() {
                    fire_and_log(
                        "audit.rejected",
                        self.audit.apply(
                            *audit_id,
                            AuditUpdate::Rejected {
                                error: e.to_string(),
                                at: Utc::now(),
                            },
                        ),
                    )
                    .await;
                }
                Err(QueueError::Broker(e))
            }
        }
    }

    pub async fn get_job_status(&self, queue: &str, id: &BrokerJobId) -> Option<BrokerJob> {
        let broker = self.broker.as_ref()?;
        broker
            .get_job(queue, id)
            .await
            .unwrap_or_else(|e| degrade("get_job_status", queue, e, None))
    }

    pub async fn list_jobs(&self, queue: &str, state: JobState, range: JobRange) -> Vec<BrokerJob> {
        let Some(broker) = self.broker.as_ref() else {
            return Vec::new();
        };
        broker
            .list_jobs(queue, state, range)
            .await
            .unwrap_or_else(|e| degrade("list_jobs", queue, e, Vec::new()))
    }

    pub async fn remove_job(&self, queue: &str, id: &BrokerJobId) -> bool {
        let Some(broker) = self.broker.as_ref() else {
            return false;
        };
        broker
            .remove_job(queue, id)
            .await
            .unwrap_or_else(|e| degrade("remove_job", queue, e, false))
    }

    /// Stop dispatching from `queue`; queued jobs stay put.
    pub async fn pause_queue(&self, queue: &str) -> bool {
        let Some(broker) = self.broker.as_ref() else {
            return false;
        };
        broker
            .pause(queue)
            .await
            .map(|()| true)
            .unwrap_or_else(|e| degrade("pause_queue", queue, e, false))
    }

    pub async fn resume_queue(&self, queue: &str) -> bool {
        let Some(broker) = self.broker.as_ref() else {
            return false;
        };
        broker
            .resume(queue)
            .await
            .map(|()| true)
            .unwrap_or_else(|e| degrade("resume_queue", queue, e, false))
    }

    pub async fn get_queue_metrics(&self, queue: &str) -> QueueMetrics {
        let Some(broker) = self.broker.as_ref() else {
            return QueueMetrics::default();
        };
        broker
            .counts(queue)
            .await
            .unwrap_or_else(|e| degrade("get_queue_metrics", queue, e, QueueMetrics::default()))
    }

    /// Persisted audit mirror of a job, if it was written.
    pub async fn get_audit(&self, id: AuditId) -> Option<JobAuditRecord> {
        self.audit.get(id).await.unwrap_or_else(|e| {
            warn!(audit_id = %id, error = %e, "audit lookup failed");
            None
        })
    }
}

fn degrade<T>(operation: &str, queue: &str, error: BrokerError, fallback: T) -> T {
    warn!(operation = %operation, queue = %queue, error = %error, "broker call failed; returning neutral result");
    fallback
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::store::InMemoryStores;
    use taskforge_core::PrincipalId;

    fn manager() -> (QueueManager, Arc<InMemoryStores>) {
        let stores = InMemoryStores::arc();
        let manager = QueueManager::new(Some(InMemoryBroker::arc()), stores.clone());
        (manager, stores)
    }

    #[tokio::test]
    async fn add_job_mirrors_to_audit() {
        let (manager, _) = manager();
        let options = JobOptions::for_principal(PrincipalId::new()).with_delay_ms(10_000);
        let added = manager.add_job("emails", "send", JobPayload::new(), options).await.unwrap();

        let audit = manager.get_audit(added.audit_id().unwrap()).await.unwrap();
        assert_eq!(audit.state, JobState::Delayed);
        assert_eq!(audit.broker_job_id, Some(added.job_id.clone()));

        let job = manager.get_job_status("emails", &added.job_id).await.unwrap();
        assert_eq!(job.audit_id, added.audit_id());
        assert_eq!(job.state, JobState::Delayed);
    }

    #[tokio::test]
    async fn missing_principal_is_rejected_before_enqueue() {
        let (manager, _) = manager();
        let result = manager
            .add_job("emails", "send", JobPayload::new(), JobOptions::default())
            .await;
        assert!(matches!(result, Err(QueueError::InvalidInput(_))));
        assert_eq!(manager.get_queue_metrics("emails").await.waiting, 0);
    }

    #[tokio::test]
    async fn blank_names_are_rejected() {
        let (manager, _) = manager();
        let options = JobOptions::for_principal(PrincipalId::new());
        assert!(manager.add_job(" ", "send", JobPayload::new(), options.clone()).await.is_err());
        assert!(manager.add_job("emails", "", JobPayload::new(), options).await.is_err());
    }

    #[tokio::test]
    async fn broker_less_manager_degrades() {
        let manager = QueueManager::new(None, InMemoryStores::arc());
        assert!(!manager.is_available());

        let options = JobOptions::for_principal(PrincipalId::new());
        let result = manager.add_job("q", "j", JobPayload::new(), options).await;
        assert!(matches!(result, Err(QueueError::BrokerUnavailable)));

        let id = BrokerJobId::new("1");
        assert!(manager.get_job_status("q", &id).await.is_none());
        assert!(manager.list_jobs("q", JobState::Waiting, JobRange::default()).await.is_empty());
        assert!(!manager.remove_job("q", &id).await);
        assert!(!manager.pause_queue("q").await);
        assert!(!manager.resume_queue("q").await);
        assert_eq!(manager.get_queue_metrics("q").await, QueueMetrics::default());
    }

    #[tokio::test]
    async fn pause_and_resume_report_success() {
        let (manager, _) = manager();
        assert!(manager.pause_queue("q").await);
        assert!(manager.get_queue_metrics("q").await.paused);
        assert!(manager.resume_queue("q").await);
        assert!(!manager.get_queue_metrics("q").await.paused);
    }
}
