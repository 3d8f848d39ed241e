//! Dead Letter service: operator triage for jobs whose attempts ran out.
//!
//! Entries are authoritative records. A failed write fails the operation,
//! unlike the audit mirror.

use std::sync::Arc;

use chrono::{SubsecRound, Utc};
use tracing::{debug, error, info, instrument, warn};

use taskforge_core::{
    BackoffPolicy, BrokerJobId, DEFAULT_MAX_ATTEMPTS, DeadLetterEntry, DeadLetterId, DeadLetterStats, JobOptions,
    JobPayload, PrincipalId,
};

use crate::queue::{EnqueuedJob, QueueError, QueueManager};
use crate::store::{DeadLetterFilter, DeadLetterRepository, StoreError};

/// Filter accepted by [`DeadLetterService::list_entries`].
pub type ListFilter = DeadLetterFilter;

#[derive(Debug, Clone, thiserror::Error)]
pub enum DeadLetterError {
    #[error("dead letter entry not found: {0}")]
    NotFound(DeadLetterId),

    #[error("dead letter entry {0} is already resolved")]
    AlreadyResolved(DeadLetterId),

    #[error("requeue failed: {0}")]
    Requeue(#[from] QueueError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone)]
pub struct DeadLetterService {
    repo: Arc<dyn DeadLetterRepository>,
    queue: Arc<QueueManager>,
}

impl std::fmt::Debug for DeadLetterService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterService")
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl DeadLetterService {
    pub fn new(repo: Arc<dyn DeadLetterRepository>, queue: Arc<QueueManager>) -> Self {
        Self { repo, queue }
    }

    /// Record a permanently failed job.
    ///
    /// A job already holding an unresolved entry gets that entry's id back
    /// instead of a second record.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip_all, fields(queue = %queue, job_name = %job_name, job_id = %broker_job_id), err)]
    pub async fn add_entry(
        &self,
        queue: &str,
        job_name: &str,
        broker_job_id: BrokerJobId,
        payload: JobPayload,
        error: &str,
        attempts_made: u32,
        principal: PrincipalId,
    ) -> Result<DeadLetterId, DeadLetterError> {
        match self.repo.find_unresolved_by_job(queue, &broker_job_id).await {
            Ok(Some(existing)) => {
                debug!(entry_id = %existing.id, "dead letter already recorded");
                return Ok(existing.id);
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "dead letter lookup failed"),
        }

        let entry = DeadLetterEntry::new(queue, job_name, broker_job_id, payload, error, attempts_made, principal);
        let id = self.repo.insert(entry).await?;
        warn!(entry_id = %id, attempts_made, error = %error, "job dead-lettered");
        Ok(id)
    }

    /// Unresolved entries, newest first.
    pub async fn list_entries(&self, filter: &ListFilter) -> Result<Vec<DeadLetterEntry>, DeadLetterError> {
        Ok(self.repo.list_unresolved(filter).await?)
    }

    pub async fn get(&self, id: DeadLetterId) -> Result<DeadLetterEntry, DeadLetterError> {
        self.repo.get(id).await?.ok_or(DeadLetterError::NotFound(id))
    }

    /// Resubmit the entry's payload with a fresh attempts budget.
    ///
    /// The entry is claimed (marked resolved) before the broker is touched,
    /// so concurrent requeues submit at most one job. A rejected submission
    /// reopens the entry.
    #[instrument(skip_all, fields(entry_id = %id), err)]
    pub async fn requeue(&self, id: DeadLetterId) -> Result<EnqueuedJob, DeadLetterError> {
        let entry = self.get(id).await?;
        if entry.is_resolved() {
            return Err(DeadLetterError::AlreadyResolved(id));
        }

        // Postgres keeps microseconds; the claim must compare equal on reopen.
        let claimed_at = Utc::now().trunc_subsecs(6);
        match self.repo.mark_resolved(id, claimed_at).await {
            Ok(true) => {}
            Ok(false) => return Err(DeadLetterError::AlreadyResolved(id)),
            Err(StoreError::NotFound(_)) => return Err(DeadLetterError::NotFound(id)),
            Err(e) => return Err(e.into()),
        }

        let options = JobOptions::for_principal(entry.principal)
            .with_max_attempts(DEFAULT_MAX_ATTEMPTS)
            .with_backoff(BackoffPolicy::default());
        let added = match self
            .queue
            .add_job(&entry.queue, &entry.job_name, entry.payload.clone(), options)
            .await
        {
            Ok(added) => added,
            Err(e) => {
                match self.repo.reopen(id, claimed_at).await {
                    Ok(true) => {}
                    Ok(false) => warn!(entry_id = %id, "entry changed while requeue was in flight; left as is"),
                    Err(reopen) => error!(entry_id = %id, error = %reopen, "requeue failed and entry could not be reopened"),
                }
                return Err(e.into());
            }
        };

        info!(entry_id = %id, queue = %entry.queue, job_id = %added.job_id, "dead letter requeued");
        Ok(added)
    }

    /// Acknowledge without retrying.
    #[instrument(skip_all, fields(entry_id = %id), err)]
    pub async fn resolve(&self, id: DeadLetterId) -> Result<(), DeadLetterError> {
        match self.repo.mark_resolved(id, Utc::now()).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(DeadLetterError::AlreadyResolved(id)),
            Err(StoreError::NotFound(_)) => Err(DeadLetterError::NotFound(id)),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_stats(&self) -> Result<DeadLetterStats, DeadLetterError> {
        Ok(self.repo.stats().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{InMemoryBroker, MessageBroker};
    use crate::store::InMemoryStores;
    use taskforge_core::JobState;

    struct Fixture {
        broker: Arc<InMemoryBroker>,
        service: DeadLetterService,
    }

    fn fixture() -> Fixture {
        let broker = InMemoryBroker::arc();
        let stores = InMemoryStores::arc();
        let queue = Arc::new(QueueManager::new(Some(broker.clone()), stores.clone()));
        Fixture {
            broker,
            service: DeadLetterService::new(stores, queue),
        }
    }

    async fn entry(service: &DeadLetterService, queue: &str, job: &str) -> DeadLetterId {
        service
            .add_entry(queue, job, BrokerJobId::new(job), JobPayload::new(), "boom", 3, PrincipalId::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn requeue_submits_with_fresh_budget_and_resolves() {
        let f = fixture();
        let id = entry(&f.service, "emails", "send").await;

        let added = f.service.requeue(id).await.unwrap();
        let job = f.broker.get_job("emails", &added.job_id).await.unwrap().unwrap();
        assert_eq!(job.attempts_made, 0);
        assert_eq!(job.options.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(job.state, JobState::Waiting);

        assert!(f.service.get(id).await.unwrap().is_resolved());
        assert!(f.service.list_entries(&ListFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn requeue_of_resolved_entry_touches_nothing() {
        let f = fixture();
        let id = entry(&f.service, "emails", "send").await;
        f.service.resolve(id).await.unwrap();

        assert!(matches!(
            f.service.requeue(id).await,
            Err(DeadLetterError::AlreadyResolved(_))
        ));
        assert_eq!(f.broker.counts("emails").await.unwrap().waiting, 0);
    }

    #[tokio::test]
    async fn unknown_entry_is_not_found() {
        let f = fixture();
        let id = DeadLetterId::new();
        assert!(matches!(f.service.requeue(id).await, Err(DeadLetterError::NotFound(_))));
        assert!(matches!(f.service.resolve(id).await, Err(DeadLetterError::NotFound(_))));
    }

    #[tokio::test]
    async fn failed_resubmission_leaves_entry_unresolved() {
        let stores = InMemoryStores::arc();
        let queue = Arc::new(QueueManager::new(None, stores.clone()));
        let service = DeadLetterService::new(stores, queue);
        let id = entry(&service, "emails", "send").await;

        assert!(matches!(
            service.requeue(id).await,
            Err(DeadLetterError::Requeue(QueueError::BrokerUnavailable))
        ));
        assert!(!service.get(id).await.unwrap().is_resolved());
    }

    #[tokio::test]
    async fn second_entry_for_same_job_returns_the_first() {
        let f = fixture();
        let job = BrokerJobId::new("7");
        let add = || {
            f.service
                .add_entry("emails", "send", job.clone(), JobPayload::new(), "boom", 3, PrincipalId::new())
        };
        let first = add().await.unwrap();
        let second = add().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(f.service.get_stats().await.unwrap().total, 1);
    }

    /// Wraps the in-memory repository and fails the calls it is told to.
    struct FaultyRepo {
        inner: Arc<InMemoryStores>,
        fail_resolve: bool,
    }

    #[async_trait::async_trait]
    impl DeadLetterRepository for FaultyRepo {
        async fn insert(&self, entry: DeadLetterEntry) -> Result<DeadLetterId, StoreError> {
            DeadLetterRepository::insert(&*self.inner, entry).await
        }
        async fn get(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>, StoreError> {
            DeadLetterRepository::get(&*self.inner, id).await
        }
        async fn list_unresolved(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterEntry>, StoreError> {
            self.inner.list_unresolved(filter).await
        }
        async fn mark_resolved(&self, id: DeadLetterId, at: chrono::DateTime<Utc>) -> Result<bool, StoreError> {
            if self.fail_resolve {
                return Err(StoreError::Backend("connection reset".into()));
            }
            self.inner.mark_resolved(id, at).await
        }
        async fn reopen(&self, id: DeadLetterId, at: chrono::DateTime<Utc>) -> Result<bool, StoreError> {
            self.inner.reopen(id, at).await
        }
        async fn find_unresolved_by_job(
            &self,
            queue: &str,
            broker_job_id: &BrokerJobId,
        ) -> Result<Option<DeadLetterEntry>, StoreError> {
            self.inner.find_unresolved_by_job(queue, broker_job_id).await
        }
        async fn stats(&self) -> Result<DeadLetterStats, StoreError> {
            self.inner.stats().await
        }
    }

    #[tokio::test]
    async fn failed_claim_surfaces_and_submits_nothing() {
        let broker = InMemoryBroker::arc();
        let stores = InMemoryStores::arc();
        let queue = Arc::new(QueueManager::new(Some(broker.clone()), stores.clone()));
        let repo = Arc::new(FaultyRepo {
            inner: stores,
            fail_resolve: true,
        });
        let service = DeadLetterService::new(repo, queue);
        let id = entry(&service, "emails", "send").await;

        assert!(matches!(service.requeue(id).await, Err(DeadLetterError::Store(_))));
        assert_eq!(broker.counts("emails").await.unwrap().waiting, 0);
        assert!(!service.get(id).await.unwrap().is_resolved());
    }

    #[tokio::test]
    async fn concurrent_requeues_submit_one_job() {
        let f = fixture();
        let id = entry(&f.service, "emails", "send").await;

        let (a, b) = tokio::join!(f.service.requeue(id), f.service.requeue(id));
        assert_eq!([&a, &b].iter().filter(|r| r.is_ok()).count(), 1);
        assert!([&a, &b].iter().any(|r| matches!(r, Err(DeadLetterError::AlreadyResolved(_)))));
        assert_eq!(f.broker.counts("emails").await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn listing_filters_and_stats_count_per_queue() {
        let f = fixture();
        entry(&f.service, "emails", "a").await;
        entry(&f.service, "emails", "b").await;
        let other = entry(&f.service, "reports", "c").await;
        f.service.resolve(other).await.unwrap();

        let emails = f.service.list_entries(&ListFilter::for_queue("emails")).await.unwrap();
        assert_eq!(emails.len(), 2);
        assert_eq!(emails[0].job_name, "b");

        let stats = f.service.get_stats().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.unresolved, 2);
        assert_eq!(stats.by_queue.get("emails"), Some(&2));
    }
}
