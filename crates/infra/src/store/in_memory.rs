//! In-memory stores for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use taskforge_core::{
    AuditId, BrokerJobId, CronSchedule, DeadLetterEntry, DeadLetterId, DeadLetterStats, JobAuditRecord,
    PrincipalId, ScheduleId,
};

use super::{AuditStore, AuditUpdate, DeadLetterFilter, DeadLetterRepository, ScheduleRepository, StoreError};

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// All three stores behind one handle.
#[derive(Debug, Default)]
pub struct InMemoryStores {
    audits: RwLock<HashMap<AuditId, JobAuditRecord>>,
    dead_letters: RwLock<HashMap<DeadLetterId, DeadLetterEntry>>,
    schedules: RwLock<HashMap<ScheduleId, CronSchedule>>,
}

impl InMemoryStores {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Snapshot of every audit record, oldest first.
    pub fn audit_records(&self) -> Vec<JobAuditRecord> {
        let mut records: Vec<_> = read(&self.audits).values().cloned().collect();
        records.sort_by_key(|r| (r.created_at, *r.id.as_uuid()));
        records
    }
}

#[async_trait]
impl AuditStore for InMemoryStores {
    async fn insert(&self, record: JobAuditRecord) -> Result<AuditId, StoreError> {
        let mut audits = write(&self.audits);
        if audits.contains_key(&record.id) {
            return Err(StoreError::Conflict(format!("audit {} already exists", record.id)));
        }
        let id = record.id;
        audits.insert(id, record);
        Ok(id)
    }

    async fn get(&self, id: AuditId) -> Result<Option<JobAuditRecord>, StoreError> {
        Ok(read(&self.audits).get(&id).cloned())
    }

    async fn apply(&self, id: AuditId, update: AuditUpdate) -> Result<(), StoreError> {
        let mut audits = write(&self.audits);
        let record = audits
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("audit {id}")))?;
        update.apply_to(record);
        Ok(())
    }
}

#[async_trait]
impl DeadLetterRepository for InMemoryStores {
    async fn insert(&self, entry: DeadLetterEntry) -> Result<DeadLetterId, StoreError> {
        let mut entries = write(&self.dead_letters);
        let duplicate = entries.values().any(|e| {
            !e.is_resolved() && e.queue == entry.queue && e.broker_job_id == entry.broker_job_id
        });
        if duplicate {
            return Err(StoreError::Conflict(format!(
                "unresolved dead letter for job {} already exists",
                entry.broker_job_id
            )));
        }
        let id = entry.id;
        entries.insert(id, entry);
        Ok(id)
    }

    async fn get(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>, StoreError> {
        Ok(read(&self.dead_letters).get(&id).cloned())
    }

    async fn list_unresolved(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let mut entries: Vec<_> = read(&self.dead_letters)
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        // Ids are UUIDv7, so they break ties in creation order.
        entries.sort_by(|a, b| {
            b.failed_at
                .cmp(&a.failed_at)
                .then_with(|| b.id.as_uuid().cmp(a.id.as_uuid()))
        });
        entries.truncate(filter.limit);
        Ok(entries)
    }

    async fn mark_resolved(&self, id: DeadLetterId, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut entries = write(&self.dead_letters);
        match entries.get_mut(&id) {
            Some(entry) if entry.resolved_at.is_none() => {
                entry.resolved_at = Some(at);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(format!("dead letter {id}"))),
        }
    }

    async fn reopen(&self, id: DeadLetterId, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut entries = write(&self.dead_letters);
        match entries.get_mut(&id) {
            Some(entry) if entry.resolved_at == Some(at) => {
                entry.resolved_at = None;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(format!("dead letter {id}"))),
        }
    }

    async fn find_unresolved_by_job(
        &self,
        queue: &str,
        broker_job_id: &BrokerJobId,
    ) -> Result<Option<DeadLetterEntry>, StoreError> {
        Ok(read(&self.dead_letters)
            .values()
            .find(|e| !e.is_resolved() && e.queue == queue && &e.broker_job_id == broker_job_id)
            .cloned())
    }

    async fn stats(&self) -> Result<DeadLetterStats, StoreError> {
        Ok(DeadLetterStats::from_entries(read(&self.dead_letters).values()))
    }
}

#[async_trait]
impl ScheduleRepository for InMemoryStores {
    async fn upsert(&self, mut schedule: CronSchedule) -> Result<CronSchedule, StoreError> {
        let mut schedules = write(&self.schedules);
        let existing = schedules
            .values()
            .find(|s| s.name == schedule.name && s.owner == schedule.owner)
            .map(|s| (s.id, s.created_at));
        if let Some((id, created_at)) = existing {
            schedule.id = id;
            schedule.created_at = created_at;
        }
        schedule.updated_at = Utc::now();
        schedules.insert(schedule.id, schedule.clone());
        Ok(schedule)
    }

    async fn get(&self, id: ScheduleId) -> Result<Option<CronSchedule>, StoreError> {
        Ok(read(&self.schedules).get(&id).cloned())
    }

    async fn find_by_name(&self, name: &str, owner: PrincipalId) -> Result<Option<CronSchedule>, StoreError> {
        Ok(read(&self.schedules)
            .values()
            .find(|s| s.name == name && s.owner == owner)
            .cloned())
    }

    async fn list(&self, owner: Option<PrincipalId>) -> Result<Vec<CronSchedule>, StoreError> {
        let mut schedules: Vec<_> = read(&self.schedules)
            .values()
            .filter(|s| owner.is_none_or(|o| o == s.owner))
            .cloned()
            .collect();
        schedules.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.created_at.cmp(&b.created_at)));
        Ok(schedules)
    }

    async fn update(&self, schedule: &CronSchedule) -> Result<(), StoreError> {
        let mut schedules = write(&self.schedules);
        let slot = schedules
            .get_mut(&schedule.id)
            .ok_or_else(|| StoreError::NotFound(format!("schedule {}", schedule.id)))?;
        *slot = schedule.clone();
        slot.updated_at = Utc::now();
        Ok(())
    }

    async fn delete(&self, id: ScheduleId) -> Result<bool, StoreError> {
        Ok(write(&self.schedules).remove(&id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskforge_core::JobPayload;

    fn dead_letter(queue: &str, job: &str) -> DeadLetterEntry {
        DeadLetterEntry::new(queue, "send", BrokerJobId::new(job), JobPayload::new(), "boom", 3, PrincipalId::new())
    }

    #[tokio::test]
    async fn second_unresolved_entry_for_same_job_is_rejected() {
        let store = InMemoryStores::new();
        DeadLetterRepository::insert(&store, dead_letter("q", "7")).await.unwrap();
        let again = DeadLetterRepository::insert(&store, dead_letter("q", "7")).await;
        assert!(matches!(again, Err(StoreError::Conflict(_))));
        // Same broker id on another queue is a different job.
        DeadLetterRepository::insert(&store, dead_letter("other", "7")).await.unwrap();
    }

    #[tokio::test]
    async fn resolution_is_set_once() {
        let store = InMemoryStores::new();
        let id = DeadLetterRepository::insert(&store, dead_letter("q", "1")).await.unwrap();
        let first = Utc::now();
        assert!(store.mark_resolved(id, first).await.unwrap());
        assert!(!store.mark_resolved(id, Utc::now()).await.unwrap());
        let entry = DeadLetterRepository::get(&store, id).await.unwrap().unwrap();
        assert_eq!(entry.resolved_at, Some(first));
    }

    #[tokio::test]
    async fn unresolved_listing_is_newest_first_and_limited() {
        let store = InMemoryStores::new();
        for job in ["1", "2", "3"] {
            DeadLetterRepository::insert(&store, dead_letter("q", job)).await.unwrap();
        }
        let filter = DeadLetterFilter {
            limit: 2,
            ..DeadLetterFilter::for_queue("q")
        };
        let listed = store.list_unresolved(&filter).await.unwrap();
        let jobs: Vec<&str> = listed.iter().map(|e| e.broker_job_id.as_str()).collect();
        assert_eq!(jobs, vec!["3", "2"]);
    }

    #[tokio::test]
    async fn upsert_keeps_identity_per_name_and_owner() {
        let store = InMemoryStores::new();
        let owner = PrincipalId::new();
        let first = store
            .upsert(CronSchedule::new("nightly", owner, "0 2 * * *", "q", "j", JobPayload::new()))
            .await
            .unwrap();
        let second = store
            .upsert(CronSchedule::new("nightly", owner, "0 3 * * *", "q", "j", JobPayload::new()))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.pattern, "0 3 * * *");
        assert_eq!(store.list(Some(owner)).await.unwrap().len(), 1);

        // Another owner gets its own record.
        store
            .upsert(CronSchedule::new("nightly", PrincipalId::new(), "0 2 * * *", "q", "j", JobPayload::new()))
            .await
            .unwrap();
        assert_eq!(store.list(None).await.unwrap().len(), 2);
    }
}
