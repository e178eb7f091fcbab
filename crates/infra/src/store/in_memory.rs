use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use contentflow_core::{ExpectedVersion, JobId};
use contentflow_jobs::JobRecord;

use super::r#trait::{JobFilter, JobStore, JobStoreError};

fn poisoned() -> JobStoreError {
    JobStoreError::Storage("lock poisoned".to_string())
}

/// In-memory job store.
///
/// Intended for tests/dev and single-process deployments. The write lock is
/// held only for the compare-and-swap itself, never across a transition.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.jobs.read().map(|jobs| jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl JobStore for InMemoryJobStore {
    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        Ok(jobs.get(&id).cloned())
    }

    async fn insert(&self, record: JobRecord) -> Result<JobRecord, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        if jobs.contains_key(&record.id) {
            return Err(JobStoreError::AlreadyExists(record.id));
        }
        jobs.insert(record.id, record.clone());
        Ok(record)
    }

    async fn update(
        &self,
        mut record: JobRecord,
        expected: ExpectedVersion,
    ) -> Result<JobRecord, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        let stored = jobs
            .get_mut(&record.id)
            .ok_or(JobStoreError::NotFound(record.id))?;

        if !expected.matches(stored.version) {
            return Err(JobStoreError::Conflict {
                id: record.id,
                expected,
                actual: stored.version,
            });
        }

        record.version = stored.version + 1;
        *stored = record.clone();
        Ok(record)
    }

    async fn delete(&self, id: JobId) -> Result<bool, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        Ok(jobs.remove(&id).is_some())
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, JobStoreError> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect();
        drop(jobs);

        result.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        let limit = filter.limit.unwrap_or(usize::MAX);
        Ok(result.into_iter().skip(filter.offset).take(limit).collect())
    }
}
