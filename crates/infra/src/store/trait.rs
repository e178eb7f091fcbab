use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use contentflow_core::{ExpectedVersion, JobId, SourceId};
use contentflow_jobs::{JobRecord, JobStatus, JobType, NewJob};

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job already exists: {0}")]
    AlreadyExists(JobId),

    /// Someone else committed since the caller read the record.
    #[error("version conflict on job {id} (expected {expected:?}, found {actual})")]
    Conflict {
        id: JobId,
        expected: ExpectedVersion,
        actual: u64,
    },

    #[error("storage error: {0}")]
    Storage(String),
}

/// Selection over stored jobs. Empty filter matches everything.
///
/// Results are ordered by `created_at` (oldest first), ties broken by id, so
/// `offset`/`limit` paging is stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFilter {
    #[serde(default)]
    pub status: Option<JobStatus>,
    #[serde(default)]
    pub job_type: Option<JobType>,
    #[serde(default)]
    pub source_id: Option<SourceId>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

impl JobFilter {
    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_type(mut self, job_type: JobType) -> Self {
        self.job_type = Some(job_type);
        self
    }

    pub fn with_source(mut self, source_id: SourceId) -> Self {
        self.source_id = Some(source_id);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, record: &JobRecord) -> bool {
        self.status.is_none_or(|s| record.status == s)
            && self.job_type.is_none_or(|t| record.job_type == t)
            && self
                .source_id
                .as_ref()
                .is_none_or(|source| &record.source_id == source)
    }
}

/// Persistence for job records.
///
/// Implementations must make `update` atomic: the whole record is replaced
/// (status together with its metric and error fields) or nothing is.
#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError>;

    /// Persist a new record. Fails with `AlreadyExists` on a duplicate id.
    async fn insert(&self, record: JobRecord) -> Result<JobRecord, JobStoreError>;

    /// Replace a record if its stored version matches `expected`.
    ///
    /// Returns the stored record with `version` bumped by one.
    async fn update(
        &self,
        record: JobRecord,
        expected: ExpectedVersion,
    ) -> Result<JobRecord, JobStoreError>;

    /// Remove a record. Returns whether it existed.
    async fn delete(&self, id: JobId) -> Result<bool, JobStoreError>;

    async fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, JobStoreError>;

    /// Create a QUEUED record with a fresh id.
    async fn create(
        &self,
        new_job: NewJob,
        now: DateTime<Utc>,
    ) -> Result<JobRecord, JobStoreError> {
        self.insert(JobRecord::new(JobId::new(), new_job, now)).await
    }

    async fn query_by_status(&self, status: JobStatus) -> Result<Vec<JobRecord>, JobStoreError> {
        self.list(&JobFilter::default().with_status(status)).await
    }

    async fn query_by_type(&self, job_type: JobType) -> Result<Vec<JobRecord>, JobStoreError> {
        self.list(&JobFilter::default().with_type(job_type)).await
    }

    async fn query_by_source(&self, source_id: &SourceId) -> Result<Vec<JobRecord>, JobStoreError> {
        self.list(&JobFilter::default().with_source(source_id.clone()))
            .await
    }
}

#[async_trait::async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        (**self).get(id).await
    }

    async fn insert(&self, record: JobRecord) -> Result<JobRecord, JobStoreError> {
        (**self).insert(record).await
    }

    async fn update(
        &self,
        record: JobRecord,
        expected: ExpectedVersion,
    ) -> Result<JobRecord, JobStoreError> {
        (**self).update(record, expected).await
    }

    async fn delete(&self, id: JobId) -> Result<bool, JobStoreError> {
        (**self).delete(id).await
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, JobStoreError> {
        (**self).list(filter).await
    }
}
