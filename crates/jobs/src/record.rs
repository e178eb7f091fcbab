//! The persisted job entity and its derived queries.

use core::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use contentflow_core::{DomainError, JobId, SourceId};

use crate::Metadata;
use crate::registry::{JobType, JobTypeRegistry};

/// Lifecycle status of a job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Retrying,
    PermanentlyFailed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 7] = [
        JobStatus::Queued,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Retrying,
        JobStatus::PermanentlyFailed,
        JobStatus::Cancelled,
    ];

    /// No transition leaves a terminal status.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::PermanentlyFailed | JobStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Retrying => "retrying",
            JobStatus::PermanentlyFailed => "permanently_failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job status '{s}'")))
    }
}

fn default_retryable() -> bool {
    true
}

/// Failure recorded against a job.
///
/// `is_retryable` drives the retry decision, so callers classify their errors
/// once here instead of the lifecycle hardcoding error kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default = "default_retryable")]
    pub is_retryable: bool,
}

impl JobError {
    pub const STALE_CODE: &'static str = "STALE_JOB";

    /// A retryable error without a code.
    pub fn new(message: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            message: message.into(),
            code: None,
            timestamp,
            is_retryable: true,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn retryable(mut self, is_retryable: bool) -> Self {
        self.is_retryable = is_retryable;
        self
    }

    /// Synthetic error recorded when a job outlives its stale threshold.
    pub fn stale(timestamp: DateTime<Utc>, threshold: Duration) -> Self {
        Self::new(
            format!(
                "processing exceeded timeout threshold ({}ms)",
                threshold.as_millis()
            ),
            timestamp,
        )
        .with_code(Self::STALE_CODE)
    }
}

/// One accepted progress report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub at: DateTime<Utc>,
}

/// Processing metrics derived from a record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingMetrics {
    pub processing_duration_ms: Option<u64>,
    pub estimated_tokens: Option<u64>,
    pub estimated_cost: Option<f64>,
    pub progress_updates: u32,
    pub retry_attempts: u32,
}

/// Why a retry is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RetryBlock {
    #[error("job is {0}, only failed jobs can be retried")]
    NotFailed(JobStatus),
    #[error("last error is not retryable")]
    NonRetryableError,
    #[error("max attempts reached ({attempts}/{max})")]
    MaxAttemptsReached { attempts: u32, max: u32 },
}

/// Input for creating a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub job_type: JobType,
    pub source_id: SourceId,
    #[serde(default)]
    pub metadata: Option<Metadata>,
    /// Overrides the job type's `max_retries`.
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl NewJob {
    pub fn new(job_type: JobType, source_id: SourceId) -> Self {
        Self {
            job_type,
            source_id,
            metadata: None,
            max_retries: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// One unit of asynchronous work, as persisted.
///
/// Mutated only through [`crate::transition`]; `version` is owned by the store
/// and bumps on every successful write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub job_type: JobType,
    pub source_id: SourceId,
    pub status: JobStatus,
    pub progress: u8,
    pub result_count: u32,
    pub retry_count: u32,
    pub max_retries: Option<u32>,
    pub last_error: Option<JobError>,
    #[serde(default)]
    pub error_history: Vec<JobError>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub estimated_tokens: Option<u64>,
    pub estimated_cost: Option<f64>,
    pub estimated_remaining_ms: Option<u64>,
    #[serde(default)]
    pub progress_history: Vec<ProgressUpdate>,
    #[serde(default)]
    pub progress_updates: u32,
    pub metadata: Option<Metadata>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

impl JobRecord {
    /// A freshly queued record.
    pub fn new(id: JobId, new_job: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id,
            job_type: new_job.job_type,
            source_id: new_job.source_id,
            status: JobStatus::Queued,
            progress: 0,
            result_count: 0,
            retry_count: 0,
            max_retries: new_job.max_retries,
            last_error: None,
            error_history: Vec::new(),
            started_at: None,
            completed_at: None,
            cancelled_at: None,
            cancel_reason: None,
            next_retry_at: None,
            duration_ms: None,
            estimated_tokens: None,
            estimated_cost: None,
            estimated_remaining_ms: None,
            progress_history: Vec::new(),
            progress_updates: 0,
            metadata: new_job.metadata,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// `max_retries` override, else the job type's default.
    pub fn effective_max_retries(&self, registry: &JobTypeRegistry) -> u32 {
        self.max_retries
            .unwrap_or_else(|| registry.config_for(self.job_type).max_retries)
    }

    /// The reason a retry would be refused right now, if any.
    ///
    /// Exhaustion is reported ahead of a non-retryable error: a job that has
    /// used up its attempts is finished regardless of how it failed.
    pub fn retry_block(&self, registry: &JobTypeRegistry) -> Option<RetryBlock> {
        if self.status != JobStatus::Failed {
            return Some(RetryBlock::NotFailed(self.status));
        }
        let max = self.effective_max_retries(registry);
        if self.retry_count >= max {
            return Some(RetryBlock::MaxAttemptsReached {
                attempts: self.retry_count,
                max,
            });
        }
        if self.last_error.as_ref().is_some_and(|e| !e.is_retryable) {
            return Some(RetryBlock::NonRetryableError);
        }
        None
    }

    pub fn can_retry(&self, registry: &JobTypeRegistry) -> bool {
        self.retry_block(registry).is_none()
    }

    /// Milliseconds since the current attempt started (0 if never started).
    pub fn elapsed_ms(&self, now: DateTime<Utc>) -> u64 {
        self.started_at
            .map(|started| elapsed_between(started, now))
            .unwrap_or(0)
    }

    /// PROCESSING for longer than the type's stale threshold.
    pub fn is_stale(&self, registry: &JobTypeRegistry, now: DateTime<Utc>) -> bool {
        if self.status != JobStatus::Processing || self.started_at.is_none() {
            return false;
        }
        self.elapsed_ms(now) > registry.config_for(self.job_type).stale_threshold_ms
    }

    /// Backoff the next retry of this job waits for.
    pub fn backoff_delay(&self, registry: &JobTypeRegistry) -> Duration {
        registry.calculate_backoff(self.job_type, self.retry_count)
    }

    pub fn metrics(&self) -> ProcessingMetrics {
        ProcessingMetrics {
            processing_duration_ms: self.duration_ms,
            estimated_tokens: self.estimated_tokens,
            estimated_cost: self.estimated_cost,
            progress_updates: self.progress_updates,
            retry_attempts: self.retry_count,
        }
    }
}

/// Whole milliseconds between two instants, rounded up so any positive span
/// is at least 1ms. Negative spans (clock skew) count as 0.
pub(crate) fn elapsed_between(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    let micros = (to - from).num_microseconds().unwrap_or(i64::MAX);
    if micros <= 0 {
        return 0;
    }
    (micros as u64).div_ceil(1_000)
}
