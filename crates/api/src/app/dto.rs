use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use contentflow_core::{JobId, SourceId};
use contentflow_infra::{JobFilter, ScheduledRetry};
use contentflow_jobs::{
    CompletionMetrics, JobError, JobOutput, JobRecord, JobStatus, JobType, Metadata,
    ProcessingMetrics,
};

use crate::app::errors;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub job_type: String,
    pub source_id: String,
    pub metadata: Option<Metadata>,
    pub max_retries: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct ProgressRequest {
    pub progress: i64,
    pub message: Option<String>,
    pub metadata: Option<Metadata>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CompleteRequest {
    pub result_count: Option<u32>,
    pub data: Option<serde_json::Value>,
    pub estimated_tokens: Option<u64>,
    pub estimated_cost: Option<f64>,
}

impl CompleteRequest {
    pub fn into_parts(self) -> (Option<JobOutput>, Option<CompletionMetrics>) {
        let output = (self.result_count.is_some() || self.data.is_some()).then_some(JobOutput {
            result_count: self.result_count,
            data: self.data,
        });
        let metrics = (self.estimated_tokens.is_some() || self.estimated_cost.is_some()).then_some(
            CompletionMetrics {
                estimated_tokens: self.estimated_tokens,
                estimated_cost: self.estimated_cost,
            },
        );
        (output, metrics)
    }
}

fn default_retryable() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct FailRequest {
    pub message: String,
    pub code: Option<String>,
    #[serde(default = "default_retryable")]
    pub is_retryable: bool,
}

impl FailRequest {
    pub fn into_error(self, now: DateTime<Utc>) -> JobError {
        let error = JobError::new(self.message, now).retryable(self.is_retryable);
        match self.code {
            Some(code) => error.with_code(code),
            None => error,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ResumeRequest {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub job_type: Option<String>,
    pub source_id: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl ListJobsQuery {
    pub fn into_filter(self) -> Result<JobFilter, axum::response::Response> {
        let mut filter = JobFilter::default();
        if let Some(status) = self.status {
            filter = filter.with_status(parse_status(&status)?);
        }
        if let Some(job_type) = self.job_type {
            filter = filter.with_type(parse_job_type(&job_type)?);
        }
        if let Some(source_id) = self.source_id {
            filter = filter.with_source(parse_source_id(&source_id)?);
        }
        if let Some(limit) = self.limit {
            filter = filter.with_limit(limit);
        }
        filter.offset = self.offset.unwrap_or(0);
        Ok(filter)
    }
}

// -------------------------
// Response DTOs
// -------------------------

/// A job record plus derived metrics and display helpers.
#[derive(Debug, Serialize)]
pub struct JobResponse {
    #[serde(flatten)]
    pub job: JobRecord,
    pub metrics: ProcessingMetrics,
    pub formatted_duration: Option<String>,
    pub formatted_cost: Option<String>,
    pub formatted_age: String,
}

impl JobResponse {
    pub fn new(job: JobRecord, now: DateTime<Utc>) -> Self {
        Self {
            metrics: job.metrics(),
            formatted_duration: job.formatted_duration(),
            formatted_cost: job.formatted_cost(),
            formatted_age: job.formatted_age(now),
            job,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RetryResponse {
    pub job: JobResponse,
    pub delay_ms: u64,
    pub next_retry_at: DateTime<Utc>,
}

impl RetryResponse {
    pub fn new(scheduled: ScheduledRetry, now: DateTime<Utc>) -> Self {
        Self {
            job: JobResponse::new(scheduled.record, now),
            delay_ms: u64::try_from(scheduled.delay.as_millis()).unwrap_or(u64::MAX),
            next_retry_at: scheduled.next_retry_at,
        }
    }
}

// -------------------------
// Parsing helpers
// -------------------------

pub fn parse_job_id(s: &str) -> Result<JobId, axum::response::Response> {
    s.parse()
        .map_err(|_| errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid job id"))
}

pub fn parse_job_type(s: &str) -> Result<JobType, axum::response::Response> {
    s.parse().map_err(|e: contentflow_core::DomainError| {
        errors::json_error(StatusCode::BAD_REQUEST, "invalid_job_type", e.to_string())
    })
}

pub fn parse_status(s: &str) -> Result<JobStatus, axum::response::Response> {
    s.parse().map_err(|e: contentflow_core::DomainError| {
        errors::json_error(StatusCode::BAD_REQUEST, "invalid_status", e.to_string())
    })
}

pub fn parse_source_id(s: &str) -> Result<SourceId, axum::response::Response> {
    SourceId::new(s).map_err(|e| {
        errors::json_error(StatusCode::BAD_REQUEST, "invalid_source_id", e.to_string())
    })
}
