//! Static per-type job configuration.

use core::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use contentflow_core::{DomainError, DomainResult};

/// Kind of work a job performs in the content pipeline.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Normalise a raw transcript.
    CleanTranscript,
    /// Pull insights out of a cleaned transcript.
    ExtractInsights,
    /// Turn approved insights into social posts.
    GeneratePosts,
}

impl JobType {
    pub const ALL: [JobType; 3] = [
        JobType::CleanTranscript,
        JobType::ExtractInsights,
        JobType::GeneratePosts,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobType::CleanTranscript => "clean_transcript",
            JobType::ExtractInsights => "extract_insights",
            JobType::GeneratePosts => "generate_posts",
        }
    }
}

impl core::fmt::Display for JobType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| {
                DomainError::validation(format!(
                    "unknown job type '{s}' (expected one of: clean_transcript, extract_insights, generate_posts)"
                ))
            })
    }
}

/// Retry, timeout and backoff parameters for one job type.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTypeConfig {
    /// Retries allowed after the first attempt (0 = no retries).
    pub max_retries: u32,
    /// Expected upper bound for one attempt.
    pub timeout_ms: u64,
    /// Backoff before the first retry.
    pub base_delay_ms: u64,
    /// Backoff cap.
    pub max_delay_ms: u64,
    /// PROCESSING for longer than this means the worker is presumed lost.
    pub stale_threshold_ms: u64,
}

impl JobTypeConfig {
    /// Backoff before the retry that follows `retry_count` previous retries.
    ///
    /// `min(base_delay_ms * 2^retry_count, max_delay_ms)`, saturating instead of
    /// overflowing for large counts.
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let factor = 2u64.checked_pow(retry_count).unwrap_or(u64::MAX);
        let delay_ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_millis(self.stale_threshold_ms)
    }

    pub fn validate(&self, job_type: JobType) -> DomainResult<()> {
        if self.base_delay_ms > self.max_delay_ms {
            return Err(DomainError::validation(format!(
                "{job_type}: base_delay_ms ({}) must not exceed max_delay_ms ({})",
                self.base_delay_ms, self.max_delay_ms
            )));
        }
        if self.stale_threshold_ms == 0 {
            return Err(DomainError::validation(format!(
                "{job_type}: stale_threshold_ms must be positive"
            )));
        }
        Ok(())
    }
}

/// Immutable lookup table from [`JobType`] to its [`JobTypeConfig`].
///
/// One field per variant, so a new job type cannot be added without giving it
/// a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobTypeRegistry {
    clean_transcript: JobTypeConfig,
    extract_insights: JobTypeConfig,
    generate_posts: JobTypeConfig,
}

impl Default for JobTypeRegistry {
    fn default() -> Self {
        Self {
            clean_transcript: JobTypeConfig {
                max_retries: 3,
                timeout_ms: 120_000,
                base_delay_ms: 1_000,
                max_delay_ms: 30_000,
                stale_threshold_ms: 180_000,
            },
            extract_insights: JobTypeConfig {
                max_retries: 5,
                timeout_ms: 600_000,
                base_delay_ms: 2_000,
                max_delay_ms: 60_000,
                stale_threshold_ms: 900_000,
            },
            generate_posts: JobTypeConfig {
                max_retries: 3,
                timeout_ms: 300_000,
                base_delay_ms: 2_000,
                max_delay_ms: 60_000,
                stale_threshold_ms: 450_000,
            },
        }
    }
}

impl JobTypeRegistry {
    pub fn config_for(&self, job_type: JobType) -> &JobTypeConfig {
        match job_type {
            JobType::CleanTranscript => &self.clean_transcript,
            JobType::ExtractInsights => &self.extract_insights,
            JobType::GeneratePosts => &self.generate_posts,
        }
    }

    /// Replace the configuration of one job type.
    pub fn with_config(mut self, job_type: JobType, config: JobTypeConfig) -> Self {
        let slot = match job_type {
            JobType::CleanTranscript => &mut self.clean_transcript,
            JobType::ExtractInsights => &mut self.extract_insights,
            JobType::GeneratePosts => &mut self.generate_posts,
        };
        *slot = config;
        self
    }

    pub fn calculate_backoff(&self, job_type: JobType, retry_count: u32) -> Duration {
        self.config_for(job_type).backoff_delay(retry_count)
    }

    /// Check every entry; meant to run once at startup.
    pub fn validate(&self) -> DomainResult<()> {
        for job_type in JobType::ALL {
            self.config_for(job_type).validate(job_type)?;
        }
        Ok(())
    }
}
