//! Job state machine.
//!
//! ```text
//!   queued ──START──> processing ──COMPLETE──> completed
//!     │                 │   │
//!     │                 │   └──FAIL / STALE_TIMEOUT──> failed
//!     │                 │                              ├──RETRY──> retrying ──RESUME──> processing
//!     │                 │                              └──PERMANENTLY_FAIL──> permanently_failed
//!     └──CANCEL─────────┴──────── (also from failed, retrying) ──> cancelled
//! ```
//!
//! [`transition`] is pure: it takes the current record, one event and a
//! [`TransitionContext`] (configuration + the instant the event happens) and
//! returns either the next record together with the effects the caller must
//! carry out, or a [`TransitionError`]. Persistence and notification are the
//! caller's job and happen only after a transition was accepted.
//!
//! Entering `failed` resolves immediately when
//! [`TransitionContext::auto_resolve_failures`] is set: to `retrying` if the
//! retry guard holds, to `permanently_failed` otherwise. The intermediate
//! `failed` status is still reported in [`Transition::path`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use thiserror::Error;

use contentflow_events::LifecycleEventType;

use crate::Metadata;
use crate::record::{JobError, JobRecord, JobStatus, ProgressUpdate, RetryBlock, elapsed_between};
use crate::registry::JobTypeRegistry;

/// Result payload supplied when a job completes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobOutput {
    /// Number of entities produced (insights, posts, ...).
    #[serde(default)]
    pub result_count: Option<u32>,
    /// Free-form result data, stored under `metadata.result`.
    #[serde(default)]
    pub data: Option<JsonValue>,
}

/// Cost metrics reported by the worker on completion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionMetrics {
    #[serde(default)]
    pub estimated_tokens: Option<u64>,
    #[serde(default)]
    pub estimated_cost: Option<f64>,
}

/// Input to the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Start,
    UpdateProgress {
        progress: i64,
        message: Option<String>,
        metadata: Option<Metadata>,
    },
    Complete {
        output: Option<JobOutput>,
        metrics: Option<CompletionMetrics>,
    },
    Fail {
        error: JobError,
    },
    Retry,
    PermanentlyFail,
    Cancel {
        reason: Option<String>,
    },
    /// Backoff elapsed (or forced by the health check): start the next attempt.
    Resume {
        force: bool,
    },
    /// PROCESSING outlived the stale threshold.
    StaleTimeout,
}

impl JobEvent {
    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::Start => "START",
            JobEvent::UpdateProgress { .. } => "UPDATE_PROGRESS",
            JobEvent::Complete { .. } => "COMPLETE",
            JobEvent::Fail { .. } => "FAIL",
            JobEvent::Retry => "RETRY",
            JobEvent::PermanentlyFail => "PERMANENTLY_FAIL",
            JobEvent::Cancel { .. } => "CANCEL",
            JobEvent::Resume { .. } => "RESUME",
            JobEvent::StaleTimeout => "STALE_TIMEOUT",
        }
    }
}

/// Everything a transition may depend on besides the record itself.
#[derive(Debug, Clone, Copy)]
pub struct TransitionContext<'a> {
    pub registry: &'a JobTypeRegistry,
    pub now: DateTime<Utc>,
    /// Resolve FAILED to RETRYING / PERMANENTLY_FAILED within the same transition.
    pub auto_resolve_failures: bool,
}

impl<'a> TransitionContext<'a> {
    pub fn new(registry: &'a JobTypeRegistry, now: DateTime<Utc>) -> Self {
        Self {
            registry,
            now,
            auto_resolve_failures: true,
        }
    }

    pub fn with_auto_resolve(mut self, auto_resolve_failures: bool) -> Self {
        self.auto_resolve_failures = auto_resolve_failures;
        self
    }
}

/// Side effect requested by a transition, to be performed after persisting.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Notify the event sink.
    Emit {
        event_type: LifecycleEventType,
        payload: JsonValue,
    },
    /// A retry was scheduled; the caller may surface the delay.
    RetryScheduled { delay: Duration, at: DateTime<Utc> },
}

/// Accepted transition.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    /// Next state of the record (version untouched; the store owns it).
    pub record: JobRecord,
    /// Statuses visited, starting with the status the record had before.
    pub path: Vec<JobStatus>,
    pub effects: Vec<Effect>,
}

impl Transition {
    pub fn status(&self) -> JobStatus {
        self.record.status
    }

    /// Lifecycle notifications in emission order.
    pub fn events(&self) -> impl Iterator<Item = (LifecycleEventType, &JsonValue)> + '_ {
        self.effects.iter().filter_map(|effect| match effect {
            Effect::Emit {
                event_type,
                payload,
            } => Some((*event_type, payload)),
            Effect::RetryScheduled { .. } => None,
        })
    }

    /// Delay and due time of the retry this transition scheduled, if any.
    pub fn scheduled_retry(&self) -> Option<(Duration, DateTime<Utc>)> {
        self.effects.iter().find_map(|effect| match effect {
            Effect::RetryScheduled { delay, at } => Some((*delay, *at)),
            Effect::Emit { .. } => None,
        })
    }
}

/// Rejected transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    /// The event is not accepted in the current status.
    #[error("{}", rejection_message(.from, .event))]
    Rejected {
        from: JobStatus,
        event: &'static str,
    },

    #[error("progress must be between 0 and 100, got {value}")]
    InvalidProgress { value: i64 },

    #[error("cannot retry: {0}")]
    RetryNotAllowed(RetryBlock),

    #[error("retry backoff still running ({remaining_ms}ms left)")]
    BackoffPending { remaining_ms: u64 },

    #[error("job is not stale ({elapsed_ms}ms elapsed, threshold {threshold_ms}ms)")]
    NotStale { elapsed_ms: u64, threshold_ms: u64 },
}

/// Message for an event the current status does not accept.
pub fn rejection_message(from: &JobStatus, event: &str) -> String {
    if from.is_terminal() {
        format!("job already finished ({from}); {event} rejected")
    } else {
        format!("{event} is not accepted while the job is {from}")
    }
}

/// Compute the next state of `record` for `event`.
pub fn transition(
    record: &JobRecord,
    event: JobEvent,
    ctx: &TransitionContext<'_>,
) -> Result<Transition, TransitionError> {
    use JobStatus::*;

    let from = record.status;
    let event_name = event.name();
    let mut step = Step::begin(record, ctx);

    match (from, event) {
        (Queued, JobEvent::Start) => step.start(),
        (
            Processing,
            JobEvent::UpdateProgress {
                progress,
                message,
                metadata,
            },
        ) => step.update_progress(progress, message, metadata)?,
        (Processing, JobEvent::Complete { output, metrics }) => step.complete(output, metrics),
        (Processing, JobEvent::Fail { error }) => step.fail(error),
        (Processing, JobEvent::StaleTimeout) => step.stale_timeout()?,
        (Failed, JobEvent::Retry) => step.retry()?,
        (Failed, JobEvent::PermanentlyFail) => {
            let reason = step.record.retry_block(ctx.registry);
            step.permanently_fail(reason);
        }
        (Queued | Processing | Failed | Retrying, JobEvent::Cancel { reason }) => {
            step.cancel(reason)
        }
        (Retrying, JobEvent::Resume { force }) => step.resume(force)?,
        _ => {
            return Err(TransitionError::Rejected {
                from,
                event: event_name,
            });
        }
    }

    Ok(step.finish())
}

/// Linear extrapolation of the remaining time; undefined before any progress
/// or elapsed time.
pub fn estimate_remaining_ms(elapsed_ms: u64, progress: u8) -> Option<u64> {
    if progress == 0 || elapsed_ms == 0 {
        return None;
    }
    let progress = u128::from(progress.min(100));
    let remaining = u128::from(elapsed_ms) * (100 - progress) / progress;
    Some(u64::try_from(remaining).unwrap_or(u64::MAX))
}

fn add_duration(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    let millis = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
    chrono::Duration::try_milliseconds(millis)
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

struct Step<'c, 'r> {
    ctx: &'c TransitionContext<'r>,
    record: JobRecord,
    /// `updated_at` of the record before this transition.
    previous_updated_at: DateTime<Utc>,
    path: Vec<JobStatus>,
    effects: Vec<Effect>,
}

impl<'c, 'r> Step<'c, 'r> {
    fn begin(record: &JobRecord, ctx: &'c TransitionContext<'r>) -> Self {
        let mut next = record.clone();
        next.updated_at = ctx.now;
        Self {
            ctx,
            previous_updated_at: record.updated_at,
            path: vec![record.status],
            record: next,
            effects: Vec::new(),
        }
    }

    fn finish(self) -> Transition {
        Transition {
            record: self.record,
            path: self.path,
            effects: self.effects,
        }
    }

    fn enter(&mut self, status: JobStatus) {
        self.record.status = status;
        self.path.push(status);
    }

    fn emit(&mut self, event_type: LifecycleEventType, mut payload: JsonValue) {
        if let Some(fields) = payload.as_object_mut() {
            fields.insert("job_type".into(), json!(self.record.job_type));
            fields.insert("source_id".into(), json!(self.record.source_id));
            fields.insert("status".into(), json!(self.record.status));
        }
        self.effects.push(Effect::Emit {
            event_type,
            payload,
        });
    }

    /// Fresh attempt: used by START and RESUME.
    fn begin_attempt(&mut self) {
        let now = self.ctx.now;
        let r = &mut self.record;
        r.progress = 0;
        r.progress_history.clear();
        r.estimated_remaining_ms = None;
        r.last_error = None;
        r.next_retry_at = None;
        r.started_at = Some(now);
        r.completed_at = None;
        r.duration_ms = None;
        self.enter(JobStatus::Processing);
    }

    fn start(&mut self) {
        self.begin_attempt();
        let attempt = self.record.retry_count;
        self.emit(
            LifecycleEventType::Started,
            json!({ "attempt": attempt, "resumed": false }),
        );
    }

    fn update_progress(
        &mut self,
        progress: i64,
        message: Option<String>,
        metadata: Option<Metadata>,
    ) -> Result<(), TransitionError> {
        if !(0..=100).contains(&progress) {
            return Err(TransitionError::InvalidProgress { value: progress });
        }
        let reported = progress.clamp(0, 100) as u8;
        let now = self.ctx.now;

        let r = &mut self.record;
        r.progress = r.progress.max(reported);
        r.progress_history.push(ProgressUpdate {
            progress: reported,
            message: message.clone(),
            at: now,
        });
        r.progress_updates = r.progress_updates.saturating_add(1);
        if let Some(extra) = metadata {
            r.metadata.get_or_insert_with(Metadata::new).extend(extra);
        }
        r.estimated_remaining_ms = estimate_remaining_ms(r.elapsed_ms(now), r.progress);

        let payload = json!({
            "progress": r.progress,
            "reported": reported,
            "message": message,
            "estimated_remaining_ms": r.estimated_remaining_ms,
        });
        self.emit(LifecycleEventType::Progress, payload);
        Ok(())
    }

    fn complete(&mut self, output: Option<JobOutput>, metrics: Option<CompletionMetrics>) {
        let now = self.ctx.now;
        let r = &mut self.record;
        r.progress = 100;
        r.completed_at = Some(now);
        r.duration_ms = Some(r.elapsed_ms(now));
        r.estimated_remaining_ms = None;

        if let Some(output) = output {
            if let Some(count) = output.result_count {
                r.result_count = count;
            }
            if let Some(data) = output.data {
                r.metadata
                    .get_or_insert_with(Metadata::new)
                    .insert("result".into(), data);
            }
        }
        if let Some(metrics) = metrics {
            if metrics.estimated_tokens.is_some() {
                r.estimated_tokens = metrics.estimated_tokens;
            }
            if metrics.estimated_cost.is_some() {
                r.estimated_cost = metrics.estimated_cost;
            }
        }

        let payload = json!({
            "duration_ms": r.duration_ms,
            "result_count": r.result_count,
            "estimated_tokens": r.estimated_tokens,
            "estimated_cost": r.estimated_cost,
        });
        self.enter(JobStatus::Completed);
        self.emit(LifecycleEventType::Completed, payload);
    }

    fn fail(&mut self, error: JobError) {
        let now = self.ctx.now;
        let r = &mut self.record;
        r.duration_ms = Some(r.elapsed_ms(now));
        r.estimated_remaining_ms = None;
        r.error_history.push(error.clone());
        r.last_error = Some(error);
        self.enter(JobStatus::Failed);

        if self.ctx.auto_resolve_failures {
            self.resolve_failure();
        } else {
            let will_retry = self.record.can_retry(self.ctx.registry);
            let payload = self.failure_payload(false, will_retry, None);
            self.emit(LifecycleEventType::Failed, payload);
        }
    }

    fn resolve_failure(&mut self) {
        match self.record.retry_block(self.ctx.registry) {
            None => {
                let payload = self.failure_payload(false, true, None);
                self.emit(LifecycleEventType::Failed, payload);
                self.schedule_retry(self.ctx.now);
            }
            Some(block) => self.permanently_fail(Some(block)),
        }
    }

    fn failure_payload(
        &self,
        permanent: bool,
        will_retry: bool,
        reason: Option<RetryBlock>,
    ) -> JsonValue {
        json!({
            "error": self.record.last_error,
            "retry_count": self.record.retry_count,
            "max_retries": self.record.effective_max_retries(self.ctx.registry),
            "permanent": permanent,
            "will_retry": will_retry,
            "reason": reason.map(|r| r.to_string()),
        })
    }

    fn stale_timeout(&mut self) -> Result<(), TransitionError> {
        let now = self.ctx.now;
        let config = *self.ctx.registry.config_for(self.record.job_type);
        let elapsed_ms = self.record.elapsed_ms(now);
        if !self.record.is_stale(self.ctx.registry, now) {
            return Err(TransitionError::NotStale {
                elapsed_ms,
                threshold_ms: config.stale_threshold_ms,
            });
        }

        self.emit(
            LifecycleEventType::Stale,
            json!({
                "elapsed_ms": elapsed_ms,
                "threshold_ms": config.stale_threshold_ms,
            }),
        );
        self.fail(JobError::stale(now, config.stale_threshold()));
        Ok(())
    }

    fn retry(&mut self) -> Result<(), TransitionError> {
        if let Some(block) = self.record.retry_block(self.ctx.registry) {
            return Err(TransitionError::RetryNotAllowed(block));
        }
        // Backoff counts from the moment the job entered FAILED.
        self.schedule_retry(self.previous_updated_at);
        Ok(())
    }

    fn schedule_retry(&mut self, failed_at: DateTime<Utc>) {
        let delay = self.record.backoff_delay(self.ctx.registry);
        let at = add_duration(failed_at, delay);

        let r = &mut self.record;
        r.next_retry_at = Some(at);
        r.last_error = None;
        let retry_count = r.retry_count;

        self.enter(JobStatus::Retrying);
        self.effects.push(Effect::RetryScheduled { delay, at });
        self.emit(
            LifecycleEventType::Retrying,
            json!({
                "retry_count": retry_count,
                "next_attempt": retry_count + 1,
                "delay_ms": u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "next_retry_at": at,
            }),
        );
    }

    fn permanently_fail(&mut self, reason: Option<RetryBlock>) {
        let r = &mut self.record;
        r.completed_at = Some(self.ctx.now);
        r.next_retry_at = None;
        self.enter(JobStatus::PermanentlyFailed);
        let payload = self.failure_payload(true, false, reason);
        self.emit(LifecycleEventType::Failed, payload);
    }

    fn cancel(&mut self, reason: Option<String>) {
        let now = self.ctx.now;
        let previous = self.record.status;
        let r = &mut self.record;
        if previous == JobStatus::Processing {
            r.duration_ms = Some(r.elapsed_ms(now));
        }
        r.cancelled_at = Some(now);
        r.cancel_reason = reason.clone();
        r.last_error = None;
        r.next_retry_at = None;
        r.estimated_remaining_ms = None;

        self.enter(JobStatus::Cancelled);
        self.emit(
            LifecycleEventType::Cancelled,
            json!({ "reason": reason, "previous_status": previous }),
        );
    }

    fn resume(&mut self, force: bool) -> Result<(), TransitionError> {
        let now = self.ctx.now;
        if !force {
            if let Some(due) = self.record.next_retry_at.filter(|due| *due > now) {
                return Err(TransitionError::BackoffPending {
                    remaining_ms: elapsed_between(now, due),
                });
            }
        }

        self.record.retry_count = self.record.retry_count.saturating_add(1);
        self.begin_attempt();
        let attempt = self.record.retry_count;
        self.emit(
            LifecycleEventType::Started,
            json!({ "attempt": attempt, "resumed": true, "forced": force }),
        );
        Ok(())
    }
}
