//! Job lifecycle service.
//!
//! Binds the pure state machine to the store and the event sink. Every
//! command follows the same sequence:
//!
//! 1. load the record (never cached between commands)
//! 2. run the event through [`transition`]
//! 3. compare-and-swap the new record against the version that was read
//! 4. emit the transition's events, only after the write succeeded
//!
//! A version conflict means another command or sweep committed in between;
//! the command re-reads and re-evaluates, so of two mutually exclusive
//! commands the first writer wins and the other observes the new state.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use contentflow_core::{ExpectedVersion, JobId};
use contentflow_events::{EventSink, LifecycleEvent, LifecycleEventType};
use contentflow_jobs::{
    CompletionMetrics, JobError, JobEvent, JobOutput, JobRecord, JobStatus, JobTypeRegistry,
    Metadata, NewJob, RetryBlock, Transition, TransitionContext, TransitionError,
    rejection_message, transition,
};

use crate::clock::{Clock, SystemClock};
use crate::config::LifecycleConfig;
use crate::stats::JobStats;
use crate::store::{JobFilter, JobStore, JobStoreError};

/// Errors surfaced by lifecycle commands and queries.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    /// The event is not legal in the job's current status.
    #[error("{}", rejection_message(.from, .event))]
    InvalidStateTransition {
        job_id: JobId,
        from: JobStatus,
        event: &'static str,
    },

    #[error("progress must be between 0 and 100, got {value}")]
    InvalidProgressValue { job_id: JobId, value: i64 },

    #[error("cannot retry: {reason}")]
    RetryNotAllowed { job_id: JobId, reason: RetryBlock },

    #[error("job {job_id} is still backing off ({remaining_ms}ms left)")]
    BackoffPending { job_id: JobId, remaining_ms: u64 },

    #[error("job {job_id} is not stale ({elapsed_ms}ms elapsed, threshold {threshold_ms}ms)")]
    NotStale {
        job_id: JobId,
        elapsed_ms: u64,
        threshold_ms: u64,
    },

    /// Optimistic-concurrency retries exhausted.
    #[error("job {job_id} kept changing concurrently; gave up after {attempts} attempts")]
    Conflict { job_id: JobId, attempts: u32 },

    #[error(transparent)]
    Store(#[from] JobStoreError),
}

impl LifecycleError {
    fn from_transition(job_id: JobId, err: TransitionError) -> Self {
        match err {
            TransitionError::Rejected { from, event } => LifecycleError::InvalidStateTransition {
                job_id,
                from,
                event,
            },
            TransitionError::InvalidProgress { value } => {
                LifecycleError::InvalidProgressValue { job_id, value }
            }
            TransitionError::RetryNotAllowed(reason) => {
                LifecycleError::RetryNotAllowed { job_id, reason }
            }
            TransitionError::BackoffPending { remaining_ms } => LifecycleError::BackoffPending {
                job_id,
                remaining_ms,
            },
            TransitionError::NotStale {
                elapsed_ms,
                threshold_ms,
            } => LifecycleError::NotStale {
                job_id,
                elapsed_ms,
                threshold_ms,
            },
        }
    }

    /// The command was refused by a guard or the state machine, as opposed to
    /// an infrastructure failure.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            LifecycleError::InvalidStateTransition { .. }
                | LifecycleError::InvalidProgressValue { .. }
                | LifecycleError::RetryNotAllowed { .. }
                | LifecycleError::BackoffPending { .. }
                | LifecycleError::NotStale { .. }
        )
    }
}

/// Outcome of a successful `retry_job`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledRetry {
    pub record: JobRecord,
    /// Backoff the caller can surface ("will retry in N ms").
    pub delay: Duration,
    pub next_retry_at: DateTime<Utc>,
}

/// Orchestrates job commands over a [`JobStore`] and an [`EventSink`].
pub struct JobLifecycleService<S, E> {
    store: S,
    sink: E,
    registry: JobTypeRegistry,
    config: LifecycleConfig,
    clock: Arc<dyn Clock>,
}

impl<S, E> JobLifecycleService<S, E>
where
    S: JobStore,
    E: EventSink,
{
    pub fn new(store: S, sink: E, registry: JobTypeRegistry, config: LifecycleConfig) -> Self {
        Self {
            store,
            sink,
            registry,
            config,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn registry(&self) -> &JobTypeRegistry {
        &self.registry
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // ---- commands -------------------------------------------------------

    /// Persist a new QUEUED job and emit `job.created`.
    pub async fn create_job(&self, new_job: NewJob) -> Result<JobRecord, LifecycleError> {
        let record = self.store.create(new_job, self.clock.now()).await?;
        info!(
            job_id = %record.id,
            job_type = %record.job_type,
            source_id = %record.source_id,
            "job created"
        );

        let payload = json!({
            "job_type": record.job_type,
            "source_id": record.source_id,
            "status": record.status,
            "max_retries": record.effective_max_retries(&self.registry),
        });
        self.emit(record.id, LifecycleEventType::Created, payload, record.created_at)
            .await;
        Ok(record)
    }

    pub async fn start_processing(&self, job_id: JobId) -> Result<JobRecord, LifecycleError> {
        Ok(self.execute(job_id, JobEvent::Start).await?.record)
    }

    pub async fn update_progress(
        &self,
        job_id: JobId,
        progress: i64,
        message: Option<String>,
        metadata: Option<Metadata>,
    ) -> Result<JobRecord, LifecycleError> {
        let event = JobEvent::UpdateProgress {
            progress,
            message,
            metadata,
        };
        Ok(self.execute(job_id, event).await?.record)
    }

    pub async fn complete_job(
        &self,
        job_id: JobId,
        output: Option<JobOutput>,
        metrics: Option<CompletionMetrics>,
    ) -> Result<JobRecord, LifecycleError> {
        let event = JobEvent::Complete { output, metrics };
        Ok(self.execute(job_id, event).await?.record)
    }

    /// Record a failure. Unless automatic resolution is disabled the job ends
    /// up RETRYING or PERMANENTLY_FAILED.
    pub async fn fail_job(
        &self,
        job_id: JobId,
        error: JobError,
    ) -> Result<JobRecord, LifecycleError> {
        Ok(self.execute(job_id, JobEvent::Fail { error }).await?.record)
    }

    /// Move a FAILED job to RETRYING and report the backoff it waits for.
    pub async fn retry_job(&self, job_id: JobId) -> Result<ScheduledRetry, LifecycleError> {
        let committed = self.execute(job_id, JobEvent::Retry).await?;
        let (delay, next_retry_at) = committed
            .scheduled_retry()
            .unwrap_or((Duration::ZERO, committed.record.updated_at));
        Ok(ScheduledRetry {
            record: committed.record,
            delay,
            next_retry_at,
        })
    }

    pub async fn permanently_fail_job(&self, job_id: JobId) -> Result<JobRecord, LifecycleError> {
        Ok(self.execute(job_id, JobEvent::PermanentlyFail).await?.record)
    }

    pub async fn cancel_job(
        &self,
        job_id: JobId,
        reason: Option<String>,
    ) -> Result<JobRecord, LifecycleError> {
        Ok(self.execute(job_id, JobEvent::Cancel { reason }).await?.record)
    }

    /// Start the next attempt of a RETRYING job. Without `force` the backoff
    /// must have elapsed.
    pub async fn resume_job(
        &self,
        job_id: JobId,
        force: bool,
    ) -> Result<JobRecord, LifecycleError> {
        Ok(self.execute(job_id, JobEvent::Resume { force }).await?.record)
    }

    /// Fail a PROCESSING job that outlived its stale threshold.
    pub async fn mark_stale(&self, job_id: JobId) -> Result<JobRecord, LifecycleError> {
        Ok(self.execute(job_id, JobEvent::StaleTimeout).await?.record)
    }

    // ---- queries --------------------------------------------------------

    pub async fn get_job(&self, job_id: JobId) -> Result<JobRecord, LifecycleError> {
        self.store
            .get(job_id)
            .await?
            .ok_or(LifecycleError::JobNotFound(job_id))
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, LifecycleError> {
        Ok(self.store.list(filter).await?)
    }

    pub async fn get_stats(&self) -> Result<JobStats, LifecycleError> {
        let records = self.store.list(&JobFilter::default()).await?;
        Ok(JobStats::from_records(&records))
    }

    // ---- internals ------------------------------------------------------

    /// Command time for `record`: the clock, nudged forward so timestamps
    /// strictly increase per record even when the clock does not move.
    fn command_time(&self, record: &JobRecord) -> DateTime<Utc> {
        let floor = record.updated_at + chrono::Duration::microseconds(1);
        self.clock.now().max(floor)
    }

    async fn execute(&self, job_id: JobId, event: JobEvent) -> Result<Transition, LifecycleError> {
        let attempts = self.config.max_conflict_retries.saturating_add(1);

        for attempt in 1..=attempts {
            let current = self
                .store
                .get(job_id)
                .await?
                .ok_or(LifecycleError::JobNotFound(job_id))?;

            let ctx = TransitionContext::new(&self.registry, self.command_time(&current))
                .with_auto_resolve(self.config.auto_resolve_failures);
            let Transition {
                record,
                path,
                effects,
            } = transition(&current, event.clone(), &ctx)
                .map_err(|err| LifecycleError::from_transition(job_id, err))?;

            match self
                .store
                .update(record, ExpectedVersion::Exact(current.version))
                .await
            {
                Ok(saved) => {
                    debug!(
                        job_id = %job_id,
                        event = event.name(),
                        from = %current.status,
                        to = %saved.status,
                        version = saved.version,
                        "job transition committed"
                    );
                    let committed = Transition {
                        record: saved,
                        path,
                        effects,
                    };
                    self.publish(&committed).await;
                    return Ok(committed);
                }
                Err(JobStoreError::Conflict { .. }) => {
                    debug!(
                        job_id = %job_id,
                        event = event.name(),
                        attempt,
                        "version conflict, re-reading job"
                    );
                }
                Err(JobStoreError::NotFound(_)) => return Err(LifecycleError::JobNotFound(job_id)),
                Err(err) => return Err(err.into()),
            }
        }

        warn!(
            job_id = %job_id,
            event = event.name(),
            attempts,
            "giving up after repeated version conflicts"
        );
        Err(LifecycleError::Conflict { job_id, attempts })
    }

    async fn publish(&self, committed: &Transition) {
        let record = &committed.record;
        for (event_type, payload) in committed.events() {
            self.emit(record.id, event_type, payload.clone(), record.updated_at)
                .await;
        }
    }

    async fn emit(
        &self,
        job_id: JobId,
        event_type: LifecycleEventType,
        payload: serde_json::Value,
        occurred_at: DateTime<Utc>,
    ) {
        let event = LifecycleEvent::new(job_id, event_type, payload, occurred_at);
        if let Err(err) = self.sink.emit(event).await {
            // Already committed; delivery is best-effort.
            warn!(
                job_id = %job_id,
                event_type = %event_type,
                error = %err,
                "failed to emit lifecycle event"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use contentflow_core::SourceId;
    use contentflow_events::InMemoryEventSink;
    use contentflow_jobs::JobType;

    use crate::clock::ManualClock;
    use crate::store::InMemoryJobStore;

    type Service = JobLifecycleService<Arc<InMemoryJobStore>, Arc<InMemoryEventSink>>;

    struct Harness {
        service: Service,
        sink: Arc<InMemoryEventSink>,
        clock: Arc<ManualClock>,
    }

    fn harness_with(config: LifecycleConfig) -> Harness {
        let sink = Arc::new(InMemoryEventSink::new());
        let clock = Arc::new(ManualClock::default());
        let service = JobLifecycleService::new(
            InMemoryJobStore::arc(),
            sink.clone(),
            JobTypeRegistry::default(),
            config,
        )
        .with_clock(clock.clone());
        Harness {
            service,
            sink,
            clock,
        }
    }

    fn harness() -> Harness {
        harness_with(LifecycleConfig::default())
    }

    fn new_job(job_type: JobType) -> NewJob {
        NewJob::new(job_type, SourceId::new("transcript-42").unwrap())
    }

    #[tokio::test]
    async fn start_progress_complete_round_trip() {
        let h = harness();
        let job = h.service.create_job(new_job(JobType::CleanTranscript)).await.unwrap();

        h.service.start_processing(job.id).await.unwrap();
        h.service.update_progress(job.id, 50, None, None).await.unwrap();
        let done = h.service.complete_job(job.id, None, None).await.unwrap();

        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.progress, 100);
        assert!(done.duration_ms.unwrap() > 0);
        assert!(done.started_at.unwrap() < done.completed_at.unwrap());
        assert_eq!(done.version, 3);

        assert_eq!(
            h.sink.event_types_for(job.id),
            vec![
                LifecycleEventType::Created,
                LifecycleEventType::Started,
                LifecycleEventType::Progress,
                LifecycleEventType::Completed,
            ]
        );
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let h = harness();
        let missing = JobId::new();
        let err = h.service.start_processing(missing).await.unwrap_err();
        assert!(matches!(err, LifecycleError::JobNotFound(id) if id == missing));
        assert!(matches!(
            h.service.get_job(missing).await.unwrap_err(),
            LifecycleError::JobNotFound(_)
        ));
    }

    #[tokio::test]
    async fn start_requires_queued() {
        let h = harness();
        let job = h.service.create_job(new_job(JobType::GeneratePosts)).await.unwrap();
        h.service.start_processing(job.id).await.unwrap();

        let err = h.service.start_processing(job.id).await.unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::InvalidStateTransition {
                from: JobStatus::Processing,
                event: "START",
                ..
            }
        ));
        assert!(err.is_rejection());
    }

    #[tokio::test]
    async fn progress_out_of_range_is_rejected_without_a_write() {
        let h = harness();
        let job = h.service.create_job(new_job(JobType::ExtractInsights)).await.unwrap();
        let started = h.service.start_processing(job.id).await.unwrap();

        for bad in [-1, 101] {
            let err = h
                .service
                .update_progress(job.id, bad, None, None)
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                LifecycleError::InvalidProgressValue { value, .. } if value == bad
            ));
        }
        assert_eq!(h.service.get_job(job.id).await.unwrap().version, started.version);
    }

    #[tokio::test]
    async fn cancel_after_finish_reports_job_already_finished() {
        let h = harness();
        let job = h.service.create_job(new_job(JobType::CleanTranscript)).await.unwrap();
        h.service.start_processing(job.id).await.unwrap();
        h.service.complete_job(job.id, None, None).await.unwrap();

        let err = h
            .service
            .cancel_job(job.id, Some("too late".into()))
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("job already finished"));
    }

    #[tokio::test]
    async fn failure_schedules_retry_and_resume_waits_for_backoff() {
        let h = harness();
        let job = h.service.create_job(new_job(JobType::CleanTranscript)).await.unwrap();
        h.service.start_processing(job.id).await.unwrap();

        let now = h.clock.now();
        let retrying = h
            .service
            .fail_job(job.id, JobError::new("rate limited", now))
            .await
            .unwrap();
        assert_eq!(retrying.status, JobStatus::Retrying);
        assert!(retrying.next_retry_at.is_some());

        let err = h.service.resume_job(job.id, false).await.unwrap_err();
        assert!(matches!(err, LifecycleError::BackoffPending { .. }));

        h.clock.advance(ChronoDuration::seconds(2));
        let resumed = h.service.resume_job(job.id, false).await.unwrap();
        assert_eq!(resumed.status, JobStatus::Processing);
        assert_eq!(resumed.retry_count, 1);

        assert_eq!(
            h.sink.event_types_for(job.id),
            vec![
                LifecycleEventType::Created,
                LifecycleEventType::Started,
                LifecycleEventType::Failed,
                LifecycleEventType::Retrying,
                LifecycleEventType::Started,
            ]
        );
    }

    #[tokio::test]
    async fn manual_retry_returns_the_backoff_delay() {
        let h = harness_with(LifecycleConfig {
            auto_resolve_failures: false,
            ..LifecycleConfig::default()
        });
        let job = h.service.create_job(new_job(JobType::ExtractInsights)).await.unwrap();
        h.service.start_processing(job.id).await.unwrap();
        let failed = h
            .service
            .fail_job(job.id, JobError::new("upstream 503", h.clock.now()))
            .await
            .unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.last_error.is_some());

        let scheduled = h.service.retry_job(job.id).await.unwrap();
        assert_eq!(scheduled.delay, Duration::from_millis(2_000));
        assert_eq!(scheduled.record.status, JobStatus::Retrying);
        assert_eq!(scheduled.record.next_retry_at, Some(scheduled.next_retry_at));
    }

    #[tokio::test]
    async fn retry_of_exhausted_job_says_max_attempts_reached() {
        let h = harness_with(LifecycleConfig {
            auto_resolve_failures: false,
            ..LifecycleConfig::default()
        });
        let job = h
            .service
            .create_job(new_job(JobType::GeneratePosts).with_max_retries(0))
            .await
            .unwrap();
        h.service.start_processing(job.id).await.unwrap();
        h.service
            .fail_job(job.id, JobError::new("boom", h.clock.now()))
            .await
            .unwrap();

        let err = h.service.retry_job(job.id).await.unwrap_err();
        assert_eq!(err.to_string(), "cannot retry: max attempts reached (0/0)");

        let finished = h.service.permanently_fail_job(job.id).await.unwrap();
        assert_eq!(finished.status, JobStatus::PermanentlyFailed);
        assert!(finished.completed_at.is_some());
    }

    #[tokio::test]
    async fn sink_failures_do_not_fail_the_command() {
        let h = harness();
        let job = h.service.create_job(new_job(JobType::CleanTranscript)).await.unwrap();
        h.sink.set_failing(true);

        let started = h.service.start_processing(job.id).await.unwrap();
        assert_eq!(started.status, JobStatus::Processing);
        assert_eq!(
            h.service.get_job(job.id).await.unwrap().status,
            JobStatus::Processing
        );
    }

    #[tokio::test]
    async fn timestamps_strictly_increase_under_a_frozen_clock() {
        let h = harness();
        let job = h.service.create_job(new_job(JobType::CleanTranscript)).await.unwrap();
        let started = h.service.start_processing(job.id).await.unwrap();
        let done = h.service.complete_job(job.id, None, None).await.unwrap();

        assert!(job.created_at < started.updated_at);
        assert!(started.updated_at < done.updated_at);
        assert_eq!(done.duration_ms, Some(1));
    }

    #[tokio::test]
    async fn stats_reflect_store_contents() {
        let h = harness();
        let a = h.service.create_job(new_job(JobType::CleanTranscript)).await.unwrap();
        h.service.create_job(new_job(JobType::GeneratePosts)).await.unwrap();
        h.service.start_processing(a.id).await.unwrap();
        h.service
            .complete_job(
                a.id,
                None,
                Some(CompletionMetrics {
                    estimated_tokens: Some(800),
                    estimated_cost: Some(0.5),
                }),
            )
            .await
            .unwrap();

        let stats = h.service.get_stats().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.count(JobStatus::Completed), 1);
        assert_eq!(stats.count(JobStatus::Queued), 1);
        assert_eq!(stats.average_cost, Some(0.5));
    }
}
