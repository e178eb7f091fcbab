//! Maintenance sweeps.
//!
//! Time-based transitions are driven by polling, not by per-job timers: each
//! sweep scans the store for one kind of candidate and issues ordinary
//! lifecycle commands, so it shares the service's compare-and-swap guarantee.
//! A candidate that changed in the meantime is rejected by the state machine
//! and counted as skipped, which is what makes sweeps safe to repeat or to
//! run concurrently with commands.

mod runner;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use contentflow_core::JobId;
use contentflow_events::EventSink;
use contentflow_jobs::{JobRecord, JobStatus, JobTypeRegistry};

use crate::config::{MaintenanceConfig, SweepIntervals};
use crate::lifecycle::{JobLifecycleService, LifecycleError};
use crate::store::JobStore;

pub use runner::MaintenanceHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SweepKind {
    /// PROCESSING past the stale threshold.
    Stale,
    /// FAILED jobs whose backoff elapsed; RETRYING jobs that are due.
    Retry,
    /// QUEUED or RETRYING for far longer than expected.
    Stuck,
    /// Old COMPLETED jobs.
    Cleanup,
    /// Log aggregate statistics.
    Stats,
}

impl SweepKind {
    pub const ALL: [SweepKind; 5] = [
        SweepKind::Stale,
        SweepKind::Retry,
        SweepKind::Stuck,
        SweepKind::Cleanup,
        SweepKind::Stats,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SweepKind::Stale => "stale",
            SweepKind::Retry => "retry",
            SweepKind::Stuck => "stuck",
            SweepKind::Cleanup => "cleanup",
            SweepKind::Stats => "stats",
        }
    }

    pub fn interval(self, intervals: &SweepIntervals) -> Duration {
        match self {
            SweepKind::Stale => intervals.stale(),
            SweepKind::Retry => intervals.retry(),
            SweepKind::Stuck => intervals.stuck(),
            SweepKind::Cleanup => intervals.cleanup(),
            SweepKind::Stats => intervals.stats(),
        }
    }
}

/// Outcome counts of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Records loaded for inspection.
    pub examined: usize,
    /// Commands that committed.
    pub applied: usize,
    /// Candidates that changed underneath the sweep (expected races).
    pub skipped: usize,
    /// Candidates whose command failed for another reason.
    pub failed: usize,
}

impl SweepReport {
    fn record(
        &mut self,
        kind: SweepKind,
        job_id: JobId,
        outcome: Result<JobRecord, LifecycleError>,
    ) {
        match outcome {
            Ok(record) => {
                self.applied += 1;
                debug!(
                    sweep = kind.as_str(),
                    job_id = %job_id,
                    status = %record.status,
                    "sweep applied"
                );
            }
            Err(err) if err.is_rejection() || matches!(err, LifecycleError::JobNotFound(_)) => {
                self.skipped += 1;
                debug!(sweep = kind.as_str(), job_id = %job_id, reason = %err, "sweep skipped job");
            }
            Err(err) => {
                self.failed += 1;
                warn!(
                    sweep = kind.as_str(),
                    job_id = %job_id,
                    error = %err,
                    "sweep failed for job"
                );
            }
        }
    }

    fn log(&self, kind: SweepKind) {
        info!(
            sweep = kind.as_str(),
            examined = self.examined,
            applied = self.applied,
            skipped = self.skipped,
            failed = self.failed,
            "maintenance sweep finished"
        );
    }
}

fn millis(ms: u64) -> chrono::Duration {
    chrono::Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
}

fn backoff_ms(job: &JobRecord, registry: &JobTypeRegistry) -> u64 {
    u64::try_from(job.backoff_delay(registry).as_millis()).unwrap_or(u64::MAX)
}

/// Periodic recovery and housekeeping over the job store.
pub struct MaintenanceScheduler<S, E> {
    service: Arc<JobLifecycleService<S, E>>,
    config: MaintenanceConfig,
    intervals: SweepIntervals,
}

impl<S, E> MaintenanceScheduler<S, E>
where
    S: JobStore + 'static,
    E: EventSink + 'static,
{
    pub fn new(
        service: Arc<JobLifecycleService<S, E>>,
        config: MaintenanceConfig,
        intervals: SweepIntervals,
    ) -> Self {
        Self {
            service,
            config,
            intervals,
        }
    }

    pub fn service(&self) -> &Arc<JobLifecycleService<S, E>> {
        &self.service
    }

    /// Run one sweep. Errors are store failures that prevented the sweep
    /// from loading its candidates; per-job failures only show in the report.
    pub async fn run_sweep(
        &self,
        kind: SweepKind,
        now: DateTime<Utc>,
    ) -> Result<SweepReport, LifecycleError> {
        let report = match kind {
            SweepKind::Stale => self.run_stale_sweep(now).await?,
            SweepKind::Retry => self.run_retry_sweep(now).await?,
            SweepKind::Stuck => self.run_stuck_sweep(now).await?,
            SweepKind::Cleanup => self.run_cleanup_sweep(now).await?,
            SweepKind::Stats => self.log_stats().await?,
        };
        Ok(report)
    }

    /// Fail PROCESSING jobs that outlived their type's stale threshold.
    pub async fn run_stale_sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, LifecycleError> {
        let registry = self.service.registry();
        let processing = self.service.store().query_by_status(JobStatus::Processing).await?;

        let mut report = SweepReport::default();
        for job in processing {
            report.examined += 1;
            if !job.is_stale(registry, now) {
                continue;
            }
            warn!(
                job_id = %job.id,
                job_type = %job.job_type,
                elapsed_ms = job.elapsed_ms(now),
                "job is stale"
            );
            let outcome = self.service.mark_stale(job.id).await;
            report.record(SweepKind::Stale, job.id, outcome);
        }
        report.log(SweepKind::Stale);
        Ok(report)
    }

    /// Retry FAILED jobs whose backoff has elapsed and resume RETRYING jobs
    /// whose `next_retry_at` has passed.
    ///
    /// Candidates are loaded before anything is applied, so a job moves at
    /// most one step per sweep.
    pub async fn run_retry_sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, LifecycleError> {
        let registry = self.service.registry();
        let store = self.service.store();
        let failed = store.query_by_status(JobStatus::Failed).await?;
        let retrying = store.query_by_status(JobStatus::Retrying).await?;

        let mut report = SweepReport::default();
        for job in failed {
            report.examined += 1;
            if !job.can_retry(registry) {
                continue;
            }
            let backoff = millis(backoff_ms(&job, registry));
            if now - job.updated_at <= backoff {
                continue;
            }
            let outcome = self.service.retry_job(job.id).await.map(|scheduled| scheduled.record);
            report.record(SweepKind::Retry, job.id, outcome);
        }

        for job in retrying {
            report.examined += 1;
            if job.next_retry_at.is_some_and(|due| due > now) {
                continue;
            }
            let outcome = self.service.resume_job(job.id, false).await;
            report.record(SweepKind::Retry, job.id, outcome);
        }

        report.log(SweepKind::Retry);
        Ok(report)
    }

    /// Force-start long-QUEUED jobs and force-resume RETRYING jobs that
    /// missed their resume by more than the configured backoff multiple.
    pub async fn run_stuck_sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, LifecycleError> {
        let registry = self.service.registry();
        let store = self.service.store();
        let queued = store.query_by_status(JobStatus::Queued).await?;
        let retrying = store.query_by_status(JobStatus::Retrying).await?;

        let mut report = SweepReport::default();
        for job in queued {
            report.examined += 1;
            if now - job.created_at <= self.config.queued_stuck_threshold() {
                continue;
            }
            warn!(job_id = %job.id, job_type = %job.job_type, "force-starting stuck queued job");
            let outcome = self.service.start_processing(job.id).await;
            report.record(SweepKind::Stuck, job.id, outcome);
        }

        for job in retrying {
            report.examined += 1;
            let multiplier = u64::from(self.config.retrying_stuck_multiplier);
            let limit = millis(backoff_ms(&job, registry).saturating_mul(multiplier));
            if now - job.updated_at <= limit {
                continue;
            }
            warn!(job_id = %job.id, job_type = %job.job_type, "force-resuming stuck retrying job");
            let outcome = self.service.resume_job(job.id, true).await;
            report.record(SweepKind::Stuck, job.id, outcome);
        }

        report.log(SweepKind::Stuck);
        Ok(report)
    }

    /// Delete COMPLETED jobs older than the retention window. Failed and
    /// cancelled jobs are kept for audit.
    pub async fn run_cleanup_sweep(
        &self,
        now: DateTime<Utc>,
    ) -> Result<SweepReport, LifecycleError> {
        let store = self.service.store();
        let mut report = SweepReport::default();
        let Some(cutoff) = self
            .config
            .retention()
            .and_then(|retention| now.checked_sub_signed(retention))
        else {
            warn!(
                retention_days = self.config.retention_days,
                "retention window reaches past the earliest timestamp; nothing to clean up"
            );
            report.log(SweepKind::Cleanup);
            return Ok(report);
        };

        let completed = store.query_by_status(JobStatus::Completed).await?;
        for job in completed {
            report.examined += 1;
            let finished_at = job.completed_at.unwrap_or(job.updated_at);
            if finished_at >= cutoff {
                continue;
            }
            match store.delete(job.id).await {
                Ok(true) => {
                    report.applied += 1;
                    debug!(job_id = %job.id, "deleted completed job past retention");
                }
                Ok(false) => report.skipped += 1,
                Err(err) => {
                    report.failed += 1;
                    warn!(job_id = %job.id, error = %err, "failed to delete completed job");
                }
            }
        }
        report.log(SweepKind::Cleanup);
        Ok(report)
    }

    /// Log aggregate statistics.
    pub async fn log_stats(&self) -> Result<SweepReport, LifecycleError> {
        let stats = self.service.get_stats().await?;
        info!(
            total = stats.total,
            active = stats.active(),
            queued = stats.count(JobStatus::Queued),
            processing = stats.count(JobStatus::Processing),
            retrying = stats.count(JobStatus::Retrying),
            completed = stats.count(JobStatus::Completed),
            permanently_failed = stats.count(JobStatus::PermanentlyFailed),
            cancelled = stats.count(JobStatus::Cancelled),
            average_duration_ms = ?stats.average_duration_ms,
            average_cost = ?stats.average_cost,
            "job statistics"
        );
        Ok(SweepReport {
            examined: stats.total,
            ..SweepReport::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use contentflow_core::{ExpectedVersion, SourceId};
    use contentflow_events::InMemoryEventSink;
    use contentflow_jobs::{JobError, JobType, JobTypeRegistry, NewJob};

    use crate::clock::{Clock, ManualClock};
    use crate::config::LifecycleConfig;
    use crate::store::InMemoryJobStore;

    type Scheduler = MaintenanceScheduler<Arc<InMemoryJobStore>, Arc<InMemoryEventSink>>;

    fn scheduler_with(lifecycle: LifecycleConfig) -> (Scheduler, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let service = JobLifecycleService::new(
            InMemoryJobStore::arc(),
            Arc::new(InMemoryEventSink::new()),
            JobTypeRegistry::default(),
            lifecycle,
        )
        .with_clock(clock.clone());
        let scheduler = MaintenanceScheduler::new(
            Arc::new(service),
            MaintenanceConfig::default(),
            SweepIntervals::default(),
        );
        (scheduler, clock)
    }

    fn scheduler() -> (Scheduler, Arc<ManualClock>) {
        scheduler_with(LifecycleConfig::default())
    }

    async fn create(s: &Scheduler, job_type: JobType) -> JobRecord {
        s.service()
            .create_job(NewJob::new(job_type, SourceId::new("src").unwrap()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn stale_sweep_ignores_fresh_jobs_and_is_idempotent() {
        let (s, clock) = scheduler();
        let job = create(&s, JobType::CleanTranscript).await;
        s.service().start_processing(job.id).await.unwrap();

        let fresh = s.run_stale_sweep(clock.now()).await.unwrap();
        assert_eq!(fresh, SweepReport { examined: 1, ..SweepReport::default() });

        clock.advance(ChronoDuration::minutes(4));
        let first = s.run_stale_sweep(clock.now()).await.unwrap();
        assert_eq!(first.applied, 1);
        let second = s.run_stale_sweep(clock.now()).await.unwrap();
        assert_eq!(second.examined, 0);

        let record = s.service().get_job(job.id).await.unwrap();
        assert_eq!(record.status, JobStatus::Retrying);
    }

    #[tokio::test]
    async fn retry_sweep_resumes_due_jobs_once() {
        let (s, clock) = scheduler();
        let job = create(&s, JobType::ExtractInsights).await;
        s.service().start_processing(job.id).await.unwrap();
        s.service()
            .fail_job(job.id, JobError::new("timeout", clock.now()))
            .await
            .unwrap();

        let early = s.run_retry_sweep(clock.now()).await.unwrap();
        assert_eq!(early.applied, 0);

        clock.advance(ChronoDuration::seconds(3));
        let due = s.run_retry_sweep(clock.now()).await.unwrap();
        assert_eq!(due.applied, 1);
        let again = s.run_retry_sweep(clock.now()).await.unwrap();
        assert_eq!(again.applied, 0);

        let record = s.service().get_job(job.id).await.unwrap();
        assert_eq!(record.status, JobStatus::Processing);
        assert_eq!(record.retry_count, 1);
    }

    #[tokio::test]
    async fn retry_sweep_retries_failed_jobs_after_backoff_in_manual_mode() {
        let (s, clock) = scheduler_with(LifecycleConfig {
            auto_resolve_failures: false,
            ..LifecycleConfig::default()
        });
        let retryable = create(&s, JobType::CleanTranscript).await;
        let fatal = create(&s, JobType::CleanTranscript).await;
        for (job, retryable_error) in [(&retryable, true), (&fatal, false)] {
            s.service().start_processing(job.id).await.unwrap();
            s.service()
                .fail_job(job.id, JobError::new("boom", clock.now()).retryable(retryable_error))
                .await
                .unwrap();
        }

        assert_eq!(s.run_retry_sweep(clock.now()).await.unwrap().applied, 0);

        clock.advance(ChronoDuration::seconds(2));
        let report = s.run_retry_sweep(clock.now()).await.unwrap();
        assert_eq!(report.examined, 2);
        assert_eq!(report.applied, 1);

        let retried = s.service().get_job(retryable.id).await.unwrap();
        assert_eq!(retried.status, JobStatus::Retrying);
        let untouched = s.service().get_job(fatal.id).await.unwrap();
        assert_eq!(untouched.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn stuck_sweep_force_starts_old_queued_jobs() {
        let (s, clock) = scheduler();
        let old = create(&s, JobType::GeneratePosts).await;
        clock.advance(ChronoDuration::minutes(11));
        let young = create(&s, JobType::GeneratePosts).await;

        let report = s.run_stuck_sweep(clock.now()).await.unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(
            s.service().get_job(old.id).await.unwrap().status,
            JobStatus::Processing
        );
        assert_eq!(
            s.service().get_job(young.id).await.unwrap().status,
            JobStatus::Queued
        );
    }

    #[tokio::test]
    async fn stuck_sweep_force_resumes_overdue_retrying_jobs() {
        let (s, clock) = scheduler();
        let job = create(&s, JobType::CleanTranscript).await;
        s.service().start_processing(job.id).await.unwrap();
        s.service()
            .fail_job(job.id, JobError::new("boom", clock.now()))
            .await
            .unwrap();

        // Backoff is 1s; twice that has not passed yet.
        clock.advance(ChronoDuration::milliseconds(1_500));
        assert_eq!(s.run_stuck_sweep(clock.now()).await.unwrap().applied, 0);

        clock.advance(ChronoDuration::seconds(1));
        assert_eq!(s.run_stuck_sweep(clock.now()).await.unwrap().applied, 1);
        assert_eq!(
            s.service().get_job(job.id).await.unwrap().status,
            JobStatus::Processing
        );
    }

    #[tokio::test]
    async fn cleanup_deletes_only_old_completed_jobs() {
        let (s, clock) = scheduler();
        let done = create(&s, JobType::CleanTranscript).await;
        s.service().start_processing(done.id).await.unwrap();
        s.service().complete_job(done.id, None, None).await.unwrap();

        let cancelled = create(&s, JobType::CleanTranscript).await;
        s.service().cancel_job(cancelled.id, None).await.unwrap();

        let recent = s.run_cleanup_sweep(clock.now()).await.unwrap();
        assert_eq!(recent.applied, 0);

        clock.advance(ChronoDuration::days(31));
        let report = s.run_cleanup_sweep(clock.now()).await.unwrap();
        assert_eq!(report, SweepReport { examined: 1, applied: 1, ..SweepReport::default() });

        assert!(matches!(
            s.service().get_job(done.id).await.unwrap_err(),
            LifecycleError::JobNotFound(_)
        ));
        assert_eq!(
            s.service().get_job(cancelled.id).await.unwrap().status,
            JobStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn cleanup_with_unrepresentable_retention_deletes_nothing() {
        let (s, clock) = scheduler();
        let done = create(&s, JobType::CleanTranscript).await;
        s.service().start_processing(done.id).await.unwrap();
        s.service().complete_job(done.id, None, None).await.unwrap();

        let s = MaintenanceScheduler::new(
            Arc::clone(s.service()),
            MaintenanceConfig {
                retention_days: u32::MAX,
                ..MaintenanceConfig::default()
            },
            SweepIntervals::default(),
        );
        clock.advance(ChronoDuration::days(365));

        let report = s.run_cleanup_sweep(clock.now()).await.unwrap();
        assert_eq!(report, SweepReport::default());
        assert_eq!(
            s.service().get_job(done.id).await.unwrap().status,
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn concurrent_change_is_skipped_not_failed() {
        let (s, clock) = scheduler();
        let job = create(&s, JobType::CleanTranscript).await;
        s.service().start_processing(job.id).await.unwrap();
        clock.advance(ChronoDuration::minutes(4));

        // Someone completes the job between the sweep's query and its command.
        let current = s.service().get_job(job.id).await.unwrap();
        let mut completed = current.clone();
        completed.status = JobStatus::Completed;
        completed.completed_at = Some(clock.now());
        s.service()
            .store()
            .update(completed, ExpectedVersion::Exact(current.version))
            .await
            .unwrap();

        let mut report = SweepReport::default();
        let outcome = s.service().mark_stale(job.id).await;
        report.record(SweepKind::Stale, job.id, outcome);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn stats_sweep_reports_total() {
        let (s, clock) = scheduler();
        create(&s, JobType::CleanTranscript).await;
        create(&s, JobType::ExtractInsights).await;
        let report = s.run_sweep(SweepKind::Stats, clock.now()).await.unwrap();
        assert_eq!(report.examined, 2);
    }
}
