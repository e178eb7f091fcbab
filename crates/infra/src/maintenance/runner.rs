use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use contentflow_events::EventSink;

use super::{MaintenanceScheduler, SweepKind};
use crate::store::JobStore;

/// Handle to stop the background sweeps.
#[derive(Debug)]
pub struct MaintenanceHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<(SweepKind, JoinHandle<()>)>,
}

impl MaintenanceHandle {
    /// Signal every sweep task to stop and wait for them. A sweep that is
    /// running finishes its current pass first.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for (kind, task) in self.tasks {
            if let Err(err) = task.await {
                warn!(sweep = kind.as_str(), error = %err, "maintenance task ended abnormally");
            }
        }
    }
}

impl<S, E> MaintenanceScheduler<S, E>
where
    S: JobStore + 'static,
    E: EventSink + 'static,
{
    /// Spawn one task per sweep, each on its own interval.
    ///
    /// Every sweep runs once right away, which picks up work left behind by a
    /// previous process. Ticks missed while a sweep is slow are skipped.
    pub fn spawn(self: Arc<Self>) -> MaintenanceHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let tasks = SweepKind::ALL
            .into_iter()
            .map(|kind| {
                let scheduler = Arc::clone(&self);
                let shutdown = shutdown_rx.clone();
                let period = kind.interval(&self.intervals);
                let task =
                    tokio::spawn(async move { scheduler.sweep_loop(kind, period, shutdown).await });
                (kind, task)
            })
            .collect();

        info!("maintenance scheduler started");
        MaintenanceHandle {
            shutdown: shutdown_tx,
            tasks,
        }
    }

    async fn sweep_loop(
        &self,
        kind: SweepKind,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(sweep = kind.as_str(), "maintenance sweep stopping");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let now = self.service.now();
                    if let Err(err) = self.run_sweep(kind, now).await {
                        error!(sweep = kind.as_str(), error = %err, "maintenance sweep failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use contentflow_core::SourceId;
    use contentflow_events::{InMemoryEventSink, LifecycleEventType};
    use contentflow_jobs::{JobStatus, JobType, JobTypeRegistry, NewJob};

    use crate::clock::ManualClock;
    use crate::config::{LifecycleConfig, MaintenanceConfig, SweepIntervals};
    use crate::lifecycle::JobLifecycleService;
    use crate::store::InMemoryJobStore;

    #[tokio::test]
    async fn spawned_sweeps_run_immediately_and_stop_on_shutdown() {
        let clock = Arc::new(ManualClock::default());
        let sink = Arc::new(InMemoryEventSink::new());
        let service = Arc::new(
            JobLifecycleService::new(
                InMemoryJobStore::arc(),
                sink.clone(),
                JobTypeRegistry::default(),
                LifecycleConfig::default(),
            )
            .with_clock(clock.clone()),
        );

        let job = service
            .create_job(NewJob::new(JobType::GeneratePosts, SourceId::new("t").unwrap()))
            .await
            .unwrap();
        service.start_processing(job.id).await.unwrap();
        clock.advance(ChronoDuration::minutes(11));

        let scheduler = Arc::new(MaintenanceScheduler::new(
            service.clone(),
            MaintenanceConfig::default(),
            SweepIntervals::default(),
        ));
        let handle = scheduler.spawn();

        let mut stale_seen = false;
        for _ in 0..100 {
            if sink.event_types_for(job.id).contains(&LifecycleEventType::Stale) {
                stale_seen = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.shutdown().await;

        assert!(stale_seen, "stale sweep did not run on startup");
        let record = service.get_job(job.id).await.unwrap();
        assert_ne!(record.status, JobStatus::Processing);
    }
}
