use std::sync::Arc;

use contentflow_events::{EventSink, FanoutEventSink, TracingEventSink};
use contentflow_infra::{
    ContentflowConfig, InMemoryJobStore, JobLifecycleService, JobStore, MaintenanceScheduler,
};

pub type JobService = JobLifecycleService<Arc<dyn JobStore>, Arc<dyn EventSink>>;
pub type JobScheduler = MaintenanceScheduler<Arc<dyn JobStore>, Arc<dyn EventSink>>;

/// Everything the handlers and the binary share.
pub struct AppServices {
    pub jobs: Arc<JobService>,
    pub scheduler: Arc<JobScheduler>,
}

/// In-memory store; lifecycle events go to the log.
pub fn build_services(config: &ContentflowConfig) -> AppServices {
    let sink = FanoutEventSink::new().with(Arc::new(TracingEventSink));
    build_services_with(config, Arc::new(sink))
}

pub fn build_services_with(config: &ContentflowConfig, sink: Arc<dyn EventSink>) -> AppServices {
    let store: Arc<dyn JobStore> = InMemoryJobStore::arc();

    let jobs = Arc::new(JobLifecycleService::new(
        store,
        sink,
        config.job_types.clone(),
        config.lifecycle,
    ));
    let scheduler = Arc::new(MaintenanceScheduler::new(
        Arc::clone(&jobs),
        config.maintenance,
        config.sweeps,
    ));

    AppServices { jobs, scheduler }
}
