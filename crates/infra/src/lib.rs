//! Infrastructure layer: job persistence, the lifecycle service, maintenance
//! sweeps and configuration loading.

pub mod clock;
pub mod config;
pub mod lifecycle;
pub mod maintenance;
pub mod stats;
pub mod store;


pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    ConfigError, ContentflowConfig, LifecycleConfig, MaintenanceConfig, SweepIntervals,
};
pub use lifecycle::{JobLifecycleService, LifecycleError, ScheduledRetry};
pub use maintenance::{MaintenanceHandle, MaintenanceScheduler, SweepKind, SweepReport};
pub use stats::{JobStats, TypeStats};
pub use store::{InMemoryJobStore, JobFilter, JobStore, JobStoreError};
