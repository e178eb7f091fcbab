//! `contentflow-jobs`: the job lifecycle domain.
//!
//! **Responsibility:** everything about a job that can be decided without IO:
//! - the per-type configuration table ([`JobTypeRegistry`])
//! - the persisted entity and its derived queries ([`JobRecord`])
//! - the transition engine ([`transition`]) that turns `(record, event)` into
//!   the next record plus the side effects the caller must perform
//!
//! Persistence, event delivery and timers live in `contentflow-infra`.

pub mod format;
pub mod machine;
pub mod record;
pub mod registry;

pub use machine::{
    CompletionMetrics, Effect, JobEvent, JobOutput, Transition, TransitionContext,
    TransitionError, estimate_remaining_ms, rejection_message, transition,
};
pub use record::{
    JobError, JobRecord, JobStatus, NewJob, ProcessingMetrics, ProgressUpdate, RetryBlock,
};
pub use registry::{JobType, JobTypeConfig, JobTypeRegistry};

/// Open key/value map attached to records and progress updates.
pub type Metadata = serde_json::Map<String, serde_json::Value>;
