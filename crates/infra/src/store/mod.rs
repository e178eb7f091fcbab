//! Job persistence boundary.
//!
//! The store is the single source of truth for job state. Writes are
//! compare-and-swap on the record `version`, which is what makes per-job
//! transitions linearizable without holding a lock across the
//! read-transition-write sequence.

pub mod in_memory;
pub mod r#trait;

pub use in_memory::InMemoryJobStore;
pub use r#trait::{JobFilter, JobStore, JobStoreError};
