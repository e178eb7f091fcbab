//! `contentflow-core`: foundation building blocks shared by every crate.
//!
//! This crate contains **pure** primitives (no IO, no async).

pub mod error;
pub mod id;
pub mod version;

pub use error::{DomainError, DomainResult};
pub use id::{JobId, SourceId};
pub use version::ExpectedVersion;
