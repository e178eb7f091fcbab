//! Job lifecycle events and the sinks that receive them.

pub mod event;
pub mod in_memory_sink;
pub mod sink;

pub use event::{LifecycleEvent, LifecycleEventType};
pub use in_memory_sink::InMemoryEventSink;
pub use sink::{EventSink, FanoutEventSink, SinkError, Subscription, TracingEventSink};
