//! Event sink abstraction (mechanics only).
//!
//! The lifecycle service hands every committed transition to an [`EventSink`].
//! Delivery is fire-and-forget from the service's point of view: the record is
//! already persisted when `emit` runs, so a failing sink is logged and never
//! rolls the transition back.

use std::sync::Arc;
use std::sync::mpsc::Receiver;

use async_trait::async_trait;
use thiserror::Error;

use crate::event::LifecycleEvent;

/// Failure to hand an event to its transport.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// The transport is not accepting events right now.
    #[error("event sink unavailable: {0}")]
    Unavailable(String),

    /// Internal state was poisoned by a panicking writer.
    #[error("event sink poisoned")]
    Poisoned,
}

/// A subscription to the events observed by a sink.
///
/// Each subscription gets a copy of every event emitted after it was created.
/// Meant to be consumed by one thread or task.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Drain everything currently queued.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

/// Receiver of lifecycle notifications.
///
/// Implementations must be safe to share across tasks; the lifecycle service
/// and the maintenance sweeps emit concurrently.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: LifecycleEvent) -> Result<(), SinkError>;
}

#[async_trait]
impl<S> EventSink for Arc<S>
where
    S: EventSink + ?Sized,
{
    async fn emit(&self, event: LifecycleEvent) -> Result<(), SinkError> {
        (**self).emit(event).await
    }
}

/// Sink that writes each event to the `tracing` pipeline.
///
/// Useful as the default transport when nothing pushes updates to clients.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn emit(&self, event: LifecycleEvent) -> Result<(), SinkError> {
        tracing::info!(
            job_id = %event.job_id,
            event_type = %event.event_type,
            payload = %event.payload,
            "job lifecycle event"
        );
        Ok(())
    }
}

/// Sink that forwards every event to several inner sinks.
///
/// All inner sinks are attempted; the first error (if any) is returned after
/// the others have been tried.
#[derive(Default)]
pub struct FanoutEventSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl core::fmt::Debug for FanoutEventSink {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FanoutEventSink")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

#[async_trait]
impl EventSink for FanoutEventSink {
    async fn emit(&self, event: LifecycleEvent) -> Result<(), SinkError> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(err) = sink.emit(event.clone()).await {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InMemoryEventSink, LifecycleEventType};
    use chrono::Utc;
    use contentflow_core::JobId;

    fn sample_event() -> LifecycleEvent {
        LifecycleEvent::new(
            JobId::new(),
            LifecycleEventType::Started,
            serde_json::json!({ "attempt": 0 }),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn fanout_reaches_every_sink_even_when_one_fails() {
        let healthy = Arc::new(InMemoryEventSink::new());
        let broken = Arc::new(InMemoryEventSink::new());
        broken.set_failing(true);

        let fanout = FanoutEventSink::new()
            .with(broken.clone())
            .with(healthy.clone());

        let err = fanout.emit(sample_event()).await.unwrap_err();
        assert!(matches!(err, SinkError::Unavailable(_)));
        assert_eq!(healthy.events().len(), 1);
        assert!(broken.events().is_empty());
    }

    #[tokio::test]
    async fn tracing_sink_never_fails() {
        assert!(TracingEventSink.emit(sample_event()).await.is_ok());
    }
}
