//! In-memory event sink for tests/dev.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, mpsc};

use async_trait::async_trait;

use contentflow_core::JobId;

use crate::event::{LifecycleEvent, LifecycleEventType};
use crate::sink::{EventSink, SinkError, Subscription};

/// In-memory sink.
///
/// - Records every accepted event (inspect with [`InMemoryEventSink::events`])
/// - Best-effort fan-out to subscribers
/// - Can be switched into a failing mode to exercise fire-and-forget paths
#[derive(Debug, Default)]
pub struct InMemoryEventSink {
    log: Mutex<Vec<LifecycleEvent>>,
    subscribers: Mutex<Vec<mpsc::Sender<LifecycleEvent>>>,
    failing: AtomicBool,
}

impl InMemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// When set, every `emit` fails with [`SinkError::Unavailable`] and nothing is recorded.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// All recorded events, oldest first.
    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    /// Recorded event types for a single job, oldest first.
    pub fn event_types_for(&self, job_id: JobId) -> Vec<LifecycleEventType> {
        self.events()
            .into_iter()
            .filter(|e| e.job_id == job_id)
            .map(|e| e.event_type)
            .collect()
    }

    pub fn subscribe(&self) -> Subscription<LifecycleEvent> {
        let (tx, rx) = mpsc::channel();

        // A poisoned lock still yields a subscription; it just never receives.
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }

        Subscription::new(rx)
    }
}

#[async_trait]
impl EventSink for InMemoryEventSink {
    async fn emit(&self, event: LifecycleEvent) -> Result<(), SinkError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SinkError::Unavailable("in-memory sink set to fail".to_string()));
        }

        {
            let mut subs = self.subscribers.lock().map_err(|_| SinkError::Poisoned)?;
            // Drop any dead subscribers while publishing.
            subs.retain(|tx| tx.send(event.clone()).is_ok());
        }

        self.log.lock().map_err(|_| SinkError::Poisoned)?.push(event);
        Ok(())
    }
}
