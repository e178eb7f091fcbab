use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use contentflow_core::JobId;

/// Kind of lifecycle notification.
///
/// One notification is emitted per committed state transition.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleEventType {
    #[serde(rename = "job.created")]
    Created,
    #[serde(rename = "job.started")]
    Started,
    #[serde(rename = "job.progress")]
    Progress,
    #[serde(rename = "job.completed")]
    Completed,
    #[serde(rename = "job.failed")]
    Failed,
    #[serde(rename = "job.retrying")]
    Retrying,
    #[serde(rename = "job.cancelled")]
    Cancelled,
    #[serde(rename = "job.stale")]
    Stale,
}

impl LifecycleEventType {
    /// Stable wire name (e.g. "job.started").
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "job.created",
            Self::Started => "job.started",
            Self::Progress => "job.progress",
            Self::Completed => "job.completed",
            Self::Failed => "job.failed",
            Self::Retrying => "job.retrying",
            Self::Cancelled => "job.cancelled",
            Self::Stale => "job.stale",
        }
    }
}

impl core::fmt::Display for LifecycleEventType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A notification about one job, handed to an [`crate::EventSink`].
///
/// Events are facts about transitions that already committed; sinks must
/// treat them as immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub event_id: Uuid,
    pub job_id: JobId,
    pub event_type: LifecycleEventType,
    pub payload: JsonValue,
    pub occurred_at: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn new(
        job_id: JobId,
        event_type: LifecycleEventType,
        payload: JsonValue,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            job_id,
            event_type,
            payload,
            occurred_at,
        }
    }
}
