//! Human-readable renderings of record values for logs and dashboards.

use chrono::{DateTime, Utc};

use crate::record::{JobRecord, elapsed_between};

/// `850ms`, `12.3s`, `1m 5s`, `1h 2m`.
pub fn format_duration(ms: u64) -> String {
    if ms < 1_000 {
        return format!("{ms}ms");
    }
    if ms < 60_000 {
        return format!("{:.1}s", ms as f64 / 1_000.0);
    }
    let total_secs = ms / 1_000;
    let (hours, minutes, seconds) = (total_secs / 3_600, (total_secs / 60) % 60, total_secs % 60);
    if hours > 0 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m {seconds}s")
    }
}

/// Four decimals below one cent, two otherwise.
pub fn format_cost(cost: f64) -> String {
    if cost < 0.01 {
        format!("${cost:.4}")
    } else {
        format!("${cost:.2}")
    }
}

/// Coarse age of an instant: `just now`, `5m ago`, `3h ago`, `2d ago`.
pub fn format_age(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let minutes = elapsed_between(at, now) / 60_000;
    match minutes {
        0 => "just now".to_string(),
        m if m < 60 => format!("{m}m ago"),
        m if m < 60 * 24 => format!("{}h ago", m / 60),
        m => format!("{}d ago", m / (60 * 24)),
    }
}

impl JobRecord {
    pub fn formatted_duration(&self) -> Option<String> {
        self.duration_ms.map(format_duration)
    }

    pub fn formatted_cost(&self) -> Option<String> {
        self.estimated_cost.map(format_cost)
    }

    /// Age since creation.
    pub fn formatted_age(&self, now: DateTime<Utc>) -> String {
        format_age(self.created_at, now)
    }
}
