//! Aggregate job statistics.

use std::collections::BTreeMap;

use serde::Serialize;

use contentflow_jobs::{JobRecord, JobStatus, JobType};

/// Counts for one job type.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TypeStats {
    pub total: usize,
    pub by_status: BTreeMap<JobStatus, usize>,
    pub average_duration_ms: Option<f64>,
}

/// Counts per status and type plus average duration and cost.
///
/// Averages only consider jobs that report the value; `None` when none do.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobStats {
    pub total: usize,
    pub by_status: BTreeMap<JobStatus, usize>,
    pub by_type: BTreeMap<JobType, TypeStats>,
    pub average_duration_ms: Option<f64>,
    pub average_cost: Option<f64>,
    pub total_cost: f64,
}

#[derive(Default)]
struct Mean {
    sum: f64,
    count: usize,
}

impl Mean {
    fn add(&mut self, value: Option<f64>) {
        if let Some(value) = value {
            self.sum += value;
            self.count += 1;
        }
    }

    fn value(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

impl JobStats {
    pub fn from_records<'a, I>(records: I) -> Self
    where
        I: IntoIterator<Item = &'a JobRecord>,
    {
        let mut stats = JobStats::default();
        let mut duration = Mean::default();
        let mut cost = Mean::default();
        let mut type_durations: BTreeMap<JobType, Mean> = BTreeMap::new();

        for record in records {
            stats.total += 1;
            *stats.by_status.entry(record.status).or_default() += 1;

            let per_type = stats.by_type.entry(record.job_type).or_default();
            per_type.total += 1;
            *per_type.by_status.entry(record.status).or_default() += 1;

            let duration_ms = record.duration_ms.map(|ms| ms as f64);
            duration.add(duration_ms);
            type_durations.entry(record.job_type).or_default().add(duration_ms);
            cost.add(record.estimated_cost);
        }

        for (job_type, mean) in type_durations {
            if let Some(per_type) = stats.by_type.get_mut(&job_type) {
                per_type.average_duration_ms = mean.value();
            }
        }
        stats.average_duration_ms = duration.value();
        stats.average_cost = cost.value();
        stats.total_cost = cost.sum;
        stats
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.by_status.get(&status).copied().unwrap_or(0)
    }

    /// Jobs that still need work (queued, processing, failed, retrying).
    pub fn active(&self) -> usize {
        JobStatus::ALL
            .into_iter()
            .filter(|s| !s.is_terminal())
            .map(|s| self.count(s))
            .sum()
    }
}
