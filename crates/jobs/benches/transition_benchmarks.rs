use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};

use chrono::{Duration, Utc};
use contentflow_core::{JobId, SourceId};
use contentflow_jobs::{
    JobError, JobEvent, JobRecord, JobType, JobTypeRegistry, NewJob, TransitionContext,
    transition,
};

fn processing_record(registry: &JobTypeRegistry) -> JobRecord {
    let now = Utc::now();
    let queued = JobRecord::new(
        JobId::new(),
        NewJob::new(
            JobType::ExtractInsights,
            SourceId::new("bench-transcript").unwrap(),
        ),
        now,
    );
    transition(&queued, JobEvent::Start, &TransitionContext::new(registry, now))
        .unwrap()
        .record
}

fn bench_transitions(c: &mut Criterion) {
    let registry = JobTypeRegistry::default();
    let record = processing_record(&registry);
    let later = Utc::now() + Duration::seconds(30);
    let ctx = TransitionContext::new(&registry, later);

    let mut group = c.benchmark_group("transition");

    group.bench_function("update_progress", |b| {
        b.iter(|| {
            let event = JobEvent::UpdateProgress {
                progress: black_box(42),
                message: None,
                metadata: None,
            };
            black_box(transition(&record, event, &ctx).unwrap());
        });
    });

    group.bench_function("fail_and_schedule_retry", |b| {
        b.iter(|| {
            let event = JobEvent::Fail {
                error: JobError::new("provider timeout", later),
            };
            black_box(transition(&record, event, &ctx).unwrap());
        });
    });

    // Growing histories make every clone more expensive.
    for updates in [10usize, 100, 1000] {
        let mut long = record.clone();
        for i in 0..updates {
            let event = JobEvent::UpdateProgress {
                progress: (i % 100) as i64,
                message: Some(format!("step {i}")),
                metadata: None,
            };
            long = transition(&long, event, &ctx).unwrap().record;
        }
        group.bench_with_input(
            BenchmarkId::new("update_progress_with_history", updates),
            &long,
            |b, long| {
                b.iter(|| {
                    let event = JobEvent::UpdateProgress {
                        progress: 99,
                        message: None,
                        metadata: None,
                    };
                    black_box(transition(long, event, &ctx).unwrap());
                });
            },
        );
    }

    group.finish();
}

fn bench_backoff(c: &mut Criterion) {
    let registry = JobTypeRegistry::default();
    c.bench_function("calculate_backoff", |b| {
        b.iter(|| {
            for retry in 0..16u32 {
                black_box(registry.calculate_backoff(JobType::GeneratePosts, black_box(retry)));
            }
        });
    });
}

criterion_group!(benches, bench_transitions, bench_backoff);
criterion_main!(benches);
