use std::collections::HashMap;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, Criterion};

use apmkit::{MetricName, TimeStats};

fn time_stats_record(c: &mut Criterion) {
    c.bench_function("time_stats_record", |b| {
        let mut stats = TimeStats::default();
        b.iter(|| {
            stats.record(Duration::from_micros(250), Duration::from_micros(120));
        });
    });
}

fn time_stats_merge(c: &mut Criterion) {
    let mut other = TimeStats::default();
    for n in 0..100u64 {
        other.record(Duration::from_micros(n * 10), Duration::from_micros(n * 5));
    }
    c.bench_function("time_stats_merge", |b| {
        let mut stats = TimeStats::default();
        b.iter(|| {
            stats.merge(&other);
        });
    });
}

fn metric_table_merge(c: &mut Criterion) {
    let names: Vec<MetricName> = (0..64)
        .map(|n| MetricName::from(format!("Function/handler_{n}")))
        .collect();
    let mut workarea = HashMap::<MetricName, TimeStats>::new();
    for name in &names {
        workarea
            .entry(name.clone())
            .or_default()
            .record(Duration::from_micros(300), Duration::from_micros(200));
    }

    c.bench_function("metric_table_merge_64_names", |b| {
        let mut table = HashMap::<MetricName, TimeStats>::new();
        b.iter(|| {
            for (name, stats) in &workarea {
                table.entry(name.clone()).or_default().merge(stats);
            }
        });
    });
}

criterion_group!(benches, time_stats_record, time_stats_merge, metric_table_merge);
criterion_main!(benches);
