use std::time::Duration;

use criterion::{criterion_group, criterion_main, Criterion};

use apmkit::{Application, Config, SegmentMetadata, TransactionKind};

fn quiet_application(name: &str) -> Application {
    Application::builder()
        .with_config(Config::default().with_harvest_interval(Duration::from_secs(3600)))
        .build(name)
        .expect("valid bench application")
}

fn transaction_hot_path(c: &mut Criterion) {
    let application = quiet_application("bench-hot-path");
    c.bench_function("transaction_with_nested_segments", |b| {
        b.iter(|| {
            let mut txn = application.begin_transaction(TransactionKind::Web, "bench");
            let outer = txn
                .push_segment(SegmentMetadata::function("outer"))
                .unwrap();
            let query = txn
                .push_segment(SegmentMetadata::database("SELECT 1"))
                .unwrap();
            txn.pop_segment(query).unwrap();
            txn.pop_segment(outer).unwrap();
            txn.close().unwrap();
        });
    });
}

fn deep_nesting(c: &mut Criterion) {
    let application = quiet_application("bench-deep");
    c.bench_function("push_pop_depth_64", |b| {
        b.iter(|| {
            let mut txn = application.begin_transaction(TransactionKind::Background, "bench");
            let handles: Vec<_> = (0..64)
                .map(|_| {
                    txn.push_segment(SegmentMetadata::function("nested"))
                        .unwrap()
                })
                .collect();
            for handle in handles.into_iter().rev() {
                txn.pop_segment(handle).unwrap();
            }
            txn.close().unwrap();
        });
    });
}

criterion_group!(benches, transaction_hot_path, deep_nesting);
criterion_main!(benches);
