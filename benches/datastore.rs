//! Criterion benchmarks for the data store hot paths.
//!
//! The poll loop inserts under a write lock and every client request queries
//! under a read lock, so both paths bound how long the other side waits.
//!
//! Run with: cargo bench --bench datastore

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use datalog::data::{DataStore, Reading, ReadingQuery};

fn readings(count: i64, channels: u8) -> Vec<Reading> {
    let channel_list: Vec<u8> = (1..=channels).collect();
    (1..=count)
        .map(|t| {
            let values: Vec<f64> = channel_list
                .iter()
                .map(|&c| (t * i64::from(c)) as f64)
                .collect();
            Reading::new(t * 1000, &channel_list, &values).unwrap()
        })
        .collect()
}

/// Inserting into a full store, which evicts one reading per insert.
fn datastore_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("datastore_insert");

    for channels in [1u8, 4, 16] {
        let batch = readings(1000, channels);
        group.throughput(Throughput::Elements(batch.len() as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}ch", channels)),
            &batch,
            |b, batch| {
                b.iter(|| {
                    let mut store = DataStore::new(500);
                    store.insert(batch.iter().cloned()).unwrap();
                    black_box(store.len())
                });
            },
        );
    }

    group.finish();
}

/// Typical client queries against a full store.
fn datastore_query(c: &mut Criterion) {
    let mut store = DataStore::new(1000);
    store.insert(readings(1000, 4)).unwrap();

    let queries = [
        ("latest_100", ReadingQuery::new().latest().amount(100)),
        ("after_midpoint", ReadingQuery::new().after(500_000)),
        ("channel_2", ReadingQuery::new().channels(vec![2])),
    ];

    let mut group = c.benchmark_group("datastore_query");
    for (name, query) in &queries {
        group.bench_with_input(BenchmarkId::new("get_readings", name), query, |b, q| {
            b.iter(|| black_box(store.get_readings(q)));
        });
        group.bench_with_input(BenchmarkId::new("to_json", name), query, |b, q| {
            b.iter(|| black_box(store.to_json(q).unwrap()));
        });
    }
    group.finish();
}

criterion_group!(benches, datastore_insert, datastore_query);
criterion_main!(benches);
