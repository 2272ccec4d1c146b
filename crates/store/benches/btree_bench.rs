//! B+ tree engine benchmarks.
//!
//! Measures point lookups, batch inserts, ordered scans, overflow values, and
//! a mixed read/write workload over file-backed and in-memory stores.

#![allow(clippy::expect_used, missing_docs)]

use std::{hint::black_box, time::Duration};

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use kvs_store::{Database, FileBackend, InMemoryBackend, StorageBackend, StoreConfig};
use tempfile::TempDir;

// =============================================================================
// Helpers
// =============================================================================

fn bench_config() -> StoreConfig {
    StoreConfig::builder().sync_on_commit(false).build().expect("bench config")
}

fn open_file_db() -> (TempDir, Database<FileBackend>) {
    let temp_dir = TempDir::new().expect("create temp dir");
    let db = Database::open_with_config(temp_dir.path().join("bench.kvs"), bench_config())
        .expect("open database");
    (temp_dir, db)
}

/// Inserts `count` sequential key-value pairs in batches.
fn populate<B: StorageBackend>(db: &Database<B>, count: usize, batch_size: usize) {
    for batch_start in (0..count).step_by(batch_size) {
        let batch_end = (batch_start + batch_size).min(count);
        let mut txn = db.write().expect("write txn");
        for i in batch_start..batch_end {
            let key = format!("key-{i:08}");
            let value = format!("value-{i}");
            txn.insert(key.as_bytes(), value.as_bytes()).expect("insert");
        }
        txn.commit().expect("commit");
    }
}

// =============================================================================
// Lookups
// =============================================================================

/// Point lookups at growing dataset sizes, tracking the cost of a deeper tree.
fn bench_point_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree/point_lookup");
    group.throughput(Throughput::Elements(1));

    for entry_count in [1_000, 10_000, 100_000] {
        let (_dir, db) = open_file_db();
        populate(&db, entry_count, 1000);

        group.bench_with_input(
            BenchmarkId::new("sequential", format!("{}k", entry_count / 1000)),
            &entry_count,
            |b, &entry_count| {
                let mut counter = 0usize;
                b.iter(|| {
                    counter = (counter + 1) % entry_count;
                    let key = format!("key-{counter:08}");
                    let txn = db.read().expect("read txn");
                    black_box(txn.get(key.as_bytes()))
                });
            },
        );
    }

    group.finish();
}

fn bench_missing_key_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree/missing_key");
    group.throughput(Throughput::Elements(1));

    let (_dir, db) = open_file_db();
    populate(&db, 10_000, 1000);

    group.bench_function("10k", |b| {
        let mut counter = 0u64;
        b.iter(|| {
            counter += 1;
            let key = format!("absent-{counter:08}");
            let txn = db.read().expect("read txn");
            black_box(txn.get(key.as_bytes()))
        });
    });

    group.finish();
}

// =============================================================================
// Inserts
// =============================================================================

fn bench_batch_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree/batch_insert");

    for batch_size in [10, 100, 1000] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(BenchmarkId::new("file", batch_size), &batch_size, |b, &size| {
            b.iter_with_setup(open_file_db, |(_dir, db)| {
                populate(&db, size, size);
                black_box(db.stats().commits)
            });
        });
    }

    group.finish();
}

fn bench_insert_in_memory(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree/insert_in_memory");

    for batch_size in [100, 1000] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(BenchmarkId::new("memory", batch_size), &batch_size, |b, &size| {
            b.iter_with_setup(
                || Database::<InMemoryBackend>::open_in_memory().expect("open in memory"),
                |db| {
                    populate(&db, size, size);
                    black_box(db.stats().total_pages)
                },
            );
        });
    }

    group.finish();
}

fn bench_overflow_values(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree/overflow_values");

    for value_len in [1_024usize, 16_384, 262_144] {
        let value = vec![0x5Au8; value_len];
        group.throughput(Throughput::Bytes(value_len as u64));
        group.bench_with_input(BenchmarkId::new("put_get", value_len), &value, |b, value| {
            let db = Database::<InMemoryBackend>::open_in_memory().expect("open in memory");
            b.iter(|| {
                let mut txn = db.write().expect("write txn");
                txn.insert(b"blob", value).expect("insert");
                txn.commit().expect("commit");
                black_box(db.read().expect("read txn").get(b"blob").expect("get"))
            });
        });
    }

    group.finish();
}

// =============================================================================
// Scans
// =============================================================================

fn bench_iteration(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree/iteration");

    for entry_count in [1_000, 10_000] {
        let (_dir, db) = open_file_db();
        populate(&db, entry_count, 1000);
        group.throughput(Throughput::Elements(entry_count as u64));

        group.bench_with_input(BenchmarkId::new("full_scan", entry_count), &entry_count, |b, _| {
            b.iter(|| {
                let txn = db.read().expect("read txn");
                let count = txn.iter().expect("iter").filter_map(Result::ok).count();
                black_box(count)
            });
        });
    }

    group.finish();
}

fn bench_seek(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree/seek");
    group.throughput(Throughput::Elements(1));

    let (_dir, db) = open_file_db();
    populate(&db, 10_000, 1000);

    group.bench_function("between_keys", |b| {
        let mut counter = 0usize;
        b.iter(|| {
            counter = (counter + 7) % 10_000;
            let probe = format!("key-{counter:08}-");
            let txn = db.read().expect("read txn");
            black_box(txn.seek(probe.as_bytes()))
        });
    });

    group.finish();
}

// =============================================================================
// Mixed Workload
// =============================================================================

fn bench_mixed_workload(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree/mixed_workload");
    group.throughput(Throughput::Elements(100));

    let (_dir, db) = open_file_db();
    populate(&db, 10_000, 1000);

    group.bench_function("90r_10w", |b| {
        let mut counter = 0u64;
        b.iter(|| {
            for i in 0..90u64 {
                let key = format!("key-{:08}", (counter + i) % 10_000);
                let txn = db.read().expect("read txn");
                let _ = txn.get(key.as_bytes());
            }

            let mut txn = db.write().expect("write txn");
            for _ in 0..10 {
                counter += 1;
                let key = format!("mixed-{counter:012}");
                txn.insert(key.as_bytes(), format!("val-{counter}").as_bytes()).expect("insert");
            }
            txn.commit().expect("commit");

            black_box(counter)
        });
    });

    group.finish();
}

// =============================================================================
// Criterion Configuration
// =============================================================================

criterion_group! {
    name = lookup_benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(5))
        .sample_size(100);
    targets = bench_point_lookup, bench_missing_key_lookup
}

criterion_group! {
    name = insert_benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(5))
        .sample_size(50);
    targets = bench_batch_insert, bench_insert_in_memory, bench_overflow_values
}

criterion_group! {
    name = scan_benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(10))
        .sample_size(20);
    targets = bench_iteration, bench_seek
}

criterion_group! {
    name = mixed_benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(5))
        .sample_size(50);
    targets = bench_mixed_workload
}

criterion_main!(lookup_benches, insert_benches, scan_benches, mixed_benches);
