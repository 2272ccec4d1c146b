//! End-to-end tests of the `Store` API over real files.

// Test code is allowed to use unwrap for simplicity
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]

use std::{
    collections::BTreeMap,
    sync::{
        Arc, Barrier,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use kvs_store::{Error, Store, StoreConfig};
use kvs_test_utils::{KvOp, TestDir, strategies};
use proptest::prelude::*;
use rand::{Rng, SeedableRng, rngs::StdRng};

fn small_pages() -> StoreConfig {
    StoreConfig::builder().page_size(512).build().unwrap()
}

#[test]
fn test_basic_scenario() {
    let dir = TestDir::new();
    let store = Store::open(dir.join("s.db")).unwrap();

    store.put(b"a", b"1").unwrap();
    assert_eq!(store.get(b"a").unwrap(), b"1");
    store.put(b"a", b"1").unwrap();
    assert_eq!(store.get(b"a").unwrap(), b"1");
    assert!(matches!(store.get(b"missing"), Err(Error::KeyNotFound)));

    store.delete(b"a").unwrap();
    assert!(matches!(store.delete(b"a"), Err(Error::KeyNotFound)));
    assert!(matches!(store.get(b"a"), Err(Error::KeyNotFound)));
    assert!(matches!(store.get(b""), Err(Error::KeyNotFound)));

    store.close().unwrap();
}

#[test]
fn test_empty_key_sorts_first() {
    let dir = TestDir::new();
    let store = Store::open(dir.store_path()).unwrap();
    store.put(b"b", b"2").unwrap();
    store.put(b"", b"empty").unwrap();
    store.put(b"\x00", b"nul").unwrap();

    assert_eq!(store.get(b"").unwrap(), b"empty");
    assert_eq!(store.seek(b"").unwrap(), Some((Vec::new(), b"empty".to_vec())));
    let keys = store
        .view(|txn| txn.iter()?.map(|entry| entry.map(|(k, _)| k)).collect::<Result<Vec<_>, _>>())
        .unwrap();
    assert_eq!(keys, vec![b"".to_vec(), b"\x00".to_vec(), b"b".to_vec()]);
}

#[test]
fn test_data_survives_reopen() {
    let dir = TestDir::new();
    let path = dir.store_path();
    {
        let store = Store::open_with_config(&path, small_pages()).unwrap();
        for i in 0..500u32 {
            store.put(format!("key{i:05}").as_bytes(), format!("value{i}").as_bytes()).unwrap();
        }
        for i in (0..500u32).step_by(3) {
            store.delete(format!("key{i:05}").as_bytes()).unwrap();
        }
    }

    let store = Store::open(&path).unwrap();
    assert_eq!(store.stats().unwrap().page_size, 512);
    for i in 0..500u32 {
        let result = store.get(format!("key{i:05}").as_bytes());
        if i % 3 == 0 {
            assert!(matches!(result, Err(Error::KeyNotFound)));
        } else {
            assert_eq!(result.unwrap(), format!("value{i}").into_bytes());
        }
    }
    assert!(store.verify().unwrap().is_clean());
}

#[test]
fn test_large_values_use_overflow_pages() {
    let dir = TestDir::new();
    let store = Store::open_with_config(dir.store_path(), small_pages()).unwrap();

    let values: Vec<Vec<u8>> = [1usize, 300, 511, 512, 2_000, 65_536]
        .iter()
        .map(|&len| (0..len).map(|i| (i * 7 % 256) as u8).collect())
        .collect();
    for (i, value) in values.iter().enumerate() {
        store.put(format!("v{i}").as_bytes(), value).unwrap();
    }
    for (i, value) in values.iter().enumerate() {
        assert_eq!(&store.get(format!("v{i}").as_bytes()).unwrap(), value);
    }
    assert!(store.verify().unwrap().is_clean());
}

#[test]
fn test_overwrite_releases_old_overflow_chain() {
    let dir = TestDir::new();
    let store = Store::open_with_config(dir.store_path(), small_pages()).unwrap();

    store.put(b"big", &[0xAB; 10_000]).unwrap();
    let free_before = store.stats().unwrap().free_pages;

    store.put(b"big", b"small").unwrap();
    assert_eq!(store.get(b"big").unwrap(), b"small");

    // 10 000 bytes need about twenty 512-byte overflow pages
    let stats = store.stats().unwrap();
    assert!(stats.free_pages >= free_before + 15, "free pages: {}", stats.free_pages);

    let total = stats.total_pages;
    store.put(b"other", &[0xCD; 10_000]).unwrap();
    assert!(store.stats().unwrap().total_pages <= total + 6);
    assert!(store.verify().unwrap().is_clean());
}

#[test]
fn test_delete_absent_key_leaves_file_unchanged() {
    let dir = TestDir::new();
    let path = dir.store_path();
    let store = Store::open(&path).unwrap();
    for i in 0..50u32 {
        store.put(format!("k{i}").as_bytes(), b"v").unwrap();
    }

    let before = std::fs::read(&path).unwrap();
    let commits = store.stats().unwrap().commits;
    assert!(matches!(store.delete(b"absent"), Err(Error::KeyNotFound)));
    let after = std::fs::read(&path).unwrap();

    assert_eq!(before, after);
    assert_eq!(store.stats().unwrap().commits, commits);
}

#[test]
fn test_rewrites_reuse_pages() {
    let dir = TestDir::new();
    let store = Store::open_with_config(dir.store_path(), small_pages()).unwrap();

    let write_round = |round: u8| {
        store
            .update(|txn| {
                for i in 0..100u32 {
                    txn.insert(format!("key{i:03}").as_bytes(), &[round; 64])?;
                }
                Ok(())
            })
            .unwrap();
    };

    write_round(0);
    write_round(1);
    let after_two = store.stats().unwrap().total_pages;
    for round in 2..50u8 {
        write_round(round);
    }

    let stats = store.stats().unwrap();
    assert!(
        stats.total_pages <= after_two + 8,
        "file grew from {after_two} to {} pages",
        stats.total_pages
    );
    assert_eq!(store.get(b"key042").unwrap(), vec![49u8; 64]);
}

#[test]
fn test_second_open_times_out() {
    let dir = TestDir::new();
    let path = dir.store_path();
    let _holder = Store::open(&path).unwrap();

    let config = StoreConfig::builder().lock_timeout(Duration::from_millis(100)).build().unwrap();
    let start = Instant::now();
    let result = Store::open_with_config(&path, config);

    assert!(matches!(result, Err(Error::LockTimeout { .. })));
    assert!(start.elapsed() >= Duration::from_millis(100));
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_second_open_succeeds_once_lock_released() {
    let dir = TestDir::new();
    let path = dir.store_path();
    let holder = Store::open(&path).unwrap();
    holder.put(b"k", b"v").unwrap();

    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        holder.close().unwrap();
    });

    let config = StoreConfig::builder().lock_timeout(Duration::from_secs(10)).build().unwrap();
    let store = Store::open_with_config(&path, config).unwrap();
    assert_eq!(store.get(b"k").unwrap(), b"v");
    releaser.join().unwrap();
}

#[test]
fn test_readers_see_whole_commits() {
    let dir = TestDir::new();
    let store = Store::open_with_config(dir.store_path(), small_pages()).unwrap();
    const KEYS: u64 = 64;

    let put_generation = |generation: u64| {
        store
            .update(|txn| {
                for i in 0..KEYS {
                    txn.insert(format!("key{i:03}").as_bytes(), &generation.to_le_bytes())?;
                }
                Ok(())
            })
            .unwrap();
    };
    put_generation(0);

    let done = AtomicBool::new(false);
    let snapshots_checked = AtomicU64::new(0);
    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                loop {
                    let finished = done.load(Ordering::Acquire);
                    let values = store
                        .view(|txn| {
                            txn.iter()?
                                .map(|entry| entry.map(|(_, v)| v))
                                .collect::<Result<Vec<_>, _>>()
                        })
                        .unwrap();
                    assert_eq!(values.len() as u64, KEYS);
                    assert!(values.windows(2).all(|w| w[0] == w[1]), "torn snapshot");
                    snapshots_checked.fetch_add(1, Ordering::Relaxed);
                    if finished {
                        break;
                    }
                }
            });
        }

        for generation in 1..=50 {
            put_generation(generation);
        }
        done.store(true, Ordering::Release);
    });

    assert!(snapshots_checked.load(Ordering::Relaxed) > 0);
    assert!(store.verify().unwrap().is_clean());
}

#[test]
fn test_concurrent_mixed_operations_on_one_key() {
    let dir = TestDir::new();
    let config = StoreConfig::builder().sync_on_commit(false).build().unwrap();
    let store = Arc::new(Store::open_with_config(dir.store_path(), config).unwrap());
    const THREADS: usize = 1000;

    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|i| {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let result = match i % 3 {
                    0 => store.put(b"shared", format!("value{i}").as_bytes()),
                    1 => store.get(b"shared").map(|v| assert!(v.starts_with(b"value"))),
                    _ => store.delete(b"shared"),
                };
                match result {
                    Ok(()) | Err(Error::KeyNotFound) => {},
                    Err(e) => panic!("unexpected error from thread {i}: {e}"),
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let scrub = store.verify().unwrap();
    assert!(scrub.is_clean(), "{:?}", scrub.errors);
    assert_eq!(store.stats().unwrap().active_readers, 0);
}

#[test]
fn test_close_is_idempotent_and_drop_after_close_is_quiet() {
    let dir = TestDir::new();
    let store = Store::open(dir.store_path()).unwrap();
    store.close().unwrap();
    store.close().unwrap();
    assert!(matches!(store.delete(b"a"), Err(Error::Closed)));
    drop(store);
}

#[test]
fn test_random_workload_stays_consistent_and_bounded() {
    let _ =
        tracing_subscriber::fmt().with_test_writer().with_env_filter("kvs_store=warn").try_init();

    let dir = TestDir::new();
    let config = StoreConfig::builder().page_size(512).sync_on_commit(false).build().unwrap();
    let store = Store::open_with_config(dir.store_path(), config).unwrap();
    let mut rng = StdRng::seed_from_u64(0x6b76_7321);
    let mut model = BTreeMap::new();
    let mut peak_live = 0usize;

    for _ in 0..40 {
        store
            .update(|txn| {
                for _ in 0..100 {
                    let key = format!("k{:04}", rng.gen_range(0..600)).into_bytes();
                    if rng.gen_bool(0.35) {
                        match txn.delete(&key) {
                            Ok(()) | Err(Error::KeyNotFound) => {},
                            Err(e) => return Err(e),
                        }
                        model.remove(&key);
                    } else {
                        let len = if rng.gen_bool(0.05) { 1_500 } else { rng.gen_range(1..80) };
                        let value: Vec<u8> = (0..len).map(|_| rng.r#gen()).collect();
                        txn.insert(&key, &value)?;
                        model.insert(key, value);
                    }
                }
                Ok(())
            })
            .unwrap();
        peak_live = peak_live.max(model.len());
    }

    let entries = store.view(|txn| txn.iter()?.collect::<Result<Vec<_>, _>>()).unwrap();
    assert_eq!(entries, model.into_iter().collect::<Vec<_>>());
    assert!(store.verify().unwrap().is_clean());

    // Each live entry needs well under four 512-byte pages even with overflow
    let stats = store.stats().unwrap();
    assert!(
        stats.total_pages < (peak_live as u64) * 4 + 64,
        "{} pages for at most {peak_live} live entries",
        stats.total_pages
    );
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_store_matches_btreemap(ops in strategies::arb_op_sequence()) {
        let dir = TestDir::new();
        let config = StoreConfig::builder().page_size(512).sync_on_commit(false).build().unwrap();
        let store = Store::open_with_config(dir.store_path(), config).unwrap();
        let mut model = BTreeMap::new();

        for op in ops {
            match op {
                KvOp::Put { key, value } => {
                    store.put(&key, &value).unwrap();
                    model.insert(key, value);
                }
                KvOp::Delete { key } => {
                    let result = store.delete(&key);
                    if model.remove(&key).is_some() {
                        prop_assert!(result.is_ok());
                    } else {
                        prop_assert!(matches!(result, Err(Error::KeyNotFound)));
                    }
                }
                KvOp::Get { key } => match model.get(&key) {
                    Some(value) => prop_assert_eq!(&store.get(&key).unwrap(), value),
                    None => prop_assert!(matches!(store.get(&key), Err(Error::KeyNotFound))),
                },
            }
        }

        let entries = store
            .view(|txn| txn.iter()?.collect::<Result<Vec<_>, _>>())
            .unwrap();
        prop_assert_eq!(entries, model.into_iter().collect::<Vec<_>>());
        prop_assert!(store.verify().unwrap().is_clean());
    }
}
