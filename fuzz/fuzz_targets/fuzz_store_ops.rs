//! Fuzz target for transaction sequences.
//!
//! Interprets the input as a stream of put/delete/commit/abort operations on
//! an in-memory database and checks every commit against a `BTreeMap`.

#![no_main]

use std::collections::BTreeMap;

use libfuzzer_sys::fuzz_target;

use kvs_store::{Database, Error, StoreConfig};

fuzz_target!(|data: &[u8]| {
    let config = StoreConfig::builder().page_size(512).build().expect("valid config");
    let db = Database::open_in_memory_with_config(config).expect("open in memory");
    let mut committed: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
    let mut pending = committed.clone();
    let mut txn = db.write().expect("write txn");

    let mut input = data;
    while let [op, key_len, rest @ ..] = input {
        let key_len = usize::from(*key_len % 16);
        if rest.len() < key_len {
            break;
        }
        let (key, rest) = rest.split_at(key_len);
        input = rest;

        match op % 4 {
            0 => {
                // Value length scaled so some values overflow
                let value = vec![*op; usize::from(*op) * 13 + 1];
                txn.insert(key, &value).expect("insert");
                pending.insert(key.to_vec(), value);
            },
            1 => match txn.delete(key) {
                Ok(()) => assert!(pending.remove(key).is_some()),
                Err(Error::KeyNotFound) => assert!(!pending.contains_key(key)),
                Err(e) => panic!("delete failed: {e}"),
            },
            2 => {
                txn.commit().expect("commit");
                committed = pending.clone();
                txn = db.write().expect("write txn");
            },
            _ => {
                txn.abort();
                pending = committed.clone();
                txn = db.write().expect("write txn");
            },
        }
    }
    txn.commit().expect("commit");

    let read = db.read().expect("read txn");
    let entries: Vec<_> = read.iter().expect("iter").collect::<Result<_, _>>().expect("scan");
    assert_eq!(entries, pending.into_iter().collect::<Vec<_>>());
    assert!(db.verify().expect("verify").is_clean());
});
