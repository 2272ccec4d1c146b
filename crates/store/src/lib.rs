//! kvs-store: an embedded single-file transactional key-value store.
//!
//! Keys and values are byte strings. Keys are kept in sorted order in a
//! copy-on-write B+ tree; one writer and any number of readers share the file.
//!
//! - **Single file**: fixed-size pages, two meta pages at the front
//! - **Single writer**: writers serialize on a mutex, readers never block
//! - **Snapshot reads**: a reader sees the last commit made before it began
//! - **Checksummed pages**: XXH3-64 on every page, verified on read
//! - **Dual-slot commit**: data pages first, then the alternate meta page (no WAL)
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                 Store API                    │
//! │     (open, get, put, delete, seek, close)   │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │             Transaction Layer                │
//! │  (ReadTxn: snapshot, WriteTxn: COW+commit)  │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │              B+ Tree Layer                   │
//! │  (lookup, seek, insert, delete, overflow)   │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │              Page Layer                      │
//! │  (allocator, free list, cache, checksum)    │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │       Storage Backend + File Lock            │
//! │      (FileBackend / InMemoryBackend)        │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use kvs_store::Database;
//!
//! let db = Database::open_in_memory()?;
//!
//! let mut txn = db.write()?;
//! txn.insert(b"key", b"value")?;
//! txn.commit()?;
//!
//! let txn = db.read()?;
//! assert_eq!(txn.get(b"key")?, b"value");
//! # Ok::<(), kvs_store::Error>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
// Test code style - allow field reassignment after default
#![cfg_attr(test, allow(clippy::field_reassign_with_default))]
// Low-level page arithmetic uses explicit bounds checking for clarity
#![allow(clippy::manual_range_contains)]

pub mod backend;
pub mod btree;
pub mod config;
pub mod db;
pub mod error;
pub mod integrity;
pub mod lock;
pub mod page;
pub mod store;
pub mod transaction;

pub use backend::{FORMAT_VERSION, FileBackend, InMemoryBackend, MAGIC, MetaRecord, StorageBackend};
pub use btree::{BTree, PageProvider, PageReader};
pub use config::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, MIN_PAGE_SIZE, StoreConfig};
pub use db::{Database, DatabaseStats, ReadTransaction, SnapshotReader, WriteTransaction};
pub use error::{Error, PageId, PageType, Result};
pub use integrity::{IntegrityScrubber, ScrubError, ScrubResult};
pub use lock::FileLock;
pub use page::{PAGE_HEADER_SIZE, Page, PageAllocator, PageCache};
pub use store::Store;
pub use transaction::SnapshotId;
