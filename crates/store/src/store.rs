//! The `Store` facade: open, get, put, delete, close.
//!
//! Every call runs in its own transaction. [`Store::view`] and
//! [`Store::update`] group several operations into one.
//!
//! ```no_run
//! use kvs_store::{Error, Store};
//!
//! let store = Store::open("data.kvs")?;
//! store.put(b"a", b"1")?;
//! assert_eq!(store.get(b"a")?, b"1");
//! store.delete(b"a")?;
//! assert!(matches!(store.get(b"a"), Err(Error::KeyNotFound)));
//! store.close()?;
//! # Ok::<(), kvs_store::Error>(())
//! ```

use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::error;

use crate::{
    backend::FileBackend,
    config::StoreConfig,
    db::{Database, DatabaseStats, ReadTransaction, WriteTransaction},
    error::{Error, Result},
    integrity::ScrubResult,
};

/// A single-file transactional key-value store.
///
/// `Store` is `Send + Sync`; share it between threads with an `Arc`. Closing
/// takes the inner lock exclusively, so it waits for every in-flight call.
pub struct Store {
    inner: RwLock<Option<Database<FileBackend>>>,
    path: PathBuf,
}

impl Store {
    /// Opens the store at `path` with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] if another handle keeps the file locked
    /// for longer than the lock timeout, [`Error::Io`] if the file cannot be
    /// opened, or a corruption error if neither meta page is valid.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(path, StoreConfig::default())
    }

    /// Opens the store at `path` with custom configuration.
    ///
    /// # Errors
    ///
    /// See [`Store::open`].
    pub fn open_with_config(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        let db = Database::open_with_config(path.as_ref(), config)?;
        let path = db.path().to_path_buf();
        Ok(Self { inner: RwLock::new(Some(db)), path })
    }

    /// Returns the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyNotFound`] if the key is absent or [`Error::Closed`]
    /// after [`close`](Self::close).
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.view(|txn| txn.get(key))
    }

    /// Checks whether `key` is present.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] after close or an error if a page read fails.
    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        self.view(|txn| txn.contains(key))
    }

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadValue`] for an empty value, [`Error::KeyTooLarge`]
    /// for an oversized key, [`Error::OutOfSpace`] if the file cannot grow, or
    /// [`Error::Io`] if the commit fails.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if value.is_empty() {
            return Err(Error::BadValue { reason: "value must not be empty".to_string() });
        }
        self.update(|txn| txn.insert(key, value))
    }

    /// Deletes `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyNotFound`] if the key is absent; the file is not
    /// touched in that case.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.update(|txn| txn.delete(key))
    }

    /// Returns the first entry with key `>= key`, or `None` past the end.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] after close or an error if a page read fails.
    pub fn seek(&self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.view(|txn| txn.seek(key))
    }

    /// Runs `f` in a read transaction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] after close, or whatever `f` returns.
    pub fn view<T>(
        &self,
        f: impl FnOnce(&ReadTransaction<'_, FileBackend>) -> Result<T>,
    ) -> Result<T> {
        let guard = self.inner.read();
        let db = guard.as_ref().ok_or(Error::Closed)?;
        let txn = db.read()?;
        f(&txn)
    }

    /// Runs `f` in a write transaction, committing if it returns `Ok` and
    /// aborting otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] after close, the error `f` returns, or the
    /// commit error.
    pub fn update<T>(
        &self,
        f: impl FnOnce(&mut WriteTransaction<'_, FileBackend>) -> Result<T>,
    ) -> Result<T> {
        let guard = self.inner.read();
        let db = guard.as_ref().ok_or(Error::Closed)?;
        let mut txn = db.write()?;
        match f(&mut txn) {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            },
            Err(e) => {
                txn.abort();
                Err(e)
            },
        }
    }

    /// Returns database statistics.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] after close.
    pub fn stats(&self) -> Result<DatabaseStats> {
        let guard = self.inner.read();
        Ok(guard.as_ref().ok_or(Error::Closed)?.stats())
    }

    /// Scans the current snapshot for structural damage.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] after close.
    pub fn verify(&self) -> Result<ScrubResult> {
        let guard = self.inner.read();
        guard.as_ref().ok_or(Error::Closed)?.verify()
    }

    /// Returns the path of the store file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Checks whether the store has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.read().is_none()
    }

    /// Closes the store.
    ///
    /// Waits for every in-flight call, syncs, and releases the file lock.
    /// Closing a closed store does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the final sync fails. The lock is released
    /// either way.
    pub fn close(&self) -> Result<()> {
        let db = self.inner.write().take();
        match db {
            Some(db) => db.close(),
            None => Ok(()),
        }
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(path = %self.path.display(), error = %e, "Failed to close store on drop");
        }
    }
}
