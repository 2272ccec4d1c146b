//! Scratch directories for tests that open store files.

#![allow(clippy::expect_used)]

use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// File name used by [`TestDir::store_path`].
pub const STORE_FILE_NAME: &str = "store.kvs";

/// A temporary directory holding one or more store files.
///
/// Removed from disk on drop, so every store opened inside it must be closed
/// (or dropped) first.
///
/// ```
/// use kvs_test_utils::TestDir;
///
/// let dir = TestDir::new();
/// assert!(dir.store_path().ends_with("store.kvs"));
/// assert_eq!(dir.file_len("store.kvs"), None);
/// ```
pub struct TestDir {
    inner: TempDir,
}

impl TestDir {
    /// Creates a fresh directory.
    ///
    /// # Panics
    ///
    /// Panics if the directory cannot be created.
    #[must_use]
    pub fn new() -> Self {
        Self { inner: TempDir::new().expect("create scratch directory") }
    }

    /// Returns the directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.inner.path()
    }

    /// Returns `name` resolved inside the directory.
    #[must_use]
    pub fn join<P: AsRef<Path>>(&self, name: P) -> PathBuf {
        self.inner.path().join(name)
    }

    /// Returns the conventional path of the store file under test.
    #[must_use]
    pub fn store_path(&self) -> PathBuf {
        self.join(STORE_FILE_NAME)
    }

    /// Returns the on-disk length of `name`, or `None` if it does not exist.
    #[must_use]
    pub fn file_len<P: AsRef<Path>>(&self, name: P) -> Option<u64> {
        std::fs::metadata(self.join(name)).ok().map(|meta| meta.len())
    }
}

impl Default for TestDir {
    fn default() -> Self {
        Self::new()
    }
}
