//! In-memory storage backend for testing.

use std::collections::HashMap;

use parking_lot::RwLock;

use super::StorageBackend;
use crate::{
    config::{DEFAULT_PAGE_SIZE, validate_page_size},
    error::{Error, PageId, Result},
};

/// In-memory storage backend for testing.
///
/// All data is stored in memory and lost when the backend is dropped.
/// This is useful for unit tests and benchmarking.
pub struct InMemoryBackend {
    /// Pages indexed by page ID.
    pages: RwLock<HashMap<PageId, Vec<u8>>>,
    /// Page size in bytes.
    page_size: usize,
    /// Simulated file size.
    file_size: RwLock<u64>,
}

impl InMemoryBackend {
    /// Creates a new in-memory backend with default page size.
    pub fn new() -> Self {
        Self::from_parts(DEFAULT_PAGE_SIZE)
    }

    /// Creates a new in-memory backend with the specified page size.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the page size is unsupported.
    pub fn with_page_size(page_size: usize) -> Result<Self> {
        validate_page_size(page_size)?;
        Ok(Self::from_parts(page_size))
    }

    fn from_parts(page_size: usize) -> Self {
        Self { pages: RwLock::new(HashMap::new()), page_size, file_size: RwLock::new(0) }
    }

    /// Returns the number of pages currently stored.
    pub fn page_count(&self) -> usize {
        self.pages.read().len()
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_page(&self, page_id: PageId) -> Result<Vec<u8>> {
        let pages = self.pages.read();
        match pages.get(&page_id) {
            Some(data) => Ok(data.clone()),
            None => Ok(vec![0u8; self.page_size]),
        }
    }

    fn write_page(&self, page_id: PageId, data: &[u8]) -> Result<()> {
        if data.len() != self.page_size {
            return Err(Error::Corrupted {
                reason: format!(
                    "Invalid page data size: {} (expected {})",
                    data.len(),
                    self.page_size
                ),
            });
        }

        self.pages.write().insert(page_id, data.to_vec());

        let required_size = self.page_offset(page_id) + self.page_size as u64;
        let mut file_size = self.file_size.write();
        if *file_size < required_size {
            *file_size = required_size;
        }

        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn file_size(&self) -> Result<u64> {
        Ok(*self.file_size.read())
    }

    fn page_size(&self) -> usize {
        self.page_size
    }
}
