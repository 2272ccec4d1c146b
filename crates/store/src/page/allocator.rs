//! Free-list page allocator.
//!
//! All pages are the same size and there is a single writer, so a sorted
//! free list is enough. The list is rebuilt from a reachability scan when
//! the persisted copy cannot be trusted.

use std::collections::BTreeSet;

use crate::error::{Error, PageId, Result};

/// Free-list based page allocator.
///
/// Pages are allocated from the free list. When no suitable free page
/// exists, new pages are allocated by extending the file. The allocator is
/// not synchronized; the database guards it with a mutex.
#[derive(Debug)]
pub struct PageAllocator {
    /// Free pages available for reuse, kept sorted to find contiguous runs.
    free_pages: BTreeSet<PageId>,
    /// Next page ID to allocate if the free list cannot serve a request.
    next_page: PageId,
    /// Hard limit on `next_page`.
    max_pages: Option<u64>,
}

impl PageAllocator {
    /// Creates a new allocator.
    pub fn new(initial_next_page: PageId, max_pages: Option<u64>) -> Self {
        Self { free_pages: BTreeSet::new(), next_page: initial_next_page, max_pages }
    }

    /// Allocates a single page, preferring the lowest free page.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfSpace`] if the file would exceed its page limit.
    pub fn allocate(&mut self) -> Result<PageId> {
        if let Some(page_id) = self.free_pages.pop_first() {
            return Ok(page_id);
        }
        self.grow(1)
    }

    /// Allocates `count` contiguous pages and returns the first ID.
    ///
    /// Reuses a run of free pages when one exists; otherwise extends the file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfSpace`] if the file would exceed its page limit.
    pub fn allocate_run(&mut self, count: usize) -> Result<PageId> {
        if count == 0 {
            return Err(Error::Corrupted { reason: "Cannot allocate an empty page run".into() });
        }
        if count == 1 {
            return self.allocate();
        }

        if let Some(start) = self.find_free_run(count) {
            for page_id in start..start + count as u64 {
                self.free_pages.remove(&page_id);
            }
            return Ok(start);
        }
        self.grow(count as u64)
    }

    fn find_free_run(&self, count: usize) -> Option<PageId> {
        let mut run_start = None;
        let mut run_len = 0usize;
        let mut prev: Option<PageId> = None;

        for &page_id in &self.free_pages {
            match prev {
                Some(p) if p + 1 == page_id => run_len += 1,
                _ => {
                    run_start = Some(page_id);
                    run_len = 1;
                },
            }
            if run_len == count {
                return run_start;
            }
            prev = Some(page_id);
        }
        None
    }

    fn grow(&mut self, count: u64) -> Result<PageId> {
        let start = self.next_page;
        let end = start.checked_add(count).ok_or(Error::OutOfSpace)?;
        if let Some(max) = self.max_pages
            && end > max
        {
            return Err(Error::OutOfSpace);
        }
        self.next_page = end;
        Ok(start)
    }

    /// Frees a page for later reuse.
    pub fn free(&mut self, page_id: PageId) {
        self.free_pages.insert(page_id);
    }

    /// Frees multiple pages at once.
    pub fn free_batch(&mut self, page_ids: impl IntoIterator<Item = PageId>) {
        self.free_pages.extend(page_ids);
    }

    /// Returns the next page ID that would be allocated by growth.
    pub fn next_page_id(&self) -> PageId {
        self.next_page
    }

    /// Returns the number of free pages in the free list.
    pub fn free_page_count(&self) -> usize {
        self.free_pages.len()
    }

    /// Returns true if `page_id` is on the free list.
    #[cfg(test)]
    pub(crate) fn is_free(&self, page_id: PageId) -> bool {
        self.free_pages.contains(&page_id)
    }

    /// Replaces the free list (used on open and during recovery).
    pub fn init_free_list(&mut self, free_pages: impl IntoIterator<Item = PageId>) {
        self.free_pages = free_pages.into_iter().collect();
    }

    /// Returns a sorted copy of the current free list.
    pub fn free_list(&self) -> Vec<PageId> {
        self.free_pages.iter().copied().collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_new_pages() {
        let mut allocator = PageAllocator::new(3, None);

        assert_eq!(allocator.allocate().unwrap(), 3);
        assert_eq!(allocator.allocate().unwrap(), 4);
        assert_eq!(allocator.allocate().unwrap(), 5);
        assert_eq!(allocator.next_page_id(), 6);
    }

    #[test]
    fn test_free_and_reuse() {
        let mut allocator = PageAllocator::new(3, None);

        let _p0 = allocator.allocate().unwrap();
        let p1 = allocator.allocate().unwrap();
        let _p2 = allocator.allocate().unwrap();

        allocator.free(p1);

        assert_eq!(allocator.allocate().unwrap(), p1);
        assert_eq!(allocator.allocate().unwrap(), 6);
    }

    #[test]
    fn test_run_prefers_contiguous_free_pages() {
        let mut allocator = PageAllocator::new(20, None);
        allocator.free_batch([4, 6, 7, 8, 12]);

        assert_eq!(allocator.allocate_run(3).unwrap(), 6);
        assert_eq!(allocator.free_list(), vec![4, 12]);

        // No run of two left; the file grows instead.
        assert_eq!(allocator.allocate_run(2).unwrap(), 20);
        assert_eq!(allocator.next_page_id(), 22);
    }

    #[test]
    fn test_max_pages_is_out_of_space() {
        let mut allocator = PageAllocator::new(3, Some(5));
        allocator.allocate().unwrap();
        allocator.allocate().unwrap();
        assert!(matches!(allocator.allocate(), Err(Error::OutOfSpace)));
        assert!(matches!(allocator.allocate_run(2), Err(Error::OutOfSpace)));

        // Freed pages still satisfy requests at the limit.
        allocator.free(4);
        assert_eq!(allocator.allocate().unwrap(), 4);
    }

    #[test]
    fn test_init_free_list_replaces_contents() {
        let mut allocator = PageAllocator::new(10, None);
        allocator.free(3);
        allocator.init_free_list([9, 5]);
        assert!(!allocator.is_free(3));
        assert_eq!(allocator.free_list(), vec![5, 9]);
        assert_eq!(allocator.free_page_count(), 2);
    }
}
