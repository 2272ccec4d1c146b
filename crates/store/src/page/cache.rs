//! Page cache for committed pages.
//!
//! Committed pages never change in place, so any transaction may serve a read
//! from the cache. Uncommitted pages never enter it. Eviction uses the clock
//! algorithm (approximate LRU).

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::Mutex;

use super::Page;
use crate::error::PageId;

/// Page cache with clock eviction.
///
/// Tracks hit/miss counters for observability.
pub struct PageCache {
    state: Mutex<ClockState>,
    /// Maximum number of pages to cache.
    capacity: usize,
    /// Total cache hits since creation.
    hits: AtomicU64,
    /// Total cache misses since creation.
    misses: AtomicU64,
}

struct ClockState {
    /// Slot index of each cached page.
    index: HashMap<PageId, usize>,
    /// Ring of cache slots swept by the clock hand.
    slots: Vec<Slot>,
    /// Clock hand for eviction.
    hand: usize,
}

struct Slot {
    page: Page,
    /// Whether the page was accessed since the last sweep (second chance).
    referenced: bool,
}

impl PageCache {
    /// Creates a new cache with the given capacity (at least one page).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(ClockState {
                index: HashMap::with_capacity(capacity),
                slots: Vec::with_capacity(capacity),
                hand: 0,
            }),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns a clone of the cached page, or `None` if not present.
    pub fn get(&self, page_id: PageId) -> Option<Page> {
        let mut state = self.state.lock();
        match state.index.get(&page_id).copied() {
            Some(slot) => {
                let entry = &mut state.slots[slot];
                entry.referenced = true;
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.page.clone())
            },
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            },
        }
    }

    /// Inserts or replaces a page, evicting another if the cache is full.
    pub fn insert(&self, page: Page) {
        let mut state = self.state.lock();

        if let Some(slot) = state.index.get(&page.id).copied() {
            state.slots[slot] = Slot { page, referenced: true };
            return;
        }

        if state.slots.len() < self.capacity {
            let slot = state.slots.len();
            state.index.insert(page.id, slot);
            state.slots.push(Slot { page, referenced: true });
            return;
        }

        let victim = state.advance_hand();
        let evicted = state.slots[victim].page.id;
        state.index.remove(&evicted);
        state.index.insert(page.id, victim);
        state.slots[victim] = Slot { page, referenced: true };
    }

    /// Removes a page from the cache.
    pub fn remove(&self, page_id: PageId) -> Option<Page> {
        let mut state = self.state.lock();
        let slot = state.index.remove(&page_id)?;
        let removed = state.slots.swap_remove(slot);
        if let Some(moved) = state.slots.get(slot) {
            let moved_id = moved.page.id;
            state.index.insert(moved_id, slot);
        }
        if state.hand >= state.slots.len() {
            state.hand = 0;
        }
        Some(removed.page)
    }

    /// Clears all cached pages.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.index.clear();
        state.slots.clear();
        state.hand = 0;
    }

    /// Returns the number of cached pages.
    pub fn len(&self) -> usize {
        self.state.lock().slots.len()
    }

    /// Checks if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checks if a page is in the cache.
    pub fn contains(&self, page_id: PageId) -> bool {
        self.state.lock().index.contains_key(&page_id)
    }

    /// Returns cache statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.len(),
            capacity: self.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

impl ClockState {
    /// Sweeps until a slot without a second chance is found.
    fn advance_hand(&mut self) -> usize {
        loop {
            if self.hand >= self.slots.len() {
                self.hand = 0;
            }
            let slot = self.hand;
            self.hand += 1;
            let entry = &mut self.slots[slot];
            if entry.referenced {
                entry.referenced = false;
            } else {
                return slot;
            }
        }
    }
}

/// Cache statistics.
#[derive(Debug, Clone)]
pub struct CacheStats {
    /// Current number of cached pages.
    pub size: usize,
    /// Maximum capacity.
    pub capacity: usize,
    /// Total cache hits since creation.
    pub hits: u64,
    /// Total cache misses since creation.
    pub misses: u64,
}
