//! Crash injection utilities for testing crash recovery.
//!
//! Provides a [`CrashInjector`] that observes the writes and syncs of a commit
//! and reports when a simulated crash should happen. A test backend consults
//! the injector before each operation and fails it (dropping unsynced writes)
//! once the injector fires.
//!
//! # Crash Points
//!
//! A commit writes its data pages, syncs, writes the alternate meta page, and
//! syncs again:
//!
//! ```text
//! Write data pages → Sync → Write meta page → Sync
//!        ↑            ↑            ↑            ↑    ↑
//! DuringPageWrite  BeforeDataSync  DuringMetaWrite  BeforeMetaSync  AfterMetaSync
//! ```

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU32, Ordering},
};

/// Points in the commit sequence where a crash can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrashPoint {
    /// Crash partway through the data page writes.
    ///
    /// On-disk state: nothing from this commit is durable. Recovery sees the
    /// previous commit.
    DuringPageWrite,

    /// Crash on the sync that follows the data page writes.
    ///
    /// On-disk state: data pages were written but never synced.
    BeforeDataSync,

    /// Crash while the meta page is being written.
    ///
    /// On-disk state: data pages are durable, the alternate meta page is torn.
    /// Recovery falls back to the other meta page.
    DuringMetaWrite,

    /// Crash on the sync that follows the meta page write.
    ///
    /// On-disk state: data pages are durable, the meta page write was lost.
    BeforeMetaSync,

    /// Crash right after the commit's final sync.
    ///
    /// On-disk state: fully committed. Recovery sees the new commit.
    AfterMetaSync,
}

/// Tracks crash injection state for deterministic crash simulation.
///
/// # Thread Safety
///
/// All state is atomic, making `CrashInjector` safe to share across threads.
#[derive(Debug)]
pub struct CrashInjector {
    /// The crash point to trigger.
    crash_point: CrashPoint,
    /// Number of sync calls observed.
    sync_count: AtomicU32,
    /// Number of meta page writes observed.
    meta_write_count: AtomicU32,
    /// Number of data page writes observed.
    page_write_count: AtomicU32,
    /// Whether the crash has been triggered.
    crashed: AtomicBool,
    /// Whether injection is armed (enabled).
    armed: AtomicBool,
}

impl CrashInjector {
    /// Creates a new crash injector targeting the specified crash point.
    pub fn new(crash_point: CrashPoint) -> Arc<Self> {
        Arc::new(Self {
            crash_point,
            sync_count: AtomicU32::new(0),
            meta_write_count: AtomicU32::new(0),
            page_write_count: AtomicU32::new(0),
            crashed: AtomicBool::new(false),
            armed: AtomicBool::new(false),
        })
    }

    /// Arms the injector so it will trigger on the next matching operation.
    ///
    /// The injector starts disarmed so a test can create the store and write
    /// its initial data without interference.
    pub fn arm(&self) {
        self.sync_count.store(0, Ordering::SeqCst);
        self.meta_write_count.store(0, Ordering::SeqCst);
        self.page_write_count.store(0, Ordering::SeqCst);
        self.crashed.store(false, Ordering::SeqCst);
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Disarms the injector.
    pub fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
    }

    /// Checks if the crash has been triggered.
    pub fn has_crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }

    fn is_live(&self) -> bool {
        self.armed.load(Ordering::SeqCst) && !self.crashed.load(Ordering::SeqCst)
    }

    /// Records a sync operation.
    ///
    /// Returns `true` if this sync should fail. [`CrashPoint::AfterMetaSync`]
    /// lets the second sync succeed and marks the crash afterwards.
    pub fn on_sync(&self) -> bool {
        if !self.is_live() {
            return false;
        }

        let count = self.sync_count.fetch_add(1, Ordering::SeqCst);

        let (fail, crash) = match self.crash_point {
            CrashPoint::BeforeDataSync => (count == 0, count == 0),
            CrashPoint::BeforeMetaSync => (count == 1, count == 1),
            CrashPoint::AfterMetaSync => (false, count == 1),
            CrashPoint::DuringPageWrite | CrashPoint::DuringMetaWrite => (false, false),
        };

        if crash {
            self.crashed.store(true, Ordering::SeqCst);
        }

        fail
    }

    /// Records a meta page write.
    ///
    /// Returns `true` if the write should be torn.
    pub fn on_meta_write(&self) -> bool {
        if !self.is_live() {
            return false;
        }

        self.meta_write_count.fetch_add(1, Ordering::SeqCst);

        let should_crash = self.crash_point == CrashPoint::DuringMetaWrite;
        if should_crash {
            self.crashed.store(true, Ordering::SeqCst);
        }

        should_crash
    }

    /// Records a data page write.
    ///
    /// Returns `true` once `page_threshold` writes have gone through and the
    /// injector targets [`CrashPoint::DuringPageWrite`].
    pub fn on_page_write(&self, page_threshold: u32) -> bool {
        if !self.is_live() {
            return false;
        }

        let count = self.page_write_count.fetch_add(1, Ordering::SeqCst);

        let should_crash =
            self.crash_point == CrashPoint::DuringPageWrite && count >= page_threshold;
        if should_crash {
            self.crashed.store(true, Ordering::SeqCst);
        }

        should_crash
    }

    /// Returns the configured crash point.
    pub fn crash_point(&self) -> CrashPoint {
        self.crash_point
    }

    /// Returns the number of sync operations observed.
    pub fn sync_count(&self) -> u32 {
        self.sync_count.load(Ordering::SeqCst)
    }

    /// Returns the number of meta page writes observed.
    pub fn meta_write_count(&self) -> u32 {
        self.meta_write_count.load(Ordering::SeqCst)
    }

    /// Returns the number of data page writes observed.
    pub fn page_write_count(&self) -> u32 {
        self.page_write_count.load(Ordering::SeqCst)
    }
}
