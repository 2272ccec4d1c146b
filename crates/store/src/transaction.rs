//! Snapshot tracking for copy-on-write transactions.
//!
//! - `SnapshotId`: the transaction ID of a committed state
//! - `CommittedState`: what readers pin and what commit swaps
//! - `TransactionTracker`: live readers and the single live writer
//! - `PendingFrees`: pages released by commits but possibly still read

use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::Mutex;

use crate::error::PageId;

/// Identifier of a committed database snapshot.
///
/// Write transactions draw increasing IDs; the ID of the last successful
/// commit is what new read transactions observe.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Default)]
pub struct SnapshotId(pub u64);

impl SnapshotId {
    /// Creates a new snapshot ID with the given value.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw u64 value.
    pub fn raw(&self) -> u64 {
        self.0
    }

    /// Returns the following snapshot ID.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

/// The committed state that readers snapshot.
///
/// Swapped atomically on commit.
#[derive(Clone, Debug, Default)]
pub struct CommittedState {
    /// Root page of the B-tree.
    pub root_page: PageId,
    /// Pages holding the persisted free list of this state.
    pub free_list_pages: Vec<PageId>,
    /// Page count recorded in the meta record.
    pub page_count: u64,
    /// Meta slot (0 or 1) holding this state's record.
    pub meta_slot: usize,
    /// The snapshot ID for this committed state.
    pub snapshot_id: SnapshotId,
}

/// Tracks active transactions for safe page reuse.
///
/// A page replaced by copy-on-write cannot be reused until every reader that
/// might still reach it has finished.
///
/// ```text
/// Time    Action                          live_readers
/// ----    ------                          ------------
/// T1      Commit snapshot 1               {}
/// T2      Read starts (snapshot 1)        {1: 1}
/// T3      Commit snapshot 2               {1: 1}
/// T4      Read starts (snapshot 2)        {1: 1, 2: 1}
/// T5      First read ends                 {2: 1}
/// T6      Pages released by commit 2      {2: 1}
/// ```
pub struct TransactionTracker {
    state: Mutex<TrackerState>,
    /// Next snapshot ID to hand to a writer.
    next_snapshot_id: AtomicU64,
}

struct TrackerState {
    /// Reference count of read transactions per snapshot ID.
    live_read_transactions: BTreeMap<SnapshotId, u64>,
    /// Current write transaction snapshot ID (at most one).
    live_write_transaction: Option<SnapshotId>,
}

impl TransactionTracker {
    /// Creates a new transaction tracker.
    pub fn new(initial_snapshot_id: SnapshotId) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                live_read_transactions: BTreeMap::new(),
                live_write_transaction: None,
            }),
            next_snapshot_id: AtomicU64::new(initial_snapshot_id.0),
        }
    }

    /// Registers a new read transaction.
    ///
    /// `load` runs while the tracker lock is held, so a commit can never
    /// release pages of the loaded state between the load and the
    /// registration.
    pub fn register_read_transaction<T>(
        &self,
        load: impl FnOnce() -> T,
        snapshot_of: impl FnOnce(&T) -> SnapshotId,
    ) -> T {
        let mut state = self.state.lock();
        let loaded = load();
        let snapshot_id = snapshot_of(&loaded);
        *state.live_read_transactions.entry(snapshot_id).or_insert(0) += 1;
        loaded
    }

    /// Unregisters a read transaction.
    pub fn unregister_read_transaction(&self, snapshot_id: SnapshotId) {
        let mut state = self.state.lock();
        if let Some(count) = state.live_read_transactions.get_mut(&snapshot_id) {
            *count -= 1;
            if *count == 0 {
                state.live_read_transactions.remove(&snapshot_id);
            }
        }
    }

    /// Starts a write transaction and returns its snapshot ID.
    ///
    /// Only one write transaction exists at a time; the database's write
    /// mutex enforces this.
    pub fn start_write_transaction(&self) -> SnapshotId {
        let snapshot_id = SnapshotId(self.next_snapshot_id.fetch_add(1, Ordering::SeqCst));
        let mut state = self.state.lock();
        debug_assert!(
            state.live_write_transaction.is_none(),
            "Only one write transaction allowed at a time"
        );
        state.live_write_transaction = Some(snapshot_id);
        snapshot_id
    }

    /// Ends the current write transaction.
    pub fn end_write_transaction(&self, snapshot_id: SnapshotId) {
        let mut state = self.state.lock();
        debug_assert_eq!(
            state.live_write_transaction,
            Some(snapshot_id),
            "Ending wrong write transaction"
        );
        state.live_write_transaction = None;
    }

    /// Returns the oldest snapshot ID that still has active readers.
    pub fn oldest_live_read_transaction(&self) -> Option<SnapshotId> {
        let state = self.state.lock();
        state.live_read_transactions.keys().next().copied()
    }

    /// Checks whether a write transaction is active.
    #[cfg(test)]
    pub(crate) fn has_active_writer(&self) -> bool {
        self.state.lock().live_write_transaction.is_some()
    }

    /// Returns the number of active read transactions.
    pub fn active_reader_count(&self) -> usize {
        let state = self.state.lock();
        state.live_read_transactions.values().sum::<u64>() as usize
    }
}

/// Pages released by commits and not yet reusable.
#[derive(Default)]
pub struct PendingFrees {
    /// Pages released by the commit of each snapshot.
    freed_by_snapshot: BTreeMap<SnapshotId, Vec<PageId>>,
}

impl PendingFrees {
    /// Creates a new empty pending frees tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records pages released by the commit of `snapshot_id`.
    pub fn record_freed_pages(&mut self, snapshot_id: SnapshotId, pages: Vec<PageId>) {
        if !pages.is_empty() {
            self.freed_by_snapshot.entry(snapshot_id).or_default().extend(pages);
        }
    }

    /// Removes and returns pages that no live reader can reach.
    ///
    /// Pages released by commit `c` belong to snapshot `c - 1` only, so they
    /// are reusable once the oldest reader is at `c` or later. With no
    /// readers everything is reusable.
    pub fn drain_freeable(&mut self, oldest_reader: Option<SnapshotId>) -> Vec<PageId> {
        let to_free: Vec<SnapshotId> = match oldest_reader {
            Some(cutoff) => self.freed_by_snapshot.range(..=cutoff).map(|(k, _)| *k).collect(),
            None => self.freed_by_snapshot.keys().copied().collect(),
        };

        let mut pages = Vec::new();
        for snapshot_id in to_free {
            if let Some(mut freed) = self.freed_by_snapshot.remove(&snapshot_id) {
                pages.append(&mut freed);
            }
        }
        pages
    }

    /// Returns every pending page without removing it.
    pub fn all_pending(&self) -> impl Iterator<Item = PageId> + '_ {
        self.freed_by_snapshot.values().flatten().copied()
    }

    /// Checks if there are any pending frees.
    pub fn is_empty(&self) -> bool {
        self.freed_by_snapshot.is_empty()
    }

    /// Returns the total count of pages pending free.
    pub fn pending_count(&self) -> usize {
        self.freed_by_snapshot.values().map(Vec::len).sum()
    }
}
