//! Database handle and transactions.
//!
//! A [`Database`] owns one storage backend and the single B+ tree stored in
//! it. Reads run in [`ReadTransaction`]s that pin a committed snapshot; writes
//! run in a [`WriteTransaction`] that holds the writer mutex and builds a
//! private copy-on-write working set.
//!
//! # Example
//!
//! ```no_run
//! use kvs_store::Database;
//!
//! let db = Database::open("data.kvs")?;
//!
//! let mut txn = db.write()?;
//! txn.insert(b"a", b"1")?;
//! txn.commit()?;
//!
//! let txn = db.read()?;
//! assert_eq!(txn.get(b"a")?, b"1");
//! # Ok::<(), kvs_store::Error>(())
//! ```

use std::{
    collections::{HashMap, HashSet},
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{
    backend::{
        FileBackend, InMemoryBackend, META_PAGE_COUNT, MetaRecord, StorageBackend, choose_meta,
    },
    btree::{BTree, PageProvider, PageReader, cursor::BTreeIterator, node::LeafNode},
    config::StoreConfig,
    error::{Error, PageId, PageType, Result},
    integrity::{IntegrityScrubber, ScrubResult},
    page::{Page, PageAllocator, PageCache, freelist},
    transaction::{CommittedState, PendingFrees, SnapshotId, TransactionTracker},
};

/// Root leaf written when a store file is bootstrapped.
const BOOTSTRAP_ROOT: PageId = META_PAGE_COUNT;

/// Where the allocator's free pages come from at open.
enum FreeListSource {
    /// Free page IDs read from the persisted chain.
    Persisted(Vec<PageId>),
    /// The persisted list cannot be trusted; scan the tree instead.
    Rebuild,
}

/// The main database handle.
///
/// Generic over [`StorageBackend`]: use [`Database<FileBackend>`] for files
/// and [`Database<InMemoryBackend>`] for tests.
///
/// # Transaction Isolation (Copy-on-Write)
///
/// - Read transactions capture the committed state at start and hold no lock
/// - The write transaction copies every page it modifies to a new page ID
/// - Commit writes the copies, then a meta record, then swaps the state
/// - Replaced pages return to the allocator once no reader can reach them
pub struct Database<B: StorageBackend> {
    /// Storage backend (file or memory).
    backend: B,
    /// Committed page images shared by all transactions.
    cache: PageCache,
    /// Page allocator for new pages.
    allocator: Mutex<PageAllocator>,
    /// Current committed state, swapped on commit.
    committed_state: ArcSwap<CommittedState>,
    /// Live readers and the live writer.
    tracker: TransactionTracker,
    /// Pages released by commits that a reader may still reach.
    pending_frees: Mutex<PendingFrees>,
    /// Configuration, with `page_size` taken from the backend.
    config: StoreConfig,
    /// Held by the one live write transaction.
    write_lock: std::sync::Mutex<()>,
    /// Node splits since open.
    page_splits: AtomicU64,
    /// Sibling merges since open.
    page_merges: AtomicU64,
    /// Successful commits since open.
    commits: AtomicU64,
}

impl Database<FileBackend> {
    /// Opens the store file at `path`, creating it if absent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] if another handle holds the file lock,
    /// [`Error::Io`] if the file cannot be opened, or a corruption error if
    /// neither meta page is valid.
    ///
    /// ```no_run
    /// use kvs_store::Database;
    ///
    /// let db = Database::open("/var/lib/kvs/state.kvs")?;
    /// let txn = db.read()?;
    /// # Ok::<(), kvs_store::Error>(())
    /// ```
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_config(path, StoreConfig::default())
    }

    /// Opens the store file at `path` with custom configuration.
    ///
    /// # Errors
    ///
    /// See [`Database::open`]. Also returns [`Error::InvalidConfig`] for an
    /// invalid configuration.
    pub fn open_with_config<P: AsRef<Path>>(path: P, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let backend = FileBackend::open(path, &config)?;
        Self::with_backend(backend, config)
    }

    /// Returns the path of the store file.
    pub fn path(&self) -> &Path {
        self.backend.path()
    }
}

impl Database<InMemoryBackend> {
    /// Creates a new in-memory database. Data is lost on drop.
    ///
    /// # Errors
    ///
    /// Returns an error if bootstrapping fails.
    pub fn open_in_memory() -> Result<Self> {
        Self::open_in_memory_with_config(StoreConfig::default())
    }

    /// Creates a new in-memory database with custom configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for an invalid configuration.
    pub fn open_in_memory_with_config(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let backend = InMemoryBackend::with_page_size(config.page_size)?;
        Self::with_backend(backend, config)
    }
}

impl<B: StorageBackend> Database<B> {
    /// Opens a database over an existing backend.
    ///
    /// An empty backend is bootstrapped with two meta pages and an empty root
    /// leaf. Otherwise the newest valid meta record is loaded; if either slot
    /// is invalid or the persisted free list is unreadable, the free list is
    /// rebuilt from the pages reachable from the root.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] on backend failure, or [`Error::InvalidMagic`],
    /// [`Error::Corrupted`] or [`Error::UnsupportedVersion`] if no meta record
    /// is usable.
    pub fn with_backend(backend: B, mut config: StoreConfig) -> Result<Self> {
        config.page_size = backend.page_size();
        config.validate()?;

        let (state, source) = if backend.file_size()? == 0 {
            (Self::bootstrap(&backend, &config)?, FreeListSource::Persisted(Vec::new()))
        } else {
            Self::load_state(&backend, &config)?
        };

        let allocator = PageAllocator::new(state.page_count, config.max_pages);
        let tracker = TransactionTracker::new(state.snapshot_id.next());
        info!(
            page_size = config.page_size,
            txn_id = state.snapshot_id.raw(),
            root_page = state.root_page,
            page_count = state.page_count,
            "Opened database"
        );

        let db = Self {
            backend,
            cache: PageCache::new(config.cache_size),
            allocator: Mutex::new(allocator),
            committed_state: ArcSwap::from_pointee(state),
            tracker,
            pending_frees: Mutex::new(PendingFrees::new()),
            config,
            write_lock: std::sync::Mutex::new(()),
            page_splits: AtomicU64::new(0),
            page_merges: AtomicU64::new(0),
            commits: AtomicU64::new(0),
        };

        match source {
            FreeListSource::Persisted(free_pages) => {
                db.allocator.lock().init_free_list(free_pages);
            },
            FreeListSource::Rebuild => db.rebuild_free_list()?,
        }

        Ok(db)
    }

    /// Writes the empty root leaf and both meta records.
    fn bootstrap(backend: &B, config: &StoreConfig) -> Result<CommittedState> {
        let page_size = config.page_size;

        let mut root = Page::new(BOOTSTRAP_ROOT, page_size, PageType::BTreeLeaf, 0);
        LeafNode::init(&mut root);
        root.update_checksum();
        backend.write_page(root.id, &root.data)?;

        let meta = MetaRecord {
            page_size: page_size as u32,
            txn_id: 0,
            root_page: BOOTSTRAP_ROOT,
            free_list_page: 0,
            page_count: BOOTSTRAP_ROOT + 1,
            last_write_timestamp: unix_now(),
        };
        for slot in 0..META_PAGE_COUNT {
            backend.write_page(slot, &meta.to_page(slot).data)?;
        }
        backend.sync()?;
        info!(page_size, "Bootstrapped empty store");

        Ok(CommittedState {
            root_page: BOOTSTRAP_ROOT,
            free_list_pages: Vec::new(),
            page_count: meta.page_count,
            meta_slot: 0,
            snapshot_id: SnapshotId::new(0),
        })
    }

    /// Loads the current meta record and its free list.
    ///
    /// Falling back to the older slot means the newer commit tore; its free
    /// list is discarded and rebuilt from the tree.
    fn load_state(backend: &B, config: &StoreConfig) -> Result<(CommittedState, FreeListSource)> {
        let raw = [backend.read_page(0)?, backend.read_page(1)?];
        if raw.iter().all(|data| data.iter().all(|&b| b == 0)) {
            warn!("Meta pages were never written, bootstrapping");
            let state = Self::bootstrap(backend, config)?;
            return Ok((state, FreeListSource::Persisted(Vec::new())));
        }

        let slots = [MetaRecord::from_page(&raw[0]), MetaRecord::from_page(&raw[1])];
        let torn_slot = slots.iter().position(Result::is_err);
        let (meta_slot, meta) = choose_meta(slots)?;

        if meta.page_size as usize != config.page_size {
            return Err(Error::Corrupted {
                reason: format!(
                    "Meta record page size {} does not match file page size {}",
                    meta.page_size, config.page_size
                ),
            });
        }
        if meta.root_page < META_PAGE_COUNT || meta.root_page >= meta.page_count {
            return Err(Error::Corrupted {
                reason: format!(
                    "Root page {} outside of {} pages",
                    meta.root_page, meta.page_count
                ),
            });
        }

        let mut state = CommittedState {
            root_page: meta.root_page,
            free_list_pages: Vec::new(),
            page_count: meta.page_count,
            meta_slot,
            snapshot_id: SnapshotId::new(meta.txn_id),
        };

        if let Some(torn) = torn_slot {
            warn!(
                torn_slot = torn,
                meta_slot,
                txn_id = meta.txn_id,
                "Meta slot is invalid, recovering from the other slot"
            );
            return Ok((state, FreeListSource::Rebuild));
        }

        if meta.free_list_page == 0 {
            return Ok((state, FreeListSource::Persisted(Vec::new())));
        }

        match Self::load_free_list(backend, meta.free_list_page, meta.page_count) {
            Ok((free_pages, chain)) => {
                state.free_list_pages = chain;
                Ok((state, FreeListSource::Persisted(free_pages)))
            },
            Err(e) => {
                warn!(error = %e, head = meta.free_list_page, "Free list is unreadable");
                Ok((state, FreeListSource::Rebuild))
            },
        }
    }

    /// Reads the free-list chain starting at `head`.
    ///
    /// Returns the free page IDs and the IDs of the chain pages themselves.
    fn load_free_list(
        backend: &B,
        head: PageId,
        page_count: u64,
    ) -> Result<(Vec<PageId>, Vec<PageId>)> {
        let mut free_pages = Vec::new();
        let mut chain = Vec::new();
        let mut page_id = head;

        while page_id != 0 {
            let out_of_range = page_id < META_PAGE_COUNT || page_id >= page_count;
            if out_of_range || chain.len() as u64 >= page_count {
                return Err(Error::Corrupted {
                    reason: format!("Free-list chain reaches invalid page {page_id}"),
                });
            }
            let page = read_verified(backend, page_id)?;
            let (ids, next) = freelist::decode_page(&page)?;
            if let Some(&bad) = ids.iter().find(|&&id| id < META_PAGE_COUNT || id >= page_count) {
                return Err(Error::Corrupted {
                    reason: format!("Free-list page {page_id} lists invalid page {bad}"),
                });
            }
            free_pages.extend(ids);
            chain.push(page_id);
            page_id = next;
        }

        Ok((free_pages, chain))
    }

    /// Rebuilds the free list as every page not reachable from the root.
    fn rebuild_free_list(&self) -> Result<()> {
        let state = self.committed_state.load_full();
        let tree = BTree::new(state.root_page, SnapshotReader { db: self });
        let reachable: HashSet<PageId> = tree.reachable_pages()?.into_iter().collect();

        let free_pages: Vec<PageId> =
            (META_PAGE_COUNT..state.page_count).filter(|id| !reachable.contains(id)).collect();
        warn!(
            reachable = reachable.len(),
            free_pages = free_pages.len(),
            "Rebuilt free list from reachable pages"
        );
        self.allocator.lock().init_free_list(free_pages);
        Ok(())
    }

    /// Begins a read transaction.
    ///
    /// Never blocks on the writer: the committed state is loaded and its
    /// snapshot registered under one short critical section.
    ///
    /// # Errors
    ///
    /// Currently infallible; returns `Result` for API symmetry with
    /// [`Database::write`].
    pub fn read(&self) -> Result<ReadTransaction<'_, B>> {
        let snapshot = self
            .tracker
            .register_read_transaction(|| self.committed_state.load_full(), |s| s.snapshot_id);
        let tree = BTree::new(snapshot.root_page, SnapshotReader { db: self });
        Ok(ReadTransaction { db: self, snapshot, tree })
    }

    /// Begins a write transaction, blocking until no other writer is active.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Poisoned`] if a previous writer panicked.
    pub fn write(&self) -> Result<WriteTransaction<'_, B>> {
        let write_guard = self.write_lock.lock().map_err(|_| Error::Poisoned)?;
        let snapshot_id = self.tracker.start_write_transaction();
        let base = self.committed_state.load_full();

        Ok(WriteTransaction {
            db: self,
            snapshot_id,
            root_page: base.root_page,
            base,
            working: WorkingSet::default(),
            failed: false,
            finished: false,
            _write_guard: write_guard,
        })
    }

    /// Returns database statistics.
    pub fn stats(&self) -> DatabaseStats {
        let cache_stats = self.cache.stats();
        let (total_pages, free_pages) = {
            let allocator = self.allocator.lock();
            (allocator.next_page_id(), allocator.free_page_count())
        };

        DatabaseStats {
            page_size: self.config.page_size,
            total_pages,
            free_pages,
            pending_free_pages: self.pending_frees.lock().pending_count(),
            cached_pages: cache_stats.size,
            cache_hits: cache_stats.hits,
            cache_misses: cache_stats.misses,
            page_splits: self.page_splits.load(Ordering::Relaxed),
            page_merges: self.page_merges.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            active_readers: self.tracker.active_reader_count(),
            last_txn_id: self.committed_state.load().snapshot_id.raw(),
        }
    }

    /// Scans the current snapshot for structural damage.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be pinned.
    pub fn verify(&self) -> Result<ScrubResult> {
        let txn = self.read()?;
        Ok(IntegrityScrubber::new(self).scrub(&txn))
    }

    /// Returns the effective configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Syncs the backend and releases it, including its file lock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the final sync fails. The backend is released
    /// either way.
    pub fn close(self) -> Result<()> {
        let result = self.backend.sync();
        match &result {
            Ok(()) => {
                info!(txn_id = self.committed_state.load().snapshot_id.raw(), "Closed database");
            },
            Err(e) => warn!(error = %e, "Final sync failed while closing database"),
        }
        result
    }

    /// Reads a committed page through the cache, verifying its checksum.
    fn read_page(&self, page_id: PageId) -> Result<Page> {
        if let Some(page) = self.cache.get(page_id) {
            return Ok(page);
        }
        let page = read_verified(&self.backend, page_id)?;
        self.cache.insert(page.clone());
        Ok(page)
    }

    /// Reads a page straight from the backend without checksum verification.
    pub(crate) fn read_raw_page(&self, page_id: PageId) -> Result<Page> {
        let data = self.backend.read_page(page_id)?;
        if data.iter().all(|&b| b == 0) {
            return Err(Error::PageNotFound { page_id });
        }
        Ok(Page::from_bytes(page_id, data))
    }

    #[cfg(test)]
    pub(crate) fn backend_for_test(&self) -> &B {
        &self.backend
    }

    /// Returns pages that no live snapshot can reach.
    pub(crate) fn free_page_ids(&self) -> Vec<PageId> {
        self.allocator.lock().free_list()
    }

    /// Returns the allocator's high-water mark.
    pub(crate) fn total_page_count(&self) -> PageId {
        self.allocator.lock().next_page_id()
    }

    /// Moves pending pages that no live reader can reach to the allocator.
    ///
    /// The pending lock is held while the oldest reader is computed so that a
    /// commit cannot record pages between the two.
    fn try_free_pending_pages(&self) {
        let mut pending = self.pending_frees.lock();
        let oldest_reader = self.tracker.oldest_live_read_transaction();
        let pages = pending.drain_freeable(oldest_reader);
        if pages.is_empty() {
            return;
        }
        for &page_id in &pages {
            self.cache.remove(page_id);
        }
        self.allocator.lock().free_batch(pages);
    }

    fn sync_if_enabled(&self) -> Result<()> {
        if self.config.sync_on_commit {
            self.backend.sync()?;
        }
        Ok(())
    }

    /// Allocates the free-list chain for a commit and collects its contents.
    ///
    /// The new state's free pages are the allocator's free pages, every
    /// pending page, the pages this transaction released, and the previous
    /// free-list chain. Chain pages are taken from the allocator until the
    /// chain can hold what remains.
    fn reserve_free_list(
        &self,
        base: &CommittedState,
        working: &mut WorkingSet,
    ) -> Result<(Vec<PageId>, Vec<PageId>)> {
        let page_size = self.config.page_size;
        let pending = self.pending_frees.lock();
        let mut allocator = self.allocator.lock();

        let mut released: Vec<PageId> = pending
            .all_pending()
            .chain(working.freed.iter().copied())
            .chain(base.free_list_pages.iter().copied())
            .collect();

        let mut chain = Vec::new();
        loop {
            let needed =
                freelist::pages_needed(allocator.free_page_count() + released.len(), page_size);
            if chain.len() >= needed {
                break;
            }
            let page_id = allocator.allocate()?;
            working.allocated.insert(page_id);
            chain.push(page_id);
        }

        let mut free_pages = allocator.free_list();
        free_pages.append(&mut released);
        free_pages.sort_unstable();
        Ok((chain, free_pages))
    }

    /// Makes a write transaction's working set durable and current.
    fn commit_working_set(
        &self,
        snapshot_id: SnapshotId,
        root_page: PageId,
        base: &CommittedState,
        working: &mut WorkingSet,
    ) -> Result<()> {
        let txn_id = snapshot_id.raw();
        if working.dirty.is_empty() && working.freed.is_empty() {
            debug!(txn_id, "Write transaction made no changes");
            return Ok(());
        }

        let (chain, free_pages) = self.reserve_free_list(base, working)?;
        let chain_pages = freelist::build_chain(&chain, &free_pages, self.config.page_size, txn_id);

        for page in &chain_pages {
            self.backend.write_page(page.id, &page.data)?;
        }
        for page in working.dirty.values_mut() {
            page.update_checksum();
            self.backend.write_page(page.id, &page.data)?;
        }
        self.sync_if_enabled()?;

        let page_count = self.allocator.lock().next_page_id();
        let meta_slot = 1 - base.meta_slot;
        let meta = MetaRecord {
            page_size: self.config.page_size as u32,
            txn_id,
            root_page,
            free_list_page: chain.first().copied().unwrap_or(0),
            page_count,
            last_write_timestamp: unix_now(),
        };
        working.meta_written = true;
        let slot_page = meta_slot as PageId;
        self.backend.write_page(slot_page, &meta.to_page(slot_page).data)?;
        self.sync_if_enabled()?;

        self.committed_state.store(Arc::new(CommittedState {
            root_page,
            free_list_pages: chain,
            page_count,
            meta_slot,
            snapshot_id,
        }));

        let dirty_pages = working.dirty.len();
        for (_, page) in working.dirty.drain() {
            self.cache.insert(page);
        }
        working.allocated.clear();

        let mut released = std::mem::take(&mut working.freed);
        let freed_pages = released.len();
        released.extend(base.free_list_pages.iter().copied());
        self.pending_frees.lock().record_freed_pages(snapshot_id, released);
        self.try_free_pending_pages();
        self.commits.fetch_add(1, Ordering::Relaxed);

        debug!(
            txn_id,
            dirty_pages,
            freed_pages,
            meta_slot,
            root_page,
            "Committed write transaction"
        );
        Ok(())
    }
}

/// Reads a page from the backend and checks that it was written and intact.
fn read_verified<B: StorageBackend>(backend: &B, page_id: PageId) -> Result<Page> {
    let data = backend.read_page(page_id)?;
    if data.iter().all(|&b| b == 0) {
        return Err(Error::PageNotFound { page_id });
    }
    let page = Page::from_bytes(page_id, data);
    if !page.verify_checksum() {
        return Err(Error::CorruptPage { page_id });
    }
    Ok(page)
}

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Database statistics.
#[derive(Debug, Clone)]
pub struct DatabaseStats {
    /// Page size in bytes.
    pub page_size: usize,
    /// Pages in the file, free ones included.
    pub total_pages: PageId,
    /// Free pages available for reuse.
    pub free_pages: usize,
    /// Released pages still reachable by a live reader.
    pub pending_free_pages: usize,
    /// Pages currently in cache.
    pub cached_pages: usize,
    /// Page cache hits since open.
    pub cache_hits: u64,
    /// Page cache misses since open.
    pub cache_misses: u64,
    /// B-tree node splits since open.
    pub page_splits: u64,
    /// B-tree sibling merges since open.
    pub page_merges: u64,
    /// Successful commits since open.
    pub commits: u64,
    /// Live read transactions.
    pub active_readers: usize,
    /// Transaction ID of the current committed state.
    pub last_txn_id: u64,
}

/// A read-only transaction over one committed snapshot.
///
/// Holds no lock. Pages reachable from the snapshot are not reused until the
/// transaction is dropped.
pub struct ReadTransaction<'db, B: StorageBackend> {
    db: &'db Database<B>,
    snapshot: Arc<CommittedState>,
    tree: BTree<SnapshotReader<'db, B>>,
}

impl<'db, B: StorageBackend> ReadTransaction<'db, B> {
    /// Returns the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyNotFound`] if the key is absent, or
    /// [`Error::CorruptPage`] if a page on the path fails its checksum.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.tree.get(key)?.ok_or(Error::KeyNotFound)
    }

    /// Checks whether `key` is present.
    ///
    /// # Errors
    ///
    /// Returns an error if a page read fails.
    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        Ok(self.tree.get(key)?.is_some())
    }

    /// Returns the first entry with key `>= key`, or `None` past the end.
    ///
    /// # Errors
    ///
    /// Returns an error if a page read fails.
    pub fn seek(&self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.tree.seek(key)
    }

    /// Iterates over every entry in ascending key order.
    ///
    /// # Errors
    ///
    /// Returns an error if positioning on the first entry fails.
    pub fn iter(&self) -> Result<BTreeIterator<'_, SnapshotReader<'db, B>>> {
        self.tree.iter()
    }

    /// Returns the depth of the tree (1 = root is a leaf).
    ///
    /// # Errors
    ///
    /// Returns an error if a page read fails.
    pub fn depth(&self) -> Result<u32> {
        self.tree.depth()
    }

    /// Returns the snapshot this transaction reads.
    pub fn snapshot_id(&self) -> SnapshotId {
        self.snapshot.snapshot_id
    }

    /// Returns the root page of the snapshot.
    pub fn root_page(&self) -> PageId {
        self.snapshot.root_page
    }

    /// Returns the pages holding the snapshot's persisted free list.
    pub(crate) fn free_list_pages(&self) -> &[PageId] {
        &self.snapshot.free_list_pages
    }
}

impl<B: StorageBackend> Drop for ReadTransaction<'_, B> {
    fn drop(&mut self) {
        self.db.tracker.unregister_read_transaction(self.snapshot.snapshot_id);
        self.db.try_free_pending_pages();
    }
}

/// Pages and allocations private to one write transaction.
#[derive(Default)]
struct WorkingSet {
    /// Pages written by this transaction, not yet visible to readers.
    dirty: HashMap<PageId, Page>,
    /// Pages taken from the allocator by this transaction.
    allocated: HashSet<PageId>,
    /// Committed pages this transaction replaced or removed.
    freed: Vec<PageId>,
    /// Set once the commit has started writing its meta record.
    meta_written: bool,
}

/// The single write transaction.
///
/// Changes are buffered until [`commit`](Self::commit). Dropping the
/// transaction without committing aborts it.
///
/// # Invariants
///
/// **Lock ordering:** `write_lock` is taken first and held for the whole
/// transaction. `pending_frees` is taken before `allocator` and before the
/// tracker's internal lock; no path takes them in the other order.
///
/// **Dirty page lifecycle:**
/// 1. Tree operations write copy-on-write pages into the working set and
///    record the committed pages they replace.
/// 2. Commit writes the free list and dirty pages, syncs, writes the meta
///    record into the alternate slot, and syncs again.
/// 3. The committed state is swapped and dirty pages enter the shared cache.
/// 4. Replaced pages become pending frees, reusable once no reader of an
///    older snapshot remains.
///
/// **Failure:** if commit fails before its meta record is written, every
/// page the transaction allocated returns to the allocator. After that point
/// the allocations are kept out of circulation until the next open, since
/// the alternate meta slot may already reference them.
pub struct WriteTransaction<'db, B: StorageBackend> {
    db: &'db Database<B>,
    snapshot_id: SnapshotId,
    /// State this transaction started from.
    base: Arc<CommittedState>,
    /// Root of the transaction's tree (may differ from `base`).
    root_page: PageId,
    working: WorkingSet,
    /// A tree operation failed part way; only abort is possible.
    failed: bool,
    finished: bool,
    _write_guard: std::sync::MutexGuard<'db, ()>,
}

impl<'db, B: StorageBackend> WriteTransaction<'db, B> {
    /// Inserts or replaces the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyTooLarge`] for an oversized key or
    /// [`Error::OutOfSpace`] if a page cannot be allocated. Any error other
    /// than `KeyTooLarge` leaves the transaction able only to abort.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.with_tree(|tree| tree.insert(key, value)).map(|_| ())
    }

    /// Deletes `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyNotFound`] if the key is absent; no page is touched
    /// in that case.
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        if self.with_tree(|tree| tree.delete(key))? { Ok(()) } else { Err(Error::KeyNotFound) }
    }

    /// Returns the value stored under `key`, including uncommitted writes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyNotFound`] if the key is absent.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.reader().get(key)?.ok_or(Error::KeyNotFound)
    }

    /// Checks whether `key` is present, including uncommitted writes.
    ///
    /// # Errors
    ///
    /// Returns an error if a page read fails.
    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        Ok(self.reader().get(key)?.is_some())
    }

    /// Returns the first entry with key `>= key`, including uncommitted writes.
    ///
    /// # Errors
    ///
    /// Returns an error if a page read fails.
    pub fn seek(&self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.reader().seek(key)
    }

    /// Returns this transaction's ID.
    pub fn snapshot_id(&self) -> SnapshotId {
        self.snapshot_id
    }

    /// Commits the transaction.
    ///
    /// On success the changes are durable (with `sync_on_commit`) and visible
    /// to every read transaction started afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransactionFailed`] if an earlier operation failed,
    /// [`Error::OutOfSpace`] if the free list cannot be stored, or
    /// [`Error::Io`] if a write or sync fails. The previous committed state
    /// stays current on error.
    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        let result = if self.failed {
            Err(Error::TransactionFailed)
        } else {
            self.db.commit_working_set(
                self.snapshot_id,
                self.root_page,
                &self.base,
                &mut self.working,
            )
        };

        if let Err(e) = &result {
            warn!(txn_id = self.snapshot_id.raw(), error = %e, "Commit failed, rolling back");
            self.release_working_set();
        }
        self.db.tracker.end_write_transaction(self.snapshot_id);
        result
    }

    /// Aborts the transaction, discarding all changes.
    pub fn abort(mut self) {
        self.finish_abort();
    }

    fn finish_abort(&mut self) {
        self.finished = true;
        debug!(
            txn_id = self.snapshot_id.raw(),
            dirty_pages = self.working.dirty.len(),
            "Aborted write transaction"
        );
        self.release_working_set();
        self.db.tracker.end_write_transaction(self.snapshot_id);
    }

    /// Drops the working set, returning its allocations to the allocator.
    fn release_working_set(&mut self) {
        self.working.dirty.clear();
        self.working.freed.clear();
        let allocated: Vec<PageId> = self.working.allocated.drain().collect();
        if self.working.meta_written {
            warn!(
                txn_id = self.snapshot_id.raw(),
                pages = allocated.len(),
                "Withholding pages of a partially written commit until reopen"
            );
            return;
        }
        self.db.allocator.lock().free_batch(allocated);
    }

    /// Runs a mutating tree operation over the working set.
    fn with_tree<T>(
        &mut self,
        op: impl FnOnce(&mut BTree<WorkingSetProvider<'_, 'db, B>>) -> Result<T>,
    ) -> Result<T> {
        if self.failed {
            return Err(Error::TransactionFailed);
        }
        let provider = WorkingSetProvider {
            db: self.db,
            txn_id: self.snapshot_id.raw(),
            working: &mut self.working,
        };
        let mut tree = BTree::new(self.root_page, provider);
        let result = op(&mut tree);

        self.db.page_splits.fetch_add(tree.split_count(), Ordering::Relaxed);
        self.db.page_merges.fetch_add(tree.merge_count(), Ordering::Relaxed);
        match &result {
            Ok(_) => self.root_page = tree.root_page(),
            Err(Error::KeyTooLarge { .. }) => {},
            Err(_) => self.failed = true,
        }
        result
    }

    fn reader(&self) -> BTree<WorkingSetReader<'_, 'db, B>> {
        BTree::new(self.root_page, WorkingSetReader { db: self.db, dirty: &self.working.dirty })
    }
}

impl<B: StorageBackend> Drop for WriteTransaction<'_, B> {
    fn drop(&mut self) {
        if !self.finished {
            self.finish_abort();
        }
    }
}

/// Page reader for committed snapshots.
pub struct SnapshotReader<'db, B: StorageBackend> {
    db: &'db Database<B>,
}

impl<B: StorageBackend> PageReader for SnapshotReader<'_, B> {
    fn read_page(&self, page_id: PageId) -> Result<Page> {
        self.db.read_page(page_id)
    }

    fn page_size(&self) -> usize {
        self.db.config.page_size
    }

    fn page_count(&self) -> PageId {
        self.db.total_page_count()
    }
}

/// Page provider for tree mutations inside a write transaction.
///
/// Pages allocated by the transaction are private: freeing one returns it to
/// the allocator at once. Freeing a committed page only records it, since a
/// reader may still reach it.
struct WorkingSetProvider<'txn, 'db, B: StorageBackend> {
    db: &'db Database<B>,
    txn_id: u64,
    working: &'txn mut WorkingSet,
}

impl<B: StorageBackend> PageReader for WorkingSetProvider<'_, '_, B> {
    fn read_page(&self, page_id: PageId) -> Result<Page> {
        if let Some(page) = self.working.dirty.get(&page_id) {
            return Ok(page.clone());
        }
        self.db.read_page(page_id)
    }

    fn page_size(&self) -> usize {
        self.db.config.page_size
    }

    fn page_count(&self) -> PageId {
        self.db.total_page_count()
    }
}

impl<B: StorageBackend> PageProvider for WorkingSetProvider<'_, '_, B> {
    fn write_page(&mut self, page: Page) {
        self.working.dirty.insert(page.id, page);
    }

    fn allocate_page(&mut self, page_type: PageType) -> Result<Page> {
        let page_id = self.db.allocator.lock().allocate()?;
        self.working.allocated.insert(page_id);
        Ok(Page::new(page_id, self.db.config.page_size, page_type, self.txn_id))
    }

    fn allocate_run(&mut self, count: usize) -> Result<PageId> {
        let first = self.db.allocator.lock().allocate_run(count)?;
        self.working.allocated.extend(first..first + count as u64);
        Ok(first)
    }

    fn free_page(&mut self, page_id: PageId) {
        if self.working.allocated.remove(&page_id) {
            self.working.dirty.remove(&page_id);
            self.db.allocator.lock().free(page_id);
        } else {
            self.working.freed.push(page_id);
        }
    }

    fn txn_id(&self) -> u64 {
        self.txn_id
    }
}

/// Read-only view of a write transaction's tree (read-your-own-writes).
struct WorkingSetReader<'txn, 'db, B: StorageBackend> {
    db: &'db Database<B>,
    dirty: &'txn HashMap<PageId, Page>,
}

impl<B: StorageBackend> PageReader for WorkingSetReader<'_, '_, B> {
    fn read_page(&self, page_id: PageId) -> Result<Page> {
        if let Some(page) = self.dirty.get(&page_id) {
            return Ok(page.clone());
        }
        self.db.read_page(page_id)
    }

    fn page_size(&self) -> usize {
        self.db.config.page_size
    }

    fn page_count(&self) -> PageId {
        self.db.total_page_count()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::{sync::Barrier, thread};

    use kvs_test_utils::TestDir;

    use super::*;

    fn small_config() -> StoreConfig {
        StoreConfig::builder().page_size(512).build().unwrap()
    }

    fn put(db: &Database<impl StorageBackend>, key: &[u8], value: &[u8]) {
        let mut txn = db.write().unwrap();
        txn.insert(key, value).unwrap();
        txn.commit().unwrap();
    }

    #[test]
    fn test_bootstrap_layout() {
        let db = Database::open_in_memory().unwrap();
        let stats = db.stats();
        assert_eq!(stats.total_pages, 3);
        assert_eq!(stats.free_pages, 0);
        assert_eq!(stats.last_txn_id, 0);

        let txn = db.read().unwrap();
        assert_eq!(txn.root_page(), BOOTSTRAP_ROOT);
        assert!(matches!(txn.get(b"missing"), Err(Error::KeyNotFound)));
        assert!(txn.seek(b"").unwrap().is_none());
    }

    #[test]
    fn test_insert_commit_read() {
        let db = Database::open_in_memory().unwrap();
        put(&db, b"a", b"1");
        put(&db, b"", b"empty key");

        let txn = db.read().unwrap();
        assert_eq!(txn.get(b"a").unwrap(), b"1");
        assert_eq!(txn.get(b"").unwrap(), b"empty key");
        assert_eq!(db.stats().commits, 2);
    }

    #[test]
    fn test_write_transaction_reads_own_writes() {
        let db = Database::open_in_memory().unwrap();
        let mut txn = db.write().unwrap();
        txn.insert(b"k", b"v").unwrap();
        assert_eq!(txn.get(b"k").unwrap(), b"v");
        assert!(txn.contains(b"k").unwrap());
        assert_eq!(txn.seek(b"a").unwrap(), Some((b"k".to_vec(), b"v".to_vec())));
        txn.commit().unwrap();
    }

    #[test]
    fn test_abort_discards_changes() {
        let db = Database::open_in_memory().unwrap();
        put(&db, b"keep", b"1");
        let before = db.stats().total_pages;

        let free_before = db.stats().free_pages;

        let mut txn = db.write().unwrap();
        for i in 0..50u32 {
            txn.insert(format!("k{i}").as_bytes(), &[7u8; 200]).unwrap();
        }
        txn.abort();

        let txn = db.read().unwrap();
        assert!(!txn.contains(b"k0").unwrap());
        assert_eq!(txn.get(b"keep").unwrap(), b"1");
        drop(txn);

        // Pages allocated by the aborted transaction are reusable.
        let stats = db.stats();
        assert_eq!((stats.free_pages - free_before) as u64, stats.total_pages - before);
    }

    #[test]
    fn test_drop_aborts() {
        let db = Database::open_in_memory().unwrap();
        {
            let mut txn = db.write().unwrap();
            txn.insert(b"x", b"y").unwrap();
        }
        assert!(matches!(db.read().unwrap().get(b"x"), Err(Error::KeyNotFound)));
        // The writer slot is free again.
        put(&db, b"x", b"z");
    }

    #[test]
    fn test_delete_absent_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        put(&db, b"a", b"1");
        let commits = db.stats().commits;

        let mut txn = db.write().unwrap();
        assert!(matches!(txn.delete(b"b"), Err(Error::KeyNotFound)));
        txn.commit().unwrap();
        assert_eq!(db.stats().last_txn_id, 1);
        assert_eq!(db.stats().commits, commits);
    }

    #[test]
    fn test_reader_sees_snapshot() {
        let db = Database::open_in_memory().unwrap();
        put(&db, b"k", b"old");

        let reader = db.read().unwrap();
        put(&db, b"k", b"new");
        put(&db, b"other", b"x");

        assert_eq!(reader.get(b"k").unwrap(), b"old");
        assert!(!reader.contains(b"other").unwrap());
        assert_eq!(db.read().unwrap().get(b"k").unwrap(), b"new");
    }

    #[test]
    fn test_pending_frees_wait_for_readers() {
        let db = Database::open_in_memory().unwrap();
        put(&db, b"k", b"v1");

        let reader = db.read().unwrap();
        put(&db, b"k", b"v2");
        assert!(db.stats().pending_free_pages > 0);
        assert_eq!(reader.get(b"k").unwrap(), b"v1");

        drop(reader);
        assert_eq!(db.stats().pending_free_pages, 0);
    }

    #[test]
    fn test_page_reuse_bounds_growth() {
        let db = Database::open_in_memory_with_config(small_config()).unwrap();
        let mut high_water = 0;

        for round in 0..20u32 {
            let mut txn = db.write().unwrap();
            for i in 0..100u32 {
                txn.insert(format!("key{i:04}").as_bytes(), format!("v{round}").as_bytes())
                    .unwrap();
            }
            txn.commit().unwrap();

            let mut txn = db.write().unwrap();
            for i in 0..100u32 {
                txn.delete(format!("key{i:04}").as_bytes()).unwrap();
            }
            txn.commit().unwrap();

            let total = db.stats().total_pages;
            if round == 2 {
                high_water = total;
            } else if round > 2 {
                assert!(total <= high_water + 4, "round {round}: {total} > {high_water}");
            }
        }
        assert_eq!(db.read().unwrap().iter().unwrap().count(), 0);
    }

    #[test]
    fn test_out_of_space_rolls_back() {
        let config = StoreConfig::builder().page_size(512).max_pages(12).build().unwrap();
        let db = Database::open_in_memory_with_config(config).unwrap();
        put(&db, b"small", b"1");
        let total_before = db.stats().total_pages;

        let mut txn = db.write().unwrap();
        let result = txn.insert(b"big", &vec![1u8; 512 * 20]);
        assert!(matches!(result, Err(Error::OutOfSpace)));
        assert!(matches!(txn.insert(b"x", b"y"), Err(Error::TransactionFailed)));
        assert!(matches!(txn.commit(), Err(Error::TransactionFailed)));

        assert_eq!(db.stats().total_pages, total_before);
        assert_eq!(db.read().unwrap().get(b"small").unwrap(), b"1");
        put(&db, b"small", b"2");
    }

    #[test]
    fn test_key_too_large_keeps_transaction_usable() {
        let db = Database::open_in_memory_with_config(small_config()).unwrap();
        let mut txn = db.write().unwrap();
        assert!(matches!(txn.insert(&[0u8; 400], b"v"), Err(Error::KeyTooLarge { .. })));
        txn.insert(b"ok", b"v").unwrap();
        txn.commit().unwrap();
        assert_eq!(db.read().unwrap().get(b"ok").unwrap(), b"v");
    }

    #[test]
    fn test_reopen_restores_state_and_free_list() {
        let dir = TestDir::new();
        let path = dir.join("reopen.kvs");

        let free_before = {
            let db = Database::open_with_config(&path, small_config()).unwrap();
            let mut txn = db.write().unwrap();
            for i in 0..300u32 {
                txn.insert(format!("key{i:04}").as_bytes(), &[i as u8; 40]).unwrap();
            }
            txn.commit().unwrap();

            let mut txn = db.write().unwrap();
            for i in (0..300u32).step_by(2) {
                txn.delete(format!("key{i:04}").as_bytes()).unwrap();
            }
            txn.commit().unwrap();

            let stats = db.stats();
            db.close().unwrap();
            stats.free_pages + stats.pending_free_pages
        };

        let db = Database::open(&path).unwrap();
        assert_eq!(db.config().page_size, 512);
        let txn = db.read().unwrap();
        assert_eq!(txn.iter().unwrap().count(), 150);
        assert_eq!(txn.get(b"key0001").unwrap(), vec![1u8; 40]);
        assert!(matches!(txn.get(b"key0000"), Err(Error::KeyNotFound)));
        drop(txn);

        assert_eq!(db.stats().free_pages, free_before);
        assert!(db.verify().unwrap().is_clean());
    }

    #[test]
    fn test_torn_meta_falls_back_and_rebuilds() {
        let dir = TestDir::new();
        let path = dir.join("torn.kvs");

        let current_slot = {
            let db = Database::open_with_config(&path, small_config()).unwrap();
            put(&db, b"a", b"1");
            put(&db, b"b", b"2");
            let slot = db.committed_state.load().meta_slot;
            db.close().unwrap();
            slot
        };

        // Tear the newest meta record.
        let mut bytes = std::fs::read(&path).unwrap();
        let offset = current_slot * 512 + 40;
        bytes[offset] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let db = Database::open(&path).unwrap();
        let txn = db.read().unwrap();
        assert_eq!(txn.snapshot_id().raw(), 1);
        assert_eq!(txn.get(b"a").unwrap(), b"1");
        assert!(matches!(txn.get(b"b"), Err(Error::KeyNotFound)));
        drop(txn);
        assert!(db.verify().unwrap().is_clean());

        // The next commit overwrites the torn slot.
        put(&db, b"c", b"3");
        drop(db);
        let db = Database::open(&path).unwrap();
        assert_eq!(db.read().unwrap().get(b"c").unwrap(), b"3");
    }

    #[test]
    fn test_corrupt_page_surfaces() {
        let dir = TestDir::new();
        let path = dir.join("corrupt.kvs");

        let root = {
            let db = Database::open_with_config(&path, small_config()).unwrap();
            put(&db, b"a", b"1");
            let root = db.read().unwrap().root_page();
            db.close().unwrap();
            root
        };

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[root as usize * 512 + 300] ^= 0x01;
        std::fs::write(&path, &bytes).unwrap();

        let db = Database::open(&path).unwrap();
        let result = db.read().unwrap().get(b"a");
        assert!(matches!(result, Err(Error::CorruptPage { page_id }) if page_id == root));
        assert!(!db.verify().unwrap().is_clean());
    }

    #[test]
    fn test_concurrent_readers_during_writes() {
        let db = Database::open_in_memory_with_config(small_config()).unwrap();
        put(&db, b"counter", &0u64.to_le_bytes());

        let barrier = Barrier::new(5);
        thread::scope(|s| {
            s.spawn(|| {
                barrier.wait();
                for i in 1..=200u64 {
                    let mut txn = db.write().unwrap();
                    txn.insert(b"counter", &i.to_le_bytes()).unwrap();
                    txn.insert(format!("k{i:04}").as_bytes(), &[0u8; 64]).unwrap();
                    txn.commit().unwrap();
                }
            });
            for _ in 0..4 {
                s.spawn(|| {
                    barrier.wait();
                    let mut last = 0u64;
                    for _ in 0..500 {
                        let txn = db.read().unwrap();
                        let bytes = txn.get(b"counter").unwrap();
                        let value = u64::from_le_bytes(bytes.try_into().unwrap());
                        assert!(value >= last, "counter went backwards");
                        // Every key written with this counter is visible.
                        if value > 0 {
                            assert!(txn.contains(format!("k{value:04}").as_bytes()).unwrap());
                        }
                        last = value;
                    }
                });
            }
        });

        assert!(db.verify().unwrap().is_clean());
        assert_eq!(db.stats().active_readers, 0);
    }
}
