//! B+ tree implementation for the store engine.
//!
//! The tree maps byte-string keys to opaque byte values. It is designed for:
//! - Single-writer, multiple-reader access
//! - Copy-on-write semantics for crash safety
//! - Successor lookups via a root-to-leaf cursor
//!
//! ## Structure
//!
//! - `node.rs`: Slotted leaf and branch page layouts
//! - `split.rs`: Entry-level split, merge, and redistribution
//! - `overflow.rs`: Chained pages for large values
//! - `cursor.rs`: Seek and ordered iteration
//!
//! ## Copy-on-write
//!
//! Every page header records the transaction that wrote it. Before a page
//! whose `txn_id` differs from the provider's is modified, it is copied to a
//! new page and the old ID is freed. Changed child IDs propagate up to the
//! root, so the committed tree is never modified in place. A child that comes
//! back with its ID unchanged, unsplit and not underfull leaves its parent
//! untouched.

/// Seek and ordered iteration.
pub mod cursor;
/// Low-level leaf and branch node operations on pages.
pub mod node;
/// Chained pages for values too large for a leaf cell.
pub mod overflow;
/// Entry-level split, merge, and redistribution.
pub mod split;

use cursor::{BTreeIterator, Cursor};
use node::{
    BranchNode, BranchNodeRef, CellValue, LeafNode, LeafNodeRef, OwnedValue, SearchResult,
    fits_inline, leaf_capacity, max_key_size,
};
use split::{BranchEntries, LeafEntry, Rebalance};

use crate::{
    error::{Error, PageId, PageType, Result},
    page::Page,
};

/// Read access to pages.
pub trait PageReader {
    /// Reads a page by ID.
    fn read_page(&self, page_id: PageId) -> Result<Page>;

    /// Returns the page size.
    fn page_size(&self) -> usize;

    /// Returns one past the highest allocated page ID.
    fn page_count(&self) -> PageId;
}

/// Read-write access to pages within one write transaction.
pub trait PageProvider: PageReader {
    /// Stages a page written by the current transaction.
    fn write_page(&mut self, page: Page);

    /// Allocates a new page of the given type.
    fn allocate_page(&mut self, page_type: PageType) -> Result<Page>;

    /// Allocates `count` contiguous pages and returns the first ID.
    fn allocate_run(&mut self, count: usize) -> Result<PageId>;

    /// Frees a page for later reuse.
    fn free_page(&mut self, page_id: PageId);

    /// Returns the current transaction ID.
    fn txn_id(&self) -> u64;
}

/// What a recursive insert or delete did to a node.
#[derive(Debug)]
struct NodeUpdate {
    /// Current ID of the node (changes when it was copied).
    page_id: PageId,
    /// Separator and right sibling if the node split.
    split: Option<(Vec<u8>, PageId)>,
    /// Whether the node fell below the minimum fill.
    underfull: bool,
}

impl NodeUpdate {
    fn unchanged(page_id: PageId) -> Self {
        Self { page_id, split: None, underfull: false }
    }
}

/// B+ tree over a page provider.
///
/// The root is always a valid page: an empty tree is a single empty leaf.
pub struct BTree<P> {
    /// Page provider for reading/writing pages.
    provider: P,
    /// Root page ID.
    root_page: PageId,
    /// Number of node splits performed by this instance.
    split_count: u64,
    /// Number of sibling merges performed by this instance.
    merge_count: u64,
}

impl<P> BTree<P> {
    /// Creates a B-tree accessor over an existing root.
    pub fn new(root_page: PageId, provider: P) -> Self {
        Self { provider, root_page, split_count: 0, merge_count: 0 }
    }

    /// Returns the root page ID.
    pub fn root_page(&self) -> PageId {
        self.root_page
    }

    /// Returns the page provider.
    #[cfg(test)]
    pub(crate) fn provider(&self) -> &P {
        &self.provider
    }

    /// Returns the page provider mutably.
    #[cfg(test)]
    pub(crate) fn provider_mut(&mut self) -> &mut P {
        &mut self.provider
    }

    /// Returns the number of node splits performed by this instance.
    pub fn split_count(&self) -> u64 {
        self.split_count
    }

    /// Returns the number of sibling merges performed by this instance.
    pub fn merge_count(&self) -> u64 {
        self.merge_count
    }
}

impl<P: PageReader> BTree<P> {
    /// Computes the depth of the tree (1 = root is a leaf).
    ///
    /// Walks the leftmost path from root to leaf.
    ///
    /// # Errors
    ///
    /// Returns an error if a page read fails or a non-B-tree page is found.
    pub fn depth(&self) -> Result<u32> {
        let mut depth = 1u32;
        let mut page_id = self.root_page;

        loop {
            let page = self.provider.read_page(page_id)?;
            match page.page_type()? {
                PageType::BTreeLeaf => return Ok(depth),
                PageType::BTreeBranch => {
                    page_id = BranchNodeRef::from_page(&page)?.child(0)?;
                    depth += 1;
                },
                found => {
                    return Err(Error::PageTypeMismatch { expected: PageType::BTreeLeaf, found });
                },
            }
        }
    }

    /// Returns the value stored under `key`, or `None` if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if a page read fails or the tree is corrupted.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let page = self.find_leaf(key)?;
        let leaf = LeafNodeRef::from_page(&page)?;

        match leaf.search(key)? {
            SearchResult::Found(idx) => match leaf.value(idx)? {
                CellValue::Inline(bytes) => Ok(Some(bytes.to_vec())),
                CellValue::Overflow { first_page, len } => {
                    overflow::read_chain(&self.provider, first_page, len).map(Some)
                },
            },
            SearchResult::NotFound(_) => Ok(None),
        }
    }

    /// Returns the first entry with key `>= key`, or `None` past the end.
    ///
    /// # Errors
    ///
    /// Returns an error if a page read fails or the tree is corrupted.
    pub fn seek(&self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let mut cursor = Cursor::new(&self.provider);
        cursor.seek(self.root_page, key)?;
        cursor.current()
    }

    /// Iterates over all entries in ascending key order.
    ///
    /// # Errors
    ///
    /// Returns an error if positioning on the first entry fails.
    pub fn iter(&self) -> Result<BTreeIterator<'_, P>> {
        let mut cursor = Cursor::new(&self.provider);
        cursor.first(self.root_page)?;
        Ok(BTreeIterator::new(cursor))
    }

    /// Returns every page reachable from the root: branches, leaves, and
    /// overflow chains.
    ///
    /// # Errors
    ///
    /// Returns an error if a page read fails or the tree is corrupted.
    pub fn reachable_pages(&self) -> Result<Vec<PageId>> {
        let mut pages = Vec::new();
        let mut stack = vec![self.root_page];

        while let Some(page_id) = stack.pop() {
            pages.push(page_id);
            let page = self.provider.read_page(page_id)?;
            match page.page_type()? {
                PageType::BTreeBranch => {
                    let branch = BranchNodeRef::from_page(&page)?;
                    for i in 0..=branch.cell_count() {
                        stack.push(branch.child(i)?);
                    }
                },
                PageType::BTreeLeaf => {
                    let leaf = LeafNodeRef::from_page(&page)?;
                    for i in 0..leaf.cell_count() {
                        if let CellValue::Overflow { first_page, len } = leaf.value(i)? {
                            pages.extend(overflow::chain_pages(
                                first_page,
                                len,
                                self.provider.page_size(),
                                self.provider.page_count(),
                            )?);
                        }
                    }
                },
                found => {
                    return Err(Error::PageTypeMismatch { expected: PageType::BTreeLeaf, found });
                },
            }
        }
        Ok(pages)
    }

    /// Finds the leaf page that would contain `key`.
    fn find_leaf(&self, key: &[u8]) -> Result<Page> {
        let mut current = self.root_page;

        loop {
            let page = self.provider.read_page(current)?;
            match page.page_type()? {
                PageType::BTreeLeaf => return Ok(page),
                PageType::BTreeBranch => {
                    let branch = BranchNodeRef::from_page(&page)?;
                    current = branch.child(branch.child_index_for(key)?)?;
                },
                found => {
                    return Err(Error::PageTypeMismatch { expected: PageType::BTreeLeaf, found });
                },
            }
        }
    }
}

impl<P: PageProvider> BTree<P> {
    /// Creates an empty tree: a single empty leaf root.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfSpace`] if the root cannot be allocated.
    #[cfg(test)]
    pub(crate) fn create(mut provider: P) -> Result<Self> {
        let mut root = provider.allocate_page(PageType::BTreeLeaf)?;
        LeafNode::init(&mut root);
        let root_page = root.id;
        provider.write_page(root);
        Ok(Self::new(root_page, provider))
    }

    /// Inserts `key` with `value`, replacing any existing value.
    ///
    /// Returns `true` if an existing value was replaced. Values too large for
    /// a leaf cell are written to an overflow chain.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyTooLarge`] for oversized keys, [`Error::OutOfSpace`]
    /// if a page cannot be allocated, or an error if the tree is corrupted.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<bool> {
        let page_size = self.provider.page_size();
        let max = max_key_size(page_size);
        if key.len() > max {
            return Err(Error::KeyTooLarge { size: key.len(), max });
        }

        let value = if fits_inline(page_size, key.len(), value.len()) {
            OwnedValue::Inline(value.to_vec())
        } else {
            let first_page = overflow::write_chain(&mut self.provider, value)?;
            OwnedValue::Overflow { first_page, len: value.len() as u64 }
        };

        let (update, replaced) = self.insert_recursive(self.root_page, key, value)?;
        self.root_page = update.page_id;
        if let Some((separator, right)) = update.split {
            self.grow_root(separator, right)?;
        }
        Ok(replaced)
    }

    /// Deletes `key`. Returns `false` without touching any page if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if a page operation fails or the tree is corrupted.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        let Some(update) = self.delete_recursive(self.root_page, key)? else {
            return Ok(false);
        };
        self.root_page = update.page_id;
        if let Some((separator, right)) = update.split {
            self.grow_root(separator, right)?;
        }
        self.collapse_root()?;
        Ok(true)
    }

    fn insert_recursive(
        &mut self,
        page_id: PageId,
        key: &[u8],
        value: OwnedValue,
    ) -> Result<(NodeUpdate, bool)> {
        let page = self.provider.read_page(page_id)?;

        match page.page_type()? {
            PageType::BTreeLeaf => {
                let (search, old) = {
                    let leaf = LeafNodeRef::from_page(&page)?;
                    let search = leaf.search(key)?;
                    let old = match search {
                        SearchResult::Found(idx) => Some(leaf.value(idx)?.to_owned()),
                        SearchResult::NotFound(_) => None,
                    };
                    (search, old)
                };
                if let Some(OwnedValue::Overflow { first_page, len }) = old {
                    overflow::free_chain(&mut self.provider, first_page, len)?;
                }

                let mut page = self.make_writable(page)?;
                let fits = {
                    let mut leaf = LeafNode::from_page(&mut page)?;
                    if search.is_found() {
                        leaf.delete(search.index());
                    }
                    let fits = leaf.can_insert(key, value.as_cell());
                    if fits {
                        leaf.insert(search.index(), key, value.as_cell());
                    }
                    fits
                };

                let update = if fits {
                    let id = page.id;
                    self.provider.write_page(page);
                    NodeUpdate::unchanged(id)
                } else {
                    let mut entries = split::collect_leaf(&page)?;
                    entries.insert(search.index(), LeafEntry { key: key.to_vec(), value });
                    self.write_leaf_entries(page, entries)?
                };
                Ok((update, search.is_found()))
            },
            PageType::BTreeBranch => {
                let (child_index, child_id) = {
                    let branch = BranchNodeRef::from_page(&page)?;
                    let index = branch.child_index_for(key)?;
                    (index, branch.child(index)?)
                };
                let (child_update, replaced) = self.insert_recursive(child_id, key, value)?;
                let update = self.apply_child_update(page, child_index, child_id, child_update)?;
                Ok((update, replaced))
            },
            found => Err(Error::PageTypeMismatch { expected: PageType::BTreeLeaf, found }),
        }
    }

    /// Returns `None` if the key is absent, in which case nothing was touched.
    fn delete_recursive(&mut self, page_id: PageId, key: &[u8]) -> Result<Option<NodeUpdate>> {
        let page = self.provider.read_page(page_id)?;

        match page.page_type()? {
            PageType::BTreeLeaf => {
                let (index, old) = {
                    let leaf = LeafNodeRef::from_page(&page)?;
                    match leaf.search(key)? {
                        SearchResult::Found(idx) => (idx, leaf.value(idx)?.to_owned()),
                        SearchResult::NotFound(_) => return Ok(None),
                    }
                };
                if let OwnedValue::Overflow { first_page, len } = old {
                    overflow::free_chain(&mut self.provider, first_page, len)?;
                }

                let mut page = self.make_writable(page)?;
                LeafNode::from_page(&mut page)?.delete(index);
                let used = LeafNodeRef::from_page(&page)?.used_space()?;
                let underfull = split::is_underfull(used, leaf_capacity(page.size()));
                let id = page.id;
                self.provider.write_page(page);
                Ok(Some(NodeUpdate { page_id: id, split: None, underfull }))
            },
            PageType::BTreeBranch => {
                let (child_index, child_id) = {
                    let branch = BranchNodeRef::from_page(&page)?;
                    let index = branch.child_index_for(key)?;
                    (index, branch.child(index)?)
                };
                let Some(child_update) = self.delete_recursive(child_id, key)? else {
                    return Ok(None);
                };
                self.apply_child_update(page, child_index, child_id, child_update).map(Some)
            },
            found => Err(Error::PageTypeMismatch { expected: PageType::BTreeLeaf, found }),
        }
    }

    /// Folds a child's update into its parent branch `page`.
    fn apply_child_update(
        &mut self,
        page: Page,
        child_index: usize,
        old_child: PageId,
        update: NodeUpdate,
    ) -> Result<NodeUpdate> {
        if update.split.is_none() && !update.underfull {
            if update.page_id == old_child {
                return Ok(NodeUpdate::unchanged(page.id));
            }
            let mut page = self.make_writable(page)?;
            BranchNode::from_page(&mut page)?.set_child(child_index, update.page_id)?;
            let id = page.id;
            self.provider.write_page(page);
            return Ok(NodeUpdate::unchanged(id));
        }

        let page = self.make_writable(page)?;
        let mut entries = split::collect_branch(&page)?;
        entries.children[child_index] = update.page_id;
        if let Some((separator, right)) = update.split {
            entries.keys.insert(child_index, separator);
            entries.children.insert(child_index + 1, right);
        } else {
            self.rebalance_child(&mut entries, child_index)?;
        }
        self.write_branch_entries(page, entries)
    }

    /// Merges or redistributes the underfull child at `child_index` with an
    /// adjacent sibling, updating the parent's `entries`.
    fn rebalance_child(&mut self, entries: &mut BranchEntries, child_index: usize) -> Result<()> {
        if entries.children.len() < 2 {
            return Ok(());
        }
        let left_index =
            if child_index + 1 < entries.children.len() { child_index } else { child_index - 1 };
        let left_page = self.provider.read_page(entries.children[left_index])?;
        let right_page = self.provider.read_page(entries.children[left_index + 1])?;
        let page_size = self.provider.page_size();

        match left_page.page_type()? {
            PageType::BTreeLeaf => {
                let outcome = split::rebalance_leaves(
                    split::collect_leaf(&left_page)?,
                    split::collect_leaf(&right_page)?,
                    page_size,
                )?;
                match outcome {
                    Rebalance::Merged(all) => {
                        let mut left = self.make_writable(left_page)?;
                        split::write_leaf(&mut left, &all);
                        self.finish_merge(entries, left_index, left, right_page.id);
                    },
                    Rebalance::Redistributed { left: l, separator, right: r } => {
                        let mut left = self.make_writable(left_page)?;
                        let mut right = self.make_writable(right_page)?;
                        split::write_leaf(&mut left, &l);
                        split::write_leaf(&mut right, &r);
                        self.finish_redistribute(entries, left_index, left, separator, right);
                    },
                }
            },
            PageType::BTreeBranch => {
                let outcome = split::rebalance_branches(
                    split::collect_branch(&left_page)?,
                    entries.keys[left_index].clone(),
                    split::collect_branch(&right_page)?,
                    page_size,
                )?;
                match outcome {
                    Rebalance::Merged(all) => {
                        let mut left = self.make_writable(left_page)?;
                        split::write_branch(&mut left, &all)?;
                        self.finish_merge(entries, left_index, left, right_page.id);
                    },
                    Rebalance::Redistributed { left: l, separator, right: r } => {
                        let mut left = self.make_writable(left_page)?;
                        let mut right = self.make_writable(right_page)?;
                        split::write_branch(&mut left, &l)?;
                        split::write_branch(&mut right, &r)?;
                        self.finish_redistribute(entries, left_index, left, separator, right);
                    },
                }
            },
            found => {
                return Err(Error::PageTypeMismatch { expected: PageType::BTreeBranch, found });
            },
        }
        Ok(())
    }

    fn finish_merge(
        &mut self,
        entries: &mut BranchEntries,
        left_index: usize,
        left: Page,
        right_id: PageId,
    ) {
        entries.children[left_index] = left.id;
        entries.keys.remove(left_index);
        entries.children.remove(left_index + 1);
        self.provider.write_page(left);
        self.provider.free_page(right_id);
        self.merge_count += 1;
    }

    fn finish_redistribute(
        &mut self,
        entries: &mut BranchEntries,
        left_index: usize,
        left: Page,
        separator: Vec<u8>,
        right: Page,
    ) {
        entries.children[left_index] = left.id;
        entries.children[left_index + 1] = right.id;
        entries.keys[left_index] = separator;
        self.provider.write_page(left);
        self.provider.write_page(right);
    }

    /// Writes `entries` into the writable leaf `page`, splitting if needed.
    fn write_leaf_entries(
        &mut self,
        mut page: Page,
        mut entries: Vec<LeafEntry>,
    ) -> Result<NodeUpdate> {
        let page_size = self.provider.page_size();
        if split::leaf_fits(&entries, page_size) {
            let used = entries.iter().map(LeafEntry::size).sum();
            split::write_leaf(&mut page, &entries);
            let id = page.id;
            self.provider.write_page(page);
            return Ok(NodeUpdate {
                page_id: id,
                split: None,
                underfull: split::is_underfull(used, leaf_capacity(page_size)),
            });
        }

        let right_entries = split::split_leaf_entries(&mut entries, page_size)?;
        let separator = right_entries
            .first()
            .map(|e| e.key.clone())
            .ok_or_else(|| Error::Corrupted { reason: "Empty leaf after split".to_string() })?;
        let mut right = self.provider.allocate_page(PageType::BTreeLeaf)?;
        split::write_leaf(&mut page, &entries);
        split::write_leaf(&mut right, &right_entries);
        self.split_count += 1;

        let (left_id, right_id) = (page.id, right.id);
        self.provider.write_page(page);
        self.provider.write_page(right);
        Ok(NodeUpdate { page_id: left_id, split: Some((separator, right_id)), underfull: false })
    }

    /// Writes `entries` into the writable branch `page`, splitting if needed.
    fn write_branch_entries(
        &mut self,
        mut page: Page,
        mut entries: BranchEntries,
    ) -> Result<NodeUpdate> {
        let page_size = self.provider.page_size();
        if split::branch_fits(&entries, page_size) {
            let underfull =
                split::is_underfull(entries.size(), node::branch_capacity(page_size));
            split::write_branch(&mut page, &entries)?;
            let id = page.id;
            self.provider.write_page(page);
            return Ok(NodeUpdate { page_id: id, split: None, underfull });
        }

        let (separator, right_entries) = split::split_branch_entries(&mut entries, page_size)?;
        let mut right = self.provider.allocate_page(PageType::BTreeBranch)?;
        split::write_branch(&mut page, &entries)?;
        split::write_branch(&mut right, &right_entries)?;
        self.split_count += 1;

        let (left_id, right_id) = (page.id, right.id);
        self.provider.write_page(page);
        self.provider.write_page(right);
        Ok(NodeUpdate { page_id: left_id, split: Some((separator, right_id)), underfull: false })
    }

    /// Adds a level above the current root after a root split.
    fn grow_root(&mut self, separator: Vec<u8>, right: PageId) -> Result<()> {
        let mut root = self.provider.allocate_page(PageType::BTreeBranch)?;
        split::write_branch(
            &mut root,
            &BranchEntries { keys: vec![separator], children: vec![self.root_page, right] },
        )?;
        self.root_page = root.id;
        self.provider.write_page(root);
        Ok(())
    }

    /// Replaces a branch root that has no separators with its only child.
    fn collapse_root(&mut self) -> Result<()> {
        loop {
            let page = self.provider.read_page(self.root_page)?;
            if page.page_type()? != PageType::BTreeBranch {
                return Ok(());
            }
            let branch = BranchNodeRef::from_page(&page)?;
            if branch.cell_count() > 0 {
                return Ok(());
            }
            let child = branch.rightmost_child();
            self.provider.free_page(page.id);
            self.root_page = child;
        }
    }

    /// Returns a page this transaction may modify, copying it if it belongs
    /// to a committed snapshot.
    fn make_writable(&mut self, page: Page) -> Result<Page> {
        let txn_id = self.provider.txn_id();
        if page.txn_id() == txn_id {
            return Ok(page);
        }
        let old_id = page.id;
        let new_id = self.provider.allocate_page(page.page_type()?)?.id;
        let mut copy = Page::from_bytes(new_id, page.data);
        copy.set_txn_id(txn_id);
        self.provider.free_page(old_id);
        Ok(copy)
    }
}
