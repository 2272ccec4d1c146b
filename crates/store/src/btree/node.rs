//! B-tree node layout and in-place operations.
//!
//! ## Leaf Node Layout
//! ```text
//! [Page Header: 16 bytes, item_count = cell count]
//! [Free Space Start: 2 bytes]
//! [Free Space End: 2 bytes]
//! [Cell Pointers: 2 bytes each, sorted by key]
//! ... free space ...
//! [Cells: (flags:1, key_len:2, val_len:2, key_bytes, val_bytes)]
//! ```
//!
//! When `flags & FLAG_OVERFLOW` is set, `val_bytes` is a 16-byte reference
//! `(first_page:8, total_len:8)` to a chain of overflow pages.
//!
//! ## Branch Node Layout
//! ```text
//! [Page Header: 16 bytes, item_count = cell count]
//! [Free Space Start: 2 bytes]
//! [Free Space End: 2 bytes]
//! [Rightmost Child: 8 bytes]
//! [Cell Pointers: 2 bytes each]
//! ... free space ...
//! [Cells: (key_len:2, child_page:8, key_bytes)]
//! ```
//!
//! Cell `i` of a branch holds separator `key(i)` and `child(i)`, the subtree of
//! keys `< key(i)`. The rightmost child holds keys `>=` the last separator.
//!
//! Deleting a cell only removes its pointer; the cell bytes become dead space
//! that is reclaimed when the node is rebuilt.

use std::cmp::Ordering;

use crate::{
    error::{Error, PageId, PageType, Result},
    page::{PAGE_HEADER_SIZE, Page, read_u16, read_u64, write_u16, write_u64},
};

const FREE_START_OFFSET: usize = PAGE_HEADER_SIZE;
const FREE_END_OFFSET: usize = PAGE_HEADER_SIZE + 2;
const RIGHTMOST_CHILD_OFFSET: usize = PAGE_HEADER_SIZE + 4;

/// Bytes before the first leaf cell pointer.
pub const LEAF_HEADER_SIZE: usize = PAGE_HEADER_SIZE + 4;

/// Bytes before the first branch cell pointer.
pub const BRANCH_HEADER_SIZE: usize = PAGE_HEADER_SIZE + 12;

/// Size of a cell pointer.
pub const CELL_PTR_SIZE: usize = 2;

/// flags + key_len + val_len.
const LEAF_CELL_OVERHEAD: usize = 1 + 2 + 2;

/// key_len + child page.
const BRANCH_CELL_OVERHEAD: usize = 2 + 8;

/// Size of an overflow reference stored in place of a value.
pub const OVERFLOW_REF_SIZE: usize = 16;

/// Leaf cell flag: the value lives in an overflow chain.
pub const FLAG_OVERFLOW: u8 = 0x01;

/// A search result for finding a key in a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchResult {
    /// Key was found at this index.
    Found(usize),
    /// Key was not found; this is where it would be inserted.
    NotFound(usize),
}

impl SearchResult {
    /// Returns the index, whether found or not.
    pub fn index(&self) -> usize {
        match self {
            SearchResult::Found(i) | SearchResult::NotFound(i) => *i,
        }
    }

    /// Returns true if the key was found.
    pub fn is_found(&self) -> bool {
        matches!(self, SearchResult::Found(_))
    }
}

/// A leaf cell's value as stored in the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellValue<'a> {
    /// Value bytes stored in the cell.
    Inline(&'a [u8]),
    /// Value stored in an overflow chain.
    Overflow {
        /// First page of the chain.
        first_page: PageId,
        /// Total value length in bytes.
        len: u64,
    },
}

impl CellValue<'_> {
    /// Bytes the value occupies inside the cell.
    pub fn stored_len(&self) -> usize {
        match self {
            CellValue::Inline(bytes) => bytes.len(),
            CellValue::Overflow { .. } => OVERFLOW_REF_SIZE,
        }
    }

    /// Copies the value out of the page.
    pub fn to_owned(&self) -> OwnedValue {
        match *self {
            CellValue::Inline(bytes) => OwnedValue::Inline(bytes.to_vec()),
            CellValue::Overflow { first_page, len } => OwnedValue::Overflow { first_page, len },
        }
    }
}

/// An owned leaf cell value, used when nodes are rebuilt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnedValue {
    /// Value bytes stored in the cell.
    Inline(Vec<u8>),
    /// Value stored in an overflow chain.
    Overflow {
        /// First page of the chain.
        first_page: PageId,
        /// Total value length in bytes.
        len: u64,
    },
}

impl OwnedValue {
    /// Borrows the value in its cell form.
    pub fn as_cell(&self) -> CellValue<'_> {
        match self {
            OwnedValue::Inline(bytes) => CellValue::Inline(bytes),
            OwnedValue::Overflow { first_page, len } => {
                CellValue::Overflow { first_page: *first_page, len: *len }
            },
        }
    }
}

/// Bytes a leaf cell occupies, including its pointer.
pub fn leaf_cell_size(key_len: usize, stored_value_len: usize) -> usize {
    CELL_PTR_SIZE + LEAF_CELL_OVERHEAD + key_len + stored_value_len
}

/// Bytes a branch cell occupies, including its pointer.
pub fn branch_cell_size(key_len: usize) -> usize {
    CELL_PTR_SIZE + BRANCH_CELL_OVERHEAD + key_len
}

/// Space available for leaf cells in an empty leaf.
pub fn leaf_capacity(page_size: usize) -> usize {
    page_size - LEAF_HEADER_SIZE
}

/// Space available for branch cells in an empty branch.
pub fn branch_capacity(page_size: usize) -> usize {
    page_size - BRANCH_HEADER_SIZE
}

/// Largest leaf cell allowed, so that any overfull leaf splits into two
/// halves that each fit.
pub fn max_leaf_cell(page_size: usize) -> usize {
    leaf_capacity(page_size) / 4
}

/// Largest branch cell allowed.
pub fn max_branch_cell(page_size: usize) -> usize {
    branch_capacity(page_size) / 4
}

/// Largest key accepted by the tree for a given page size.
///
/// A key must fit in a leaf cell next to an overflow reference and in a
/// branch cell as a separator.
pub fn max_key_size(page_size: usize) -> usize {
    let leaf = max_leaf_cell(page_size) - leaf_cell_size(0, OVERFLOW_REF_SIZE);
    let branch = max_branch_cell(page_size) - branch_cell_size(0);
    leaf.min(branch)
}

/// Whether `value_len` bytes can be stored inline next to `key_len`.
pub fn fits_inline(page_size: usize, key_len: usize, value_len: usize) -> bool {
    leaf_cell_size(key_len, value_len) <= max_leaf_cell(page_size)
}

fn init_node(page: &mut Page, header_size: usize) {
    page.set_item_count(0);
    let page_size = page.size();
    write_u16(&mut page.data, FREE_START_OFFSET, header_size as u16);
    write_u16(&mut page.data, FREE_END_OFFSET, page_size as u16);
}

fn free_space(data: &[u8]) -> usize {
    let free_start = read_u16(data, FREE_START_OFFSET) as usize;
    free_end(data).saturating_sub(free_start)
}

fn free_end(data: &[u8]) -> usize {
    read_u16(data, FREE_END_OFFSET) as usize
}

fn binary_search<'k>(
    count: usize,
    key: &[u8],
    key_at: impl Fn(usize) -> Result<&'k [u8]>,
) -> Result<SearchResult> {
    let mut lo = 0;
    let mut hi = count;

    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        match key.cmp(key_at(mid)?) {
            Ordering::Equal => return Ok(SearchResult::Found(mid)),
            Ordering::Less => hi = mid,
            Ordering::Greater => lo = mid + 1,
        }
    }

    Ok(SearchResult::NotFound(lo))
}

fn corrupt(page_id: PageId, what: &str) -> Error {
    Error::Corrupted { reason: format!("Page {page_id}: {what}") }
}

// ============================================================================
// Leaf nodes
// ============================================================================

/// Read-only view of a leaf node.
#[derive(Clone, Copy)]
pub struct LeafNodeRef<'a> {
    id: PageId,
    data: &'a [u8],
}

impl<'a> LeafNodeRef<'a> {
    /// Wraps a page as a leaf node.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PageTypeMismatch`] if the page is not a leaf.
    pub fn from_page(page: &'a Page) -> Result<Self> {
        page.expect_type(PageType::BTreeLeaf)?;
        Ok(Self { id: page.id, data: &page.data })
    }

    /// Returns the number of cells in this node.
    pub fn cell_count(&self) -> usize {
        read_u16(self.data, 2) as usize
    }

    /// Returns the free space available for new cells.
    pub fn free_space(&self) -> usize {
        free_space(self.data)
    }

    fn cell_offset(&self, index: usize) -> Result<usize> {
        if index >= self.cell_count() {
            return Err(corrupt(self.id, "leaf cell index out of range"));
        }
        let ptr = LEAF_HEADER_SIZE + index * CELL_PTR_SIZE;
        if ptr + CELL_PTR_SIZE > self.data.len() {
            return Err(corrupt(self.id, "leaf cell pointer out of bounds"));
        }
        let offset = read_u16(self.data, ptr) as usize;
        if offset + LEAF_CELL_OVERHEAD > self.data.len() {
            return Err(corrupt(self.id, "leaf cell out of bounds"));
        }
        Ok(offset)
    }

    fn cell_parts(&self, index: usize) -> Result<(u8, &'a [u8], &'a [u8])> {
        let offset = self.cell_offset(index)?;
        let flags = self.data[offset];
        let key_len = read_u16(self.data, offset + 1) as usize;
        let val_len = read_u16(self.data, offset + 3) as usize;
        let key_start = offset + LEAF_CELL_OVERHEAD;
        let val_start = key_start + key_len;
        let end = val_start + val_len;
        if end > self.data.len() {
            return Err(corrupt(self.id, "leaf cell overruns page"));
        }
        Ok((flags, &self.data[key_start..val_start], &self.data[val_start..end]))
    }

    /// Returns the key at a given index.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the cell is malformed.
    pub fn key(&self, index: usize) -> Result<&'a [u8]> {
        Ok(self.cell_parts(index)?.1)
    }

    /// Returns the value at a given index.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the cell is malformed.
    pub fn value(&self, index: usize) -> Result<CellValue<'a>> {
        let (flags, _, value) = self.cell_parts(index)?;
        if flags & FLAG_OVERFLOW == 0 {
            return Ok(CellValue::Inline(value));
        }
        if value.len() != OVERFLOW_REF_SIZE {
            return Err(corrupt(self.id, "malformed overflow reference"));
        }
        Ok(CellValue::Overflow { first_page: read_u64(value, 0), len: read_u64(value, 8) })
    }

    /// Returns key and value at a given index.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the cell is malformed.
    pub fn get(&self, index: usize) -> Result<(&'a [u8], CellValue<'a>)> {
        Ok((self.key(index)?, self.value(index)?))
    }

    /// Binary search for a key. Returns `Found(index)` or `NotFound(insert_position)`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if a cell is malformed.
    pub fn search(&self, key: &[u8]) -> Result<SearchResult> {
        binary_search(self.cell_count(), key, |i| self.key(i))
    }

    /// Returns the bytes used by live cells and their pointers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if a cell is malformed.
    pub fn used_space(&self) -> Result<usize> {
        let mut used = 0;
        for i in 0..self.cell_count() {
            let (_, key, value) = self.cell_parts(i)?;
            used += leaf_cell_size(key.len(), value.len());
        }
        Ok(used)
    }
}

/// Mutable leaf node over a page.
pub struct LeafNode<'a> {
    page: &'a mut Page,
}

impl<'a> LeafNode<'a> {
    /// Wraps a page as a leaf node.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PageTypeMismatch`] if the page is not a leaf.
    pub fn from_page(page: &'a mut Page) -> Result<Self> {
        page.expect_type(PageType::BTreeLeaf)?;
        Ok(Self { page })
    }

    /// Initializes an empty leaf node.
    pub fn init(page: &'a mut Page) -> Self {
        init_node(page, LEAF_HEADER_SIZE);
        Self { page }
    }

    /// Returns a read-only view.
    pub fn as_ref(&self) -> LeafNodeRef<'_> {
        LeafNodeRef { id: self.page.id, data: &self.page.data }
    }

    /// Returns the number of cells in this node.
    pub fn cell_count(&self) -> usize {
        self.as_ref().cell_count()
    }

    /// Checks if there's room for a new cell.
    pub fn can_insert(&self, key: &[u8], value: CellValue<'_>) -> bool {
        free_space(&self.page.data) >= leaf_cell_size(key.len(), value.stored_len())
    }

    /// Inserts a cell at the given index.
    ///
    /// Caller must ensure there's enough space (use `can_insert` first).
    pub fn insert(&mut self, index: usize, key: &[u8], value: CellValue<'_>) {
        let count = self.cell_count();
        debug_assert!(index <= count);
        debug_assert!(self.can_insert(key, value));

        let data = &mut self.page.data;
        let stored_len = value.stored_len();
        let cell_len = LEAF_CELL_OVERHEAD + key.len() + stored_len;
        let free_start = read_u16(data, FREE_START_OFFSET) as usize;
        let cell_offset = free_end(data) - cell_len;

        let flags = match value {
            CellValue::Inline(_) => 0,
            CellValue::Overflow { .. } => FLAG_OVERFLOW,
        };
        data[cell_offset] = flags;
        write_u16(data, cell_offset + 1, key.len() as u16);
        write_u16(data, cell_offset + 3, stored_len as u16);
        let key_start = cell_offset + LEAF_CELL_OVERHEAD;
        data[key_start..key_start + key.len()].copy_from_slice(key);
        let val_start = key_start + key.len();
        match value {
            CellValue::Inline(bytes) => {
                data[val_start..val_start + bytes.len()].copy_from_slice(bytes)
            },
            CellValue::Overflow { first_page, len } => {
                write_u64(data, val_start, first_page);
                write_u64(data, val_start + 8, len);
            },
        }

        let ptr_base = LEAF_HEADER_SIZE + index * CELL_PTR_SIZE;
        let ptr_end = LEAF_HEADER_SIZE + count * CELL_PTR_SIZE;
        data.copy_within(ptr_base..ptr_end, ptr_base + CELL_PTR_SIZE);
        write_u16(data, ptr_base, cell_offset as u16);

        write_u16(data, FREE_START_OFFSET, (free_start + CELL_PTR_SIZE) as u16);
        write_u16(data, FREE_END_OFFSET, cell_offset as u16);
        self.page.set_item_count((count + 1) as u16);
    }

    /// Deletes the cell at a given index.
    pub fn delete(&mut self, index: usize) {
        let count = self.cell_count();
        debug_assert!(index < count);

        let data = &mut self.page.data;
        let ptr_base = LEAF_HEADER_SIZE + index * CELL_PTR_SIZE;
        let ptr_end = LEAF_HEADER_SIZE + count * CELL_PTR_SIZE;
        data.copy_within(ptr_base + CELL_PTR_SIZE..ptr_end, ptr_base);

        let free_start = read_u16(data, FREE_START_OFFSET) as usize;
        write_u16(data, FREE_START_OFFSET, (free_start - CELL_PTR_SIZE) as u16);
        self.page.set_item_count((count - 1) as u16);
    }
}

// ============================================================================
// Branch nodes
// ============================================================================

/// Read-only view of a branch node.
#[derive(Clone, Copy)]
pub struct BranchNodeRef<'a> {
    id: PageId,
    data: &'a [u8],
}

impl<'a> BranchNodeRef<'a> {
    /// Wraps a page as a branch node.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PageTypeMismatch`] if the page is not a branch.
    pub fn from_page(page: &'a Page) -> Result<Self> {
        page.expect_type(PageType::BTreeBranch)?;
        Ok(Self { id: page.id, data: &page.data })
    }

    /// Returns the number of separator cells.
    pub fn cell_count(&self) -> usize {
        read_u16(self.data, 2) as usize
    }

    /// Returns the free space available for new cells.
    pub fn free_space(&self) -> usize {
        free_space(self.data)
    }

    /// Returns the rightmost child.
    pub fn rightmost_child(&self) -> PageId {
        read_u64(self.data, RIGHTMOST_CHILD_OFFSET)
    }

    fn cell_offset(&self, index: usize) -> Result<usize> {
        if index >= self.cell_count() {
            return Err(corrupt(self.id, "branch cell index out of range"));
        }
        let ptr = BRANCH_HEADER_SIZE + index * CELL_PTR_SIZE;
        if ptr + CELL_PTR_SIZE > self.data.len() {
            return Err(corrupt(self.id, "branch cell pointer out of bounds"));
        }
        let offset = read_u16(self.data, ptr) as usize;
        if offset + BRANCH_CELL_OVERHEAD > self.data.len() {
            return Err(corrupt(self.id, "branch cell out of bounds"));
        }
        Ok(offset)
    }

    /// Returns the separator key at a given index.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the cell is malformed.
    pub fn key(&self, index: usize) -> Result<&'a [u8]> {
        let offset = self.cell_offset(index)?;
        let key_len = read_u16(self.data, offset) as usize;
        let key_start = offset + BRANCH_CELL_OVERHEAD;
        if key_start + key_len > self.data.len() {
            return Err(corrupt(self.id, "branch cell overruns page"));
        }
        Ok(&self.data[key_start..key_start + key_len])
    }

    /// Returns child `index`, where `index == cell_count()` is the rightmost child.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the cell is malformed.
    pub fn child(&self, index: usize) -> Result<PageId> {
        if index == self.cell_count() {
            return Ok(self.rightmost_child());
        }
        let offset = self.cell_offset(index)?;
        Ok(read_u64(self.data, offset + 2))
    }

    /// Returns the index of the child whose subtree may contain `key`.
    ///
    /// This is the first separator strictly greater than `key`, or
    /// `cell_count()` for the rightmost child.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if a cell is malformed.
    pub fn child_index_for(&self, key: &[u8]) -> Result<usize> {
        Ok(match binary_search(self.cell_count(), key, |i| self.key(i))? {
            SearchResult::Found(i) => i + 1,
            SearchResult::NotFound(i) => i,
        })
    }

    /// Returns the bytes used by live cells and their pointers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if a cell is malformed.
    pub fn used_space(&self) -> Result<usize> {
        let mut used = 0;
        for i in 0..self.cell_count() {
            used += branch_cell_size(self.key(i)?.len());
        }
        Ok(used)
    }
}

/// Mutable branch node over a page.
pub struct BranchNode<'a> {
    page: &'a mut Page,
}

impl<'a> BranchNode<'a> {
    /// Wraps a page as a branch node.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PageTypeMismatch`] if the page is not a branch.
    pub fn from_page(page: &'a mut Page) -> Result<Self> {
        page.expect_type(PageType::BTreeBranch)?;
        Ok(Self { page })
    }

    /// Initializes an empty branch node with one child.
    pub fn init(page: &'a mut Page, rightmost_child: PageId) -> Self {
        init_node(page, BRANCH_HEADER_SIZE);
        write_u64(&mut page.data, RIGHTMOST_CHILD_OFFSET, rightmost_child);
        Self { page }
    }

    /// Returns a read-only view.
    pub fn as_ref(&self) -> BranchNodeRef<'_> {
        BranchNodeRef { id: self.page.id, data: &self.page.data }
    }

    /// Returns the number of separator cells.
    pub fn cell_count(&self) -> usize {
        self.as_ref().cell_count()
    }

    /// Checks if there's room for a new separator.
    pub fn can_insert(&self, key: &[u8]) -> bool {
        free_space(&self.page.data) >= branch_cell_size(key.len())
    }

    /// Inserts separator `key` with left child `child` at `index`.
    ///
    /// Caller must ensure there's enough space (use `can_insert` first).
    pub fn insert(&mut self, index: usize, key: &[u8], child: PageId) {
        let count = self.cell_count();
        debug_assert!(index <= count);
        debug_assert!(self.can_insert(key));

        let data = &mut self.page.data;
        let cell_len = BRANCH_CELL_OVERHEAD + key.len();
        let free_start = read_u16(data, FREE_START_OFFSET) as usize;
        let cell_offset = free_end(data) - cell_len;

        write_u16(data, cell_offset, key.len() as u16);
        write_u64(data, cell_offset + 2, child);
        data[cell_offset + BRANCH_CELL_OVERHEAD..cell_offset + cell_len].copy_from_slice(key);

        let ptr_base = BRANCH_HEADER_SIZE + index * CELL_PTR_SIZE;
        let ptr_end = BRANCH_HEADER_SIZE + count * CELL_PTR_SIZE;
        data.copy_within(ptr_base..ptr_end, ptr_base + CELL_PTR_SIZE);
        write_u16(data, ptr_base, cell_offset as u16);

        write_u16(data, FREE_START_OFFSET, (free_start + CELL_PTR_SIZE) as u16);
        write_u16(data, FREE_END_OFFSET, cell_offset as u16);
        self.page.set_item_count((count + 1) as u16);
    }

    /// Replaces child `index` (`cell_count()` addresses the rightmost child).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the cell is malformed.
    pub fn set_child(&mut self, index: usize, child: PageId) -> Result<()> {
        if index == self.cell_count() {
            write_u64(&mut self.page.data, RIGHTMOST_CHILD_OFFSET, child);
            return Ok(());
        }
        let offset = self.as_ref().cell_offset(index)?;
        write_u64(&mut self.page.data, offset + 2, child);
        Ok(())
    }
}
