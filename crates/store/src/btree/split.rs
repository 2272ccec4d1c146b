//! Node rebuilding, splitting, and merging for the B+ tree.
//!
//! # Algorithm Overview
//!
//! Structural changes work on owned entry lists rather than on pages: the
//! live cells of the affected node(s) are collected, edited, and then written
//! back into freshly initialized pages. Rebuilding from scratch reclaims the
//! dead cell bytes that deletes leave behind.
//!
//! ## Splitting
//!
//! 1. **Leaf split**: entries are divided by byte balance. The first key of the
//!    right half is copied up to the parent as the separator.
//! 2. **Branch split**: the separator at the balance point is promoted (moved,
//!    not copied) to the parent. Its left child becomes the rightmost child of
//!    the left half.
//!
//! Every cell is at most a quarter of a page, so an overfull node always splits
//! into two halves that fit.
//!
//! ## Merging and redistribution
//!
//! A node whose live bytes fall below a quarter of its capacity is underfull.
//! It is combined with an adjacent sibling: if the combined entries fit in one
//! page the siblings merge, otherwise the entries are split again by byte
//! balance and the parent separator is replaced.

use super::node::{
    BranchNode, BranchNodeRef, LeafNode, LeafNodeRef, OwnedValue, branch_capacity,
    branch_cell_size, leaf_capacity, leaf_cell_size,
};
use crate::{
    error::{Error, PageId, Result},
    page::Page,
};

/// One owned leaf cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafEntry {
    /// Key bytes.
    pub key: Vec<u8>,
    /// Inline value or overflow reference.
    pub value: OwnedValue,
}

impl LeafEntry {
    /// Bytes this entry occupies in a leaf, including its cell pointer.
    pub fn size(&self) -> usize {
        leaf_cell_size(self.key.len(), self.value.as_cell().stored_len())
    }
}

/// The separators and children of a branch node.
///
/// `children.len() == keys.len() + 1`; the last child is the rightmost.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BranchEntries {
    /// Separator keys in ascending order.
    pub keys: Vec<Vec<u8>>,
    /// Child page IDs.
    pub children: Vec<PageId>,
}

impl BranchEntries {
    /// Bytes the separators occupy in a branch, including cell pointers.
    pub fn size(&self) -> usize {
        self.keys.iter().map(|k| branch_cell_size(k.len())).sum()
    }
}

/// Collects the live entries of a leaf page.
///
/// # Errors
///
/// Returns an error if the page is not a leaf or a cell is malformed.
pub fn collect_leaf(page: &Page) -> Result<Vec<LeafEntry>> {
    let node = LeafNodeRef::from_page(page)?;
    let mut entries = Vec::with_capacity(node.cell_count());
    for i in 0..node.cell_count() {
        let (key, value) = node.get(i)?;
        entries.push(LeafEntry { key: key.to_vec(), value: value.to_owned() });
    }
    Ok(entries)
}

/// Collects the separators and children of a branch page.
///
/// # Errors
///
/// Returns an error if the page is not a branch or a cell is malformed.
pub fn collect_branch(page: &Page) -> Result<BranchEntries> {
    let node = BranchNodeRef::from_page(page)?;
    let count = node.cell_count();
    let mut entries =
        BranchEntries { keys: Vec::with_capacity(count), children: Vec::with_capacity(count + 1) };
    for i in 0..count {
        entries.keys.push(node.key(i)?.to_vec());
        entries.children.push(node.child(i)?);
    }
    entries.children.push(node.rightmost_child());
    Ok(entries)
}

/// Rewrites `page` as a leaf holding exactly `entries`.
///
/// Caller must ensure the entries fit (see [`leaf_fits`]).
pub fn write_leaf(page: &mut Page, entries: &[LeafEntry]) {
    let mut node = LeafNode::init(page);
    for (i, entry) in entries.iter().enumerate() {
        node.insert(i, &entry.key, entry.value.as_cell());
    }
}

/// Rewrites `page` as a branch holding exactly `entries`.
///
/// # Errors
///
/// Returns [`Error::Corrupted`] if `entries` has no children.
pub fn write_branch(page: &mut Page, entries: &BranchEntries) -> Result<()> {
    let Some(&rightmost) = entries.children.last() else {
        return Err(Error::Corrupted { reason: "Branch without children".to_string() });
    };
    let mut node = BranchNode::init(page, rightmost);
    for (i, (key, &child)) in entries.keys.iter().zip(&entries.children).enumerate() {
        node.insert(i, key, child);
    }
    Ok(())
}

/// Whether `entries` fit in one leaf of `page_size`.
pub fn leaf_fits(entries: &[LeafEntry], page_size: usize) -> bool {
    entries.iter().map(LeafEntry::size).sum::<usize>() <= leaf_capacity(page_size)
}

/// Whether `entries` fit in one branch of `page_size`.
pub fn branch_fits(entries: &BranchEntries, page_size: usize) -> bool {
    entries.size() <= branch_capacity(page_size)
}

/// Whether `used` live bytes leave a node below the minimum fill.
pub fn is_underfull(used: usize, capacity: usize) -> bool {
    used < capacity / 4
}

/// Finds the index that divides `sizes` most evenly into two non-empty halves
/// that each fit in `capacity`.
fn balance_point(sizes: &[usize], capacity: usize) -> Option<usize> {
    let total: usize = sizes.iter().sum();
    let mut best: Option<(usize, usize)> = None;
    let mut left = 0usize;

    for (i, size) in sizes.iter().enumerate().take(sizes.len().saturating_sub(1)) {
        left += size;
        let right = total - left;
        if left > capacity || right > capacity {
            continue;
        }
        let skew = left.abs_diff(right);
        if best.is_none_or(|(_, best_skew)| skew < best_skew) {
            best = Some((i + 1, skew));
        }
    }
    best.map(|(at, _)| at)
}

/// Splits leaf entries into two halves by byte balance.
///
/// Returns the right half; `entries` keeps the left half. The separator is the
/// first key of the right half.
///
/// # Errors
///
/// Returns [`Error::Corrupted`] if no split point makes both halves fit.
pub fn split_leaf_entries(
    entries: &mut Vec<LeafEntry>,
    page_size: usize,
) -> Result<Vec<LeafEntry>> {
    let sizes: Vec<usize> = entries.iter().map(LeafEntry::size).collect();
    let at = balance_point(&sizes, leaf_capacity(page_size)).ok_or_else(|| Error::Corrupted {
        reason: format!("No leaf split point for {} entries", entries.len()),
    })?;
    Ok(entries.split_off(at))
}

/// Splits branch entries around a promoted separator.
///
/// Returns `(separator, right)`; `entries` keeps the left half.
///
/// # Errors
///
/// Returns [`Error::Corrupted`] if no split point makes both halves fit.
pub fn split_branch_entries(
    entries: &mut BranchEntries,
    page_size: usize,
) -> Result<(Vec<u8>, BranchEntries)> {
    let capacity = branch_capacity(page_size);
    let sizes: Vec<usize> = entries.keys.iter().map(|k| branch_cell_size(k.len())).collect();
    let total: usize = sizes.iter().sum();

    // The promoted key leaves both halves, so pick it directly.
    let mut best: Option<(usize, usize)> = None;
    let mut left = 0usize;
    for (m, size) in sizes.iter().enumerate() {
        let right = total - left - size;
        if left <= capacity && right <= capacity {
            let skew = left.abs_diff(right);
            if best.is_none_or(|(_, best_skew)| skew < best_skew) {
                best = Some((m, skew));
            }
        }
        left += size;
    }

    let (m, _) = best.ok_or_else(|| Error::Corrupted {
        reason: format!("No branch split point for {} separators", entries.keys.len()),
    })?;

    let right_keys = entries.keys.split_off(m + 1);
    let separator = entries.keys.pop().ok_or_else(|| Error::Corrupted {
        reason: "Branch split without separator".to_string(),
    })?;
    let right_children = entries.children.split_off(m + 1);
    Ok((separator, BranchEntries { keys: right_keys, children: right_children }))
}

/// Outcome of rebalancing two adjacent siblings.
#[derive(Debug)]
pub enum Rebalance<T> {
    /// Everything fits in the left sibling; the right one is emptied.
    Merged(T),
    /// Entries were redistributed; the parent separator becomes the key.
    Redistributed {
        /// New contents of the left sibling.
        left: T,
        /// New parent separator.
        separator: Vec<u8>,
        /// New contents of the right sibling.
        right: T,
    },
}

/// Merges or redistributes two adjacent leaves.
///
/// # Errors
///
/// Returns [`Error::Corrupted`] if the entries cannot be split to fit.
pub fn rebalance_leaves(
    mut left: Vec<LeafEntry>,
    right: Vec<LeafEntry>,
    page_size: usize,
) -> Result<Rebalance<Vec<LeafEntry>>> {
    left.extend(right);
    if leaf_fits(&left, page_size) {
        return Ok(Rebalance::Merged(left));
    }
    let right = split_leaf_entries(&mut left, page_size)?;
    let separator = right
        .first()
        .map(|e| e.key.clone())
        .ok_or_else(|| Error::Corrupted { reason: "Empty leaf after split".to_string() })?;
    Ok(Rebalance::Redistributed { left, separator, right })
}

/// Merges or redistributes two adjacent branches separated by `separator`.
///
/// # Errors
///
/// Returns [`Error::Corrupted`] if the entries cannot be split to fit.
pub fn rebalance_branches(
    mut left: BranchEntries,
    separator: Vec<u8>,
    right: BranchEntries,
    page_size: usize,
) -> Result<Rebalance<BranchEntries>> {
    left.keys.push(separator);
    left.keys.extend(right.keys);
    left.children.extend(right.children);
    if branch_fits(&left, page_size) {
        return Ok(Rebalance::Merged(left));
    }
    let (separator, right) = split_branch_entries(&mut left, page_size)?;
    Ok(Rebalance::Redistributed { left, separator, right })
}
