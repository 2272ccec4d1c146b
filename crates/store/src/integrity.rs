//! Integrity scrubber for detecting silent data corruption.
//!
//! Walks one pinned snapshot from the root, reading raw pages so that what is
//! checked is what is stored, not what the cache holds. Checks:
//!
//! - Page checksums of every branch, leaf, overflow and free-list page
//! - Keys strictly ascending within each node and inside the separator bounds
//!   inherited from ancestors
//! - Every leaf at the same depth
//! - Overflow chains of the recorded length
//! - No page referenced twice and none that is also on the free list

use std::collections::HashSet;

use crate::{
    Database,
    backend::StorageBackend,
    btree::{
        node::{BranchNodeRef, CellValue, LeafNodeRef},
        overflow,
    },
    db::ReadTransaction,
    error::{Error, PageId, PageType},
    page::{Page, freelist},
};

/// Result of an integrity scrub.
#[derive(Debug, Clone, Default)]
pub struct ScrubResult {
    /// Number of pages checked.
    pub pages_checked: u64,
    /// Number of checksum errors detected.
    pub checksum_errors: u64,
    /// Number of structural errors detected.
    pub structural_errors: u64,
    /// Detailed error descriptions.
    pub errors: Vec<ScrubError>,
}

impl ScrubResult {
    /// Checks whether the scrub found no problems.
    pub fn is_clean(&self) -> bool {
        self.checksum_errors == 0 && self.structural_errors == 0
    }

    fn structural(&mut self, page_id: PageId, description: String) {
        self.structural_errors += 1;
        self.errors.push(ScrubError { page_id, description });
    }

    fn checksum(&mut self, page_id: PageId) {
        self.checksum_errors += 1;
        let description = format!("Checksum mismatch on page {page_id}");
        self.errors.push(ScrubError { page_id, description });
    }
}

/// A single integrity error detected during scrubbing.
#[derive(Debug, Clone)]
pub struct ScrubError {
    /// The page where the error was detected.
    pub page_id: PageId,
    /// Human-readable description of the error.
    pub description: String,
}

/// Key range a subtree must stay inside: `lower <= key < upper`.
#[derive(Clone)]
struct Bounds {
    lower: Option<Vec<u8>>,
    upper: Option<Vec<u8>>,
}

impl Bounds {
    fn contains(&self, key: &[u8]) -> bool {
        self.lower.as_deref().is_none_or(|lower| key >= lower)
            && self.upper.as_deref().is_none_or(|upper| key < upper)
    }
}

/// Mutable state of one scrub pass.
struct Walk {
    result: ScrubResult,
    seen: HashSet<PageId>,
    leaf_depth: Option<u32>,
}

/// Integrity scrubber for a database.
pub struct IntegrityScrubber<'a, B: StorageBackend> {
    db: &'a Database<B>,
}

impl<'a, B: StorageBackend> IntegrityScrubber<'a, B> {
    /// Creates a scrubber for the given database.
    pub fn new(db: &'a Database<B>) -> Self {
        Self { db }
    }

    /// Scrubs the snapshot pinned by `txn`.
    ///
    /// Pages reachable from a pinned snapshot are never on the allocator's
    /// free list, so any overlap is reported as damage.
    pub fn scrub(&self, txn: &ReadTransaction<'_, B>) -> ScrubResult {
        let mut walk =
            Walk { result: ScrubResult::default(), seen: HashSet::new(), leaf_depth: None };
        let root = Bounds { lower: None, upper: None };
        self.verify_subtree(txn.root_page(), root, 1, &mut walk);
        for &page_id in txn.free_list_pages() {
            if let Some(page) = self.visit(page_id, &mut walk)
                && let Err(e) = freelist::decode_page(&page)
            {
                walk.result.structural(page_id, format!("Bad free-list page {page_id}: {e}"));
            }
        }

        let total_pages = self.db.total_page_count();
        let free: HashSet<PageId> = self.db.free_page_ids().into_iter().collect();
        let mut reachable: Vec<PageId> = walk.seen.iter().copied().collect();
        reachable.sort_unstable();
        for page_id in reachable {
            if free.contains(&page_id) {
                let description = format!("Page {page_id} is reachable and on the free list");
                walk.result.structural(page_id, description);
            }
            if page_id >= total_pages {
                walk.result.structural(
                    page_id,
                    format!("Page {page_id} lies past the page count {total_pages}"),
                );
            }
        }

        walk.result
    }

    /// Reads a page raw, records it as seen, and verifies its checksum.
    fn visit(&self, page_id: PageId, walk: &mut Walk) -> Option<Page> {
        if !walk.seen.insert(page_id) {
            walk.result.structural(page_id, format!("Page {page_id} is referenced twice"));
            return None;
        }
        walk.result.pages_checked += 1;

        match self.db.read_raw_page(page_id) {
            Ok(page) if page.verify_checksum() => Some(page),
            Ok(_) => {
                walk.result.checksum(page_id);
                None
            },
            Err(Error::PageNotFound { .. }) => {
                walk.result.structural(page_id, format!("Page {page_id} was never written"));
                None
            },
            Err(e) => {
                walk.result.structural(page_id, format!("Failed to read page {page_id}: {e}"));
                None
            },
        }
    }

    /// Recursively verifies the subtree rooted at `page_id`.
    fn verify_subtree(&self, page_id: PageId, bounds: Bounds, depth: u32, walk: &mut Walk) {
        let Some(page) = self.visit(page_id, walk) else {
            return;
        };

        match page.page_type() {
            Ok(PageType::BTreeLeaf) => {
                match walk.leaf_depth {
                    None => walk.leaf_depth = Some(depth),
                    Some(expected) if expected != depth => walk.result.structural(
                        page_id,
                        format!("Leaf page {page_id} at depth {depth}, expected {expected}"),
                    ),
                    Some(_) => {},
                }
                self.verify_leaf(&page, &bounds, walk);
            },
            Ok(PageType::BTreeBranch) => self.verify_branch(&page, &bounds, depth, walk),
            Ok(other) => walk
                .result
                .structural(page_id, format!("Unexpected page type {other:?} in B-tree")),
            Err(e) => walk
                .result
                .structural(page_id, format!("Invalid page header on page {page_id}: {e}")),
        }
    }

    /// Verifies leaf key order, bounds, and overflow chains.
    fn verify_leaf(&self, page: &Page, bounds: &Bounds, walk: &mut Walk) {
        let leaf = match LeafNodeRef::from_page(page) {
            Ok(leaf) => leaf,
            Err(e) => {
                walk.result.structural(page.id, format!("Cannot parse leaf page {}: {e}", page.id));
                return;
            },
        };

        let mut prev: Option<&[u8]> = None;
        for i in 0..leaf.cell_count() {
            let (key, value) = match leaf.get(i) {
                Ok(cell) => cell,
                Err(e) => {
                    let description = format!("Bad cell {i} in leaf {}: {e}", page.id);
                    walk.result.structural(page.id, description);
                    return;
                },
            };
            if prev.is_some_and(|p| p >= key) {
                walk.result.structural(
                    page.id,
                    format!(
                        "Key ordering violation in leaf page {}: key[{}] >= key[{i}]",
                        page.id,
                        i - 1
                    ),
                );
                // One ordering error per page.
                return;
            }
            if !bounds.contains(key) {
                walk.result.structural(
                    page.id,
                    format!("Key {i} of leaf page {} lies outside its parent's range", page.id),
                );
            }
            if let CellValue::Overflow { first_page, len } = value {
                self.verify_overflow(first_page, len, walk);
            }
            prev = Some(key);
        }
    }

    /// Verifies an overflow chain's pages, links, and total length.
    fn verify_overflow(&self, first_page: PageId, len: u64, walk: &mut Walk) {
        let page_size = self.db.config().page_size;
        let page_count = self.db.total_page_count();
        let run = match overflow::chain_pages(first_page, len, page_size, page_count) {
            Ok(run) => run,
            Err(e) => {
                walk.result.structural(first_page, e.to_string());
                return;
            },
        };
        let expected_pages = run.end - run.start;
        let mut total = 0u64;
        let mut page_id = first_page;

        for position in 0..expected_pages {
            let Some(page) = self.visit(page_id, walk) else {
                return;
            };
            let next = match overflow::decode_page(&page) {
                Ok((chunk, next)) => {
                    total += chunk.len() as u64;
                    next
                },
                Err(e) => {
                    walk.result.structural(page_id, format!("Bad overflow page {page_id}: {e}"));
                    return;
                },
            };
            let last = position + 1 == expected_pages;
            if last != (next == 0) {
                walk.result.structural(
                    page_id,
                    format!("Overflow chain at {first_page} breaks at page {page_id}"),
                );
                return;
            }
            page_id = next;
        }

        if total != len {
            walk.result.structural(
                first_page,
                format!("Overflow chain at {first_page} holds {total} bytes, expected {len}"),
            );
        }
    }

    /// Verifies separator order and bounds, then recurses into children.
    fn verify_branch(&self, page: &Page, bounds: &Bounds, depth: u32, walk: &mut Walk) {
        let branch = match BranchNodeRef::from_page(page) {
            Ok(branch) => branch,
            Err(e) => {
                let description = format!("Cannot parse branch page {}: {e}", page.id);
                walk.result.structural(page.id, description);
                return;
            },
        };

        let count = branch.cell_count();
        let mut separators = Vec::with_capacity(count);
        for i in 0..count {
            match branch.key(i) {
                Ok(key) => separators.push(key.to_vec()),
                Err(e) => {
                    let description = format!("Bad separator {i} in {}: {e}", page.id);
                    walk.result.structural(page.id, description);
                    return;
                },
            }
        }

        if let Some(i) = separators.windows(2).position(|pair| pair[0] >= pair[1]) {
            walk.result.structural(
                page.id,
                format!(
                    "Separator ordering violation in branch page {}: key[{i}] >= key[{}]",
                    page.id,
                    i + 1
                ),
            );
            return;
        }
        if separators.iter().any(|key| !bounds.contains(key)) {
            walk.result.structural(
                page.id,
                format!("Separator of branch page {} lies outside its parent's range", page.id),
            );
        }

        for i in 0..=count {
            let child = match branch.child(i) {
                Ok(child) => child,
                Err(e) => {
                    walk.result.structural(page.id, format!("Bad child {i} in {}: {e}", page.id));
                    continue;
                },
            };
            let child_bounds = Bounds {
                lower: if i == 0 { bounds.lower.clone() } else { Some(separators[i - 1].clone()) },
                upper: if i == count { bounds.upper.clone() } else { Some(separators[i].clone()) },
            };
            self.verify_subtree(child, child_bounds, depth + 1, walk);
        }
    }
}
