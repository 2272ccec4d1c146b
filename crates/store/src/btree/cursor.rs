//! B-tree cursor for successor lookups and ordered scans.
//!
//! Leaves carry no sibling pointers: a sibling link would have to be rewritten
//! on every copy-on-write of its neighbor. The cursor instead keeps the path
//! from the root as a stack of `(branch page, child index)` pairs and climbs
//! that stack to reach the next leaf.

use super::{
    PageReader,
    node::{BranchNodeRef, CellValue, LeafNodeRef},
    overflow,
};
use crate::{
    error::{Error, PageId, PageType, Result},
    page::Page,
};

/// Stack entry for tracking position during tree traversal.
#[derive(Debug, Clone)]
struct StackEntry {
    /// The branch page.
    page: Page,
    /// Index of the child currently descended into.
    child_index: usize,
}

/// Cursor positioned on a leaf entry, or past the end of the tree.
pub struct Cursor<'a, P: PageReader + ?Sized> {
    provider: &'a P,
    stack: Vec<StackEntry>,
    leaf: Option<Page>,
    leaf_index: usize,
}

impl<'a, P: PageReader + ?Sized> Cursor<'a, P> {
    /// Creates an unpositioned cursor.
    pub fn new(provider: &'a P) -> Self {
        Self { provider, stack: Vec::new(), leaf: None, leaf_index: 0 }
    }

    /// Checks if the cursor is positioned on an entry.
    pub fn is_valid(&self) -> bool {
        self.leaf.is_some()
    }

    /// Positions the cursor on the first entry of the tree rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if a page read fails or a page has the wrong type.
    pub fn first(&mut self, root: PageId) -> Result<()> {
        self.stack.clear();
        self.descend_leftmost(root)?;
        self.settle()
    }

    /// Positions the cursor on the first entry with key `>= key`.
    ///
    /// # Errors
    ///
    /// Returns an error if a page read fails or a page has the wrong type.
    pub fn seek(&mut self, root: PageId, key: &[u8]) -> Result<()> {
        self.stack.clear();
        let mut page_id = root;
        loop {
            let page = self.provider.read_page(page_id)?;
            match page.page_type()? {
                PageType::BTreeLeaf => {
                    self.leaf_index = LeafNodeRef::from_page(&page)?.search(key)?.index();
                    self.leaf = Some(page);
                    return self.settle();
                },
                PageType::BTreeBranch => {
                    let branch = BranchNodeRef::from_page(&page)?;
                    let child_index = branch.child_index_for(key)?;
                    page_id = branch.child(child_index)?;
                    self.stack.push(StackEntry { page, child_index });
                },
                found => {
                    return Err(Error::PageTypeMismatch { expected: PageType::BTreeLeaf, found });
                },
            }
        }
    }

    /// Returns the key and value at the cursor, reading overflow chains.
    ///
    /// # Errors
    ///
    /// Returns an error if the cell or its overflow chain is corrupted.
    pub fn current(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let Some(page) = &self.leaf else {
            return Ok(None);
        };
        let leaf = LeafNodeRef::from_page(page)?;
        let (key, value) = leaf.get(self.leaf_index)?;
        let value = match value {
            CellValue::Inline(bytes) => bytes.to_vec(),
            CellValue::Overflow { first_page, len } => {
                overflow::read_chain(self.provider, first_page, len)?
            },
        };
        Ok(Some((key.to_vec(), value)))
    }

    /// Moves to the next entry in key order.
    ///
    /// # Errors
    ///
    /// Returns an error if a page read fails.
    pub fn advance(&mut self) -> Result<()> {
        if self.leaf.is_some() {
            self.leaf_index += 1;
            self.settle()?;
        }
        Ok(())
    }

    /// Walks forward until the cursor rests on an entry or the tree ends.
    fn settle(&mut self) -> Result<()> {
        while let Some(page) = &self.leaf {
            if self.leaf_index < LeafNodeRef::from_page(page)?.cell_count() {
                return Ok(());
            }
            self.next_leaf()?;
        }
        Ok(())
    }

    /// Climbs to the nearest ancestor with an unvisited child and descends to
    /// that child's leftmost leaf.
    fn next_leaf(&mut self) -> Result<()> {
        while let Some(mut entry) = self.stack.pop() {
            let branch = BranchNodeRef::from_page(&entry.page)?;
            if entry.child_index < branch.cell_count() {
                entry.child_index += 1;
                let child = branch.child(entry.child_index)?;
                self.stack.push(entry);
                return self.descend_leftmost(child);
            }
        }
        self.leaf = None;
        Ok(())
    }

    fn descend_leftmost(&mut self, mut page_id: PageId) -> Result<()> {
        loop {
            let page = self.provider.read_page(page_id)?;
            match page.page_type()? {
                PageType::BTreeLeaf => {
                    self.leaf = Some(page);
                    self.leaf_index = 0;
                    return Ok(());
                },
                PageType::BTreeBranch => {
                    page_id = BranchNodeRef::from_page(&page)?.child(0)?;
                    self.stack.push(StackEntry { page, child_index: 0 });
                },
                found => {
                    return Err(Error::PageTypeMismatch { expected: PageType::BTreeLeaf, found });
                },
            }
        }
    }
}

/// Iterator over B-tree entries in ascending key order.
///
/// Created by [`BTree::iter`](super::BTree::iter).
pub struct BTreeIterator<'a, P: PageReader + ?Sized> {
    cursor: Cursor<'a, P>,
    failed: bool,
}

impl<'a, P: PageReader + ?Sized> BTreeIterator<'a, P> {
    pub(super) fn new(cursor: Cursor<'a, P>) -> Self {
        Self { cursor, failed: false }
    }
}

impl<P: PageReader + ?Sized> Iterator for BTreeIterator<'_, P> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let step = self.cursor.current().and_then(|entry| {
            if entry.is_some() {
                self.cursor.advance()?;
            }
            Ok(entry)
        });
        match step {
            Ok(entry) => entry.map(Ok),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::btree::{BTree, tests::TestPageProvider};

    fn tree_with(keys: impl IntoIterator<Item = u32>) -> BTree<TestPageProvider> {
        let mut tree = BTree::create(TestPageProvider::with_page_size(512)).unwrap();
        for k in keys {
            tree.insert(format!("key{k:05}").as_bytes(), b"v").unwrap();
        }
        tree
    }

    #[test]
    fn test_seek_across_leaf_boundaries() {
        let tree = tree_with((0..400).map(|k| k * 2));
        assert!(tree.depth().unwrap() >= 2);

        for probe in [0u32, 1, 101, 399, 797] {
            let mut cursor = Cursor::new(tree.provider());
            cursor.seek(tree.root_page(), format!("key{probe:05}").as_bytes()).unwrap();
            let (key, _) = cursor.current().unwrap().unwrap();
            let expected = probe.div_ceil(2) * 2;
            assert_eq!(key, format!("key{expected:05}").into_bytes());
        }
    }

    #[test]
    fn test_seek_past_end() {
        let tree = tree_with(0..50);
        let mut cursor = Cursor::new(tree.provider());
        cursor.seek(tree.root_page(), b"zzz").unwrap();
        assert!(!cursor.is_valid());
        assert!(cursor.current().unwrap().is_none());
    }

    #[test]
    fn test_advance_visits_every_leaf() {
        let tree = tree_with((0..600).rev());
        let mut cursor = Cursor::new(tree.provider());
        cursor.first(tree.root_page()).unwrap();

        let mut seen = 0u32;
        while let Some((key, _)) = cursor.current().unwrap() {
            assert_eq!(key, format!("key{seen:05}").into_bytes());
            seen += 1;
            cursor.advance().unwrap();
        }
        assert_eq!(seen, 600);
    }

    #[test]
    fn test_empty_tree_cursor() {
        let tree = tree_with(std::iter::empty());
        let mut cursor = Cursor::new(tree.provider());
        cursor.first(tree.root_page()).unwrap();
        assert!(!cursor.is_valid());
    }
}
