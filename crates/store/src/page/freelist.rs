//! On-disk free list.
//!
//! The free list is written at every commit as a chain of [`PageType::FreeList`]
//! pages referenced from the meta record:
//!
//! ```text
//! [PageHeader: 16 bytes, item_count = ids in this page]
//! [next: u64]   0 terminates the chain
//! [ids: u64 * item_count]
//! ```

use super::{PAGE_HEADER_SIZE, Page, read_u64, write_u64};
use crate::error::{Error, PageId, PageType, Result};

const NEXT_OFFSET: usize = PAGE_HEADER_SIZE;
const IDS_OFFSET: usize = PAGE_HEADER_SIZE + 8;

/// Number of page IDs that fit in one free-list page.
pub(crate) fn ids_per_page(page_size: usize) -> usize {
    (page_size - IDS_OFFSET) / 8
}

/// Number of free-list pages needed to hold `count` IDs.
pub(crate) fn pages_needed(count: usize, page_size: usize) -> usize {
    count.div_ceil(ids_per_page(page_size))
}

/// Builds the chain of free-list pages stored at `chain` holding `free_ids`.
///
/// `chain` must contain at least `pages_needed(free_ids.len())` page IDs.
/// Trailing pages beyond that hold no IDs but stay linked.
pub(crate) fn build_chain(
    chain: &[PageId],
    free_ids: &[PageId],
    page_size: usize,
    txn_id: u64,
) -> Vec<Page> {
    let per_page = ids_per_page(page_size);
    let mut pages = Vec::with_capacity(chain.len());

    let mut chunks = free_ids.chunks(per_page);

    for (position, &page_id) in chain.iter().enumerate() {
        let ids = chunks.next().unwrap_or(&[]);
        let mut page = Page::new(page_id, page_size, PageType::FreeList, txn_id);
        let next = chain.get(position + 1).copied().unwrap_or(0);
        write_u64(&mut page.data, NEXT_OFFSET, next);
        for (i, &id) in ids.iter().enumerate() {
            write_u64(&mut page.data, IDS_OFFSET + i * 8, id);
        }
        page.set_item_count(ids.len() as u16);
        page.update_checksum();
        pages.push(page);
    }
    pages
}

/// Decodes one free-list page into its IDs and the next page in the chain.
///
/// # Errors
///
/// Returns [`Error::PageTypeMismatch`] for a page of another type or
/// [`Error::Corrupted`] when the count does not fit the page.
pub(crate) fn decode_page(page: &Page) -> Result<(Vec<PageId>, PageId)> {
    page.expect_type(PageType::FreeList)?;
    let count = page.item_count() as usize;
    if count > ids_per_page(page.size()) {
        return Err(Error::Corrupted {
            reason: format!("Free-list page {} claims {count} entries", page.id),
        });
    }

    let ids = (0..count).map(|i| read_u64(&page.data, IDS_OFFSET + i * 8)).collect();
    Ok((ids, read_u64(&page.data, NEXT_OFFSET)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_math() {
        assert_eq!(ids_per_page(512), 61);
        assert_eq!(pages_needed(0, 512), 0);
        assert_eq!(pages_needed(61, 512), 1);
        assert_eq!(pages_needed(62, 512), 2);
    }

    #[test]
    fn test_chain_links_and_contents() {
        let free: Vec<PageId> = (100..230).collect();
        let chain = [7, 8, 20];
        assert_eq!(pages_needed(free.len(), 512), chain.len());

        let pages = build_chain(&chain, &free, 512, 4);
        assert_eq!(pages.len(), 3);

        let mut decoded = Vec::new();
        let mut expected_next = chain.iter().skip(1).copied().chain([0]);
        for page in &pages {
            assert!(page.verify_checksum());
            assert_eq!(page.txn_id(), 4);
            let (ids, next) = decode_page(page).unwrap();
            assert_eq!(next, expected_next.next().unwrap());
            decoded.extend(ids);
        }
        assert_eq!(decoded, free);
    }

    #[test]
    fn test_trailing_page_is_empty_and_linked() {
        let pages = build_chain(&[5, 6], &[40, 41], 512, 2);
        assert_eq!(pages.len(), 2);
        assert_eq!(decode_page(&pages[0]).unwrap(), (vec![40, 41], 6));
        assert_eq!(decode_page(&pages[1]).unwrap(), (vec![], 0));
    }

    #[test]
    fn test_decode_rejects_wrong_type() {
        let page = Page::new(3, 512, PageType::BTreeLeaf, 1);
        assert!(matches!(decode_page(&page), Err(Error::PageTypeMismatch { .. })));
    }

    #[test]
    fn test_decode_rejects_oversized_count() {
        let mut page = Page::new(3, 512, PageType::FreeList, 1);
        page.set_item_count(500);
        assert!(matches!(decode_page(&page), Err(Error::Corrupted { .. })));
    }
}
