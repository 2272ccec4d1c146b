//! Overflow chains for values too large to store inline.
//!
//! A chain is a run of contiguous [`PageType::Overflow`] pages:
//!
//! ```text
//! [PageHeader: 16 bytes]
//! [next: u64]        0 terminates the chain
//! [chunk_len: u32]
//! [data: chunk_len bytes]
//! ```
//!
//! Chains are written once and never modified. Replacing or deleting a value
//! frees its chain and, for a replacement, writes a new one.

use std::ops::Range;

use super::{PageProvider, PageReader};
use crate::{
    error::{Error, PageId, PageType, Result},
    page::{PAGE_HEADER_SIZE, Page, read_u32, read_u64, write_u32, write_u64},
};

const NEXT_OFFSET: usize = PAGE_HEADER_SIZE;
const LEN_OFFSET: usize = PAGE_HEADER_SIZE + 8;
const DATA_OFFSET: usize = PAGE_HEADER_SIZE + 12;

/// Value bytes carried by one overflow page.
pub fn chunk_capacity(page_size: usize) -> usize {
    page_size - DATA_OFFSET
}

/// Number of overflow pages needed for `len` bytes.
pub fn pages_for(len: u64, page_size: usize) -> u64 {
    len.div_ceil(chunk_capacity(page_size) as u64)
}

/// Returns the page run of the chain at `first_page` holding `len` bytes.
///
/// The run comes from an on-disk reference, so it is checked against the
/// file's `page_count` before anything is read, allocated, or freed.
///
/// # Errors
///
/// Returns [`Error::Corrupted`] if the run does not fit inside the file.
pub fn chain_pages(
    first_page: PageId,
    len: u64,
    page_size: usize,
    page_count: PageId,
) -> Result<Range<PageId>> {
    let count = pages_for(len, page_size).max(1);
    match first_page.checked_add(count) {
        Some(end) if first_page != 0 && end <= page_count => Ok(first_page..end),
        _ => Err(Error::Corrupted {
            reason: format!(
                "Overflow chain at {first_page} of {len} bytes runs past page {page_count}"
            ),
        }),
    }
}

/// Writes `value` to a newly allocated chain and returns its first page.
///
/// # Errors
///
/// Returns [`Error::OutOfSpace`] if the run cannot be allocated.
pub fn write_chain<P: PageProvider>(provider: &mut P, value: &[u8]) -> Result<PageId> {
    let page_size = provider.page_size();
    let chunk = chunk_capacity(page_size);
    let count = value.chunks(chunk).count().max(1);
    let first = provider.allocate_run(count)?;

    for (i, data) in value.chunks(chunk).enumerate() {
        let page_id = first + i as u64;
        let mut page = Page::new(page_id, page_size, PageType::Overflow, provider.txn_id());
        let next = if i + 1 < count { page_id + 1 } else { 0 };
        write_u64(&mut page.data, NEXT_OFFSET, next);
        write_u32(&mut page.data, LEN_OFFSET, data.len() as u32);
        page.data[DATA_OFFSET..DATA_OFFSET + data.len()].copy_from_slice(data);
        provider.write_page(page);
    }
    Ok(first)
}

/// Decodes one overflow page into its data chunk and next pointer.
///
/// # Errors
///
/// Returns [`Error::PageTypeMismatch`] or [`Error::Corrupted`] for a page
/// that is not a well-formed overflow page.
pub fn decode_page(page: &Page) -> Result<(&[u8], PageId)> {
    page.expect_type(PageType::Overflow)?;
    let len = read_u32(&page.data, LEN_OFFSET) as usize;
    if len > chunk_capacity(page.size()) {
        return Err(Error::Corrupted {
            reason: format!("Overflow page {} claims {len} bytes", page.id),
        });
    }
    Ok((&page.data[DATA_OFFSET..DATA_OFFSET + len], read_u64(&page.data, NEXT_OFFSET)))
}

/// Reads a whole chain of `len` bytes starting at `first_page`.
///
/// # Errors
///
/// Returns [`Error::Corrupted`] if the chain ends early, runs long, or loops.
pub fn read_chain<P: PageReader + ?Sized>(
    provider: &P,
    first_page: PageId,
    len: u64,
) -> Result<Vec<u8>> {
    let run = chain_pages(first_page, len, provider.page_size(), provider.page_count())?;
    let expected_pages = run.end - run.start;
    let capacity = usize::try_from(len).map_err(|_| Error::Corrupted {
        reason: format!("Overflow chain at {first_page} is too long to load: {len} bytes"),
    })?;
    let mut value = Vec::with_capacity(capacity);
    let mut page_id = first_page;
    let mut visited = 0u64;

    while page_id != 0 {
        visited += 1;
        if visited > expected_pages {
            return Err(Error::Corrupted {
                reason: format!("Overflow chain at {first_page} is longer than {len} bytes"),
            });
        }
        let page = provider.read_page(page_id)?;
        let (chunk, next) = decode_page(&page)?;
        value.extend_from_slice(chunk);
        page_id = next;
    }

    if value.len() as u64 != len {
        return Err(Error::Corrupted {
            reason: format!(
                "Overflow chain at {first_page} holds {} bytes, expected {len}",
                value.len()
            ),
        });
    }
    Ok(value)
}

/// Frees every page of the chain at `first_page`.
///
/// Chains are allocated as contiguous runs, so the page IDs follow from the
/// length without reading the chain.
///
/// # Errors
///
/// Returns [`Error::Corrupted`] if the run does not fit inside the file, in
/// which case nothing is freed.
pub fn free_chain<P: PageProvider>(
    provider: &mut P,
    first_page: PageId,
    len: u64,
) -> Result<()> {
    let run = chain_pages(first_page, len, provider.page_size(), provider.page_count())?;
    for page_id in run {
        provider.free_page(page_id);
    }
    Ok(())
}
