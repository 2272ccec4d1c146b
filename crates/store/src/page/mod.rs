//! Page management for the store engine.
//!
//! This module handles:
//! - Page layout and header encoding
//! - Page allocation (free list)
//! - Page caching (clock eviction)
//! - Free-list persistence pages
//! - Checksum computation and verification

mod allocator;
mod cache;
pub(crate) mod freelist;

pub use allocator::PageAllocator;
pub use cache::PageCache;

use crate::error::{Error, PageId, PageType, Result};

/// Page header size in bytes.
pub const PAGE_HEADER_SIZE: usize = 16;

/// Page header structure (16 bytes).
///
/// ```text
/// Offset  Size   Field
/// ------  ----   -----
/// 0       1      Page type (PageType enum)
/// 1       1      Flags (reserved)
/// 2       2      Item count (cells, ids, or chunk length)
/// 4       4      Checksum (XXH3-64 of content after header, truncated)
/// 8       8      Transaction ID that wrote this page
/// ```
#[derive(Debug, Clone, Copy)]
pub struct PageHeader {
    /// Page type.
    pub page_type: PageType,
    /// Flags (reserved for future use).
    pub flags: u8,
    /// Number of items in this page.
    pub item_count: u16,
    /// XXH3-64 checksum (truncated to 32 bits) of page content (bytes after header).
    pub checksum: u32,
    /// Transaction ID that wrote this page.
    pub txn_id: u64,
}

impl PageHeader {
    /// Creates a new page header.
    pub fn new(page_type: PageType, txn_id: u64) -> Self {
        Self { page_type, flags: 0, item_count: 0, checksum: 0, txn_id }
    }

    /// Serializes header to bytes.
    pub fn to_bytes(&self) -> [u8; PAGE_HEADER_SIZE] {
        let mut buf = [0u8; PAGE_HEADER_SIZE];
        buf[0] = self.page_type as u8;
        buf[1] = self.flags;
        write_u16(&mut buf, 2, self.item_count);
        write_u32(&mut buf, 4, self.checksum);
        write_u64(&mut buf, 8, self.txn_id);
        buf
    }

    /// Deserializes header from bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the buffer is shorter than [`PAGE_HEADER_SIZE`]
    /// or the page type byte is invalid.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < PAGE_HEADER_SIZE {
            return Err(Error::Corrupted { reason: "Page header too short".to_string() });
        }

        Ok(Self {
            page_type: PageType::try_from(buf[0])?,
            flags: buf[1],
            item_count: read_u16(buf, 2),
            checksum: read_u32(buf, 4),
            txn_id: read_u64(buf, 8),
        })
    }
}

/// A page of data with header and content.
#[derive(Clone)]
pub struct Page {
    /// Page ID (position in file).
    pub id: PageId,
    /// Raw page data including header.
    pub data: Vec<u8>,
}

impl Page {
    /// Creates a new empty page.
    pub fn new(id: PageId, page_size: usize, page_type: PageType, txn_id: u64) -> Self {
        let mut data = vec![0u8; page_size];
        let header = PageHeader::new(page_type, txn_id);
        data[..PAGE_HEADER_SIZE].copy_from_slice(&header.to_bytes());

        Self { id, data }
    }

    /// Creates a page from raw bytes read from storage.
    pub fn from_bytes(id: PageId, data: Vec<u8>) -> Self {
        Self { id, data }
    }

    /// Returns the page header.
    ///
    /// # Errors
    ///
    /// Returns an error if the header bytes are corrupted or the page type is invalid.
    pub fn header(&self) -> Result<PageHeader> {
        PageHeader::from_bytes(&self.data)
    }

    /// Returns the page type.
    ///
    /// # Errors
    ///
    /// Returns an error if the page type byte is invalid.
    pub fn page_type(&self) -> Result<PageType> {
        Ok(self.header()?.page_type)
    }

    /// Checks that this page has the expected type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PageTypeMismatch`] when the types differ.
    pub fn expect_type(&self, expected: PageType) -> Result<()> {
        let found = self.page_type()?;
        if found != expected {
            return Err(Error::PageTypeMismatch { expected, found });
        }
        Ok(())
    }

    /// Returns the item count.
    pub fn item_count(&self) -> u16 {
        read_u16(&self.data, 2)
    }

    /// Sets the item count.
    pub fn set_item_count(&mut self, count: u16) {
        write_u16(&mut self.data, 2, count);
    }

    /// Returns the ID of the transaction that wrote this page.
    pub fn txn_id(&self) -> u64 {
        read_u64(&self.data, 8)
    }

    /// Stamps the page with the writing transaction's ID.
    pub fn set_txn_id(&mut self, txn_id: u64) {
        write_u64(&mut self.data, 8, txn_id);
    }

    /// Returns the content portion of the page (after header).
    pub fn content(&self) -> &[u8] {
        &self.data[PAGE_HEADER_SIZE..]
    }

    /// Returns mutable content portion.
    pub fn content_mut(&mut self) -> &mut [u8] {
        &mut self.data[PAGE_HEADER_SIZE..]
    }

    /// Computes and updates the checksum using XXH3-64 (truncated to 32 bits).
    pub fn update_checksum(&mut self) {
        let checksum = compute_checksum(&self.data);
        write_u32(&mut self.data, 4, checksum);
    }

    /// Verifies the page checksum.
    pub fn verify_checksum(&self) -> bool {
        read_u32(&self.data, 4) == compute_checksum(&self.data)
    }

    /// Returns the page size.
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("id", &self.id)
            .field("size", &self.data.len())
            .field("header", &self.header())
            .finish()
    }
}

fn compute_checksum(data: &[u8]) -> u32 {
    // Truncation to 32 bits is part of the on-disk format.
    xxhash_rust::xxh3::xxh3_64(&data[PAGE_HEADER_SIZE..]) as u32
}

// ============================================================================
// Little-endian field helpers
// ============================================================================

pub(crate) fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

pub(crate) fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

pub(crate) fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

pub(crate) fn write_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn write_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::config::MIN_PAGE_SIZE;

    #[test]
    fn test_fresh_page_layout() {
        let page = Page::new(5, MIN_PAGE_SIZE, PageType::FreeList, 11);

        assert_eq!(page.size(), MIN_PAGE_SIZE);
        assert_eq!(page.content().len(), MIN_PAGE_SIZE - PAGE_HEADER_SIZE);
        assert_eq!(page.data[0], PageType::FreeList as u8);
        assert_eq!(page.item_count(), 0);
        assert_eq!(page.txn_id(), 11);
        assert!(page.content().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_header_fields_are_little_endian() {
        let mut page = Page::new(2, MIN_PAGE_SIZE, PageType::BTreeLeaf, 0x0102_0304_0506_0708);
        page.set_item_count(0x0A0B);

        assert_eq!(&page.data[2..4], &[0x0B, 0x0A]);
        assert_eq!(&page.data[8..16], &[0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);

        let header = page.header().unwrap();
        assert_eq!(header.item_count, 0x0A0B);
        assert_eq!(header.txn_id, 0x0102_0304_0506_0708);
    }

    #[test]
    fn test_checksum_detects_content_damage() {
        let mut page = Page::new(3, MIN_PAGE_SIZE, PageType::Overflow, 1);
        page.content_mut()[..5].copy_from_slice(b"hello");
        page.update_checksum();
        assert!(page.verify_checksum());

        let last = page.size() - 1;
        page.data[last] ^= 0x01;
        assert!(!page.verify_checksum());

        page.data[last] ^= 0x01;
        assert!(page.verify_checksum());
    }

    #[test]
    fn test_restamping_keeps_content_checksum() {
        let mut page = Page::new(4, MIN_PAGE_SIZE, PageType::BTreeBranch, 1);
        page.content_mut()[0] = 0x7F;
        page.update_checksum();

        page.set_txn_id(2);
        assert!(page.verify_checksum());
        assert_eq!(page.header().unwrap().txn_id, 2);
    }

    #[test]
    fn test_unknown_page_type_is_corruption() {
        let mut page = Page::new(6, MIN_PAGE_SIZE, PageType::BTreeLeaf, 1);
        page.data[0] = 0xEE;

        assert!(matches!(page.header(), Err(Error::Corrupted { .. })));
        assert!(matches!(page.expect_type(PageType::BTreeLeaf), Err(Error::Corrupted { .. })));
    }

    #[test]
    fn test_truncated_header_is_rejected() {
        let short = [PageType::Meta as u8; PAGE_HEADER_SIZE - 1];
        let err = PageHeader::from_bytes(&short).unwrap_err();
        assert!(matches!(err, Error::Corrupted { .. }));
    }

    #[test]
    fn test_expect_type_reports_both_types() {
        let page = Page::new(1, MIN_PAGE_SIZE, PageType::Overflow, 1);
        page.expect_type(PageType::Overflow).unwrap();

        match page.expect_type(PageType::BTreeBranch) {
            Err(Error::PageTypeMismatch { expected, found }) => {
                assert_eq!(expected, PageType::BTreeBranch);
                assert_eq!(found, PageType::Overflow);
            },
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
