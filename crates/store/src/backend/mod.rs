//! Storage backend abstraction for the store engine.
//!
//! The backend trait abstracts the underlying storage mechanism,
//! allowing both file-based (production) and in-memory (testing) implementations.
//!
//! # Crash Safety: Alternating Meta Pages
//!
//! The file is a flat array of pages. Pages 0 and 1 each hold a [`MetaRecord`]:
//! - A commit writes every new page first, syncs, then writes its meta record
//!   into the slot that is NOT current, then syncs again.
//! - On open both slots are read; the valid record with the higher `txn_id`
//!   is current.
//!
//! A crash before the second sync leaves the previous record intact in the
//! other slot, so there is always one valid meta record to recover from.

mod file;
mod memory;

pub use file::FileBackend;
pub use memory::InMemoryBackend;

use crate::{
    config::validate_page_size,
    error::{Error, PageId, PageType, Result},
    page::{PAGE_HEADER_SIZE, Page, read_u16, read_u32, read_u64, write_u16, write_u32, write_u64},
};

/// Magic number for kvs store files.
pub const MAGIC: &[u8; 8] = b"KVSTORE\0";

/// Current format version.
pub const FORMAT_VERSION: u16 = 1;

/// Number of meta pages at the start of the file.
pub const META_PAGE_COUNT: u64 = 2;

/// Bytes needed from the start of a meta page to decode its record.
pub const META_PREFIX_SIZE: usize = PAGE_HEADER_SIZE + MetaRecord::SIZE;

/// Storage backend trait for abstracting file I/O.
pub trait StorageBackend: Send + Sync {
    /// Reads a page by its ID. Pages past the end of storage read as zeros.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the read fails.
    fn read_page(&self, page_id: PageId) -> Result<Vec<u8>>;

    /// Writes a page at the given ID, growing storage as needed.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the write fails, `Error::OutOfSpace` if the medium is full,
    /// or `Error::Corrupted` if the data size does not match the page size.
    fn write_page(&self, page_id: PageId, data: &[u8]) -> Result<()>;

    /// Flushes all writes to durable storage.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the sync fails.
    fn sync(&self) -> Result<()>;

    /// Returns the current storage size in bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the metadata query fails.
    fn file_size(&self) -> Result<u64>;

    /// Returns the page size for this backend.
    fn page_size(&self) -> usize;

    /// Calculates the byte offset for a page ID.
    fn page_offset(&self, page_id: PageId) -> u64 {
        page_id * self.page_size() as u64
    }
}

/// The root pointer of one committed state.
///
/// # Layout (64 bytes, at offset 16 of a meta page)
///
/// ```text
/// Offset  Size   Field
/// ------  ----   -----
/// 0       8      Magic "KVSTORE\0"
/// 8       2      Format version
/// 10      2      Reserved
/// 12      4      Page size
/// 16      8      Transaction ID (sequence number)
/// 24      8      Root page
/// 32      8      First free-list page (0 = empty free list)
/// 40      8      Page count (high-water mark)
/// 48      8      Last write timestamp (Unix seconds)
/// 56      8      XXH3-64 of bytes 0..56
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaRecord {
    /// Page size of the file.
    pub page_size: u32,
    /// Transaction that published this record.
    pub txn_id: u64,
    /// Root page of the B-tree.
    pub root_page: PageId,
    /// First page of the persisted free list (0 = none).
    pub free_list_page: PageId,
    /// Number of pages in use, including free ones.
    pub page_count: u64,
    /// Timestamp of the commit (Unix epoch seconds).
    pub last_write_timestamp: u64,
}

impl MetaRecord {
    /// Size of a meta record on disk.
    pub const SIZE: usize = 64;

    const CHECKSUMMED_SIZE: usize = 56;

    /// Serializes the record to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(MAGIC);
        write_u16(&mut buf, 8, FORMAT_VERSION);
        write_u32(&mut buf, 12, self.page_size);
        write_u64(&mut buf, 16, self.txn_id);
        write_u64(&mut buf, 24, self.root_page);
        write_u64(&mut buf, 32, self.free_list_page);
        write_u64(&mut buf, 40, self.page_count);
        write_u64(&mut buf, 48, self.last_write_timestamp);

        let checksum = xxhash_rust::xxh3::xxh3_64(&buf[..Self::CHECKSUMMED_SIZE]);
        write_u64(&mut buf, Self::CHECKSUMMED_SIZE, checksum);
        buf
    }

    /// Deserializes and validates a record.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidMagic` if the magic does not match,
    /// `Error::Corrupted` if the checksum fails or the page size is invalid, and
    /// `Error::UnsupportedVersion` for newer formats.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(Error::Corrupted { reason: "Meta record too short".to_string() });
        }
        if &buf[0..8] != MAGIC {
            return Err(Error::InvalidMagic);
        }

        let stored = read_u64(buf, Self::CHECKSUMMED_SIZE);
        if stored != xxhash_rust::xxh3::xxh3_64(&buf[..Self::CHECKSUMMED_SIZE]) {
            return Err(Error::Corrupted { reason: "Meta record checksum mismatch".to_string() });
        }

        let version = read_u16(buf, 8);
        if version > FORMAT_VERSION {
            return Err(Error::UnsupportedVersion { version });
        }

        let page_size = read_u32(buf, 12);
        validate_page_size(page_size as usize).map_err(|_| Error::Corrupted {
            reason: format!("Meta record has invalid page size {page_size}"),
        })?;

        Ok(Self {
            page_size,
            txn_id: read_u64(buf, 16),
            root_page: read_u64(buf, 24),
            free_list_page: read_u64(buf, 32),
            page_count: read_u64(buf, 40),
            last_write_timestamp: read_u64(buf, 48),
        })
    }

    /// Renders the record as a full meta page for `slot`.
    pub fn to_page(&self, slot: PageId) -> Page {
        let mut page = Page::new(slot, self.page_size as usize, PageType::Meta, self.txn_id);
        page.data[PAGE_HEADER_SIZE..META_PREFIX_SIZE].copy_from_slice(&self.to_bytes());
        page.update_checksum();
        page
    }

    /// Decodes the record stored in a meta page.
    ///
    /// # Errors
    ///
    /// See [`MetaRecord::from_bytes`].
    pub fn from_page(data: &[u8]) -> Result<Self> {
        if data.len() < META_PREFIX_SIZE {
            return Err(Error::Corrupted { reason: "Meta page too short".to_string() });
        }
        Self::from_bytes(&data[PAGE_HEADER_SIZE..META_PREFIX_SIZE])
    }
}

/// Picks the current meta record from the two slots.
///
/// Returns the slot index and record with the higher valid `txn_id`.
///
/// # Errors
///
/// Returns the first slot's error when neither slot holds a valid record.
pub fn choose_meta(slots: [Result<MetaRecord>; 2]) -> Result<(usize, MetaRecord)> {
    let [slot0, slot1] = slots;
    match (slot0, slot1) {
        (Ok(a), Ok(b)) => {
            if b.txn_id > a.txn_id {
                Ok((1, b))
            } else {
                Ok((0, a))
            }
        },
        (Ok(a), Err(_)) => Ok((0, a)),
        (Err(_), Ok(b)) => Ok((1, b)),
        (Err(e), Err(_)) => Err(e),
    }
}
