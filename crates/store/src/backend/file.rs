//! File-based storage backend using position-based I/O (`pread`/`pwrite`).
//!
//! On Unix, reads are lock-free via [`std::os::unix::fs::FileExt`]:
//! `read_exact_at()` takes `&self` and never touches the file cursor, allowing
//! concurrent reads from multiple threads with zero synchronization.
//!
//! Writes are serialized via a [`parking_lot::Mutex`] guard (a unit `()`
//! sentinel, not wrapping the `File`) so file extension and page writes never
//! interleave.

#[cfg(unix)]
use std::os::unix::fs::{FileExt, OpenOptionsExt};
#[cfg(windows)]
use std::os::windows::fs::FileExt;
use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
};

use parking_lot::Mutex;
use tracing::debug;

use super::{META_PREFIX_SIZE, MetaRecord, StorageBackend};
use crate::{
    config::{MAX_PAGE_SIZE, MIN_PAGE_SIZE, StoreConfig},
    error::{Error, PageId, Result},
    lock::FileLock,
};

/// Permission bits for newly created store files.
pub const FILE_MODE: u32 = 0o640;

/// File-based storage backend.
///
/// Holds an exclusive advisory lock on the file for its whole lifetime; the
/// lock is released when the backend is dropped. Durability requires the caller
/// to invoke [`sync`](StorageBackend::sync) after writes.
pub struct FileBackend {
    /// The underlying file handle.
    file: File,
    /// Serializes writes and file extension.
    write_lock: Mutex<()>,
    /// Page size in bytes.
    page_size: usize,
    /// Path of the store file.
    path: PathBuf,
    /// Exclusive lock on `file`, held until the backend is dropped.
    _lock: FileLock,
}

impl FileBackend {
    /// Opens or creates the store file at `path` and locks it.
    ///
    /// A new file is created with mode `0o640`. For an existing file the page
    /// size is read from its meta pages; `config.page_size` applies only to
    /// new files.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] if another holder keeps the lock past
    /// `config.lock_timeout`, or [`Error::Io`] if the file cannot be opened.
    pub fn open(path: impl AsRef<Path>, config: &StoreConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true).truncate(false);
        #[cfg(unix)]
        options.mode(FILE_MODE);
        let file = options.open(&path)?;

        let lock = FileLock::acquire(&file, &path, config.lock_timeout)?;

        let page_size = detect_page_size(&file)?.unwrap_or(config.page_size);
        debug!(path = %path.display(), page_size, "Opened store file");

        Ok(Self { file, write_lock: Mutex::new(()), page_size, path, _lock: lock })
    }

    /// Returns the path of the store file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Finds the page size recorded in either meta page.
///
/// Slot 0 sits at offset 0 for every page size. If it is unreadable, slot 1 is
/// probed at each supported page size.
fn detect_page_size(file: &File) -> Result<Option<usize>> {
    let len = file.metadata()?.len();
    let mut buf = [0u8; META_PREFIX_SIZE];

    if len >= META_PREFIX_SIZE as u64 {
        read_exact_at_offset(file, &mut buf, 0)?;
        if let Ok(meta) = MetaRecord::from_page(&buf) {
            return Ok(Some(meta.page_size as usize));
        }
    }

    let mut candidate = MIN_PAGE_SIZE;
    while candidate <= MAX_PAGE_SIZE {
        if len >= (candidate + META_PREFIX_SIZE) as u64 {
            read_exact_at_offset(file, &mut buf, candidate as u64)?;
            if let Ok(meta) = MetaRecord::from_page(&buf)
                && meta.page_size as usize == candidate
            {
                return Ok(Some(candidate));
            }
        }
        candidate *= 2;
    }
    Ok(None)
}

impl StorageBackend for FileBackend {
    fn read_page(&self, page_id: PageId) -> Result<Vec<u8>> {
        let offset = self.page_offset(page_id);

        let file_len = self.file.metadata()?.len();
        if offset + self.page_size as u64 > file_len {
            return Ok(vec![0u8; self.page_size]);
        }

        let mut buf = vec![0u8; self.page_size];
        read_exact_at_offset(&self.file, &mut buf, offset)?;
        Ok(buf)
    }

    fn write_page(&self, page_id: PageId, data: &[u8]) -> Result<()> {
        if data.len() != self.page_size {
            return Err(Error::Corrupted {
                reason: format!(
                    "Invalid page data size: {} (expected {})",
                    data.len(),
                    self.page_size
                ),
            });
        }

        let offset = self.page_offset(page_id);
        let _guard = self.write_lock.lock();

        let file_len = self.file.metadata()?.len();
        let required_len = offset + self.page_size as u64;
        if file_len < required_len {
            self.file.set_len(required_len)?;
        }

        write_all_at_offset(&self.file, data, offset)
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn file_size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn page_size(&self) -> usize {
        self.page_size
    }
}

// ---------------------------------------------------------------------------
// Platform-specific position-based I/O helpers
// ---------------------------------------------------------------------------

#[cfg(unix)]
fn read_exact_at_offset(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
    file.read_exact_at(buf, offset)?;
    Ok(())
}

/// `seek_read` moves the file cursor; positional reads still never overlap
/// because every caller passes an explicit offset.
#[cfg(windows)]
fn read_exact_at_offset(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
    let mut pos = 0;
    while pos < buf.len() {
        let n = file.seek_read(&mut buf[pos..], offset + pos as u64)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "unexpected end of file during seek_read",
            )
            .into());
        }
        pos += n;
    }
    Ok(())
}

#[cfg(unix)]
fn write_all_at_offset(file: &File, data: &[u8], offset: u64) -> Result<()> {
    file.write_all_at(data, offset)?;
    Ok(())
}

#[cfg(windows)]
fn write_all_at_offset(file: &File, data: &[u8], offset: u64) -> Result<()> {
    let mut pos = 0;
    while pos < data.len() {
        let n = file.seek_write(&data[pos..], offset + pos as u64)?;
        pos += n;
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::sync::Arc;

    use kvs_test_utils::TestDir;

    use super::*;
    use crate::config::DEFAULT_PAGE_SIZE;

    fn config() -> StoreConfig {
        StoreConfig::default()
    }

    #[test]
    fn test_open_creates_file() {
        let dir = TestDir::new();
        let path = dir.store_path();

        let backend = FileBackend::open(&path, &config()).unwrap();
        assert!(path.exists());
        assert_eq!(backend.page_size(), DEFAULT_PAGE_SIZE);
        assert_eq!(backend.file_size().unwrap(), 0);
        assert_eq!(backend.path(), path.as_path());
    }

    #[cfg(unix)]
    #[test]
    fn test_new_file_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TestDir::new();
        let path = dir.join("mode.kvs");
        let _backend = FileBackend::open(&path, &config()).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        // The process umask can only clear bits.
        assert_eq!(mode & !FILE_MODE, 0, "mode {mode:o} exceeds {FILE_MODE:o}");
    }

    #[test]
    fn test_page_read_write() {
        let dir = TestDir::new();
        let backend = FileBackend::open(dir.store_path(), &config()).unwrap();

        let mut data = vec![0u8; DEFAULT_PAGE_SIZE];
        data[0] = 0xDE;
        data[1] = 0xAD;
        data[DEFAULT_PAGE_SIZE - 1] = 0xBE;

        backend.write_page(3, &data).unwrap();
        backend.sync().unwrap();

        let read_data = backend.read_page(3).unwrap();
        assert_eq!(read_data, data);
        assert_eq!(backend.file_size().unwrap(), 4 * DEFAULT_PAGE_SIZE as u64);
    }

    #[test]
    fn test_write_rejects_wrong_size() {
        let dir = TestDir::new();
        let backend = FileBackend::open(dir.store_path(), &config()).unwrap();
        let result = backend.write_page(0, &[0u8; 10]);
        assert!(matches!(result, Err(Error::Corrupted { .. })));
    }

    #[test]
    fn test_read_beyond_file_returns_zeros() {
        let dir = TestDir::new();
        let backend = FileBackend::open(dir.store_path(), &config()).unwrap();

        let data = backend.read_page(999).unwrap();
        assert!(data.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_page_size_detected_from_meta() {
        let dir = TestDir::new();
        let path = dir.store_path();
        let meta = MetaRecord {
            page_size: 1024,
            txn_id: 1,
            root_page: 2,
            free_list_page: 0,
            page_count: 3,
            last_write_timestamp: 0,
        };
        std::fs::write(&path, &meta.to_page(0).data).unwrap();

        let backend = FileBackend::open(&path, &config()).unwrap();
        assert_eq!(backend.page_size(), 1024);
    }

    #[test]
    fn test_page_size_detected_from_slot_one() {
        let dir = TestDir::new();
        let path = dir.store_path();
        let meta = MetaRecord {
            page_size: 2048,
            txn_id: 2,
            root_page: 2,
            free_list_page: 0,
            page_count: 3,
            last_write_timestamp: 0,
        };
        let mut bytes = vec![0u8; 2048];
        bytes.extend_from_slice(&meta.to_page(1).data);
        std::fs::write(&path, &bytes).unwrap();

        let backend = FileBackend::open(&path, &config()).unwrap();
        assert_eq!(backend.page_size(), 2048);
    }

    #[test]
    fn test_second_open_times_out() {
        let dir = TestDir::new();
        let path = dir.store_path();
        let _first = FileBackend::open(&path, &config()).unwrap();

        let result = FileBackend::open(&path, &config());
        assert!(matches!(result, Err(Error::LockTimeout { .. })));
    }

    #[test]
    fn test_multiple_concurrent_readers() {
        let dir = TestDir::new();
        let backend = Arc::new(FileBackend::open(dir.store_path(), &config()).unwrap());

        for page_id in 0u64..8 {
            let mut data = vec![page_id as u8; DEFAULT_PAGE_SIZE];
            data[0] = (page_id + 0x10) as u8;
            backend.write_page(page_id, &data).unwrap();
        }
        backend.sync().unwrap();

        let mut handles = Vec::new();
        for page_id in 0u64..8 {
            let b = Arc::clone(&backend);
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    let data = b.read_page(page_id).unwrap();
                    assert_eq!(data[0], (page_id + 0x10) as u8, "page {page_id} header byte wrong");
                    assert_eq!(data[1], page_id as u8, "page {page_id} body byte wrong");
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }
    }
}
