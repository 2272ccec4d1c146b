//! Error types for the kvs storage engine.

use std::{io, path::PathBuf, time::Duration};

use snafu::Snafu;

/// Page identifier type.
pub type PageId = u64;

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during store operations.
#[derive(Debug, Snafu)]
pub enum Error {
    /// I/O error from the underlying storage backend.
    #[snafu(display("I/O error: {source}"))]
    Io {
        /// The underlying I/O error.
        source: io::Error,
    },

    /// Another holder kept the exclusive file lock past the deadline.
    #[snafu(display("Timed out after {timeout:?} waiting for lock on {}", path.display()))]
    LockTimeout {
        /// Path of the locked file.
        path: PathBuf,
        /// How long the open waited.
        timeout: Duration,
    },

    /// Database file is corrupted or has invalid format.
    #[snafu(display("Corrupted database: {reason}"))]
    Corrupted {
        /// Description of what was corrupted.
        reason: String,
    },

    /// Page checksum verification failed.
    #[snafu(display("Page {page_id} is corrupt: checksum mismatch"))]
    CorruptPage {
        /// The page whose checksum failed.
        page_id: PageId,
    },

    /// Neither meta page carries a valid magic number.
    #[snafu(display("Invalid database magic number"))]
    InvalidMagic,

    /// Unsupported database format version.
    #[snafu(display("Unsupported format version: {version}"))]
    UnsupportedVersion {
        /// The unsupported version number.
        version: u16,
    },

    /// Page type mismatch (expected different type).
    #[snafu(display("Page type mismatch: expected {expected:?}, found {found:?}"))]
    PageTypeMismatch {
        /// The expected page type.
        expected: PageType,
        /// The actual page type found.
        found: PageType,
    },

    /// Key not found.
    #[snafu(display("Key not found"))]
    KeyNotFound,

    /// Page was never written.
    #[snafu(display("Page {page_id} not found"))]
    PageNotFound {
        /// The missing page ID.
        page_id: PageId,
    },

    /// The store cannot grow to satisfy an allocation.
    #[snafu(display("Out of space: cannot allocate more pages"))]
    OutOfSpace,

    /// Key does not fit in a leaf cell.
    #[snafu(display("Key too large: {size} bytes (max {max})"))]
    KeyTooLarge {
        /// Actual size of the key in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },

    /// Value rejected at the store boundary.
    #[snafu(display("Bad value: {reason}"))]
    BadValue {
        /// Why the value was rejected.
        reason: String,
    },

    /// Configuration failed validation.
    #[snafu(display("Invalid config: {message}"))]
    InvalidConfig {
        /// Description of the validation failure.
        message: String,
    },

    /// A write transaction hit an error mid-operation and can only be aborted.
    #[snafu(display("Write transaction failed and cannot commit"))]
    TransactionFailed,

    /// The store has been closed.
    #[snafu(display("Store is closed"))]
    Closed,

    /// Internal lock was poisoned (another thread panicked while holding it).
    #[snafu(display("Internal lock poisoned"))]
    Poisoned,
}

impl From<io::Error> for Error {
    fn from(source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::StorageFull {
            return Error::OutOfSpace;
        }
        Error::Io { source }
    }
}

/// Page types in the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    /// Free/unused page.
    Free = 0,
    /// Meta page (page 0 or page 1).
    Meta = 1,
    /// B-tree branch (internal) node.
    BTreeBranch = 2,
    /// B-tree leaf node.
    BTreeLeaf = 3,
    /// Overflow page for large values.
    Overflow = 4,
    /// Free list page.
    FreeList = 5,
}

impl TryFrom<u8> for PageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Free),
            1 => Ok(Self::Meta),
            2 => Ok(Self::BTreeBranch),
            3 => Ok(Self::BTreeLeaf),
            4 => Ok(Self::Overflow),
            5 => Ok(Self::FreeList),
            _ => Err(Error::Corrupted { reason: format!("Invalid page type: {value}") }),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_io() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err = Error::from(io_err);
        let display = format!("{err}");
        assert!(display.starts_with("I/O error:"), "got: {display}");
    }

    #[test]
    fn test_storage_full_maps_to_out_of_space() {
        let io_err = io::Error::new(io::ErrorKind::StorageFull, "disk full");
        assert!(matches!(Error::from(io_err), Error::OutOfSpace));
    }

    #[test]
    fn test_error_display_lock_timeout() {
        let err = Error::LockTimeout {
            path: PathBuf::from("/tmp/s.db"),
            timeout: Duration::from_millis(75),
        };
        assert_eq!(format!("{err}"), "Timed out after 75ms waiting for lock on /tmp/s.db");
    }

    #[test]
    fn test_error_display_corrupt_page() {
        let err = Error::CorruptPage { page_id: 42 };
        assert_eq!(format!("{err}"), "Page 42 is corrupt: checksum mismatch");
    }

    #[test]
    fn test_error_display_page_type_mismatch() {
        let err =
            Error::PageTypeMismatch { expected: PageType::BTreeLeaf, found: PageType::BTreeBranch };
        let display = format!("{err}");
        assert!(display.contains("BTreeLeaf"), "got: {display}");
        assert!(display.contains("BTreeBranch"), "got: {display}");
    }

    #[test]
    fn test_error_display_key_not_found() {
        assert_eq!(format!("{}", Error::KeyNotFound), "Key not found");
    }

    #[test]
    fn test_error_display_bad_value() {
        let err = Error::BadValue { reason: "value must not be empty".to_string() };
        assert_eq!(format!("{err}"), "Bad value: value must not be empty");
    }

    #[test]
    fn test_page_type_round_trip() {
        for ty in [
            PageType::Free,
            PageType::Meta,
            PageType::BTreeBranch,
            PageType::BTreeLeaf,
            PageType::Overflow,
            PageType::FreeList,
        ] {
            assert_eq!(PageType::try_from(ty as u8).unwrap(), ty);
        }
        assert!(matches!(PageType::try_from(200), Err(Error::Corrupted { .. })));
    }

    #[test]
    fn test_error_source_chain() {
        use std::error::Error as StdError;

        let err = Error::from(io::Error::new(io::ErrorKind::NotFound, "file not found"));
        assert!(err.source().is_some(), "Error::Io should have a source");
    }
}
