//! Store configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default page size (4 KiB).
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Smallest supported page size.
pub const MIN_PAGE_SIZE: usize = 512;

/// Largest supported page size. Cell offsets inside a page are 16-bit.
pub const MAX_PAGE_SIZE: usize = 32 * 1024;

/// Pages 0 and 1 hold meta records and page 2 the bootstrap root.
const MIN_MAX_PAGES: u64 = 3;

/// Configuration for opening a store.
///
/// # Validation Rules
///
/// - `page_size` must be a power of two in 512..=32768
/// - `cache_size` must be at least 1 page
/// - `max_pages`, when set, must be at least 3
///
/// # Example
///
/// ```
/// # use std::time::Duration;
/// # use kvs_store::StoreConfig;
/// let config = StoreConfig::builder()
///     .page_size(8192)
///     .lock_timeout(Duration::from_millis(500))
///     .build()
///     .expect("valid store config");
/// assert_eq!(config.page_size, 8192);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Page size in bytes. Only used when creating a new file; an existing
    /// file keeps the page size recorded in its meta pages.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Number of committed pages kept in the shared page cache.
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
    /// How long `open` waits for the exclusive file lock.
    #[serde(default = "default_lock_timeout")]
    #[serde(with = "humantime_serde")]
    pub lock_timeout: Duration,
    /// Whether commits fsync data and meta pages.
    #[serde(default = "default_sync_on_commit")]
    pub sync_on_commit: bool,
    /// Upper bound on the number of pages in the file.
    #[serde(default)]
    pub max_pages: Option<u64>,
}

#[bon::bon]
impl StoreConfig {
    /// Creates a new store configuration with validation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if any value is out of range.
    #[builder]
    pub fn new(
        #[builder(default = default_page_size())] page_size: usize,
        #[builder(default = default_cache_size())] cache_size: usize,
        #[builder(default = default_lock_timeout())] lock_timeout: Duration,
        #[builder(default = default_sync_on_commit())] sync_on_commit: bool,
        max_pages: Option<u64>,
    ) -> Result<Self> {
        let config = Self { page_size, cache_size, lock_timeout, sync_on_commit, max_pages };
        config.validate()?;
        Ok(config)
    }
}

impl StoreConfig {
    /// Validates the configuration values.
    ///
    /// Call after deserialization to ensure values are within valid ranges.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if any value is out of range.
    pub fn validate(&self) -> Result<()> {
        validate_page_size(self.page_size)?;
        if self.cache_size == 0 {
            return Err(Error::InvalidConfig {
                message: "cache_size must be at least 1 page".to_string(),
            });
        }
        if let Some(max_pages) = self.max_pages
            && max_pages < MIN_MAX_PAGES
        {
            return Err(Error::InvalidConfig {
                message: format!("max_pages must be >= {MIN_MAX_PAGES}, got {max_pages}"),
            });
        }
        Ok(())
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            cache_size: default_cache_size(),
            lock_timeout: default_lock_timeout(),
            sync_on_commit: default_sync_on_commit(),
            max_pages: None,
        }
    }
}

/// Checks that `page_size` is a supported power of two.
///
/// # Errors
///
/// Returns [`Error::InvalidConfig`] when the size is unsupported.
pub fn validate_page_size(page_size: usize) -> Result<()> {
    if !page_size.is_power_of_two() || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
        return Err(Error::InvalidConfig {
            message: format!(
                "page_size must be a power of two in {MIN_PAGE_SIZE}..={MAX_PAGE_SIZE}, \
                 got {page_size}"
            ),
        });
    }
    Ok(())
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

fn default_cache_size() -> usize {
    1024
}

fn default_lock_timeout() -> Duration {
    Duration::from_millis(75)
}

fn default_sync_on_commit() -> bool {
    true
}

/// Duration serialization using humantime format.
mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
