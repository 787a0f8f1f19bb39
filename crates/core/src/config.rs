//! Engine configuration.

use crate::error::{Error, Result};
use crate::key::KeySize;
use std::path::PathBuf;

const MIN_CACHE_PAGES: usize = 4;
const DEFAULT_DATA_PAGE_SIZE: usize = 256 * 1024;
const DEFAULT_INDEX_PAGES: usize = 8;

/// Engine configuration, validated once at [`Config::validate`] and then
/// treated as immutable for the lifetime of an `Engine`. There is no
/// environment-variable or config-file loader here; the core only exposes
/// this struct, matching the out-of-scope request/dispatch layer's job of
/// turning external configuration sources into one of these.
#[derive(Debug, Clone)]
pub struct Config {
    /// Filesystem path of the store.
    pub path: PathBuf,
    /// On-disk key width, 4 or 8 bytes.
    pub key_size: KeySize,
    /// Power-of-two page size in bytes for data pages.
    pub data_page_size: usize,
    /// Pages per index node (both shadow slots use this size).
    pub index_pages: usize,
    /// Bound on the page cache, in megabytes.
    pub cache_mb: usize,
    /// CPU worker pool size.
    pub cpu_threads: usize,
    /// I/O worker pool size.
    pub io_threads: usize,
    /// If set, update operations fail fast with `ReadOnly`.
    pub read_only: bool,
}

impl Config {
    /// Number of page-cache slots implied by `cache_mb` and `data_page_size`.
    pub fn cache_pages(&self) -> usize {
        (self.cache_mb * 1024 * 1024 / self.data_page_size).max(MIN_CACHE_PAGES)
    }

    /// Size in bytes of one index node (both shadow slots are this size).
    pub fn index_node_size(&self) -> usize {
        self.index_pages * self.data_page_size
    }

    /// Validate the configuration, matching the `InvalidArgument` error
    /// kind's documented triggers.
    pub fn validate(&self) -> Result<()> {
        if !self.data_page_size.is_power_of_two() {
            return Err(Error::invalid_argument(format!(
                "data_page_size must be a power of two, got {}",
                self.data_page_size
            )));
        }
        if self.index_pages == 0 {
            return Err(Error::invalid_argument("index_pages must be at least 1"));
        }
        if self.cache_mb * 1024 * 1024 < MIN_CACHE_PAGES * self.data_page_size {
            return Err(Error::invalid_argument(format!(
                "cache_mb too small: need at least {} pages of {} bytes",
                MIN_CACHE_PAGES, self.data_page_size
            )));
        }
        if self.cpu_threads == 0 {
            return Err(Error::invalid_argument("cpu_threads must be at least 1"));
        }
        if self.io_threads == 0 {
            return Err(Error::invalid_argument("io_threads must be at least 1"));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            path: PathBuf::new(),
            key_size: KeySize::Four,
            data_page_size: DEFAULT_DATA_PAGE_SIZE,
            index_pages: DEFAULT_INDEX_PAGES,
            cache_mb: 64,
            cpu_threads: 4,
            io_threads: 2,
            read_only: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let mut cfg = Config::default();
        cfg.path = "/tmp/does-not-matter".into();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_non_power_of_two_page_size() {
        let mut cfg = Config::default();
        cfg.data_page_size = 100;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_undersized_cache() {
        let mut cfg = Config::default();
        cfg.cache_mb = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_thread_pools() {
        let mut cfg = Config::default();
        cfg.cpu_threads = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.io_threads = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn cache_pages_respects_minimum() {
        let mut cfg = Config::default();
        cfg.cache_mb = 1024 * 1024; // effectively unbounded for the math below
        cfg.data_page_size = 256 * 1024;
        assert!(cfg.cache_pages() >= MIN_CACHE_PAGES);
    }

    #[test]
    fn index_node_size_is_pages_times_page_size() {
        let cfg = Config::default();
        assert_eq!(
            cfg.index_node_size(),
            cfg.index_pages * cfg.data_page_size
        );
    }
}
