use std::path::PathBuf;

use crate::error::{CacheError, Result};
use crate::shm::layout::{HEADER_SIZE, WORD};

/// Configuration for a cache handle.
///
/// Every process attaching to the same share file must use the same
/// `num_pages` / `page_size`; a file whose size disagrees with the configured
/// geometry is re-created from scratch.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Path of the backing file shared between processes.
    pub share_file: PathBuf,
    /// Number of independently lockable pages.
    pub num_pages: usize,
    /// Bytes per page.
    pub page_size: usize,
    /// Initial slot-table size of a freshly formatted page.
    pub start_slots: usize,
    /// Cache-wide default expiry in seconds, applied when a write passes
    /// [`EXPIRE_DEFAULT`](crate::EXPIRE_DEFAULT). 0 means never expire.
    pub expire_time: u64,
    /// Force re-creation of the backing file at init.
    pub init_file: bool,
    /// Validate every page at init and reformat any that fails.
    pub test_file: bool,
    /// Bound blocking page locks with an alarm timer so a stuck peer cannot
    /// wedge this process forever.
    pub catch_deadlocks: bool,
    /// Maintain the per-page `NReads`/`NReadHits` counters.
    pub enable_stats: bool,
    /// File mode bits used when the backing file is created.
    pub permissions: u32,
}

impl Default for CacheOptions {
    fn default() -> Self {
        CacheOptions {
            share_file: PathBuf::from("/tmp/sharefile"),
            num_pages: 89,
            page_size: 65536,
            start_slots: 89,
            expire_time: 0,
            init_file: false,
            test_file: false,
            catch_deadlocks: false,
            enable_stats: false,
            permissions: 0o640,
        }
    }
}

impl CacheOptions {
    /// Options with the given share file and defaults for everything else.
    pub fn new(share_file: impl Into<PathBuf>) -> Self {
        CacheOptions {
            share_file: share_file.into(),
            ..Default::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.share_file.as_os_str().is_empty() {
            return Err(CacheError::Config("no share file specified".into()));
        }
        if !(1..=1000).contains(&self.num_pages) {
            return Err(CacheError::Config(format!(
                "num_pages {} out of range 1..=1000",
                self.num_pages
            )));
        }
        if !(1024..=16 * 1024 * 1024).contains(&self.page_size) {
            return Err(CacheError::Config(format!(
                "page_size {} out of range 1KiB..=16MiB",
                self.page_size
            )));
        }
        if self.page_size % WORD != 0 {
            return Err(CacheError::Config(format!(
                "page_size {} is not a multiple of the word size",
                self.page_size
            )));
        }
        if !(10..=500).contains(&self.start_slots) {
            return Err(CacheError::Config(format!(
                "start_slots {} out of range 10..=500",
                self.start_slots
            )));
        }
        // A fresh page must still have room for at least one minimal entry.
        if HEADER_SIZE + self.start_slots * WORD + 6 * WORD >= self.page_size {
            return Err(CacheError::Config(format!(
                "start_slots {} leaves no data arena in a {}-byte page",
                self.start_slots, self.page_size
            )));
        }
        Ok(())
    }

    /// Total size of the backing file for this geometry.
    pub(crate) fn total_size(&self) -> usize {
        self.num_pages * self.page_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        CacheOptions::default().validate().unwrap();
    }

    #[test]
    fn rejects_out_of_range_geometry() {
        let mut opts = CacheOptions::default();
        opts.num_pages = 0;
        assert!(opts.validate().is_err());

        let mut opts = CacheOptions::default();
        opts.page_size = 512;
        assert!(opts.validate().is_err());

        let mut opts = CacheOptions::default();
        opts.page_size = 1030; // not word aligned
        assert!(opts.validate().is_err());

        let mut opts = CacheOptions::default();
        opts.start_slots = 501;
        assert!(opts.validate().is_err());
    }

    #[test]
    fn rejects_slot_table_swallowing_the_page() {
        let mut opts = CacheOptions::default();
        opts.page_size = 1024;
        opts.start_slots = 120; // 64 + 120*8 > 1024
        assert!(opts.validate().is_err());
    }
}
