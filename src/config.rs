use std::time::Duration;

use crate::{error::SnapError, types::SnapResult};

pub const DEFAULT_PAGE_SIZE: usize = 512;
pub const MIN_PAGE_SIZE: usize = 64;
pub const DEFAULT_FANOUT: usize = 16;

/// Store-wide tuning knobs. The page size is sticky: once a file is
/// created, reopening it with a different page size is rejected.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Physical page size in bytes; a power of two, at least 64.
    pub page_size: usize,

    /// Wall-clock lifetime of a read transaction before the reaper
    /// closes it.
    pub read_timeout: Duration,

    /// How often the reaper thread wakes up.
    pub reaper_period: Duration,

    /// Run the page reclaimer after this many commits.
    pub reclaim_commit_threshold: u32,

    /// Number of tuples the bulk loader sorts in memory before it spills
    /// a run to a temp file.
    pub bulk_chunk_size: usize,

    /// Per-key value sets grow inline up to this cardinality; beyond it
    /// they move into a nested value tree.
    pub value_inline_threshold: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            read_timeout: Duration::from_secs(10),
            reaper_period: Duration::from_secs(1),
            reclaim_commit_threshold: 16,
            bulk_chunk_size: 64 * 1024,
            value_inline_threshold: 8,
        }
    }
}

impl StoreConfig {
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_reaper_period(mut self, period: Duration) -> Self {
        self.reaper_period = period;
        self
    }

    pub fn with_reclaim_commit_threshold(mut self, threshold: u32) -> Self {
        self.reclaim_commit_threshold = threshold;
        self
    }

    pub fn with_bulk_chunk_size(mut self, chunk_size: usize) -> Self {
        self.bulk_chunk_size = chunk_size;
        self
    }

    pub fn with_value_inline_threshold(mut self, threshold: usize) -> Self {
        self.value_inline_threshold = threshold;
        self
    }

    pub fn validate(&self) -> SnapResult {
        if self.page_size < MIN_PAGE_SIZE || !self.page_size.is_power_of_two() {
            return Err(SnapError::BTreeCreation(format!(
                "page size must be a power of two >= {}, got {}",
                MIN_PAGE_SIZE, self.page_size
            )));
        }
        if self.bulk_chunk_size == 0 {
            return Err(SnapError::BTreeCreation(
                "bulk chunk size must be positive".to_string(),
            ));
        }
        if self.value_inline_threshold == 0 {
            return Err(SnapError::BTreeCreation(
                "value inline threshold must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(StoreConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_odd_page_size() {
        assert!(StoreConfig::default().with_page_size(500).validate().is_err());
        assert!(StoreConfig::default().with_page_size(32).validate().is_err());
    }
}
