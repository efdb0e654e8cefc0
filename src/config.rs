use std::path::PathBuf;

use crate::index::DEFAULT_INDEX_DENSITY;
use crate::segment::{validate_segment_size, DEFAULT_SEGMENT_SIZE};
use crate::{Error, Result};

/// Settings for opening a `SegmentedJournal`.
///
/// ```text
/// let config = JournalConfig {
///     max_segment_size: 1 << 20,
///     ..JournalConfig::new("/var/lib/app/journal")
/// };
/// ```
#[derive(Clone, Debug)]
pub struct JournalConfig {
    pub directory: PathBuf,
    /// Size of every segment file, descriptor included.
    pub max_segment_size: usize,
    /// Index assigned to the first record of a brand new journal.
    pub first_index: i64,
    /// One in `index_density` records is sampled into the sparse index.
    pub index_density: u64,
    /// Leave syncing to `flush()`; when false every frame is synced before
    /// readers can see it.
    pub flush_explicitly: bool,
    /// Touch every page of a new segment up front.
    pub preallocate_segment_files: bool,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("journal"),
            max_segment_size: DEFAULT_SEGMENT_SIZE,
            first_index: 1,
            index_density: DEFAULT_INDEX_DENSITY,
            flush_explicitly: true,
            preallocate_segment_files: false,
        }
    }
}

impl JournalConfig {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_segment_size(self.max_segment_size)?;
        if self.index_density == 0 {
            return Err(Error::Unsupported("index density must be positive"));
        }
        if self.first_index < 1 {
            return Err(Error::Unsupported("first index must be at least 1"));
        }
        Ok(())
    }
}
