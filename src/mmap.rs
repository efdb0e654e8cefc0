use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use memmap2::{MmapOptions, MmapRaw};

use crate::{Error, Result};

/// File-backed shared mapping.
///
/// A segment's mapping is shared between the journal (the only writer) and
/// any number of readers. Writes go through `&self`; the writer publishes a
/// prefix by storing the frame length word with `Release`, and readers only
/// touch bytes inside a prefix they observed with `Acquire`.
pub struct MmapFile {
    map: MmapRaw,
    len: usize,
}

// SAFETY: MmapRaw is Send + Sync. Mutation only happens through the single
// journal writer following the publish protocol above.
unsafe impl Send for MmapFile {}
unsafe impl Sync for MmapFile {}

impl MmapFile {
    pub fn create(path: &Path, len: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Self::map_new(file, len)
    }

    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Err(Error::Unsupported("mmap length must be non-zero"));
        }
        let map = MmapOptions::new().len(len).map_raw(&file)?;
        Ok(Self { map, len })
    }

    fn map_new(file: File, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::Unsupported("mmap length must be non-zero"));
        }
        file.set_len(len as u64)?;
        let map = MmapOptions::new().len(len).map_raw(&file)?;
        Ok(Self { map, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        let end = offset.checked_add(len).ok_or(Error::Corrupt("range overflow"))?;
        if end > self.len {
            return Err(Error::Corrupt("range out of bounds"));
        }
        Ok(())
    }

    /// Borrow `len` bytes at `offset`.
    ///
    /// Callers must only read ranges that were published by the writer.
    pub fn range(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.check_range(offset, len)?;
        // SAFETY: bounds checked above; the mapping lives as long as `self`.
        Ok(unsafe { std::slice::from_raw_parts(self.map.as_ptr().add(offset), len) })
    }

    pub(crate) fn write_at(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.check_range(offset, bytes.len())?;
        // SAFETY: bounds checked; the region is not yet published to readers.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.map.as_mut_ptr().add(offset),
                bytes.len(),
            );
        }
        Ok(())
    }

    pub(crate) fn fill(&self, offset: usize, len: usize, value: u8) -> Result<()> {
        self.check_range(offset, len)?;
        // SAFETY: bounds checked; callers only clear unpublished regions.
        unsafe {
            std::ptr::write_bytes(self.map.as_mut_ptr().add(offset), value, len);
        }
        Ok(())
    }

    pub fn load_u32_acquire(&self, offset: usize) -> Result<u32> {
        self.check_range(offset, 4)?;
        if offset % 4 != 0 {
            return Err(Error::Corrupt("unaligned atomic load"));
        }
        // SAFETY: in bounds and 4-byte aligned (the mapping is page aligned).
        let atomic = unsafe { &*(self.map.as_ptr().add(offset) as *const AtomicU32) };
        Ok(atomic.load(Ordering::Acquire))
    }

    pub(crate) fn store_u32_release(&self, offset: usize, value: u32) -> Result<()> {
        self.check_range(offset, 4)?;
        if offset % 4 != 0 {
            return Err(Error::Corrupt("unaligned atomic store"));
        }
        // SAFETY: in bounds and 4-byte aligned (the mapping is page aligned).
        let atomic = unsafe { &*(self.map.as_ptr().add(offset) as *const AtomicU32) };
        atomic.store(value, Ordering::Release);
        Ok(())
    }

    /// Sync `len` bytes at `offset` to the backing file.
    pub(crate) fn flush_range(&self, offset: usize, len: usize) -> Result<()> {
        self.check_range(offset, len)?;
        self.map.flush_range(offset, len)?;
        Ok(())
    }

    pub fn flush_sync(&self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn writes_are_visible_through_a_second_mapping() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("map");
        let writer = MmapFile::create(&path, 4096)?;
        writer.write_at(8, b"journal")?;
        writer.store_u32_release(0, 7)?;
        writer.flush_sync()?;

        let reader = MmapFile::open(&path)?;
        assert_eq!(reader.load_u32_acquire(0)?, 7);
        assert_eq!(reader.range(8, 7)?, b"journal");
        Ok(())
    }

    #[test]
    fn rejects_out_of_bounds_access() -> Result<()> {
        let dir = tempdir()?;
        let map = MmapFile::create(&dir.path().join("map"), 64)?;
        assert!(matches!(map.range(60, 8), Err(Error::Corrupt(_))));
        assert!(matches!(map.write_at(63, b"ab"), Err(Error::Corrupt(_))));
        assert!(matches!(map.load_u32_acquire(2), Err(Error::Corrupt(_))));
        Ok(())
    }
}
