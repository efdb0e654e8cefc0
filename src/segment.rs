//! Segment files and the in-memory segment handle.
//!
//! Each segment is one fixed-size file holding a 64-byte descriptor followed
//! by framed records:
//!
//! ```text
//! {journal_dir}/
//!   000000001.log      <- sealed
//!   000000002.log      <- sealed
//!   000000003.log      <- active
//! ```
//!
//! New segments are written as `NNNNNNNNN.log.tmp` and renamed into place
//! once the descriptor is durable, so a crash never leaves a published
//! segment without a valid header.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use crc32fast::Hasher;

use crate::index::{IndexInfo, JournalIndex};
use crate::mmap::MmapFile;
use crate::record::{read_frame, Frame, JournalRecord, ASQN_IGNORE};
use crate::segment_reader::SegmentReader;
use crate::{Error, Result};

/// Default segment size (128 MB)
pub const DEFAULT_SEGMENT_SIZE: usize = 128 * 1024 * 1024;

pub const SEG_HEADER_SIZE: usize = 64;
pub const SEG_DATA_OFFSET: usize = 64;

/// Segment magic number ('JRNL')
pub const SEG_MAGIC: u32 = 0x4A52_4E4C;
pub const SEG_VERSION: u32 = 1;
pub const SEG_FLAG_SEALED: u32 = 1;

const DESCRIPTOR_CHECKSUM_OFFSET: usize = 40;
const PAGE_SIZE: usize = 4096;

/// Header stored at the beginning of each segment file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentDescriptor {
    pub version: u32,
    pub flags: u32,
    pub id: u64,
    /// Index of the first record the segment holds.
    pub index: i64,
    pub max_segment_size: u32,
    /// Greatest ASQN appended to the journal before this segment was created.
    pub base_asqn: i64,
}

impl SegmentDescriptor {
    pub fn new(id: u64, index: i64, max_segment_size: u32) -> Self {
        Self {
            version: SEG_VERSION,
            flags: 0,
            id,
            index,
            max_segment_size,
            base_asqn: ASQN_IGNORE,
        }
    }

    pub fn with_base_asqn(mut self, base_asqn: i64) -> Self {
        self.base_asqn = base_asqn;
        self
    }

    pub fn is_sealed(&self) -> bool {
        (self.flags & SEG_FLAG_SEALED) != 0
    }

    pub fn encode(&self) -> [u8; SEG_HEADER_SIZE] {
        let mut buf = [0u8; SEG_HEADER_SIZE];
        buf[0..4].copy_from_slice(&SEG_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.flags.to_le_bytes());
        buf[12..16].copy_from_slice(&self.max_segment_size.to_le_bytes());
        buf[16..24].copy_from_slice(&self.id.to_le_bytes());
        buf[24..32].copy_from_slice(&self.index.to_le_bytes());
        buf[32..40].copy_from_slice(&self.base_asqn.to_le_bytes());
        let crc = descriptor_crc(&buf[0..DESCRIPTOR_CHECKSUM_OFFSET]);
        buf[40..44].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < SEG_HEADER_SIZE {
            return Err(Error::Corrupt("segment too small for header"));
        }
        let magic = le_u32(buf, 0);
        if magic != SEG_MAGIC {
            return Err(Error::Corrupt("segment magic mismatch"));
        }
        let version = le_u32(buf, 4);
        if version != SEG_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let crc = le_u32(buf, DESCRIPTOR_CHECKSUM_OFFSET);
        if descriptor_crc(&buf[0..DESCRIPTOR_CHECKSUM_OFFSET]) != crc {
            return Err(Error::Corrupt("segment descriptor checksum mismatch"));
        }
        Ok(Self {
            version,
            flags: le_u32(buf, 8),
            max_segment_size: le_u32(buf, 12),
            id: le_u64(buf, 16),
            index: le_u64(buf, 24) as i64,
            base_asqn: le_u64(buf, 32) as i64,
        })
    }
}

fn le_u32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(bytes)
}

fn le_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

fn descriptor_crc(bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

// ============================================================================
// Segment Naming
// ============================================================================

/// Generate segment filename from ID (e.g., "000000042.log").
pub fn segment_filename(id: u64) -> String {
    format!("{:09}.log", id)
}

pub fn segment_temp_filename(id: u64) -> String {
    format!("{:09}.log.tmp", id)
}

pub fn segment_path(root: &Path, id: u64) -> PathBuf {
    root.join(segment_filename(id))
}

pub fn segment_temp_path(root: &Path, id: u64) -> PathBuf {
    root.join(segment_temp_filename(id))
}

/// Returns the segment ID if `name` is a published segment file.
pub fn parse_segment_filename(name: &str) -> Option<u64> {
    let base = name.strip_suffix(".log")?;
    if base.len() != 9 || !base.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    base.parse::<u64>().ok()
}

// ============================================================================
// Segment Discovery
// ============================================================================

/// Discover all segment IDs in a directory, sorted ascending.
pub fn discover_segments(dir: &Path) -> Result<Vec<u64>> {
    let mut segments = Vec::new();
    if !dir.exists() {
        return Ok(segments);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        let file_name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name,
            None => continue,
        };
        if let Some(id) = parse_segment_filename(file_name) {
            segments.push(id);
        }
    }
    segments.sort_unstable();
    Ok(segments)
}

/// Remove segment files that were never published.
pub fn remove_temp_segments(dir: &Path) -> Result<usize> {
    let mut removed = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if name.to_str().is_some_and(|n| n.ends_with(".log.tmp")) {
            std::fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

// ============================================================================
// Segment Creation & Opening
// ============================================================================

pub fn validate_segment_size(segment_size: usize) -> Result<u32> {
    let size = u32::try_from(segment_size)
        .map_err(|_| Error::Unsupported("segment size exceeds u32 range"))?;
    let min_size = SEG_DATA_OFFSET + crate::record::frame_len(0);
    if segment_size < min_size {
        return Err(Error::Unsupported("segment size too small"));
    }
    Ok(size)
}

pub fn read_descriptor(mmap: &MmapFile) -> Result<SegmentDescriptor> {
    SegmentDescriptor::decode(mmap.range(0, SEG_HEADER_SIZE)?)
}

pub fn write_descriptor(mmap: &MmapFile, descriptor: &SegmentDescriptor) -> Result<()> {
    mmap.write_at(0, &descriptor.encode())
}

/// Writes a zero to every page so first appends do not take page faults.
pub fn prefault_mmap(mmap: &MmapFile) -> Result<()> {
    let mut offset = PAGE_SIZE;
    // The first page is already touched by the descriptor.
    while offset < mmap.len() {
        mmap.fill(offset, 1, 0)?;
        offset += PAGE_SIZE;
    }
    Ok(())
}

pub fn publish_segment(temp: &Path, final_path: &Path) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;
        let temp_c = CString::new(temp.as_os_str().as_bytes())
            .map_err(|_| Error::Unsupported("segment temp path contains null byte"))?;
        let final_c = CString::new(final_path.as_os_str().as_bytes())
            .map_err(|_| Error::Unsupported("segment path contains null byte"))?;
        let rc = unsafe {
            libc::renameat2(
                libc::AT_FDCWD,
                temp_c.as_ptr(),
                libc::AT_FDCWD,
                final_c.as_ptr(),
                libc::RENAME_NOREPLACE,
            )
        };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ENOSYS) && err.raw_os_error() != Some(libc::EINVAL) {
            return Err(Error::Io(err));
        }
    }

    if final_path.exists() {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            "segment already exists",
        )));
    }
    std::fs::rename(temp, final_path)?;
    Ok(())
}

pub(crate) fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

// ============================================================================
// Segment Handle
// ============================================================================

/// Outcome of walking the frames of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Scan {
    /// Index the next frame would carry.
    pub next_index: i64,
    /// Byte offset right after the last frame walked.
    pub position: usize,
    pub last_asqn: i64,
    /// Why the walk stopped early, if it hit bad data.
    pub invalid: Option<&'static str>,
}

/// A bounded, contiguous range of the journal backed by one mapped file.
///
/// Segments are shared between the journal and its readers. Only the active
/// segment is written to, always by the journal itself; `last_index` is the
/// publication point readers synchronise on.
pub struct Segment {
    descriptor: SegmentDescriptor,
    path: PathBuf,
    map: MmapFile,
    index: Arc<dyn JournalIndex>,
    last_index: AtomicI64,
    last_asqn: AtomicI64,
    sealed: AtomicBool,
    open: AtomicBool,
}

impl Segment {
    /// Create, prefault (optionally) and publish a new empty segment.
    pub(crate) fn create(
        dir: &Path,
        descriptor: SegmentDescriptor,
        index: Arc<dyn JournalIndex>,
        preallocate: bool,
    ) -> Result<Self> {
        let temp_path = segment_temp_path(dir, descriptor.id);
        let _ = std::fs::remove_file(&temp_path);
        let map = MmapFile::create(&temp_path, descriptor.max_segment_size as usize)?;
        write_descriptor(&map, &descriptor)?;
        if preallocate {
            prefault_mmap(&map)?;
        }
        map.flush_sync()?;
        let path = segment_path(dir, descriptor.id);
        publish_segment(&temp_path, &path)?;
        sync_dir(dir)?;
        log::debug!(
            "created segment {} at index {} ({} bytes)",
            descriptor.id,
            descriptor.index,
            descriptor.max_segment_size
        );
        Ok(Self::from_parts(descriptor, path, map, index))
    }

    /// Open an existing segment file. Frames are not scanned; see `recover`.
    pub(crate) fn open(dir: &Path, id: u64, index: Arc<dyn JournalIndex>) -> Result<Self> {
        let path = segment_path(dir, id);
        let map = MmapFile::open(&path)?;
        let descriptor = read_descriptor(&map)?;
        if descriptor.id != id {
            return Err(Error::Corrupt("segment id mismatch"));
        }
        if map.len() != descriptor.max_segment_size as usize {
            return Err(Error::Corrupt("segment size mismatch"));
        }
        Ok(Self::from_parts(descriptor, path, map, index))
    }

    fn from_parts(
        descriptor: SegmentDescriptor,
        path: PathBuf,
        map: MmapFile,
        index: Arc<dyn JournalIndex>,
    ) -> Self {
        Self {
            last_index: AtomicI64::new(descriptor.index - 1),
            last_asqn: AtomicI64::new(descriptor.base_asqn),
            sealed: AtomicBool::new(descriptor.is_sealed()),
            open: AtomicBool::new(true),
            descriptor,
            path,
            map,
            index,
        }
    }

    pub fn id(&self) -> u64 {
        self.descriptor.id
    }

    /// Index of the first record this segment holds (or would hold).
    pub fn first_index(&self) -> i64 {
        self.descriptor.index
    }

    /// Last published index; `first_index() - 1` while empty.
    pub fn last_index(&self) -> i64 {
        self.last_index.load(Ordering::Acquire)
    }

    /// Greatest ASQN appended up to this segment's last record, counting
    /// earlier segments through the descriptor's `base_asqn`.
    pub fn last_asqn(&self) -> i64 {
        self.last_asqn.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.last_index() < self.first_index()
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn max_size(&self) -> usize {
        self.map.len()
    }

    pub fn create_reader(self: &Arc<Self>) -> SegmentReader {
        SegmentReader::new(Arc::clone(self))
    }

    pub(crate) fn map(&self) -> &MmapFile {
        &self.map
    }

    pub(crate) fn journal_index(&self) -> &dyn JournalIndex {
        self.index.as_ref()
    }

    /// Nearest sampled position at or before `index` that lies in this segment.
    pub(crate) fn lookup_position(&self, index: i64) -> Option<IndexInfo> {
        self.index
            .lookup(index)
            .filter(|info| info.index >= self.first_index() && info.index <= self.last_index())
    }

    pub(crate) fn publish(&self, index: i64, asqn: i64) {
        if asqn != ASQN_IGNORE {
            self.last_asqn.store(asqn, Ordering::Release);
        }
        self.last_index.store(index, Ordering::Release);
    }

    pub(crate) fn publish_truncation(&self, index: i64, asqn: i64) {
        self.last_asqn.store(asqn, Ordering::Release);
        self.last_index.store(index, Ordering::Release);
    }

    /// Walk frames from the start of the segment until `until` is reached or
    /// the data stops being valid.
    pub(crate) fn scan(&self, until: i64, mut visit: impl FnMut(&JournalRecord, usize)) -> Scan {
        let mut scan = Scan {
            next_index: self.first_index(),
            position: SEG_DATA_OFFSET,
            last_asqn: self.descriptor.base_asqn,
            invalid: None,
        };
        while scan.next_index <= until {
            match read_frame(&self.map, scan.position) {
                Frame::End => break,
                Frame::Record { record, len } if record.index == scan.next_index => {
                    visit(&record, scan.position);
                    if record.has_asqn() {
                        scan.last_asqn = record.asqn;
                    }
                    scan.position += len;
                    scan.next_index += 1;
                }
                Frame::Record { .. } => {
                    scan.invalid = Some("non-contiguous record index");
                    break;
                }
                Frame::Invalid(reason) => {
                    scan.invalid = Some(reason);
                    break;
                }
            }
        }
        scan
    }

    /// Rebuild in-memory state from the frames on disk without touching the
    /// file. Data past the first bad frame is ignored.
    pub(crate) fn load(&self) -> Scan {
        let index = Arc::clone(&self.index);
        let scan = self.scan(i64::MAX, |record, position| index.index(record, position));
        self.publish_truncation(scan.next_index - 1, scan.last_asqn);
        scan
    }

    /// Like `load`, but corrupt or torn frames are cut off: everything after
    /// the last good frame is zeroed. Returns the scan so the caller can
    /// resume writing and decide what to do with later segments.
    pub(crate) fn recover(&self) -> Result<Scan> {
        let scan = self.load();
        if let Some(reason) = scan.invalid {
            log::warn!(
                "segment {} truncated at index {} (offset {}): {}",
                self.id(),
                scan.next_index,
                scan.position,
                reason
            );
            self.map.store_u32_release(scan.position, 0)?;
            self.map.fill(scan.position, self.map.len() - scan.position, 0)?;
            self.map.flush_sync()?;
        }
        Ok(scan)
    }

    pub(crate) fn seal(&self) -> Result<()> {
        self.set_sealed(true)
    }

    pub(crate) fn unseal(&self) -> Result<()> {
        self.set_sealed(false)
    }

    fn set_sealed(&self, sealed: bool) -> Result<()> {
        let mut descriptor = read_descriptor(&self.map)?;
        if descriptor.is_sealed() == sealed {
            self.sealed.store(sealed, Ordering::Release);
            return Ok(());
        }
        if sealed {
            descriptor.flags |= SEG_FLAG_SEALED;
        } else {
            descriptor.flags &= !SEG_FLAG_SEALED;
        }
        write_descriptor(&self.map, &descriptor)?;
        self.map.flush_sync()?;
        self.sealed.store(sealed, Ordering::Release);
        Ok(())
    }

    pub(crate) fn flush(&self) -> Result<()> {
        self.map.flush_sync()
    }

    /// Mark closed. Readers still holding the segment detect this lazily.
    pub(crate) fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    /// Close and remove the backing file.
    pub(crate) fn delete(&self) -> Result<()> {
        self.close();
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("id", &self.id())
            .field("first_index", &self.first_index())
            .field("last_index", &self.last_index())
            .field("open", &self.is_open())
            .finish()
    }
}
