//! The segmented journal.
//!
//! # Design
//!
//! - One writer: every mutating call takes `&mut self`, and a directory
//!   `flock` keeps other processes out
//! - Readers share `JournalState` through an `Arc`; they never block the
//!   writer beyond brief segment-table reads
//! - Structural changes (compaction, truncation, reset, close) bump the
//!   table generation; readers compare it on each call and reposition
//! - Segments are recovered on open: torn or corrupt tails are cut off and
//!   anything after a break in the index chain is discarded

use std::collections::{BTreeMap, HashSet};
use std::ops::Bound::{Excluded, Unbounded};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::JournalConfig;
use crate::index::{JournalIndex, SparseJournalIndex};
use crate::reader::SegmentedJournalReader;
use crate::record::{JournalRecord, ASQN_IGNORE};
use crate::segment::{
    discover_segments, remove_temp_segments, segment_path, sync_dir, validate_segment_size, Segment,
    SegmentDescriptor, SEG_DATA_OFFSET,
};
use crate::segment_writer::SegmentWriter;
use crate::writer_lock::WriterLock;
use crate::{Error, Result};

#[derive(Default)]
struct SegmentTable {
    /// Segments keyed by the index of their first record.
    segments: BTreeMap<i64, Arc<Segment>>,
    generation: u64,
}

/// State shared between the journal and its readers.
pub(crate) struct JournalState {
    table: RwLock<SegmentTable>,
    index: Arc<SparseJournalIndex>,
    open: AtomicBool,
    readers: Mutex<HashSet<u64>>,
    next_reader_id: AtomicU64,
}

impl JournalState {
    fn new(index: Arc<SparseJournalIndex>) -> Self {
        Self {
            table: RwLock::new(SegmentTable::default()),
            index,
            open: AtomicBool::new(true),
            readers: Mutex::new(HashSet::new()),
            next_reader_id: AtomicU64::new(1),
        }
    }

    fn table(&self) -> RwLockReadGuard<'_, SegmentTable> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn table_mut(&self) -> RwLockWriteGuard<'_, SegmentTable> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert_segments(&self, segments: &[Arc<Segment>]) {
        let mut table = self.table_mut();
        for segment in segments {
            table.segments.insert(segment.first_index(), Arc::clone(segment));
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub(crate) fn generation(&self) -> u64 {
        self.table().generation
    }

    pub(crate) fn index(&self) -> &SparseJournalIndex {
        &self.index
    }

    pub(crate) fn first_segment(&self) -> Option<Arc<Segment>> {
        self.table().segments.values().next().cloned()
    }

    pub(crate) fn last_segment(&self) -> Option<Arc<Segment>> {
        self.table().segments.values().next_back().cloned()
    }

    /// Segment following the one that starts at `first_index`.
    pub(crate) fn next_segment(&self, first_index: i64) -> Option<Arc<Segment>> {
        self.table()
            .segments
            .range((Excluded(first_index), Unbounded))
            .next()
            .map(|(_, segment)| Arc::clone(segment))
    }

    /// Segment whose range would contain `index`.
    pub(crate) fn segment_containing(&self, index: i64) -> Option<Arc<Segment>> {
        self.table()
            .segments
            .range(..=index)
            .next_back()
            .map(|(_, segment)| Arc::clone(segment))
    }

    pub(crate) fn first_index(&self) -> i64 {
        self.first_segment().map_or(0, |segment| segment.first_index())
    }

    pub(crate) fn last_index(&self) -> i64 {
        self.last_segment().map_or(-1, |segment| segment.last_index())
    }

    /// ASQN high-water mark. Each segment carries the mark of everything
    /// before it, so compacting older segments never lowers it.
    pub(crate) fn last_asqn(&self) -> i64 {
        self.last_segment().map_or(ASQN_IGNORE, |segment| segment.last_asqn())
    }

    fn segments(&self) -> Vec<Arc<Segment>> {
        self.table().segments.values().cloned().collect()
    }

    pub(crate) fn register_reader(&self) -> u64 {
        let id = self.next_reader_id.fetch_add(1, Ordering::Relaxed);
        self.readers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);
        id
    }

    pub(crate) fn deregister_reader(&self, id: u64) {
        self.readers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    fn reader_count(&self) -> usize {
        self.readers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Append-only journal split over fixed-size, memory-mapped segments.
pub struct SegmentedJournal {
    config: JournalConfig,
    state: Arc<JournalState>,
    writer: Option<SegmentWriter>,
    next_segment_id: u64,
    lock: WriterLock,
}

impl SegmentedJournal {
    /// Open (or create) the journal in `config.directory`.
    pub fn open(config: JournalConfig) -> Result<Self> {
        config.validate()?;
        let dir = config.directory.clone();
        std::fs::create_dir_all(&dir)?;
        let lock = WriterLock::acquire(&dir)?;

        let removed = remove_temp_segments(&dir)?;
        if removed > 0 {
            log::warn!("removed {} unpublished segment(s) in {}", removed, dir.display());
        }

        let index = Arc::new(SparseJournalIndex::new(config.index_density));
        let state = Arc::new(JournalState::new(Arc::clone(&index)));
        let ids = discover_segments(&dir)?;
        let next_segment_id = ids.last().map_or(1, |id| id + 1);
        let journal_index: Arc<dyn JournalIndex> = index;
        let loaded = load_segments(&dir, &ids, &journal_index, true)?;
        let mut writer = None;
        if let Some(last) = loaded.segments.last() {
            if last.is_sealed() {
                last.unseal()?;
            }
            writer = Some(SegmentWriter::new(Arc::clone(last), loaded.position));
        }
        state.insert_segments(&loaded.segments);

        let mut journal = Self {
            config,
            state,
            writer: None,
            next_segment_id,
            lock,
        };
        let writer = match writer {
            Some(writer) => writer,
            None => {
                let first_index = journal.config.first_index;
                let segment = journal.create_segment(first_index, ASQN_IGNORE)?;
                SegmentWriter::new(segment, SEG_DATA_OFFSET)
            }
        };
        journal.writer = Some(writer);
        log::info!(
            "opened journal {} (segments={}, first_index={}, last_index={})",
            journal.config.directory.display(),
            journal.state.segments().len(),
            journal.first_index(),
            journal.last_index()
        );
        Ok(journal)
    }

    pub fn config(&self) -> &JournalConfig {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        self.state.is_open()
    }

    /// Index of the first retained record (or of the next record when empty).
    pub fn first_index(&self) -> i64 {
        self.state.first_index()
    }

    /// Index of the last appended record; `first_index() - 1` when empty.
    pub fn last_index(&self) -> i64 {
        self.state.last_index()
    }

    pub fn is_empty(&self) -> bool {
        self.last_index() < self.first_index()
    }

    /// Greatest ASQN appended so far, or `ASQN_IGNORE`. Survives compaction;
    /// `delete_after` and `reset` lower it with the records they drop.
    pub fn last_asqn(&self) -> i64 {
        self.state.last_asqn()
    }

    pub fn segments(&self) -> Vec<Arc<Segment>> {
        self.state.segments()
    }

    pub fn open_reader_count(&self) -> usize {
        self.state.reader_count()
    }

    /// Append `data` without an application sequence number.
    pub fn append(&mut self, data: &[u8]) -> Result<JournalRecord> {
        self.append_with_asqn(ASQN_IGNORE, data)
    }

    pub fn append_with_asqn(&mut self, asqn: i64, data: &[u8]) -> Result<JournalRecord> {
        let index = self.active()?.next_index();
        self.check_asqn(asqn)?;
        self.write(JournalRecord::new(index, asqn, data))
    }

    /// Append a record produced elsewhere, typically by a replica's leader.
    pub fn append_record(&mut self, record: &JournalRecord) -> Result<()> {
        let expected = self.active()?.next_index();
        if record.index != expected {
            return Err(Error::InvalidIndex {
                expected,
                actual: record.index,
            });
        }
        if !record.is_checksum_valid() {
            return Err(Error::InvalidChecksum {
                index: record.index,
            });
        }
        self.check_asqn(record.asqn)?;
        self.write(record.clone()).map(|_| ())
    }

    fn check_asqn(&self, asqn: i64) -> Result<()> {
        if asqn == ASQN_IGNORE {
            return Ok(());
        }
        let last = self.state.last_asqn();
        if asqn < ASQN_IGNORE || asqn < last {
            return Err(Error::InvalidAsqn { last, asqn });
        }
        Ok(())
    }

    fn write(&mut self, record: JournalRecord) -> Result<JournalRecord> {
        let frame_len = record.frame_len();
        if frame_len > self.config.max_segment_size - SEG_DATA_OFFSET {
            return Err(Error::PayloadTooLarge);
        }
        if !self.active()?.can_fit(frame_len) {
            self.roll()?;
        }
        let durable = !self.config.flush_explicitly;
        self.active()?.append(&record, durable)?;
        Ok(record)
    }

    /// Seal the active segment and continue in a fresh one.
    fn roll(&mut self) -> Result<()> {
        let next_index = {
            let writer = self.active()?;
            writer.flush()?;
            writer.segment().seal()?;
            writer.next_index()
        };
        let base_asqn = self.state.last_asqn();
        let segment = self.create_segment(next_index, base_asqn)?;
        log::debug!("rolled journal to segment {} at index {}", segment.id(), next_index);
        self.writer = Some(SegmentWriter::new(segment, SEG_DATA_OFFSET));
        Ok(())
    }

    fn create_segment(&mut self, first_index: i64, base_asqn: i64) -> Result<Arc<Segment>> {
        let id = self.next_segment_id;
        let descriptor = SegmentDescriptor::new(
            id,
            first_index,
            validate_segment_size(self.config.max_segment_size)?,
        )
        .with_base_asqn(base_asqn);
        let index: Arc<dyn JournalIndex> = self.state.index.clone();
        let segment = Arc::new(Segment::create(
            &self.config.directory,
            descriptor,
            index,
            self.config.preallocate_segment_files,
        )?);
        self.next_segment_id += 1;
        self.state
            .table_mut()
            .segments
            .insert(first_index, Arc::clone(&segment));
        Ok(segment)
    }

    /// Delete whole segments that only hold records below `index`.
    ///
    /// The active segment is never deleted, so fewer records than requested
    /// may be removed. Returns whether anything was deleted.
    pub fn compact(&mut self, index: i64) -> Result<bool> {
        self.ensure_open()?;
        let removed: Vec<Arc<Segment>> = {
            let mut table = self.state.table_mut();
            let keep_from = match table.segments.range(..=index).next_back() {
                Some((&start, _)) => start,
                None => return Ok(false),
            };
            let doomed: Vec<i64> = table.segments.range(..keep_from).map(|(&k, _)| k).collect();
            if doomed.is_empty() {
                return Ok(false);
            }
            table.generation += 1;
            doomed
                .into_iter()
                .filter_map(|key| table.segments.remove(&key))
                .collect()
        };
        for segment in &removed {
            segment.delete()?;
        }
        sync_dir(&self.config.directory)?;
        let first_index = self.first_index();
        self.state.index.delete_until(first_index);
        log::info!(
            "compacted {} segment(s) below index {}; first index now {}",
            removed.len(),
            index,
            first_index
        );
        Ok(true)
    }

    /// Drop every record after `index`; the next append gets `index + 1`.
    ///
    /// An index below the first retained record empties the journal while
    /// keeping its first index.
    pub fn delete_after(&mut self, index: i64) -> Result<()> {
        self.ensure_open()?;
        if index >= self.last_index() {
            return Ok(());
        }
        let first_index = self.first_index();
        let index = index.max(first_index - 1);

        let removed: Vec<Arc<Segment>> = {
            let mut table = self.state.table_mut();
            table.generation += 1;
            let doomed: Vec<i64> = table
                .segments
                .range((Excluded(index.max(first_index)), Unbounded))
                .map(|(&k, _)| k)
                .collect();
            doomed
                .into_iter()
                .filter_map(|key| table.segments.remove(&key))
                .collect()
        };
        for segment in &removed {
            segment.delete()?;
        }

        let last = self
            .state
            .last_segment()
            .ok_or(Error::Corrupt("journal has no segments"))?;
        let reuse = self
            .writer
            .as_ref()
            .is_some_and(|writer| Arc::ptr_eq(writer.segment(), &last));
        if !reuse {
            last.unseal()?;
            self.writer = Some(SegmentWriter::resume(last));
        }
        self.active()?.truncate(index)?;
        self.state.index.delete_after(index);
        self.state.table_mut().generation += 1;
        if !removed.is_empty() {
            sync_dir(&self.config.directory)?;
        }
        log::info!("truncated journal after index {}", index);
        Ok(())
    }

    /// Drop everything and continue at `next_index`.
    pub fn reset(&mut self, next_index: i64) -> Result<()> {
        self.ensure_open()?;
        let removed: Vec<Arc<Segment>> = {
            let mut table = self.state.table_mut();
            table.generation += 1;
            std::mem::take(&mut table.segments).into_values().collect()
        };
        self.writer = None;
        for segment in &removed {
            segment.delete()?;
        }
        self.state.index.clear();
        let segment = self.create_segment(next_index, ASQN_IGNORE)?;
        self.writer = Some(SegmentWriter::new(segment, SEG_DATA_OFFSET));
        log::info!("reset journal to index {}", next_index);
        Ok(())
    }

    /// Sync the active segment to disk.
    pub fn flush(&mut self) -> Result<()> {
        self.active()?.flush()
    }

    /// Open a reader positioned at the first retained record.
    pub fn open_reader(&self) -> Result<SegmentedJournalReader> {
        self.ensure_open()?;
        SegmentedJournalReader::new(Arc::clone(&self.state))
    }

    /// Flush and close. Readers fail with `Error::Closed` afterwards.
    pub fn close(&mut self) -> Result<()> {
        if !self.state.open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let flushed = match self.writer.take() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        };
        let segments = {
            let mut table = self.state.table_mut();
            table.generation += 1;
            std::mem::take(&mut table.segments)
        };
        for segment in segments.values() {
            segment.close();
        }
        log::info!(
            "closed journal {} ({} reader(s) still open)",
            self.config.directory.display(),
            self.state.reader_count()
        );
        flushed
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state.is_open() {
            Ok(())
        } else {
            Err(Error::Closed)
        }
    }

    fn active(&mut self) -> Result<&mut SegmentWriter> {
        self.ensure_open()?;
        self.writer.as_mut().ok_or(Error::Closed)
    }
}

impl Drop for SegmentedJournal {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::warn!("failed to close journal {}: {}", self.lock.path().display(), err);
        }
    }
}

/// Read-only view of a journal directory as of the moment it was opened.
///
/// Takes no writer lock and never modifies segment files: a bad tail or a
/// segment that breaks the index chain is left out rather than repaired.
/// Records appended by a live writer afterwards are not visible.
pub struct JournalSnapshot {
    state: Arc<JournalState>,
}

impl JournalSnapshot {
    pub fn open(config: &JournalConfig) -> Result<Self> {
        config.validate()?;
        let index = Arc::new(SparseJournalIndex::new(config.index_density));
        let state = Arc::new(JournalState::new(Arc::clone(&index)));
        let journal_index: Arc<dyn JournalIndex> = index;
        let ids = discover_segments(&config.directory)?;
        let loaded = load_segments(&config.directory, &ids, &journal_index, false)?;
        state.insert_segments(&loaded.segments);
        Ok(Self { state })
    }

    /// First retained index; 0 when the directory holds no segment.
    pub fn first_index(&self) -> i64 {
        self.state.first_index()
    }

    pub fn last_index(&self) -> i64 {
        self.state.last_index()
    }

    pub fn is_empty(&self) -> bool {
        self.last_index() < self.first_index()
    }

    pub fn last_asqn(&self) -> i64 {
        self.state.last_asqn()
    }

    pub fn segments(&self) -> Vec<Arc<Segment>> {
        self.state.segments()
    }

    /// Fails with `Error::Closed` when the directory holds no segment.
    pub fn open_reader(&self) -> Result<SegmentedJournalReader> {
        SegmentedJournalReader::new(Arc::clone(&self.state))
    }
}

/// Segments that form the journal's index chain, in order.
struct Loaded {
    segments: Vec<Arc<Segment>>,
    /// End of the valid frames in the last segment.
    position: usize,
}

/// Open the segments `ids` and rebuild their state and the sparse index.
///
/// Loading stops at the first segment that is unreadable or does not
/// continue the previous one, and after a segment with a bad tail. With
/// `repair` the bad tail is zeroed and every segment past the break is
/// deleted; otherwise the files are left as they are.
fn load_segments(
    dir: &Path,
    ids: &[u64],
    index: &Arc<dyn JournalIndex>,
    repair: bool,
) -> Result<Loaded> {
    let mut loaded = Loaded {
        segments: Vec::new(),
        position: SEG_DATA_OFFSET,
    };
    let mut expected: Option<i64> = None;
    for (n, &id) in ids.iter().enumerate() {
        let segment = match Segment::open(dir, id, Arc::clone(index)) {
            Ok(segment) => segment,
            Err(Error::Corrupt(reason)) => {
                log::warn!("segment {} unreadable: {}", id, reason);
                if repair {
                    discard_segments(dir, &ids[n..])?;
                }
                break;
            }
            Err(err) => return Err(err),
        };
        if let Some(expected) = expected {
            if segment.first_index() != expected {
                log::warn!(
                    "segment {} starts at index {}, expected {}",
                    id,
                    segment.first_index(),
                    expected
                );
                drop(segment);
                if repair {
                    discard_segments(dir, &ids[n..])?;
                }
                break;
            }
        }
        let scan = if repair {
            segment.recover()?
        } else {
            segment.load()
        };
        loaded.position = scan.position;
        expected = Some(scan.next_index);
        loaded.segments.push(Arc::new(segment));
        if let Some(reason) = scan.invalid {
            if repair {
                discard_segments(dir, &ids[n + 1..])?;
            } else {
                log::warn!("segment {} ends early at index {}: {}", id, scan.next_index, reason);
            }
            break;
        }
    }
    Ok(loaded)
}

fn discard_segments(dir: &Path, ids: &[u64]) -> Result<()> {
    for &id in ids {
        log::warn!("discarding segment {}", id);
        match std::fs::remove_file(segment_path(dir, id)) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}
