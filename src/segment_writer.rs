//! Appends framed records to the active segment.
//!
//! # Design
//!
//! - Owns the write offset of exactly one segment
//! - Frame bytes land before the length word, the length word before
//!   `last_index`; readers key off `last_index`
//! - A durable append msyncs the frame before `last_index` moves, so a
//!   published record is also on disk
//! - Feeds every written record to the sparse index
//! - Rolling to a new segment is the journal's job

use std::sync::Arc;

use crate::record::{write_frame, JournalRecord};
use crate::segment::Segment;
use crate::{Error, Result};

pub struct SegmentWriter {
    segment: Arc<Segment>,
    /// Current write offset within segment
    position: usize,
}

impl SegmentWriter {
    /// Resume writing `segment` at `position` (the end of its valid frames).
    pub fn new(segment: Arc<Segment>, position: usize) -> Self {
        Self { segment, position }
    }

    /// Resume writing a segment whose end offset is not known yet.
    pub(crate) fn resume(segment: Arc<Segment>) -> Self {
        let scan = segment.scan(segment.last_index(), |_, _| {});
        Self::new(segment, scan.position)
    }

    pub fn segment(&self) -> &Arc<Segment> {
        &self.segment
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn next_index(&self) -> i64 {
        self.segment.last_index() + 1
    }

    /// Whether a frame of `frame_len` bytes still fits in the segment.
    pub fn can_fit(&self, frame_len: usize) -> bool {
        self.position + frame_len <= self.segment.max_size()
    }

    /// Write `record` at the end of the segment and publish it.
    ///
    /// With `durable` the frame is synced to disk before it is published.
    pub fn append(&mut self, record: &JournalRecord, durable: bool) -> Result<()> {
        let expected = self.next_index();
        if record.index != expected {
            return Err(Error::InvalidIndex {
                expected,
                actual: record.index,
            });
        }
        if !self.can_fit(record.frame_len()) {
            return Err(Error::Unsupported("record does not fit in segment"));
        }
        let len = write_frame(self.segment.map(), self.position, record)?;
        if durable {
            self.segment.map().flush_range(self.position, len)?;
        }
        self.segment.journal_index().index(record, self.position);
        self.position += len;
        self.segment.publish(record.index, record.asqn);
        Ok(())
    }

    /// Drop every record after `index` from this segment.
    ///
    /// `last_index` is lowered before any bytes are cleared so readers never
    /// walk into a half-erased frame.
    pub fn truncate(&mut self, index: i64) -> Result<()> {
        if index >= self.segment.last_index() {
            return Ok(());
        }
        let index = index.max(self.segment.first_index() - 1);
        let scan = self.segment.scan(index, |_, _| {});
        if scan.next_index != index + 1 {
            return Err(Error::Corrupt("segment frame missing during truncation"));
        }
        self.segment.publish_truncation(index, scan.last_asqn);

        let map = self.segment.map();
        if self.position > scan.position {
            map.store_u32_release(scan.position, 0)?;
            map.fill(scan.position, self.position - scan.position, 0)?;
        }
        self.position = scan.position;
        map.flush_sync()
    }

    pub fn flush(&self) -> Result<()> {
        self.segment.flush()
    }
}
