//! Sequential reader over a single segment.
//!
//! # Design
//!
//! - Holds its segment alive through an `Arc`, so a compacted segment can
//!   still be drained until the journal reader notices
//! - Never reads past the segment's published `last_index`
//! - Uses the sparse index to jump close to a target before scanning
//! - No cross-segment logic (see `reader::SegmentedJournalReader`)

use std::sync::Arc;

use crate::record::{read_frame, Frame, JournalRecord};
use crate::segment::{Segment, SEG_DATA_OFFSET};

/// Cursor over the records of one segment.
///
/// ```text
/// 1. segment.create_reader()
/// 2. Loop:
///    - has_next() against the published last index
///    - next() to decode the frame at the cursor
/// 3. seek(index) / reset() to reposition
/// ```
pub struct SegmentReader {
    segment: Arc<Segment>,
    /// Byte offset of the next frame
    position: usize,
    /// Index the next frame is expected to carry
    next_index: i64,
    /// Record most recently returned by `next()`
    current: Option<JournalRecord>,
}

impl SegmentReader {
    pub fn new(segment: Arc<Segment>) -> Self {
        let next_index = segment.first_index();
        Self {
            segment,
            position: SEG_DATA_OFFSET,
            next_index,
            current: None,
        }
    }

    pub fn segment(&self) -> &Arc<Segment> {
        &self.segment
    }

    /// Whether the record at `next_index()` has been published.
    pub fn has_next(&self) -> bool {
        self.next_index <= self.segment.last_index()
    }

    /// Decode the next record and advance.
    ///
    /// Returns `None` at the end of published data, or when the bytes at the
    /// cursor no longer hold the expected record (the segment was truncated
    /// underneath this reader).
    pub fn next(&mut self) -> Option<JournalRecord> {
        if !self.has_next() {
            return None;
        }
        match read_frame(self.segment.map(), self.position) {
            Frame::Record { record, len } if record.index == self.next_index => {
                self.position += len;
                self.next_index += 1;
                self.current = Some(record.clone());
                Some(record)
            }
            _ => None,
        }
    }

    pub fn current_entry(&self) -> Option<&JournalRecord> {
        self.current.as_ref()
    }

    pub fn current_index(&self) -> Option<i64> {
        self.current.as_ref().map(|record| record.index)
    }

    pub fn next_index(&self) -> i64 {
        self.next_index
    }

    /// Back to the first record of the segment.
    pub fn reset(&mut self) {
        self.position = SEG_DATA_OFFSET;
        self.next_index = self.segment.first_index();
        self.current = None;
    }

    /// Position so that `next()` yields `index`, clamped to this segment.
    ///
    /// When `index - 1` is in the segment it becomes the current entry. An
    /// index past the last published record leaves the reader at the end.
    pub fn seek(&mut self, index: i64) {
        self.reset();
        if index <= self.segment.first_index() {
            return;
        }
        if let Some(info) = self.segment.lookup_position(index - 1) {
            self.position = info.position;
            self.next_index = info.index;
        }
        while self.next_index < index && self.has_next() {
            if self.next().is_none() {
                break;
            }
        }
    }
}
