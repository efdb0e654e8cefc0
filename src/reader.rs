//! Readers over a `SegmentedJournal`.
//!
//! A reader walks the journal one segment at a time. It holds the current
//! segment alive through an `Arc`, so compaction or truncation by the writer
//! never invalidates memory underneath it; instead every call first compares
//! the journal's table generation with the one it last saw and repositions
//! at the same logical index when they differ.

use std::sync::Arc;

use crate::index::JournalIndex;
use crate::journal::JournalState;
use crate::record::JournalRecord;
use crate::segment::Segment;
use crate::segment_reader::SegmentReader;
use crate::{Error, Result};

/// Cursor over journal records.
///
/// Seek operations return the index the next call to `next()` would yield.
pub trait JournalReader {
    fn has_next(&mut self) -> Result<bool>;

    fn next(&mut self) -> Result<Option<JournalRecord>>;

    /// Position so the next record returned has index `index`, clamped to
    /// `[first_index, last_index + 1]`.
    fn seek(&mut self, index: i64) -> Result<i64>;

    fn seek_to_first(&mut self) -> Result<i64>;

    /// Position at the last record, so `next()` yields it.
    fn seek_to_last(&mut self) -> Result<i64>;

    /// Position at the first record carrying `asqn`, or at the last record
    /// whose ASQN is below it.
    fn seek_to_asqn(&mut self, asqn: i64) -> Result<i64>;

    /// Release the reader. Dropping it has the same effect.
    fn close(self)
    where
        Self: Sized,
    {
        drop(self);
    }
}

pub struct SegmentedJournalReader {
    id: u64,
    state: Arc<JournalState>,
    reader: SegmentReader,
    /// Last record of the previous segment, kept across segment switches.
    previous: Option<JournalRecord>,
    generation: u64,
}

impl SegmentedJournalReader {
    pub(crate) fn new(state: Arc<JournalState>) -> Result<Self> {
        let segment = state.first_segment().ok_or(Error::Closed)?;
        let generation = state.generation();
        let id = state.register_reader();
        Ok(Self {
            id,
            state,
            reader: segment.create_reader(),
            previous: None,
            generation,
        })
    }

    /// Index of the record most recently returned, if any.
    pub fn current_index(&self) -> Option<i64> {
        self.current_entry().map(|record| record.index)
    }

    pub fn current_entry(&self) -> Option<&JournalRecord> {
        self.reader.current_entry().or(self.previous.as_ref())
    }

    /// Index the next call to `next()` would return.
    pub fn next_index(&self) -> i64 {
        self.reader.next_index()
    }

    fn segment(&self) -> &Arc<Segment> {
        self.reader.segment()
    }

    /// Fail once the journal is closed; reposition after structural changes.
    fn sync(&mut self) -> Result<()> {
        if !self.state.is_open() {
            return Err(Error::Closed);
        }
        let generation = self.state.generation();
        if generation != self.generation || !self.segment().is_open() {
            self.generation = generation;
            let target = self.reader.next_index();
            let first = self.state.first_segment().ok_or(Error::Closed)?;
            self.reader = first.create_reader();
            self.previous = None;
            self.seek_inner(target);
        }
        Ok(())
    }

    fn replace_segment(&mut self, segment: Arc<Segment>) {
        if Arc::ptr_eq(self.segment(), &segment) {
            self.reader.reset();
        } else {
            self.reader = segment.create_reader();
        }
    }

    /// Move to the next segment when the current one is drained and its
    /// successor starts right where this one ends.
    fn advance_segment(&mut self) -> bool {
        let next = match self.state.next_segment(self.segment().first_index()) {
            Some(next) if next.first_index() == self.reader.next_index() => next,
            _ => return false,
        };
        self.previous = self.reader.current_entry().cloned().or(self.previous.take());
        self.replace_segment(next);
        true
    }

    fn has_next_inner(&mut self) -> bool {
        if self.reader.has_next() {
            return true;
        }
        self.advance_segment() && self.reader.has_next()
    }

    fn next_inner(&mut self) -> Option<JournalRecord> {
        if !self.reader.has_next() && !self.advance_segment() {
            return None;
        }
        self.reader.next()
    }

    fn seek_inner(&mut self, index: i64) -> i64 {
        let next_index = self.reader.next_index();
        if index < next_index {
            self.rewind(index);
        } else if index > next_index {
            self.forward(index);
        } else {
            self.reader.seek(index);
        }
        self.reader.next_index()
    }

    fn rewind(&mut self, index: i64) {
        if self.segment().first_index() >= index {
            // Land at the end of the segment holding `index - 1` so it
            // becomes the current entry.
            if let Some(segment) = self.state.segment_containing(index.saturating_sub(1)) {
                self.replace_segment(segment);
            } else if let Some(first) = self.state.first_segment() {
                self.replace_segment(first);
            }
        }
        self.reader.seek(index);
        self.previous = None;
    }

    fn forward(&mut self, index: i64) {
        if let Some(segment) = self.state.segment_containing(index.saturating_sub(1)) {
            if !Arc::ptr_eq(self.segment(), &segment) {
                self.previous = None;
                self.reader = segment.create_reader();
            }
        }
        self.reader.seek(index);
        while self.reader.next_index() < index && self.has_next_inner() {
            if self.next_inner().is_none() {
                break;
            }
        }
    }

    fn seek_to_first_inner(&mut self) -> Result<i64> {
        let first = self.state.first_segment().ok_or(Error::Closed)?;
        self.replace_segment(first);
        self.previous = None;
        Ok(self.reader.next_index())
    }
}

impl JournalReader for SegmentedJournalReader {
    fn has_next(&mut self) -> Result<bool> {
        self.sync()?;
        Ok(self.has_next_inner())
    }

    fn next(&mut self) -> Result<Option<JournalRecord>> {
        self.sync()?;
        Ok(self.next_inner())
    }

    fn seek(&mut self, index: i64) -> Result<i64> {
        self.sync()?;
        Ok(self.seek_inner(index))
    }

    fn seek_to_first(&mut self) -> Result<i64> {
        self.sync()?;
        self.seek_to_first_inner()
    }

    fn seek_to_last(&mut self) -> Result<i64> {
        self.sync()?;
        let last = self.state.last_segment().ok_or(Error::Closed)?;
        self.replace_segment(last);
        self.previous = None;
        let last_index = self.state.last_index();
        self.seek_inner(last_index);
        Ok(last_index)
    }

    fn seek_to_asqn(&mut self, asqn: i64) -> Result<i64> {
        self.sync()?;
        // Start from a sample strictly below `asqn` so an earlier record
        // carrying the same ASQN is not skipped.
        let start = match self.state.index().lookup_asqn(asqn.saturating_sub(1)) {
            Some(index) => self.seek_inner(index),
            None => self.seek_to_first_inner()?,
        };

        let mut candidate = None;
        while self.has_next_inner() {
            let record = match self.next_inner() {
                Some(record) => record,
                None => break,
            };
            if record.asqn <= asqn && (record.has_asqn() || asqn < 0) {
                candidate = Some(record.index);
            }
            if record.asqn >= asqn {
                break;
            }
        }

        Ok(self.seek_inner(candidate.unwrap_or(start)))
    }
}

impl Drop for SegmentedJournalReader {
    fn drop(&mut self) {
        self.state.deregister_reader(self.id);
    }
}
