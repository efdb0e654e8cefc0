//! Sparse in-memory index over the journal.
//!
//! Every `density`-th record is sampled. A sample maps the record index to
//! its byte position inside the owning segment, and, when the record carries
//! one, its ASQN to the record index. Samples are rebuilt from the segments
//! when a journal is opened.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::record::JournalRecord;

pub const DEFAULT_INDEX_DENSITY: u64 = 100;

/// Location of a sampled record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexInfo {
    pub index: i64,
    pub position: usize,
}

pub trait JournalIndex: Send + Sync {
    /// Offer a freshly written record; sampled according to the density.
    fn index(&self, record: &JournalRecord, position: usize);

    /// Sample with the greatest index `<= index`.
    fn lookup(&self, index: i64) -> Option<IndexInfo>;

    /// Record index of the sample with the greatest ASQN `<= asqn`.
    fn lookup_asqn(&self, asqn: i64) -> Option<i64>;

    /// Drop samples for indices greater than `index`.
    fn delete_after(&self, index: i64);

    /// Drop samples for indices lower than `index`.
    fn delete_until(&self, index: i64);

    fn clear(&self);
}

#[derive(Default)]
struct Samples {
    positions: BTreeMap<i64, usize>,
    asqns: BTreeMap<i64, i64>,
}

pub struct SparseJournalIndex {
    density: u64,
    samples: RwLock<Samples>,
}

impl SparseJournalIndex {
    pub fn new(density: u64) -> Self {
        Self {
            density: density.max(1),
            samples: RwLock::new(Samples::default()),
        }
    }

    /// Number of sampled positions currently held.
    pub fn len(&self) -> usize {
        self.read().positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> RwLockReadGuard<'_, Samples> {
        self.samples.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Samples> {
        self.samples.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for SparseJournalIndex {
    fn default() -> Self {
        Self::new(DEFAULT_INDEX_DENSITY)
    }
}

impl JournalIndex for SparseJournalIndex {
    fn index(&self, record: &JournalRecord, position: usize) {
        if record.index.rem_euclid(self.density as i64) != 0 {
            return;
        }
        let mut samples = self.write();
        samples.positions.insert(record.index, position);
        if record.has_asqn() {
            samples.asqns.insert(record.asqn, record.index);
        }
    }

    fn lookup(&self, index: i64) -> Option<IndexInfo> {
        self.read()
            .positions
            .range(..=index)
            .next_back()
            .map(|(&index, &position)| IndexInfo { index, position })
    }

    fn lookup_asqn(&self, asqn: i64) -> Option<i64> {
        self.read()
            .asqns
            .range(..=asqn)
            .next_back()
            .map(|(_, &index)| index)
    }

    fn delete_after(&self, index: i64) {
        let mut samples = self.write();
        samples.positions.retain(|&sampled, _| sampled <= index);
        samples.asqns.retain(|_, &mut sampled| sampled <= index);
    }

    fn delete_until(&self, index: i64) {
        let mut samples = self.write();
        samples.positions.retain(|&sampled, _| sampled >= index);
        samples.asqns.retain(|_, &mut sampled| sampled >= index);
    }

    fn clear(&self) {
        let mut samples = self.write();
        samples.positions.clear();
        samples.asqns.clear();
    }
}
