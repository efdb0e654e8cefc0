//! Segmented, memory-mapped append-only journal.
//!
//! Records get contiguous indices and an optional application sequence
//! number (ASQN). They are framed with a CRC32 into fixed-size segment files;
//! a sparse in-memory index maps indices to byte positions and ASQNs to
//! indices so readers can seek without scanning the whole journal.
//!
//! ```text
//! let mut journal = SegmentedJournal::open(JournalConfig::new(dir))?;
//! journal.append_with_asqn(7, b"payload")?;
//! let mut reader = journal.open_reader()?;
//! reader.seek_to_asqn(7)?;
//! ```

pub mod config;
pub mod error;
pub mod index;
pub mod journal;
pub mod mmap;
pub mod reader;
pub mod record;
pub mod segment;
pub mod segment_reader;
pub mod segment_writer;
pub mod writer_lock;

pub use config::JournalConfig;
pub use error::{Error, Result};
pub use index::{IndexInfo, JournalIndex, SparseJournalIndex};
pub use journal::{JournalSnapshot, SegmentedJournal};
pub use reader::{JournalReader, SegmentedJournalReader};
pub use record::{JournalRecord, ASQN_IGNORE};
pub use segment::Segment;
