use std::path::Path;

use journal::segment::segment_path;
use journal::{Error, JournalConfig, JournalReader, SegmentedJournal, ASQN_IGNORE};
use tempfile::tempdir;

const PAYLOAD: [u8; 20] = [0x5A; 20];

/// Four records per segment.
fn config(dir: &Path) -> JournalConfig {
    JournalConfig {
        max_segment_size: 256,
        index_density: 3,
        ..JournalConfig::new(dir)
    }
}

fn filled(dir: &Path, count: usize) -> SegmentedJournal {
    let mut journal = SegmentedJournal::open(config(dir)).expect("open");
    for _ in 0..count {
        journal.append(&PAYLOAD).expect("append");
    }
    journal
}

#[test]
fn delete_after_within_active_segment() {
    let dir = tempdir().expect("tempdir");
    let mut journal = filled(dir.path(), 10);
    let mut reader = journal.open_reader().expect("reader");
    for _ in 0..10 {
        reader.next().expect("next").expect("record");
    }

    journal.delete_after(9).expect("delete_after");
    assert_eq!(journal.last_index(), 9);

    // Reader was past the cut; it lands at the new end.
    assert!(!reader.has_next().expect("has_next"));
    let replacement = journal.append(b"replacement").expect("append");
    assert_eq!(replacement.index, 10);
    assert_eq!(reader.next().expect("next"), Some(replacement));
}

#[test]
fn delete_after_removes_later_segments() {
    let dir = tempdir().expect("tempdir");
    let mut journal = filled(dir.path(), 14);
    assert_eq!(journal.segments().len(), 4);
    let mut reader = journal.open_reader().expect("reader");
    reader.seek(12).expect("seek");

    journal.delete_after(6).expect("delete_after");
    assert_eq!(journal.last_index(), 6);
    assert_eq!(journal.segments().len(), 2);
    assert!(!segment_path(dir.path(), 3).exists());
    assert!(!segment_path(dir.path(), 4).exists());
    assert!(!journal.segments()[1].is_sealed());

    assert_eq!(reader.next().expect("next"), None);
    assert_eq!(reader.seek(5).expect("seek"), 5);
    assert_eq!(reader.next().expect("next").map(|r| r.index), Some(5));

    for expected in 7..=12 {
        assert_eq!(journal.append(b"new").expect("append").index, expected);
    }
    reader.seek(7).expect("seek");
    assert_eq!(reader.next().expect("next").map(|r| r.payload), Some(b"new".to_vec()));
}

#[test]
fn delete_after_segment_boundary_reopens_sealed_segment() {
    let dir = tempdir().expect("tempdir");
    let mut journal = filled(dir.path(), 6);
    journal.delete_after(4).expect("delete_after");
    assert_eq!(journal.segments().len(), 1);
    assert!(!journal.segments()[0].is_sealed());
    assert_eq!(journal.append(&PAYLOAD).expect("append").index, 5);
    assert_eq!(journal.segments().len(), 2);
}

#[test]
fn delete_after_before_first_empties_journal() {
    let dir = tempdir().expect("tempdir");
    let mut journal = filled(dir.path(), 9);
    journal.delete_after(-3).expect("delete_after");
    assert!(journal.is_empty());
    assert_eq!(journal.first_index(), 1);
    assert_eq!(journal.last_index(), 0);
    assert_eq!(journal.append(&PAYLOAD).expect("append").index, 1);
}

#[test]
fn delete_after_beyond_last_is_noop() {
    let dir = tempdir().expect("tempdir");
    let mut journal = filled(dir.path(), 5);
    journal.delete_after(5).expect("delete_after");
    journal.delete_after(50).expect("delete_after");
    assert_eq!(journal.last_index(), 5);
}

#[test]
fn reset_restarts_at_given_index() {
    let dir = tempdir().expect("tempdir");
    let mut journal = filled(dir.path(), 10);
    let mut reader = journal.open_reader().expect("reader");
    reader.seek(4).expect("seek");

    journal.reset(100).expect("reset");
    assert!(journal.is_empty());
    assert_eq!(journal.first_index(), 100);
    assert_eq!(journal.last_index(), 99);
    assert_eq!(journal.segments().len(), 1);
    assert!(!segment_path(dir.path(), 1).exists());

    assert!(reader.next().expect("next").is_none());
    assert_eq!(reader.next_index(), 100);
    let record = journal.append(b"restart").expect("append");
    assert_eq!(record.index, 100);
    assert_eq!(reader.next().expect("next"), Some(record));
}

#[test]
fn reader_on_compacted_segment_resumes_at_first_retained() {
    let dir = tempdir().expect("tempdir");
    let mut journal = filled(dir.path(), 14);
    let mut reader = journal.open_reader().expect("reader");
    assert_eq!(reader.next().expect("next").map(|r| r.index), Some(1));
    assert_eq!(reader.next().expect("next").map(|r| r.index), Some(2));

    assert!(journal.compact(9).expect("compact"));
    assert_eq!(journal.first_index(), 9);

    assert_eq!(reader.next().expect("next").map(|r| r.index), Some(9));
    assert_eq!(reader.next().expect("next").map(|r| r.index), Some(10));
}

#[test]
fn compaction_keeps_active_segment() {
    let dir = tempdir().expect("tempdir");
    let mut journal = filled(dir.path(), 10);
    assert!(!journal.compact(0).expect("compact below first"));
    assert!(!journal.compact(3).expect("compact inside first segment"));
    assert_eq!(journal.first_index(), 1);

    assert!(journal.compact(i64::MAX).expect("compact everything"));
    assert_eq!(journal.segments().len(), 1);
    assert_eq!(journal.first_index(), 9);
    assert_eq!(journal.last_index(), 10);
    assert_eq!(journal.append(&PAYLOAD).expect("append").index, 11);
}

#[test]
fn reader_registry_tracks_open_readers() {
    let dir = tempdir().expect("tempdir");
    let mut journal = filled(dir.path(), 3);
    let first = journal.open_reader().expect("reader");
    let second = journal.open_reader().expect("reader");
    assert_eq!(journal.open_reader_count(), 2);

    first.close();
    assert_eq!(journal.open_reader_count(), 1);
    drop(second);
    assert_eq!(journal.open_reader_count(), 0);

    let mut orphan = journal.open_reader().expect("reader");
    journal.close().expect("close");
    assert!(matches!(orphan.next(), Err(Error::Closed)));
    assert!(matches!(orphan.seek(1), Err(Error::Closed)));
    assert!(matches!(orphan.seek_to_asqn(1), Err(Error::Closed)));
}

#[test]
fn compaction_keeps_asqn_high_water_mark() {
    let dir = tempdir().expect("tempdir");
    {
        let mut journal = SegmentedJournal::open(config(dir.path())).expect("open");
        for asqn in 10..=13 {
            journal.append_with_asqn(asqn, &PAYLOAD).expect("append");
        }
        for _ in 0..5 {
            journal.append(&PAYLOAD).expect("append");
        }
        assert!(journal.compact(i64::MAX).expect("compact"));
        assert_eq!(journal.first_index(), 9);
        assert_eq!(journal.last_asqn(), 13);
        assert!(matches!(
            journal.append_with_asqn(5, &PAYLOAD),
            Err(Error::InvalidAsqn { last: 13, asqn: 5 })
        ));
    }

    let mut journal = SegmentedJournal::open(config(dir.path())).expect("reopen");
    assert_eq!(journal.last_asqn(), 13);
    assert!(matches!(
        journal.append_with_asqn(12, &PAYLOAD),
        Err(Error::InvalidAsqn { last: 13, asqn: 12 })
    ));

    // Emptying the retained segment keeps the mark of the compacted ones.
    journal.delete_after(0).expect("delete_after");
    assert!(journal.is_empty());
    assert_eq!(journal.last_asqn(), 13);

    journal.reset(50).expect("reset");
    assert_eq!(journal.last_asqn(), ASQN_IGNORE);
    assert_eq!(journal.append_with_asqn(5, &PAYLOAD).expect("append").index, 50);
}

#[test]
fn delete_after_lowers_asqn_high_water_mark() {
    let dir = tempdir().expect("tempdir");
    let mut journal = SegmentedJournal::open(config(dir.path())).expect("open");
    for asqn in 1..=6 {
        journal.append_with_asqn(asqn * 10, &PAYLOAD).expect("append");
    }
    journal.delete_after(5).expect("delete_after");
    assert_eq!(journal.last_asqn(), 50);
    journal.delete_after(3).expect("delete_after");
    assert_eq!(journal.last_asqn(), 30);
    assert_eq!(journal.append_with_asqn(31, &PAYLOAD).expect("append").index, 4);
}
