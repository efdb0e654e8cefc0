use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use journal::record::frame_len;
use journal::segment::{segment_path, SEG_DATA_OFFSET};
use journal::{Error, JournalConfig, JournalReader, JournalSnapshot, SegmentedJournal};
use tempfile::tempdir;

const PAYLOAD: [u8; 20] = [0xAB; 20];

fn config(dir: &Path, segment_size: usize) -> JournalConfig {
    JournalConfig {
        max_segment_size: segment_size,
        index_density: 2,
        ..JournalConfig::new(dir)
    }
}

fn patch(path: &Path, offset: usize, bytes: &[u8]) {
    let mut file = OpenOptions::new().write(true).open(path).expect("open segment");
    file.seek(SeekFrom::Start(offset as u64)).expect("seek");
    file.write_all(bytes).expect("patch");
    file.sync_all().expect("sync");
}

fn read_all(journal: &SegmentedJournal) -> Vec<i64> {
    let mut reader = journal.open_reader().expect("reader");
    let mut indices = Vec::new();
    while let Some(record) = reader.next().expect("next") {
        indices.push(record.index);
    }
    indices
}

#[test]
fn reopen_restores_state() {
    let dir = tempdir().expect("tempdir");
    {
        let mut journal = SegmentedJournal::open(config(dir.path(), 512)).expect("open");
        for i in 0..30 {
            journal.append_with_asqn(i, &PAYLOAD).expect("append");
        }
        journal.flush().expect("flush");
    }

    let mut journal = SegmentedJournal::open(config(dir.path(), 512)).expect("reopen");
    assert_eq!(journal.first_index(), 1);
    assert_eq!(journal.last_index(), 30);
    assert_eq!(journal.last_asqn(), 29);
    assert_eq!(read_all(&journal), (1..=30).collect::<Vec<_>>());

    assert!(matches!(
        journal.append_with_asqn(3, &PAYLOAD),
        Err(Error::InvalidAsqn { last: 29, asqn: 3 })
    ));
    assert_eq!(journal.append(&PAYLOAD).expect("append").index, 31);

    let mut reader = journal.open_reader().expect("reader");
    assert_eq!(reader.seek_to_asqn(17).expect("asqn"), 18);
}

#[test]
fn corrupt_record_truncates_tail() {
    let dir = tempdir().expect("tempdir");
    {
        let mut journal = SegmentedJournal::open(config(dir.path(), 4096)).expect("open");
        for _ in 0..10 {
            journal.append(&PAYLOAD).expect("append");
        }
    }
    // Flip a payload byte of record 8.
    let record_eight = SEG_DATA_OFFSET + 7 * frame_len(PAYLOAD.len());
    patch(&segment_path(dir.path(), 1), record_eight + 24, &[0x00]);

    let mut journal = SegmentedJournal::open(config(dir.path(), 4096)).expect("reopen");
    assert_eq!(journal.last_index(), 7);
    assert_eq!(read_all(&journal), (1..=7).collect::<Vec<_>>());
    assert_eq!(journal.append(b"fresh").expect("append").index, 8);
    drop(journal);

    let journal = SegmentedJournal::open(config(dir.path(), 4096)).expect("reopen again");
    assert_eq!(journal.last_index(), 8);
}

#[test]
fn torn_frame_is_ignored() {
    let dir = tempdir().expect("tempdir");
    {
        let mut journal = SegmentedJournal::open(config(dir.path(), 4096)).expect("open");
        for _ in 0..5 {
            journal.append(&PAYLOAD).expect("append");
        }
    }
    // Length word of a sixth frame whose body never made it to disk.
    let end = SEG_DATA_OFFSET + 5 * frame_len(PAYLOAD.len());
    patch(&segment_path(dir.path(), 1), end, &36u32.to_le_bytes());

    let mut journal = SegmentedJournal::open(config(dir.path(), 4096)).expect("reopen");
    assert_eq!(journal.last_index(), 5);
    let record = journal.append(b"after-crash").expect("append");
    assert_eq!(record.index, 6);
    let mut reader = journal.open_reader().expect("reader");
    reader.seek(6).expect("seek");
    assert_eq!(reader.next().expect("next"), Some(record));
}

#[test]
fn non_contiguous_segments_are_discarded() {
    let dir = tempdir().expect("tempdir");
    {
        let mut journal = SegmentedJournal::open(config(dir.path(), 256)).expect("open");
        for _ in 0..12 {
            journal.append(&PAYLOAD).expect("append");
        }
        assert_eq!(journal.segments().len(), 3);
    }
    std::fs::remove_file(segment_path(dir.path(), 2)).expect("remove middle segment");

    let mut journal = SegmentedJournal::open(config(dir.path(), 256)).expect("reopen");
    assert_eq!(journal.segments().len(), 1);
    assert_eq!(journal.last_index(), 4);
    assert!(!segment_path(dir.path(), 3).exists());
    assert_eq!(journal.append(&PAYLOAD).expect("append").index, 5);
    assert!(segment_path(dir.path(), 4).exists());
}

#[test]
fn corrupt_descriptor_drops_segment() {
    let dir = tempdir().expect("tempdir");
    {
        let mut journal = SegmentedJournal::open(config(dir.path(), 256)).expect("open");
        for _ in 0..6 {
            journal.append(&PAYLOAD).expect("append");
        }
    }
    patch(&segment_path(dir.path(), 2), 0, b"XXXX");

    let journal = SegmentedJournal::open(config(dir.path(), 256)).expect("reopen");
    assert_eq!(journal.last_index(), 4);
    assert!(!segment_path(dir.path(), 2).exists());
    // The surviving segment was sealed by the roll; it is writable again.
    assert!(!journal.segments()[0].is_sealed());
}

#[test]
fn unpublished_segments_are_removed() {
    let dir = tempdir().expect("tempdir");
    {
        let mut journal = SegmentedJournal::open(config(dir.path(), 512)).expect("open");
        journal.append(&PAYLOAD).expect("append");
    }
    let leftover = dir.path().join("000000009.log.tmp");
    std::fs::write(&leftover, b"partial").expect("write tmp");

    let journal = SegmentedJournal::open(config(dir.path(), 512)).expect("reopen");
    assert!(!leftover.exists());
    assert_eq!(journal.last_index(), 1);
}

#[test]
fn compaction_survives_reopen() {
    let dir = tempdir().expect("tempdir");
    {
        let mut journal = SegmentedJournal::open(config(dir.path(), 256)).expect("open");
        for _ in 0..14 {
            journal.append(&PAYLOAD).expect("append");
        }
        assert!(journal.compact(10).expect("compact"));
        assert_eq!(journal.first_index(), 9);
    }

    let journal = SegmentedJournal::open(config(dir.path(), 256)).expect("reopen");
    assert_eq!(journal.first_index(), 9);
    assert_eq!(journal.last_index(), 14);
    assert!(!segment_path(dir.path(), 1).exists());
    assert_eq!(read_all(&journal), (9..=14).collect::<Vec<_>>());
}

#[test]
fn second_writer_is_rejected() {
    let dir = tempdir().expect("tempdir");
    let journal = SegmentedJournal::open(config(dir.path(), 512)).expect("open");
    assert!(matches!(
        SegmentedJournal::open(config(dir.path(), 512)),
        Err(Error::WriterAlreadyActive)
    ));
    drop(journal);
    SegmentedJournal::open(config(dir.path(), 512)).expect("open after release");
}

#[test]
fn snapshot_reads_without_repairing() {
    let dir = tempdir().expect("tempdir");
    let empty = JournalSnapshot::open(&config(dir.path(), 256)).expect("snapshot of empty dir");
    assert!(empty.segments().is_empty());
    assert!(matches!(empty.open_reader(), Err(Error::Closed)));
    assert_eq!(std::fs::read_dir(dir.path()).expect("read_dir").count(), 0);

    let journal = {
        let mut journal = SegmentedJournal::open(config(dir.path(), 256)).expect("open");
        for i in 0..10 {
            journal.append_with_asqn(i, &PAYLOAD).expect("append");
        }
        journal
    };
    // Flip a payload byte of record 6, the second record of segment 2.
    let record_six = SEG_DATA_OFFSET + frame_len(PAYLOAD.len());
    patch(&segment_path(dir.path(), 2), record_six + 24, &[0x00]);

    // Works next to the live writer and stops at the bad frame.
    let snapshot = JournalSnapshot::open(&config(dir.path(), 256)).expect("snapshot");
    assert_eq!(snapshot.first_index(), 1);
    assert_eq!(snapshot.last_index(), 5);
    assert_eq!(snapshot.last_asqn(), 4);
    assert_eq!(snapshot.segments().len(), 2);
    let mut reader = snapshot.open_reader().expect("reader");
    assert_eq!(reader.seek_to_asqn(3).expect("asqn"), 4);
    drop(reader);
    drop(journal);

    // Nothing was cut off or discarded on disk.
    assert!(segment_path(dir.path(), 3).exists());
    let bytes = std::fs::read(segment_path(dir.path(), 2)).expect("read segment");
    assert_ne!(bytes[record_six], 0);

    let journal = SegmentedJournal::open(config(dir.path(), 256)).expect("reopen");
    assert_eq!(journal.last_index(), 5);
    assert!(!segment_path(dir.path(), 3).exists());
}
