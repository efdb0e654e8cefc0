use std::thread;

use journal::{JournalConfig, JournalReader, SegmentedJournal};
use tempfile::tempdir;

const RECORDS: i64 = 2_000;

#[test]
fn readers_follow_a_live_writer() {
    let dir = tempdir().expect("tempdir");
    let config = JournalConfig {
        max_segment_size: 4096,
        index_density: 16,
        ..JournalConfig::new(dir.path())
    };
    let mut journal = SegmentedJournal::open(config).expect("open");
    let readers = [
        journal.open_reader().expect("reader"),
        journal.open_reader().expect("reader"),
    ];

    let consumers: Vec<_> = readers
        .into_iter()
        .map(|mut reader| {
            thread::spawn(move || {
                let mut expected = 1i64;
                while expected <= RECORDS {
                    match reader.next().expect("next") {
                        Some(record) => {
                            assert_eq!(record.index, expected);
                            assert_eq!(record.asqn, expected * 3);
                            assert_eq!(record.payload, expected.to_le_bytes());
                            expected += 1;
                        }
                        None => thread::yield_now(),
                    }
                }
                reader
            })
        })
        .collect();

    let producer = thread::spawn(move || {
        for i in 1..=RECORDS {
            journal
                .append_with_asqn(i * 3, &i.to_le_bytes())
                .expect("append");
        }
        journal
    });

    let journal = producer.join().expect("producer");
    assert!(journal.segments().len() > 10);
    for consumer in consumers {
        let mut reader = consumer.join().expect("consumer");
        assert!(!reader.has_next().expect("has_next"));
        assert_eq!(reader.seek_to_asqn(301).expect("asqn"), 100);
    }
}
