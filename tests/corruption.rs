use vellum::{Database, DatabaseConfig};

mod common;

/// Truncating or flipping bytes in the middle of a marker must stop
/// replay at that marker; later markers in the same file are ignored
/// and the collection opens with the clean prefix.
#[test]
fn replay_stops_at_the_first_corrupt_marker() {
    let dir = tempfile::tempdir().unwrap();
    let database = common::open_database(dir.path());
    let handle = database
        .create_collection("fragile", common::small_options())
        .unwrap();
    let collection = handle.collection().unwrap();
    let collection_dir = dir.path().join(format!("collection-{}", handle.cid()));

    let first = collection.insert(0, b"first document").unwrap();
    let second = collection.insert(0, b"second document").unwrap();
    let third = collection.insert(0, b"third document").unwrap();

    let second_header = collection.document_header(second).unwrap();
    let journal_fid = second_header.fid;
    let corrupt_at = second_header.body_offset as usize;

    database.close().unwrap();

    // flip one byte inside the second marker's body
    let journal_path = collection_dir.join(format!("journal-{}.db", journal_fid));
    let mut raw = std::fs::read(&journal_path).unwrap();
    raw[corrupt_at] ^= 0xff;
    std::fs::write(&journal_path, &raw).unwrap();

    let database = Database::open(dir.path(), DatabaseConfig::default()).unwrap();
    let collection = database.use_collection("fragile").unwrap();

    // the clean prefix survives, everything from the corruption on is gone
    assert!(collection.get(first).unwrap().is_some());
    assert!(collection.get(second).unwrap().is_none());
    assert!(collection.get(third).unwrap().is_none());
    assert_eq!(collection.document_count(), 1);

    database.close().unwrap();
}

/// A truncated tail (as left behind by a crash in the middle of a
/// marker write) is discarded the same way.
#[test]
fn partial_tail_is_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let database = common::open_database(dir.path());
    let handle = database
        .create_collection("crashed", common::small_options())
        .unwrap();
    let collection = handle.collection().unwrap();
    let collection_dir = dir.path().join(format!("collection-{}", handle.cid()));

    let keeper = collection.insert(0, b"keeper").unwrap();
    let casualty = collection.insert(0, b"casualty").unwrap();
    let casualty_header = collection.document_header(casualty).unwrap();
    let journal_fid = casualty_header.fid;

    database.close().unwrap();

    // zero everything from the middle of the last marker onwards
    let journal_path = collection_dir.join(format!("journal-{}.db", journal_fid));
    let mut raw = std::fs::read(&journal_path).unwrap();
    let cut = casualty_header.offset as usize + 8;
    for byte in raw[cut..].iter_mut() {
        *byte = 0;
    }
    std::fs::write(&journal_path, &raw).unwrap();

    let database = Database::open(dir.path(), DatabaseConfig::default()).unwrap();
    let collection = database.use_collection("crashed").unwrap();

    assert!(collection.get(keeper).unwrap().is_some());
    assert!(collection.get(casualty).unwrap().is_none());

    // the journal is writable again after truncation
    let fresh = collection.insert(0, b"fresh start").unwrap();
    assert!(collection.get(fresh).unwrap().is_some());

    database.close().unwrap();
}
