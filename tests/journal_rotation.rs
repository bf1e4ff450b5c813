use std::time::Duration;

mod common;

// journal capacity 4096: the header marker uses 32 bytes and 24 are
// kept for the footer, leaving 4040. A document with a 360 byte body
// occupies 400 bytes, so exactly ten documents fill one journal.
const BODY_SIZE: usize = 360;

#[test]
fn writing_through_journal_rotation() {
    let dir = tempfile::tempdir().unwrap();
    let database = common::open_database(dir.path());
    let (handle, collection) = common::create_small_collection(&database, "rotated");

    let mut dids = Vec::new();
    for i in 0..25u8 {
        let body = common::body_of(BODY_SIZE, b'0' + (i % 10));
        // no write may ever observe NoJournal; rotation blocks instead
        let did = collection.insert(1, &body).unwrap();
        dids.push(did);
    }

    // two journals filled up and were sealed, one stays active
    assert!(common::wait_until(Duration::from_secs(10), || {
        let counts = collection.file_counts();
        counts.datafiles == 2 && counts.journals == 1
    }));

    let collection_dir = dir.path().join(format!("collection-{}", handle.cid()));
    assert!(common::wait_until(Duration::from_secs(10), || {
        let mut journals = 0;
        let mut datafiles = 0;
        for entry in std::fs::read_dir(&collection_dir).unwrap() {
            let name = entry.unwrap().file_name();
            let name = name.to_string_lossy().into_owned();
            if name.starts_with("journal-") {
                journals += 1;
            } else if name.starts_with("datafile-") {
                datafiles += 1;
            }
        }
        journals == 1 && datafiles == 2
    }));

    for did in &dids {
        assert!(collection.get(*did).unwrap().is_some());
    }

    // everything replays after a restart
    database.close().unwrap();
    let database = common::open_database(dir.path());
    let collection = database.use_collection("rotated").unwrap();

    assert_eq!(collection.document_count(), 25);
    for did in &dids {
        let document = collection.get(*did).unwrap().expect("document must survive restart");
        assert_eq!(document.body.len(), BODY_SIZE);
    }

    database.close().unwrap();
}
