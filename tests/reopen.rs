use std::collections::HashMap;

use vellum::store::CompactionPolicy;
use vellum::{Database, DatabaseConfig};

mod common;

fn no_compaction_config() -> DatabaseConfig {
    DatabaseConfig {
        // keep the datafile accounting stable while we compare it
        compaction: CompactionPolicy {
            dead_bytes_min: u64::max_value(),
        },
        ..DatabaseConfig::default()
    }
}

#[derive(Debug, PartialEq)]
struct Snapshot {
    documents: HashMap<u64, (u64, u32, Option<Vec<u8>>)>,
    statistics: Vec<vellum::store::DatafileInfo>,
}

fn snapshot(collection: &vellum::store::DocumentCollection, dids: &[u64]) -> Snapshot {
    let mut documents = HashMap::new();
    for did in dids {
        let header = match collection.document_header(*did) {
            Some(header) => header,
            None => continue,
        };
        let body = collection.get(*did).unwrap().map(|document| document.body);
        documents.insert(*did, (header.rid, header.shape, body));
    }
    Snapshot {
        documents,
        statistics: collection.datafile_statistics(),
    }
}

/// `open(close(open(p)))` must equal `open(p)`: same primary index
/// contents, same per-datafile counters.
#[test]
fn reopen_round_trip_preserves_state() {
    let dir = tempfile::tempdir().unwrap();
    let _ = env_logger::builder().is_test(true).try_init();
    let database = Database::open(dir.path(), no_compaction_config()).unwrap();
    let handle = database
        .create_collection("stable", common::small_options())
        .unwrap();
    let collection = handle.collection().unwrap();

    // a mix of creates, updates and deletes across a journal rotation
    let mut dids = Vec::new();
    for i in 0..15u8 {
        let body = common::body_of(300, b'a' + (i % 20));
        dids.push(collection.insert(i as u32, &body).unwrap());
    }
    for did in dids.iter().take(5) {
        collection.update(*did, 99, b"updated body", None).unwrap();
    }
    for did in dids.iter().skip(5).take(3) {
        collection.remove(*did, None).unwrap();
    }

    let before = snapshot(&collection, &dids);
    database.close().unwrap();

    let database = Database::open(dir.path(), no_compaction_config()).unwrap();
    let collection = database.use_collection("stable").unwrap();
    let after_first = snapshot(&collection, &dids);
    assert_eq!(before, after_first);
    database.close().unwrap();

    // and once more: replay is idempotent
    let database = Database::open(dir.path(), no_compaction_config()).unwrap();
    let collection = database.use_collection("stable").unwrap();
    let after_second = snapshot(&collection, &dids);
    assert_eq!(after_first, after_second);

    // every accounting entry belongs to a file that holds at least one
    // document, superseded revision or deletion marker
    for info in &after_second.statistics {
        assert!(
            info.number_alive + info.number_dead + info.number_deletion > 0,
            "empty accounting entry for datafile {}",
            info.fid
        );
    }

    database.close().unwrap();
}

/// Ticks issued after a restart stay above every persisted tick.
#[test]
fn ticks_advance_past_persisted_state() {
    let dir = tempfile::tempdir().unwrap();
    let database = common::open_database(dir.path());
    let (_handle, collection) = common::create_small_collection(&database, "ticking");

    let mut last = 0;
    for _ in 0..10 {
        last = collection.insert(0, b"tick").unwrap();
    }
    database.close().unwrap();

    let database = common::open_database(dir.path());
    let collection = database.use_collection("ticking").unwrap();
    let fresh = collection.insert(0, b"tock").unwrap();
    assert!(
        fresh > last,
        "fresh tick {} must exceed persisted tick {}",
        fresh,
        last
    );
    database.close().unwrap();
}
