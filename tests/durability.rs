use vellum::store::{align_size, MarkerRef, MarkerType, COMMON_HEADER_SIZE};
use vellum::{CollectionOptions, Database, DatabaseConfig};

mod common;

/// Walk the raw bytes of a marker file (read fresh from disk, not
/// through the mapping) and collect the document ids of all valid
/// document markers.
fn scan_document_ids(raw: &[u8]) -> Vec<u64> {
    let mut dids = Vec::new();
    let mut offset = 0usize;
    while offset + COMMON_HEADER_SIZE as usize <= raw.len() {
        let marker = match MarkerRef::parse(&raw[offset..]) {
            Some(marker) => marker,
            None => break,
        };
        if !marker.check_crc() {
            break;
        }
        if marker.marker_type() == MarkerType::Document {
            dids.push(marker.document().unwrap().did);
        }
        if marker.marker_type() == MarkerType::FileFooter {
            break;
        }
        offset += align_size(marker.size()) as usize;
    }
    dids
}

#[test]
fn wait_for_sync_makes_every_write_durable() {
    let dir = tempfile::tempdir().unwrap();
    let database = common::open_database(dir.path());
    let handle = database
        .create_collection(
            "synced",
            CollectionOptions {
                maximal_size: Some(4096),
                wait_for_sync: Some(true),
                ..CollectionOptions::default()
            },
        )
        .unwrap();
    let collection = handle.collection().unwrap();
    let collection_dir = dir.path().join(format!("collection-{}", handle.cid()));

    for round in 0..5u64 {
        let did = collection.insert(0, format!("round {}", round).as_bytes()).unwrap();

        // the marker must be on disk the moment insert returns
        let mut found = false;
        for entry in std::fs::read_dir(&collection_dir).unwrap() {
            let path = entry.unwrap().path();
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            if !name.starts_with("journal-") && !name.starts_with("datafile-") {
                continue;
            }
            let raw = std::fs::read(&path).unwrap();
            if scan_document_ids(&raw).contains(&did) {
                found = true;
                break;
            }
        }
        assert!(found, "document {} is not durable after insert returned", did);
    }

    database.close().unwrap();
}

#[test]
fn relaxed_sync_discipline_is_durable_after_close() {
    let dir = tempfile::tempdir().unwrap();
    let database = common::open_database(dir.path());
    let handle = database
        .create_collection(
            "relaxed",
            CollectionOptions {
                maximal_size: Some(1024 * 1024),
                sync_after_bytes: 1_000_000,
                ..CollectionOptions::default()
            },
        )
        .unwrap();
    let collection = handle.collection().unwrap();

    let mut dids = Vec::new();
    for i in 0..100u32 {
        dids.push(collection.insert(0, format!("doc {}", i).as_bytes()).unwrap());
    }
    // writers did not block on the synchroniser here; a clean close
    // still flushes everything
    database.close().unwrap();

    let database = Database::open(dir.path(), DatabaseConfig::default()).unwrap();
    let collection = database.use_collection("relaxed").unwrap();
    assert_eq!(collection.document_count(), 100);
    for did in dids {
        assert!(collection.get(did).unwrap().is_some());
    }
    database.close().unwrap();
}
