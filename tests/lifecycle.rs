use std::time::Duration;

use vellum::store::CollectionStatus;
use vellum::{Database, DatabaseConfig, Error};

mod common;

#[test]
fn unload_and_reload_keeps_the_data() {
    let dir = tempfile::tempdir().unwrap();
    let database = common::open_database(dir.path());
    let (handle, collection) = common::create_small_collection(&database, "cycled");

    let did = collection.insert(4, b"survives unload").unwrap();
    drop(collection);

    database.unload_collection(&handle).unwrap();
    assert!(common::wait_until(Duration::from_secs(10), || {
        handle.status() == CollectionStatus::Unloaded
    }));

    // CRUD is rejected while unloaded
    match handle.collection() {
        Err(Error::NotLoaded) => {}
        _ => panic!("collection access must fail while unloaded"),
    }

    let collection = database.load_collection(&handle).unwrap();
    assert_eq!(handle.status(), CollectionStatus::Loaded);
    let document = collection.get(did).unwrap().expect("document lost by unload");
    assert_eq!(document.shape, 4);

    database.close().unwrap();
}

#[test]
fn drop_removes_the_collection_directory() {
    let dir = tempfile::tempdir().unwrap();
    let database = common::open_database(dir.path());
    let (handle, collection) = common::create_small_collection(&database, "doomed");

    collection.insert(0, b"about to go").unwrap();
    drop(collection);

    let collection_dir = handle.directory().clone();
    assert!(collection_dir.exists());

    database.drop_collection(&handle).unwrap();

    // the name is free immediately
    assert!(database.collection_by_name("doomed").is_none());

    assert!(common::wait_until(Duration::from_secs(10), || {
        handle.status() == CollectionStatus::Deleted
    }));
    assert!(common::wait_until(Duration::from_secs(10), || {
        !collection_dir.exists()
    }));

    // the name can be reused
    database.create_collection("doomed", common::small_options()).unwrap();

    database.close().unwrap();
}

#[test]
fn dropped_collections_stay_gone_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let database = common::open_database(dir.path());
    let (handle, _collection) = common::create_small_collection(&database, "ghost");
    database.drop_collection(&handle).unwrap();
    assert!(common::wait_until(Duration::from_secs(10), || {
        handle.status() == CollectionStatus::Deleted
    }));
    database.close().unwrap();

    let database = Database::open(dir.path(), DatabaseConfig::default()).unwrap();
    assert!(database.collection_by_name("ghost").is_none());
    database.close().unwrap();
}

#[test]
fn unloaded_collections_are_registered_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let database = common::open_database(dir.path());
    let (_handle, collection) = common::create_small_collection(&database, "registered");
    collection.insert(1, b"hello").unwrap();
    drop(collection);
    database.close().unwrap();

    let database = Database::open(dir.path(), DatabaseConfig::default()).unwrap();
    let handle = database
        .collection_by_name("registered")
        .expect("collection must be registered");
    assert_eq!(handle.status(), CollectionStatus::Unloaded);

    let collections = database.collections();
    assert_eq!(collections.len(), 1);
    assert_eq!(collections[0].name(), "registered");

    let collection = database.load_collection(&handle).unwrap();
    assert_eq!(collection.document_count(), 1);
    database.close().unwrap();
}
