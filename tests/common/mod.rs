#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use vellum::store::{CollectionHandle, DocumentCollection};
use vellum::{CollectionOptions, Database, DatabaseConfig};

/// Options for a tiny collection whose journals hold ten 360-byte
/// documents each.
pub fn small_options() -> CollectionOptions {
    CollectionOptions {
        maximal_size: Some(4096),
        ..CollectionOptions::default()
    }
}

pub fn open_database(path: &std::path::Path) -> Database {
    let _ = env_logger::builder().is_test(true).try_init();
    Database::open(path, DatabaseConfig::default()).expect("cannot open database")
}

pub fn create_small_collection(
    database: &Database,
    name: &str,
) -> (Arc<CollectionHandle>, Arc<DocumentCollection>) {
    let handle = database
        .create_collection(name, small_options())
        .expect("cannot create collection");
    let collection = handle.collection().expect("collection must be loaded");
    (handle, collection)
}

/// A body of exactly `len` bytes.
pub fn body_of(len: usize, fill: u8) -> Vec<u8> {
    vec![fill; len]
}

/// Poll `predicate` until it holds or `timeout` elapses.
pub fn wait_until<F: Fn() -> bool>(timeout: Duration, predicate: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    predicate()
}
