use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{select, Receiver};
use log::{debug, error};

use super::barrier::BarrierAction;
use super::collection::{CollectionHandle, CollectionStatus, DocumentCollection};
use super::collection_files::deleted_collection_dirname;
use super::datafile::Datafile;

/// Bounded wait between cleanup iterations.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(1);

/// Cleanup event loop: one worker per loaded collection. Drains the
/// barrier list head and executes deferred actions; a reader element at
/// the head parks the whole list until that reader releases its pin.
pub(crate) fn cleanup_main(
    handle: Arc<CollectionHandle>,
    shutdown: Receiver<()>,
    wake: Receiver<()>,
) {
    debug!("cleanup for collection '{}' started", handle.name());

    loop {
        let collection = match handle.try_collection() {
            Some(collection) => collection,
            None => break,
        };

        if drain_barriers(&handle, &collection, false) {
            // the collection was unloaded or dropped under our feet
            break;
        }

        select! {
            recv(shutdown) -> _ => break,
            recv(wake) -> _ => {},
            default(CLEANUP_INTERVAL) => {},
        }
    }

    debug!("cleanup for collection '{}' stopped", handle.name());
}

/// Execute barrier actions until the head is a reader element or the
/// list is empty. With `force` set, actions are pulled out from behind
/// reader elements as well (final drain during shutdown). Returns true
/// when a collection-level action unloaded or dropped the collection.
pub(crate) fn drain_barriers(
    handle: &Arc<CollectionHandle>,
    collection: &Arc<DocumentCollection>,
    force: bool,
) -> bool {
    loop {
        let action = if force {
            collection.barriers.pop_action_forced()
        } else {
            collection.barriers.pop_action()
        };

        match action {
            None => return false,
            Some(BarrierAction::DatafileRetire { datafile, unlink }) => {
                retire_datafile(collection, datafile, unlink);
            }
            Some(BarrierAction::CollectionUnload) => {
                if execute_unload(handle, collection) {
                    return true;
                }
            }
            Some(BarrierAction::CollectionDrop) => {
                if execute_drop(handle, collection) {
                    return true;
                }
            }
        }
    }
}

/// Rename a retired datafile to its `deleted-` name, close it, and
/// optionally unlink it from disk.
fn retire_datafile(collection: &Arc<DocumentCollection>, datafile: Arc<Datafile>, unlink: bool) {
    let old_path = datafile.path();
    let new_path = super::deleted_datafile_path(collection.directory(), datafile.fid());

    if let Err(err) = datafile.rename(new_path.clone()) {
        error!(
            "cannot rename obsolete datafile '{}' to '{}': {}",
            old_path.display(), new_path.display(), err
        );
    }

    debug!("finished compacting datafile '{}'", datafile.path().display());

    datafile.close();
    collection.files.write().unwrap().remove(&datafile.fid());

    if unlink {
        debug!("wiping compacted datafile from disk");
        if let Err(err) = std::fs::remove_file(&new_path) {
            error!("cannot wipe obsolete datafile '{}': {}", new_path.display(), err);
        }
    }
}

/// Unload the collection if it is still in `Unloading` state and no
/// reader pins remain. A pin placed after the unload request parks the
/// action for a later iteration.
fn execute_unload(handle: &Arc<CollectionHandle>, collection: &Arc<DocumentCollection>) -> bool {
    if handle.status() != CollectionStatus::Unloading {
        return false;
    }
    if collection.barriers.has_elements() {
        collection.barriers.push_action(BarrierAction::CollectionUnload);
        return false;
    }

    collection.close_files();
    handle.clear_collection();
    handle.set_status(CollectionStatus::Unloaded);
    debug!("unloaded collection '{}'", handle.name());
    true
}

/// Drop the collection: close everything and rename the collection
/// directory to `deleted-<cid>`, optionally removing it entirely.
fn execute_drop(handle: &Arc<CollectionHandle>, collection: &Arc<DocumentCollection>) -> bool {
    if handle.status() == CollectionStatus::Deleted {
        return true;
    }
    if collection.barriers.has_elements() {
        collection.barriers.push_action(BarrierAction::CollectionDrop);
        return false;
    }

    collection.close_files();
    handle.clear_collection();

    let directory = handle.directory().clone();
    let target = match directory.parent() {
        Some(parent) => parent.join(deleted_collection_dirname(handle.cid())),
        None => directory.clone(),
    };
    if let Err(err) = std::fs::rename(&directory, &target) {
        error!(
            "cannot rename dropped collection '{}' to '{}': {}",
            directory.display(), target.display(), err
        );
    } else if collection.runtime.remove_on_dropped {
        if let Err(err) = std::fs::remove_dir_all(&target) {
            error!("cannot remove dropped collection '{}': {}", target.display(), err);
        }
    }

    handle.set_status(CollectionStatus::Deleted);
    debug!("dropped collection '{}'", handle.name());
    true
}
