use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, TryRecvError};
use log::{debug, error};

use super::collection::DocumentCollection;
use super::datafile::DatafileState;

/// Bounded wait between synchroniser iterations when nothing happened.
const SYNCHRONISER_INTERVAL: Duration = Duration::from_millis(100);

/// Synchroniser event loop: one worker per loaded collection.
///
/// Each iteration flushes dirty ranges of all journals and compactors,
/// seals files whose full flag was set by a failed reservation, and
/// makes sure one active journal and one active compactor exist while
/// the collection accepts writes. Blocked writers are woken through the
/// journals condition.
pub(crate) fn synchroniser_main(collection: Arc<DocumentCollection>, shutdown: Receiver<()>) {
    debug!("synchroniser for collection '{}' started", collection.name());

    loop {
        let mut worked = false;

        worked |= check_sync(&collection, false);
        worked |= check_full(&collection, false);
        worked |= ensure_active(&collection, false);

        worked |= check_sync(&collection, true);
        worked |= check_full(&collection, true);
        worked |= ensure_active(&collection, true);

        worked |= flush_pending_datafiles(&collection);

        if collection.is_shutting_down() {
            break;
        }

        if !worked {
            // wait for a writer to signal the journals condition, or
            // for the interval to elapse
            let guard = collection.journals.lock().unwrap();
            let _ = collection
                .journals_cond
                .wait_timeout(guard, SYNCHRONISER_INTERVAL)
                .unwrap();
        }

        match shutdown.try_recv() {
            Ok(_) | Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }
    }

    debug!("synchroniser for collection '{}' stopped", collection.name());
}

/// Flush the dirty range of every journal (or compactor). Cursor
/// samples and updates happen under the journals lock, the msync runs
/// without it.
fn check_sync(collection: &Arc<DocumentCollection>, compactors: bool) -> bool {
    let files = {
        let lists = collection.journals.lock().unwrap();
        if compactors {
            lists.compactors.clone()
        } else {
            lists.journals.clone()
        }
    };

    let mut worked = false;

    for datafile in files {
        let (synced, written, n_written) = {
            let _lists = collection.journals.lock().unwrap();
            (datafile.synced(), datafile.written(), datafile.n_written())
        };

        if synced >= written {
            continue;
        }
        worked = true;

        let result = datafile.sync(synced, written);

        let _lists = collection.journals.lock().unwrap();
        match result {
            Ok(()) => {
                datafile.note_synced(written, n_written);
            }
            Err(err) => {
                error!("msync failed on datafile {}: {}", datafile.fid(), err);
                datafile.set_state(DatafileState::WriteError);
            }
        }
        collection.journals_cond.notify_all();
    }

    worked
}

/// Seal journals (or compactors) whose full flag is set and stage them
/// for the datafiles list. Files that went into `WriteError` are taken
/// out of rotation as well.
fn check_full(collection: &Arc<DocumentCollection>, compactors: bool) -> bool {
    let mut worked = false;

    loop {
        let candidate = {
            let mut lists = collection.journals.lock().unwrap();
            let files = if compactors {
                &mut lists.compactors
            } else {
                &mut lists.journals
            };
            let position = files
                .iter()
                .position(|datafile| datafile.is_full() || datafile.state() == DatafileState::WriteError);
            position.map(|position| files.remove(position))
        };

        let datafile = match candidate {
            Some(datafile) => datafile,
            None => break,
        };
        worked = true;

        if datafile.state() == DatafileState::WriteError {
            // fenced; leave the file on disk as is, replay will pick up
            // its clean prefix
            error!("removing journal {} after write error", datafile.fid());
            let _lists = collection.journals.lock().unwrap();
            collection.journals_cond.notify_all();
            continue;
        }

        debug!("closing full journal '{}'", datafile.path().display());
        match collection.seal_datafile(&datafile) {
            Ok(()) => {
                let mut lists = collection.journals.lock().unwrap();
                lists.pending_datafiles.push(datafile);
                collection.journals_cond.notify_all();
            }
            Err(err) => {
                error!("cannot seal datafile {}: {}", datafile.fid(), err);
                let _lists = collection.journals.lock().unwrap();
                collection.journals_cond.notify_all();
            }
        }
    }

    worked
}

/// Create a replacement journal (or compactor) when none is active.
fn ensure_active(collection: &Arc<DocumentCollection>, compactors: bool) -> bool {
    if collection.is_shutting_down() {
        return false;
    }

    let mut lists = collection.journals.lock().unwrap();
    let empty = if compactors {
        lists.compactors.is_empty()
    } else {
        lists.journals.is_empty()
    };
    if !empty {
        return false;
    }

    let result = if compactors {
        collection.create_compactor(&mut lists)
    } else {
        collection.create_journal(&mut lists)
    };
    collection.journals_cond.notify_all();

    match result {
        Ok(_) => true,
        Err(err) => {
            error!(
                "cannot create {} for collection '{}': {}",
                if compactors { "compactor" } else { "journal" },
                collection.name(),
                err
            );
            // report no progress so the loop backs off before retrying
            false
        }
    }
}

/// Move sealed journals into the datafiles list. Uses a try-lock so a
/// writer blocked on the journals condition (and holding the primary
/// lock) cannot deadlock the synchroniser.
fn flush_pending_datafiles(collection: &Arc<DocumentCollection>) -> bool {
    {
        let lists = collection.journals.lock().unwrap();
        if lists.pending_datafiles.is_empty() {
            return false;
        }
    }

    let mut docs = match collection.documents.try_write() {
        Ok(docs) => docs,
        Err(_) => return false,
    };

    let mut lists = collection.journals.lock().unwrap();
    let mut worked = false;
    for datafile in lists.pending_datafiles.drain(..) {
        docs.datafiles.push(datafile);
        worked = true;
    }
    docs.datafiles.sort_by_key(|datafile| datafile.fid());

    worked
}
