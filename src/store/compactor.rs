use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{debug, error, trace, warn};

use crate::error::Result;

use super::barrier::BarrierAction;
use super::collection::DocumentCollection;
use super::datafile::Datafile;
use super::datafile_info::DatafileInfo;
use super::marker::{MarkerRef, MarkerType, align_size};

/// Cadence of the compaction worker.
const COMPACTOR_INTERVAL: Duration = Duration::from_secs(1);

/// When to compact a datafile. The baseline compacts any file with at
/// least one dead marker; `dead_bytes_min` raises the bar for
/// deployments where rewriting small files is not worth it.
#[derive(Debug, Clone, Copy)]
pub struct CompactionPolicy {
    pub dead_bytes_min: u64,
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        CompactionPolicy { dead_bytes_min: 0 }
    }
}

impl CompactionPolicy {
    fn qualifies(&self, info: &DatafileInfo) -> bool {
        info.number_dead > 0 && info.size_dead >= self.dead_bytes_min
    }
}

/// Compactor event loop: one worker per loaded collection.
pub(crate) fn compactor_main(collection: Arc<DocumentCollection>, shutdown: Receiver<()>) {
    debug!("compactor for collection '{}' started", collection.name());

    loop {
        match shutdown.recv_timeout(COMPACTOR_INTERVAL) {
            Ok(_) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        if collection.is_shutting_down() {
            break;
        }
        compact_collection(&collection);
    }

    debug!("compactor for collection '{}' stopped", collection.name());
}

/// One compaction pass: snapshot the per-datafile accounting under a
/// try-lock (never block the writer path) and rewrite every qualifying
/// datafile.
fn compact_collection(collection: &Arc<DocumentCollection>) {
    let candidates: Vec<DatafileInfo> = {
        let docs = match collection.documents.try_read() {
            Ok(docs) => docs,
            Err(_) => return,
        };
        docs.datafiles
            .iter()
            .filter_map(|datafile| docs.datafile_info.get(&datafile.fid()).copied())
            .collect()
    };

    for info in candidates {
        if !collection.runtime.compaction.qualifies(&info) {
            continue;
        }
        debug!(
            "datafile = {}, alive = {} / {}, dead = {} / {}, deletions = {}",
            info.fid, info.number_alive, info.size_alive,
            info.number_dead, info.size_dead, info.number_deletion
        );
        if let Err(err) = compactify_datafile(collection, info.fid) {
            error!("failed to compactify datafile {}: {}", info.fid, err);
        }
        if collection.is_shutting_down() {
            return;
        }
    }
}

/// Rewrite all still-live markers of one datafile into the compactor
/// file, re-point the primary index at the copies and retire the
/// original through a barrier.
fn compactify_datafile(collection: &Arc<DocumentCollection>, fid: u64) -> Result<()> {
    let datafile = {
        let docs = collection.documents.read().unwrap();
        match docs.datafiles.iter().find(|datafile| datafile.fid() == fid) {
            Some(datafile) => datafile.clone(),
            None => return Ok(()),
        }
    };

    debug!("starting to compactify datafile '{}'", datafile.path().display());

    let mut last_compactor: Option<Arc<Datafile>> = None;

    datafile.iterate(|marker, offset| {
        match marker.marker_type() {
            MarkerType::Document | MarkerType::Edge => {
                if let Some(compactor) = compact_document(collection, &datafile, &marker, offset)? {
                    last_compactor = Some(compactor);
                }
            }
            MarkerType::Deletion => {
                let compactor = compact_deletion(collection, &marker)?;
                last_compactor = Some(compactor);
            }
            _ => {}
        }
        Ok(true)
    })?;

    // make sure the copies are durable before the original goes away
    if let Some(compactor) = last_compactor {
        collection.wait_compact_sync(&compactor);
    }

    {
        let mut docs = collection.documents.write().unwrap();
        let position = docs.datafiles.iter().position(|candidate| candidate.fid() == fid);
        match position {
            Some(position) => {
                docs.datafiles.remove(position);
                docs.datafile_info.remove(&fid);
            }
            None => {
                warn!("failed to locate the datafile '{}'", fid);
                return Ok(());
            }
        }
    }

    collection.barriers.push_action(BarrierAction::DatafileRetire {
        datafile,
        unlink: collection.runtime.remove_on_compacted,
    });
    collection.wake_cleanup();

    Ok(())
}

/// Copy one marker verbatim into the compactor file.
fn copy_marker(
    collection: &Arc<DocumentCollection>,
    marker: &MarkerRef<'_>,
) -> Result<(Arc<Datafile>, u32)> {
    let size = marker.size();
    let (compactor, offset) = collection.select_compactor(size)?;
    compactor.write(offset, marker.bytes(), &[]);
    collection.complete_write(&compactor, offset + align_size(size));
    Ok((compactor, offset))
}

/// Copy a document or edge marker if its revision is still live. The
/// liveness check runs twice: before the copy under the read lock, and
/// again under the write lock before the header is re-pointed. An
/// in-flight update losing the race costs a wasted copy, nothing more.
fn compact_document(
    collection: &Arc<DocumentCollection>,
    source: &Arc<Datafile>,
    marker: &MarkerRef<'_>,
    offset: u32,
) -> Result<Option<Arc<Datafile>>> {
    let view = match marker.document() {
        Some(view) => view,
        None => return Ok(None),
    };
    let body_length = view.body.len() as u64;

    let stale = {
        let docs = collection.documents.read().unwrap();
        match docs.primary.lookup(view.did) {
            Some(header) => {
                header.deletion != 0 || header.fid != source.fid() || header.offset != offset
            }
            None => true,
        }
    };
    if stale {
        trace!("found a stale document: {}", view.did);
        return Ok(None);
    }

    let (compactor, new_offset) = copy_marker(collection, marker)?;
    let prefix_size = marker.body_offset().unwrap_or(0);

    let mut docs = collection.documents.write().unwrap();
    let state = &mut *docs;
    let info = state
        .datafile_info
        .entry(compactor.fid())
        .or_insert_with(|| DatafileInfo::new(compactor.fid()));

    let still_live = match state.primary.lookup(view.did) {
        Some(header) => {
            header.deletion == 0 && header.fid == source.fid() && header.offset == offset
        }
        None => false,
    };

    if still_live {
        if let Some(header) = state.primary.lookup_mut(view.did) {
            header.fid = compactor.fid();
            header.offset = new_offset;
            header.body_offset = new_offset + prefix_size;
        }
        info.add_alive(body_length);
    } else {
        debug!("found a stale document after copying: {}", view.did);
        info.add_dead(body_length);
    }

    Ok(Some(compactor))
}

/// Deletion markers are copied unconditionally so replay keeps seeing
/// the tombstone.
fn compact_deletion(
    collection: &Arc<DocumentCollection>,
    marker: &MarkerRef<'_>,
) -> Result<Arc<Datafile>> {
    let (compactor, _offset) = copy_marker(collection, marker)?;

    let mut docs = collection.documents.write().unwrap();
    docs.datafile_info
        .entry(compactor.fid())
        .or_insert_with(|| DatafileInfo::new(compactor.fid()))
        .add_deletion();

    Ok(compactor)
}
