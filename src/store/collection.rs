use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, error, trace, warn};

use crate::error::{Error, Result};

use super::barrier::BarrierList;
use super::collection_files::{self, scan_collection_directory};
use super::compactor::CompactionPolicy;
use super::datafile::{Datafile, DatafileState};
use super::datafile_info::DatafileInfo;
use super::marker::{
    self, align_size, EdgeRelation, MarkerRef, MarkerType, DELETION_MARKER_SIZE,
    DOCUMENT_PREFIX_SIZE, EDGE_PREFIX_SIZE, FILE_HEADER_SIZE,
};
use super::parameters::CollectionParameters;
use super::primary_index::{DocumentHeader, PrimaryIndex};
use super::tick::TickSource;

/// Lifecycle state of a collection. CRUD and the background workers are
/// only active in `Loaded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionStatus {
    Unloaded,
    Loading,
    Loaded,
    Unloading,
    Corrupted,
    Deleted,
}

/// Per-database knobs handed down to every collection.
#[derive(Debug, Clone, Copy)]
pub struct CollectionRuntime {
    /// Unlink retired datafiles instead of leaving `deleted-<fid>.db`
    /// behind.
    pub remove_on_compacted: bool,
    /// Remove dropped collection directories instead of leaving the
    /// renamed `deleted-<cid>` directory behind.
    pub remove_on_dropped: bool,
    pub compaction: CompactionPolicy,
}

impl Default for CollectionRuntime {
    fn default() -> Self {
        CollectionRuntime {
            remove_on_compacted: true,
            remove_on_dropped: true,
            compaction: CompactionPolicy::default(),
        }
    }
}

/// A secondary index descriptor enumerated from `index-<iid>.json`.
/// Construction of the index itself is not part of the storage core.
#[derive(Debug, Clone)]
pub struct IndexDescriptor {
    pub iid: u64,
    pub kind: String,
    pub raw: serde_json::Value,
}

/// An owned copy of one document revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub did: u64,
    pub rid: u64,
    pub shape: u32,
    pub body: Vec<u8>,
    pub edge: Option<EdgeRelation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileCounts {
    pub journals: usize,
    pub datafiles: usize,
    pub compactors: usize,
}

pub(crate) struct DocumentsState {
    pub(crate) primary: PrimaryIndex,
    pub(crate) datafiles: Vec<Arc<Datafile>>,
    pub(crate) datafile_info: HashMap<u64, DatafileInfo>,
}

impl DocumentsState {
    fn new() -> Self {
        DocumentsState {
            primary: PrimaryIndex::new(),
            datafiles: Vec::new(),
            datafile_info: HashMap::new(),
        }
    }
}

pub(crate) struct JournalLists {
    pub(crate) journals: Vec<Arc<Datafile>>,
    pub(crate) compactors: Vec<Arc<Datafile>>,
    /// Journals sealed by the synchroniser that could not yet be moved
    /// into the datafiles list because a writer held the primary lock.
    pub(crate) pending_datafiles: Vec<Arc<Datafile>>,
}

impl JournalLists {
    fn new() -> Self {
        JournalLists {
            journals: Vec::new(),
            compactors: Vec::new(),
            pending_datafiles: Vec::new(),
        }
    }
}

/// The durable collection: journals, sealed datafiles and compactor
/// files plus the primary index over document headers.
///
/// Lock order is documents -> journals -> files. The journals condition
/// coordinates writers with the synchroniser; the synchroniser is the
/// only thread that mutates the journal and compactor lists.
pub struct DocumentCollection {
    cid: u64,
    name: String,
    directory: PathBuf,
    pub(crate) parameters: RwLock<CollectionParameters>,
    pub(crate) tick: Arc<TickSource>,
    pub(crate) runtime: CollectionRuntime,
    shutting_down: AtomicBool,

    pub(crate) documents: RwLock<DocumentsState>,
    pub(crate) journals: Mutex<JournalLists>,
    pub(crate) journals_cond: Condvar,
    pub(crate) files: RwLock<HashMap<u64, Arc<Datafile>>>,
    pub(crate) barriers: BarrierList,

    indexes: RwLock<Vec<IndexDescriptor>>,
    cleanup_wake_tx: Sender<()>,
    cleanup_wake_rx: Mutex<Option<Receiver<()>>>,
}

impl DocumentCollection {
    fn new_inner(
        directory: PathBuf,
        parameters: CollectionParameters,
        tick: Arc<TickSource>,
        runtime: CollectionRuntime,
    ) -> DocumentCollection {
        let (cleanup_wake_tx, cleanup_wake_rx) = bounded(1);
        DocumentCollection {
            cid: parameters.cid,
            name: parameters.name.clone(),
            directory,
            parameters: RwLock::new(parameters),
            tick,
            runtime,
            shutting_down: AtomicBool::new(false),
            documents: RwLock::new(DocumentsState::new()),
            journals: Mutex::new(JournalLists::new()),
            journals_cond: Condvar::new(),
            files: RwLock::new(HashMap::new()),
            barriers: BarrierList::new(),
            indexes: RwLock::new(Vec::new()),
            cleanup_wake_tx,
            cleanup_wake_rx: Mutex::new(Some(cleanup_wake_rx)),
        }
    }

    /// Create a brand new collection in `directory` (which must already
    /// exist and be empty). The first journal is created lazily by the
    /// synchroniser.
    pub(crate) fn create(
        directory: PathBuf,
        parameters: CollectionParameters,
        tick: Arc<TickSource>,
        runtime: CollectionRuntime,
    ) -> Result<Arc<DocumentCollection>> {
        parameters.validate()?;
        parameters.save(&directory)?;
        Ok(Arc::new(Self::new_inner(directory, parameters, tick, runtime)))
    }

    /// Open an existing collection directory and replay its files into
    /// the primary index.
    pub(crate) fn open(
        directory: PathBuf,
        tick: Arc<TickSource>,
        runtime: CollectionRuntime,
    ) -> Result<Arc<DocumentCollection>> {
        let parameters = CollectionParameters::load(&directory)?;
        if parameters.deleted {
            return Err(Error::Deleted);
        }
        parameters.validate()?;

        let collection = Self::new_inner(directory, parameters, tick, runtime);
        collection.load_from_disk()?;
        Ok(Arc::new(collection))
    }

    pub fn cid(&self) -> u64 {
        self.cid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn directory(&self) -> &PathBuf {
        &self.directory
    }

    pub fn parameters(&self) -> CollectionParameters {
        self.parameters.read().unwrap().clone()
    }

    pub fn index_descriptors(&self) -> Vec<IndexDescriptor> {
        self.indexes.read().unwrap().clone()
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub(crate) fn take_cleanup_wake_receiver(&self) -> Option<Receiver<()>> {
        self.cleanup_wake_rx.lock().unwrap().take()
    }

    pub(crate) fn wake_cleanup(&self) {
        let _ = self.cleanup_wake_tx.try_send(());
    }

    // ------------------------------------------------------------------
    // write path
    // ------------------------------------------------------------------

    /// Insert a new document; returns the document id.
    pub fn insert(&self, shape: u32, body: &[u8]) -> Result<u64> {
        self.write_document(shape, body, None)
    }

    /// Insert a new edge document; returns the document id.
    pub fn insert_edge(&self, shape: u32, body: &[u8], relation: EdgeRelation) -> Result<u64> {
        self.write_document(shape, body, Some(relation))
    }

    fn write_document(&self, shape: u32, body: &[u8], relation: Option<EdgeRelation>) -> Result<u64> {
        let prefix_size = match relation {
            Some(_) => EDGE_PREFIX_SIZE,
            None => DOCUMENT_PREFIX_SIZE,
        };
        let total = self.checked_marker_size(prefix_size, body.len())?;

        let mut docs = self.documents.write().unwrap();

        let tick = self.tick.next();
        let (did, rid) = (tick, tick);

        let (journal, offset) = self.select_journal(total)?;

        match relation {
            Some(relation) => {
                let prefix = marker::edge_prefix(tick, did, rid, shape, &relation, body);
                journal.write(offset, &prefix, body);
            }
            None => {
                let prefix = marker::document_prefix(tick, did, rid, shape, body);
                journal.write(offset, &prefix, body);
            }
        }
        let end = offset + align_size(total);
        self.complete_write(&journal, end);

        let header = DocumentHeader {
            did,
            rid,
            deletion: 0,
            fid: journal.fid(),
            offset,
            body_offset: offset + prefix_size,
            body_length: body.len() as u32,
            shape,
        };

        let state = &mut *docs;
        let info = state
            .datafile_info
            .entry(journal.fid())
            .or_insert_with(|| DatafileInfo::new(journal.fid()));
        match state.primary.insert(header) {
            Ok(()) => info.add_alive(body.len() as u64),
            Err(err) => {
                // the marker is already on disk; account it as dead and
                // surface the failure
                info.add_dead(body.len() as u64);
                return Err(err);
            }
        }

        self.wait_sync(&journal, end)?;
        drop(docs);

        Ok(did)
    }

    /// Replace the current revision of a document. With `expected_rid`
    /// set, the update only succeeds against that revision. Returns the
    /// new revision id.
    pub fn update(&self, did: u64, shape: u32, body: &[u8], expected_rid: Option<u64>) -> Result<u64> {
        let mut docs = self.documents.write().unwrap();

        let found = match docs.primary.lookup(did) {
            Some(header) if header.deletion == 0 => *header,
            _ => return Err(Error::DocumentNotFound(did)),
        };
        if let Some(expected) = expected_rid {
            if found.rid != expected {
                return Err(Error::Conflict { expected, found: found.rid });
            }
        }

        // an edge stays an edge; carry its endpoints over
        let relation = if found.prefix_size() == EDGE_PREFIX_SIZE {
            self.edge_relation_of(&found)?
        } else {
            None
        };
        let prefix_size = match relation {
            Some(_) => EDGE_PREFIX_SIZE,
            None => DOCUMENT_PREFIX_SIZE,
        };
        let total = self.checked_marker_size(prefix_size, body.len())?;

        let rid = self.tick.next();
        let (journal, offset) = self.select_journal(total)?;

        match relation {
            Some(relation) => {
                let prefix = marker::edge_prefix(rid, did, rid, shape, &relation, body);
                journal.write(offset, &prefix, body);
            }
            None => {
                let prefix = marker::document_prefix(rid, did, rid, shape, body);
                journal.write(offset, &prefix, body);
            }
        }
        let end = offset + align_size(total);
        self.complete_write(&journal, end);

        let state = &mut *docs;
        state
            .datafile_info
            .entry(found.fid)
            .or_insert_with(|| DatafileInfo::new(found.fid))
            .supersede(found.body_length as u64);
        state
            .datafile_info
            .entry(journal.fid())
            .or_insert_with(|| DatafileInfo::new(journal.fid()))
            .add_alive(body.len() as u64);

        if let Some(header) = state.primary.lookup_mut(did) {
            header.rid = rid;
            header.fid = journal.fid();
            header.offset = offset;
            header.body_offset = offset + prefix_size;
            header.body_length = body.len() as u32;
            header.shape = shape;
        }

        self.wait_sync(&journal, end)?;
        drop(docs);

        Ok(rid)
    }

    /// Append a deletion marker and tombstone the document header.
    pub fn remove(&self, did: u64, expected_rid: Option<u64>) -> Result<()> {
        let mut docs = self.documents.write().unwrap();

        let found = match docs.primary.lookup(did) {
            Some(header) if header.deletion == 0 => *header,
            _ => return Err(Error::DocumentNotFound(did)),
        };
        if let Some(expected) = expected_rid {
            if found.rid != expected {
                return Err(Error::Conflict { expected, found: found.rid });
            }
        }

        let tick = self.tick.next();
        let (journal, offset) = self.select_journal(DELETION_MARKER_SIZE)?;

        let deletion = marker::deletion_marker(tick, did);
        journal.write(offset, &deletion, &[]);
        let end = offset + align_size(DELETION_MARKER_SIZE);
        self.complete_write(&journal, end);

        let state = &mut *docs;
        if found.fid != 0 {
            state
                .datafile_info
                .entry(found.fid)
                .or_insert_with(|| DatafileInfo::new(found.fid))
                .supersede(found.body_length as u64);
        }
        state
            .datafile_info
            .entry(journal.fid())
            .or_insert_with(|| DatafileInfo::new(journal.fid()))
            .add_deletion();

        if let Some(header) = state.primary.lookup_mut(did) {
            header.deletion = tick;
        }

        self.wait_sync(&journal, end)?;
        drop(docs);

        Ok(())
    }

    // ------------------------------------------------------------------
    // read path
    // ------------------------------------------------------------------

    /// Fetch an owned copy of the current revision, or `None` for
    /// unknown and deleted documents.
    pub fn get(&self, did: u64) -> Result<Option<Document>> {
        let docs = self.documents.read().unwrap();
        let header = match docs.primary.lookup(did) {
            Some(header) if header.deletion == 0 => *header,
            _ => return Ok(None),
        };

        let datafile = self.resolve_datafile(header.fid)?;
        let body = datafile.slice(header.body_offset, header.body_length).to_vec();
        let edge = self.edge_relation_of(&header)?;
        drop(docs);

        Ok(Some(Document {
            did: header.did,
            rid: header.rid,
            shape: header.shape,
            body,
            edge,
        }))
    }

    /// Place an element barrier so marker data can be used beyond the
    /// scope of the read lock. The pin is released when the guard is
    /// dropped; until then no retired file it may reference is renamed
    /// or unlinked.
    pub fn pin(self: &Arc<Self>) -> Result<CollectionPin> {
        if self.is_shutting_down() {
            return Err(Error::NotLoaded);
        }
        let barrier = self.barriers.add_element();
        Ok(CollectionPin {
            collection: self.clone(),
            barrier,
        })
    }

    /// The raw header of a document, including tombstones.
    pub fn document_header(&self, did: u64) -> Option<DocumentHeader> {
        self.documents.read().unwrap().primary.lookup(did).copied()
    }

    /// Number of live (non-tombstoned) documents.
    pub fn document_count(&self) -> usize {
        let docs = self.documents.read().unwrap();
        docs.primary.iter().filter(|header| header.deletion == 0).count()
    }

    pub fn datafile_statistics(&self) -> Vec<DatafileInfo> {
        let docs = self.documents.read().unwrap();
        let mut infos: Vec<DatafileInfo> = docs.datafile_info.values().copied().collect();
        infos.sort_by_key(|info| info.fid);
        infos
    }

    pub fn datafile_info(&self, fid: u64) -> Option<DatafileInfo> {
        self.documents.read().unwrap().datafile_info.get(&fid).copied()
    }

    pub fn file_counts(&self) -> FileCounts {
        let docs = self.documents.read().unwrap();
        let lists = self.journals.lock().unwrap();
        FileCounts {
            journals: lists.journals.len(),
            datafiles: docs.datafiles.len() + lists.pending_datafiles.len(),
            compactors: lists.compactors.len(),
        }
    }

    fn resolve_datafile(&self, fid: u64) -> Result<Arc<Datafile>> {
        self.files
            .read()
            .unwrap()
            .get(&fid)
            .cloned()
            .ok_or_else(|| Error::CorruptedCollection(self.name.clone()))
    }

    fn edge_relation_of(&self, header: &DocumentHeader) -> Result<Option<EdgeRelation>> {
        if header.prefix_size() != EDGE_PREFIX_SIZE {
            return Ok(None);
        }
        let datafile = self.resolve_datafile(header.fid)?;
        let raw = datafile.slice(header.offset, header.prefix_size() + header.body_length);
        let marker = MarkerRef::parse(raw)
            .ok_or_else(|| Error::CorruptedCollection(self.name.clone()))?;
        Ok(marker.edge().map(|view| view.edge))
    }

    fn checked_marker_size(&self, prefix_size: u32, body_len: usize) -> Result<u32> {
        let maximal = self.parameters.read().unwrap().maximal_size;
        let total = prefix_size as u64 + body_len as u64;
        // a marker must fit into an empty journal next to header and footer
        let usable = maximal as u64 - align_size(FILE_HEADER_SIZE) as u64 - 24;
        if total > usable {
            return Err(Error::DocumentTooLarge { size: total, maximal });
        }
        Ok(total as u32)
    }

    // ------------------------------------------------------------------
    // journal coordination
    // ------------------------------------------------------------------

    fn select_writable(&self, compactor: bool, size: u32) -> Result<(Arc<Datafile>, u32)> {
        let mut lists = self.journals.lock().unwrap();
        loop {
            if self.is_shutting_down() {
                return Err(Error::NoJournal);
            }

            let mut marked_full = false;
            let mut selected = None;
            {
                let candidates = if compactor { &lists.compactors } else { &lists.journals };
                for datafile in candidates {
                    match datafile.reserve(size) {
                        Ok(offset) => {
                            selected = Some((datafile.clone(), offset));
                            break;
                        }
                        Err(Error::DatafileFull) => {
                            if !datafile.is_full() {
                                datafile.set_full();
                                marked_full = true;
                            }
                        }
                        Err(err) => return Err(err),
                    }
                }
            }

            if let Some(selected) = selected {
                return Ok(selected);
            }
            if marked_full {
                // let the synchroniser seal it and open a replacement
                self.journals_cond.notify_all();
            }
            lists = self.journals_cond.wait(lists).unwrap();
        }
    }

    pub(crate) fn select_journal(&self, size: u32) -> Result<(Arc<Datafile>, u32)> {
        self.select_writable(false, size)
    }

    pub(crate) fn select_compactor(&self, size: u32) -> Result<(Arc<Datafile>, u32)> {
        self.select_writable(true, size)
    }

    /// Advance the write cursor of a journal or compactor past a
    /// completed marker and wake the synchroniser and sync waiters.
    pub(crate) fn complete_write(&self, datafile: &Datafile, end: u32) {
        let _lists = self.journals.lock().unwrap();
        datafile.note_write(end);
        self.journals_cond.notify_all();
    }

    /// Block according to the sync discipline until the marker ending
    /// at `position` is durable enough, or fail when the journal went
    /// into `WriteError`.
    fn wait_sync(&self, journal: &Arc<Datafile>, position: u32) -> Result<()> {
        let (every_write, objects, bytes, seconds) = {
            let parameters = self.parameters.read().unwrap();
            (
                parameters.sync_every_write(),
                parameters.sync_after_objects,
                parameters.sync_after_bytes,
                parameters.sync_after_seconds,
            )
        };
        if !every_write && objects == 0 && bytes == 0 && seconds <= 0.0 {
            return Ok(());
        }

        let mut lists = self.journals.lock().unwrap();
        loop {
            if journal.state() == DatafileState::WriteError {
                return Err(Error::MsyncFailed(journal.fid()));
            }

            let mut done = true;
            if every_write {
                if journal.synced() < position {
                    done = false;
                }
            } else {
                // bound the number of outstanding markers
                if objects > 1 && journal.n_written().wrapping_sub(journal.n_synced()) >= objects {
                    done = false;
                }
                // bound the number of outstanding bytes
                if bytes > 0 && journal.written().saturating_sub(journal.synced()) >= bytes {
                    done = false;
                }
                // bound the age of the oldest outstanding byte
                if seconds > 0.0 && journal.synced() < journal.written() {
                    let now = SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .map(|d| d.as_micros() as u64)
                        .unwrap_or(0);
                    if journal.last_synced_micros() + (seconds * 1_000_000.0) as u64 <= now {
                        done = false;
                    }
                }
            }

            if done {
                return Ok(());
            }
            if self.is_shutting_down() {
                // the synchroniser is gone; close_files flushes the rest
                return Err(Error::NotLoaded);
            }
            lists = self.journals_cond.wait(lists).unwrap();
        }
    }

    /// Block until the compactor file has been synced past its write
    /// cursor.
    pub(crate) fn wait_compact_sync(&self, datafile: &Arc<Datafile>) {
        let mut lists = self.journals.lock().unwrap();
        while datafile.synced() < datafile.written()
            && datafile.state() == DatafileState::Write
            && !self.is_shutting_down()
        {
            lists = self.journals_cond.wait(lists).unwrap();
        }
    }

    /// Create a new journal. Called by the synchroniser with the
    /// journals lock held.
    pub(crate) fn create_journal(&self, lists: &mut JournalLists) -> Result<Arc<Datafile>> {
        let fid = self.tick.next();
        let path = collection_files::journal_path(&self.directory, fid);
        let maximal = self.parameters.read().unwrap().maximal_size;
        let datafile = Arc::new(Datafile::create(&path, fid, maximal, self.cid)?);
        self.files.write().unwrap().insert(fid, datafile.clone());
        lists.journals.push(datafile.clone());
        debug!("created new journal '{}'", path.display());
        Ok(datafile)
    }

    /// Create a new compactor file. Called by the synchroniser with the
    /// journals lock held.
    pub(crate) fn create_compactor(&self, lists: &mut JournalLists) -> Result<Arc<Datafile>> {
        let fid = self.tick.next();
        let path = collection_files::compactor_path(&self.directory, fid);
        let maximal = self.parameters.read().unwrap().maximal_size;
        let datafile = Arc::new(Datafile::create(&path, fid, maximal, self.cid)?);
        self.files.write().unwrap().insert(fid, datafile.clone());
        lists.compactors.push(datafile.clone());
        debug!("created new compactor '{}'", path.display());
        Ok(datafile)
    }

    /// Seal a full journal or compactor: stamp the footer, flush, and
    /// rename to its datafile name.
    pub(crate) fn seal_datafile(&self, datafile: &Arc<Datafile>) -> Result<()> {
        datafile.seal(self.tick.next(), &self.directory)
    }

    /// Refuse new writes and wake everything blocked on the journals
    /// condition.
    pub(crate) fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let _lists = self.journals.lock().unwrap();
        self.journals_cond.notify_all();
    }

    /// Final teardown: flush what is still dirty, close all files and
    /// drop the in-memory state. The workers must be stopped (or this
    /// must run on the cleanup worker itself).
    pub(crate) fn close_files(&self) {
        let mut docs = self.documents.write().unwrap();
        let mut lists = self.journals.lock().unwrap();

        for datafile in lists.journals.iter().chain(lists.compactors.iter()) {
            let synced = datafile.synced();
            let written = datafile.written();
            if synced < written {
                if let Err(err) = datafile.sync(synced, written) {
                    error!("cannot sync datafile {} on close: {}", datafile.fid(), err);
                } else {
                    datafile.note_synced(written, datafile.n_written());
                }
            }
            datafile.close();
        }
        for datafile in lists.pending_datafiles.iter().chain(docs.datafiles.iter()) {
            datafile.close();
        }

        lists.journals.clear();
        lists.compactors.clear();
        lists.pending_datafiles.clear();
        drop(lists);

        docs.primary.clear();
        docs.datafiles.clear();
        docs.datafile_info.clear();
        drop(docs);

        self.files.write().unwrap().clear();

        debug!("closed collection '{}'", self.name);
    }

    // ------------------------------------------------------------------
    // startup replay
    // ------------------------------------------------------------------

    fn load_from_disk(&self) -> Result<()> {
        let scan = scan_collection_directory(&self.directory)?;

        {
            let mut docs = self.documents.write().unwrap();
            let mut lists = self.journals.lock().unwrap();
            let mut files = self.files.write().unwrap();

            for (fid, path) in &scan.datafiles {
                let datafile = Arc::new(Datafile::open(path, *fid)?);
                if !datafile.is_sealed() {
                    error!("datafile '{}' is not sealed, this should never happen", path.display());
                    return Err(Error::CorruptedCollection(self.name.clone()));
                }
                self.tick.observe(*fid);
                files.insert(*fid, datafile.clone());
                docs.datafiles.push(datafile);
            }

            for (fid, path) in scan.journals.iter().chain(scan.compactors.iter()) {
                let datafile = Arc::new(Datafile::open(path, *fid)?);
                self.tick.observe(*fid);
                if datafile.is_sealed() {
                    warn!(
                        "'{}' is already sealed; must be a left over; using it as datafile",
                        path.display()
                    );
                    datafile.rename(collection_files::datafile_path(&self.directory, *fid))?;
                    docs.datafiles.push(datafile.clone());
                } else if scan.journals.iter().any(|(journal_fid, _)| journal_fid == fid) {
                    lists.journals.push(datafile.clone());
                } else {
                    lists.compactors.push(datafile.clone());
                }
                files.insert(*fid, datafile);
            }

            docs.datafiles.sort_by_key(|datafile| datafile.fid());
        }

        // replay datafiles in id order, then the active files
        let (datafiles, compactors, journals) = {
            let docs = self.documents.read().unwrap();
            let lists = self.journals.lock().unwrap();
            (
                docs.datafiles.clone(),
                lists.compactors.clone(),
                lists.journals.clone(),
            )
        };

        {
            let mut docs = self.documents.write().unwrap();
            for datafile in datafiles.iter().chain(compactors.iter()).chain(journals.iter()) {
                self.replay_file(&mut docs, datafile)?;
            }
        }

        // enumerate secondary index descriptors
        let mut indexes = Vec::new();
        for (iid, path) in &scan.indexes {
            match std::fs::read(path) {
                Ok(raw) => match serde_json::from_slice::<serde_json::Value>(&raw) {
                    Ok(value) => {
                        let kind = value["type"].as_str().unwrap_or("").to_string();
                        if kind.is_empty() {
                            error!("cannot read index definition from '{}': missing type", path.display());
                            continue;
                        }
                        if kind != "geo" && kind != "fulltext" {
                            warn!("ignoring unknown index type '{}'", kind);
                        }
                        indexes.push(IndexDescriptor { iid: *iid, kind, raw: value });
                    }
                    Err(err) => {
                        error!("cannot read index definition from '{}': {}", path.display(), err);
                    }
                },
                Err(err) => {
                    error!("cannot read index definition from '{}': {}", path.display(), err);
                }
            }
        }
        *self.indexes.write().unwrap() = indexes;

        debug!(
            "loaded collection '{}' with {} documents",
            self.name,
            self.document_count()
        );

        Ok(())
    }

    fn replay_file(&self, docs: &mut DocumentsState, datafile: &Arc<Datafile>) -> Result<()> {
        let fid = datafile.fid();
        datafile.iterate(|marker, offset| {
            self.tick.observe(marker.tick());
            match marker.marker_type() {
                MarkerType::FileHeader => {
                    let view = marker
                        .file_header()
                        .ok_or_else(|| Error::CorruptedDatafile(datafile.path()))?;
                    if view.cid != self.cid {
                        error!(
                            "collection identifier mismatch, expected {}, found {}",
                            self.cid, view.cid
                        );
                        return Err(Error::CorruptedCollection(self.name.clone()));
                    }
                }
                MarkerType::FileFooter => {}
                MarkerType::Document | MarkerType::Edge => {
                    self.replay_document(docs, fid, offset, &marker)?;
                }
                MarkerType::Deletion => {
                    self.replay_deletion(docs, fid, &marker)?;
                }
            }
            Ok(true)
        })
    }

    fn replay_document(
        &self,
        docs: &mut DocumentsState,
        fid: u64,
        offset: u32,
        marker: &MarkerRef<'_>,
    ) -> Result<()> {
        let view = marker
            .document()
            .ok_or_else(|| Error::CorruptedCollection(self.name.clone()))?;
        let prefix_size = marker.body_offset().unwrap_or(DOCUMENT_PREFIX_SIZE);
        let body_length = view.body.len() as u32;

        trace!("document did {}, rid {}", view.did, view.rid);

        let found = docs.primary.lookup(view.did).copied();
        match found {
            None => {
                let header = DocumentHeader {
                    did: view.did,
                    rid: view.rid,
                    deletion: 0,
                    fid,
                    offset,
                    body_offset: offset + prefix_size,
                    body_length,
                    shape: view.shape,
                };
                match docs.primary.insert(header) {
                    Ok(()) => {
                        docs.datafile_info
                            .entry(fid)
                            .or_insert_with(|| DatafileInfo::new(fid))
                            .add_alive(body_length as u64);
                    }
                    Err(err) => {
                        warn!("cannot insert document {} during replay: {}", view.did, err);
                        docs.datafile_info
                            .entry(fid)
                            .or_insert_with(|| DatafileInfo::new(fid))
                            .add_dead(body_length as u64);
                    }
                }
            }
            Some(found) if found.deletion != 0 => {
                // superseded by a deletion that replayed earlier
                docs.datafile_info
                    .entry(fid)
                    .or_insert_with(|| DatafileInfo::new(fid))
                    .add_dead(body_length as u64);
            }
            Some(found) if found.rid < view.rid => {
                if found.fid != 0 {
                    docs.datafile_info
                        .entry(found.fid)
                        .or_insert_with(|| DatafileInfo::new(found.fid))
                        .supersede(found.body_length as u64);
                }
                if let Some(header) = docs.primary.lookup_mut(view.did) {
                    header.rid = view.rid;
                    header.fid = fid;
                    header.offset = offset;
                    header.body_offset = offset + prefix_size;
                    header.body_length = body_length;
                    header.shape = view.shape;
                }
                docs.datafile_info
                    .entry(fid)
                    .or_insert_with(|| DatafileInfo::new(fid))
                    .add_alive(body_length as u64);
            }
            Some(_) => {
                // an older revision replaying after a newer one
                docs.datafile_info
                    .entry(fid)
                    .or_insert_with(|| DatafileInfo::new(fid))
                    .add_dead(body_length as u64);
            }
        }

        Ok(())
    }

    fn replay_deletion(
        &self,
        docs: &mut DocumentsState,
        fid: u64,
        marker: &MarkerRef<'_>,
    ) -> Result<()> {
        let did = marker
            .deletion_did()
            .ok_or_else(|| Error::CorruptedCollection(self.name.clone()))?;
        let tick = marker.tick();

        trace!("deletion did {}, deletion tick {}", did, tick);

        let found = docs.primary.lookup(did).copied();
        match found {
            None => {
                // we missed the create; keep a tombstone
                let header = DocumentHeader {
                    did,
                    rid: 0,
                    deletion: tick,
                    fid: 0,
                    offset: 0,
                    body_offset: 0,
                    body_length: 0,
                    shape: 0,
                };
                if let Err(err) = docs.primary.insert(header) {
                    warn!("cannot insert tombstone {} during replay: {}", did, err);
                }
            }
            Some(found) if found.deletion == 0 => {
                if found.fid != 0 {
                    docs.datafile_info
                        .entry(found.fid)
                        .or_insert_with(|| DatafileInfo::new(found.fid))
                        .supersede(found.body_length as u64);
                }
                if let Some(header) = docs.primary.lookup_mut(did) {
                    header.deletion = tick;
                }
            }
            Some(_) => {}
        }

        docs.datafile_info
            .entry(fid)
            .or_insert_with(|| DatafileInfo::new(fid))
            .add_deletion();

        Ok(())
    }
}

/// Reader pin backed by an element barrier. While alive, cleanup will
/// not rename or unlink any datafile retired behind it.
pub struct CollectionPin {
    collection: Arc<DocumentCollection>,
    barrier: u64,
}

impl CollectionPin {
    /// Resolve a document into a zero-copy reference into the mapped
    /// datafile.
    pub fn get(&self, did: u64) -> Result<Option<PinnedDocument>> {
        let docs = self.collection.documents.read().unwrap();
        let header = match docs.primary.lookup(did) {
            Some(header) if header.deletion == 0 => *header,
            _ => return Ok(None),
        };
        let datafile = self.collection.resolve_datafile(header.fid)?;
        Ok(Some(PinnedDocument { datafile, header }))
    }
}

impl Drop for CollectionPin {
    fn drop(&mut self) {
        self.collection.barriers.release_element(self.barrier);
        self.collection.wake_cleanup();
    }
}

/// A document resolved through a [`CollectionPin`]; the body borrows
/// directly from the mapped datafile.
pub struct PinnedDocument {
    datafile: Arc<Datafile>,
    header: DocumentHeader,
}

impl PinnedDocument {
    pub fn did(&self) -> u64 {
        self.header.did
    }

    pub fn rid(&self) -> u64 {
        self.header.rid
    }

    pub fn shape(&self) -> u32 {
        self.header.shape
    }

    pub fn body(&self) -> &[u8] {
        self.datafile.slice(self.header.body_offset, self.header.body_length)
    }

    pub fn edge(&self) -> Option<EdgeRelation> {
        if self.header.prefix_size() != EDGE_PREFIX_SIZE {
            return None;
        }
        let raw = self.datafile.slice(
            self.header.offset,
            self.header.prefix_size() + self.header.body_length,
        );
        MarkerRef::parse(raw)?.edge().map(|view| view.edge)
    }
}

// ----------------------------------------------------------------------
// collection handle and worker lifecycle
// ----------------------------------------------------------------------

pub(crate) struct WorkerSet {
    shutdown_tx: Sender<()>,
    handles: Vec<std::thread::JoinHandle<()>>,
}

/// The registry's view of a collection: its lifecycle status plus the
/// engine instance while loaded.
pub struct CollectionHandle {
    cid: u64,
    name: String,
    directory: PathBuf,
    status: RwLock<CollectionStatus>,
    collection: RwLock<Option<Arc<DocumentCollection>>>,
    workers: Mutex<Option<WorkerSet>>,
}

impl CollectionHandle {
    pub(crate) fn new(
        cid: u64,
        name: String,
        directory: PathBuf,
        status: CollectionStatus,
    ) -> Arc<CollectionHandle> {
        Arc::new(CollectionHandle {
            cid,
            name,
            directory,
            status: RwLock::new(status),
            collection: RwLock::new(None),
            workers: Mutex::new(None),
        })
    }

    pub fn cid(&self) -> u64 {
        self.cid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn directory(&self) -> &PathBuf {
        &self.directory
    }

    pub fn status(&self) -> CollectionStatus {
        *self.status.read().unwrap()
    }

    pub(crate) fn set_status(&self, status: CollectionStatus) {
        *self.status.write().unwrap() = status;
    }

    /// The loaded engine instance; fails unless the collection is in
    /// `Loaded` state.
    pub fn collection(&self) -> Result<Arc<DocumentCollection>> {
        if self.status() != CollectionStatus::Loaded {
            return Err(Error::NotLoaded);
        }
        self.collection
            .read()
            .unwrap()
            .clone()
            .ok_or(Error::NotLoaded)
    }

    pub(crate) fn try_collection(&self) -> Option<Arc<DocumentCollection>> {
        self.collection.read().unwrap().clone()
    }

    pub(crate) fn install(&self, collection: Arc<DocumentCollection>) {
        *self.collection.write().unwrap() = Some(collection);
    }

    pub(crate) fn clear_collection(&self) {
        *self.collection.write().unwrap() = None;
    }
}

/// Spawn the three background workers of a loaded collection.
pub(crate) fn spawn_workers(handle: &Arc<CollectionHandle>) -> Result<()> {
    let collection = handle.try_collection().ok_or(Error::NotLoaded)?;
    let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
    let cleanup_wake = collection
        .take_cleanup_wake_receiver()
        .ok_or(Error::NotLoaded)?;

    let mut handles = Vec::new();

    {
        let collection = collection.clone();
        let shutdown = shutdown_rx.clone();
        handles.push(
            std::thread::Builder::new()
                .name(format!("vellum-synchroniser-{}", handle.cid()))
                .spawn(move || super::synchroniser::synchroniser_main(collection, shutdown))?,
        );
    }
    {
        let collection = collection.clone();
        let shutdown = shutdown_rx.clone();
        handles.push(
            std::thread::Builder::new()
                .name(format!("vellum-compactor-{}", handle.cid()))
                .spawn(move || super::compactor::compactor_main(collection, shutdown))?,
        );
    }
    {
        let handle = handle.clone();
        handles.push(
            std::thread::Builder::new()
                .name(format!("vellum-cleanup-{}", handle.cid()))
                .spawn(move || super::cleanup::cleanup_main(handle, shutdown_rx, cleanup_wake))?,
        );
    }

    *handle.workers.lock().unwrap() = Some(WorkerSet { shutdown_tx, handles });
    Ok(())
}

/// Join the workers in synchroniser, compactor, cleanup order.
pub(crate) fn join_workers(handle: &CollectionHandle) {
    let workers = self::take_workers(handle);
    if let Some(workers) = workers {
        drop(workers.shutdown_tx);
        for worker in workers.handles {
            let _ = worker.join();
        }
    }
}

fn take_workers(handle: &CollectionHandle) -> Option<WorkerSet> {
    handle.workers.lock().unwrap().take()
}
