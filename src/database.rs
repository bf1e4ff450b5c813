//! The database container: owns the directory, the process lock, the
//! server identifier, the tick source and the collection registries.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use lazy_static::lazy_static;
use log::{error, info, warn};
use regex::Regex;

use crate::error::{Error, Result};
use crate::store::{
    self, collection_dirname, deleted_collection_dirname, parse_collection_dirname,
    BarrierAction, CollectionHandle, CollectionParameters, CollectionRuntime, CollectionStatus,
    CompactionPolicy, DocumentCollection, TickSource, COLLECTION_TYPE_DOCUMENT,
    PARAMETER_VERSION,
};
use crate::tools;

const SERVER_FILENAME: &str = "SERVER";
const LOCK_FILENAME: &str = "lock";

lazy_static! {
    static ref COLLECTION_NAME_RE: Regex = Regex::new(r"^[a-zA-Z][a-zA-Z0-9_-]{0,63}$").unwrap();
}

/// Database-wide defaults and policies.
#[derive(Debug, Clone, Copy)]
pub struct DatabaseConfig {
    /// Default capacity of journals, datafiles and compactor files.
    pub default_maximal_size: u32,
    /// Default for the per-collection `waitForSync` parameter.
    pub default_wait_for_sync: bool,
    /// Unlink compacted datafiles instead of keeping `deleted-<fid>.db`.
    pub remove_on_compacted: bool,
    /// Remove dropped collection directories from disk.
    pub remove_on_dropped: bool,
    pub compaction: CompactionPolicy,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            default_maximal_size: 32 * 1024 * 1024,
            default_wait_for_sync: false,
            remove_on_compacted: true,
            remove_on_dropped: true,
            compaction: CompactionPolicy::default(),
        }
    }
}

/// Per-collection settings for [`Database::create_collection`];
/// unset options fall back to the database defaults.
#[derive(Debug, Clone, Copy)]
pub struct CollectionOptions {
    pub collection_type: u32,
    pub maximal_size: Option<u32>,
    pub wait_for_sync: Option<bool>,
    pub sync_after_objects: u32,
    pub sync_after_bytes: u32,
    pub sync_after_seconds: f64,
}

impl Default for CollectionOptions {
    fn default() -> Self {
        CollectionOptions {
            collection_type: COLLECTION_TYPE_DOCUMENT,
            maximal_size: None,
            wait_for_sync: None,
            sync_after_objects: 0,
            sync_after_bytes: 0,
            sync_after_seconds: 0.0,
        }
    }
}

struct Registry {
    by_name: HashMap<String, Arc<CollectionHandle>>,
    by_id: HashMap<u64, Arc<CollectionHandle>>,
}

/// An open database directory.
///
/// Holds the process-wide `lock` file for the lifetime of the value;
/// a second `open` on the same directory refuses with
/// `DatabaseLocked`.
pub struct Database {
    path: PathBuf,
    config: DatabaseConfig,
    tick: Arc<TickSource>,
    _lock: File,
    registry: RwLock<Registry>,
    closed: AtomicBool,
}

impl Database {
    /// Open (or initialise) a database directory. Collection
    /// directories are registered but stay unloaded until used.
    pub fn open<P: AsRef<Path>>(path: P, config: DatabaseConfig) -> Result<Database> {
        let path = path.as_ref().to_owned();
        std::fs::create_dir_all(&path)?;

        let lock = tools::lock_file(path.join(LOCK_FILENAME), 0)?;
        let server_id = read_or_create_server_id(&path)?;
        let tick = Arc::new(TickSource::new(server_id));

        let mut registry = Registry {
            by_name: HashMap::new(),
            by_id: HashMap::new(),
        };

        for entry in std::fs::read_dir(&path)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let file_name = entry.file_name();
            let dirname = match file_name.to_str() {
                Some(name) => name,
                None => continue,
            };
            let cid = match parse_collection_dirname(dirname) {
                Some(cid) => cid,
                None => continue,
            };
            tick.observe(cid);

            let parameters = match CollectionParameters::load(&entry.path()) {
                Ok(parameters) => parameters,
                Err(err) => {
                    error!("cannot load collection '{}': {}", dirname, err);
                    continue;
                }
            };

            if parameters.deleted {
                // leftover of an interrupted drop
                warn!("collection {} is marked as deleted, cleaning it up", cid);
                let target = path.join(deleted_collection_dirname(cid));
                if let Err(err) = std::fs::rename(entry.path(), &target) {
                    error!("cannot rename deleted collection '{}': {}", dirname, err);
                }
                continue;
            }

            if registry.by_name.contains_key(&parameters.name) {
                error!("duplicate entry for collection name '{}'", parameters.name);
                return Err(Error::DuplicateName(parameters.name));
            }
            if registry.by_id.contains_key(&cid) {
                return Err(Error::DuplicateIdentifier(cid));
            }

            let handle = CollectionHandle::new(
                cid,
                parameters.name.clone(),
                entry.path(),
                CollectionStatus::Unloaded,
            );
            registry.by_name.insert(parameters.name.clone(), handle.clone());
            registry.by_id.insert(cid, handle);
        }

        info!(
            "opened database '{}', server id {}, {} collections",
            path.display(),
            server_id,
            registry.by_id.len()
        );

        Ok(Database {
            path,
            config,
            tick,
            _lock: lock,
            registry: RwLock::new(registry),
            closed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn server_id(&self) -> u16 {
        self.tick.server_id()
    }

    /// All registered collections, sorted by collection id.
    pub fn collections(&self) -> Vec<Arc<CollectionHandle>> {
        let registry = self.registry.read().unwrap();
        let mut handles: Vec<_> = registry.by_id.values().cloned().collect();
        handles.sort_by_key(|handle| handle.cid());
        handles
    }

    pub fn collection_by_name(&self, name: &str) -> Option<Arc<CollectionHandle>> {
        self.registry.read().unwrap().by_name.get(name).cloned()
    }

    pub fn collection_by_id(&self, cid: u64) -> Option<Arc<CollectionHandle>> {
        self.registry.read().unwrap().by_id.get(&cid).cloned()
    }

    fn runtime(&self) -> CollectionRuntime {
        CollectionRuntime {
            remove_on_compacted: self.config.remove_on_compacted,
            remove_on_dropped: self.config.remove_on_dropped,
            compaction: self.config.compaction,
        }
    }

    /// Create a new collection; it is loaded and its workers are
    /// running when this returns.
    pub fn create_collection(
        &self,
        name: &str,
        options: CollectionOptions,
    ) -> Result<Arc<CollectionHandle>> {
        check_collection_name(name)?;

        let mut registry = self.registry.write().unwrap();
        if registry.by_name.contains_key(name) {
            return Err(Error::DuplicateName(name.to_string()));
        }

        let cid = self.tick.next();
        let directory = self.path.join(collection_dirname(cid));
        std::fs::create_dir(&directory)?;

        let parameters = CollectionParameters {
            version: PARAMETER_VERSION,
            collection_type: options.collection_type,
            cid,
            name: name.to_string(),
            maximal_size: options.maximal_size.unwrap_or(self.config.default_maximal_size),
            sync_after_objects: options.sync_after_objects,
            sync_after_bytes: options.sync_after_bytes,
            sync_after_seconds: options.sync_after_seconds,
            wait_for_sync: options.wait_for_sync.unwrap_or(self.config.default_wait_for_sync),
            deleted: false,
        };

        let collection =
            DocumentCollection::create(directory.clone(), parameters, self.tick.clone(), self.runtime())?;

        let handle = CollectionHandle::new(cid, name.to_string(), directory, CollectionStatus::Loaded);
        handle.install(collection);
        store::spawn_workers(&handle)?;

        registry.by_name.insert(name.to_string(), handle.clone());
        registry.by_id.insert(cid, handle.clone());

        info!("created collection '{}' ({})", name, cid);
        Ok(handle)
    }

    /// Load an unloaded collection: open its files, replay them into
    /// the primary index and start the background workers.
    pub fn load_collection(&self, handle: &Arc<CollectionHandle>) -> Result<Arc<DocumentCollection>> {
        let _registry = self.registry.write().unwrap();

        match handle.status() {
            CollectionStatus::Loaded => handle.collection(),
            CollectionStatus::Deleted => Err(Error::Deleted),
            CollectionStatus::Corrupted => Err(Error::CorruptedCollection(handle.name().to_string())),
            CollectionStatus::Loading | CollectionStatus::Unloading => Err(Error::NotLoaded),
            CollectionStatus::Unloaded => {
                // reap workers of a previous load generation
                store::join_workers(handle);
                handle.set_status(CollectionStatus::Loading);

                match DocumentCollection::open(
                    handle.directory().clone(),
                    self.tick.clone(),
                    self.runtime(),
                ) {
                    Ok(collection) => {
                        handle.install(collection.clone());
                        handle.set_status(CollectionStatus::Loaded);
                        store::spawn_workers(handle)?;
                        Ok(collection)
                    }
                    Err(err) => {
                        error!("cannot open collection '{}': {}", handle.name(), err);
                        handle.set_status(CollectionStatus::Corrupted);
                        Err(err)
                    }
                }
            }
        }
    }

    /// Convenience: look up a collection by name and make sure it is
    /// loaded.
    pub fn use_collection(&self, name: &str) -> Result<Arc<DocumentCollection>> {
        let handle = self
            .collection_by_name(name)
            .ok_or_else(|| Error::CollectionNotFound(name.to_string()))?;
        self.load_collection(&handle)
    }

    /// Request an unload. The cleanup worker executes it once no reader
    /// pins remain; the workers exit afterwards.
    pub fn unload_collection(&self, handle: &Arc<CollectionHandle>) -> Result<()> {
        let _registry = self.registry.write().unwrap();

        match handle.status() {
            CollectionStatus::Unloaded | CollectionStatus::Unloading => Ok(()),
            CollectionStatus::Deleted => Err(Error::Deleted),
            CollectionStatus::Corrupted => Err(Error::CorruptedCollection(handle.name().to_string())),
            CollectionStatus::Loading => Err(Error::NotLoaded),
            CollectionStatus::Loaded => {
                let collection = handle.collection()?;
                handle.set_status(CollectionStatus::Unloading);
                collection.begin_shutdown();
                collection.barriers.push_action(BarrierAction::CollectionUnload);
                collection.wake_cleanup();
                Ok(())
            }
        }
    }

    /// Drop a collection. The deleted flag is persisted first so an
    /// interrupted drop is finished on the next open.
    pub fn drop_collection(&self, handle: &Arc<CollectionHandle>) -> Result<()> {
        let mut registry = self.registry.write().unwrap();

        match handle.status() {
            CollectionStatus::Deleted => Ok(()),
            CollectionStatus::Loading | CollectionStatus::Unloading => Err(Error::NotLoaded),
            CollectionStatus::Loaded => {
                let collection = handle.collection()?;
                {
                    let mut parameters = collection.parameters.write().unwrap();
                    parameters.deleted = true;
                    parameters.save(handle.directory())?;
                }

                registry.by_name.remove(handle.name());
                registry.by_id.remove(&handle.cid());

                handle.set_status(CollectionStatus::Unloading);
                collection.begin_shutdown();
                collection.barriers.push_action(BarrierAction::CollectionDrop);
                collection.wake_cleanup();
                Ok(())
            }
            CollectionStatus::Unloaded | CollectionStatus::Corrupted => {
                match CollectionParameters::load(handle.directory()) {
                    Ok(mut parameters) => {
                        parameters.deleted = true;
                        if let Err(err) = parameters.save(handle.directory()) {
                            warn!("cannot persist deleted flag for '{}': {}", handle.name(), err);
                        }
                    }
                    Err(err) => {
                        warn!("cannot load parameters of '{}': {}", handle.name(), err);
                    }
                }

                registry.by_name.remove(handle.name());
                registry.by_id.remove(&handle.cid());

                let target = self.path.join(deleted_collection_dirname(handle.cid()));
                if let Err(err) = std::fs::rename(handle.directory(), &target) {
                    error!(
                        "cannot rename dropped collection '{}': {}",
                        handle.directory().display(),
                        err
                    );
                } else if self.config.remove_on_dropped {
                    if let Err(err) = std::fs::remove_dir_all(&target) {
                        error!("cannot remove dropped collection '{}': {}", target.display(), err);
                    }
                }

                handle.set_status(CollectionStatus::Deleted);
                Ok(())
            }
        }
    }

    /// Shut everything down: stop accepting writes, join the workers of
    /// every collection (synchroniser, compactor, cleanup), run a final
    /// forced drain of pending barrier actions and unload.
    pub fn close(self) -> Result<()> {
        self.close_internal()
    }

    fn close_internal(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let handles: Vec<Arc<CollectionHandle>> = {
            let registry = self.registry.read().unwrap();
            registry.by_id.values().cloned().collect()
        };

        for handle in handles {
            let collection = handle.try_collection();

            if let Some(collection) = collection {
                collection.begin_shutdown();
                store::join_workers(&handle);
                store::drain_barriers(&handle, &collection, true);

                if handle.try_collection().is_some() {
                    collection.close_files();
                    handle.clear_collection();
                    if handle.status() != CollectionStatus::Deleted {
                        handle.set_status(CollectionStatus::Unloaded);
                    }
                }
            } else {
                store::join_workers(&handle);
            }
        }

        info!("closed database '{}'", self.path.display());
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(err) = self.close_internal() {
            error!("error while closing database '{}': {}", self.path.display(), err);
        }
    }
}

fn check_collection_name(name: &str) -> Result<()> {
    if !COLLECTION_NAME_RE.is_match(name) {
        return Err(Error::IllegalName(name.to_string()));
    }
    Ok(())
}

fn read_or_create_server_id(path: &Path) -> Result<u16> {
    let filename = path.join(SERVER_FILENAME);
    match std::fs::read_to_string(&filename) {
        Ok(raw) => raw.trim().parse::<u16>().map_err(|_| {
            Error::InvalidParameter(format!("invalid server id in '{}'", filename.display()))
        }),
        Err(ref err) if err.kind() == std::io::ErrorKind::NotFound => {
            let server_id = generate_server_id();
            tools::file_set_contents(&filename, format!("{}\n", server_id).as_bytes(), None)?;
            Ok(server_id)
        }
        Err(err) => Err(err.into()),
    }
}

/// Derive a 16-bit server identifier for a fresh database directory.
fn generate_server_id() -> u16 {
    use siphasher::sip::SipHasher13;
    use std::hash::Hasher;

    let mut hasher = SipHasher13::new();
    hasher.write_u32(std::process::id());
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    hasher.write_u64(now.as_secs());
    hasher.write_u32(now.subsec_nanos());

    let server_id = hasher.finish() as u16;
    if server_id == 0 {
        1
    } else {
        server_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_initialises_lock_and_server_id() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let database = Database::open(dir.path(), DatabaseConfig::default())?;
        assert!(dir.path().join("lock").exists());
        assert!(dir.path().join("SERVER").exists());

        let server_id = database.server_id();
        assert_ne!(server_id, 0);
        database.close()?;

        // the server id is stable across opens
        let database = Database::open(dir.path(), DatabaseConfig::default())?;
        assert_eq!(database.server_id(), server_id);
        database.close()?;
        Ok(())
    }

    #[test]
    fn second_open_is_refused() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let first = Database::open(dir.path(), DatabaseConfig::default())?;

        match Database::open(dir.path(), DatabaseConfig::default()) {
            Err(Error::DatabaseLocked(_)) => {}
            Ok(_) => panic!("second open must be refused"),
            Err(err) => panic!("unexpected error: {}", err),
        }

        first.close()?;
        let reopened = Database::open(dir.path(), DatabaseConfig::default())?;
        reopened.close()?;
        Ok(())
    }

    #[test]
    fn collection_names_are_checked() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let database = Database::open(dir.path(), DatabaseConfig::default())?;

        for name in &["", "1abc", "has space", "_private"] {
            match database.create_collection(name, CollectionOptions::default()) {
                Err(Error::IllegalName(_)) => {}
                _ => panic!("name '{}' must be rejected", name),
            }
        }

        database.create_collection("valid-Name_1", CollectionOptions::default())?;
        match database.create_collection("valid-Name_1", CollectionOptions::default()) {
            Err(Error::DuplicateName(_)) => {}
            _ => panic!("duplicate name must be rejected"),
        }

        database.close()?;
        Ok(())
    }
}
