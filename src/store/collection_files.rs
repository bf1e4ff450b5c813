use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use log::warn;
use regex::Regex;

use crate::error::Result;

lazy_static! {
    static ref DATAFILE_RE: Regex =
        Regex::new(r"^(journal|datafile|compactor)-([0-9]+)\.db$").unwrap();
    static ref INDEX_RE: Regex = Regex::new(r"^index-([0-9]+)\.json$").unwrap();
    static ref COLLECTION_DIR_RE: Regex = Regex::new(r"^collection-([0-9]+)$").unwrap();
}

/// The classified content of a collection directory, sorted by file id.
#[derive(Debug, Default)]
pub struct CollectionFiles {
    pub journals: Vec<(u64, PathBuf)>,
    pub datafiles: Vec<(u64, PathBuf)>,
    pub compactors: Vec<(u64, PathBuf)>,
    pub indexes: Vec<(u64, PathBuf)>,
}

/// Scan a collection directory and classify its files. Unknown `.db`
/// or `.json` files are logged and skipped; retired `deleted-*` files
/// are ignored.
pub fn scan_collection_directory(path: &Path) -> Result<CollectionFiles> {
    let mut files = CollectionFiles::default();

    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let name = match file_name.to_str() {
            Some(name) => name,
            None => continue,
        };

        if let Some(captures) = DATAFILE_RE.captures(name) {
            let fid: u64 = match captures[2].parse() {
                Ok(fid) => fid,
                Err(_) => {
                    warn!("ignoring datafile with invalid id: '{}'", name);
                    continue;
                }
            };
            let target = match &captures[1] {
                "journal" => &mut files.journals,
                "datafile" => &mut files.datafiles,
                _ => &mut files.compactors,
            };
            target.push((fid, entry.path()));
        } else if let Some(captures) = INDEX_RE.captures(name) {
            if let Ok(iid) = captures[1].parse() {
                files.indexes.push((iid, entry.path()));
            }
        } else if name.ends_with(".db") {
            warn!("unknown datafile '{}'", name);
        }
    }

    files.journals.sort_by_key(|(fid, _)| *fid);
    files.datafiles.sort_by_key(|(fid, _)| *fid);
    files.compactors.sort_by_key(|(fid, _)| *fid);
    files.indexes.sort_by_key(|(iid, _)| *iid);

    Ok(files)
}

pub fn journal_path(directory: &Path, fid: u64) -> PathBuf {
    directory.join(format!("journal-{}.db", fid))
}

pub fn datafile_path(directory: &Path, fid: u64) -> PathBuf {
    directory.join(format!("datafile-{}.db", fid))
}

pub fn compactor_path(directory: &Path, fid: u64) -> PathBuf {
    directory.join(format!("compactor-{}.db", fid))
}

pub fn deleted_datafile_path(directory: &Path, fid: u64) -> PathBuf {
    directory.join(format!("deleted-{}.db", fid))
}

pub fn collection_dirname(cid: u64) -> String {
    format!("collection-{}", cid)
}

pub fn deleted_collection_dirname(cid: u64) -> String {
    format!("deleted-{}", cid)
}

pub fn parse_collection_dirname(name: &str) -> Option<u64> {
    COLLECTION_DIR_RE.captures(name)?[1].parse().ok()
}
