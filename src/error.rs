use std::path::PathBuf;

/// Errors surfaced by the storage engine.
///
/// `DatafileFull` is handled internally by the journal selection loop
/// and normally never reaches a caller; everything else is a real
/// failure of the requested operation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("datafile is full")]
    DatafileFull,

    #[error("datafile {0} is not writable")]
    WriteFailed(u64),

    #[error("msync failed on datafile {0}")]
    MsyncFailed(u64),

    #[error("corrupted datafile '{0}'")]
    CorruptedDatafile(PathBuf),

    #[error("corrupted collection '{0}'")]
    CorruptedCollection(String),

    #[error("collection '{0}' not found")]
    CollectionNotFound(String),

    #[error("document {0} not found")]
    DocumentNotFound(u64),

    #[error("conflict: expected revision {expected}, found {found}")]
    Conflict { expected: u64, found: u64 },

    #[error("no journal available")]
    NoJournal,

    #[error("illegal collection name '{0}'")]
    IllegalName(String),

    #[error("duplicate collection name '{0}'")]
    DuplicateName(String),

    #[error("duplicate identifier {0}")]
    DuplicateIdentifier(u64),

    #[error("document of {size} bytes exceeds maximal datafile size {maximal}")]
    DocumentTooLarge { size: u64, maximal: u32 },

    #[error("collection is not loaded")]
    NotLoaded,

    #[error("collection was deleted")]
    Deleted,

    #[error("database directory '{0}' is locked by another process")]
    DatabaseLocked(PathBuf),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("system error: {0}")]
    Sys(#[from] nix::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
