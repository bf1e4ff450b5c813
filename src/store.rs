//! This module implements the append-only storage engine.
//!
//! # On-disk format
//!
//! A collection is a directory named `collection-<cid>` containing a
//! `parameter.json` metadata file and a set of marker files:
//!
//! * `journal-<fid>.db` - the file currently being written,
//! * `datafile-<fid>.db` - a sealed, immutable file,
//! * `compactor-<fid>.db` - the file the compaction worker writes to,
//! * `deleted-<fid>.db` - a retired file awaiting unlink,
//! * `index-<iid>.json` - secondary index descriptors.
//!
//! `<fid>` is the datafile identifier, a tick. Every marker file starts
//! with a header marker carrying the collection id and ends, once
//! sealed, with a footer marker. In between lie document, edge and
//! deletion markers, each 8-byte aligned and protected by a CRC32 over
//! the whole marker with the CRC field zeroed. Mutation is always
//! expressed by appending a new marker; the only in-place write ever
//! performed is stamping the footer when a file is sealed.
//!
//! # Write path and durability
//!
//! A write draws a fresh tick, reserves space in the active journal
//! (blocking on the journals condition until the synchroniser has
//! replaced a full one), copies the marker into the mapped region and
//! then updates the in-memory document header and the primary index
//! under the collection write lock. Depending on the collection's sync
//! discipline the writer finally blocks until the synchroniser has
//! flushed the marker's byte range to disk.
//!
//! # Background workers
//!
//! Three workers run per loaded collection:
//!
//! * the *synchroniser* flushes dirty ranges, seals full journals and
//!   keeps one active journal and one active compactor file around,
//! * the *compactor* rewrites still-live markers out of datafiles with
//!   dead entries into the compactor file and retires the originals,
//! * the *cleanup* worker drains the barrier list and executes the
//!   deferred file removal and collection unload/drop actions.
//!
//! Readers that keep marker data beyond the scope of the collection
//! read lock place an element barrier first; no deferred action
//! overtakes a live element in the barrier list.

mod marker;
pub use marker::*;

mod datafile;
pub use datafile::*;

mod datafile_info;
pub use datafile_info::*;

mod parameters;
pub use parameters::*;

mod collection_files;
pub use collection_files::*;

mod barrier;
pub use barrier::*;

mod primary_index;
pub use primary_index::*;

mod tick;
pub use tick::*;

mod collection;
pub use collection::*;

mod synchroniser;

mod compactor;
pub use compactor::CompactionPolicy;

mod cleanup;
pub(crate) use cleanup::drain_barriers;
