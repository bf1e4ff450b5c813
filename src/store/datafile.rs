use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, trace, warn};
use memmap2::{MmapMut, MmapOptions};

use crate::error::{Error, Result};
use crate::tools;

use super::marker::{self, align_size, MarkerRef, MarkerType, COMMON_HEADER_SIZE, FILE_FOOTER_SIZE, FILE_HEADER_SIZE};

/// Space kept back by every reservation so the footer always fits.
const FOOTER_RESERVE: u32 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatafileState {
    Write,
    Read,
    WriteError,
    Closed,
}

impl DatafileState {
    fn tag(self) -> u8 {
        match self {
            DatafileState::Write => 1,
            DatafileState::Read => 2,
            DatafileState::WriteError => 3,
            DatafileState::Closed => 4,
        }
    }

    fn from_tag(tag: u8) -> Self {
        match tag {
            1 => DatafileState::Write,
            2 => DatafileState::Read,
            3 => DatafileState::WriteError,
            _ => DatafileState::Closed,
        }
    }
}

/// One append-only, memory-mapped marker file.
///
/// The mapping is created once and its base address never changes for
/// the lifetime of the value. Marker regions are written exactly once,
/// by the thread holding the reservation for that region, and become
/// readable for everyone only after the write completed and the write
/// cursor was advanced under the owning collection's journals lock.
/// The cursors and flags are atomics, but all coordinated read-modify
/// sequences on them happen under that same lock.
pub struct Datafile {
    fid: u64,
    capacity: u32,
    file: File,
    mmap: MmapMut,
    data: *mut u8,
    path: Mutex<PathBuf>,
    state: AtomicU8,
    sealed: AtomicBool,
    full: AtomicBool,
    current: AtomicU32,
    written: AtomicU32,
    synced: AtomicU32,
    n_written: AtomicU32,
    n_synced: AtomicU32,
    last_synced: AtomicU64,
}

unsafe impl Send for Datafile {}
unsafe impl Sync for Datafile {}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

impl Datafile {
    /// Create a fresh journal or compactor file of the given capacity
    /// and stamp the file header marker. The header is synced before
    /// this returns.
    pub fn create(path: &Path, fid: u64, capacity: u32, cid: u64) -> Result<Datafile> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_len(capacity as u64)?;

        let mut mmap = unsafe { MmapOptions::new().len(capacity as usize).map_mut(&file)? };
        let data = mmap.as_mut_ptr();

        let datafile = Datafile {
            fid,
            capacity,
            file,
            mmap,
            data,
            path: Mutex::new(path.to_owned()),
            state: AtomicU8::new(DatafileState::Write.tag()),
            sealed: AtomicBool::new(false),
            full: AtomicBool::new(false),
            current: AtomicU32::new(0),
            written: AtomicU32::new(0),
            synced: AtomicU32::new(0),
            n_written: AtomicU32::new(0),
            n_synced: AtomicU32::new(0),
            last_synced: AtomicU64::new(0),
        };

        let header = marker::file_header_marker(fid, cid);
        let offset = datafile.reserve(FILE_HEADER_SIZE)?;
        datafile.write(offset, &header, &[]);
        let end = offset + align_size(FILE_HEADER_SIZE);
        datafile.written.store(end, Ordering::SeqCst);

        if let Err(err) = datafile.sync(0, end) {
            warn!("cannot sync header of new datafile '{}': {}", path.display(), err);
            return Err(Error::MsyncFailed(fid));
        }
        datafile.synced.store(end, Ordering::SeqCst);
        datafile.last_synced.store(now_micros(), Ordering::SeqCst);

        trace!("created datafile '{}', capacity {}", path.display(), capacity);

        Ok(datafile)
    }

    /// Open an existing marker file. The file is scanned forward from
    /// the header; the cursors are placed after the last valid marker
    /// and everything beyond it is ignored (a crash may leave a
    /// partially written tail behind).
    pub fn open(path: &Path, fid: u64) -> Result<Datafile> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let capacity = file.metadata()?.len();
        if capacity < align_size(FILE_HEADER_SIZE) as u64 + FOOTER_RESERVE as u64 || capacity > u32::max_value() as u64 {
            return Err(Error::CorruptedDatafile(path.to_owned()));
        }
        let capacity = capacity as u32;

        let mut mmap = unsafe { MmapOptions::new().len(capacity as usize).map_mut(&file)? };
        let data = mmap.as_mut_ptr();

        let datafile = Datafile {
            fid,
            capacity,
            file,
            mmap,
            data,
            path: Mutex::new(path.to_owned()),
            state: AtomicU8::new(DatafileState::Write.tag()),
            sealed: AtomicBool::new(false),
            full: AtomicBool::new(false),
            current: AtomicU32::new(0),
            written: AtomicU32::new(0),
            synced: AtomicU32::new(0),
            n_written: AtomicU32::new(0),
            n_synced: AtomicU32::new(0),
            last_synced: AtomicU64::new(0),
        };

        let (end, sealed) = datafile.scan();
        if end == 0 {
            // not even a valid header marker
            return Err(Error::CorruptedDatafile(path.to_owned()));
        }
        if !sealed && end < capacity {
            debug!(
                "datafile '{}' has a partial tail at offset {}, ignoring {} trailing bytes",
                path.display(), end, capacity - end
            );
        }

        datafile.current.store(end, Ordering::SeqCst);
        datafile.written.store(end, Ordering::SeqCst);
        datafile.synced.store(end, Ordering::SeqCst);
        if sealed {
            datafile.sealed.store(true, Ordering::SeqCst);
            datafile.state.store(DatafileState::Read.tag(), Ordering::SeqCst);
        }

        Ok(datafile)
    }

    pub fn fid(&self) -> u64 {
        self.fid
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn path(&self) -> PathBuf {
        self.path.lock().unwrap().clone()
    }

    pub fn state(&self) -> DatafileState {
        DatafileState::from_tag(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: DatafileState) {
        self.state.store(state.tag(), Ordering::SeqCst);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    pub fn is_full(&self) -> bool {
        self.full.load(Ordering::SeqCst)
    }

    pub fn set_full(&self) {
        self.full.store(true, Ordering::SeqCst);
    }

    pub fn written(&self) -> u32 {
        self.written.load(Ordering::SeqCst)
    }

    pub fn synced(&self) -> u32 {
        self.synced.load(Ordering::SeqCst)
    }

    pub fn n_written(&self) -> u32 {
        self.n_written.load(Ordering::SeqCst)
    }

    pub fn n_synced(&self) -> u32 {
        self.n_synced.load(Ordering::SeqCst)
    }

    pub fn last_synced_micros(&self) -> u64 {
        self.last_synced.load(Ordering::SeqCst)
    }

    /// Reserve space for a marker of `size` bytes. Must be called with
    /// the owning collection's journals lock held. Fails with
    /// `DatafileFull` when the aligned size plus the footer reserve no
    /// longer fits.
    pub fn reserve(&self, size: u32) -> Result<u32> {
        if self.state() != DatafileState::Write {
            return Err(Error::WriteFailed(self.fid));
        }
        let needed = align_size(size);
        let current = self.current.load(Ordering::SeqCst);
        if current as u64 + needed as u64 + FOOTER_RESERVE as u64 > self.capacity as u64 {
            return Err(Error::DatafileFull);
        }
        self.current.store(current + needed, Ordering::SeqCst);
        Ok(current)
    }

    /// Copy a marker into its reserved slot. The alignment padding is
    /// zeroed so a later scan cannot misread stale bytes as a size
    /// field.
    pub fn write(&self, offset: u32, prefix: &[u8], body: &[u8]) {
        let size = prefix.len() + body.len();
        let aligned = align_size(size as u32) as usize;
        debug_assert!(offset as usize + aligned <= self.capacity as usize);
        unsafe {
            let dst = self.data.add(offset as usize);
            ptr::copy_nonoverlapping(prefix.as_ptr(), dst, prefix.len());
            if !body.is_empty() {
                ptr::copy_nonoverlapping(body.as_ptr(), dst.add(prefix.len()), body.len());
            }
            if aligned > size {
                ptr::write_bytes(dst.add(size), 0, aligned - size);
            }
        }
    }

    /// Advance the write cursor past a completed marker. Must be
    /// called with the journals lock held.
    pub fn note_write(&self, end: u32) {
        self.written.fetch_max(end, Ordering::SeqCst);
        self.n_written.fetch_add(1, Ordering::SeqCst);
    }

    /// Record a successful sync up to `end`. Must be called with the
    /// journals lock held.
    pub fn note_synced(&self, end: u32, n_written: u32) {
        self.synced.fetch_max(end, Ordering::SeqCst);
        self.n_synced.fetch_max(n_written, Ordering::SeqCst);
        self.last_synced.store(now_micros(), Ordering::SeqCst);
    }

    /// Flush the page-aligned superset of `[begin, end)` to disk. On
    /// platforms that support it, a file-level full flush follows the
    /// range flush.
    pub fn sync(&self, begin: u32, end: u32) -> std::io::Result<()> {
        if end <= begin {
            return Ok(());
        }
        let page = tools::page_size() as u32;
        let start = begin & !(page - 1);
        self.mmap.flush_range(start as usize, (end - start) as usize)?;

        #[cfg(any(target_os = "macos", target_os = "ios"))]
        {
            use nix::fcntl::{fcntl, FcntlArg};
            use std::os::unix::io::AsRawFd;
            fcntl(self.file.as_raw_fd(), FcntlArg::F_FULLFSYNC)
                .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;
        }

        trace!("msync succeeded on datafile {}, range {}..{}", self.fid, begin, end);
        Ok(())
    }

    /// Append the footer, flush everything, flip the file read-only and
    /// rename it to its datafile name inside `directory`.
    pub fn seal(&self, tick: u64, directory: &Path) -> Result<()> {
        if self.is_sealed() {
            return Ok(());
        }
        if self.state() != DatafileState::Write {
            return Err(Error::WriteFailed(self.fid));
        }

        let footer = marker::file_footer_marker(tick);
        let offset = self.current.load(Ordering::SeqCst);
        let end = offset + align_size(FILE_FOOTER_SIZE);
        if end > self.capacity {
            return Err(Error::CorruptedDatafile(self.path()));
        }
        self.write(offset, &footer, &[]);
        self.current.store(end, Ordering::SeqCst);
        self.written.store(end, Ordering::SeqCst);

        if let Err(err) = self.sync(0, end) {
            warn!("cannot sync datafile {} while sealing: {}", self.fid, err);
            self.set_state(DatafileState::WriteError);
            return Err(Error::MsyncFailed(self.fid));
        }
        self.synced.store(end, Ordering::SeqCst);
        self.n_synced.store(self.n_written.load(Ordering::SeqCst), Ordering::SeqCst);
        self.last_synced.store(now_micros(), Ordering::SeqCst);

        self.sealed.store(true, Ordering::SeqCst);
        self.set_state(DatafileState::Read);

        let new_path = super::datafile_path(directory, self.fid);
        self.rename(new_path)?;

        Ok(())
    }

    /// Rename the underlying file, keeping the mapping alive.
    pub fn rename(&self, new_path: PathBuf) -> Result<()> {
        let mut path = self.path.lock().unwrap();
        if *path == new_path {
            return Ok(());
        }
        std::fs::rename(&*path, &new_path)?;
        debug!("renamed datafile '{}' to '{}'", path.display(), new_path.display());
        *path = new_path;
        Ok(())
    }

    /// Mark the file closed. The mapping itself is released when the
    /// last reference goes away.
    pub fn close(&self) {
        self.set_state(DatafileState::Closed);
    }

    /// A slice into the mapped region. Callers must only address bytes
    /// of completed markers.
    pub(crate) fn slice(&self, offset: u32, len: u32) -> &[u8] {
        debug_assert!(offset as u64 + len as u64 <= self.capacity as u64);
        unsafe { slice::from_raw_parts(self.data.add(offset as usize) as *const u8, len as usize) }
    }

    /// Walk all completed markers from the start of the file. The
    /// callback receives each marker and its offset; returning `false`
    /// stops the walk. Iteration ends at the footer, at the write
    /// cursor, or at the first invalid marker.
    pub fn iterate<F>(&self, mut callback: F) -> Result<()>
    where
        F: FnMut(MarkerRef<'_>, u32) -> Result<bool>,
    {
        let limit = self.written();
        let data = self.slice(0, limit);
        let mut offset = 0u32;

        while offset + COMMON_HEADER_SIZE <= limit {
            let marker = match MarkerRef::parse(&data[offset as usize..]) {
                Some(marker) => marker,
                None => break,
            };
            if !marker.check_crc() {
                break;
            }
            if !callback(marker, offset)? {
                break;
            }
            if marker.marker_type() == MarkerType::FileFooter {
                break;
            }
            offset += align_size(marker.size());
        }

        Ok(())
    }

    /// Scan the raw file content for the end of valid data. Returns the
    /// offset just past the last valid marker and whether a footer was
    /// found.
    fn scan(&self) -> (u32, bool) {
        let data = self.slice(0, self.capacity);
        let mut offset = 0u32;
        let mut sealed = false;

        while offset + COMMON_HEADER_SIZE <= self.capacity {
            let marker = match MarkerRef::parse(&data[offset as usize..]) {
                Some(marker) => marker,
                None => break,
            };
            if !marker.check_crc() {
                break;
            }
            if offset == 0 && marker.marker_type() != MarkerType::FileHeader {
                return (0, false);
            }
            offset += align_size(marker.size());
            if marker.marker_type() == MarkerType::FileFooter {
                sealed = true;
                break;
            }
        }

        (offset, sealed)
    }
}
