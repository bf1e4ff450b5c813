use nix::unistd;
use nix::sys::stat;
use nix::fcntl::{flock, FlockArg};

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use std::os::unix::io::AsRawFd;

use crate::error::{Error, Result};

/// Atomically replace the contents of a file.
///
/// Note: we use mkstemp here, because this works with different
/// processes, threads, and background workers.
pub fn file_set_contents<P: AsRef<Path>>(
    path: P,
    data: &[u8],
    perm: Option<stat::Mode>,
) -> Result<()> {

    let path = path.as_ref();

    let mut template = path.to_owned();
    template.set_extension("tmp_XXXXXX");
    let (fd, tmp_path) = unistd::mkstemp(&template)?;

    let tmp_path = tmp_path.as_path();

    let mode: stat::Mode = perm.unwrap_or(stat::Mode::from(
        stat::Mode::S_IRUSR | stat::Mode::S_IWUSR |
        stat::Mode::S_IRGRP | stat::Mode::S_IROTH
    ));

    if let Err(err) = stat::fchmod(fd, mode) {
        let _ = unistd::unlink(tmp_path);
        return Err(err.into());
    }

    use std::os::unix::io::FromRawFd;
    let mut file = unsafe { File::from_raw_fd(fd) };

    if let Err(err) = file.write_all(data) {
        let _ = unistd::unlink(tmp_path);
        return Err(err.into());
    }

    if let Err(err) = file.sync_all() {
        let _ = unistd::unlink(tmp_path);
        return Err(err.into());
    }

    if let Err(err) = std::fs::rename(tmp_path, path) {
        let _ = unistd::unlink(tmp_path);
        return Err(err.into());
    }

    Ok(())
}

/// Acquire an exclusive flock on the given file, creating it if
/// necessary. The lock is held for as long as the returned handle
/// lives. With `timeout` zero this refuses immediately when another
/// process holds the lock.
pub fn lock_file<P: AsRef<Path>>(
    filename: P,
    timeout: usize,
) -> Result<File> {

    let path = filename.as_ref();
    let lockfile = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;

    let fd = lockfile.as_raw_fd();

    let now = std::time::SystemTime::now();
    loop {
        match flock(fd, FlockArg::LockExclusiveNonblock) {
            Ok(_) => break,
            Err(_) => {
                match now.elapsed() {
                    Ok(elapsed) => {
                        if elapsed.as_secs() >= (timeout as u64) {
                            return Err(Error::DatabaseLocked(path.to_owned()));
                        }
                    }
                    Err(_) => {
                        return Err(Error::DatabaseLocked(path.to_owned()));
                    }
                }
            }
        }
        std::thread::sleep(std::time::Duration::from_millis(100));
    }
    Ok(lockfile)
}

/// The page size of the running system.
pub fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_set_contents_replaces_atomically() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("parameter.json");

        file_set_contents(&path, b"first", None)?;
        assert_eq!(std::fs::read(&path)?, b"first");

        file_set_contents(&path, b"second", None)?;
        assert_eq!(std::fs::read(&path)?, b"second");

        // no temp files may be left behind
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())?
            .filter_map(|e| e.ok())
            .filter(|e| e.path() != path)
            .collect();
        assert!(leftovers.is_empty());
        Ok(())
    }

    #[test]
    fn lock_file_is_exclusive() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("lock");

        let first = lock_file(&path, 0)?;
        // a second lock within the same process succeeds (flock is
        // per-process); just check the handle stays usable
        assert!(first.metadata()?.is_file());
        Ok(())
    }
}
