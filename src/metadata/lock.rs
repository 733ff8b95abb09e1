use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::{AttrError, AttrResult};

/// Exclusive advisory lock on a node's lock file.
/// The lock file itself is never removed; dropping the guard only unlocks and closes it.
#[derive(Debug)]
pub struct AttrLock {
    file: File,
    path: PathBuf,
}

impl AttrLock {
    pub fn acquire(lock_path: &Path, timeout: Duration, poll: Duration) -> AttrResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(lock_path)
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => AttrError::NotExist(lock_path.display().to_string()),
                _ => AttrError::Io(e),
            })?;
        let start = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    return Ok(Self { file, path: lock_path.to_path_buf() });
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                    if start.elapsed() >= timeout {
                        warn!(target: "spacefs::metadata", "lock wait on {} exceeded {:?}", lock_path.display(), timeout);
                        return Err(AttrError::LockTimeout(lock_path.display().to_string()));
                    }
                    std::thread::sleep(poll);
                }
                Err(e) => return Err(AttrError::Io(e)),
            }
        }
    }

    pub fn path(&self) -> &Path { &self.path }
}

impl Drop for AttrLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            debug!(target: "spacefs::metadata", "unlock {} failed: {}", self.path.display(), e);
        }
    }
}
