//! Process-wide exclusivity lock backed by an advisory `flock` on a file

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Exclusive, non-blocking lock keyed by a well-known path.
///
/// At most one live holder exists across processes. The lock is released,
/// and its file removed, on [`ProcessLock::release`] or when dropped.
#[derive(Debug)]
pub struct ProcessLock {
    path: PathBuf,
    file: Option<File>,
}

impl ProcessLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }

    /// Try to take the lock without waiting. Returns `false` when another
    /// holder exists or the lock file cannot be used.
    pub fn try_acquire(&mut self) -> bool {
        if self.is_held() {
            return true;
        }

        match self.lock_file() {
            Ok(Some(file)) => {
                info!(path = %self.path.display(), "Acquired exclusive lock for CDC processing");
                self.file = Some(file);
                true
            }
            Ok(None) => {
                error!(path = %self.path.display(), "Another CDC process is already running");
                false
            }
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "Failed to acquire exclusive lock");
                false
            }
        }
    }

    fn lock_file(&self) -> io::Result<Option<File>> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.path)?;

        // SAFETY: the descriptor is owned by `file` and valid for this call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(code) if code == libc::EWOULDBLOCK => Ok(None),
                _ => Err(err),
            };
        }

        // A previous holder may have unlinked the path between our open and
        // flock; a lock on an orphaned inode excludes nobody.
        if !still_linked(&self.path, &file)? {
            return Ok(None);
        }

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Some(file))
    }

    /// Release the lock and remove its file. Safe to call repeatedly.
    pub fn release(&mut self) {
        let Some(file) = self.file.take() else {
            return;
        };

        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Error removing lock file");
            }
        }

        // SAFETY: the descriptor is owned by `file` and valid for this call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
        if rc != 0 {
            warn!(
                path = %self.path.display(),
                error = %io::Error::last_os_error(),
                "Error releasing lock"
            );
        }
        drop(file);
        info!(path = %self.path.display(), "Released exclusive lock");
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        self.release();
    }
}

/// Whether `path` still names the inode `file` has open. A vanished path
/// counts as contention with the holder that removed it.
fn still_linked(path: &Path, file: &File) -> io::Result<bool> {
    let on_disk = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    let opened = file.metadata()?;
    Ok(on_disk.dev() == opened.dev() && on_disk.ino() == opened.ino())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn test_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cdc.lock");

        let mut lock = ProcessLock::new(&path);
        assert!(lock.try_acquire());
        assert!(lock.is_held());
        assert!(path.exists());

        lock.release();
        assert!(!lock.is_held());
        assert!(!path.exists());

        // idempotent
        lock.release();
    }

    #[test]
    fn test_second_holder_fails_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cdc.lock");

        let mut first = ProcessLock::new(&path);
        assert!(first.try_acquire());

        let mut second = ProcessLock::new(&path);
        let started = Instant::now();
        assert!(!second.try_acquire());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!second.is_held());

        first.release();
        assert!(second.try_acquire());
    }

    #[test]
    fn test_drop_releases_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cdc.lock");

        {
            let mut lock = ProcessLock::new(&path);
            assert!(lock.try_acquire());
        }
        assert!(!path.exists());

        let mut again = ProcessLock::new(&path);
        assert!(again.try_acquire());
    }

    #[test]
    fn test_unlinked_lock_file_reads_as_contention() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cdc.lock");
        let file = File::create(&path).unwrap();

        assert!(still_linked(&path, &file).unwrap());

        fs::remove_file(&path).unwrap();
        assert!(!still_linked(&path, &file).unwrap());

        // recreated by another process: a different inode
        File::create(&path).unwrap();
        assert!(!still_linked(&path, &file).unwrap());
    }

    #[test]
    fn test_unusable_path_fails() {
        let mut lock = ProcessLock::new("/nonexistent-dir/opsync/cdc.lock");
        assert!(!lock.try_acquire());
    }
}
