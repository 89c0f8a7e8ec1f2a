//! Advisory lock file providing mutual exclusion across threads and
//! processes, guarding writes/reads of individual cache files.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

#[cfg(unix)]
use std::os::unix::fs::MetadataExt;

#[derive(Debug, Error)]
pub enum FileLockError {
    #[error("io error acquiring lock {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Named lock file. Acquisition is serialised intra-process by an async
/// mutex so concurrent local acquirers never race on `open`; inter-process
/// exclusion is provided by an exclusive advisory range lock plus an inode
/// re-check that defends against unlink races.
pub struct FileLock {
    path: PathBuf,
    warn_after: Option<Duration>,
    state: AsyncMutex<Option<File>>,
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            warn_after: None,
            state: AsyncMutex::new(None),
        }
    }

    pub fn with_warn_after(mut self, warn_after: Duration) -> Self {
        self.warn_after = Some(warn_after);
        self
    }

    /// Try to acquire the lock. Returns `Ok(true)` iff the caller now
    /// exclusively holds it, `Ok(false)` if non-blocking and contended.
    pub async fn acquire(
        &self,
        blocking: bool,
        timeout: Option<Duration>,
    ) -> Result<bool, FileLockError> {
        let mut guard = self.state.lock().await;
        if guard.is_some() {
            return Ok(true);
        }

        let start = Instant::now();
        let mut warned = false;

        loop {
            if let (Some(warn_after), false) = (self.warn_after, warned) {
                if start.elapsed() > warn_after {
                    warn!(path = %self.path.display(), "waiting to acquire file lock beyond warn threshold");
                    warned = true;
                }
            }

            match self.try_create_and_lock() {
                Ok(Some(file)) => {
                    *guard = Some(file);
                    return Ok(true);
                }
                Ok(None) => {
                    // Contended: file exists, advisory lock busy, or the
                    // inode check failed (unlink race). Retry or give up.
                    if blocking && !timed_out(start, timeout) {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        continue;
                    }
                    return Ok(false);
                }
                Err(source) => {
                    return Err(FileLockError::Io {
                        path: self.path.clone(),
                        source,
                    });
                }
            }
        }
    }

    /// Returns `Ok(Some(file))` on success, `Ok(None)` on ordinary
    /// contention, and `Err` only for other I/O errors.
    fn try_create_and_lock(&self) -> io::Result<Option<File>> {
        let open_result = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true) // O_CREAT | O_EXCL
            .open(&self.path);

        let file = match open_result {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => return Err(e),
        };

        // Non-blocking exclusive lock. The spec's open-question flags a
        // likely bug in one source variant where `errno != EAGAIN or
        // errno != EACCES` is always true; the intent (honored here) is
        // that EITHER errno means ordinary contention, not a fatal error.
        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if is_contention(&e) => return Ok(None),
            Err(e) => return Err(e),
        }

        if let Some(still_ours) = self.path_still_matches(&file)? {
            if still_ours {
                return Ok(Some(file));
            }
        }
        Ok(None)
    }

    #[cfg(unix)]
    fn path_still_matches(&self, file: &File) -> io::Result<Option<bool>> {
        let fd_meta = file.metadata()?;
        Ok(match fs::metadata(&self.path) {
            Ok(path_meta) => Some(path_meta.ino() == fd_meta.ino()),
            Err(_) => Some(false),
        })
    }

    #[cfg(not(unix))]
    fn path_still_matches(&self, _file: &File) -> io::Result<Option<bool>> {
        Ok(Some(self.path.exists()))
    }

    /// Unlink the path, drop the advisory lock, close the descriptor.
    /// Safe to call when not held.
    pub async fn release(&self) {
        let mut guard = self.state.lock().await;
        if let Some(file) = guard.take() {
            let _ = fs::remove_file(&self.path);
            let _ = FileExt::unlock(&file);
            drop(file);
        }
    }
}

fn is_contention(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(code) if code == libc_eagain() || code == libc_eacces()
    ) || err.kind() == io::ErrorKind::WouldBlock
}

#[cfg(unix)]
fn libc_eagain() -> i32 {
    libc::EAGAIN
}
#[cfg(unix)]
fn libc_eacces() -> i32 {
    libc::EACCES
}
#[cfg(not(unix))]
fn libc_eagain() -> i32 {
    -1
}
#[cfg(not(unix))]
fn libc_eacces() -> i32 {
    -1
}

fn timed_out(start: Instant, timeout: Option<Duration>) -> bool {
    match timeout {
        Some(t) => start.elapsed() >= t,
        None => false,
    }
}

#[allow(dead_code)]
pub fn lock_path_for(base_dir: &Path, name: &str) -> PathBuf {
    base_dir.join(format!("{name}.lock"))
}
