use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Exclusive advisory lock marking the main instance. Released when dropped
/// or when the process exits.
#[derive(Debug)]
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// Try to take the lock at `path` without blocking. `Ok(None)` means
    /// another process holds it.
    ///
    /// # Errors
    /// [`Error::IoAt`] if the lock file cannot be opened or locked.
    pub fn try_acquire(path: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = path.as_ref();
        let Some(mut lock) = Self::lock(path, libc::LOCK_EX | libc::LOCK_NB)? else {
            debug!("{} is held by another instance", path.display());
            return Ok(None);
        };

        // The pid is informational only.
        if let Err(e) = lock
            .file
            .set_len(0)
            .and_then(|()| write!(lock.file, "{}", std::process::id()))
        {
            warn!("Could not record pid in {}: {}", path.display(), e);
        }
        Ok(Some(lock))
    }

    /// Take the lock at `path`, waiting for any current holder.
    ///
    /// # Errors
    /// [`Error::IoAt`] if the lock file cannot be opened or locked.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        Self::lock(path, libc::LOCK_EX)?.ok_or_else(|| {
            Error::io_at(path, io::Error::from(io::ErrorKind::WouldBlock))
        })
    }

    fn lock(path: &Path, operation: libc::c_int) -> Result<Option<Self>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| Error::io_at(path, e))?;

        loop {
            // SAFETY: `file` owns a valid descriptor for the duration of the call.
            if unsafe { libc::flock(file.as_raw_fd(), operation) } == 0 {
                break;
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => {}
                io::ErrorKind::WouldBlock => return Ok(None),
                _ => return Err(Error::io_at(path, err)),
            }
        }

        Ok(Some(Self {
            file,
            path: path.to_path_buf(),
        }))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        // SAFETY: the descriptor is still owned by `self.file`.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}
