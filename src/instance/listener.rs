use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, warn};

use super::{HandlerTable, MAX_FRAME_LEN};
use crate::error::{Error, Result};

/// Background reader draining the named pipe and dispatching frames.
pub struct Listener {
    pipe_path: PathBuf,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Listener {
    /// Create the pipe at `pipe_path` if needed and start reading it.
    ///
    /// # Errors
    /// [`Error::IoAt`] if the pipe cannot be created or opened, or
    /// [`Error::Io`] if the thread cannot be spawned.
    pub fn start(
        pipe_path: impl AsRef<Path>,
        poll_interval: Duration,
        handlers: HandlerTable,
    ) -> Result<Self> {
        let pipe_path = pipe_path.as_ref().to_path_buf();
        create_fifo(&pipe_path)?;

        let pipe = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&pipe_path)
            .map_err(|e| Error::io_at(&pipe_path, e))?;

        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("hearth-router".to_string())
                .spawn(move || read_frames(pipe, &handlers, &stop, poll_interval))?
        };
        debug!("Listening on {}", pipe_path.display());

        Ok(Self {
            pipe_path,
            stop,
            thread: Some(thread),
        })
    }

    #[must_use]
    pub fn pipe_path(&self) -> &Path {
        &self.pipe_path
    }

    /// Signal the reader to stop and wait for it.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Router thread panicked");
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop();
        if let Err(e) = fs::remove_file(&self.pipe_path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove {}: {}", self.pipe_path.display(), e);
            }
        }
    }
}

fn create_fifo(path: &Path) -> Result<()> {
    if let Ok(metadata) = fs::symlink_metadata(path) {
        if metadata.file_type().is_fifo() {
            debug!("Reusing pipe {}", path.display());
            return Ok(());
        }
        return Err(Error::io_at(
            path,
            io::Error::new(io::ErrorKind::AlreadyExists, "path exists and is not a named pipe"),
        ));
    }

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| Error::io_at(path, io::Error::new(io::ErrorKind::InvalidInput, e)))?;
    // SAFETY: `c_path` is a valid NUL-terminated string.
    if unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) } != 0 {
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::AlreadyExists {
            return Err(Error::io_at(path, err));
        }
    }
    Ok(())
}

fn read_frames(mut pipe: File, handlers: &HandlerTable, stop: &AtomicBool, poll_interval: Duration) {
    let mut buf = vec![0u8; MAX_FRAME_LEN];

    while !stop.load(Ordering::Acquire) {
        match pipe.read(&mut buf) {
            // One read returns one whole frame: writes are atomic and
            // senders wait for the pipe to drain before the next one.
            Ok(n) if n > 0 => {
                handlers.dispatch(&buf[..n]);
            }
            Ok(_) => thread::sleep(poll_interval),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(poll_interval),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                error!("Reading the router pipe failed: {}", e);
                thread::sleep(poll_interval);
            }
        }
    }
}
