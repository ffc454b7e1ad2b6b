//! Single-instance election and command forwarding.
//!
//! The first process to take the lock file becomes the main instance and
//! reads frames from a named pipe. Later processes become secondaries and
//! forward their command line through the pipe. Delivery is best effort:
//! a frame sent while no reader is attached is dropped.
//!
//! Senders take turns on a lock file next to the pipe and hold it until the
//! reader has drained their frame, so each read on the main side returns
//! exactly one frame.

mod frame;
mod listener;
mod lock;

pub use frame::{decode_args, decode_frame, encode_args, encode_frame, Frame, MAX_FRAME_LEN};
pub use listener::Listener;
pub use lock::InstanceLock;

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::InstanceConfig;
use crate::error::{Error, Result};

/// Event carrying a forwarded argv.
pub const RUN_EVENT: &str = "run";
/// Event asking the main instance to exit. Empty payload.
pub const SHUTDOWN_EVENT: &str = "shutdown";

/// Longest a sender waits for the reader to take its frame.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const DRAIN_POLL: Duration = Duration::from_millis(1);

type Handler = Box<dyn Fn(&[u8]) + Send + Sync>;

/// Callbacks keyed by event name.
#[derive(Default)]
pub struct HandlerTable {
    handlers: HashMap<String, Handler>,
}

impl HandlerTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `event`, replacing any previous one.
    #[must_use]
    pub fn on<F>(mut self, event: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.handlers.insert(event.into(), Box::new(handler));
        self
    }

    #[must_use]
    pub fn handles(&self, event: &str) -> bool {
        self.handlers.contains_key(event)
    }

    /// Decode `bytes` and run the matching handler. Returns `false` for
    /// malformed frames and unknown events, which are logged and dropped.
    pub fn dispatch(&self, bytes: &[u8]) -> bool {
        let frame = match decode_frame(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping frame: {}", e);
                return false;
            }
        };

        match self.handlers.get(frame.event) {
            Some(handler) => {
                debug!("Dispatching {} ({} bytes)", frame.event, frame.payload.len());
                handler(frame.payload);
                true
            }
            None => {
                warn!("No handler for event {}", frame.event);
                false
            }
        }
    }
}

/// Whether a frame reached a reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    Dropped,
}

/// Outcome of the election.
pub enum Role {
    Main(MainInstance),
    Secondary(SecondaryInstance),
}

impl Role {
    #[must_use]
    pub fn is_main(&self) -> bool {
        matches!(self, Self::Main(_))
    }
}

/// Holds the instance lock and the pipe listener for the process lifetime.
pub struct MainInstance {
    // Must drop before `lock`.
    listener: Listener,
    lock: InstanceLock,
}

impl MainInstance {
    #[must_use]
    pub fn pipe_path(&self) -> &Path {
        self.listener.pipe_path()
    }

    #[must_use]
    pub fn lock_path(&self) -> &Path {
        self.lock.path()
    }
}

/// Sends frames to the main instance.
#[derive(Debug, Clone)]
pub struct SecondaryInstance {
    pipe_path: PathBuf,
    send_lock_path: PathBuf,
}

impl SecondaryInstance {
    pub fn new(pipe_path: impl Into<PathBuf>) -> Self {
        let pipe_path = pipe_path.into();
        let mut send_lock_path = OsString::from(pipe_path.as_os_str());
        send_lock_path.push(".lock");
        Self {
            pipe_path,
            send_lock_path: PathBuf::from(send_lock_path),
        }
    }

    #[must_use]
    pub fn pipe_path(&self) -> &Path {
        &self.pipe_path
    }

    /// Write one frame to the main instance's pipe.
    ///
    /// Concurrent senders, in this process or others, are serialized and
    /// each waits until the reader has taken its frame before returning.
    /// A missing pipe or absent reader is not an error: the frame is
    /// dropped and [`Delivery::Dropped`] returned.
    ///
    /// # Errors
    /// [`Error::InvalidFrame`] if the frame cannot be encoded, or
    /// [`Error::IoAt`] if the sender lock cannot be taken.
    pub fn send(&self, event: &str, payload: &[u8]) -> Result<Delivery> {
        let frame = encode_frame(event, payload)?;
        if !self.pipe_path.exists() {
            debug!("No pipe at {}; dropping {}", self.pipe_path.display(), event);
            return Ok(Delivery::Dropped);
        }
        let _turn = InstanceLock::acquire(&self.send_lock_path)?;

        // Without a reader a non-blocking open fails with ENXIO.
        let mut pipe = match OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.pipe_path)
        {
            Ok(pipe) => pipe,
            Err(e) => {
                debug!("{}", Error::BrokenRoute(format!("{}: {}", self.pipe_path.display(), e)));
                return Ok(Delivery::Dropped);
            }
        };

        if let Err(e) = pipe.write_all(&frame) {
            warn!("{}", Error::BrokenRoute(e.to_string()));
            return Ok(Delivery::Dropped);
        }
        wait_for_drain(&pipe);
        Ok(Delivery::Delivered)
    }

    /// Forward a command line as a [`RUN_EVENT`] frame.
    ///
    /// # Errors
    /// [`Error::InvalidFrame`] if the encoded argv is too long.
    pub fn forward_command(&self, argv: &[String]) -> Result<Delivery> {
        self.send(RUN_EVENT, &encode_args(argv))
    }

    /// # Errors
    /// Same as [`send`](Self::send).
    pub fn request_shutdown(&self) -> Result<Delivery> {
        self.send(SHUTDOWN_EVENT, &[])
    }
}

/// Block until the pipe is empty or [`DRAIN_TIMEOUT`] passes.
fn wait_for_drain(pipe: &File) {
    let deadline = Instant::now() + DRAIN_TIMEOUT;
    loop {
        let mut pending: libc::c_int = 0;
        // SAFETY: `pipe` owns a valid descriptor and FIONREAD writes one int.
        if unsafe { libc::ioctl(pipe.as_raw_fd(), libc::FIONREAD, &mut pending) } != 0 {
            debug!("Cannot query the pipe: {}", io::Error::last_os_error());
            return;
        }
        if pending == 0 {
            return;
        }
        if Instant::now() >= deadline {
            warn!("Reader left {} bytes in the pipe; releasing anyway", pending);
            return;
        }
        thread::sleep(DRAIN_POLL);
    }
}

/// Take the lock and start listening with `handlers`, or become a
/// secondary if another process already holds it.
///
/// # Errors
/// IO failures on the lock file or pipe.
pub fn elect(config: &InstanceConfig, handlers: HandlerTable) -> Result<Role> {
    elect_with(config, || Ok(handlers))
}

/// Like [`elect`], but only builds the handler table once this process has
/// won. Work done in `on_main` completes before any forwarded frame is read.
///
/// # Errors
/// IO failures on the lock file or pipe, or the error from `on_main`.
pub fn elect_with<F>(config: &InstanceConfig, on_main: F) -> Result<Role>
where
    F: FnOnce() -> Result<HandlerTable>,
{
    let Some(lock) = InstanceLock::try_acquire(&config.lock_path)? else {
        info!("Another instance is running; forwarding to it");
        return Ok(Role::Secondary(SecondaryInstance::new(&config.pipe_path)));
    };

    let handlers = on_main()?;
    let listener = Listener::start(&config.pipe_path, config.poll_interval(), handlers)?;
    info!("Elected main instance (lock {})", lock.path().display());
    Ok(Role::Main(MainInstance { listener, lock }))
}
