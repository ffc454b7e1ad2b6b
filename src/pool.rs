//! Fixed-size worker pool for plugin entry points.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::error::{Error, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Queue {
    jobs: VecDeque<Job>,
    stopping: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    available: Condvar,
}

/// Runs submitted closures in FIFO order on a fixed set of threads.
pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` workers (at least one).
    ///
    /// # Errors
    /// [`Error::Io`] if a thread cannot be spawned.
    pub fn new(size: usize) -> Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue::default()),
            available: Condvar::new(),
        });

        let mut pool = Self {
            shared,
            workers: Vec::new(),
        };
        for index in 0..size.max(1) {
            let shared = Arc::clone(&pool.shared);
            let worker = thread::Builder::new()
                .name(format!("hearth-worker-{index}"))
                .spawn(move || work(&shared))?;
            pool.workers.push(worker);
        }
        debug!("Started {} workers", pool.workers.len());
        Ok(pool)
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Tasks waiting for a worker.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().jobs.len()
    }

    /// Queue `task` and return a handle to its result.
    pub fn submit<F, R>(&self, task: F) -> TaskHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (sender, receiver) = crossbeam_channel::bounded(1);
        let job: Job = Box::new(move || {
            // The handle may already be gone.
            let _ = sender.send(task());
        });

        {
            let mut queue = self.shared.queue.lock();
            if queue.stopping {
                // Dropping the job disconnects the handle.
                return TaskHandle { receiver };
            }
            queue.jobs.push_back(job);
        }
        self.shared.available.notify_one();
        TaskHandle { receiver }
    }

    /// Stop accepting work, discard queued tasks and join the workers.
    /// Tasks already running finish first.
    pub fn shutdown(&mut self) {
        let discarded = {
            let mut queue = self.shared.queue.lock();
            queue.stopping = true;
            std::mem::take(&mut queue.jobs)
        };
        if !discarded.is_empty() {
            debug!("Discarding {} queued tasks", discarded.len());
        }
        drop(discarded);
        self.shared.available.notify_all();

        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("Worker thread exited abnormally");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn work(shared: &Shared) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if queue.stopping {
                    return;
                }
                if let Some(job) = queue.jobs.pop_front() {
                    break job;
                }
                shared.available.wait(&mut queue);
            }
        };

        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            warn!("Task panicked before producing a result");
        }
    }
}

/// Pending result of a submitted task.
pub struct TaskHandle<R> {
    receiver: Receiver<R>,
}

impl<R> TaskHandle<R> {
    /// Block until the task produces its result.
    ///
    /// # Errors
    /// [`Error::BrokenPromise`] if the task panicked or the pool discarded it.
    pub fn wait(self) -> Result<R> {
        self.receiver.recv().map_err(|_| Error::BrokenPromise)
    }

    /// Like [`wait`](Self::wait), giving up after `timeout` with `Ok(None)`.
    ///
    /// # Errors
    /// [`Error::BrokenPromise`], as for `wait`.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Option<R>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(value) => Ok(Some(value)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(Error::BrokenPromise),
        }
    }
}
