//! Fixed-size pool of sort workers.
//!
//! Both architectures feed sort work into the same kind of pool: one shared
//! FIFO queue drained by a fixed number of named threads. The pool caps total
//! sort concurrency no matter how many connections are open.

use super::lock;
use crate::error::ServerError;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Bounded worker pool.
#[derive(Debug)]
pub struct WorkerPool {
    sender: Mutex<Option<Sender<Job>>>,
    accepting: Arc<AtomicBool>,
    /// Disconnects once every worker has exited.
    done: Mutex<Option<Receiver<()>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl WorkerPool {
    /// Spawn `size` worker threads.
    pub fn new(size: usize) -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let accepting = Arc::new(AtomicBool::new(true));

        let mut handles = Vec::with_capacity(size);
        for worker_id in 0..size {
            let receiver = Arc::clone(&receiver);
            let accepting = Arc::clone(&accepting);
            let done_tx = done_tx.clone();

            let handle = thread::Builder::new()
                .name(format!("sort-worker-{worker_id}"))
                .spawn(move || {
                    let _done = done_tx;
                    worker_loop(worker_id, &receiver, &accepting);
                })?;

            handles.push(handle);
        }

        debug!(workers = size, "Worker pool started");

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            accepting,
            done: Mutex::new(Some(done_rx)),
            handles: Mutex::new(handles),
            size,
        })
    }

    /// Number of worker threads.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Queue a job. Fails once the pool has been shut down.
    pub fn submit<F>(&self, job: F) -> Result<(), ServerError>
    where
        F: FnOnce() + Send + 'static,
    {
        match lock(&self.sender).as_ref() {
            Some(sender) => sender
                .send(Box::new(job))
                .map_err(|_| ServerError::PoolClosed),
            None => Err(ServerError::PoolClosed),
        }
    }

    /// Stop accepting work, drop jobs that have not started, and wait up to
    /// `timeout` for running jobs to finish.
    pub fn shutdown(&self, timeout: Duration) -> Result<(), ServerError> {
        self.accepting.store(false, Ordering::Release);
        drop(lock(&self.sender).take());

        let mut done_slot = lock(&self.done);
        let Some(done) = done_slot.as_ref() else {
            return Ok(());
        };

        let deadline = Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match done.recv_timeout(left) {
                Ok(()) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(ServerError::ShutdownTimeout {
                        what: "worker pool",
                        timeout,
                    });
                }
            }
        }
        *done_slot = None;

        for handle in lock(&self.handles).drain(..) {
            let _ = handle.join();
        }

        debug!("Worker pool stopped");
        Ok(())
    }
}

fn worker_loop(worker_id: usize, receiver: &Mutex<Receiver<Job>>, accepting: &AtomicBool) {
    loop {
        let job = lock(receiver).recv();
        let Ok(job) = job else {
            break;
        };

        if !accepting.load(Ordering::Acquire) {
            trace!(worker = worker_id, "Discarding queued job");
            continue;
        }

        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!(worker = worker_id, "Sort job panicked");
        }
    }
}
