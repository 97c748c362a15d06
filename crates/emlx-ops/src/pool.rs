//! Native worker threads.
//!
//! Operations submitted through [`crate::EmlxContext::submit`] run here,
//! off the caller's thread, the way the array library runs kernels on its
//! own threads. A job may block on a callback into the runtime; the pool
//! keeps serving other jobs on its remaining workers meanwhile.
//!
//! # Design
//!
//! - Fixed number of named worker threads
//! - One shared job queue (`crossbeam-channel`)
//! - Panics are caught per job and reported through its handle
//! - Shutdown drains the queue, then joins every worker

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle as StdJoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::error::PoolError;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// One-shot cell a worker writes the job's outcome into.
struct JobResult<T> {
    result: Mutex<Option<Result<T, PoolError>>>,
    completed: Condvar,
}

impl<T> JobResult<T> {
    fn new() -> Self {
        Self {
            result: Mutex::new(None),
            completed: Condvar::new(),
        }
    }

    fn complete(&self, result: Result<T, PoolError>) {
        *self.result.lock() = Some(result);
        self.completed.notify_all();
    }

    fn wait(&self) -> Result<T, PoolError> {
        let mut result = self.result.lock();
        loop {
            if let Some(result) = result.take() {
                return result;
            }
            self.completed.wait(&mut result);
        }
    }

    fn is_complete(&self) -> bool {
        self.result.lock().is_some()
    }
}

/// Handle for awaiting a submitted job.
pub struct JobHandle<T> {
    result: Arc<JobResult<T>>,
}

impl<T> JobHandle<T> {
    /// Whether the job has finished.
    pub fn is_complete(&self) -> bool {
        self.result.is_complete()
    }

    /// Block until the job finishes and take its value.
    pub fn join(self) -> Result<T, PoolError> {
        self.result.wait()
    }
}

impl<T> fmt::Debug for JobHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("complete", &self.is_complete())
            .finish()
    }
}

/// Fixed-size pool of worker threads.
pub struct WorkerPool {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<StdJoinHandle<()>>>,
    queued: Arc<AtomicUsize>,
    num_workers: usize,
}

impl WorkerPool {
    /// Start `num_workers` threads named `{prefix}-{n}`.
    pub fn new(num_workers: usize, prefix: &str) -> Result<Self, PoolError> {
        if num_workers == 0 {
            return Err(PoolError::SpawnFailed(
                "worker pool needs at least one worker".to_string(),
            ));
        }

        let (sender, receiver) = unbounded::<Job>();
        let queued = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::with_capacity(num_workers);
        for worker_id in 0..num_workers {
            let receiver = receiver.clone();
            let queued = Arc::clone(&queued);
            let worker = thread::Builder::new()
                .name(format!("{}-{}", prefix, worker_id))
                .spawn(move || worker_loop(receiver, queued, worker_id))
                .map_err(|e| PoolError::SpawnFailed(e.to_string()))?;
            workers.push(worker);
        }
        debug!(num_workers, prefix, "worker pool started");

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            queued,
            num_workers,
        })
    }

    /// Queue `f` on the pool.
    pub fn spawn<F, T>(&self, f: F) -> Result<JobHandle<T>, PoolError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let result = Arc::new(JobResult::new());
        let slot = Arc::clone(&result);

        let job: Job = Box::new(move || {
            let outcome = catch_unwind(AssertUnwindSafe(f))
                .map_err(|panic| PoolError::Panicked(panic_message(panic)));
            slot.complete(outcome);
        });

        let sender = self.sender.lock();
        let sender = sender.as_ref().ok_or(PoolError::Shutdown)?;
        self.queued.fetch_add(1, Ordering::AcqRel);
        if sender.send(job).is_err() {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            return Err(PoolError::Shutdown);
        }

        Ok(JobHandle { result })
    }

    /// Number of worker threads.
    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Jobs queued or running.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    /// Whether the pool has been shut down.
    pub fn is_shutdown(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Stop accepting jobs, finish the queued ones and join the workers.
    pub fn shutdown(&self) {
        // dropping the only sender ends every worker's receive loop
        self.sender.lock().take();

        let mut workers = self.workers.lock();
        for worker in workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("num_workers", &self.num_workers)
            .field("queued", &self.queued())
            .finish()
    }
}

fn worker_loop(receiver: Receiver<Job>, queued: Arc<AtomicUsize>, worker_id: usize) {
    trace!(worker_id, "worker started");
    for job in receiver.iter() {
        job();
        queued.fetch_sub(1, Ordering::AcqRel);
    }
    trace!(worker_id, "worker stopped");
}

pub(crate) fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| panic.downcast_ref::<&str>().map(|s| s.to_string()))
        .unwrap_or_else(|| "unknown panic".to_string())
}
