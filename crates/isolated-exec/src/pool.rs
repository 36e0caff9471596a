//! Bounded worker pool
//!
//! A fixed number of worker threads pull units of work from a shared queue.
//! Bookkeeping (queue, pending count, shutdown flag) lives under a single
//! mutex; workers park on a condvar while the queue is empty and
//! `await_all` parks on a second condvar until the pending count drains.
//!
//! A unit that panics is caught and logged; the worker thread survives and
//! keeps serving the queue.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tracing::{debug, error};

/// A unit of work submitted to the pool
pub type Unit = Box<dyn FnOnce() + Send + 'static>;

/// Errors from pool operations
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker pool has been shut down")]
    ShutDown,

    #[error("worker count must be at least 1")]
    ZeroWorkers,

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Result type for pool operations
pub type PoolResult<T> = Result<T, PoolError>;

#[derive(Default)]
struct PoolState {
    queue: VecDeque<Unit>,
    /// Submitted units that have not yet finished (queued + running)
    pending: usize,
    shutdown: bool,
}

struct Shared {
    state: Mutex<PoolState>,
    work_available: Condvar,
    all_done: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // A panicking unit never holds this lock, so poisoning only
        // happens if bookkeeping itself panicked; the state is still usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Bounded-concurrency executor
///
/// At most `worker_count` submitted units run simultaneously. Execution order
/// among independently submitted units is unspecified.
pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    worker_count: usize,
}

impl WorkerPool {
    /// Default number of workers (serial execution)
    pub const DEFAULT_WORKER_COUNT: usize = 1;

    /// Create a pool with `worker_count` threads.
    pub fn new(worker_count: usize) -> PoolResult<Self> {
        if worker_count == 0 {
            return Err(PoolError::ZeroWorkers);
        }

        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState::default()),
            work_available: Condvar::new(),
            all_done: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("compile-worker-{}", index))
                .spawn(move || worker_loop(&shared))?;
            workers.push(handle);
        }

        debug!(worker_count, "worker pool started");

        Ok(Self {
            shared,
            workers,
            worker_count,
        })
    }

    /// Number of worker threads
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Enqueue a unit of work.
    ///
    /// Fails once the pool has been shut down.
    pub fn submit<F>(&self, unit: F) -> PoolResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.lock();
        if state.shutdown {
            return Err(PoolError::ShutDown);
        }
        state.queue.push_back(Box::new(unit));
        state.pending += 1;
        drop(state);

        self.shared.work_available.notify_one();
        Ok(())
    }

    /// Block until every submitted unit has finished.
    pub fn await_all(&self) {
        let mut state = self.shared.lock();
        while state.pending > 0 {
            state = self
                .shared
                .all_done
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Stop accepting work, let queued units drain, and join the workers.
    pub fn shutdown(&mut self) {
        {
            let mut state = self.shared.lock();
            if state.shutdown && self.workers.is_empty() {
                return;
            }
            state.shutdown = true;
        }
        self.shared.work_available.notify_all();

        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("worker thread exited abnormally");
            }
        }
        debug!("worker pool shut down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let unit = {
            let mut state = shared.lock();
            loop {
                if let Some(unit) = state.queue.pop_front() {
                    break unit;
                }
                if state.shutdown {
                    return;
                }
                state = shared
                    .work_available
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
        };

        if panic::catch_unwind(AssertUnwindSafe(unit)).is_err() {
            error!("unit of work panicked");
        }

        let mut state = shared.lock();
        state.pending -= 1;
        if state.pending == 0 {
            shared.all_done.notify_all();
        }
    }
}
