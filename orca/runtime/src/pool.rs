use std::fmt;

use parking_lot::Mutex;
use tokio::runtime::{Builder, Runtime};

/// Bounded pool running blocking module invocations off the driver thread.
///
/// Submission never waits for earlier jobs. Completion order is unspecified.
pub struct WorkerPool {
    workers: usize,
    runtime: Mutex<Option<Runtime>>,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers)
            .field("accepting", &self.is_accepting())
            .finish()
    }
}

impl WorkerPool {
    /// Starts a pool with `workers` blocking slots. `workers` must be positive.
    pub fn new(workers: usize) -> std::io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(workers.max(1))
            .thread_name("orca-worker")
            .build()?;
        Ok(Self {
            workers,
            runtime: Mutex::new(Some(runtime)),
        })
    }

    /// Configured slot count.
    #[must_use]
    pub const fn workers(&self) -> usize {
        self.workers
    }

    /// Whether new jobs are still accepted.
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.runtime.lock().is_some()
    }

    /// Queues `job`; returns `false` once the pool has been shut down.
    pub fn submit<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        match self.runtime.lock().as_ref() {
            Some(runtime) => {
                drop(runtime.spawn_blocking(job));
                true
            }
            None => false,
        }
    }

    /// Stops accepting work without waiting for in-flight jobs. Idempotent.
    pub fn shutdown(&self) {
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
