//! Keyed worker pool.
//!
//! A [`WorkerPool`] owns a fixed number of workers, each draining a private
//! bounded queue on its own task. Work is submitted with an affinity key and
//! always lands on worker `key % size`, so items sharing a key run one at a
//! time in submission order while different keys proceed in parallel.

use std::{
    num::NonZeroUsize,
    sync::{Mutex, PoisonError},
    thread,
};

use futures::future::BoxFuture;
use log::{debug, error};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;

use crate::{panic::catch_panic, registry::ConnectionId};

/// Unit of work executed by a [`WorkerPool`].
pub type Task = BoxFuture<'static, ()>;

/// Default capacity of each worker's queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Errors returned by [`WorkerPool::put`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    /// The pool has been shut down and accepts no more work.
    #[error("worker pool is closed")]
    Closed,
}

/// Fixed-size pool of sequential workers keyed by [`ConnectionId`].
///
/// # Examples
///
/// ```
/// use futures::FutureExt;
/// use wirelink::{registry::ConnectionId, worker::WorkerPool};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let pool = WorkerPool::new(2);
/// pool.put(ConnectionId::new(7), async {}.boxed())
///     .await
///     .expect("pool open");
/// pool.shutdown().await;
/// assert!(pool.put(ConnectionId::new(7), async {}.boxed()).await.is_err());
/// # }
/// ```
pub struct WorkerPool {
    senders: Mutex<Vec<mpsc::Sender<Task>>>,
    size: usize,
    tracker: TaskTracker,
}

impl WorkerPool {
    /// Create a pool of `size` workers (at least one).
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn new(size: usize) -> Self { Self::with_queue_capacity(size, DEFAULT_QUEUE_CAPACITY) }

    /// Create a pool with an explicit per-worker queue capacity.
    ///
    /// Both values are clamped to at least one.
    #[must_use]
    pub fn with_queue_capacity(size: usize, capacity: usize) -> Self {
        let size = size.max(1);
        let tracker = TaskTracker::new();
        let senders = (0..size)
            .map(|index| {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                tracker.spawn(run_worker(index, rx));
                tx
            })
            .collect();
        Self {
            senders: Mutex::new(senders),
            size,
            tracker,
        }
    }

    /// Number of workers.
    #[must_use]
    pub fn size(&self) -> usize { self.size }

    /// Submit `task` to the worker owning `key`.
    ///
    /// Waits for queue capacity on that worker.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Closed`] once [`WorkerPool::shutdown`] has begun.
    pub async fn put(&self, key: ConnectionId, task: Task) -> Result<(), PoolError> {
        let sender = {
            let senders = self.senders.lock().unwrap_or_else(PoisonError::into_inner);
            let index = usize::try_from(key.as_u64() % self.size as u64).unwrap_or_default();
            senders.get(index).cloned()
        };
        let sender = sender.ok_or(PoolError::Closed)?;
        sender.send(task).await.map_err(|_| PoolError::Closed)
    }

    /// Stop accepting work and wait for queued tasks to finish.
    pub async fn shutdown(&self) {
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

impl Default for WorkerPool {
    /// One worker per available CPU.
    fn default() -> Self { Self::new(default_size()) }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Default pool size: the available parallelism, or one if unknown.
#[must_use]
pub fn default_size() -> usize { thread::available_parallelism().map_or(1, NonZeroUsize::get) }

async fn run_worker(index: usize, mut rx: mpsc::Receiver<Task>) {
    while let Some(task) = rx.recv().await {
        if let Err(panic) = catch_panic(task).await {
            crate::metrics::inc_connection_panics();
            // Emit via both `log` and `tracing` for tests that capture either.
            error!("worker task panicked: worker={index}, panic={panic}");
            tracing::error!(worker = index, panic = %panic, "worker task panicked");
        }
    }
    debug!("worker exiting: worker={index}");
}
