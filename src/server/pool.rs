//! Fixed-size worker pool fed by a bounded FIFO queue.
//!
//! Items are moved into the queue, so an item is owned by exactly one place
//! at a time: the submitter, the queue, or the worker running it.

use std::collections::VecDeque;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker count and queue capacity must both be positive")]
    InvalidConfig,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    QueueFull,
    ShutDown,
}

/// A submission the pool refused; the item is handed back to the caller.
#[derive(Debug)]
pub struct Rejected<T> {
    pub item: T,
    pub reason: RejectReason,
}

struct Queue<T> {
    items: VecDeque<T>,
    shutdown: bool,
}

struct Shared<T> {
    queue: Mutex<Queue<T>>,
    available: Condvar,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Queue<T>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct WorkerPool<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    workers: Vec<JoinHandle<()>>,
    capacity: usize,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Spawns `threads` workers that each run `handler` on dequeued items.
    pub fn new<F>(threads: usize, capacity: usize, handler: F) -> Result<Self, PoolError>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        if threads == 0 || capacity == 0 {
            return Err(PoolError::InvalidConfig);
        }

        let mut pool = Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(Queue {
                    items: VecDeque::with_capacity(capacity),
                    shutdown: false,
                }),
                available: Condvar::new(),
            }),
            workers: Vec::with_capacity(threads),
            capacity,
        };

        let handler = Arc::new(handler);
        for id in 0..threads {
            let shared = Arc::clone(&pool.shared);
            let handler = Arc::clone(&handler);
            // On error the partially built pool is dropped, which joins the
            // workers already started.
            let handle = thread::Builder::new()
                .name(format!("lantern-worker-{id}"))
                .spawn(move || worker_loop(id, &shared, &*handler))?;
            pool.workers.push(handle);
        }

        tracing::info!(threads, capacity, "worker pool started");
        Ok(pool)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    /// Items waiting for a worker.
    pub fn queued(&self) -> usize {
        self.shared.lock().items.len()
    }

    /// Enqueues `item` and wakes one worker. Never blocks on a full queue:
    /// the item is returned instead.
    pub fn submit(&self, item: T) -> Result<(), Rejected<T>> {
        let mut queue = self.shared.lock();
        if queue.shutdown {
            return Err(Rejected {
                item,
                reason: RejectReason::ShutDown,
            });
        }
        if queue.items.len() >= self.capacity {
            return Err(Rejected {
                item,
                reason: RejectReason::QueueFull,
            });
        }
        queue.items.push_back(item);
        drop(queue);

        self.shared.available.notify_one();
        Ok(())
    }

    /// Stops accepting work, lets the workers finish everything already
    /// queued, and joins them. Safe to call more than once.
    pub fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }

        self.shared.lock().shutdown = true;
        self.shared.available.notify_all();

        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!("worker thread panicked outside a job");
            }
        }
        tracing::info!("worker pool stopped");
    }
}

impl<T: Send + 'static> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop<T, F: Fn(T)>(id: usize, shared: &Shared<T>, handler: &F) {
    loop {
        let item = {
            let mut queue = shared.lock();
            loop {
                if let Some(item) = queue.items.pop_front() {
                    break item;
                }
                if queue.shutdown {
                    tracing::debug!(worker = id, "worker exiting");
                    return;
                }
                // Spurious wakeups land back on the emptiness check.
                queue = shared
                    .available
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        if panic::catch_unwind(AssertUnwindSafe(|| handler(item))).is_err() {
            tracing::error!(worker = id, "job panicked");
        }
    }
}
