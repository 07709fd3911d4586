// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded worker pool with explicit admission control.
//!
//! Sizing follows the usual core/max scheme:
//!
//! 1. While fewer than `core` workers are alive, each submission starts a new
//!    worker that runs it directly.
//! 2. Otherwise, if no worker is alive at all (`core = 0`), one is started
//!    with the job while fewer than `max` are alive.
//! 3. Otherwise the job is offered to the queue without blocking.
//! 4. If the queue is full, a worker above the core size is started while
//!    fewer than `max` are alive.
//! 5. Otherwise the job is rejected and handed back to the caller's error
//!    path. Nothing ever waits for space.
//!
//! Workers above the core size exit after `keep_alive` without work.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, error, info, warn};

use crate::config::ExecutorConfig;
use crate::controller::lock;
use crate::error::CallError;

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// Why the pool refused a job.
#[derive(Debug)]
pub(crate) enum Rejection {
    /// Queue full and no worker can be added.
    Saturated,
    /// The pool no longer accepts work.
    Shutdown,
}

impl Rejection {
    pub(crate) fn into_call_error(self) -> CallError {
        match self {
            Rejection::Saturated => CallError::Overload,
            Rejection::Shutdown => CallError::Shutdown,
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::Saturated => f.write_str("pool saturated"),
            Rejection::Shutdown => f.write_str("pool shut down"),
        }
    }
}

struct PoolInner {
    core: usize,
    max: usize,
    keep_alive: Duration,
    thread_prefix: String,
    /// `None` once the pool stops accepting work.
    sender: Mutex<Option<Sender<Job>>>,
    receiver: Receiver<Job>,
    live: AtomicUsize,
    active: AtomicUsize,
    spawned: AtomicUsize,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

pub(crate) struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub(crate) fn new(config: &ExecutorConfig) -> Self {
        let (sender, receiver) = match config.queue.capacity() {
            Some(capacity) => crossbeam_channel::bounded(capacity),
            None => crossbeam_channel::unbounded(),
        };

        Self {
            inner: Arc::new(PoolInner {
                core: config.core_pool_size,
                max: config.max_pool_size,
                keep_alive: config.keep_alive,
                thread_prefix: config.thread_prefix.clone(),
                sender: Mutex::new(Some(sender)),
                receiver,
                live: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                spawned: AtomicUsize::new(0),
                handles: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Offer `job` to the pool. Never blocks.
    pub(crate) fn execute(&self, job: Job) -> Result<(), Rejection> {
        let Some(sender) = lock(&self.inner.sender).clone() else {
            return Err(Rejection::Shutdown);
        };

        if self.inner.try_reserve_worker(self.inner.core) {
            return self.start_worker(Some(job));
        }

        // A pool with no core workers may have none alive at all. Start one
        // with the job in hand, so a failed spawn rejects this job instead of
        // leaving it queued with nobody to run it.
        if self.inner.live.load(Ordering::SeqCst) == 0
            && self.inner.try_reserve_worker(self.inner.max)
        {
            return self.start_worker(Some(job));
        }

        match sender.try_send(job) {
            Ok(()) => {
                // The last worker may have retired between the check above
                // and the send.
                if self.inner.live.load(Ordering::SeqCst) == 0
                    && self.inner.try_reserve_worker(self.inner.max)
                    && self.start_worker(None).is_err()
                {
                    error!(
                        queued = self.queued(),
                        "No worker available for queued jobs until the next submission"
                    );
                }
                Ok(())
            }
            Err(TrySendError::Full(job)) => {
                if self.inner.try_reserve_worker(self.inner.max) {
                    self.start_worker(Some(job))
                } else {
                    Err(Rejection::Saturated)
                }
            }
            Err(TrySendError::Disconnected(_)) => Err(Rejection::Shutdown),
        }
    }

    /// Start a worker for an already reserved slot.
    fn start_worker(&self, first: Option<Job>) -> Result<(), Rejection> {
        let id = self.inner.spawned.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name(format!("{}-{}", self.inner.thread_prefix, id))
            .spawn(move || worker_loop(inner, first));

        match spawned {
            Ok(handle) => {
                let mut handles = lock(&self.inner.handles);
                handles.retain(|h| !h.is_finished());
                handles.push(handle);
                Ok(())
            }
            Err(e) => {
                self.inner.live.fetch_sub(1, Ordering::SeqCst);
                error!(error = %e, "Failed to spawn worker thread");
                Err(Rejection::Saturated)
            }
        }
    }

    /// Workers currently alive.
    pub(crate) fn pool_size(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// Workers currently running a job.
    pub(crate) fn active_workers(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Jobs waiting for a worker.
    pub(crate) fn queued(&self) -> usize {
        self.inner.receiver.len()
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        lock(&self.inner.sender).is_none()
    }

    /// Stop accepting work. Queued jobs still run.
    pub(crate) fn close(&self) {
        if lock(&self.inner.sender).take().is_some() {
            info!(
                queued = self.queued(),
                workers = self.pool_size(),
                "Worker pool closed to new work"
            );
        }
    }

    /// Stop accepting work and wait for every worker to drain the queue and exit.
    ///
    /// Workers are not joined when called from one of the pool's own threads.
    pub(crate) fn shutdown(&self) {
        self.close();
        let current = thread::current().id();
        let handles: Vec<_> = lock(&self.inner.handles).drain(..).collect();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!("Worker thread panicked during shutdown");
            }
        }
    }
}

impl PoolInner {
    /// Reserve a worker slot if fewer than `limit` workers are alive.
    fn try_reserve_worker(&self, limit: usize) -> bool {
        self.live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| {
                (live < limit).then_some(live + 1)
            })
            .is_ok()
    }

    /// Give up a worker slot if more than `core` workers are alive.
    fn try_retire_worker(&self) -> bool {
        self.live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| {
                (live > self.core).then(|| live - 1)
            })
            .is_ok()
    }

    fn run_job(&self, job: Job) {
        self.active.fetch_add(1, Ordering::SeqCst);
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!("Job panicked on worker thread");
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

fn worker_loop(inner: Arc<PoolInner>, first: Option<Job>) {
    debug!("Worker started");
    if let Some(job) = first {
        inner.run_job(job);
    }

    loop {
        let job = if inner.live.load(Ordering::SeqCst) > inner.core {
            match inner.receiver.recv_timeout(inner.keep_alive) {
                Ok(job) => job,
                Err(RecvTimeoutError::Timeout) => {
                    if !inner.try_retire_worker() {
                        continue;
                    }
                    // A job queued while we were retiring would otherwise wait
                    // for the next submission.
                    if !inner.receiver.is_empty() && inner.try_reserve_worker(inner.max) {
                        continue;
                    }
                    debug!("Idle worker retired");
                    return;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        } else {
            match inner.receiver.recv() {
                Ok(job) => job,
                Err(_) => break,
            }
        };
        inner.run_job(job);
    }

    inner.live.fetch_sub(1, Ordering::SeqCst);
    debug!("Worker stopped");
}
