// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Thread pool call executor.
//!
//! Calls are scheduled on a [`WorkerPool`] with a bounded queue. A call that
//! can neither start nor queue is rejected on the spot with
//! [`CallError::Overload`](crate::CallError::Overload) rather than making the
//! connection layer wait. Cancellation flags the call's controller and, when a
//! worker is currently inside a blocking method for it, interrupts that worker.

use std::sync::Arc;
use std::thread;

use tracing::{debug, info, instrument};

use crate::call::{CallState, CorrelationId};
use crate::config::ExecutorConfig;
use crate::error::Result;
use crate::executor::RpcServerCallExecutor;
use crate::pool::WorkerPool;
use crate::registry::TaskRegistry;
use crate::task::{CallTask, TaskHandle, TaskState};

/// Runs server calls on a bounded pool of worker threads.
pub struct ThreadPoolCallExecutor<Req, Resp> {
    pool: WorkerPool,
    registry: Arc<TaskRegistry<Req, Resp>>,
    config: ExecutorConfig,
}

impl<Req, Resp> std::fmt::Debug for ThreadPoolCallExecutor<Req, Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPoolCallExecutor")
            .field("config", &self.config)
            .field("pool_size", &self.pool.pool_size())
            .finish_non_exhaustive()
    }
}

impl<Req, Resp> ThreadPoolCallExecutor<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    /// Create an executor. Workers are started lazily as calls arrive.
    pub fn new(config: ExecutorConfig) -> Result<Self> {
        config.validate()?;

        info!(
            core_pool_size = config.core_pool_size,
            max_pool_size = config.max_pool_size,
            queue = ?config.queue,
            keep_alive_ms = config.keep_alive.as_millis() as u64,
            "Call executor created"
        );

        Ok(Self {
            pool: WorkerPool::new(&config),
            registry: Arc::new(TaskRegistry::new()),
            config,
        })
    }

    /// Create an executor configured from `DUPLEX_EXECUTOR_*` environment
    /// variables.
    pub fn from_env() -> Result<Self> {
        Self::new(ExecutorConfig::from_env()?)
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Worker threads currently alive.
    pub fn pool_size(&self) -> usize {
        self.pool.pool_size()
    }

    /// Worker threads currently running a call.
    pub fn active_workers(&self) -> usize {
        self.pool.active_workers()
    }

    /// Calls waiting for a worker.
    pub fn queued(&self) -> usize {
        self.pool.queued()
    }

    pub fn is_shutdown(&self) -> bool {
        self.pool.is_shutdown()
    }

    /// Stop accepting calls, let queued ones run, and wait for the workers.
    ///
    /// Calls submitted afterwards complete immediately with no result and a
    /// [`CallError::Shutdown`](crate::CallError::Shutdown) failure.
    /// Non-blocking calls still waiting on their response sink are left to
    /// complete on their own.
    pub fn shutdown(&self) {
        info!(in_flight = self.registry.len(), "Call executor shutting down");
        self.pool.shutdown();
        info!(in_flight = self.registry.len(), "Call executor shutdown complete");
    }

    fn interrupt_and_cancel(&self, task: Option<Arc<CallTask<Req, Resp>>>) -> bool {
        self.registry.cancel_task(task, true)
    }
}

impl<Req, Resp> RpcServerCallExecutor<Req, Resp> for ThreadPoolCallExecutor<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    #[instrument(skip(self, call), fields(correlation_id = %call.correlation_id(), method = %call.descriptor()))]
    fn execute(&self, call: CallState<Req, Resp>) -> TaskHandle {
        let task = CallTask::register(&self.registry, call);
        let handle = task.handle();

        let job_task = Arc::clone(&task);
        let job = Box::new(move || {
            job_task.bind_worker(thread::current());
            job_task.run();
            job_task.unbind_worker();
        });

        if let Err(rejection) = self.pool.execute(job) {
            debug!(task = %handle, reason = %rejection, "Pool refused call");
            task.reject(rejection.into_call_error());
        }
        handle
    }

    fn cancel(&self, handle: TaskHandle) -> bool {
        self.interrupt_and_cancel(self.registry.get(handle))
    }

    fn cancel_correlation(&self, correlation_id: CorrelationId) -> bool {
        self.interrupt_and_cancel(self.registry.find(correlation_id))
    }

    fn task_state(&self, handle: TaskHandle) -> Option<TaskState> {
        self.registry.state(handle)
    }

    fn in_flight(&self) -> usize {
        self.registry.len()
    }
}

impl<Req, Resp> Drop for ThreadPoolCallExecutor<Req, Resp> {
    fn drop(&mut self) {
        // Idle workers exit once the queue is closed and drained.
        self.pool.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;

    #[test]
    fn test_new_rejects_invalid_config() {
        let result = ThreadPoolCallExecutor::<u32, u32>::new(ExecutorConfig::new(2, 1));
        let err = result.unwrap_err();
        assert!(err.to_string().contains("max_pool_size"));
    }

    #[test]
    fn test_new_starts_no_workers() {
        let executor = ThreadPoolCallExecutor::<u32, u32>::new(
            ExecutorConfig::new(2, 4).queue(QueueConfig::Bounded(8)),
        )
        .unwrap();
        assert_eq!(executor.pool_size(), 0);
        assert_eq!(executor.active_workers(), 0);
        assert_eq!(executor.queued(), 0);
        assert_eq!(executor.in_flight(), 0);
        assert!(!executor.is_shutdown());
        assert_eq!(executor.config().max_pool_size, 4);
        assert!(format!("{:?}", executor).contains("ThreadPoolCallExecutor"));
    }

    #[test]
    fn test_cancel_unknown_handle_is_not_an_error() {
        let executor =
            ThreadPoolCallExecutor::<u32, u32>::new(ExecutorConfig::new(1, 1)).unwrap();
        assert!(!executor.cancel(TaskHandle::new(42)));
        assert!(!executor.cancel_correlation(CorrelationId::new(42)));
        assert_eq!(executor.task_state(TaskHandle::new(42)), None);
    }
}
