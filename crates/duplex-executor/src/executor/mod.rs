// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Executors for inbound server calls.
//!
//! Two implementations are provided:
//!
//! - [`ThreadPoolCallExecutor`]: runs calls on a bounded pool of worker
//!   threads, separate from the connection's I/O thread. Required whenever a
//!   service method may call back into the same connection it is serving,
//!   which would otherwise deadlock the I/O thread.
//! - [`SameThreadCallExecutor`]: runs calls inline on the submitting thread.
//!   Enough when methods never call back into their own connection.

mod same_thread;
mod thread_pool;

pub use same_thread::SameThreadCallExecutor;
pub use thread_pool::ThreadPoolCallExecutor;

use crate::call::{CallState, CorrelationId};
use crate::task::{TaskHandle, TaskState};

/// Server-side execution of decoded RPC calls.
///
/// Every submitted call ends in exactly one invocation of its
/// [`CallCompletion`](crate::CallCompletion), whatever happens to it.
pub trait RpcServerCallExecutor<Req, Resp>: Send + Sync {
    /// Register and schedule a call. Failures are reported through the
    /// call's completion, never returned here.
    fn execute(&self, call: CallState<Req, Resp>) -> TaskHandle;

    /// Request cancellation of a submitted call.
    ///
    /// Returns `false` if the call is no longer registered, which is the
    /// normal outcome when cancel races with completion.
    fn cancel(&self, handle: TaskHandle) -> bool;

    /// Request cancellation by correlation id.
    fn cancel_correlation(&self, correlation_id: CorrelationId) -> bool;

    /// State of a registered call, `None` once it has completed.
    fn task_state(&self, handle: TaskHandle) -> Option<TaskState>;

    /// Number of calls registered and not yet completed.
    fn in_flight(&self) -> usize;
}
