// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Inline call executor.

use std::sync::Arc;

use crate::call::{CallState, CorrelationId};
use crate::executor::RpcServerCallExecutor;
use crate::registry::TaskRegistry;
use crate::task::{CallTask, TaskHandle, TaskState};

/// Runs each call on the thread that submits it.
///
/// Blocking methods finish before [`execute`](RpcServerCallExecutor::execute)
/// returns, so cancellation only ever reaches non-blocking calls still waiting
/// on their response sink. The submitting thread is never interrupted.
pub struct SameThreadCallExecutor<Req, Resp> {
    registry: Arc<TaskRegistry<Req, Resp>>,
}

impl<Req, Resp> SameThreadCallExecutor<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    pub fn new() -> Self {
        Self {
            registry: Arc::new(TaskRegistry::new()),
        }
    }
}

impl<Req, Resp> Default for SameThreadCallExecutor<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<Req, Resp> RpcServerCallExecutor<Req, Resp> for SameThreadCallExecutor<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn execute(&self, call: CallState<Req, Resp>) -> TaskHandle {
        let task = CallTask::register(&self.registry, call);
        task.run();
        task.handle()
    }

    fn cancel(&self, handle: TaskHandle) -> bool {
        self.registry.cancel_task(self.registry.get(handle), false)
    }

    fn cancel_correlation(&self, correlation_id: CorrelationId) -> bool {
        self.registry
            .cancel_task(self.registry.find(correlation_id), false)
    }

    fn task_state(&self, handle: TaskHandle) -> Option<TaskState> {
        self.registry.state(handle)
    }

    fn in_flight(&self) -> usize {
        self.registry.len()
    }
}
