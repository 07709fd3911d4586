// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-flight call registry.
//!
//! Tasks are keyed by a generated [`TaskHandle`] and indexed by correlation
//! id. Insertion happens at submit; removal happens only on the completion
//! path, so a task found here has not completed yet.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::call::CorrelationId;
use crate::controller::lock;
use crate::task::{CallTask, TaskHandle, TaskState};

struct Slots<Req, Resp> {
    tasks: HashMap<TaskHandle, Arc<CallTask<Req, Resp>>>,
    by_correlation: HashMap<CorrelationId, TaskHandle>,
}

pub(crate) struct TaskRegistry<Req, Resp> {
    next_handle: AtomicU64,
    slots: Mutex<Slots<Req, Resp>>,
}

impl<Req, Resp> TaskRegistry<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    pub(crate) fn new() -> Self {
        Self {
            next_handle: AtomicU64::new(1),
            slots: Mutex::new(Slots {
                tasks: HashMap::new(),
                by_correlation: HashMap::new(),
            }),
        }
    }

    pub(crate) fn next_handle(&self) -> TaskHandle {
        TaskHandle::new(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn insert(&self, task: Arc<CallTask<Req, Resp>>) {
        let handle = task.handle();
        let correlation_id = task.controller().correlation_id();
        let mut slots = lock(&self.slots);
        if let Some(previous) = slots.by_correlation.insert(correlation_id, handle) {
            warn!(
                %correlation_id,
                previous = %previous,
                "Correlation id reused while a call is still in flight"
            );
        }
        slots.tasks.insert(handle, task);
    }

    pub(crate) fn get(&self, handle: TaskHandle) -> Option<Arc<CallTask<Req, Resp>>> {
        lock(&self.slots).tasks.get(&handle).cloned()
    }

    pub(crate) fn find(&self, correlation_id: CorrelationId) -> Option<Arc<CallTask<Req, Resp>>> {
        let slots = lock(&self.slots);
        let handle = slots.by_correlation.get(&correlation_id)?;
        slots.tasks.get(handle).cloned()
    }

    pub(crate) fn remove(&self, handle: TaskHandle) -> Option<Arc<CallTask<Req, Resp>>> {
        let mut slots = lock(&self.slots);
        let task = slots.tasks.remove(&handle)?;
        let correlation_id = task.controller().correlation_id();
        if slots.by_correlation.get(&correlation_id) == Some(&handle) {
            slots.by_correlation.remove(&correlation_id);
        }
        Some(task)
    }

    pub(crate) fn state(&self, handle: TaskHandle) -> Option<TaskState> {
        self.get(handle).map(|task| task.state())
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.slots).tasks.len()
    }

    /// Signal cancellation to a registered task.
    ///
    /// The task stays registered: it leaves the registry through its own
    /// completion path, which still runs exactly once. With `interrupt` set,
    /// a worker bound to the task is interrupted too.
    pub(crate) fn cancel_task(&self, task: Option<Arc<CallTask<Req, Resp>>>, interrupt: bool) -> bool {
        let Some(task) = task else {
            debug!("Unable to find call to cancel - normal for a completed call");
            return false;
        };
        task.controller().request_cancel();
        if interrupt {
            task.interrupt_worker();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::{CallCompletion, CallState, MethodDescriptor, ServiceMethod};
    use crate::controller::CallController;

    fn register(
        registry: &Arc<TaskRegistry<u32, u32>>,
        id: u64,
    ) -> Arc<CallTask<u32, u32>> {
        let completion: Arc<dyn CallCompletion<u32>> = Arc::new(|_: CorrelationId, _: Option<u32>| {});
        let state = CallState::new(
            MethodDescriptor::new("Svc", "m"),
            ServiceMethod::blocking(|_: &CallController, req: u32| Ok(req)),
            0,
            Arc::new(CallController::new(CorrelationId::new(id))),
            completion,
        );
        CallTask::register(registry, state)
    }

    #[test]
    fn test_handles_are_unique() {
        let registry: TaskRegistry<u32, u32> = TaskRegistry::new();
        let a = registry.next_handle();
        let b = registry.next_handle();
        assert_ne!(a, b);
    }

    #[test]
    fn test_insert_find_remove() {
        let registry = Arc::new(TaskRegistry::new());
        let task = register(&registry, 10);
        let handle = task.handle();

        assert_eq!(registry.len(), 1);
        assert!(registry.get(handle).is_some());
        assert_eq!(
            registry.find(CorrelationId::new(10)).map(|t| t.handle()),
            Some(handle)
        );
        assert_eq!(registry.state(handle), Some(TaskState::Created));

        assert!(registry.remove(handle).is_some());
        assert!(registry.remove(handle).is_none());
        assert!(registry.find(CorrelationId::new(10)).is_none());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_cancel_task_keeps_registration() {
        let registry = Arc::new(TaskRegistry::new());
        let task = register(&registry, 11);

        assert!(registry.cancel_task(registry.get(task.handle()), true));
        assert!(task.controller().is_canceled());
        // Not bound to a worker, so nothing to interrupt.
        assert!(!task.controller().is_interrupted());
        assert_eq!(registry.len(), 1);

        assert!(!registry.cancel_task(registry.get(TaskHandle::new(999)), true));
    }

    #[test]
    fn test_removing_stale_handle_keeps_newer_correlation_index() {
        let registry = Arc::new(TaskRegistry::new());
        let first = register(&registry, 12);
        let second = register(&registry, 12);

        registry.remove(first.handle());
        assert_eq!(
            registry.find(CorrelationId::new(12)).map(|t| t.handle()),
            Some(second.handle())
        );
    }
}
