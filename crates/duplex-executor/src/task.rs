// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Schedulable wrapper around one [`CallState`].
//!
//! A task moves `Created -> Running -> Completed`, or ends in `Rejected`
//! when the pool refuses it. Whatever
//! happens on the way (normal result, method error, panic, cancellation,
//! queue timeout, overload rejection, abandoned response sink) ends in
//! [`CallTask::finish`], which runs its body exactly once.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::Thread;
use std::time::Instant;

use tracing::{debug, warn};

use crate::call::{
    CallCompletion, CallState, MethodDescriptor, Outcome, ResponseSink, ResponseTarget,
    ServiceMethod,
};
use crate::controller::{CallController, lock};
use crate::error::CallError;
use crate::registry::TaskRegistry;

/// Identity of a submitted call inside one executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskHandle(u64);

impl TaskHandle {
    pub(crate) const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Lifecycle of a [`CallTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    Created = 0,
    Running = 1,
    /// Refused by the pool and completed without running. Final.
    Rejected = 2,
    Completed = 3,
}

impl TaskState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Running,
            2 => Self::Rejected,
            _ => Self::Completed,
        }
    }
}

// Hand-off protocol between a non-blocking method call and its response sink.
const HANDOFF_IDLE: u8 = 0;
const HANDOFF_DISPATCHING: u8 = 1;
const HANDOFF_DROPPED: u8 = 2;
const HANDOFF_RETURNED: u8 = 3;

pub(crate) struct CallTask<Req, Resp> {
    handle: TaskHandle,
    descriptor: MethodDescriptor,
    method: ServiceMethod<Req, Resp>,
    request: Mutex<Option<Req>>,
    controller: Arc<CallController>,
    completion: Arc<dyn CallCompletion<Resp>>,
    deadline: Option<Instant>,
    registry: Arc<TaskRegistry<Req, Resp>>,
    /// Worker currently running the method, used only to interrupt it.
    worker: Mutex<Option<Thread>>,
    state: AtomicU8,
    completed: AtomicBool,
    handoff: AtomicU8,
}

impl<Req, Resp> CallTask<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    /// Wrap `call` in a task and insert it into `registry`.
    pub(crate) fn register(
        registry: &Arc<TaskRegistry<Req, Resp>>,
        call: CallState<Req, Resp>,
    ) -> Arc<Self> {
        let CallState {
            descriptor,
            method,
            request,
            controller,
            completion,
            deadline,
        } = call;

        let task = Arc::new(Self {
            handle: registry.next_handle(),
            descriptor,
            method,
            request: Mutex::new(Some(request)),
            controller,
            completion,
            deadline,
            registry: Arc::clone(registry),
            worker: Mutex::new(None),
            state: AtomicU8::new(TaskState::Created as u8),
            completed: AtomicBool::new(false),
            handoff: AtomicU8::new(HANDOFF_IDLE),
        });
        registry.insert(Arc::clone(&task));
        debug!(
            task = %task.handle,
            correlation_id = %task.controller.correlation_id(),
            method = %task.descriptor,
            "Call registered"
        );
        task
    }

    pub(crate) fn handle(&self) -> TaskHandle {
        self.handle
    }

    pub(crate) fn controller(&self) -> &Arc<CallController> {
        &self.controller
    }

    pub(crate) fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Bind the worker thread about to run this task.
    pub(crate) fn bind_worker(&self, thread: Thread) {
        if !self.completed.load(Ordering::SeqCst) {
            *lock(&self.worker) = Some(thread);
        }
    }

    pub(crate) fn unbind_worker(&self) {
        lock(&self.worker).take();
    }

    /// Interrupt the bound worker, if any. Returns whether one was bound.
    pub(crate) fn interrupt_worker(&self) -> bool {
        let worker = lock(&self.worker);
        match worker.as_ref() {
            Some(thread) => {
                debug!(
                    task = %self.handle,
                    worker = thread.name().unwrap_or("unnamed"),
                    "Interrupting worker"
                );
                self.controller.interrupt();
                thread.unpark();
                true
            }
            None => false,
        }
    }

    fn deadline_exceeded(&self) -> bool {
        self.deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Run the call on the current thread.
    pub(crate) fn run(self: &Arc<Self>) {
        self.set_state(TaskState::Running);
        let correlation_id = self.controller.correlation_id();

        if self.controller.is_canceled() {
            debug!(%correlation_id, "Call canceled before start");
            self.finish(Outcome::Empty);
            return;
        }

        // Queueing may already have used up the caller's whole timeout.
        if self.deadline_exceeded() {
            debug!(%correlation_id, method = %self.descriptor, "Call timed out while queued");
            self.controller.request_cancel();
            self.finish(Outcome::Empty);
            return;
        }

        let Some(request) = lock(&self.request).take() else {
            warn!(%correlation_id, "Call run twice, ignoring");
            return;
        };

        match &self.method {
            ServiceMethod::Blocking(method) => {
                let result =
                    catch_unwind(AssertUnwindSafe(|| method.call(&self.controller, request)));
                let outcome = match result {
                    Ok(Ok(response)) => Outcome::Response(response),
                    Ok(Err(err)) => self.method_failed(&err),
                    Err(payload) => self.method_panicked(payload.as_ref()),
                };
                self.finish(outcome);
            }
            ServiceMethod::NonBlocking(method) => {
                // The result will come from whichever thread holds the sink,
                // so interrupting this worker would achieve nothing.
                self.unbind_worker();
                self.handoff.store(HANDOFF_DISPATCHING, Ordering::SeqCst);
                let sink = ResponseSink::new(Arc::clone(self) as Arc<dyn ResponseTarget<Resp>>);
                let result = catch_unwind(AssertUnwindSafe(|| {
                    method.call(Arc::clone(&self.controller), request, sink)
                }));
                let dropped =
                    self.handoff.swap(HANDOFF_RETURNED, Ordering::SeqCst) == HANDOFF_DROPPED;
                match result {
                    Ok(Ok(())) if dropped => self.finish(Outcome::Failed(CallError::Abandoned)),
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        let outcome = self.method_failed(&err);
                        self.finish(outcome);
                    }
                    Err(payload) => {
                        let outcome = self.method_panicked(payload.as_ref());
                        self.finish(outcome);
                    }
                }
            }
        }
    }

    fn method_failed(&self, err: &anyhow::Error) -> Outcome<Resp> {
        warn!(
            correlation_id = %self.controller.correlation_id(),
            method = %self.descriptor,
            error = %err,
            "Service method failed"
        );
        Outcome::Failed(CallError::from_method_error(err))
    }

    fn method_panicked(&self, payload: &(dyn std::any::Any + Send)) -> Outcome<Resp> {
        let error = CallError::from_panic(payload);
        warn!(
            correlation_id = %self.controller.correlation_id(),
            method = %self.descriptor,
            error = %error,
            "Service method panicked"
        );
        Outcome::Failed(error)
    }

    /// Complete a task that never got a worker.
    pub(crate) fn reject(&self, error: CallError) {
        warn!(
            correlation_id = %self.controller.correlation_id(),
            method = %self.descriptor,
            reason = %error,
            "Call rejected"
        );
        self.set_state(TaskState::Rejected);
        self.finish(Outcome::Failed(error));
    }

    /// The completion path. Only the first call has any effect.
    pub(crate) fn finish(&self, outcome: Outcome<Resp>) {
        if self.completed.swap(true, Ordering::SeqCst) {
            debug!(task = %self.handle, "Call already completed, dropping late result");
            return;
        }

        self.registry.remove(self.handle);
        self.unbind_worker();
        lock(&self.request).take();

        let correlation_id = self.controller.correlation_id();
        let response = match outcome {
            Outcome::Response(response) => Some(response),
            Outcome::Empty => None,
            Outcome::Failed(error) => {
                debug!(%correlation_id, code = error.error_code(), "Recording call failure");
                self.controller.set_failure(error);
                None
            }
        };

        // A rejected task never ran, and keeps that as its final state.
        if self.state() != TaskState::Rejected {
            self.set_state(TaskState::Completed);
        }

        // Read once: a cancel arriving after this point does not turn a
        // delivered response into a cancellation.
        if self.controller.is_canceled() {
            self.controller.mark_completed_canceled();
            // The caller no longer wants the result, only the acknowledgement.
            self.deliver(None);
            self.controller.notify_cancel();
        } else if self.controller.failed() {
            self.deliver(None);
        } else {
            debug!(%correlation_id, has_response = response.is_some(), "Call completed");
            self.deliver(response);
        }
    }

    fn deliver(&self, response: Option<Resp>) {
        let correlation_id = self.controller.correlation_id();
        let completion = &self.completion;
        if catch_unwind(AssertUnwindSafe(|| completion.on_finish(correlation_id, response)))
            .is_err()
        {
            warn!(%correlation_id, "Completion callback panicked");
        }
    }
}

impl<Req, Resp> ResponseTarget<Resp> for CallTask<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn respond(&self, outcome: Outcome<Resp>) {
        self.finish(outcome);
    }

    fn abandon(&self) {
        // While the method is still on the stack its return value decides the
        // outcome; see the end of `run`.
        if self
            .handoff
            .compare_exchange(
                HANDOFF_DISPATCHING,
                HANDOFF_DROPPED,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            warn!(
                correlation_id = %self.controller.correlation_id(),
                method = %self.descriptor,
                "Response sink dropped without a response"
            );
            self.finish(Outcome::Failed(CallError::Abandoned));
        }
    }
}
