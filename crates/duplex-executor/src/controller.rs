// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-call cancellation and failure state.
//!
//! A [`CallController`] is shared between the connection layer, which may
//! request cancellation at any time, and the task running the call, which
//! observes cancellation and records failures. Every flag here may be touched
//! from several threads at once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::call::CorrelationId;
use crate::error::CallError;

type CancelNotify = Box<dyn FnOnce() + Send + 'static>;

/// Shared cancellation/failure status of one call.
pub struct CallController {
    correlation_id: CorrelationId,
    canceled: AtomicBool,
    failure: Mutex<Option<CallError>>,
    cancel_notify: Mutex<Option<CancelNotify>>,
    cancel_notified: AtomicBool,
    /// Set by the completion path, before it looks at the cancel-notify sink,
    /// when the call completed as canceled.
    completed_canceled: AtomicBool,
    interrupt: CancellationToken,
}

impl std::fmt::Debug for CallController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallController")
            .field("correlation_id", &self.correlation_id)
            .field("canceled", &self.is_canceled())
            .field("failure", &self.failure())
            .field("cancel_notified", &self.cancel_notified.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl CallController {
    /// Fresh controller for the call identified by `correlation_id`.
    pub fn new(correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id,
            canceled: AtomicBool::new(false),
            failure: Mutex::new(None),
            cancel_notify: Mutex::new(None),
            cancel_notified: AtomicBool::new(false),
            completed_canceled: AtomicBool::new(false),
            interrupt: CancellationToken::new(),
        }
    }

    /// Correlation id of the call this controller belongs to.
    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// Ask for the call to be canceled. Idempotent.
    pub fn request_cancel(&self) {
        if !self.canceled.swap(true, Ordering::SeqCst) {
            debug!(correlation_id = %self.correlation_id, "Cancel requested");
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    /// Record a terminal failure with a free-form description.
    pub fn fail(&self, message: impl Into<String>) {
        self.set_failure(CallError::Method {
            message: message.into(),
        });
    }

    /// Record a terminal failure. The last recorded failure wins.
    pub fn set_failure(&self, error: CallError) {
        *lock(&self.failure) = Some(error);
    }

    pub fn failed(&self) -> bool {
        lock(&self.failure).is_some()
    }

    /// The recorded failure, if any.
    pub fn failure(&self) -> Option<CallError> {
        lock(&self.failure).clone()
    }

    /// Description of the recorded failure, if any.
    pub fn error_text(&self) -> Option<String> {
        lock(&self.failure).as_ref().map(ToString::to_string)
    }

    /// Token cancelled when the executor interrupts the worker running this
    /// call. Blocking methods should check it (or wait on it) at I/O
    /// boundaries.
    pub fn interrupt_token(&self) -> CancellationToken {
        self.interrupt.clone()
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_cancelled()
    }

    pub(crate) fn interrupt(&self) {
        self.interrupt.cancel();
    }

    /// Register a callback fired once a canceled call has stopped running.
    ///
    /// If the call has already completed as canceled, the callback fires
    /// immediately on the calling thread. It never fires more than once.
    pub fn set_cancel_notify<F>(&self, notify: F)
    where
        F: FnOnce() + Send + 'static,
    {
        *lock(&self.cancel_notify) = Some(Box::new(notify));
        if self.completed_canceled.load(Ordering::SeqCst) {
            self.notify_cancel();
        }
    }

    /// Mark the cancel notification as fired, returning the previous value.
    ///
    /// Only the caller that observes `false` may fire the notify sink.
    pub fn get_and_set_cancel_notified(&self) -> bool {
        self.cancel_notified.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn mark_completed_canceled(&self) {
        self.completed_canceled.store(true, Ordering::SeqCst);
    }

    /// Fire the cancel-notify sink if one is registered and it has not fired.
    ///
    /// Returns `true` if this call fired it.
    pub(crate) fn notify_cancel(&self) -> bool {
        let notify = {
            let mut slot = lock(&self.cancel_notify);
            // The one-shot flag is only consumed once a sink exists, so a sink
            // registered after completion can still fire.
            if slot.is_none() || self.get_and_set_cancel_notified() {
                return false;
            }
            slot.take()
        };
        let Some(notify) = notify else {
            return false;
        };
        debug!(correlation_id = %self.correlation_id, "Firing cancel notification");
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(notify)).is_err() {
            warn!(correlation_id = %self.correlation_id, "Cancel notify callback panicked");
        }
        true
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
