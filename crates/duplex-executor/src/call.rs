// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pending server calls and the callbacks around them.
//!
//! The connection layer decodes a request, pairs it with the service method it
//! targets and a fresh [`CallController`], and hands the resulting
//! [`CallState`] to an executor. Results flow back through a
//! [`CallCompletion`], invoked exactly once per call.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::controller::CallController;
use crate::error::CallError;

/// Identifier chosen by the connection layer, unique among in-flight calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(u64);

impl CorrelationId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for CorrelationId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fully qualified name of the method a call targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodDescriptor {
    service: String,
    method: String,
}

impl MethodDescriptor {
    pub fn new(service: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn method(&self) -> &str {
        &self.method
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.service, self.method)
    }
}

/// A method that produces its response on the worker thread.
///
/// It may block, including on outbound calls over the same connection. It
/// should watch [`CallController::is_canceled`] and
/// [`CallController::interrupt_token`] while doing so.
pub trait BlockingMethod<Req, Resp>: Send + Sync {
    fn call(&self, controller: &CallController, request: Req) -> anyhow::Result<Resp>;
}

/// A method that returns immediately and answers later through a
/// [`ResponseSink`], from any thread.
///
/// Returning `Err` fails the call unless the sink was already used.
pub trait NonBlockingMethod<Req, Resp>: Send + Sync {
    fn call(
        &self,
        controller: Arc<CallController>,
        request: Req,
        done: ResponseSink<Resp>,
    ) -> anyhow::Result<()>;
}

struct BlockingFn<F>(F);

impl<Req, Resp, F> BlockingMethod<Req, Resp> for BlockingFn<F>
where
    F: Fn(&CallController, Req) -> anyhow::Result<Resp> + Send + Sync,
{
    fn call(&self, controller: &CallController, request: Req) -> anyhow::Result<Resp> {
        (self.0)(controller, request)
    }
}

struct NonBlockingFn<F>(F);

impl<Req, Resp, F> NonBlockingMethod<Req, Resp> for NonBlockingFn<F>
where
    F: Fn(Arc<CallController>, Req, ResponseSink<Resp>) -> anyhow::Result<()> + Send + Sync,
{
    fn call(
        &self,
        controller: Arc<CallController>,
        request: Req,
        done: ResponseSink<Resp>,
    ) -> anyhow::Result<()> {
        (self.0)(controller, request, done)
    }
}

/// Service method implementation, dispatched once per call.
pub enum ServiceMethod<Req, Resp> {
    Blocking(Arc<dyn BlockingMethod<Req, Resp>>),
    NonBlocking(Arc<dyn NonBlockingMethod<Req, Resp>>),
}

impl<Req, Resp> Clone for ServiceMethod<Req, Resp> {
    fn clone(&self) -> Self {
        match self {
            Self::Blocking(m) => Self::Blocking(Arc::clone(m)),
            Self::NonBlocking(m) => Self::NonBlocking(Arc::clone(m)),
        }
    }
}

impl<Req, Resp> fmt::Debug for ServiceMethod<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blocking(_) => f.write_str("Blocking"),
            Self::NonBlocking(_) => f.write_str("NonBlocking"),
        }
    }
}

impl<Req: 'static, Resp: 'static> ServiceMethod<Req, Resp> {
    /// Wrap a closure as a blocking method.
    pub fn blocking<F>(f: F) -> Self
    where
        F: Fn(&CallController, Req) -> anyhow::Result<Resp> + Send + Sync + 'static,
    {
        Self::Blocking(Arc::new(BlockingFn(f)))
    }

    /// Wrap a closure as a non-blocking method.
    pub fn non_blocking<F>(f: F) -> Self
    where
        F: Fn(Arc<CallController>, Req, ResponseSink<Resp>) -> anyhow::Result<()>
            + Send
            + Sync
            + 'static,
    {
        Self::NonBlocking(Arc::new(NonBlockingFn(f)))
    }

    pub fn is_blocking(&self) -> bool {
        matches!(self, Self::Blocking(_))
    }
}

/// Receives the final result of every call, exactly once per call.
///
/// `response` is `None` when the call was canceled, timed out in the queue,
/// rejected, or failed; the controller tells which.
pub trait CallCompletion<Resp>: Send + Sync {
    fn on_finish(&self, correlation_id: CorrelationId, response: Option<Resp>);
}

impl<Resp, F> CallCompletion<Resp> for F
where
    F: Fn(CorrelationId, Option<Resp>) + Send + Sync,
{
    fn on_finish(&self, correlation_id: CorrelationId, response: Option<Resp>) {
        self(correlation_id, response)
    }
}

/// Completion that forwards results into a tokio channel, for connection
/// writers running as async tasks.
pub struct ChannelCompletion<Resp> {
    tx: mpsc::UnboundedSender<(CorrelationId, Option<Resp>)>,
}

impl<Resp: Send> CallCompletion<Resp> for ChannelCompletion<Resp> {
    fn on_finish(&self, correlation_id: CorrelationId, response: Option<Resp>) {
        if self.tx.send((correlation_id, response)).is_err() {
            tracing::debug!(%correlation_id, "Completion receiver dropped, discarding result");
        }
    }
}

/// Create a [`ChannelCompletion`] and the receiver its results arrive on.
pub fn completion_channel<Resp>() -> (
    Arc<ChannelCompletion<Resp>>,
    mpsc::UnboundedReceiver<(CorrelationId, Option<Resp>)>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(ChannelCompletion { tx }), rx)
}

/// How a call ended, as seen by the task.
pub(crate) enum Outcome<Resp> {
    Response(Resp),
    Empty,
    Failed(CallError),
}

/// Receiving side of a [`ResponseSink`].
pub(crate) trait ResponseTarget<Resp>: Send + Sync {
    fn respond(&self, outcome: Outcome<Resp>);
    /// The sink was dropped without a response.
    fn abandon(&self);
}

/// One-shot handle through which a non-blocking method delivers its result.
///
/// Consumed by [`done`](Self::done), [`finish`](Self::finish) or
/// [`fail`](Self::fail). Dropping it unused completes the call with no result
/// and a [`CallError::Abandoned`] failure.
pub struct ResponseSink<Resp> {
    target: Option<Arc<dyn ResponseTarget<Resp>>>,
}

impl<Resp> ResponseSink<Resp> {
    pub(crate) fn new(target: Arc<dyn ResponseTarget<Resp>>) -> Self {
        Self {
            target: Some(target),
        }
    }

    /// Deliver a response.
    pub fn done(self, response: Resp) {
        self.deliver(Outcome::Response(response));
    }

    /// Deliver a response, or the absence of one.
    pub fn finish(self, response: Option<Resp>) {
        self.deliver(match response {
            Some(response) => Outcome::Response(response),
            None => Outcome::Empty,
        });
    }

    /// Fail the call.
    pub fn fail(self, error: anyhow::Error) {
        self.deliver(Outcome::Failed(CallError::from_method_error(&error)));
    }

    fn deliver(mut self, outcome: Outcome<Resp>) {
        if let Some(target) = self.target.take() {
            target.respond(outcome);
        }
    }
}

impl<Resp> Drop for ResponseSink<Resp> {
    fn drop(&mut self) {
        if let Some(target) = self.target.take() {
            target.abandon();
        }
    }
}

impl<Resp> fmt::Debug for ResponseSink<Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseSink")
            .field("pending", &self.target.is_some())
            .finish()
    }
}

/// One pending inbound call.
pub struct CallState<Req, Resp> {
    pub(crate) descriptor: MethodDescriptor,
    pub(crate) method: ServiceMethod<Req, Resp>,
    pub(crate) request: Req,
    pub(crate) controller: Arc<CallController>,
    pub(crate) completion: Arc<dyn CallCompletion<Resp>>,
    pub(crate) deadline: Option<Instant>,
}

impl<Req, Resp> CallState<Req, Resp> {
    pub fn new(
        descriptor: MethodDescriptor,
        method: ServiceMethod<Req, Resp>,
        request: Req,
        controller: Arc<CallController>,
        completion: Arc<dyn CallCompletion<Resp>>,
    ) -> Self {
        Self {
            descriptor,
            method,
            request,
            controller,
            completion,
            deadline: None,
        }
    }

    /// Skip the method if it has not started by `deadline`.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Skip the method if it has not started within `timeout` from now.
    ///
    /// A timeout too large to represent as an instant leaves the call
    /// without a deadline.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.with_deadline(deadline),
            None => self,
        }
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.controller.correlation_id()
    }

    pub fn descriptor(&self) -> &MethodDescriptor {
        &self.descriptor
    }

    pub fn controller(&self) -> &Arc<CallController> {
        &self.controller
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

impl<Req, Resp> fmt::Debug for CallState<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallState")
            .field("correlation_id", &self.correlation_id())
            .field("method", &self.descriptor.to_string())
            .field("kind", &self.method)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        outcomes: Mutex<Vec<&'static str>>,
    }

    impl ResponseTarget<String> for Recorder {
        fn respond(&self, outcome: Outcome<String>) {
            let label = match outcome {
                Outcome::Response(_) => "response",
                Outcome::Empty => "empty",
                Outcome::Failed(_) => "failed",
            };
            self.outcomes.lock().unwrap().push(label);
        }

        fn abandon(&self) {
            self.outcomes.lock().unwrap().push("abandoned");
        }
    }

    #[test]
    fn test_descriptor_display() {
        let desc = MethodDescriptor::new("PingService", "ping");
        assert_eq!(desc.to_string(), "PingService.ping");
        assert_eq!(desc.service(), "PingService");
        assert_eq!(desc.method(), "ping");
    }

    #[test]
    fn test_correlation_id_roundtrip() {
        let id = CorrelationId::from(7);
        assert_eq!(id.get(), 7);
        assert_eq!(id.to_string(), "7");
    }

    #[test]
    fn test_response_sink_delivers_once() {
        let recorder = Arc::new(Recorder::default());
        let sink: ResponseSink<String> = ResponseSink::new(recorder.clone());
        sink.done("pong".to_string());
        assert_eq!(*recorder.outcomes.lock().unwrap(), vec!["response"]);
    }

    #[test]
    fn test_response_sink_finish_none_is_empty() {
        let recorder = Arc::new(Recorder::default());
        let sink: ResponseSink<String> = ResponseSink::new(recorder.clone());
        sink.finish(None);
        assert_eq!(*recorder.outcomes.lock().unwrap(), vec!["empty"]);
    }

    #[test]
    fn test_response_sink_drop_abandons() {
        let recorder = Arc::new(Recorder::default());
        drop(ResponseSink::<String>::new(recorder.clone()));
        assert_eq!(*recorder.outcomes.lock().unwrap(), vec!["abandoned"]);
    }

    #[test]
    fn test_closure_completion() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let completion: Arc<dyn CallCompletion<u32>> =
            Arc::new(move |id: CorrelationId, resp: Option<u32>| {
                sink.lock().unwrap().push((id, resp));
            });
        completion.on_finish(CorrelationId::new(3), Some(9));
        assert_eq!(*seen.lock().unwrap(), vec![(CorrelationId::new(3), Some(9))]);
    }

    #[test]
    fn test_completion_channel() {
        let (completion, mut rx) = completion_channel::<u32>();
        completion.on_finish(CorrelationId::new(1), None);
        assert_eq!(rx.try_recv().unwrap(), (CorrelationId::new(1), None));
    }

    #[test]
    fn test_call_state_with_timeout_sets_deadline() {
        let controller = Arc::new(CallController::new(CorrelationId::new(5)));
        let completion: Arc<dyn CallCompletion<String>> =
            Arc::new(|_: CorrelationId, _: Option<String>| {});
        let before = Instant::now();
        let state = CallState::new(
            MethodDescriptor::new("Svc", "m"),
            ServiceMethod::blocking(|_: &CallController, req: String| Ok(req)),
            "payload".to_string(),
            controller,
            completion,
        )
        .with_timeout(Duration::from_secs(5));

        let deadline = state.deadline().unwrap();
        assert!(deadline >= before + Duration::from_secs(5));
        assert_eq!(state.correlation_id(), CorrelationId::new(5));
        assert!(format!("{:?}", state).contains("Svc.m"));
    }

    #[test]
    fn test_call_state_unrepresentable_timeout_means_no_deadline() {
        let controller = Arc::new(CallController::new(CorrelationId::new(6)));
        let completion: Arc<dyn CallCompletion<String>> =
            Arc::new(|_: CorrelationId, _: Option<String>| {});
        let state = CallState::new(
            MethodDescriptor::new("Svc", "m"),
            ServiceMethod::blocking(|_: &CallController, req: String| Ok(req)),
            "payload".to_string(),
            controller,
            completion,
        )
        .with_timeout(Duration::MAX);

        assert_eq!(state.deadline(), None);
    }
}
