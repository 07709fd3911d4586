// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for duplex-executor integration tests.
//!
//! Provides a recording completion, a handful of service methods, and a
//! builder for call states.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};

use duplex_executor::{
    CallCompletion, CallController, CallState, CorrelationId, ExecutorConfig, MethodDescriptor,
    QueueConfig, ServiceMethod, ThreadPoolCallExecutor,
};

pub const WAIT: Duration = Duration::from_secs(5);

/// Install a test subscriber, honouring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Completion that forwards every result to a channel.
pub struct Recorder {
    tx: Sender<(CorrelationId, Option<String>)>,
}

impl CallCompletion<String> for Recorder {
    fn on_finish(&self, correlation_id: CorrelationId, response: Option<String>) {
        let _ = self.tx.send((correlation_id, response));
    }
}

pub fn recorder() -> (Arc<Recorder>, Receiver<(CorrelationId, Option<String>)>) {
    let (tx, rx) = unbounded();
    (Arc::new(Recorder { tx }), rx)
}

/// Echo method that counts its invocations.
pub fn echo(invocations: &Arc<AtomicUsize>) -> ServiceMethod<String, String> {
    let invocations = Arc::clone(invocations);
    ServiceMethod::blocking(move |_: &CallController, req: String| {
        invocations.fetch_add(1, Ordering::SeqCst);
        Ok(req)
    })
}

/// Blocking method that signals `started` and then waits for `release`.
pub fn held(started: Sender<()>, release: Receiver<()>) -> ServiceMethod<String, String> {
    ServiceMethod::blocking(move |_: &CallController, req: String| {
        let _ = started.send(());
        release.recv_timeout(WAIT)?;
        Ok(req)
    })
}

pub fn call(
    id: u64,
    method: ServiceMethod<String, String>,
    request: &str,
    completion: Arc<dyn CallCompletion<String>>,
) -> (CallState<String, String>, Arc<CallController>) {
    let controller = Arc::new(CallController::new(CorrelationId::new(id)));
    let state = CallState::new(
        MethodDescriptor::new("TestService", "call"),
        method,
        request.to_string(),
        Arc::clone(&controller),
        completion,
    );
    (state, controller)
}

pub fn executor(core: usize, max: usize, queue: QueueConfig) -> ThreadPoolCallExecutor<String, String> {
    init_tracing();
    ThreadPoolCallExecutor::new(ExecutorConfig::new(core, max).queue(queue))
        .expect("valid executor config")
}
