// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Admission control tests: overload rejection, queue timeouts and shutdown.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::*;
use crossbeam_channel::unbounded;
use duplex_executor::{CallError, CorrelationId, QueueConfig, RpcServerCallExecutor};

#[test]
fn test_saturated_pool_rejects_without_blocking() {
    let executor = executor(1, 2, QueueConfig::Bounded(1));
    let (completion, results) = recorder();
    let (started_tx, started_rx) = unbounded();
    let (release_tx, release_rx) = unbounded();

    // One core worker, one queued call, one worker above core.
    let mut controllers = Vec::new();
    for id in 1..=3 {
        let method = held(started_tx.clone(), release_rx.clone());
        let (state, controller) = call(id, method, "held", completion.clone());
        executor.execute(state);
        controllers.push(controller);
    }
    started_rx.recv_timeout(WAIT).unwrap();
    started_rx.recv_timeout(WAIT).unwrap();
    assert_eq!(executor.pool_size(), 2);
    assert_eq!(executor.queued(), 1);

    let invocations = Arc::new(AtomicUsize::new(0));
    let (state, rejected) = call(4, echo(&invocations), "overflow", completion);
    let handle = executor.execute(state);

    // Rejection is delivered on the submitting thread before execute returns.
    assert_eq!(results.try_recv().unwrap(), (CorrelationId::new(4), None));
    assert_eq!(rejected.failure(), Some(CallError::Overload));
    assert_eq!(rejected.error_text().as_deref(), Some("Server Overload"));
    assert_eq!(executor.task_state(handle), None);
    assert_eq!(invocations.load(Ordering::SeqCst), 0);

    for _ in 0..3 {
        release_tx.send(()).unwrap();
    }
    let mut finished: Vec<_> = (0..3).map(|_| results.recv_timeout(WAIT).unwrap()).collect();
    finished.sort_by_key(|(id, _)| *id);
    for (i, (id, response)) in finished.into_iter().enumerate() {
        assert_eq!(id, CorrelationId::new(i as u64 + 1));
        assert_eq!(response.as_deref(), Some("held"));
    }
    assert!(controllers.iter().all(|c| !c.failed()));
    assert_eq!(executor.in_flight(), 0);
}

#[test]
fn test_expired_deadline_skips_method() {
    let executor = executor(0, 1, QueueConfig::Bounded(1));
    let (completion, results) = recorder();
    let invocations = Arc::new(AtomicUsize::new(0));

    let (state, controller) = call(5, echo(&invocations), "stale", completion);
    executor.execute(state.with_timeout(Duration::ZERO));

    let (id, response) = results.recv_timeout(WAIT).unwrap();
    assert_eq!(id, CorrelationId::new(5));
    assert_eq!(response, None);
    assert!(controller.is_canceled());
    assert!(!controller.failed());
    assert_eq!(invocations.load(Ordering::SeqCst), 0);
}

#[test]
fn test_deadline_not_reached_runs_method() {
    let executor = executor(1, 1, QueueConfig::Bounded(1));
    let (completion, results) = recorder();
    let invocations = Arc::new(AtomicUsize::new(0));

    let (state, controller) = call(6, echo(&invocations), "fresh", completion);
    executor.execute(state.with_timeout(WAIT));

    let (_, response) = results.recv_timeout(WAIT).unwrap();
    assert_eq!(response.as_deref(), Some("fresh"));
    assert!(!controller.is_canceled());
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

#[test]
fn test_shutdown_drains_queue_then_rejects() {
    let executor = executor(1, 1, QueueConfig::Unbounded);
    let (completion, results) = recorder();
    let invocations = Arc::new(AtomicUsize::new(0));

    for id in 10..15 {
        let (state, _) = call(id, echo(&invocations), "queued", completion.clone());
        executor.execute(state);
    }
    executor.shutdown();
    assert!(executor.is_shutdown());

    let finished: Vec<_> = results.try_iter().collect();
    assert_eq!(finished.len(), 5);
    assert!(finished.iter().all(|(_, r)| r.as_deref() == Some("queued")));
    assert_eq!(invocations.load(Ordering::SeqCst), 5);
    assert_eq!(executor.pool_size(), 0);

    let (state, controller) = call(20, echo(&invocations), "late", completion);
    executor.execute(state);
    assert_eq!(results.try_recv().unwrap(), (CorrelationId::new(20), None));
    assert_eq!(controller.failure(), Some(CallError::Shutdown));
    assert_eq!(invocations.load(Ordering::SeqCst), 5);
}
