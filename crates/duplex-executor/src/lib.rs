// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Duplex Executor - server-side call execution for duplex RPC
//!
//! This crate runs inbound RPC calls, already decoded by the connection layer,
//! on a managed worker pool. It owns cancellation, queue timeouts, overload
//! rejection and the completion notification back to the connection.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────┐   execute(CallState)   ┌──────────────────────────┐
//! │       Connection layer       │ ─────────────────────▶ │  ThreadPoolCallExecutor  │
//! │  (decode, I/O thread, write) │   cancel(handle | id)  │  registry + worker pool  │
//! │                              │ ─────────────────────▶ │                          │
//! │                              │                        └────────────┬─────────────┘
//! │                              │                                     │ CallTask::run
//! │                              │   on_finish(id, Option<Resp>)       ▼
//! │                              │ ◀──────────────────── ┌──────────────────────────┐
//! │                              │   cancel notify       │  Blocking | NonBlocking  │
//! │                              │ ◀──────────────────── │     service method       │
//! └──────────────────────────────┘                       └──────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - Every call's [`CallCompletion`] fires exactly once: on success, method
//!   failure, panic, cancellation, queue timeout, or overload rejection.
//! - A call canceled before a worker picks it up never reaches its method.
//! - A canceled call's cancel-notify callback fires at most once, after the
//!   call has stopped running.
//! - Submission never blocks: a saturated pool rejects with
//!   [`CallError::Overload`].
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use duplex_executor::*;
//!
//! let executor = ThreadPoolCallExecutor::<String, String>::new(ExecutorConfig::new(4, 8))?;
//! let (completion, mut completions) = completion_channel();
//!
//! let controller = Arc::new(CallController::new(CorrelationId::new(7)));
//! let call = CallState::new(
//!     MethodDescriptor::new("PingService", "ping"),
//!     ServiceMethod::blocking(|_: &CallController, req: String| Ok(req)),
//!     "ping".to_string(),
//!     controller,
//!     completion,
//! );
//! let handle = executor.execute(call);
//! ```

pub mod call;
pub mod config;
pub mod controller;
pub mod error;
pub mod executor;
mod pool;
mod registry;
pub mod task;

pub use call::{
    BlockingMethod, CallCompletion, CallState, ChannelCompletion, CorrelationId,
    MethodDescriptor, NonBlockingMethod, ResponseSink, ServiceMethod, completion_channel,
};
pub use config::{ConfigError, ExecutorConfig, QueueConfig};
pub use controller::CallController;
pub use error::{CallError, ExecutorError};
pub use executor::{RpcServerCallExecutor, SameThreadCallExecutor, ThreadPoolCallExecutor};
pub use task::{TaskHandle, TaskState};
