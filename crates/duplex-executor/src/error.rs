// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for duplex-executor.
//!
//! [`CallError`] is what a [`CallController`](crate::CallController) records when a
//! single call fails. [`ExecutorError`] covers failures of the executor itself.
//! Cancellation is not an error: it is carried by the controller's
//! canceled flag.

use thiserror::Error;

use crate::config::ConfigError;

/// Terminal failure recorded against one call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum CallError {
    /// Admission was denied because the worker pool and its queue were saturated.
    #[error("Server Overload")]
    Overload,

    /// The executor was shut down before the call could be scheduled.
    #[error("Server Shutdown")]
    Shutdown,

    /// The service method returned an error.
    #[error("{message}")]
    Method {
        /// Error message followed by its cause chain.
        message: String,
    },

    /// The service method panicked.
    #[error("method panicked: {message}")]
    Panicked {
        /// Panic payload, when it was a string.
        message: String,
    },

    /// A non-blocking method dropped its response sink without answering.
    #[error("response sink dropped without a response")]
    Abandoned,
}

impl CallError {
    /// Build a [`CallError::Method`] from a service method error.
    ///
    /// The description is the error's own message followed by each cause,
    /// separated by `". "`.
    pub fn from_method_error(err: &anyhow::Error) -> Self {
        let mut message = err.to_string();
        for cause in err.chain().skip(1) {
            message.push_str(". ");
            message.push_str(&cause.to_string());
        }
        CallError::Method { message }
    }

    /// Build a [`CallError::Panicked`] from a `catch_unwind` payload.
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        CallError::Panicked { message }
    }

    /// Short machine-readable code, for logs and error responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Overload => "SERVER_OVERLOAD",
            Self::Shutdown => "SERVER_SHUTDOWN",
            Self::Method { .. } => "METHOD_FAILED",
            Self::Panicked { .. } => "METHOD_PANICKED",
            Self::Abandoned => "RESPONSE_ABANDONED",
        }
    }
}

/// Errors raised by the executor itself rather than by a call.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// Invalid pool configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Type alias for executor results.
pub type Result<T> = std::result::Result<T, ExecutorError>;
