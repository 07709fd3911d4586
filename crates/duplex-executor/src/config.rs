// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker pool configuration.

use std::time::Duration;

/// Default number of core workers.
pub const DEFAULT_CORE_POOL_SIZE: usize = 8;
/// Default idle time before a non-core worker exits.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(30);
/// Default worker thread name prefix.
pub const DEFAULT_THREAD_PREFIX: &str = "rpc";

/// Shape of the queue between submitters and workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueConfig {
    /// At most `n` calls wait for a worker. `Bounded(0)` is a pure hand-off:
    /// a call is only accepted if a worker is idle and waiting for it.
    Bounded(usize),
    /// No bound on waiting calls. Never rejects for overload, at the cost of
    /// unbounded memory and latency growth.
    Unbounded,
}

impl QueueConfig {
    /// Capacity, or `None` when unbounded.
    pub fn capacity(&self) -> Option<usize> {
        match self {
            QueueConfig::Bounded(n) => Some(*n),
            QueueConfig::Unbounded => None,
        }
    }
}

/// Configuration for a [`ThreadPoolCallExecutor`](crate::ThreadPoolCallExecutor).
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Workers started eagerly per submission and kept alive while idle.
    pub core_pool_size: usize,
    /// Hard ceiling on concurrently alive workers.
    pub max_pool_size: usize,
    /// Waiting-call queue.
    pub queue: QueueConfig,
    /// Idle time after which a worker above the core size exits.
    pub keep_alive: Duration,
    /// Worker threads are named `{prefix}-{n}`.
    pub thread_prefix: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::new(DEFAULT_CORE_POOL_SIZE, DEFAULT_CORE_POOL_SIZE)
    }
}

impl ExecutorConfig {
    /// Pool of `core..=max` workers with a bounded queue of `core` entries.
    pub fn new(core_pool_size: usize, max_pool_size: usize) -> Self {
        Self {
            core_pool_size,
            max_pool_size,
            queue: QueueConfig::Bounded(core_pool_size),
            keep_alive: DEFAULT_KEEP_ALIVE,
            thread_prefix: DEFAULT_THREAD_PREFIX.to_string(),
        }
    }

    /// Replace the queue configuration.
    pub fn queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    /// Replace the keep-alive for non-core workers.
    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Replace the worker thread name prefix.
    pub fn thread_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_prefix = prefix.into();
        self
    }

    /// Check that the pool can run at least one worker.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_pool_size == 0 {
            return Err(ConfigError::Invalid(
                "max_pool_size",
                "must be at least 1",
            ));
        }
        if self.max_pool_size < self.core_pool_size {
            return Err(ConfigError::Invalid(
                "max_pool_size",
                "must not be smaller than core_pool_size",
            ));
        }
        Ok(())
    }

    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `DUPLEX_EXECUTOR_CORE_POOL_SIZE`: core workers (default: 8)
    /// - `DUPLEX_EXECUTOR_MAX_POOL_SIZE`: maximum workers (default: core size)
    /// - `DUPLEX_EXECUTOR_QUEUE_CAPACITY`: `unbounded`, `0` for hand-off, or a
    ///   capacity (default: core size)
    /// - `DUPLEX_EXECUTOR_KEEP_ALIVE_MS`: non-core worker idle timeout (default: 30000)
    /// - `DUPLEX_EXECUTOR_THREAD_PREFIX`: worker thread name prefix (default: `rpc`)
    pub fn from_env() -> Result<Self, ConfigError> {
        let core_pool_size: usize = match std::env::var("DUPLEX_EXECUTOR_CORE_POOL_SIZE") {
            Ok(v) => v.parse().map_err(|_| {
                ConfigError::Invalid(
                    "DUPLEX_EXECUTOR_CORE_POOL_SIZE",
                    "must be a non-negative integer",
                )
            })?,
            Err(_) => DEFAULT_CORE_POOL_SIZE,
        };

        let max_pool_size: usize = match std::env::var("DUPLEX_EXECUTOR_MAX_POOL_SIZE") {
            Ok(v) => v.parse().map_err(|_| {
                ConfigError::Invalid("DUPLEX_EXECUTOR_MAX_POOL_SIZE", "must be a positive integer")
            })?,
            Err(_) => core_pool_size.max(1),
        };

        let queue = match std::env::var("DUPLEX_EXECUTOR_QUEUE_CAPACITY") {
            Ok(v) if v.eq_ignore_ascii_case("unbounded") => QueueConfig::Unbounded,
            Ok(v) => QueueConfig::Bounded(v.parse().map_err(|_| {
                ConfigError::Invalid(
                    "DUPLEX_EXECUTOR_QUEUE_CAPACITY",
                    "must be 'unbounded' or a non-negative integer",
                )
            })?),
            Err(_) => QueueConfig::Bounded(core_pool_size),
        };

        let keep_alive_ms: u64 = std::env::var("DUPLEX_EXECUTOR_KEEP_ALIVE_MS")
            .unwrap_or_else(|_| DEFAULT_KEEP_ALIVE.as_millis().to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(
                    "DUPLEX_EXECUTOR_KEEP_ALIVE_MS",
                    "must be a duration in milliseconds",
                )
            })?;

        let thread_prefix = std::env::var("DUPLEX_EXECUTOR_THREAD_PREFIX")
            .unwrap_or_else(|_| DEFAULT_THREAD_PREFIX.to_string());

        let config = Self {
            core_pool_size,
            max_pool_size,
            queue,
            keep_alive: Duration::from_millis(keep_alive_ms),
            thread_prefix,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A setting has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
