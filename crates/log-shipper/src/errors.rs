// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for each pipeline stage.

use std::fmt;
use std::path::PathBuf;

/// Errors raised while configuring or starting the ingest listener.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("couldn't bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid allow-list entry '{0}'")]
    InvalidAllowList(String),

    #[error("failed to load TLS material: {0}")]
    Tls(String),

    #[error("listener already started")]
    AlreadyStarted,
}

/// A single failed send attempt against a sink.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    #[error("{status}: {body}")]
    Status { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to prepare payload: {0}")]
    Payload(String),

    #[error("invalid sink configuration: {0}")]
    Config(String),
}

/// Whether a failed attempt is worth repeating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

/// Outcome of a [`crate::delivery::DeliveryClient::send`] call that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("permanent delivery failure after {attempts} attempt(s): {source}")]
    Permanent {
        attempts: u32,
        #[source]
        source: SinkError,
    },

    #[error("delivery failed after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: SinkError,
    },
}

impl DeliveryError {
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(self, DeliveryError::Permanent { .. })
    }

    #[must_use]
    pub fn attempts(&self) -> u32 {
        match self {
            DeliveryError::Permanent { attempts, .. }
            | DeliveryError::Exhausted { attempts, .. } => *attempts,
        }
    }
}

/// Result of a call routed through a [`crate::circuit_breaker::CircuitBreaker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitError<E> {
    /// The breaker is open; the wrapped call was not made.
    Open,
    /// The wrapped call ran and failed.
    Call(E),
}

impl<E: fmt::Display> fmt::Display for CircuitError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitError::Open => write!(f, "circuit breaker is open"),
            CircuitError::Call(e) => write!(f, "{e}"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for CircuitError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CircuitError::Open => None,
            CircuitError::Call(e) => Some(e),
        }
    }
}

/// Errors raised by the worker pool lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("worker pool already started")]
    AlreadyStarted,
}

/// Error returned by a [`crate::pool::Processor`] for a batch it could not handle.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("circuit breaker is open")]
    CircuitOpen,

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error("{0}")]
    Other(String),
}

/// Errors raised by the disk spill queue.
#[derive(Debug, thiserror::Error)]
pub enum SpillError {
    #[error("spill I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("couldn't create spill directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("spill queue full: {frame_bytes} byte frame, {used}/{max} bytes used")]
    Capacity { frame_bytes: u64, used: u64, max: u64 },

    #[error("failed to encode batch: {0}")]
    Encode(String),
}

/// Failure of a [`crate::spill::SpillQueue::replay`] pass.
#[derive(Debug)]
pub enum ReplayError<E> {
    /// Reading or rewriting spill segments failed.
    Spill(SpillError),
    /// The delivery callback rejected a batch; it and everything after it stay on disk.
    Delivery(E),
}

impl<E> From<SpillError> for ReplayError<E> {
    fn from(e: SpillError) -> Self {
        ReplayError::Spill(e)
    }
}

impl<E> From<std::io::Error> for ReplayError<E> {
    fn from(e: std::io::Error) -> Self {
        ReplayError::Spill(SpillError::Io(e))
    }
}

impl<E: fmt::Display> fmt::Display for ReplayError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplayError::Spill(e) => write!(f, "{e}"),
            ReplayError::Delivery(e) => write!(f, "replay delivery failed: {e}"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for ReplayError<E> {}

/// Invalid shipper configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
