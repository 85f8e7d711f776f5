// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Batch delivery with retries.
//!
//! A [`DeliveryClient`] wraps one [`Sink`] and sends a batch with up to `max_retries + 1`
//! attempts. The delay before each retry comes from the sink's [`RetryStrategy`], and each
//! failure is classified as transient (retry) or permanent (give up now).

use async_trait::async_trait;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, error};

use crate::errors::{DeliveryError, ErrorClass, SinkError};
use crate::event::Event;

/// Largest exponent used by [`RetryStrategy::ExponentialBackoff`] (`delay * 2^16`).
const MAX_BACKOFF_SHIFT: u32 = 16;

/// Transport error fragments that indicate a condition worth retrying.
const TRANSIENT_TRANSPORT_HINTS: [&str; 8] = [
    "timeout",
    "timed out",
    "connection",
    "connect",
    "temporar",
    "reset",
    "broken pipe",
    "unavailable",
];

/// A destination that accepts batches of events.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Makes a single delivery attempt.
    async fn send(&self, batch: &[Event]) -> Result<(), SinkError>;

    fn name(&self) -> &str {
        "sink"
    }
}

#[async_trait]
impl<T: Sink + ?Sized> Sink for std::sync::Arc<T> {
    async fn send(&self, batch: &[Event]) -> Result<(), SinkError> {
        (**self).send(batch).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Retry budget and backoff schedule. The first field of every variant is the number of
/// retries after the initial attempt; the second is the base delay in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Retry without waiting.
    Immediate(u32),
    /// Wait `delay * retry` before each retry.
    LinearBackoff(u32, u64),
    /// Wait `delay * 2^(retry - 1)` before each retry.
    ExponentialBackoff(u32, u64),
}

impl Default for RetryStrategy {
    fn default() -> Self {
        RetryStrategy::ExponentialBackoff(3, 100)
    }
}

impl RetryStrategy {
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        match self {
            RetryStrategy::Immediate(retries)
            | RetryStrategy::LinearBackoff(retries, _)
            | RetryStrategy::ExponentialBackoff(retries, _) => *retries,
        }
    }

    /// Delay before retry number `retry` (1-based).
    #[must_use]
    pub fn delay(&self, retry: u32) -> Duration {
        match self {
            RetryStrategy::Immediate(_) => Duration::ZERO,
            RetryStrategy::LinearBackoff(_, delay_ms) => {
                Duration::from_millis(delay_ms.saturating_mul(u64::from(retry)))
            }
            RetryStrategy::ExponentialBackoff(_, delay_ms) => {
                let shift = retry.saturating_sub(1).min(MAX_BACKOFF_SHIFT);
                Duration::from_millis(delay_ms.saturating_mul(1u64 << shift))
            }
        }
    }
}

impl FromStr for RetryStrategy {
    type Err = String;

    /// Parses `immediate:<retries>`, `linear:<retries>:<delay_ms>` or
    /// `exponential:<retries>:<delay_ms>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        let number = |raw: &str| {
            raw.parse::<u64>()
                .map_err(|e| format!("invalid number '{raw}' in retry strategy '{s}': {e}"))
        };
        let retries = |raw: &str| {
            number(raw).and_then(|n| {
                u32::try_from(n).map_err(|_| format!("retry count '{raw}' is too large"))
            })
        };
        match parts.as_slice() {
            [kind, n] if kind.eq_ignore_ascii_case("immediate") => {
                Ok(RetryStrategy::Immediate(retries(*n)?))
            }
            [kind, n, delay] if kind.eq_ignore_ascii_case("linear") => {
                Ok(RetryStrategy::LinearBackoff(retries(*n)?, number(*delay)?))
            }
            [kind, n, delay] if kind.eq_ignore_ascii_case("exponential") => {
                Ok(RetryStrategy::ExponentialBackoff(retries(*n)?, number(*delay)?))
            }
            _ => Err(format!("unrecognized retry strategy '{s}'")),
        }
    }
}

/// Status codes worth retrying: request timeout, rate limiting and every 5xx.
#[must_use]
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429) || (500..600).contains(&status)
}

/// Default classifier used by [`DeliveryClient`].
#[must_use]
pub fn classify(error: &SinkError) -> ErrorClass {
    match error {
        SinkError::Status { status, .. } if is_retryable_status(*status) => ErrorClass::Transient,
        SinkError::Status { .. } | SinkError::Payload(_) | SinkError::Config(_) => {
            ErrorClass::Permanent
        }
        SinkError::Transport(message) => {
            let message = message.to_ascii_lowercase();
            if TRANSIENT_TRANSPORT_HINTS
                .iter()
                .any(|hint| message.contains(hint))
            {
                ErrorClass::Transient
            } else {
                ErrorClass::Permanent
            }
        }
    }
}

pub struct DeliveryClient<S> {
    sink: S,
    retry_strategy: RetryStrategy,
    classifier: fn(&SinkError) -> ErrorClass,
}

impl<S: Sink> DeliveryClient<S> {
    #[must_use]
    pub fn new(sink: S, retry_strategy: RetryStrategy) -> Self {
        DeliveryClient {
            sink,
            retry_strategy,
            classifier: classify,
        }
    }

    /// Replaces the default transient/permanent classifier for sinks with their own rules.
    #[must_use]
    pub fn with_classifier(mut self, classifier: fn(&SinkError) -> ErrorClass) -> Self {
        self.classifier = classifier;
        self
    }

    #[must_use]
    pub fn sink(&self) -> &S {
        &self.sink
    }

    #[must_use]
    pub fn retry_strategy(&self) -> RetryStrategy {
        self.retry_strategy
    }

    /// Sends `batch`, retrying transient failures until the retry budget runs out.
    pub async fn send(&self, batch: &[Event]) -> Result<(), DeliveryError> {
        let max_attempts = self.retry_strategy.max_retries().saturating_add(1);
        let mut attempts = 0;

        loop {
            if attempts > 0 {
                let delay = self.retry_strategy.delay(attempts);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
            attempts += 1;

            let err = match self.sink.send(batch).await {
                Ok(()) => {
                    debug!(
                        "Delivered {} events to {} in {} attempt(s)",
                        batch.len(),
                        self.sink.name(),
                        attempts
                    );
                    return Ok(());
                }
                Err(e) => e,
            };

            match (self.classifier)(&err) {
                ErrorClass::Permanent => {
                    error!(
                        "Permanent error delivering {} events to {}: {}",
                        batch.len(),
                        self.sink.name(),
                        err
                    );
                    return Err(DeliveryError::Permanent {
                        attempts,
                        source: err,
                    });
                }
                ErrorClass::Transient if attempts >= max_attempts => {
                    error!(
                        "Failed to deliver {} events to {} after {} attempts: {}",
                        batch.len(),
                        self.sink.name(),
                        attempts,
                        err
                    );
                    return Err(DeliveryError::Exhausted {
                        attempts,
                        source: err,
                    });
                }
                ErrorClass::Transient => {
                    debug!(
                        "Attempt {}/{} to {} failed, retrying: {}",
                        attempts,
                        max_attempts,
                        self.sink.name(),
                        err
                    );
                }
            }
        }
    }
}
