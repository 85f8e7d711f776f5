// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The [`Processor`] that ships batches to a sink.
//!
//! Every delivery goes through the sink's circuit breaker. Batches that fail transiently, or
//! that the open breaker refuses, are spilled to disk and replayed later. Permanent failures
//! are never spilled since retrying them cannot succeed.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::delivery::{DeliveryClient, Sink};
use crate::errors::{CircuitError, DeliveryError, ProcessError, SpillError};
use crate::event::{Batch, Event};
use crate::pool::Processor;
use crate::spill::SpillQueue;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShippingStats {
    /// Events accepted by the sink, live or replayed.
    pub delivered: u64,
    /// Batches written to the spill queue.
    pub spilled: u64,
    /// Batches lost because the spill queue was full or unwritable.
    pub spill_rejected: u64,
    /// Batches dropped after a permanent delivery error.
    pub permanent_failures: u64,
    /// Batches the open circuit refused.
    pub circuit_rejections: u64,
}

#[derive(Debug, Default)]
struct Counters {
    delivered: AtomicU64,
    spilled: AtomicU64,
    spill_rejected: AtomicU64,
    permanent_failures: AtomicU64,
    circuit_rejections: AtomicU64,
}

pub struct ShippingProcessor<S> {
    client: DeliveryClient<S>,
    breaker: CircuitBreaker,
    spill: Option<Arc<SpillQueue>>,
    counters: Counters,
}

impl<S: Sink + 'static> ShippingProcessor<S> {
    #[must_use]
    pub fn new(
        client: DeliveryClient<S>,
        breaker: CircuitBreaker,
        spill: Option<Arc<SpillQueue>>,
    ) -> Self {
        ShippingProcessor {
            client,
            breaker,
            spill,
            counters: Counters::default(),
        }
    }

    #[must_use]
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    #[must_use]
    pub fn spill(&self) -> Option<&Arc<SpillQueue>> {
        self.spill.as_ref()
    }

    #[must_use]
    pub fn stats(&self) -> ShippingStats {
        ShippingStats {
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            spilled: self.counters.spilled.load(Ordering::Relaxed),
            spill_rejected: self.counters.spill_rejected.load(Ordering::Relaxed),
            permanent_failures: self.counters.permanent_failures.load(Ordering::Relaxed),
            circuit_rejections: self.counters.circuit_rejections.load(Ordering::Relaxed),
        }
    }

    /// Starts replaying spilled batches through the breaker every `interval`. Returns `None`
    /// when no spill queue is configured.
    pub fn start_replay(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        let spill = self.spill.as_ref()?;
        let processor = Arc::clone(self);
        Some(spill.start_replay(
            interval,
            move |batch| {
                let processor = Arc::clone(&processor);
                async move { processor.redeliver(batch).await }
            },
            cancel,
        ))
    }

    /// Delivers one spilled batch. A permanent failure acknowledges the batch so it leaves the
    /// queue; anything else keeps it for the next pass.
    pub async fn redeliver(&self, batch: Batch) -> Result<(), ProcessError> {
        match self.deliver(&batch).await {
            Ok(()) => Ok(()),
            Err(CircuitError::Open) => Err(ProcessError::CircuitOpen),
            Err(CircuitError::Call(e)) if e.is_permanent() => {
                self.counters
                    .permanent_failures
                    .fetch_add(1, Ordering::Relaxed);
                error!(
                    "Dropping spilled batch of {} events rejected by {}: {}",
                    batch.len(),
                    self.breaker.name(),
                    e
                );
                Ok(())
            }
            Err(CircuitError::Call(e)) => Err(ProcessError::Delivery(e)),
        }
    }

    async fn deliver(&self, batch: &[Event]) -> Result<(), CircuitError<DeliveryError>> {
        self.breaker.execute(|| self.client.send(batch)).await?;
        self.counters
            .delivered
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    async fn spill_batch(&self, batch: &[Event]) {
        let Some(spill) = &self.spill else {
            warn!(
                "No spill queue for {}, dropping {} events",
                self.breaker.name(),
                batch.len()
            );
            return;
        };
        match spill.append(batch).await {
            Ok(()) => {
                self.counters.spilled.fetch_add(1, Ordering::Relaxed);
                debug!("Spilled {} events for {}", batch.len(), self.breaker.name());
            }
            Err(e @ SpillError::Capacity { .. }) => {
                self.counters.spill_rejected.fetch_add(1, Ordering::Relaxed);
                error!("Lost {} events: {}", batch.len(), e);
            }
            Err(e) => {
                self.counters.spill_rejected.fetch_add(1, Ordering::Relaxed);
                error!("Lost {} events, failed to spill: {}", batch.len(), e);
            }
        }
    }
}

#[async_trait]
impl<S: Sink + 'static> Processor for ShippingProcessor<S> {
    async fn process(
        &self,
        _cancel: &CancellationToken,
        batch: &[Event],
    ) -> Result<(), ProcessError> {
        let err = match self.deliver(batch).await {
            Ok(()) => return Ok(()),
            Err(CircuitError::Open) => {
                self.counters
                    .circuit_rejections
                    .fetch_add(1, Ordering::Relaxed);
                ProcessError::CircuitOpen
            }
            Err(CircuitError::Call(e)) if e.is_permanent() => {
                self.counters
                    .permanent_failures
                    .fetch_add(1, Ordering::Relaxed);
                return Err(ProcessError::Delivery(e));
            }
            Err(CircuitError::Call(e)) => ProcessError::Delivery(e),
        };
        self.spill_batch(batch).await;
        Err(err)
    }
}
