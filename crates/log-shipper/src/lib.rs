// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Resilient log delivery pipeline.
//!
//! Events flow from an [`listener::IngestListener`] through a [`collector::BatchCollector`]
//! into a [`pool::WorkerPool`], whose workers hand batches to a [`pool::Processor`]. The
//! provided [`shipping::ShippingProcessor`] guards a [`delivery::DeliveryClient`] with a
//! [`circuit_breaker::CircuitBreaker`] and persists undeliverable batches to a
//! [`spill::SpillQueue`] for later replay.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod circuit_breaker;
pub mod collector;
pub mod config;
pub mod delivery;
pub mod errors;
pub mod event;
pub mod http_sink;
pub mod listener;
pub mod pool;
pub mod shipping;
pub mod spill;
