// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Groups messages from any number of producers into bounded batches for one consumer.
//!
//! Full batches wait in a queue of at most `max_pending_batches` for the flusher. When the
//! handler falls behind and the queue is full, the oldest pending batch is dropped and counted.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::listener::MessageHandler;

/// Receives flushed batches. Called from the collector's flusher task, never while a producer
/// holds the batch lock.
pub trait BatchHandler: Send + Sync + 'static {
    fn handle_batch(&self, batch: Vec<String>);
}

impl<F> BatchHandler for F
where
    F: Fn(Vec<String>) + Send + Sync + 'static,
{
    fn handle_batch(&self, batch: Vec<String>) {
        self(batch);
    }
}

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub max_batch_size: usize,
    pub flush_interval: Duration,
    /// Full batches allowed to wait for the handler before the oldest is dropped.
    pub max_pending_batches: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            flush_interval: Duration::from_millis(100),
            max_pending_batches: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectorStats {
    /// Batches handed to the handler.
    pub flushed_batches: u64,
    /// Pending batches evicted because the handler fell behind.
    pub dropped_batches: u64,
    pub dropped_messages: u64,
}

#[derive(Debug, Default)]
struct Counters {
    flushed_batches: AtomicU64,
    dropped_batches: AtomicU64,
    dropped_messages: AtomicU64,
}

#[derive(Default)]
struct Batches {
    current: Vec<String>,
    /// Batches that reached the size limit and wait for the flusher.
    ready: VecDeque<Vec<String>>,
}

struct Shared {
    batches: Mutex<Batches>,
    notify: Notify,
    max_batch_size: usize,
    max_pending_batches: usize,
    handler: Box<dyn BatchHandler>,
    counters: Counters,
}

pub struct BatchCollector {
    shared: Arc<Shared>,
    flush_interval: Duration,
    flusher: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl BatchCollector {
    pub fn new(config: CollectorConfig, handler: impl BatchHandler) -> Self {
        let max_batch_size = config.max_batch_size.max(1);
        let max_pending_batches = config.max_pending_batches.max(1);
        BatchCollector {
            shared: Arc::new(Shared {
                batches: Mutex::new(Batches {
                    current: Vec::with_capacity(max_batch_size),
                    ready: VecDeque::with_capacity(max_pending_batches),
                }),
                notify: Notify::new(),
                max_batch_size,
                max_pending_batches,
                handler: Box::new(handler),
                counters: Counters::default(),
            }),
            flush_interval: config.flush_interval,
            flusher: Mutex::new(None),
        }
    }

    /// Appends `message`. A batch that reaches the size limit is closed immediately and handed
    /// to the flusher, so no batch ever holds more than `max_batch_size` messages.
    pub fn add(&self, message: String) {
        let mut evicted = None;
        let full = {
            let mut batches = lock(&self.shared.batches);
            batches.current.push(message);
            if batches.current.len() >= self.shared.max_batch_size {
                let full = std::mem::replace(
                    &mut batches.current,
                    Vec::with_capacity(self.shared.max_batch_size),
                );
                if batches.ready.len() >= self.shared.max_pending_batches {
                    evicted = batches.ready.pop_front();
                }
                batches.ready.push_back(full);
                true
            } else {
                false
            }
        };
        if let Some(evicted) = evicted {
            self.shared
                .counters
                .dropped_batches
                .fetch_add(1, Ordering::Relaxed);
            self.shared
                .counters
                .dropped_messages
                .fetch_add(evicted.len() as u64, Ordering::Relaxed);
            warn!(
                "Batch handler is behind, dropped oldest pending batch of {} messages",
                evicted.len()
            );
        }
        if full {
            self.shared.notify.notify_one();
        }
    }

    #[must_use]
    pub fn stats(&self) -> CollectorStats {
        let counters = &self.shared.counters;
        CollectorStats {
            flushed_batches: counters.flushed_batches.load(Ordering::Relaxed),
            dropped_batches: counters.dropped_batches.load(Ordering::Relaxed),
            dropped_messages: counters.dropped_messages.load(Ordering::Relaxed),
        }
    }

    /// Spawns the flusher task. Cancelling `cancel` flushes whatever is buffered and ends it.
    pub fn start(&self, cancel: &CancellationToken) {
        let mut flusher = lock(&self.flusher);
        if flusher.is_some() {
            warn!("Batch collector already started");
            return;
        }
        let cancel = cancel.child_token();
        let handle = tokio::spawn(run_flusher(
            Arc::clone(&self.shared),
            self.flush_interval,
            cancel.clone(),
        ));
        *flusher = Some((cancel, handle));
    }

    /// Flushes any partial batch and waits for the flusher task to exit. A collector that was
    /// never started is flushed on the caller's task.
    pub async fn stop(&self) {
        let Some((cancel, handle)) = lock(&self.flusher).take() else {
            self.shared.flush_all();
            return;
        };
        cancel.cancel();
        if let Err(e) = handle.await {
            warn!("Batch collector flusher failed: {}", e);
        }
    }
}

impl MessageHandler for BatchCollector {
    fn handle(&self, message: String) {
        self.add(message);
    }
}

async fn run_flusher(shared: Arc<Shared>, flush_interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = shared.notify.notified() => shared.flush_ready(),
            _ = ticker.tick() => shared.flush_all(),
        }
    }
    shared.flush_all();
    debug!("Batch collector stopped");
}

impl Shared {
    fn flush_ready(&self) {
        loop {
            let Some(batch) = lock(&self.batches).ready.pop_front() else {
                return;
            };
            self.deliver(batch);
        }
    }

    fn flush_all(&self) {
        self.flush_ready();
        let batch = std::mem::take(&mut lock(&self.batches).current);
        if !batch.is_empty() {
            self.deliver(batch);
        }
    }

    fn deliver(&self, batch: Vec<String>) {
        self.counters.flushed_batches.fetch_add(1, Ordering::Relaxed);
        self.handler.handle_batch(batch);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
