// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded intake queue feeding a pool of delivery workers.
//!
//! One aggregator task turns single events into batches bounded by count and bytes, and
//! `workers` tasks hand those batches to a [`Processor`]. [`WorkerPool::submit`] never waits:
//! when the intake queue is full the event is dropped and counted.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::errors::{PoolError, ProcessError};
use crate::event::{self, Batch, Event};

/// Delivers one batch on behalf of a worker.
///
/// The pool does not retry; failed batches are counted and dropped at this layer.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, cancel: &CancellationToken, batch: &[Event])
        -> Result<(), ProcessError>;
}

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub workers: usize,
    /// Capacity of the intake queue, in events.
    pub queue_depth: usize,
    /// Capacity of the queue between the aggregator and workers, in batches.
    pub batch_queue_depth: usize,
    pub batch_size: usize,
    pub max_batch_bytes: usize,
    pub flush_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_depth: 10_000,
            batch_queue_depth: 8,
            batch_size: 1000,
            max_batch_bytes: 5 * 1024 * 1024,
            flush_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Events in batches the processor accepted.
    pub processed: u64,
    /// Events refused by [`WorkerPool::submit`].
    pub dropped: u64,
    /// Batches the processor failed.
    pub errors: u64,
    /// Processing time of the most recently finished batch.
    pub last_batch_duration: Duration,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    dropped: AtomicU64,
    errors: AtomicU64,
    last_batch_micros: AtomicU64,
}

struct Running {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

pub struct WorkerPool {
    config: WorkerPoolConfig,
    processor: Arc<dyn Processor>,
    intake_tx: mpsc::Sender<Event>,
    intake_rx: Mutex<Option<mpsc::Receiver<Event>>>,
    counters: Arc<Counters>,
    running: Mutex<Option<Running>>,
}

impl WorkerPool {
    #[must_use]
    pub fn new(config: WorkerPoolConfig, processor: Arc<dyn Processor>) -> Self {
        let config = WorkerPoolConfig {
            workers: config.workers.max(1),
            queue_depth: config.queue_depth.max(1),
            batch_queue_depth: config.batch_queue_depth.max(1),
            batch_size: config.batch_size.max(1),
            max_batch_bytes: config.max_batch_bytes.max(1),
            flush_interval: config.flush_interval,
        };
        let (intake_tx, intake_rx) = mpsc::channel(config.queue_depth);
        WorkerPool {
            config,
            processor,
            intake_tx,
            intake_rx: Mutex::new(Some(intake_rx)),
            counters: Arc::new(Counters::default()),
            running: Mutex::new(None),
        }
    }

    /// Enqueues `event` without waiting. Returns `false` if the intake queue is full or the
    /// pool has stopped; the event is then counted as dropped.
    pub fn submit(&self, event: Event) -> bool {
        match self.intake_tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("Intake queue full, dropping event");
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("Worker pool stopped, dropping event");
                false
            }
        }
    }

    /// Spawns the aggregator and the workers. Cancelling `cancel` drains the pool the same way
    /// [`WorkerPool::stop`] does.
    pub fn start(&self, cancel: &CancellationToken) -> Result<(), PoolError> {
        let Some(intake_rx) = lock(&self.intake_rx).take() else {
            return Err(PoolError::AlreadyStarted);
        };
        let cancel = cancel.child_token();
        let (batch_tx, batch_rx) = mpsc::channel(self.config.batch_queue_depth);
        let batch_rx = Arc::new(tokio::sync::Mutex::new(batch_rx));

        let mut tasks = Vec::with_capacity(self.config.workers + 1);
        let aggregator = Aggregator {
            batch: Vec::with_capacity(self.config.batch_size),
            bytes: 0,
            batch_size: self.config.batch_size,
            max_batch_bytes: self.config.max_batch_bytes,
            batch_tx,
        };
        tasks.push(tokio::spawn(aggregator.run(
            intake_rx,
            cancel.clone(),
            self.config.flush_interval,
        )));

        for id in 0..self.config.workers {
            tasks.push(tokio::spawn(work(
                id,
                Arc::clone(&batch_rx),
                Arc::clone(&self.processor),
                Arc::clone(&self.counters),
                cancel.clone(),
            )));
        }
        debug!("Worker pool started with {} workers", self.config.workers);

        *lock(&self.running) = Some(Running { cancel, tasks });
        Ok(())
    }

    /// Closes intake, flushes buffered events to the workers and waits for every task to
    /// exit. Calling it again, or on a pool that never started, does nothing.
    pub async fn stop(&self) {
        let Some(running) = lock(&self.running).take() else {
            return;
        };
        running.cancel.cancel();
        for task in running.tasks {
            if let Err(e) = task.await {
                error!("Worker pool task failed: {}", e);
            }
        }
        debug!("Worker pool stopped");
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            processed: self.counters.processed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            last_batch_duration: Duration::from_micros(
                self.counters.last_batch_micros.load(Ordering::Relaxed),
            ),
        }
    }
}

struct Aggregator {
    batch: Batch,
    bytes: usize,
    batch_size: usize,
    max_batch_bytes: usize,
    batch_tx: mpsc::Sender<Batch>,
}

impl Aggregator {
    async fn run(
        mut self,
        mut intake_rx: mpsc::Receiver<Event>,
        cancel: CancellationToken,
        flush_interval: Duration,
    ) {
        let mut ticker = tokio::time::interval(flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                event = intake_rx.recv() => match event {
                    Some(event) => self.push(event).await,
                    None => break,
                },
                _ = ticker.tick() => self.flush().await,
            }
        }

        // Refuse new events, then hand everything already accepted to the workers.
        intake_rx.close();
        while let Some(event) = intake_rx.recv().await {
            self.push(event).await;
        }
        self.flush().await;
        debug!("Batch aggregator stopped");
    }

    /// Adds `event`, first flushing the current batch if the event would push its serialized
    /// size past the byte cap. An event larger than the cap on its own is shipped alone.
    async fn push(&mut self, event: Event) {
        let size = event.size();
        if !self.batch.is_empty() && self.bytes_with(size) > self.max_batch_bytes {
            self.flush().await;
        }
        self.bytes = self.bytes_with(size);
        self.batch.push(event);
        if self.batch.len() >= self.batch_size || self.bytes >= self.max_batch_bytes {
            self.flush().await;
        }
    }

    /// Serialized size of the current batch once an event of `size` bytes is added.
    fn bytes_with(&self, size: usize) -> usize {
        if self.batch.is_empty() {
            event::batch_size([size])
        } else {
            // One separator before the new element.
            self.bytes.saturating_add(size).saturating_add(1)
        }
    }

    async fn flush(&mut self) {
        if self.batch.is_empty() {
            return;
        }
        let batch = std::mem::replace(&mut self.batch, Vec::with_capacity(self.batch_size));
        self.bytes = 0;
        if let Err(e) = self.batch_tx.send(batch).await {
            error!("No workers left, dropping batch of {} events", e.0.len());
        }
    }
}

async fn work(
    id: usize,
    batch_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Batch>>>,
    processor: Arc<dyn Processor>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
) {
    loop {
        let next = batch_rx.lock().await.recv().await;
        let Some(batch) = next else {
            break;
        };

        let started = Instant::now();
        match processor.process(&cancel, &batch).await {
            Ok(()) => {
                counters
                    .processed
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
            }
            Err(e) => {
                counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!("Worker {} failed to process {} events: {}", id, batch.len(), e);
            }
        }
        let elapsed = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
        counters.last_batch_micros.store(elapsed, Ordering::Relaxed);
    }
    debug!("Worker {} stopped", id);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingProcessor {
        batches: Mutex<Vec<usize>>,
        /// Largest of the spilled and shipped JSON encodings of each batch.
        encoded_bytes: Mutex<Vec<usize>>,
        fail: bool,
    }

    #[async_trait]
    impl Processor for RecordingProcessor {
        async fn process(
            &self,
            _cancel: &CancellationToken,
            batch: &[Event],
        ) -> Result<(), ProcessError> {
            self.batches.lock().expect("lock poisoned").push(batch.len());
            let spilled = serde_json::to_vec(batch).expect("serialize failed").len();
            let entries: Vec<_> = batch.iter().map(Event::log_entry).collect();
            let shipped = serde_json::to_vec(&entries).expect("serialize failed").len();
            self.encoded_bytes
                .lock()
                .expect("lock poisoned")
                .push(spilled.max(shipped));
            if self.fail {
                Err(ProcessError::Other("sink down".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn config(batch_size: usize, queue_depth: usize) -> WorkerPoolConfig {
        WorkerPoolConfig {
            workers: 2,
            queue_depth,
            batch_queue_depth: 4,
            batch_size,
            max_batch_bytes: 1024 * 1024,
            flush_interval: Duration::from_millis(50),
        }
    }

    fn event(i: usize) -> Event {
        Event::new(format!("event-{i}"), "test")
    }

    async fn wait_for(pool: &WorkerPool, predicate: impl Fn(&PoolStats) -> bool) {
        for _ in 0..200 {
            if predicate(&pool.stats()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached, stats: {:?}", pool.stats());
    }

    #[tokio::test]
    async fn test_submit_drops_when_queue_full() {
        let pool = WorkerPool::new(config(10, 5), Arc::new(RecordingProcessor::default()));

        let accepted = (0..8).filter(|i| pool.submit(event(*i))).count();

        assert_eq!(accepted, 5);
        let stats = pool.stats();
        assert_eq!(stats.dropped, 3);
        assert_eq!(stats.processed, 0);
    }

    #[tokio::test]
    async fn test_events_processed_in_bounded_batches() {
        let processor = Arc::new(RecordingProcessor::default());
        let pool = WorkerPool::new(config(10, 100), processor.clone());
        let cancel = CancellationToken::new();
        pool.start(&cancel).expect("start failed");

        for i in 0..25 {
            assert!(pool.submit(event(i)));
        }
        wait_for(&pool, |stats| stats.processed == 25).await;
        pool.stop().await;

        let batches = processor.batches.lock().expect("lock poisoned").clone();
        assert!(batches.iter().all(|len| *len <= 10), "{batches:?}");
        assert_eq!(batches.iter().sum::<usize>(), 25);
        assert_eq!(pool.stats().errors, 0);
    }

    #[tokio::test]
    async fn test_serialized_batches_stay_within_byte_cap() {
        let processor = Arc::new(RecordingProcessor::default());
        let pool = WorkerPool::new(
            WorkerPoolConfig {
                max_batch_bytes: 200,
                ..config(100, 100)
            },
            processor.clone(),
        );
        pool.start(&CancellationToken::new()).expect("start failed");

        for i in 0..50 {
            assert!(pool.submit(Event::new(format!("e{i}"), "test")));
        }
        wait_for(&pool, |stats| stats.processed == 50).await;
        pool.stop().await;

        let encoded = processor.encoded_bytes.lock().expect("lock poisoned").clone();
        assert!(encoded.len() > 1);
        assert!(encoded.iter().all(|bytes| *bytes <= 200), "{encoded:?}");
    }

    #[tokio::test]
    async fn test_event_larger_than_byte_cap_ships_alone() {
        let processor = Arc::new(RecordingProcessor::default());
        let pool = WorkerPool::new(
            WorkerPoolConfig {
                max_batch_bytes: 100,
                flush_interval: Duration::from_secs(3600),
                ..config(100, 100)
            },
            processor.clone(),
        );
        pool.start(&CancellationToken::new()).expect("start failed");

        assert!(pool.submit(event(0)));
        assert!(pool.submit(Event::new("x".repeat(500), "test")));
        assert!(pool.submit(event(1)));
        pool.stop().await;

        assert_eq!(*processor.batches.lock().expect("lock poisoned"), vec![1, 1, 1]);
        assert_eq!(pool.stats().processed, 3);
    }

    #[tokio::test]
    async fn test_failed_batches_count_errors() {
        let processor = Arc::new(RecordingProcessor {
            fail: true,
            ..RecordingProcessor::default()
        });
        let pool = WorkerPool::new(config(10, 100), processor);
        pool.start(&CancellationToken::new()).expect("start failed");

        for i in 0..20 {
            assert!(pool.submit(event(i)));
        }
        wait_for(&pool, |stats| stats.errors == 2).await;
        pool.stop().await;

        let stats = pool.stats();
        assert_eq!(stats.processed, 0);
        assert_eq!(stats.dropped, 0);
    }

    #[tokio::test]
    async fn test_stop_flushes_partial_batch() {
        let processor = Arc::new(RecordingProcessor::default());
        let pool = WorkerPool::new(
            WorkerPoolConfig {
                flush_interval: Duration::from_secs(3600),
                ..config(100, 100)
            },
            processor.clone(),
        );
        pool.start(&CancellationToken::new()).expect("start failed");

        for i in 0..3 {
            assert!(pool.submit(event(i)));
        }
        pool.stop().await;

        assert_eq!(pool.stats().processed, 3);
        assert_eq!(*processor.batches.lock().expect("lock poisoned"), vec![3]);
    }

    #[tokio::test]
    async fn test_cancel_drains_and_closes_intake() {
        let processor = Arc::new(RecordingProcessor::default());
        let pool = WorkerPool::new(
            WorkerPoolConfig {
                flush_interval: Duration::from_secs(3600),
                ..config(100, 100)
            },
            processor,
        );
        let cancel = CancellationToken::new();
        pool.start(&cancel).expect("start failed");
        assert!(pool.submit(event(0)));

        cancel.cancel();
        wait_for(&pool, |stats| stats.processed == 1).await;
        pool.stop().await;

        assert!(!pool.submit(event(1)));
        assert_eq!(pool.stats().dropped, 1);
    }

    #[tokio::test]
    async fn test_start_twice_fails_and_stop_is_idempotent() {
        let pool = WorkerPool::new(config(10, 10), Arc::new(RecordingProcessor::default()));
        let cancel = CancellationToken::new();
        pool.start(&cancel).expect("start failed");
        assert!(matches!(pool.start(&cancel), Err(PoolError::AlreadyStarted)));

        pool.stop().await;
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_last_batch_duration_recorded() {
        struct SlowProcessor;

        #[async_trait]
        impl Processor for SlowProcessor {
            async fn process(
                &self,
                _cancel: &CancellationToken,
                _batch: &[Event],
            ) -> Result<(), ProcessError> {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(())
            }
        }

        let pool = WorkerPool::new(config(1, 10), Arc::new(SlowProcessor));
        pool.start(&CancellationToken::new()).expect("start failed");
        assert!(pool.submit(event(0)));
        wait_for(&pool, |stats| stats.processed == 1).await;
        pool.stop().await;

        assert!(pool.stats().last_batch_duration >= Duration::from_millis(20));
    }
}
