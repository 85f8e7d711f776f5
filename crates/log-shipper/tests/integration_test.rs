// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use log_shipper::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use log_shipper::collector::{BatchCollector, CollectorConfig};
use log_shipper::delivery::{DeliveryClient, RetryStrategy, Sink};
use log_shipper::errors::{CircuitError, SinkError};
use log_shipper::event::Event;
use log_shipper::http_sink::{HttpSink, HttpSinkConfig, API_KEY_HEADER};
use log_shipper::listener::{IngestListener, ListenerConfig, MessageHandler};
use log_shipper::pool::{WorkerPool, WorkerPoolConfig};
use log_shipper::shipping::ShippingProcessor;
use log_shipper::spill::{SpillConfig, SpillQueue};
use mockito::{Matcher, Server};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// Answers every attempt with 503.
#[derive(Default)]
struct UnavailableSink {
    attempts: AtomicU64,
}

#[async_trait]
impl Sink for UnavailableSink {
    async fn send(&self, _batch: &[Event]) -> Result<(), SinkError> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        Err(SinkError::Status {
            status: 503,
            body: "Service Unavailable".to_string(),
        })
    }
}

async fn wait_until(what: &str, mut predicate: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !predicate() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn http_sink(server: &Server) -> HttpSink {
    HttpSink::new(HttpSinkConfig {
        url: format!("{}/api/v2/logs", server.url()),
        api_key: Some("integration-key".to_string()),
        timeout: Duration::from_secs(2),
        compression_level: None,
        https_proxy: None,
    })
    .expect("failed to build sink")
}

#[tokio::test]
async fn test_failing_sink_spills_every_batch() {
    let dir = tempfile::tempdir().expect("tempdir");
    let spill = Arc::new(
        SpillQueue::open(SpillConfig {
            dir: dir.path().join("intake"),
            ..SpillConfig::default()
        })
        .await
        .expect("open failed"),
    );
    let sink = Arc::new(UnavailableSink::default());
    let processor = Arc::new(ShippingProcessor::new(
        DeliveryClient::new(Arc::clone(&sink), RetryStrategy::Immediate(0)),
        CircuitBreaker::new("intake", CircuitBreakerConfig::default()),
        Some(Arc::clone(&spill)),
    ));
    let pool = WorkerPool::new(
        WorkerPoolConfig {
            workers: 2,
            queue_depth: 2000,
            batch_queue_depth: 4,
            batch_size: 1000,
            max_batch_bytes: 10 * 1024 * 1024,
            flush_interval: Duration::from_millis(100),
        },
        processor.clone(),
    );
    let cancel = CancellationToken::new();
    pool.start(&cancel).expect("start failed");

    for i in 0..1500 {
        assert!(pool.submit(Event::new(format!("event {i}"), "integration")));
    }
    wait_until("two failed batches", || pool.stats().errors >= 2).await;
    pool.stop().await;

    let stats = pool.stats();
    assert_eq!(stats.processed, 0);
    assert!(stats.errors >= 2);
    assert_eq!(stats.dropped, 0);
    assert_eq!(spill.stats().appended, 2);
    assert_eq!(processor.stats().spilled, 2);
    assert_eq!(sink.attempts.load(Ordering::Relaxed), 2);
}

#[tokio::test]
async fn test_circuit_breaker_recovers_after_timeout() {
    let breaker = CircuitBreaker::new(
        "recovering",
        CircuitBreakerConfig {
            max_failures: 3,
            timeout: Duration::from_secs(1),
            successes_required: 2,
        },
    );
    let mut states = vec![breaker.state()];

    for _ in 0..3 {
        let result = breaker.execute(|| async { Err::<(), _>("boom") }).await;
        assert_eq!(result, Err(CircuitError::Call("boom")));
    }
    states.push(breaker.state());

    let rejected = breaker.execute(|| async { Ok::<_, &str>(()) }).await;
    assert_eq!(rejected, Err(CircuitError::Open));

    tokio::time::sleep(Duration::from_millis(1100)).await;

    breaker
        .execute(|| async { Ok::<_, &str>(()) })
        .await
        .expect("trial call should run");
    states.push(breaker.state());
    breaker
        .execute(|| async { Ok::<_, &str>(()) })
        .await
        .expect("trial call should run");
    states.push(breaker.state());

    assert_eq!(
        states,
        vec![
            CircuitState::Closed,
            CircuitState::Open,
            CircuitState::HalfOpen,
            CircuitState::Closed
        ]
    );
    let stats = breaker.stats();
    assert_eq!(stats.total_calls, 6);
    assert_eq!(stats.total_rejects, 1);
}

#[tokio::test]
async fn test_rate_limited_request_backs_off() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/api/v2/logs")
        .with_status(429)
        .expect(3)
        .create_async()
        .await;
    let client = DeliveryClient::new(http_sink(&server), RetryStrategy::LinearBackoff(2, 50));

    let started = Instant::now();
    let result = client.send(&[Event::new("line", "integration")]).await;

    assert!(result.is_err());
    assert!(started.elapsed() >= Duration::from_millis(150));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_lines_flow_from_socket_to_intake() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/api/v2/logs")
        .match_header(API_KEY_HEADER, "integration-key")
        .with_status(202)
        .expect_at_least(1)
        .create_async()
        .await;

    let processor = Arc::new(ShippingProcessor::new(
        DeliveryClient::new(http_sink(&server), RetryStrategy::Immediate(0)),
        CircuitBreaker::new("intake", CircuitBreakerConfig::default()),
        None,
    ));
    let pool = Arc::new(WorkerPool::new(
        WorkerPoolConfig {
            flush_interval: Duration::from_millis(20),
            ..WorkerPoolConfig::default()
        },
        processor.clone(),
    ));
    let submitter = Arc::clone(&pool);
    let collector = Arc::new(BatchCollector::new(
        CollectorConfig {
            max_batch_size: 10,
            flush_interval: Duration::from_millis(20),
            ..CollectorConfig::default()
        },
        move |lines: Vec<String>| {
            for line in lines {
                submitter.submit(Event::new(line, "tcp"));
            }
        },
    ));
    let handler: Arc<dyn MessageHandler> = collector.clone();
    let listener = IngestListener::new(
        ListenerConfig {
            port: 0,
            ..ListenerConfig::default()
        },
        handler,
    )
    .expect("listener config");

    let cancel = CancellationToken::new();
    pool.start(&cancel).expect("pool start failed");
    collector.start(&cancel);
    let addr = listener.start(&cancel).await.expect("listener start failed");

    let mut client = TcpStream::connect(addr).await.expect("connect failed");
    client
        .write_all(b"hello from tcp\r\nsecond line\n\nthird line\n")
        .await
        .expect("write failed");
    client.shutdown().await.expect("shutdown failed");

    wait_until("three delivered events", || processor.stats().delivered == 3).await;

    listener.stop().await;
    collector.stop().await;
    pool.stop().await;

    assert_eq!(listener.stats().messages, 3);
    assert_eq!(pool.stats().processed, 3);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_spilled_batches_replay_after_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let spill_config = SpillConfig {
        dir: dir.path().join("intake"),
        ..SpillConfig::default()
    };

    {
        let spill = Arc::new(SpillQueue::open(spill_config.clone()).await.expect("open failed"));
        let processor = ShippingProcessor::new(
            DeliveryClient::new(UnavailableSink::default(), RetryStrategy::Immediate(0)),
            CircuitBreaker::new("intake", CircuitBreakerConfig::default()),
            Some(spill),
        );
        for n in [3, 4] {
            let batch: Vec<Event> = (0..n)
                .map(|i| Event::new(format!("before restart {i}"), "integration"))
                .collect();
            let _ = log_shipper::pool::Processor::process(
                &processor,
                &CancellationToken::new(),
                &batch,
            )
            .await;
        }
        assert_eq!(processor.stats().spilled, 2);
    }

    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/api/v2/logs")
        .match_body(Matcher::Regex("before restart".to_string()))
        .with_status(200)
        .expect(2)
        .create_async()
        .await;

    let spill = Arc::new(SpillQueue::open(spill_config).await.expect("reopen failed"));
    assert!(!spill.is_empty());
    let processor = Arc::new(ShippingProcessor::new(
        DeliveryClient::new(http_sink(&server), RetryStrategy::Immediate(0)),
        CircuitBreaker::new("intake", CircuitBreakerConfig::default()),
        Some(Arc::clone(&spill)),
    ));

    let cancel = CancellationToken::new();
    let replay = processor
        .start_replay(Duration::from_millis(20), cancel.clone())
        .expect("spill configured");

    wait_until("spill to drain", || spill.is_empty()).await;
    cancel.cancel();
    replay.await.expect("replay task panicked");

    assert_eq!(processor.stats().delivered, 7);
    assert_eq!(spill.stats().replayed, 2);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_spill_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let spill = SpillQueue::open(SpillConfig {
        dir: dir.path().to_path_buf(),
        ..SpillConfig::default()
    })
    .await
    .expect("open failed");

    for n in 1..=5 {
        let batch: Vec<Event> = (0..n).map(|i| Event::new(format!("{i}"), "rt")).collect();
        spill.append(&batch).await.expect("append failed");
    }
    let size = spill.size_bytes();

    let failed = spill
        .replay(|_| async { Err::<(), _>("still down") })
        .await;
    assert!(failed.is_err());
    assert_eq!(spill.size_bytes(), size);

    let mut lengths = Vec::new();
    let delivered = spill
        .replay(|batch| {
            lengths.push(batch.len());
            async { Ok::<(), &str>(()) }
        })
        .await
        .expect("replay failed");

    assert_eq!(delivered, 5);
    assert_eq!(lengths, vec![1, 2, 3, 4, 5]);
    assert_eq!(spill.size_bytes(), 0);
}
