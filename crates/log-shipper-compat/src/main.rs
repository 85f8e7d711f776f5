// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, sync::Arc};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use log_shipper::{
    circuit_breaker::CircuitBreaker,
    collector::BatchCollector,
    config::ShipperConfig,
    delivery::DeliveryClient,
    event::Event,
    http_sink::HttpSink,
    listener::IngestListener,
    pool::WorkerPool,
    shipping::ShippingProcessor,
    spill::SpillQueue,
};

const EVENT_SOURCE: &str = "tcp";

#[tokio::main]
pub async fn main() {
    let log_level = env::var("DD_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = match ShipperConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Error loading log shipper configuration: {e}");
            return;
        }
    };
    if config.api_key.is_none() {
        warn!("DD_API_KEY not set, the intake will reject shipped logs");
    }

    let sink = match HttpSink::new(config.http_sink_config()) {
        Ok(sink) => sink,
        Err(e) => {
            error!("Error creating HTTP sink: {e}");
            return;
        }
    };

    let spill = match config.spill_config() {
        Some(spill_config) => match SpillQueue::open(spill_config).await {
            Ok(queue) => {
                info!("Spilling undeliverable batches to {}", queue.dir().display());
                Some(Arc::new(queue))
            }
            Err(e) => {
                error!("Error opening spill queue: {e}");
                return;
            }
        },
        None => {
            info!("Spill queue disabled, undeliverable batches will be dropped");
            None
        }
    };

    let processor = Arc::new(ShippingProcessor::new(
        DeliveryClient::new(sink, config.retry_strategy),
        CircuitBreaker::new(config.intake_url(), config.breaker_config()),
        spill,
    ));

    let cancel = CancellationToken::new();

    let pool = Arc::new(WorkerPool::new(config.pool_config(), processor.clone()));
    if let Err(e) = pool.start(&cancel) {
        error!("Error starting worker pool: {e}");
        return;
    }

    let replay_cancel = CancellationToken::new();
    let replay = processor.start_replay(config.replay_interval, replay_cancel.clone());

    let submitter = Arc::clone(&pool);
    let collector = Arc::new(BatchCollector::new(
        config.collector_config(),
        move |lines: Vec<String>| {
            for line in lines {
                submitter.submit(Event::new(line, EVENT_SOURCE));
            }
        },
    ));
    collector.start(&cancel);

    let listener = match IngestListener::new(config.listener_config(), collector.clone()) {
        Ok(listener) => listener,
        Err(e) => {
            error!("Error creating ingest listener: {e}");
            return;
        }
    };
    match listener.start(&cancel).await {
        Ok(addr) => info!("log-shipper: listening on {addr}"),
        Err(e) => {
            error!("Error starting ingest listener: {e}");
            return;
        }
    }

    let mut stats_interval = interval(config.stats_interval);
    stats_interval.tick().await; // discard first tick, which is instantaneous

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            res = &mut shutdown => {
                if let Err(e) = res {
                    error!("Error listening for shutdown signal: {e}");
                }
                break;
            }
            _ = stats_interval.tick() => {
                log_stats(&listener, &collector, &pool, &processor);
            }
        }
    }

    info!("Shutting down log shipper");
    listener.stop().await;
    collector.stop().await;
    pool.stop().await;
    replay_cancel.cancel();
    if let Some(replay) = replay {
        if let Err(e) = replay.await {
            error!("Spill replay task failed: {e}");
        }
    }
    log_stats(&listener, &collector, &pool, &processor);
}

fn log_stats<S>(
    listener: &IngestListener,
    collector: &BatchCollector,
    pool: &WorkerPool,
    processor: &ShippingProcessor<S>,
) where
    S: log_shipper::delivery::Sink + 'static,
{
    let listener_stats = listener.stats();
    let collector_stats = collector.stats();
    let pool_stats = pool.stats();
    let shipping_stats = processor.stats();
    let breaker_stats = processor.breaker().stats();
    info!(
        "listener: connections={} rejected={} messages={} truncated={}; \
         collector: batches={} dropped_messages={}; \
         pool: processed={} dropped={} errors={} last_batch={:?}; \
         shipping: delivered={} spilled={} spill_rejected={} permanent_failures={}; \
         circuit: state={} rejects={}",
        listener_stats.accepted,
        listener_stats.rejected,
        listener_stats.messages,
        listener_stats.truncated,
        collector_stats.flushed_batches,
        collector_stats.dropped_messages,
        pool_stats.processed,
        pool_stats.dropped,
        pool_stats.errors,
        pool_stats.last_batch_duration,
        shipping_stats.delivered,
        shipping_stats.spilled,
        shipping_stats.spill_rejected,
        shipping_stats.permanent_failures,
        breaker_stats.state,
        breaker_stats.total_rejects,
    );
    if let Some(spill) = processor.spill() {
        let spill_stats = spill.stats();
        debug!(
            "spill: size_bytes={} appended={} replayed={} rejected={} corrupted={}",
            spill_stats.size_bytes,
            spill_stats.appended,
            spill_stats.replayed,
            spill_stats.rejected,
            spill_stats.corrupted
        );
    }
}
