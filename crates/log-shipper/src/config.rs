// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::collector::CollectorConfig;
use crate::delivery::RetryStrategy;
use crate::errors::ConfigError;
use crate::http_sink::HttpSinkConfig;
use crate::listener::{AllowList, ListenerConfig};
use crate::pool::WorkerPoolConfig;
use crate::spill::SpillConfig;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_SITE: &str = "datadoghq.com";

/// Configuration for the whole shipping pipeline, read from `DD_*` environment variables.
#[derive(Debug, Clone)]
pub struct ShipperConfig {
    /// Datadog API key sent with every request
    pub api_key: Option<String>,
    /// Datadog site, used to build the default intake URL
    pub site: String,
    /// Intake URL override
    pub url: Option<String>,
    /// HTTPS proxy URL
    pub https_proxy: Option<String>,

    pub listen_host: String,
    pub listen_port: u16,
    /// CIDR blocks or addresses allowed to connect; empty allows everyone
    pub allow_list: Vec<String>,
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
    pub max_line_bytes: usize,

    pub collector_batch_size: usize,
    pub collector_flush_interval: Duration,
    pub collector_max_pending_batches: usize,

    pub workers: usize,
    pub queue_depth: usize,
    pub batch_size: usize,
    pub max_batch_bytes: usize,
    pub flush_interval: Duration,

    pub breaker_max_failures: u32,
    pub breaker_timeout: Duration,
    pub breaker_successes_required: u32,
    pub retry_strategy: RetryStrategy,

    pub request_timeout: Duration,
    pub use_compression: bool,
    pub compression_level: i32,

    /// Spill directory; `None` disables spilling
    pub spill_dir: Option<PathBuf>,
    pub spill_max_bytes: u64,
    pub spill_segment_bytes: u64,
    pub replay_interval: Duration,

    /// How often the binary logs pipeline counters
    pub stats_interval: Duration,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ShipperConfig {
    fn default() -> Self {
        let listener = ListenerConfig::default();
        let collector = CollectorConfig::default();
        let pool = WorkerPoolConfig::default();
        let breaker = CircuitBreakerConfig::default();
        let sink = HttpSinkConfig::default();
        let spill = SpillConfig::default();
        Self {
            api_key: None,
            site: DEFAULT_SITE.to_string(),
            url: None,
            https_proxy: None,
            listen_host: listener.host,
            listen_port: listener.port,
            allow_list: listener.allow_list,
            tls_cert_path: None,
            tls_key_path: None,
            max_line_bytes: listener.max_line_bytes,
            collector_batch_size: collector.max_batch_size,
            collector_flush_interval: collector.flush_interval,
            collector_max_pending_batches: collector.max_pending_batches,
            workers: pool.workers,
            queue_depth: pool.queue_depth,
            batch_size: pool.batch_size,
            max_batch_bytes: pool.max_batch_bytes,
            flush_interval: pool.flush_interval,
            breaker_max_failures: breaker.max_failures,
            breaker_timeout: breaker.timeout,
            breaker_successes_required: breaker.successes_required,
            retry_strategy: RetryStrategy::default(),
            request_timeout: sink.timeout,
            use_compression: true,
            compression_level: 3,
            spill_dir: Some(spill.dir),
            spill_max_bytes: spill.max_bytes,
            spill_segment_bytes: spill.max_segment_bytes,
            replay_interval: Duration::from_secs(10),
            stats_interval: Duration::from_secs(60),
            log_level: "info".to_string(),
        }
    }
}

fn var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|val| !val.trim().is_empty())
}

fn parse_or<T: FromStr>(name: &str, default: T) -> T {
    var(name)
        .and_then(|val| val.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn millis_or(name: &str, default: Duration) -> Duration {
    var(name)
        .and_then(|val| val.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}

fn bool_or(name: &str, default: bool) -> bool {
    var(name).map_or(default, |val| {
        !matches!(val.trim().to_lowercase().as_str(), "false" | "0" | "no")
    })
}

impl ShipperConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let retry_strategy = match var("DD_SHIPPER_RETRY_STRATEGY") {
            Some(val) => val.parse::<RetryStrategy>().map_err(ConfigError::InvalidConfig)?,
            None => defaults.retry_strategy,
        };
        let spill_dir = if bool_or("DD_SHIPPER_SPILL_ENABLED", true) {
            var("DD_SHIPPER_SPILL_DIR")
                .map(PathBuf::from)
                .or(defaults.spill_dir)
        } else {
            None
        };

        let config = Self {
            api_key: var("DD_API_KEY"),
            site: var("DD_SITE").unwrap_or(defaults.site),
            url: var("DD_SHIPPER_URL"),
            https_proxy: var("DD_PROXY_HTTPS").or_else(|| var("HTTPS_PROXY")),
            listen_host: var("DD_SHIPPER_HOST").unwrap_or(defaults.listen_host),
            listen_port: parse_or("DD_SHIPPER_PORT", defaults.listen_port),
            allow_list: var("DD_SHIPPER_ALLOW_LIST")
                .map(|val| {
                    val.split(',')
                        .map(str::trim)
                        .filter(|entry| !entry.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            tls_cert_path: var("DD_SHIPPER_TLS_CERT").map(PathBuf::from),
            tls_key_path: var("DD_SHIPPER_TLS_KEY").map(PathBuf::from),
            max_line_bytes: parse_or("DD_SHIPPER_MAX_LINE_BYTES", defaults.max_line_bytes),
            collector_batch_size: parse_or(
                "DD_SHIPPER_COLLECTOR_BATCH_SIZE",
                defaults.collector_batch_size,
            ),
            collector_flush_interval: millis_or(
                "DD_SHIPPER_COLLECTOR_FLUSH_MS",
                defaults.collector_flush_interval,
            ),
            collector_max_pending_batches: parse_or(
                "DD_SHIPPER_COLLECTOR_MAX_PENDING",
                defaults.collector_max_pending_batches,
            ),
            workers: parse_or("DD_SHIPPER_WORKERS", defaults.workers),
            queue_depth: parse_or("DD_SHIPPER_QUEUE_DEPTH", defaults.queue_depth),
            batch_size: parse_or("DD_SHIPPER_BATCH_SIZE", defaults.batch_size),
            max_batch_bytes: parse_or("DD_SHIPPER_MAX_BATCH_BYTES", defaults.max_batch_bytes),
            flush_interval: millis_or("DD_SHIPPER_FLUSH_INTERVAL_MS", defaults.flush_interval),
            breaker_max_failures: parse_or(
                "DD_SHIPPER_BREAKER_MAX_FAILURES",
                defaults.breaker_max_failures,
            ),
            breaker_timeout: millis_or("DD_SHIPPER_BREAKER_TIMEOUT_MS", defaults.breaker_timeout),
            breaker_successes_required: parse_or(
                "DD_SHIPPER_BREAKER_SUCCESSES",
                defaults.breaker_successes_required,
            ),
            retry_strategy,
            request_timeout: millis_or("DD_SHIPPER_REQUEST_TIMEOUT_MS", defaults.request_timeout),
            use_compression: bool_or("DD_SHIPPER_USE_COMPRESSION", defaults.use_compression),
            compression_level: parse_or(
                "DD_SHIPPER_COMPRESSION_LEVEL",
                defaults.compression_level,
            ),
            spill_dir,
            spill_max_bytes: parse_or("DD_SHIPPER_SPILL_MAX_BYTES", defaults.spill_max_bytes),
            spill_segment_bytes: parse_or(
                "DD_SHIPPER_SPILL_SEGMENT_BYTES",
                defaults.spill_segment_bytes,
            ),
            replay_interval: millis_or("DD_SHIPPER_REPLAY_INTERVAL_MS", defaults.replay_interval),
            stats_interval: var("DD_SHIPPER_STATS_INTERVAL_SECS")
                .and_then(|val| val.trim().parse::<u64>().ok())
                .map_or(defaults.stats_interval, Duration::from_secs),
            log_level: var("DD_LOG_LEVEL")
                .map(|val| val.to_lowercase())
                .unwrap_or(defaults.log_level),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::InvalidConfig(msg.to_string()));

        if self.listen_port == 0 {
            return invalid("listener port must be greater than 0");
        }
        if self.site.trim().is_empty() {
            return invalid("DD_SITE cannot be empty");
        }
        if let Some(url) = &self.url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::InvalidConfig(format!(
                    "intake URL '{url}' must start with http:// or https://"
                )));
            }
        }
        if self.tls_cert_path.is_some() != self.tls_key_path.is_some() {
            return invalid("TLS requires both DD_SHIPPER_TLS_CERT and DD_SHIPPER_TLS_KEY");
        }
        AllowList::parse(&self.allow_list)
            .map_err(|e| ConfigError::InvalidConfig(e.to_string()))?;

        if self.max_line_bytes == 0 {
            return invalid("max line length must be greater than 0");
        }
        if self.collector_batch_size == 0 || self.batch_size == 0 {
            return invalid("batch sizes must be greater than 0");
        }
        if self.collector_max_pending_batches == 0 {
            return invalid("collector pending batch limit must be greater than 0");
        }
        if self.workers == 0 {
            return invalid("at least one worker is required");
        }
        if self.queue_depth == 0 {
            return invalid("queue depth must be greater than 0");
        }
        if self.max_batch_bytes == 0 {
            return invalid("max batch bytes must be greater than 0");
        }
        if self.flush_interval.is_zero() || self.collector_flush_interval.is_zero() {
            return invalid("flush intervals must be greater than 0");
        }
        if self.breaker_max_failures == 0 || self.breaker_successes_required == 0 {
            return invalid("circuit breaker thresholds must be greater than 0");
        }
        if self.use_compression && !(1..=22).contains(&self.compression_level) {
            return Err(ConfigError::InvalidConfig(format!(
                "Invalid compression level {}. Must be between 1 and 22",
                self.compression_level
            )));
        }
        if self.spill_dir.is_some() {
            if self.spill_max_bytes == 0 || self.spill_segment_bytes == 0 {
                return invalid("spill sizes must be greater than 0");
            }
            if self.replay_interval.is_zero() {
                return invalid("replay interval must be greater than 0");
            }
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(ConfigError::InvalidConfig(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }

    /// Intake URL: the explicit override, or the logs intake for `site`.
    #[must_use]
    pub fn intake_url(&self) -> String {
        self.url
            .clone()
            .unwrap_or_else(|| format!("https://http-intake.logs.{}/api/v2/logs", self.site))
    }

    #[must_use]
    pub fn listener_config(&self) -> ListenerConfig {
        ListenerConfig {
            host: self.listen_host.clone(),
            port: self.listen_port,
            allow_list: self.allow_list.clone(),
            tls_cert_path: self.tls_cert_path.clone(),
            tls_key_path: self.tls_key_path.clone(),
            max_line_bytes: self.max_line_bytes,
        }
    }

    #[must_use]
    pub fn collector_config(&self) -> CollectorConfig {
        CollectorConfig {
            max_batch_size: self.collector_batch_size,
            flush_interval: self.collector_flush_interval,
            max_pending_batches: self.collector_max_pending_batches,
        }
    }

    #[must_use]
    pub fn pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            workers: self.workers,
            queue_depth: self.queue_depth,
            batch_queue_depth: self.workers * 2,
            batch_size: self.batch_size,
            max_batch_bytes: self.max_batch_bytes,
            flush_interval: self.flush_interval,
        }
    }

    #[must_use]
    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            max_failures: self.breaker_max_failures,
            timeout: self.breaker_timeout,
            successes_required: self.breaker_successes_required,
        }
    }

    #[must_use]
    pub fn http_sink_config(&self) -> HttpSinkConfig {
        HttpSinkConfig {
            url: self.intake_url(),
            api_key: self.api_key.clone(),
            timeout: self.request_timeout,
            compression_level: self.use_compression.then_some(self.compression_level),
            https_proxy: self.https_proxy.clone(),
        }
    }

    /// `None` when spilling is disabled.
    #[must_use]
    pub fn spill_config(&self) -> Option<SpillConfig> {
        self.spill_dir.as_ref().map(|dir| SpillConfig {
            dir: dir.clone(),
            max_bytes: self.spill_max_bytes,
            max_segment_bytes: self.spill_segment_bytes,
            compression_level: self.compression_level,
        })
    }
}
