// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP log intake sink.
//!
//! Each batch is POSTed as a JSON array, optionally zstd-compressed, with the API key in a
//! request header. Any 2xx response counts as delivered; other statuses are reported as
//! [`SinkError::Status`] so the delivery client can decide whether to retry.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE};
use std::time::Duration;
use tracing::{debug, error};

use crate::delivery::Sink;
use crate::errors::SinkError;
use crate::event::{Event, LogEntry};

pub const API_KEY_HEADER: &str = "DD-API-KEY";

/// Longest response body kept in a [`SinkError::Status`].
const MAX_ERROR_BODY_LEN: usize = 512;

#[derive(Debug, Clone)]
pub struct HttpSinkConfig {
    /// Full intake URL, e.g. `https://http-intake.logs.datadoghq.com/api/v2/logs`.
    pub url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    /// zstd level; `None` sends uncompressed JSON.
    pub compression_level: Option<i32>,
    pub https_proxy: Option<String>,
}

impl Default for HttpSinkConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            api_key: None,
            timeout: Duration::from_secs(5),
            compression_level: Some(3),
            https_proxy: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpSink {
    client: reqwest::Client,
    url: String,
    headers: HeaderMap,
    compression_level: Option<i32>,
}

impl HttpSink {
    pub fn new(config: HttpSinkConfig) -> Result<Self, SinkError> {
        let mut builder = reqwest::Client::builder().timeout(config.timeout);
        if let Some(proxy) = &config.https_proxy {
            let proxy = reqwest::Proxy::https(proxy)
                .map_err(|e| SinkError::Config(format!("invalid proxy '{proxy}': {e}")))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| SinkError::Config(format!("failed to build HTTP client: {e}")))?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(api_key) = &config.api_key {
            let value = HeaderValue::from_str(api_key)
                .map_err(|e| SinkError::Config(format!("invalid API key header: {e}")))?;
            headers.insert(API_KEY_HEADER, value);
        }
        if config.compression_level.is_some() {
            headers.insert(CONTENT_ENCODING, HeaderValue::from_static("zstd"));
        }

        Ok(HttpSink {
            client,
            url: config.url,
            headers,
            compression_level: config.compression_level,
        })
    }

    /// Serializes `batch` into the request body, compressing it when configured.
    pub fn encode(&self, batch: &[Event]) -> Result<Vec<u8>, SinkError> {
        let entries: Vec<LogEntry<'_>> = batch.iter().map(Event::log_entry).collect();
        let body = serde_json::to_vec(&entries).map_err(|e| SinkError::Payload(e.to_string()))?;

        match self.compression_level {
            Some(level) => zstd::stream::encode_all(body.as_slice(), level)
                .map_err(|e| SinkError::Payload(format!("failed to compress payload: {e}"))),
            None => Ok(body),
        }
    }
}

#[async_trait]
impl Sink for HttpSink {
    async fn send(&self, batch: &[Event]) -> Result<(), SinkError> {
        let body = self.encode(batch)?;
        debug!("Posting {} events ({} bytes) to {}", batch.len(), body.len(), self.url);

        let resp = self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .body(body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }

        let mut body = resp.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY_LEN {
            let mut end = MAX_ERROR_BODY_LEN;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            body.truncate(end);
        }
        error!("{}: Failed to push logs to {}: {:?}", status, self.url, body);
        Err(SinkError::Status {
            status: status.as_u16(),
            body,
        })
    }

    fn name(&self) -> &str {
        &self.url
    }
}

fn transport_error(e: reqwest::Error) -> SinkError {
    if e.is_timeout() {
        SinkError::Transport(format!("request timed out: {e}"))
    } else if e.is_connect() {
        SinkError::Transport(format!("connection error: {e}"))
    } else {
        SinkError::Transport(e.to_string())
    }
}
