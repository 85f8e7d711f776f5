// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Event and batch types shared by every pipeline stage.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::io;
use std::time::{SystemTime, UNIX_EPOCH};

/// An ordered group of events delivered to a sink in one attempt.
pub type Batch = Vec<Event>;

/// Bytes a JSON array adds around its elements: `[` and `]`.
pub const ARRAY_OVERHEAD_BYTES: usize = 2;

/// A single log event: opaque payload bytes, the source it arrived from, and arrival
/// metadata.
///
/// Fields are private so an event cannot be mutated once it has been handed to the pipeline.
/// The payload is base64 when serialized, so arbitrary bytes survive a spill round trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    #[serde(with = "base64_payload")]
    payload: Vec<u8>,
    source: String,
    received_at_ms: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    metadata: BTreeMap<String, String>,
}

/// The shape of one event in an intake request body.
#[derive(Serialize)]
pub(crate) struct LogEntry<'a> {
    message: Cow<'a, str>,
    source: &'a str,
    timestamp: u64,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    attributes: &'a BTreeMap<String, String>,
}

impl Event {
    /// Creates an event stamped with the current wall-clock time.
    #[must_use]
    pub fn new(payload: impl Into<Vec<u8>>, source: impl Into<String>) -> Self {
        let received_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or_default();
        Event {
            payload: payload.into(),
            source: source.into(),
            received_at_ms,
            metadata: BTreeMap::new(),
        }
    }

    /// Adds an arrival metadata entry. Only usable while the event is still owned by its
    /// producer.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    #[must_use]
    pub fn received_at_ms(&self) -> u64 {
        self.received_at_ms
    }

    #[must_use]
    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub(crate) fn log_entry(&self) -> LogEntry<'_> {
        LogEntry {
            message: String::from_utf8_lossy(&self.payload),
            source: &self.source,
            timestamp: self.received_at_ms,
            attributes: &self.metadata,
        }
    }

    /// Bytes this event occupies in a serialized batch: the larger of its spill record and its
    /// intake request entry, before compression and without the array separator.
    #[must_use]
    pub fn size(&self) -> usize {
        json_len(self).max(json_len(&self.log_entry()))
    }
}

/// Serialized length of a JSON array holding events of the given [`Event::size`]s.
#[must_use]
pub fn batch_size(event_sizes: impl IntoIterator<Item = usize>) -> usize {
    let (count, total) = event_sizes
        .into_iter()
        .fold((0usize, 0usize), |(count, total), size| {
            (count + 1, total.saturating_add(size))
        });
    ARRAY_OVERHEAD_BYTES + total + count.saturating_sub(1)
}

#[derive(Default)]
struct ByteCounter(usize);

impl io::Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn json_len<T: Serialize>(value: &T) -> usize {
    let mut counter = ByteCounter::default();
    match serde_json::to_writer(&mut counter, value) {
        Ok(()) => counter.0,
        // Unmeasurable values are shipped in a batch of their own.
        Err(_) => usize::MAX,
    }
}

mod base64_payload {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(payload: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(payload))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_accessors() {
        let event = Event::new("hello", "tcp").with_metadata("peer", "127.0.0.1");
        assert_eq!(event.payload(), b"hello");
        assert_eq!(event.source(), "tcp");
        assert_eq!(event.metadata().get("peer").map(String::as_str), Some("127.0.0.1"));
        assert!(event.received_at_ms() > 0);
    }

    #[test]
    fn test_event_size_matches_largest_encoding() {
        let events = [
            Event::new("abcd", "src"),
            Event::new("needs \"escaping\"\n", "tcp").with_metadata("k", "vv"),
            Event::new(vec![0xff, 0xfe, 0x00], "bin"),
        ];
        for event in &events {
            let spilled = serde_json::to_vec(event).expect("serialize failed").len();
            let shipped = serde_json::to_vec(&event.log_entry())
                .expect("serialize failed")
                .len();
            assert_eq!(event.size(), spilled.max(shipped));
        }
    }

    #[test]
    fn test_batch_size_is_exact_for_json_arrays() {
        let batch: Batch = (0..5)
            .map(|i| Event::new(format!("line {i}"), "tcp").with_metadata("n", i.to_string()))
            .collect();
        let entries: Vec<LogEntry<'_>> = batch.iter().map(Event::log_entry).collect();

        let bound = batch_size(batch.iter().map(Event::size));
        assert!(serde_json::to_vec(&batch).expect("serialize failed").len() <= bound);
        assert!(serde_json::to_vec(&entries).expect("serialize failed").len() <= bound);
        assert_eq!(batch_size(std::iter::empty()), 2);
        assert_eq!(batch_size([10]), 12);
        assert_eq!(batch_size([10, 10]), 23);
    }

    #[test]
    fn test_event_serde_round_trips_binary_payload() {
        let event = Event::new(vec![0u8, 159, 146, 150, b'\n'], "s");
        let json = serde_json::to_string(&event).expect("serialize failed");
        assert!(!json.contains("metadata"));
        assert!(json.contains(r#""payload":"AJ+Slgo=""#));

        let decoded: Event = serde_json::from_str(&json).expect("deserialize failed");
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_event_rejects_invalid_base64_payload() {
        let json = r#"{"payload":"not base64!","source":"s","received_at_ms":1}"#;
        assert!(serde_json::from_str::<Event>(json).is_err());
    }
}
