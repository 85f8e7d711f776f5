// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Disk-backed overflow buffer for batches that could not be delivered.
//!
//! Batches are appended as frames to numbered segment files in a per-sink directory:
//!
//! ```text
//! spill-00000000000000000000.seg
//! spill-00000000000000000001.seg   <- current write segment
//! ```
//!
//! Each frame is `[len: u32 BE][crc32: u32 BE][zstd(json(batch))]`, the checksum covering
//! both the length and the payload. A damaged frame is skipped on its own; a length that runs
//! past the end of the segment discards the rest of that segment. The writer only ever
//! appends to the newest segment. A replay pass first seals that segment, so the reader only
//! touches files nothing is writing to. Delivered frames are cut from the front of a segment
//! and a fully drained segment is deleted, so a batch leaves the disk only after its own
//! delivery succeeded.

use std::fmt::Display;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::{ReplayError, SpillError};
use crate::event::{Batch, Event};

const SEGMENT_PREFIX: &str = "spill-";
const SEGMENT_EXTENSION: &str = "seg";
const TMP_EXTENSION: &str = "tmp";
const FRAME_HEADER_LEN: usize = 8;

#[derive(Debug, Clone)]
pub struct SpillConfig {
    /// Directory holding this sink's segments. Created on open.
    pub dir: PathBuf,
    /// Upper bound on bytes held across all segments.
    pub max_bytes: u64,
    /// A segment is closed once appending the next frame would take it past this size.
    pub max_segment_bytes: u64,
    pub compression_level: i32,
}

impl Default for SpillConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/tmp/log-shipper/spill"),
            max_bytes: 256 * 1024 * 1024,
            max_segment_bytes: 16 * 1024 * 1024,
            compression_level: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpillStats {
    pub appended: u64,
    /// Batches refused because the queue was full. Each one is lost.
    pub rejected: u64,
    pub replayed: u64,
    /// Damaged frames and unreadable segment tails discarded during replay.
    pub corrupted: u64,
    pub size_bytes: u64,
}

#[derive(Debug)]
struct SegmentWriter {
    seq: u64,
    file: Option<File>,
    len: u64,
}

#[derive(Debug)]
pub struct SpillQueue {
    dir: PathBuf,
    max_bytes: u64,
    max_segment_bytes: u64,
    compression_level: i32,
    writer: Mutex<SegmentWriter>,
    replay_lock: Mutex<()>,
    size: AtomicU64,
    appended: AtomicU64,
    rejected: AtomicU64,
    replayed: AtomicU64,
    corrupted: AtomicU64,
}

enum Frame {
    Batch { batch: Batch, len: usize },
    /// A frame whose length is in bounds but whose contents are unusable. Only this frame is
    /// lost; reading resumes after it.
    Damaged { reason: String, len: usize },
    /// A header or length that runs past the end of the segment. Nothing after it can be
    /// located.
    Corrupt(String),
    End,
}

impl SpillQueue {
    /// Opens the queue, adopting any segments left behind by a previous process.
    ///
    /// Failing to create the directory is the only fatal error; it is reported here rather
    /// than on the first append.
    pub async fn open(config: SpillConfig) -> Result<Self, SpillError> {
        fs::create_dir_all(&config.dir)
            .await
            .map_err(|source| SpillError::CreateDir {
                path: config.dir.clone(),
                source,
            })?;

        let mut size = 0;
        let mut next_seq = 0;
        let mut entries = fs::read_dir(&config.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(TMP_EXTENSION) {
                debug!("Removing stale spill file {}", path.display());
                fs::remove_file(&path).await?;
                continue;
            }
            if let Some(seq) = segment_seq(&path) {
                size += entry.metadata().await?.len();
                next_seq = next_seq.max(seq + 1);
            }
        }
        if size > 0 {
            info!(
                "Recovered {} bytes of spilled batches from {}",
                size,
                config.dir.display()
            );
        }

        Ok(SpillQueue {
            dir: config.dir,
            max_bytes: config.max_bytes,
            max_segment_bytes: config.max_segment_bytes.max(1),
            compression_level: config.compression_level,
            writer: Mutex::new(SegmentWriter {
                seq: next_seq,
                file: None,
                len: 0,
            }),
            replay_lock: Mutex::new(()),
            size: AtomicU64::new(size),
            appended: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            replayed: AtomicU64::new(0),
            corrupted: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size_bytes() == 0
    }

    #[must_use]
    pub fn stats(&self) -> SpillStats {
        SpillStats {
            appended: self.appended.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            replayed: self.replayed.load(Ordering::Relaxed),
            corrupted: self.corrupted.load(Ordering::Relaxed),
            size_bytes: self.size_bytes(),
        }
    }

    /// Persists `batch` and fsyncs it before returning.
    ///
    /// Returns [`SpillError::Capacity`] when the frame does not fit; nothing is written in that
    /// case and the batch is lost.
    pub async fn append(&self, batch: &[Event]) -> Result<(), SpillError> {
        let frame = encode_frame(batch, self.compression_level)?;
        let frame_bytes = frame.len() as u64;

        let mut writer = self.writer.lock().await;

        let used = self.size_bytes();
        if used.saturating_add(frame_bytes) > self.max_bytes {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(SpillError::Capacity {
                frame_bytes,
                used,
                max: self.max_bytes,
            });
        }

        if writer.file.is_some() && writer.len + frame_bytes > self.max_segment_bytes {
            writer.seal();
        }
        if writer.file.is_none() {
            let path = self.segment_path(writer.seq);
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            writer.len = file.metadata().await?.len();
            writer.file = Some(file);
            debug!("Opened spill segment {}", path.display());
        }

        let start = writer.len;
        let Some(file) = writer.file.as_mut() else {
            return Err(SpillError::Io(std::io::Error::other("spill segment is not open")));
        };
        if let Err(e) = write_durably(file, &frame).await {
            // Drop the partial frame so the segment stays readable.
            if let Err(rollback) = file.set_len(start).await {
                error!("Failed to roll back partial spill frame: {}", rollback);
            }
            return Err(SpillError::Io(e));
        }

        writer.len += frame_bytes;
        self.size.fetch_add(frame_bytes, Ordering::AcqRel);
        self.appended.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Redelivers every spilled batch in append order.
    ///
    /// Each batch is removed from disk once `deliver` accepts it. The first rejection ends the
    /// pass and is returned; that batch and everything after it stay queued. Returns the number
    /// of batches delivered.
    pub async fn replay<F, Fut, E>(&self, mut deliver: F) -> Result<usize, ReplayError<E>>
    where
        F: FnMut(Batch) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        self.replay_until(&mut deliver, &CancellationToken::new()).await
    }

    /// Runs [`SpillQueue::replay`] every `interval` until `cancel` fires. A pass in progress
    /// finishes its current batch before the task exits.
    pub fn start_replay<F, Fut, E>(
        self: &Arc<Self>,
        interval: Duration,
        mut deliver: F,
        cancel: CancellationToken,
    ) -> JoinHandle<()>
    where
        F: FnMut(Batch) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if queue.is_empty() {
                            continue;
                        }
                        match queue.replay_until(&mut deliver, &cancel).await {
                            Ok(0) => {}
                            Ok(n) => info!(
                                "Replayed {} spilled batches from {}",
                                n,
                                queue.dir.display()
                            ),
                            Err(ReplayError::Delivery(e)) => {
                                debug!("Spill replay paused, sink still failing: {}", e);
                            }
                            Err(ReplayError::Spill(e)) => error!("Spill replay failed: {}", e),
                        }
                    }
                }
            }
            debug!("Spill replay loop for {} stopped", queue.dir.display());
        })
    }

    pub(crate) async fn replay_until<F, Fut, E>(
        &self,
        deliver: &mut F,
        cancel: &CancellationToken,
    ) -> Result<usize, ReplayError<E>>
    where
        F: FnMut(Batch) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        let _pass = self.replay_lock.lock().await;

        let boundary = {
            let mut writer = self.writer.lock().await;
            writer.seal();
            writer.seq
        };

        let mut delivered = 0;
        for (_, path) in self.segments_before(boundary).await? {
            let data = fs::read(&path).await?;
            let mut offset = 0;

            while offset < data.len() {
                if cancel.is_cancelled() {
                    rewrite_tail(&path, &data[offset..]).await?;
                    return Ok(delivered);
                }
                match decode_frame(&data[offset..]) {
                    Frame::End => break,
                    Frame::Corrupt(reason) => {
                        let lost = data.len() - offset;
                        error!(
                            "Discarding {} unreadable bytes from spill segment {}: {}",
                            lost,
                            path.display(),
                            reason
                        );
                        self.corrupted.fetch_add(1, Ordering::Relaxed);
                        self.release(lost as u64);
                        break;
                    }
                    Frame::Damaged { reason, len } => {
                        error!(
                            "Skipping damaged {} byte frame in spill segment {}: {}",
                            len,
                            path.display(),
                            reason
                        );
                        self.corrupted.fetch_add(1, Ordering::Relaxed);
                        self.release(len as u64);
                        offset += len;
                    }
                    Frame::Batch { batch, len } => {
                        if let Err(e) = deliver(batch).await {
                            rewrite_tail(&path, &data[offset..]).await?;
                            return Err(ReplayError::Delivery(e));
                        }
                        offset += len;
                        delivered += 1;
                        self.release(len as u64);
                        self.replayed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }

            fs::remove_file(&path).await?;
            debug!("Drained spill segment {}", path.display());
        }

        Ok(delivered)
    }

    fn release(&self, bytes: u64) {
        let _ = self
            .size
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |size| {
                Some(size.saturating_sub(bytes))
            });
    }

    fn segment_path(&self, seq: u64) -> PathBuf {
        self.dir.join(format!("{SEGMENT_PREFIX}{seq:020}.{SEGMENT_EXTENSION}"))
    }

    async fn segments_before(&self, boundary: u64) -> std::io::Result<Vec<(u64, PathBuf)>> {
        let mut segments = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if let Some(seq) = segment_seq(&path) {
                if seq < boundary {
                    segments.push((seq, path));
                }
            }
        }
        segments.sort_unstable_by_key(|(seq, _)| *seq);
        Ok(segments)
    }
}

impl SegmentWriter {
    /// Closes the open segment; the next append starts a new one.
    fn seal(&mut self) {
        if self.file.take().is_some() {
            self.seq += 1;
            self.len = 0;
        }
    }
}

fn segment_seq(path: &Path) -> Option<u64> {
    if path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_EXTENSION) {
        return None;
    }
    path.file_stem()?
        .to_str()?
        .strip_prefix(SEGMENT_PREFIX)?
        .parse()
        .ok()
}

async fn write_durably(file: &mut File, frame: &[u8]) -> std::io::Result<()> {
    file.write_all(frame).await?;
    file.flush().await?;
    file.sync_all().await
}

/// Replaces `path` with `tail`, the frames that were not delivered.
async fn rewrite_tail(path: &Path, tail: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension(TMP_EXTENSION);
    let mut file = File::create(&tmp).await?;
    write_durably(&mut file, tail).await?;
    drop(file);
    fs::rename(&tmp, path).await
}

fn encode_frame(batch: &[Event], level: i32) -> Result<Vec<u8>, SpillError> {
    let json = serde_json::to_vec(batch).map_err(|e| SpillError::Encode(e.to_string()))?;
    let payload = zstd::stream::encode_all(json.as_slice(), level)
        .map_err(|e| SpillError::Encode(e.to_string()))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| SpillError::Encode(format!("batch too large: {} bytes", payload.len())))?;

    let len = len.to_be_bytes();
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&len);
    frame.extend_from_slice(&frame_checksum(len, &payload).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// CRC32 over the length prefix and the payload.
fn frame_checksum(len: [u8; 4], payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&len);
    hasher.update(payload);
    hasher.finalize()
}

fn decode_frame(buf: &[u8]) -> Frame {
    if buf.is_empty() {
        return Frame::End;
    }
    if buf.len() < FRAME_HEADER_LEN {
        return Frame::Corrupt(format!("truncated frame header ({} bytes)", buf.len()));
    }
    let len_bytes = [buf[0], buf[1], buf[2], buf[3]];
    let len = u32::from_be_bytes(len_bytes) as usize;
    let crc = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let Some(payload) = buf.get(FRAME_HEADER_LEN..FRAME_HEADER_LEN + len) else {
        return Frame::Corrupt(format!(
            "truncated frame: expected {} payload bytes, found {}",
            len,
            buf.len() - FRAME_HEADER_LEN
        ));
    };
    let damaged = |reason: String| Frame::Damaged {
        reason,
        len: FRAME_HEADER_LEN + len,
    };
    if frame_checksum(len_bytes, payload) != crc {
        return damaged("checksum mismatch".to_string());
    }
    let json = match zstd::stream::decode_all(payload) {
        Ok(json) => json,
        Err(e) => return damaged(format!("failed to decompress frame: {e}")),
    };
    match serde_json::from_slice(&json) {
        Ok(batch) => Frame::Batch {
            batch,
            len: FRAME_HEADER_LEN + len,
        },
        Err(e) => {
            warn!("Spill frame passed its checksum but is not a batch: {}", e);
            damaged(format!("failed to decode frame: {e}"))
        }
    }
}
