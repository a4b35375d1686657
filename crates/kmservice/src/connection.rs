// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Framed stream halves.
//!
//! Records are written back to back with no length prefix:
//! ```text
//! {"Tag":...,"Data":{...}}{"Tag":...,"Data":{...}}
//! ```
//!
//! One call to [`FrameReader::read_frame`] yields exactly one JSON record,
//! however the bytes were split or merged by the network. Writes go through an
//! [`Outbound`] handle feeding a single writer task per connection.

use crate::shutdown::ShutdownSignal;
use serde::de::IgnoredAny;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Bytes of one encoded frame, shared between the writer queue and pending sets.
pub type Frame = Arc<[u8]>;

const READ_CHUNK: usize = 8 * 1024;

/// Connection error types.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Bytes that cannot start a JSON record; they were discarded.
    #[error("Malformed frame ({skipped} bytes skipped)")]
    Malformed { skipped: usize },

    #[error("Frame too large: {size} > {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Connection closed")]
    Closed,
}

impl ConnectionError {
    /// Whether the stream can still be read after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Malformed { .. } | Self::FrameTooLarge { .. })
    }
}

/// Outcome of looking for a record at the head of the read buffer.
enum Scan {
    Frame(Vec<u8>),
    Oversized(usize),
    Malformed(usize),
    Incomplete,
}

/// Nesting tracker used to discard a record too large to buffer.
#[derive(Debug, Default)]
struct Discard {
    depth: usize,
    in_string: bool,
    escaped: bool,
    size: usize,
}

impl Discard {
    /// Consume `bytes`; returns the offset just past the record once it ends.
    fn feed(&mut self, bytes: &[u8]) -> Option<usize> {
        for (i, &b) in bytes.iter().enumerate() {
            self.size += 1;
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                    if self.depth == 0 {
                        return Some(i + 1);
                    }
                }
                continue;
            }
            match b {
                b'"' => self.in_string = true,
                b'{' | b'[' => self.depth += 1,
                b'}' | b']' => {
                    self.depth = self.depth.saturating_sub(1);
                    if self.depth == 0 {
                        return Some(i + 1);
                    }
                }
                _ => {}
            }
        }
        None
    }
}

/// Reading half of a framed connection.
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
    max_frame_size: usize,
    discard: Option<Discard>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_frame_size: usize) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            max_frame_size,
            discard: None,
        }
    }

    /// Change the size bound (handshakes use a smaller one).
    pub fn set_max_frame_size(&mut self, max_frame_size: usize) {
        self.max_frame_size = max_frame_size;
    }

    /// Read one frame.
    ///
    /// Returns `Ok(None)` if the connection is closed gracefully between
    /// records. Oversized records and garbage are skipped so the stream stays
    /// in sync; both are reported as recoverable errors.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, ConnectionError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(discard) = self.discard.as_mut() {
                match discard.feed(&self.buf) {
                    Some(end) => {
                        let size = discard.size;
                        self.discard = None;
                        self.buf.drain(..end);
                        return Err(ConnectionError::FrameTooLarge {
                            size,
                            max: self.max_frame_size,
                        });
                    }
                    None => self.buf.clear(),
                }
            } else {
                match self.scan() {
                    Scan::Frame(frame) => return Ok(Some(frame)),
                    Scan::Oversized(size) => {
                        return Err(ConnectionError::FrameTooLarge {
                            size,
                            max: self.max_frame_size,
                        })
                    }
                    Scan::Malformed(skipped) => {
                        return Err(ConnectionError::Malformed { skipped })
                    }
                    Scan::Incomplete if self.buf.len() > self.max_frame_size => {
                        self.discard = Some(Discard::default());
                        continue;
                    }
                    Scan::Incomplete => {}
                }
            }

            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                if self.buf.is_empty() && self.discard.is_none() {
                    return Ok(None);
                }
                return Err(ConnectionError::Io(std::io::ErrorKind::UnexpectedEof.into()));
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Split one complete record off the head of the buffer, if there is one.
    fn scan(&mut self) -> Scan {
        let Some(start) = self.buf.iter().position(|b| !b.is_ascii_whitespace()) else {
            self.buf.clear();
            return Scan::Incomplete;
        };
        self.buf.drain(..start);

        let end = {
            let mut records =
                serde_json::Deserializer::from_slice(&self.buf).into_iter::<IgnoredAny>();
            match records.next() {
                Some(Ok(_)) => Some(records.byte_offset()),
                Some(Err(e)) if !e.is_eof() => None,
                _ => return Scan::Incomplete,
            }
        };
        let Some(end) = end else {
            // Resync on the next object start.
            let skipped = self.buf[1..]
                .iter()
                .position(|&b| b == b'{')
                .map_or(self.buf.len(), |i| i + 1);
            self.buf.drain(..skipped);
            return Scan::Malformed(skipped);
        };

        let frame: Vec<u8> = self.buf.drain(..end).collect();
        if frame.len() > self.max_frame_size {
            return Scan::Oversized(frame.len());
        }
        Scan::Frame(frame)
    }
}

/// Writing half of a framed connection.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Write one record.
    pub async fn write_frame(&mut self, frame: &[u8]) -> Result<(), ConnectionError> {
        self.inner.write_all(frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), ConnectionError> {
        self.inner.shutdown().await.map_err(ConnectionError::Io)
    }
}

/// Handle used to enqueue frames for a connection's writer task.
#[derive(Clone, Debug)]
pub struct Outbound {
    tx: mpsc::Sender<Frame>,
    max_frame_size: usize,
}

impl Outbound {
    /// Enqueue a frame, waiting for queue space.
    pub async fn send(&self, frame: Frame) -> Result<(), ConnectionError> {
        self.check_size(&frame)?;
        self.tx
            .send(frame)
            .await
            .map_err(|_| ConnectionError::Closed)
    }

    /// Enqueue a frame without waiting. A full queue is reported as closed so
    /// a stalled receiver never holds up the caller.
    pub fn try_send(&self, frame: Frame) -> Result<(), ConnectionError> {
        self.check_size(&frame)?;
        self.tx.try_send(frame).map_err(|_| ConnectionError::Closed)
    }

    fn check_size(&self, frame: &[u8]) -> Result<(), ConnectionError> {
        if frame.len() > self.max_frame_size {
            return Err(ConnectionError::FrameTooLarge {
                size: frame.len(),
                max: self.max_frame_size,
            });
        }
        Ok(())
    }

    /// Outbound handle backed by a plain channel, for driving handlers in tests.
    pub fn channel(capacity: usize, max_frame_size: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx, max_frame_size }, rx)
    }
}

/// Spawn the writer task for a connection.
///
/// The task ends when every [`Outbound`] clone is dropped, on the first write
/// error, or when `shutdown` fires; frames already queued are written first.
/// The stream is shut down on exit.
pub fn spawn_writer<W>(
    mut writer: FrameWriter<W>,
    capacity: usize,
    max_frame_size: usize,
    mut shutdown: ShutdownSignal,
) -> (Outbound, JoinHandle<()>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outbound, mut rx) = Outbound::channel(capacity, max_frame_size);

    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                next = rx.recv() => {
                    let Some(frame) = next else { break };
                    if let Err(e) = writer.write_frame(&frame).await {
                        warn!("Write error: {}", e);
                        break;
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Writer shutting down");
                    break;
                }
            }
        }
        let _ = writer.shutdown().await;
    });

    (outbound, handle)
}
