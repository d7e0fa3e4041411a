//! Newline-delimited JSON codec for [`Envelope`]s.
//!
//! Each direction of the pipe pair has exactly one [`EnvelopeReader`], owned by
//! a single long-lived task. Writes go through an [`EnvelopeSink`], which any
//! number of tasks may share; the sink serializes whole envelopes so lines are
//! never interleaved.

use std::sync::Arc;

use futures::StreamExt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

use crate::Envelope;

/// Type-erased outbound stream used by [`EnvelopeSink`]
pub type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Default upper bound on one inbound line, in bytes
pub const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

/// Errors raised while reading or writing envelopes
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed envelope: {source} (line: {line})")]
    Decode {
        line: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("line exceeds {max} bytes")]
    LineTooLong { max: usize },

    #[error("encoding envelope failed: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("stream closed")]
    Closed,
}

impl CodecError {
    fn decode(source: serde_json::Error, raw: &str) -> Self {
        Self::Decode {
            line: raw.chars().take(100).collect(),
            source,
        }
    }
}

/// Reads one envelope per line from an async byte stream.
pub struct EnvelopeReader<R> {
    lines: FramedRead<R, LinesCodec>,
    max_line_length: usize,
}

impl<R: AsyncRead + Unpin> EnvelopeReader<R> {
    /// Create a new reader over the inbound half of the pipe pair
    pub fn new(inner: R) -> Self {
        Self::with_max_line_length(inner, MAX_LINE_LENGTH)
    }

    /// Like [`new`](Self::new), rejecting lines longer than `max` bytes
    pub fn with_max_line_length(inner: R, max: usize) -> Self {
        Self {
            lines: FramedRead::new(inner, LinesCodec::new_with_max_length(max)),
            max_line_length: max,
        }
    }

    /// Read the next envelope.
    ///
    /// Returns `Ok(Some(envelope))` for each message, `Ok(None)` at end of
    /// stream, or `Err` on I/O, oversized line or parse errors. Blank lines
    /// are skipped.
    ///
    /// Cancel safe: bytes of a partially received line stay in the framing
    /// buffer, so this can sit in a `tokio::select!` loop.
    pub async fn read_envelope(&mut self) -> Result<Option<Envelope>, CodecError> {
        loop {
            let line = match self.lines.next().await {
                None => return Ok(None),
                Some(Ok(line)) => line,
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    return Err(CodecError::LineTooLong {
                        max: self.max_line_length,
                    })
                }
                Some(Err(LinesCodecError::Io(e))) => return Err(CodecError::Io(e)),
            };

            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            return serde_json::from_str(line)
                .map(Some)
                .map_err(|e| CodecError::decode(e, line));
        }
    }
}

/// Writes one envelope per line to an async byte stream.
pub struct EnvelopeWriter<W> {
    writer: Option<W>,
    buffer: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> EnvelopeWriter<W> {
    /// Create a new writer over the outbound half of the pipe pair
    pub fn new(inner: W) -> Self {
        Self {
            writer: Some(inner),
            buffer: Vec::with_capacity(1024),
        }
    }

    /// Encode `envelope` as a single line and flush it.
    pub async fn write_envelope(&mut self, envelope: &Envelope) -> Result<(), CodecError> {
        let writer = self.writer.as_mut().ok_or(CodecError::Closed)?;

        self.buffer.clear();
        serde_json::to_writer(&mut self.buffer, envelope).map_err(CodecError::Encode)?;
        self.buffer.push(b'\n');

        writer.write_all(&self.buffer).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Shut down and drop the underlying stream, signalling EOF to the peer.
    ///
    /// Later writes fail with [`CodecError::Closed`]. Closing twice is a no-op.
    pub async fn close(&mut self) -> Result<(), CodecError> {
        if let Some(mut writer) = self.writer.take() {
            writer.shutdown().await?;
        }
        Ok(())
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.writer.is_none()
    }
}

/// Cloneable, mutex-guarded envelope writer.
///
/// The lock is held for exactly one envelope per [`send`](Self::send).
#[derive(Clone)]
pub struct EnvelopeSink {
    inner: Arc<Mutex<EnvelopeWriter<BoxedWrite>>>,
}

impl EnvelopeSink {
    /// Wrap an outbound stream
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(EnvelopeWriter::new(Box::new(writer) as BoxedWrite))),
        }
    }

    /// Write one envelope
    pub async fn send(&self, envelope: &Envelope) -> Result<(), CodecError> {
        let mut writer = self.inner.lock().await;
        writer.write_envelope(envelope).await
    }

    /// Close the outbound stream
    pub async fn close(&self) -> Result<(), CodecError> {
        let mut writer = self.inner.lock().await;
        writer.close().await
    }
}

impl std::fmt::Debug for EnvelopeSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeSink").finish_non_exhaustive()
    }
}
