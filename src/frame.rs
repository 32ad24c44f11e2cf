//! Frame reading and writing.
//!
//! Two framings are supported:
//!
//! - `short-read` (default): the server reads in `chunk_size` pieces and a
//!   read shorter than `chunk_size` ends the frame. There is no length
//!   prefix and no terminator. This only works when the peer flushes each
//!   request separately and the kernel delivers it without splitting it at
//!   a chunk boundary; a request whose length is an exact multiple of
//!   `chunk_size` stalls until the peer sends more bytes. Kept for
//!   compatibility with existing clients.
//! - `length-prefixed`: every frame, in both directions, starts with its
//!   length as a 4-byte big-endian integer.
//!
//! Both enforce `max_frame_size` on incoming frames.

use crate::config::{Config, FramingMode};
use bytes::{Bytes, BytesMut};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Errors that end a session while reading a frame.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The connection failed mid-read. Nothing is sent back.
    #[error("connection error: {0}")]
    Io(#[from] io::Error),
    /// The peer sent more than the configured maximum.
    #[error("frame exceeds {limit} bytes")]
    TooLarge { limit: usize },
}

/// Framing parameters shared by every session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Framing {
    pub mode: FramingMode,
    pub chunk_size: usize,
    pub max_frame_size: usize,
}

impl Framing {
    pub fn from_config(config: &Config) -> Self {
        Framing {
            mode: config.framing,
            chunk_size: config.chunk_size,
            max_frame_size: config.max_frame_size,
        }
    }
}

/// Reads whole request frames from one connection.
pub struct FrameReader<R> {
    inner: R,
    framing: Framing,
    buffer: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, framing: Framing) -> Self {
        FrameReader {
            inner,
            framing,
            buffer: BytesMut::with_capacity(framing.chunk_size),
        }
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` when the peer closed the connection between frames.
    pub async fn next_frame(&mut self) -> Result<Option<Bytes>, FrameError> {
        match self.framing.mode {
            FramingMode::ShortRead => self.read_short().await,
            FramingMode::LengthPrefixed => self.read_prefixed().await,
        }
    }

    async fn read_short(&mut self) -> Result<Option<Bytes>, FrameError> {
        let chunk_size = self.framing.chunk_size;
        let limit = self.framing.max_frame_size;
        self.buffer.clear();

        loop {
            self.buffer.reserve(chunk_size);
            let n = (&mut self.inner)
                .take(chunk_size as u64)
                .read_buf(&mut self.buffer)
                .await?;

            if n == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                break;
            }
            if self.buffer.len() > limit {
                return Err(FrameError::TooLarge { limit });
            }
            if n < chunk_size {
                break;
            }
        }

        Ok(Some(self.buffer.split().freeze()))
    }

    async fn read_prefixed(&mut self) -> Result<Option<Bytes>, FrameError> {
        let limit = self.framing.max_frame_size;

        let len = match self.inner.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if len > limit {
            return Err(FrameError::TooLarge { limit });
        }

        self.buffer.clear();
        self.buffer.resize(len, 0);
        self.inner.read_exact(&mut self.buffer[..]).await?;
        Ok(Some(self.buffer.split().freeze()))
    }
}

/// Writes response frames to one connection.
pub struct FrameWriter<W> {
    inner: W,
    mode: FramingMode,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W, mode: FramingMode) -> Self {
        FrameWriter { inner, mode }
    }

    /// Write one frame and flush it so the peer sees a complete message.
    pub async fn send(&mut self, payload: &[u8]) -> io::Result<()> {
        if self.mode == FramingMode::LengthPrefixed {
            let len = u32::try_from(payload.len())
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too long"))?;
            self.inner.write_u32(len).await?;
        }
        self.inner.write_all(payload).await?;
        self.inner.flush().await
    }

    /// Shut down the write half.
    pub async fn close(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}
