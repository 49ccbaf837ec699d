//! Buffered and replayable connection wrappers used for protocol sniffing
//!
//! [`SniffingConn`] records everything read from the wrapped stream into a
//! bounded buffer so that an initial prefix can be inspected and then handed
//! intact to the next protocol stage (TLS termination, request parsing or an
//! opaque tunnel). [`BufferedConn`] is the simpler sibling: a replenishable
//! peekable head with no rewind.

use crate::error::{Error, Result};
use bytes::{Buf, BytesMut};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// Recording capacity: one TLS record header plus a maximum-size record.
/// The classification prefix peeked after a CONNECT lies inside this same
/// window, so it never adds to the bound.
pub(crate) const SNIFF_BUFFER_CAP: usize = 5 + 16384;

const READ_CHUNK: usize = 4096;

/// A connection wrapper that records reads until [`SniffingConn::rewind`]
/// is called, then replays the recorded bytes before falling through to the
/// underlying stream. The transition is one-shot.
#[derive(Debug)]
pub struct SniffingConn<S> {
  inner: S,
  buf: Vec<u8>,
  pos: usize,
  replaying: bool,
}

impl<S> SniffingConn<S> {
  pub fn new(inner: S) -> Self {
    Self {
      inner,
      buf: Vec::with_capacity(SNIFF_BUFFER_CAP),
      pos: 0,
      replaying: false,
    }
  }

  /// Switch to replaying. Subsequent reads drain the recorded bytes first.
  /// A second invocation is rejected.
  pub fn rewind(&mut self) -> Result<()> {
    if self.replaying {
      return Err(Error::SniffRewound);
    }
    self.replaying = true;
    self.pos = 0;
    Ok(())
  }
}

impl<S: AsyncRead + Unpin> SniffingConn<S> {
  /// Read exactly `n` more bytes from the underlying stream into the
  /// recording buffer and return the newly appended tail.
  pub async fn peek(&mut self, n: usize) -> Result<&[u8]> {
    if self.replaying {
      return Err(Error::SniffRewound);
    }
    let start = self.buf.len();
    let target = start + n;
    if target > SNIFF_BUFFER_CAP {
      return Err(Error::SniffBufferFull);
    }
    let mut chunk = [0u8; READ_CHUNK];
    while self.buf.len() < target {
      let want = (target - self.buf.len()).min(READ_CHUNK);
      let read = self.inner.read(&mut chunk[..want]).await?;
      if read == 0 {
        return Err(Error::Io(io::Error::new(
          io::ErrorKind::UnexpectedEof,
          "eof while peeking connection prefix",
        )));
      }
      self.buf.extend_from_slice(&chunk[..read]);
    }
    Ok(&self.buf[start..target])
  }

  /// Ensure the recording buffer holds at least `n` bytes counted from
  /// the start of the stream and return them. Bytes already recorded by
  /// an earlier peek are reused, not read past.
  pub async fn peek_head(&mut self, n: usize) -> Result<&[u8]> {
    if self.replaying {
      return Err(Error::SniffRewound);
    }
    if n > SNIFF_BUFFER_CAP {
      return Err(Error::SniffBufferFull);
    }
    let mut chunk = [0u8; READ_CHUNK];
    while self.buf.len() < n {
      let want = (n - self.buf.len()).min(READ_CHUNK);
      let read = self.inner.read(&mut chunk[..want]).await?;
      if read == 0 {
        return Err(Error::Io(io::Error::new(
          io::ErrorKind::UnexpectedEof,
          "eof while peeking connection prefix",
        )));
      }
      self.buf.extend_from_slice(&chunk[..read]);
    }
    Ok(&self.buf[..n])
  }
}

impl<S: AsyncRead + Unpin> AsyncRead for SniffingConn<S> {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    let this = self.get_mut();
    if this.replaying {
      if this.pos < this.buf.len() {
        let n = (this.buf.len() - this.pos).min(buf.remaining());
        buf.put_slice(&this.buf[this.pos..this.pos + n]);
        this.pos += n;
        return Poll::Ready(Ok(()));
      }
      return Pin::new(&mut this.inner).poll_read(cx, buf);
    }
    // Recording: tee whatever the caller reads so a later rewind stays
    // byte-accurate.
    let before = buf.filled().len();
    match Pin::new(&mut this.inner).poll_read(cx, buf) {
      Poll::Ready(Ok(())) => {
        let filled = &buf.filled()[before..];
        if this.buf.len() + filled.len() > SNIFF_BUFFER_CAP {
          return Poll::Ready(Err(io::Error::other("sniff recording buffer full")));
        }
        this.buf.extend_from_slice(filled);
        Poll::Ready(Ok(()))
      }
      other => other,
    }
  }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for SniffingConn<S> {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<io::Result<usize>> {
    Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.get_mut().inner).poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
  }
}

/// A connection with a replenishable peekable head. Reads drain the buffer
/// before falling through to the underlying stream; writes pass straight
/// through.
#[derive(Debug)]
pub struct BufferedConn<S> {
  inner: S,
  buf: BytesMut,
}

impl<S> BufferedConn<S> {
  pub fn new(inner: S) -> Self {
    Self {
      inner,
      buf: BytesMut::with_capacity(READ_CHUNK),
    }
  }

  /// Currently buffered, not yet consumed bytes.
  pub fn buffer(&self) -> &[u8] {
    &self.buf
  }

  /// Consume `n` buffered bytes.
  pub(crate) fn consume(&mut self, n: usize) {
    self.buf.advance(n);
  }
}

impl<S: AsyncRead + Unpin> BufferedConn<S> {
  /// Ensure at least `n` bytes are buffered, reading from the underlying
  /// stream as needed. Fails with `UnexpectedEof` when the stream ends
  /// short.
  pub async fn fill(&mut self, n: usize) -> io::Result<()> {
    while self.buf.len() < n {
      if self.fill_some().await? == 0 {
        return Err(io::Error::new(
          io::ErrorKind::UnexpectedEof,
          "eof while peeking connection prefix",
        ));
      }
    }
    Ok(())
  }

  /// Append one read's worth of bytes to the buffer. Returns the number of
  /// bytes read, zero at EOF.
  pub(crate) async fn fill_some(&mut self) -> io::Result<usize> {
    self.inner.read_buf(&mut self.buf).await
  }
}

impl<S: AsyncRead + Unpin> AsyncRead for BufferedConn<S> {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    let this = self.get_mut();
    if !this.buf.is_empty() {
      let n = this.buf.len().min(buf.remaining());
      buf.put_slice(&this.buf[..n]);
      this.buf.advance(n);
      return Poll::Ready(Ok(()));
    }
    Pin::new(&mut this.inner).poll_read(cx, buf)
  }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for BufferedConn<S> {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<io::Result<usize>> {
    Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.get_mut().inner).poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
  }
}
