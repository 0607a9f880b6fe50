//! Rewindable stream wrapper for non-destructive peeking.
//!
//! Bytes pulled in by [`RewindStream::poll_fill`] are kept in an internal
//! buffer and handed back to the first reads of the stream, so whoever
//! inspects the start of a connection and whoever consumes it afterwards
//! see the same byte sequence. Once the buffer drains, reads and writes go
//! straight to the inner stream.

use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A stream wrapper that replays peeked bytes before reading from `inner`.
#[derive(Debug)]
pub struct RewindStream<S> {
    inner: S,
    buffer: Vec<u8>,
    pos: usize,
    eof: bool,
}

impl<S> RewindStream<S> {
    /// Wrap a stream with an empty replay buffer.
    pub fn new(inner: S) -> Self {
        Self::with_prefix(inner, Vec::new())
    }

    /// Wrap a stream whose first `prefix` bytes were already observed elsewhere.
    pub fn with_prefix(inner: S, prefix: Vec<u8>) -> Self {
        Self {
            inner,
            buffer: prefix,
            pos: 0,
            eof: false,
        }
    }

    /// Bytes observed but not yet delivered to a reader.
    pub fn peeked(&self) -> &[u8] {
        &self.buffer[self.pos..]
    }

    /// Whether the inner stream reported end-of-file while peeking.
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Get a reference to the inner stream.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Get a mutable reference to the inner stream.
    ///
    /// Reading from it directly skips any bytes still held for replay.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Consume the wrapper, returning the inner stream and any unreplayed bytes.
    pub fn into_parts(self) -> (S, Vec<u8>) {
        let mut buffer = self.buffer;
        buffer.drain(..self.pos);
        (self.inner, buffer)
    }
}

impl<S: AsyncRead + Unpin> RewindStream<S> {
    /// Buffer at least `len` unread bytes without consuming them.
    ///
    /// Reads only as many bytes from the inner stream as are missing, so no
    /// data is pulled ahead of what the caller asked to see. Resolves to the
    /// number of bytes available for peeking, which is less than `len` only
    /// if the inner stream hit end-of-file.
    pub fn poll_fill(&mut self, cx: &mut Context<'_>, len: usize) -> Poll<io::Result<usize>> {
        while self.peeked().len() < len && !self.eof {
            let missing = len - self.peeked().len();
            let start = self.buffer.len();
            self.buffer.resize(start + missing, 0);

            let mut read_buf = ReadBuf::new(&mut self.buffer[start..]);
            let polled = Pin::new(&mut self.inner).poll_read(cx, &mut read_buf);
            let filled = read_buf.filled().len();
            self.buffer.truncate(start + filled);

            match polled {
                Poll::Ready(Ok(())) if filled == 0 => self.eof = true,
                Poll::Ready(Ok(())) => {}
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        Poll::Ready(Ok(self.peeked().len().min(len)))
    }

    /// Async form of [`poll_fill`](Self::poll_fill).
    pub async fn fill(&mut self, len: usize) -> io::Result<usize> {
        poll_fn(|cx| self.poll_fill(cx, len)).await
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for RewindStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pos < self.buffer.len() {
            let remaining = &self.buffer[self.pos..];
            let to_copy = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..to_copy]);
            self.pos += to_copy;

            if self.pos == self.buffer.len() {
                self.buffer = Vec::new();
                self.pos = 0;
            }
            return Poll::Ready(Ok(()));
        }

        if self.eof {
            return Poll::Ready(Ok(()));
        }

        ready!(Pin::new(&mut self.inner).poll_read(cx, buf))?;
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for RewindStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
