// src/interception/rewind.rs
//! Stream wrapper that replays already-consumed bytes
//!
//! The orchestrator reads the client's opening bytes to evaluate the policy.
//! Those bytes must still reach whichever data path runs next, so the
//! transport is wrapped in a [`Rewind`] that yields them before reading
//! from the socket again.

use bytes::{Buf, Bytes};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A stream with a replay prefix
#[derive(Debug)]
pub struct Rewind<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> Rewind<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }

    /// Unwrap the stream, discarding any unread prefix
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix[..n]);
            this.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_prefix_replayed_before_inner() {
        let mut stream = Rewind::new(Bytes::from_static(b"GET / "), &b"HTTP/1.1\r\n"[..]);
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"GET / HTTP/1.1\r\n");
    }

    #[tokio::test]
    async fn test_prefix_split_across_small_reads() {
        let mut stream = Rewind::new(Bytes::from_static(b"abcdef"), &b"gh"[..]);
        let mut small = [0u8; 4];
        let n = stream.read(&mut small).await.unwrap();
        assert_eq!(&small[..n], b"abcd");
        assert_eq!(&stream.prefix[..], b"ef");

        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"efgh");
    }

    #[tokio::test]
    async fn test_writes_pass_through() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut stream = Rewind::new(Bytes::new(), client);
        stream.write_all(b"pong").await.unwrap();
        stream.shutdown().await.unwrap();

        let mut out = Vec::new();
        server.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"pong");
    }
}
