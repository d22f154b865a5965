// src/interception/tap.rs
//! Debug taps
//!
//! A tap mirrors the bytes an intercepted connection carries to an
//! observer without touching the authoritative data path.
//!
//! # Architecture
//!
//! ```text
//!            poll_read                        bytes (unchanged)
//! socket ──────────────► TappedStream ─────────────────────► parser / client
//!                             │
//!                             │ copy (bounded mpsc, PollSender)
//!                             ▼
//!                        observer task ──► TapSink (console)
//! ```
//!
//! The primary reader reserves a channel slot before every read, so a slow
//! observer holds it back by at most `capacity` chunks. Sinks are plain
//! blocking writers, so the observer runs on the blocking pool, tracked by
//! the connection's `TaskTracker`; its completion is what the connection
//! waits for before closing the transport.

use crate::observability;
use crate::utils::errors::ProxyError;
use bytes::Bytes;
use std::fmt;
use std::io::{self, Write};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// An observed chunk, or the read error the primary reader hit
pub type TapChunk = std::result::Result<Bytes, String>;

/// Which half of the exchange a tap observes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TapDirection {
    Request,
    Response,
}

impl fmt::Display for TapDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TapDirection::Request => f.write_str("Request"),
            TapDirection::Response => f.write_str("Response"),
        }
    }
}

/// How an observer finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TapOutcome {
    /// The duplicated stream ended
    Completed,

    /// The observer stopped early
    Failed(String),
}

/// Receives the bytes a tap observes
pub trait TapSink: Send + 'static {
    /// Called once before any bytes
    fn begin(&mut self, banner: &str) -> io::Result<()>;

    fn observe(&mut self, chunk: &[u8]) -> io::Result<()>;

    /// Called exactly once, last
    fn finish(&mut self, outcome: &TapOutcome);
}

/// Creates a sink per connection and direction
pub trait TapSinkFactory: Send + Sync {
    fn create(&self, connection: u64, direction: TapDirection) -> Box<dyn TapSink>;
}

/// Stream wrapper duplicating every byte read into a tap channel
///
/// Writes go straight to the inner stream.
pub struct TappedStream<S> {
    inner: S,
    tap: Option<PollSender<TapChunk>>,
}

impl<S> TappedStream<S> {
    pub fn new(inner: S, tap: Option<mpsc::Sender<TapChunk>>) -> Self {
        Self {
            inner,
            tap: tap.map(PollSender::new),
        }
    }

    /// A wrapper that duplicates nothing
    pub fn untapped(inner: S) -> Self {
        Self::new(inner, None)
    }

    /// Stop duplicating; the observer sees end of stream
    pub fn detach(&mut self) {
        self.tap = None;
    }

    /// Detach the observer (it sees end of stream) and return the stream
    pub fn into_inner(self) -> S {
        self.inner
    }

    fn forward(&mut self, chunk: TapChunk) {
        if let Some(tap) = self.tap.as_mut() {
            if tap.send_item(chunk).is_err() {
                self.tap = None;
            }
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TappedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if buf.remaining() == 0 {
            return Pin::new(&mut this.inner).poll_read(cx, buf);
        }

        if let Some(tap) = this.tap.as_mut() {
            if ready!(tap.poll_reserve(cx)).is_err() {
                // Observer gone; keep serving the primary reader
                this.tap = None;
            }
        }

        let before = buf.filled().len();
        let result = ready!(Pin::new(&mut this.inner).poll_read(cx, buf));

        match &result {
            Ok(()) => {
                let fresh = &buf.filled()[before..];
                if fresh.is_empty() {
                    this.tap = None;
                } else {
                    let chunk = Bytes::copy_from_slice(fresh);
                    this.forward(Ok(chunk));
                }
            }
            Err(e) => {
                this.forward(Err(e.to_string()));
                this.tap = None;
            }
        }

        Poll::Ready(result)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TappedStream<S> {
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

/// Attaches observers to streams
#[derive(Clone)]
pub struct DebugTap {
    factory: Arc<dyn TapSinkFactory>,
    capacity: usize,
}

impl DebugTap {
    pub fn new(factory: Arc<dyn TapSinkFactory>, capacity: usize) -> Self {
        Self {
            factory,
            capacity: capacity.max(1),
        }
    }

    /// Console observer with the given channel capacity
    pub fn console(capacity: usize) -> Self {
        Self::new(Arc::new(ConsoleTap), capacity)
    }

    /// Wrap `inner` and spawn its observer on `tracker`
    pub fn attach<S>(
        &self,
        connection: u64,
        direction: TapDirection,
        banner: String,
        inner: S,
        tracker: &TaskTracker,
    ) -> TappedStream<S> {
        let (sender, receiver) = mpsc::channel(self.capacity);
        let sink = self.factory.create(connection, direction);
        tracker.spawn_blocking(move || observe(connection, direction, banner, receiver, sink));
        TappedStream::new(inner, Some(sender))
    }
}

/// Observer loop; runs on the blocking pool since sinks may block
fn observe(
    connection: u64,
    direction: TapDirection,
    banner: String,
    mut receiver: mpsc::Receiver<TapChunk>,
    mut sink: Box<dyn TapSink>,
) -> TapOutcome {
    let outcome = drain(&banner, &mut receiver, sink.as_mut());
    // Stop the primary reader from reserving slots nobody will read
    receiver.close();

    match &outcome {
        TapOutcome::Completed => {
            debug!(connection, direction = %direction, "Tap completed");
        }
        TapOutcome::Failed(reason) => {
            let err = ProxyError::Tap(reason.clone());
            warn!(connection, direction = %direction, step = err.step(), "{}", err);
            observability::record_tap_error();
        }
    }

    sink.finish(&outcome);
    outcome
}

fn drain(
    banner: &str,
    receiver: &mut mpsc::Receiver<TapChunk>,
    sink: &mut dyn TapSink,
) -> TapOutcome {
    if let Err(e) = sink.begin(banner) {
        return TapOutcome::Failed(format!("sink: {}", e));
    }

    while let Some(chunk) = receiver.blocking_recv() {
        match chunk {
            Ok(bytes) => {
                if let Err(e) = sink.observe(&bytes) {
                    return TapOutcome::Failed(format!("sink: {}", e));
                }
            }
            Err(reason) => return TapOutcome::Failed(format!("read: {}", reason)),
        }
    }

    TapOutcome::Completed
}

/// Prints observed traffic to stdout
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleTap;

impl TapSinkFactory for ConsoleTap {
    fn create(&self, connection: u64, direction: TapDirection) -> Box<dyn TapSink> {
        Box::new(ConsoleSink {
            connection,
            direction,
        })
    }
}

struct ConsoleSink {
    connection: u64,
    direction: TapDirection,
}

impl TapSink for ConsoleSink {
    fn begin(&mut self, banner: &str) -> io::Result<()> {
        let mut out = io::stdout().lock();
        writeln!(out, "\n{} {} data:", self.direction, self.connection)?;
        out.write_all(banner.as_bytes())?;
        out.flush()
    }

    fn observe(&mut self, chunk: &[u8]) -> io::Result<()> {
        let mut out = io::stdout().lock();
        out.write_all(String::from_utf8_lossy(chunk).as_bytes())?;
        out.flush()
    }

    fn finish(&mut self, outcome: &TapOutcome) {
        let mut out = io::stdout().lock();
        let _ = match outcome {
            TapOutcome::Completed => writeln!(out),
            TapOutcome::Failed(reason) => writeln!(
                out,
                "\n[{} {} cut short: {}]",
                self.direction, self.connection, reason
            ),
        };
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{BrokenTap, RecordingTap};
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    fn payload() -> Vec<u8> {
        (0..50_000u32).map(|i| (i % 251) as u8).collect()
    }

    async fn read_through(tap: &DebugTap, data: &[u8]) -> Vec<u8> {
        let tracker = TaskTracker::new();
        let mut stream = tap.attach(1, TapDirection::Request, String::new(), data, &tracker);

        let mut out = Vec::new();
        let mut chunk = [0u8; 1000];
        loop {
            let n = stream.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        drop(stream);

        tracker.close();
        tracker.wait().await;
        out
    }

    #[tokio::test]
    async fn test_tap_is_transparent() {
        let data = payload();
        let recorder = Arc::new(RecordingTap::default());
        let tap = DebugTap::new(recorder.clone(), 4);

        let primary = read_through(&tap, &data).await;
        assert_eq!(primary, data);

        let record = recorder.get(1, TapDirection::Request).unwrap();
        let record = record.lock().unwrap();
        assert_eq!(record.bytes, data);
        assert_eq!(record.outcome, Some(TapOutcome::Completed));
    }

    #[tokio::test]
    async fn test_slow_tap_sees_everything_in_order() {
        let data = payload();
        let recorder = Arc::new(RecordingTap::slow(Duration::from_millis(1)));
        let tap = DebugTap::new(recorder.clone(), 1);

        let primary = read_through(&tap, &data).await;
        assert_eq!(primary, data);

        let record = recorder.get(1, TapDirection::Request).unwrap();
        assert_eq!(record.lock().unwrap().bytes, data);
    }

    #[tokio::test]
    async fn test_failing_tap_does_not_affect_primary() {
        let data = payload();
        let tap = DebugTap::new(Arc::new(BrokenTap), 2);

        let primary = read_through(&tap, &data).await;
        assert_eq!(primary, data);
    }

    #[tokio::test]
    async fn test_blocking_sink_does_not_stall_runtime() {
        use std::time::Instant;

        let recorder = Arc::new(RecordingTap::slow(Duration::from_millis(200)));
        let tap = DebugTap::new(recorder.clone(), 4);
        let tracker = TaskTracker::new();

        let mut stream = tap.attach(3, TapDirection::Request, String::new(), &b"ping"[..], &tracker);
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        drop(stream);

        // The sink is still sleeping on its own thread
        let started = Instant::now();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(started.elapsed() < Duration::from_millis(150));

        tracker.close();
        tracker.wait().await;
        let record = recorder.get(3, TapDirection::Request).unwrap();
        assert_eq!(record.lock().unwrap().bytes, b"ping");
    }

    #[tokio::test]
    async fn test_dropped_receiver_detaches_tap() {
        let (sender, receiver) = mpsc::channel(1);
        drop(receiver);

        let mut stream = TappedStream::new(&b"hello"[..], Some(sender));
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello");
        assert!(stream.tap.is_none());
    }

    #[tokio::test]
    async fn test_into_inner_ends_observation() {
        let recorder = Arc::new(RecordingTap::default());
        let tap = DebugTap::new(recorder.clone(), 4);
        let tracker = TaskTracker::new();

        let (client, _server) = tokio::io::duplex(64);
        let banner = "HTTP/1.1 200 OK\r\n".to_string();
        let stream = tap.attach(7, TapDirection::Response, banner, client, &tracker);
        let _inner = stream.into_inner();

        tracker.close();
        tracker.wait().await;

        let record = recorder.get(7, TapDirection::Response).unwrap();
        let record = record.lock().unwrap();
        assert_eq!(record.banner, "HTTP/1.1 200 OK\r\n");
        assert!(record.bytes.is_empty());
        assert_eq!(record.outcome, Some(TapOutcome::Completed));
    }

    #[tokio::test]
    async fn test_read_error_reported_to_tap() {
        struct Failing;

        impl AsyncRead for Failing {
            fn poll_read(
                self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
                _buf: &mut ReadBuf<'_>,
            ) -> Poll<io::Result<()>> {
                Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")))
            }
        }

        let recorder = Arc::new(RecordingTap::default());
        let tap = DebugTap::new(recorder.clone(), 4);
        let tracker = TaskTracker::new();

        let mut stream = tap.attach(3, TapDirection::Request, String::new(), Failing, &tracker);
        let mut buf = [0u8; 16];
        assert!(stream.read(&mut buf).await.is_err());
        drop(stream);

        tracker.close();
        tracker.wait().await;

        let record = recorder.get(3, TapDirection::Request).unwrap();
        let outcome = record.lock().unwrap().outcome.clone();
        assert!(matches!(outcome, Some(TapOutcome::Failed(reason)) if reason.contains("reset")));
    }
}
