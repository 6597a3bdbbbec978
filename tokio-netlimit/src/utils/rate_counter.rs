//! Throughput counters for asynchronous streams.
//!
//! [`RateCounter`] wraps any `AsyncRead`/`AsyncWrite` and tallies the bytes moved in each
//! direction, plus the instant of the first non-empty read, so you can check what a
//! [`RateLimitedConnection`](crate::conn::RateLimitedConnection) actually delivers.
//!
//! ## Example
//! ```no_run
//! use tokio::io::{self, AsyncReadExt, AsyncWriteExt, duplex};
//! use tokio_netlimit::io::NetLimitExt;
//! use tokio_netlimit::limiter::TokenBucket;
//! use tokio_netlimit::utils::rate_counter::RateCounter;
//!
//! # #[tokio::main]
//! # async fn main() -> io::Result<()> {
//! let (mut peer, stream) = duplex(1024);
//! let mut stream = RateCounter::new(stream.limit_rate(Some(TokenBucket::new(256, 64)), None));
//!
//! tokio::spawn(async move {
//!     let _ = peer.write_all(&[0u8; 512]).await;
//! });
//!
//! let mut buf = vec![0u8; 512];
//! stream.read_exact(&mut buf).await?;
//! assert_eq!(stream.read_total(), 512);
//! println!("{:.0} B/s", stream.read_rate_bps().unwrap_or_default());
//! # Ok(()) }
//! ```
//!
//! Timestamps come from [`tokio::time::Instant`], so paused-clock tests measure virtual time.
use std::{
    fmt,
    io::{self, IoSlice},
    pin::Pin,
    task::{ready, Context, Poll},
};

use pin_project::pin_project;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    time::Instant,
};

/// Counts bytes flowing through a stream and reports the average read rate.
///
/// - The read timer starts on the **first non-zero** read.
/// - `read_rate_bps()` returns `None` until at least one byte has been read.
/// - `reset()` clears counters and the start time.
#[pin_project]
pub struct RateCounter<T> {
    #[pin]
    inner: T,
    read_bytes: u64,
    written_bytes: u64,
    start: Option<Instant>,
}

impl<T> RateCounter<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            read_bytes: 0,
            written_bytes: 0,
            start: None,
        }
    }

    /// Total bytes read so far (saturating).
    #[inline]
    pub fn read_total(&self) -> u64 {
        self.read_bytes
    }

    /// Total bytes accepted by the inner writer so far (saturating).
    #[inline]
    pub fn written_total(&self) -> u64 {
        self.written_bytes
    }

    /// When the first non-zero read happened.
    #[inline]
    pub fn start_instant(&self) -> Option<Instant> {
        self.start
    }

    /// Average read rate since `start_instant()` in bytes per second.
    pub fn read_rate_bps(&self) -> Option<f64> {
        let start = self.start?;
        // Clamp denominator to avoid FP blow-ups on extremely small intervals.
        let elapsed = start.elapsed().as_secs_f64().max(1e-6);
        Some(self.read_bytes as f64 / elapsed)
    }

    #[inline]
    pub fn reset(&mut self) {
        self.read_bytes = 0;
        self.written_bytes = 0;
        self.start = None;
    }

    #[inline]
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    #[inline]
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: fmt::Debug> fmt::Debug for RateCounter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateCounter")
            .field("inner", &self.inner)
            .field("read_bytes", &self.read_bytes)
            .field("written_bytes", &self.written_bytes)
            .field("start", &self.start)
            .finish()
    }
}

impl<T: AsyncRead> AsyncRead for RateCounter<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();

        ready!(this.inner.poll_read(cx, buf))?;

        let diff = buf.filled().len().saturating_sub(before) as u64;
        if diff > 0 {
            *this.read_bytes = this.read_bytes.saturating_add(diff);
            this.start.get_or_insert_with(Instant::now);
        }
        Poll::Ready(Ok(()))
    }
}

impl<T: AsyncWrite> AsyncWrite for RateCounter<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        let n = ready!(this.inner.poll_write(cx, buf))?;
        *this.written_bytes = this.written_bytes.saturating_add(n as u64);
        Poll::Ready(Ok(n))
    }

    #[inline]
    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    #[inline]
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }

    #[inline]
    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        let n = ready!(this.inner.poll_write_vectored(cx, bufs))?;
        *this.written_bytes = this.written_bytes.saturating_add(n as u64);
        Poll::Ready(Ok(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{self, AsyncReadExt, AsyncWriteExt};
    use tokio::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn counts_both_directions() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut stream = RateCounter::new(client);

        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();

        server.write_all(b"hello world").await.unwrap();
        let mut buf = vec![0u8; 11];
        stream.read_exact(&mut buf).await.unwrap();

        assert_eq!(buf, b"hello world");
        assert_eq!(stream.read_total(), 11);
        assert_eq!(stream.written_total(), 4);
        assert!(stream.start_instant().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_uses_virtual_time() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut stream = RateCounter::new(client);

        server.write_all(&[1u8; 10]).await.unwrap();
        let mut buf = [0u8; 10];
        stream.read_exact(&mut buf).await.unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        let rate = stream.read_rate_bps().unwrap();
        assert!((rate - 5.0).abs() < 0.1, "rate {rate}");

        stream.reset();
        assert_eq!(stream.read_total(), 0);
        assert!(stream.read_rate_bps().is_none());
    }

    #[tokio::test]
    async fn zero_byte_reads_do_not_start_timer() {
        // `io::empty()` yields EOF with zero bytes.
        let mut stream = RateCounter::new(io::empty());
        let mut buf = [0u8; 8];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
        assert_eq!(stream.read_total(), 0);
        assert!(stream.read_rate_bps().is_none());
        assert!(stream.start_instant().is_none());
    }
}
