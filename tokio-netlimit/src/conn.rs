//! Rate-limited duplex connections.
//!
//! [`RateLimitedConnection`] wraps any stream and throttles the bytes read and written through
//! it with up to two [`Limiter`]s, one per direction. A direction without a limiter is a pure
//! pass-through.
//!
//! Two surfaces are offered:
//! - [`read_chunked`](RateLimitedConnection::read_chunked) /
//!   [`write_chunked`](RateLimitedConnection::write_chunked) process a whole buffer in
//!   limiter-sized slices, charging the limiter for each slice before moving on. Failures report
//!   the bytes already transferred alongside the cause, see [`TransferError`].
//! - [`AsyncRead`] / [`AsyncWrite`] make the wrapper a drop-in replacement for the wrapped stream
//!   (this is what the hyper connector in [`crate::http`] hands out).
//!
//! ## Example
//! ```no_run
//! use tokio::io::{self, AsyncWriteExt};
//! use tokio::net::TcpStream;
//! use tokio_netlimit::conn::RateLimitedConnection;
//! use tokio_netlimit::limiter::TokenBucket;
//!
//! # #[tokio::main]
//! # async fn main() -> io::Result<()> {
//! let stream = TcpStream::connect("127.0.0.1:12345").await?;
//! let upload = TokenBucket::new(32 * 1024, 4 * 1024); // 32 KiB/s, 4 KiB per slice
//! let mut conn = RateLimitedConnection::new(stream, None, Some(upload));
//!
//! let sent = conn.write_chunked(&[0u8; 100 * 1024]).await?;
//! assert_eq!(sent, 100 * 1024);
//! conn.shutdown().await?;
//! # Ok(()) }
//! ```
//!
//! ## Under the hood
//! - The limiter's [`limit`](Limiter::limit) is read at the start of every call and bounds the
//!   size of each underlying read or write. A limit of `0` means "unlimited" for that call.
//! - The chunked calls charge each slice with exactly the number of bytes the inner stream
//!   transferred, never the requested slice size.
//! - `poll_read` charges the bytes it received and holds them inside the wrapper until the
//!   charge settles, so the caller never sees bytes that are not paid for.
//! - `poll_write` pays for the slice before writing it. Budget the inner stream did not use
//!   (short or pending writes) is kept for the next write in the same direction.
//! - Charges race the optional [`CancellationToken`]. Cancelling never closes the inner stream.
//! - Nothing is refunded: dropping the connection with a charge in flight leaves it charged.
use std::{
    fmt, future, io,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll},
};

use bytes::{Buf, BytesMut};
use futures::{future::BoxFuture, FutureExt};
use pin_project::pin_project;
use smallvec::SmallVec;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf},
    net::TcpStream,
};
use tokio_util::sync::CancellationToken;

use crate::limiter::{LimitError, Limiter, SharedLimiter};

/// Inline `IoSlice` capacity for the trimmed vectored-write view.
const INLINE_IOVEC: usize = 16;

type Charge = BoxFuture<'static, Result<(), LimitError>>;

/// A chunked transfer that stopped early.
///
/// `transferred` counts every byte moved before the failure, including the bytes of a slice
/// whose charge failed.
#[derive(Debug, Error)]
#[error("transfer failed after {transferred} bytes")]
pub struct TransferError {
    pub transferred: usize,
    #[source]
    pub kind: TransferErrorKind,
}

/// The cause of a [`TransferError`].
#[derive(Debug, Error)]
pub enum TransferErrorKind {
    /// The inner stream failed.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The limiter wait failed or was cancelled.
    #[error(transparent)]
    Limit(#[from] LimitError),
}

impl TransferError {
    fn io(transferred: usize, err: io::Error) -> Self {
        Self {
            transferred,
            kind: TransferErrorKind::Io(err),
        }
    }

    fn limit(transferred: usize, err: LimitError) -> Self {
        Self {
            transferred,
            kind: TransferErrorKind::Limit(err),
        }
    }
}

impl From<TransferError> for io::Error {
    fn from(err: TransferError) -> Self {
        match err.kind {
            TransferErrorKind::Io(err) => err,
            TransferErrorKind::Limit(err) => io::Error::other(err),
        }
    }
}

/// Start a charge of `n` bytes that owns its limiter handle.
fn charge(limiter: &SharedLimiter, n: usize, cancel: Option<CancellationToken>) -> Charge {
    let limiter = Arc::clone(limiter);
    Box::pin(async move {
        match cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => Err(LimitError::Cancelled),
                res = limiter.wait_n(n) => res,
            },
            None => limiter.wait_n(n).await,
        }
    })
}

/// A charge for `n` bytes, `None` when the direction is unlimited or there is nothing to pay.
fn charge_for(
    limiter: Option<&SharedLimiter>,
    n: usize,
    cancel: Option<&CancellationToken>,
) -> Option<Charge> {
    let limiter = limiter?;
    if n == 0 {
        return None;
    }
    Some(charge(limiter, n, cancel.cloned()))
}

/// Slice size for this call, `None` when the direction is not limited.
fn quota(limiter: Option<&SharedLimiter>) -> Option<usize> {
    match limiter?.limit() {
        0 => None,
        quota => Some(quota),
    }
}

/// Read direction: received bytes wait here until their charge settles.
struct ReadThrottle {
    limiter: Option<SharedLimiter>,
    pending: Option<Charge>,
    // Received, not yet handed to the caller.
    staged: BytesMut,
}

impl ReadThrottle {
    fn new(limiter: Option<SharedLimiter>) -> Self {
        Self {
            limiter,
            pending: None,
            staged: BytesMut::new(),
        }
    }

    fn quota(&self) -> Option<usize> {
        quota(self.limiter.as_ref())
    }

    fn poll_settle(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), LimitError>> {
        let Some(pending) = self.pending.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        let res = ready!(pending.poll_unpin(cx));
        self.pending = None;
        Poll::Ready(res)
    }

    async fn settle(&mut self) -> Result<(), LimitError> {
        future::poll_fn(|cx| self.poll_settle(cx)).await
    }

    /// Charge `n` freshly read bytes, keeping the charge if it cannot finish now.
    fn begin(
        &mut self,
        cx: &mut Context<'_>,
        n: usize,
        cancel: Option<&CancellationToken>,
    ) -> Poll<Result<(), LimitError>> {
        let Some(mut fut) = charge_for(self.limiter.as_ref(), n, cancel) else {
            return Poll::Ready(Ok(()));
        };

        let res = fut.poll_unpin(cx);
        if res.is_pending() {
            tracing::trace!(bytes = n, "read held until charged");
            self.pending = Some(fut);
        }
        res
    }

    /// Move staged bytes into `dst`.
    fn unstage(&mut self, dst: &mut [u8]) -> usize {
        let n = self.staged.len().min(dst.len());
        dst[..n].copy_from_slice(&self.staged[..n]);
        self.staged.advance(n);
        n
    }
}

/// Write direction: budget is bought before a slice goes out.
struct WriteThrottle {
    limiter: Option<SharedLimiter>,
    // Bytes being bought, with their charge.
    pending: Option<(usize, Charge)>,
    // Bought but not yet written.
    prepaid: usize,
}

impl WriteThrottle {
    fn new(limiter: Option<SharedLimiter>) -> Self {
        Self {
            limiter,
            pending: None,
            prepaid: 0,
        }
    }

    fn quota(&self) -> Option<usize> {
        quota(self.limiter.as_ref())
    }

    fn poll_settle(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), LimitError>> {
        let Some((n, pending)) = self.pending.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        let n = *n;
        let res = ready!(pending.poll_unpin(cx));
        self.pending = None;
        if res.is_ok() {
            self.prepaid += n;
        }
        Poll::Ready(res)
    }

    async fn settle(&mut self) -> Result<(), LimitError> {
        future::poll_fn(|cx| self.poll_settle(cx)).await
    }

    /// Resolve once `want` bytes are paid for.
    fn poll_reserve(
        &mut self,
        cx: &mut Context<'_>,
        want: usize,
        cancel: Option<&CancellationToken>,
    ) -> Poll<Result<(), LimitError>> {
        ready!(self.poll_settle(cx))?;
        if self.prepaid >= want {
            return Poll::Ready(Ok(()));
        }

        let need = want - self.prepaid;
        let Some(fut) = charge_for(self.limiter.as_ref(), need, cancel) else {
            return Poll::Ready(Ok(()));
        };
        self.pending = Some((need, fut));

        let res = self.poll_settle(cx);
        if res.is_pending() {
            tracing::trace!(bytes = need, "write waiting for budget");
        }
        res
    }

    /// Spend budget on `n` written bytes, returning the part that is still owed.
    fn spend(&mut self, n: usize) -> usize {
        let covered = self.prepaid.min(n);
        self.prepaid -= covered;
        n - covered
    }
}

/// A stream whose reads and writes are throttled by optional [`Limiter`]s.
///
/// The wrapper owns the inner stream; `shutdown` and every other operation are forwarded to
/// it. Limiters are shared handles and may throttle any number of connections at once.
#[pin_project]
pub struct RateLimitedConnection<S> {
    #[pin]
    inner: S,
    read: ReadThrottle,
    write: WriteThrottle,
    cancel: Option<CancellationToken>,
}

impl<S> RateLimitedConnection<S> {
    /// Wrap `inner`, limiting reads with `read` and writes with `write`.
    ///
    /// `None` leaves that direction unthrottled.
    pub fn new(inner: S, read: Option<SharedLimiter>, write: Option<SharedLimiter>) -> Self {
        Self {
            inner,
            read: ReadThrottle::new(read),
            write: WriteThrottle::new(write),
            cancel: None,
        }
    }

    /// Abort limiter waits with [`LimitError::Cancelled`] once `token` is cancelled.
    ///
    /// Without a token, waits last as long as the limiter needs.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn read_limiter(&self) -> Option<&SharedLimiter> {
        self.read.limiter.as_ref()
    }

    pub fn write_limiter(&self) -> Option<&SharedLimiter> {
        self.write.limiter.as_ref()
    }

    /// Immutable access to the inner stream.
    #[inline]
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Mutable access to the inner stream.
    ///
    /// I/O performed directly on it bypasses the limiters.
    #[inline]
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Pinned mutable access to the inner stream.
    #[inline]
    pub fn get_pin_mut(self: Pin<&mut Self>) -> Pin<&mut S> {
        self.project().inner
    }

    /// Consume the wrapper and return the inner stream.
    ///
    /// Bytes held back by an unfinished read charge are discarded. Charges already started stay
    /// charged.
    #[inline]
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> RateLimitedConnection<S> {
    /// Fill `buf` from the inner stream one limiter-sized slice at a time.
    ///
    /// Each slice is charged before the next one is read. Reading stops early at end of stream,
    /// returning the bytes read so far. Without a read limiter this is a single plain read.
    pub async fn read_chunked(&mut self, buf: &mut [u8]) -> Result<usize, TransferError> {
        self.read
            .settle()
            .await
            .map_err(|err| TransferError::limit(0, err))?;

        // Bytes held back by `poll_read` are paid for already.
        let mut n = self.read.unstage(buf);

        let Some(quota) = self.read.quota() else {
            if n > 0 {
                return Ok(n);
            }
            return self
                .inner
                .read(buf)
                .await
                .map_err(|err| TransferError::io(0, err));
        };

        let total = buf.len();
        let chunk = total.min(quota);

        while n < total {
            let end = (n + chunk).min(total);
            let nr = match self.inner.read(&mut buf[n..end]).await {
                Ok(0) => break,
                Ok(nr) => nr,
                Err(err) => return Err(TransferError::io(n, err)),
            };
            n += nr;

            let charge = charge_for(self.read.limiter.as_ref(), nr, self.cancel.as_ref());
            if let Some(charge) = charge {
                charge.await.map_err(|err| TransferError::limit(n, err))?;
            }
        }

        Ok(n)
    }
}

impl<S: AsyncWrite + Unpin> RateLimitedConnection<S> {
    /// Write all of `buf` to the inner stream one limiter-sized slice at a time.
    ///
    /// Each slice is charged before the next one is written. Without a write limiter this is a
    /// single plain write, which may be short.
    pub async fn write_chunked(&mut self, buf: &[u8]) -> Result<usize, TransferError> {
        self.write
            .settle()
            .await
            .map_err(|err| TransferError::limit(0, err))?;

        let Some(quota) = self.write.quota() else {
            return self
                .inner
                .write(buf)
                .await
                .map_err(|err| TransferError::io(0, err));
        };

        let total = buf.len();
        let chunk = total.min(quota);
        let mut n = 0;

        while n < total {
            let end = (n + chunk).min(total);
            let nw = match self.inner.write(&buf[n..end]).await {
                Ok(0) => {
                    return Err(TransferError::io(
                        n,
                        io::Error::new(io::ErrorKind::WriteZero, "failed to write whole buffer"),
                    ))
                }
                Ok(nw) => nw,
                Err(err) => return Err(TransferError::io(n, err)),
            };
            n += nw;

            // Budget bought by `poll_write` covers the first bytes.
            let owed = self.write.spend(nw);
            let charge = charge_for(self.write.limiter.as_ref(), owed, self.cancel.as_ref());
            if let Some(charge) = charge {
                charge.await.map_err(|err| TransferError::limit(n, err))?;
            }
        }

        Ok(n)
    }
}

impl RateLimitedConnection<TcpStream> {
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }

    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        self.inner.set_nodelay(nodelay)
    }
}

impl<S: AsyncRead> AsyncRead for RateLimitedConnection<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let read = this.read;

        ready!(read.poll_settle(cx)).map_err(io::Error::other)?;

        if !read.staged.is_empty() {
            let want = read.staged.len().min(buf.remaining());
            let n = read.unstage(buf.initialize_unfilled_to(want));
            buf.advance(n);
            return Poll::Ready(Ok(()));
        }

        let Some(quota) = read.quota() else {
            return this.inner.poll_read(cx, buf);
        };

        let want = buf.remaining().min(quota);
        if want == 0 {
            return Poll::Ready(Ok(()));
        }

        // Expose at most `want` bytes of the caller's buffer to the inner stream.
        let n = {
            let mut slice = ReadBuf::new(buf.initialize_unfilled_to(want));
            ready!(this.inner.poll_read(cx, &mut slice))?;
            slice.filled().len()
        };

        match read.begin(cx, n, this.cancel.as_ref()) {
            Poll::Ready(Ok(())) => {
                buf.advance(n);
                Poll::Ready(Ok(()))
            }
            // Keep the bytes: they are handed out by the next read.
            Poll::Ready(Err(err)) => {
                read.staged.extend_from_slice(&buf.initialize_unfilled_to(n)[..n]);
                Poll::Ready(Err(io::Error::other(err)))
            }
            Poll::Pending => {
                read.staged.extend_from_slice(&buf.initialize_unfilled_to(n)[..n]);
                Poll::Pending
            }
        }
    }
}

impl<S: AsyncWrite> AsyncWrite for RateLimitedConnection<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();

        let Some(quota) = this.write.quota() else {
            return this.inner.poll_write(cx, buf);
        };

        let want = buf.len().min(quota);
        if want == 0 {
            return Poll::Ready(Ok(0));
        }

        let reserved = ready!(this.write.poll_reserve(cx, want, this.cancel.as_ref()));
        reserved.map_err(io::Error::other)?;

        let n = ready!(this.inner.poll_write(cx, &buf[..want]))?;
        this.write.spend(n);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();

        let Some(quota) = this.write.quota() else {
            return this.inner.poll_write_vectored(cx, bufs);
        };

        let total: usize = bufs.iter().map(|b| b.len()).sum();
        let want = total.min(quota);
        if want == 0 {
            return Poll::Ready(Ok(0));
        }

        let reserved = ready!(this.write.poll_reserve(cx, want, this.cancel.as_ref()));
        reserved.map_err(io::Error::other)?;

        // Build a view truncated to the quota without heap allocs in the common case.
        let mut remaining = want;
        let mut slices: SmallVec<[io::IoSlice<'_>; INLINE_IOVEC]> = SmallVec::new();
        for s in bufs {
            if remaining == 0 {
                break;
            }
            let take = s.len().min(remaining);
            slices.push(io::IoSlice::new(&s[..take]));
            remaining -= take;
        }

        let n = ready!(this.inner.poll_write_vectored(cx, &slices))?;
        this.write.spend(n);
        Poll::Ready(Ok(n))
    }
}

impl<S: fmt::Debug> fmt::Debug for RateLimitedConnection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitedConnection")
            .field("inner", &self.inner)
            .field("read_limited", &self.read.limiter.is_some())
            .field("write_limited", &self.write.limiter.is_some())
            .field("staged", &self.read.staged.len())
            .field("prepaid", &self.write.prepaid)
            .finish()
    }
}
