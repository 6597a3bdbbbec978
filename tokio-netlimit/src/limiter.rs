//! Rate sources for [`RateLimitedConnection`](crate::conn::RateLimitedConnection).
//!
//! A connection consumes its limiters only through the [`Limiter`] trait:
//! - [`Limiter::limit`] reports the largest number of bytes a single charge may ask for. It is
//!   queried again on every read and write, so the value may change at runtime.
//! - [`Limiter::wait_n`] charges `n` bytes and resolves once the caller is allowed to have used
//!   them.
//!
//! Any algorithm (token bucket, leaky bucket, fixed window, a test stub) can be plugged in.
//! [`TokenBucket`] is the implementation shipped with this crate.
//!
//! ## Sharing one budget
//! ```no_run
//! use tokio::io;
//! use tokio::net::TcpStream;
//! use tokio_netlimit::conn::RateLimitedConnection;
//! use tokio_netlimit::limiter::{SharedLimiter, TokenBucket};
//!
//! # #[tokio::main]
//! # async fn main() -> io::Result<()> {
//! // 64 KiB/s shared by every connection that holds a clone of `download`.
//! let download: SharedLimiter = TokenBucket::new(64 * 1024, 16 * 1024);
//!
//! let a = TcpStream::connect("127.0.0.1:8080").await?;
//! let b = TcpStream::connect("127.0.0.1:8081").await?;
//! let _a = RateLimitedConnection::new(a, Some(download.clone()), None);
//! let _b = RateLimitedConnection::new(b, Some(download), None);
//! # Ok(()) }
//! ```
//!
//! ## Under the hood
//! - [`TokenBucket`] refills `rate` tokens per second up to `burst` using
//!   [`tokio::time::Instant`], so paused-clock tests drive it deterministically.
//! - [`wait_n`](Limiter::wait_n) takes its tokens when it is called. A wait that cannot be
//!   served immediately puts the bucket into debt and sleeps until the debt is repaid, so
//!   concurrent waiters queue up in arrival order instead of racing.
//! - Dropping a pending wait only stops the sleep; the tokens stay taken. Connections charge for
//!   bytes that already moved, so a refund would let them exceed the rate.
//! - A burst of `0` falls back to the rate.
use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::time::{sleep, Instant};

/// A shared, type-erased limiter handle.
pub type SharedLimiter = Arc<dyn Limiter>;

/// Errors produced while charging a [`Limiter`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LimitError {
    /// The wait was cancelled before the budget became available.
    #[error("rate limiter wait was cancelled")]
    Cancelled,

    /// The request can never be satisfied because it is larger than the burst size.
    #[error("requested {requested} bytes exceeds limiter burst of {burst} bytes")]
    ExceedsBurst { requested: usize, burst: usize },

    /// The limiter refused the request for an implementation-specific reason.
    #[error("rate limiter rejected the request: {0}")]
    Rejected(String),
}

/// A pluggable byte budget.
///
/// Implementations must be safe to share between connections and tasks: the same instance may
/// throttle many connections at once.
pub trait Limiter: Send + Sync {
    /// The largest number of bytes a single [`wait_n`](Self::wait_n) call may charge.
    ///
    /// `0` means there is currently no limit.
    fn limit(&self) -> usize;

    /// Consume `n` bytes of budget, resolving once they may be used.
    ///
    /// Dropping the returned future abandons the wait. Implementations should keep the bytes
    /// charged anyway: callers may charge for data that has already been transferred.
    fn wait_n(&self, n: usize) -> BoxFuture<'_, Result<(), LimitError>>;
}

impl<L: Limiter + ?Sized> Limiter for Arc<L> {
    fn limit(&self) -> usize {
        (**self).limit()
    }

    fn wait_n(&self, n: usize) -> BoxFuture<'_, Result<(), LimitError>> {
        (**self).wait_n(n)
    }
}

#[derive(Debug)]
struct Bucket {
    rate: usize,
    burst: usize,
    // Goes negative while waiters hold reservations.
    tokens: f64,
    last_update: Instant,
}

impl Bucket {
    /// Effective bucket size, a zero burst means "one second of rate".
    fn capacity(&self) -> usize {
        if self.burst == 0 {
            self.rate
        } else {
            self.burst
        }
    }

    fn refill(&mut self, now: Instant) {
        let since = now.saturating_duration_since(self.last_update).as_secs_f64();
        self.last_update = now;
        self.tokens = (self.tokens + since * self.rate as f64).min(self.capacity() as f64);
    }
}

/// A token-bucket [`Limiter`] measured in **bytes per second**.
///
/// `rate` tokens are added every second, up to `burst`. The bucket starts full. A rate of `0`
/// disables limiting entirely; a burst of `0` is replaced by the rate, so a bucket with a rate
/// always throttles.
pub struct TokenBucket {
    bucket: Mutex<Bucket>,
}

impl TokenBucket {
    /// Create a bucket refilled at `rate` bytes per second holding at most `burst` bytes.
    pub fn new(rate: usize, burst: usize) -> Arc<Self> {
        let bucket = Bucket {
            rate,
            burst,
            tokens: 0.0,
            last_update: Instant::now(),
        };
        let tokens = bucket.capacity() as f64;

        Arc::new(Self {
            bucket: Mutex::new(Bucket { tokens, ..bucket }),
        })
    }

    /// Current refill rate in bytes per second.
    pub fn rate(&self) -> usize {
        self.lock().rate
    }

    /// Current burst size in bytes. With a configured burst of `0` this is the rate.
    pub fn burst(&self) -> usize {
        self.lock().capacity()
    }

    /// Change the refill rate. Tokens accrued so far are kept.
    pub fn set_rate(&self, rate: usize) {
        let mut bucket = self.lock();
        bucket.refill(Instant::now());
        bucket.rate = rate;
        bucket.tokens = bucket.tokens.min(bucket.capacity() as f64);
    }

    /// Change the burst size, clamping the available tokens to it. `0` falls back to the rate.
    pub fn set_burst(&self, burst: usize) {
        let mut bucket = self.lock();
        bucket.refill(Instant::now());
        bucket.burst = burst;
        bucket.tokens = bucket.tokens.min(bucket.capacity() as f64);
    }

    fn lock(&self) -> MutexGuard<'_, Bucket> {
        // The bucket holds plain numbers, a panic mid-update cannot leave it unusable.
        self.bucket.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve `n` tokens and return how long the caller must wait before using them.
    fn reserve(&self, n: usize) -> Result<Duration, LimitError> {
        let mut bucket = self.lock();
        if bucket.rate == 0 || n == 0 {
            return Ok(Duration::ZERO);
        }
        if n > bucket.capacity() {
            return Err(LimitError::ExceedsBurst {
                requested: n,
                burst: bucket.capacity(),
            });
        }

        bucket.refill(Instant::now());
        bucket.tokens -= n as f64;
        if bucket.tokens >= 0.0 {
            return Ok(Duration::ZERO);
        }

        Ok(Duration::from_secs_f64(-bucket.tokens / bucket.rate as f64))
    }
}

impl Limiter for TokenBucket {
    fn limit(&self) -> usize {
        let bucket = self.lock();
        if bucket.rate == 0 {
            0
        } else {
            bucket.capacity()
        }
    }

    fn wait_n(&self, n: usize) -> BoxFuture<'_, Result<(), LimitError>> {
        // Tokens are taken now, not on first poll.
        let reserved = self.reserve(n);
        Box::pin(async move {
            let delay = reserved?;
            if delay.is_zero() {
                return Ok(());
            }

            tracing::trace!(bytes = n, ?delay, "waiting for token bucket");
            sleep(delay).await;
            Ok(())
        })
    }
}

impl fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bucket = self.lock();
        f.debug_struct("TokenBucket")
            .field("rate", &bucket.rate)
            .field("burst", &bucket.burst)
            .field("tokens", &bucket.tokens)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use tokio::time;

    #[tokio::test(start_paused = true)]
    async fn full_bucket_serves_burst_without_waiting() {
        let bucket = TokenBucket::new(100, 100);
        let start = Instant::now();

        bucket.wait_n(60).await.unwrap();
        bucket.wait_n(40).await.unwrap();

        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_bucket_waits_for_refill() {
        let bucket = TokenBucket::new(100, 100);
        bucket.wait_n(100).await.unwrap();

        let start = Instant::now();
        bucket.wait_n(50).await.unwrap();
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_millis(500), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(600), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_waiters_queue_up() {
        let bucket = TokenBucket::new(10, 10);
        bucket.wait_n(10).await.unwrap();

        let start = Instant::now();
        let (a, b) = tokio::join!(bucket.wait_n(10), bucket.wait_n(10));
        a.unwrap();
        b.unwrap();

        // The second reservation can only be repaid after the first.
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn oversize_request_is_rejected() {
        let bucket = TokenBucket::new(10, 8);
        let err = bucket.wait_n(9).await.unwrap_err();
        assert_eq!(
            err,
            LimitError::ExceedsBurst {
                requested: 9,
                burst: 8
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn zero_rate_is_unlimited() {
        let bucket = TokenBucket::new(0, 0);
        assert_eq!(bucket.limit(), 0);

        let start = Instant::now();
        bucket.wait_n(1 << 20).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_wait_stays_charged() {
        let bucket = TokenBucket::new(10, 10);
        bucket.wait_n(10).await.unwrap();

        // Reserve, then abandon after 100ms.
        let abandoned = time::timeout(Duration::from_millis(100), bucket.wait_n(10)).await;
        assert!(abandoned.is_err());

        // 9 bytes of debt remain, plus the byte asked for now.
        let start = Instant::now();
        bucket.wait_n(1).await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(990), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn wait_takes_tokens_before_it_is_polled() {
        let bucket = TokenBucket::new(10, 10);

        // Never polled.
        drop(bucket.wait_n(10));

        let start = Instant::now();
        bucket.wait_n(5).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(490));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_burst_falls_back_to_rate() {
        let bucket = TokenBucket::new(10, 0);
        assert_eq!(bucket.limit(), 10);
        assert_eq!(bucket.burst(), 10);

        let start = Instant::now();
        bucket.wait_n(10).await.unwrap();
        bucket.wait_n(10).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(990));

        let bucket = TokenBucket::new(0, 0);
        assert_eq!(bucket.limit(), 0);
        bucket.set_rate(20);
        assert_eq!(bucket.limit(), 20);

        bucket.set_burst(4);
        bucket.set_burst(0);
        assert_eq!(bucket.limit(), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn runtime_reconfiguration_is_observed() {
        let bucket = TokenBucket::new(10, 10);
        assert_eq!(bucket.limit(), 10);

        bucket.set_burst(4);
        assert_eq!(bucket.limit(), 4);
        assert_eq!(bucket.burst(), 4);

        bucket.set_rate(0);
        assert_eq!(bucket.rate(), 0);
        assert_eq!(bucket.limit(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shared_arc_delegates() {
        let bucket = TokenBucket::new(10, 10);
        let shared: SharedLimiter = bucket.clone();
        let twice: Arc<SharedLimiter> = Arc::new(shared);

        assert_eq!(twice.limit(), 10);
        assert!(twice.wait_n(5).now_or_never().unwrap().is_ok());
    }
}
