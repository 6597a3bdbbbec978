//! Extension trait for bolting rate limits onto any stream.
//!
//! [`NetLimitExt`] is blanket-implemented for every `AsyncRead + AsyncWrite` type, so sockets,
//! in-memory pipes and already-wrapped streams can be throttled without naming
//! [`RateLimitedConnection`] explicitly.
//!
//! ```no_run
//! use tokio::io::{self, AsyncReadExt, AsyncWriteExt};
//! use tokio::net::TcpStream;
//! use tokio_netlimit::io::NetLimitExt;
//! use tokio_netlimit::limiter::TokenBucket;
//!
//! # #[tokio::main]
//! # async fn main() -> io::Result<()> {
//! let download = TokenBucket::new(64 * 1024, 8 * 1024);
//! let upload = TokenBucket::new(16 * 1024, 4 * 1024);
//!
//! let mut stream = TcpStream::connect("127.0.0.1:12345")
//!     .await?
//!     .limit_rate(Some(download.clone()), Some(upload.clone()));
//!
//! stream.write_all(b"ping").await?;
//! let mut buf = [0u8; 4];
//! stream.read_exact(&mut buf).await?; // assumes the peer echoes data back
//!
//! download.set_rate(1024); // every stream sharing `download` slows down
//! # Ok(()) }
//! ```
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::{conn::RateLimitedConnection, limiter::SharedLimiter};

/// Stream ergonomics for [`RateLimitedConnection`].
pub trait NetLimitExt: AsyncRead + AsyncWrite {
    /// Throttle reads with `read` and writes with `write`. `None` leaves a direction untouched.
    #[must_use]
    fn limit_rate(
        self,
        read: Option<SharedLimiter>,
        write: Option<SharedLimiter>,
    ) -> RateLimitedConnection<Self>
    where
        Self: Sized,
    {
        RateLimitedConnection::new(self, read, write)
    }

    /// Same as [`limit_rate`](Self::limit_rate), aborting limiter waits once `token` is
    /// cancelled.
    #[must_use]
    fn limit_rate_cancellable(
        self,
        read: Option<SharedLimiter>,
        write: Option<SharedLimiter>,
        token: CancellationToken,
    ) -> RateLimitedConnection<Self>
    where
        Self: Sized,
    {
        RateLimitedConnection::new(self, read, write).with_cancellation(token)
    }
}

impl<T: AsyncRead + AsyncWrite> NetLimitExt for T {}
