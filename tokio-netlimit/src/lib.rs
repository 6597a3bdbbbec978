//! Bandwidth-limited Tokio streams.
//!
//! `tokio-netlimit` throttles the bytes read from and written to any
//! `AsyncRead`/`AsyncWrite` stream with pluggable, shareable [`limiter::Limiter`]s, and plugs
//! the same wrapper into hyper's client as a connector:
//!
//! - [`conn::RateLimitedConnection`]: the stream wrapper, with chunked
//!   [`read_chunked`](conn::RateLimitedConnection::read_chunked) /
//!   [`write_chunked`](conn::RateLimitedConnection::write_chunked) calls that report partial
//!   progress, and a plain `AsyncRead`/`AsyncWrite` surface.
//! - [`limiter::TokenBucket`]: the bundled byte-per-second token bucket.
//! - [`http::new_client`] / [`http::RateLimitedConnector`]: throttle every connection an HTTP
//!   client dials.
//! - [`config::BandwidthConfig`]: serde-friendly settings producing limiter pairs.
//! - [`io::NetLimitExt`]: `.limit_rate(..)` on any stream.
//!
//! ```no_run
//! use tokio::io::{self, AsyncWriteExt};
//! use tokio::net::TcpStream;
//! use tokio_netlimit::io::NetLimitExt;
//! use tokio_netlimit::limiter::TokenBucket;
//!
//! # #[tokio::main]
//! # async fn main() -> io::Result<()> {
//! let mut stream = TcpStream::connect("127.0.0.1:12345")
//!     .await?
//!     .limit_rate(None, Some(TokenBucket::new(32 * 1024, 4 * 1024))); // 32 KiB/s up
//!
//! stream.write_all(&[0u8; 256 * 1024]).await?; // ~8s
//! stream.shutdown().await?;
//! # Ok(()) }
//! ```
pub mod config;
pub mod conn;
pub mod http;
pub mod io;
pub mod limiter;
pub mod utils;

#[cfg(test)]
mod testing;

pub use conn::{RateLimitedConnection, TransferError, TransferErrorKind};
pub use limiter::{LimitError, Limiter, SharedLimiter, TokenBucket};
