//! Rate-limited connectors for hyper's client.
//!
//! [`RateLimitedConnector`] decorates another connector (the dial step of a hyper-util
//! [`Client`]): every connection it establishes is wrapped in a [`RateLimitedConnection`]
//! carrying the connector's read and write limiters. Pooling, request handling and the rest of
//! the client are left untouched.
//!
//! ```no_run
//! use bytes::Bytes;
//! use http_body_util::{BodyExt, Empty};
//! use tokio_netlimit::http::new_client;
//! use tokio_netlimit::limiter::TokenBucket;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! // All connections of this client share one 128 KiB/s download budget.
//! let download = TokenBucket::new(128 * 1024, 16 * 1024);
//! let client = new_client::<Empty<Bytes>>(None, Some(download), None);
//!
//! let res = client.get("http://127.0.0.1:8080/big.bin".parse()?).await?;
//! let body = res.into_body().collect().await?.to_bytes();
//! println!("downloaded {} bytes", body.len());
//! # Ok(()) }
//! ```
//!
//! The limiter references are shared, never copied: a limiter handed to a connector throttles
//! the sum of all its connections. The transfer rate is not exact at every tick but converges
//! to the configured rate over time.
use std::{
    future::Future,
    pin::Pin,
    task::{ready, Context, Poll},
};

use hyper::{body::Body, Uri};
use hyper_util::{
    client::legacy::{
        connect::{Connected, Connection, HttpConnector},
        Client,
    },
    rt::{TokioExecutor, TokioIo},
};
use pin_project::pin_project;
use tokio_util::sync::CancellationToken;
use tower_service::Service;

use crate::{conn::RateLimitedConnection, limiter::SharedLimiter};

/// Build a connector that dials with `base` (or [`HttpConnector::new`]) and throttles every
/// connection it returns.
///
/// `read` limits bytes received, `write` limits bytes sent; `None` leaves a direction
/// unlimited.
pub fn new_transport(
    base: Option<HttpConnector>,
    read: Option<SharedLimiter>,
    write: Option<SharedLimiter>,
) -> RateLimitedConnector<HttpConnector> {
    let base = base.unwrap_or_else(HttpConnector::new);
    RateLimitedConnector::new(base, read, write)
}

/// Build a hyper-util [`Client`] over [`new_transport`].
pub fn new_client<B>(
    base: Option<HttpConnector>,
    read: Option<SharedLimiter>,
    write: Option<SharedLimiter>,
) -> Client<RateLimitedConnector<HttpConnector>, B>
where
    B: Body + Send,
    B::Data: Send,
{
    Client::builder(TokioExecutor::new()).build(new_transport(base, read, write))
}

/// A connector whose connections are wrapped in [`RateLimitedConnection`].
///
/// Dial failures of the inner connector are returned untouched; no wrapper is built and no
/// limiter is charged.
#[derive(Clone)]
pub struct RateLimitedConnector<C> {
    inner: C,
    read: Option<SharedLimiter>,
    write: Option<SharedLimiter>,
    cancel: Option<CancellationToken>,
}

impl<C> RateLimitedConnector<C> {
    pub fn new(inner: C, read: Option<SharedLimiter>, write: Option<SharedLimiter>) -> Self {
        Self {
            inner,
            read,
            write,
            cancel: None,
        }
    }

    /// Hand `token` to every connection so cancelling it aborts their limiter waits.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn read_limiter(&self) -> Option<&SharedLimiter> {
        self.read.as_ref()
    }

    pub fn write_limiter(&self) -> Option<&SharedLimiter> {
        self.write.as_ref()
    }

    /// The connector used for dialing.
    pub fn get_ref(&self) -> &C {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut C {
        &mut self.inner
    }
}

impl<C, S> Service<Uri> for RateLimitedConnector<C>
where
    C: Service<Uri, Response = TokioIo<S>>,
{
    type Response = TokioIo<RateLimitedConnection<S>>;
    type Error = C::Error;
    type Future = Connecting<C::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        tracing::debug!(
            %dst,
            read_limited = self.read.is_some(),
            write_limited = self.write.is_some(),
            "dialing"
        );

        Connecting {
            dial: self.inner.call(dst),
            read: self.read.clone(),
            write: self.write.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

/// Future returned by [`RateLimitedConnector`]: the inner dial, then the wrapping.
#[pin_project]
#[must_use = "futures do nothing unless polled"]
pub struct Connecting<F> {
    #[pin]
    dial: F,
    read: Option<SharedLimiter>,
    write: Option<SharedLimiter>,
    cancel: Option<CancellationToken>,
}

impl<F, S, E> Future for Connecting<F>
where
    F: Future<Output = Result<TokioIo<S>, E>>,
{
    type Output = Result<TokioIo<RateLimitedConnection<S>>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        // A failed dial is handed back as is.
        let io = ready!(this.dial.poll(cx))?;

        let mut conn =
            RateLimitedConnection::new(io.into_inner(), this.read.take(), this.write.take());
        if let Some(token) = this.cancel.take() {
            conn = conn.with_cancellation(token);
        }

        Poll::Ready(Ok(TokioIo::new(conn)))
    }
}

impl<S: Connection> Connection for RateLimitedConnection<S> {
    fn connected(&self) -> Connected {
        self.get_ref().connected()
    }
}
