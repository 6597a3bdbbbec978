use std::time::Instant;

use tokio::{
    io::{self, AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tokio_netlimit::{
    io::NetLimitExt,
    limiter::{SharedLimiter, TokenBucket},
    utils::rate_counter::RateCounter,
};

const PAYLOAD: usize = 64 * 1024;

#[tokio::main]
async fn main() -> io::Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    // Sink: drain everything and report the observed rate.
    let sink = tokio::spawn(async move {
        let (stream, _) = listener.accept().await?;
        let mut stream = RateCounter::new(stream);
        let mut buf = vec![0u8; 8 * 1024];
        while stream.read(&mut buf).await? > 0 {}
        Ok::<_, io::Error>((stream.read_total(), stream.read_rate_bps().unwrap_or(0.0)))
    });

    // 16 KiB/s upload, so the payload takes ~3s after the initial burst.
    let upload: SharedLimiter = TokenBucket::new(16 * 1024, 16 * 1024);
    let mut stream = TcpStream::connect(addr)
        .await?
        .limit_rate(None, Some(upload));

    let start = Instant::now();
    let sent = stream
        .write_chunked(&[7u8; PAYLOAD])
        .await
        .map_err(io::Error::from)?;
    stream.shutdown().await?;

    let (received, rate) = sink.await.map_err(io::Error::other)??;
    println!(
        "sent {sent} bytes, received {received} in {:?} (~{rate:.0} B/s at the sink)",
        start.elapsed()
    );

    Ok(())
}
