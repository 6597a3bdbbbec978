use std::{path::PathBuf, time};

use bytes::Bytes;
use clap::Parser;
use http_body_util::{BodyExt, Empty};
use hyper::Uri;
use tokio::{
    fs::File,
    io::{self, AsyncWrite, AsyncWriteExt},
    signal,
    time::timeout,
};
use tokio_netlimit::{
    config::{BandwidthConfig, RateLimit},
    http::new_client,
};
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Config {
    /// URL to download, e.g. http://127.0.0.1:8080/big.bin
    url: Uri,

    /// Download bandwidth in bytes per second, 0 for unlimited
    #[arg(long, value_name = "bytes/s", default_value_t = 0)]
    read_rate: usize,

    /// Largest download burst in bytes, defaults to the rate
    #[arg(long, value_name = "bytes")]
    read_burst: Option<usize>,

    /// Upload bandwidth in bytes per second, 0 for unlimited
    #[arg(long, value_name = "bytes/s", default_value_t = 0)]
    write_rate: usize,

    /// Largest upload burst in bytes, defaults to the rate
    #[arg(long, value_name = "bytes")]
    write_burst: Option<usize>,

    /// Write the body here instead of stdout
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Abort the download after this long, 0 waits forever
    #[arg(long, value_name = "ms", default_value_t = 0)]
    timeout_ms: u64,
}

impl Config {
    fn validate(&self) -> anyhow::Result<()> {
        if self.url.scheme_str() != Some("http") {
            anyhow::bail!("only http:// URLs are supported (got {})", self.url);
        }
        if self.url.host().is_none() {
            anyhow::bail!("URL has no host: {}", self.url);
        }

        self.bandwidth().validate()?;
        Ok(())
    }

    fn bandwidth(&self) -> BandwidthConfig {
        let limit = |rate: usize, burst: Option<usize>| {
            (rate > 0).then_some(RateLimit {
                bytes_per_sec: rate,
                burst,
            })
        };

        BandwidthConfig {
            read: limit(self.read_rate, self.read_burst),
            write: limit(self.write_rate, self.write_burst),
        }
    }
}

async fn download(
    config: &Config,
    out: &mut (dyn AsyncWrite + Unpin + Send),
) -> anyhow::Result<u64> {
    let (read, write) = config.bandwidth().limiters();
    let client = new_client::<Empty<Bytes>>(None, read, write);

    let res = client.get(config.url.clone()).await?;
    let status = res.status();
    debug!(%status, headers = ?res.headers(), "response");
    if !status.is_success() {
        anyhow::bail!("server answered {status}");
    }

    let mut body = res.into_body();
    let mut total = 0u64;
    while let Some(frame) = body.frame().await {
        if let Ok(data) = frame?.into_data() {
            out.write_all(&data).await?;
            total += data.len() as u64;
        }
    }
    out.flush().await?;

    Ok(total)
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();
    let config = Config::parse();
    config.validate()?;

    let mut out: Box<dyn AsyncWrite + Unpin + Send> = match &config.output {
        Some(path) => Box::new(File::create(path).await?),
        None => Box::new(io::stdout()),
    };

    info!(
        url = %config.url,
        read_rate = config.read_rate,
        write_rate = config.write_rate,
        "downloading"
    );

    let start = time::Instant::now();
    let fut = download(&config, out.as_mut());

    let res = tokio::select! {
        res = async {
            if config.timeout_ms > 0 {
                match timeout(time::Duration::from_millis(config.timeout_ms), fut).await {
                    Ok(res) => res,
                    Err(_) => Err(anyhow::anyhow!(
                        "download timed out after {}ms",
                        config.timeout_ms
                    )),
                }
            } else {
                fut.await
            }
        } => res,
        _ = signal::ctrl_c() => {
            warn!("Received Ctrl-C, aborting download");
            return Ok(());
        }
    };

    let total = res?;
    let elapsed = start.elapsed();
    let rate = total as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
    info!(bytes = total, ?elapsed, rate_bps = rate.round() as u64, "done");

    Ok(())
}
