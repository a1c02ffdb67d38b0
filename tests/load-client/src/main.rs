//! Load client for a running relay.
//!
//! One publisher POSTs random bytes chunk by chunk while `--subscribers`
//! clients GET the same path and compare what they receive with what was
//! published.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use http::header::{CONTENT_LENGTH, HOST};
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Empty, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper_util::rt::TokioIo;
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing_subscriber::EnvFilter;

/// Attempts a subscriber makes while the upload is not yet registered.
const JOIN_ATTEMPTS: u32 = 200;

#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Relay address.
    #[arg(long, default_value = "127.0.0.1:8080")]
    addr: SocketAddr,

    /// Target as `dir/name`.
    #[arg(long, default_value = "abc/test.bin")]
    name: String,

    /// Bytes to publish.
    #[arg(long, default_value_t = 1024 * 1024)]
    size: usize,

    /// Concurrent downloaders.
    #[arg(long, default_value_t = 4)]
    subscribers: usize,

    /// Bytes per published chunk.
    #[arg(long, default_value_t = 1024)]
    chunk_size: usize,

    /// Pause between published chunks, in milliseconds.
    #[arg(long, default_value_t = 1)]
    delay_ms: u64,
}

impl Args {
    fn target(&self) -> String {
        format!("/{}", self.name.trim_start_matches('/'))
    }
}

/// Outcome of one subscriber.
#[derive(Debug, PartialEq, Eq)]
enum Verdict {
    Match,
    Short { received: usize },
    Differs { offset: usize },
}

fn verify(expected: &[u8], received: &[u8]) -> Verdict {
    if let Some(offset) = expected
        .iter()
        .zip(received)
        .position(|(a, b)| a != b)
    {
        return Verdict::Differs { offset };
    }
    match received.len().cmp(&expected.len()) {
        std::cmp::Ordering::Equal => Verdict::Match,
        std::cmp::Ordering::Less => Verdict::Short {
            received: received.len(),
        },
        std::cmp::Ordering::Greater => Verdict::Differs {
            offset: expected.len(),
        },
    }
}

async fn send<B>(addr: SocketAddr, req: Request<B>) -> anyhow::Result<Response<Incoming>>
where
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("connect {addr}"))?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!("connection closed: {e}");
        }
    });
    Ok(sender.send_request(req).await?)
}

async fn publish(args: Arc<Args>, data: Bytes) -> anyhow::Result<StatusCode> {
    let (tx, rx) = mpsc::channel::<Result<Frame<Bytes>, io::Error>>(8);
    let req = Request::post(args.target())
        .header(HOST, args.addr.to_string())
        .header(CONTENT_LENGTH, data.len())
        .body(StreamBody::new(ReceiverStream::new(rx)))?;

    let feeder = {
        let args = Arc::clone(&args);
        tokio::spawn(async move {
            let mut offset = 0;
            while offset < data.len() {
                let end = (offset + args.chunk_size).min(data.len());
                if tx.send(Ok(Frame::data(data.slice(offset..end)))).await.is_err() {
                    break;
                }
                offset = end;
                if args.delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(args.delay_ms)).await;
                }
            }
            offset
        })
    };

    let resp = send(args.addr, req).await?;
    let sent = feeder.await?;
    tracing::info!(sent, status = %resp.status(), "publisher finished");
    Ok(resp.status())
}

async fn subscribe(args: Arc<Args>, id: usize, expected: Bytes) -> anyhow::Result<Verdict> {
    let mut attempts = 0;
    let resp = loop {
        let req = Request::get(args.target())
            .header(HOST, args.addr.to_string())
            .body(Empty::<Bytes>::new())?;
        let resp = send(args.addr, req).await?;
        if resp.status() != StatusCode::NOT_FOUND {
            break resp;
        }
        attempts += 1;
        anyhow::ensure!(attempts < JOIN_ATTEMPTS, "upload never appeared");
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    anyhow::ensure!(
        resp.status() == StatusCode::OK,
        "subscriber {id}: unexpected status {}",
        resp.status()
    );

    let received = resp
        .into_body()
        .collect()
        .await
        .with_context(|| format!("subscriber {id}: body"))?
        .to_bytes();
    let verdict = verify(&expected, &received);
    tracing::info!(id, bytes = received.len(), ?verdict, "subscriber finished");
    Ok(verdict)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Arc::new(Args::parse());
    anyhow::ensure!(args.size > 0, "--size must be positive");
    anyhow::ensure!(args.chunk_size > 0, "--chunk-size must be positive");

    let mut buf = vec![0u8; args.size];
    rand::thread_rng().fill(&mut buf[..]);
    let data = Bytes::from(buf);

    tracing::info!(
        addr = %args.addr,
        target = %args.target(),
        size = args.size,
        subscribers = args.subscribers,
        "starting load run"
    );
    let started = Instant::now();

    let publisher = tokio::spawn(publish(Arc::clone(&args), data.clone()));
    let subscribers: Vec<_> = (0..args.subscribers)
        .map(|id| tokio::spawn(subscribe(Arc::clone(&args), id, data.clone())))
        .collect();

    let status = publisher.await??;
    let mut failed = 0;
    for (id, handle) in subscribers.into_iter().enumerate() {
        match handle.await? {
            Ok(Verdict::Match) => {}
            Ok(verdict) => {
                tracing::error!(id, ?verdict, "subscriber mismatch");
                failed += 1;
            }
            Err(e) => {
                tracing::error!(id, "subscriber failed: {e:#}");
                failed += 1;
            }
        }
    }

    tracing::info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        %status,
        failed,
        "load run complete"
    );
    anyhow::ensure!(status == StatusCode::OK, "publisher got {status}");
    anyhow::ensure!(failed == 0, "{failed} subscriber(s) did not receive the upload intact");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flags() {
        let args = Args::try_parse_from([
            "load-client",
            "--addr",
            "10.0.0.1:9000",
            "--name",
            "room/live.flv",
            "--size",
            "300000",
            "--subscribers",
            "2",
            "--chunk-size",
            "1024",
        ])
        .unwrap();
        assert_eq!(args.addr, "10.0.0.1:9000".parse().unwrap());
        assert_eq!(args.target(), "/room/live.flv");
        assert_eq!(args.size, 300_000);
        assert_eq!(args.subscribers, 2);
        assert_eq!(args.delay_ms, 1);
    }

    #[test]
    fn verify_reports_first_difference() {
        assert_eq!(verify(b"abcdef", b"abcdef"), Verdict::Match);
        assert_eq!(verify(b"abcdef", b"abc"), Verdict::Short { received: 3 });
        assert_eq!(verify(b"abcdef", b"abXdef"), Verdict::Differs { offset: 2 });
        assert_eq!(verify(b"abc", b"abcd"), Verdict::Differs { offset: 3 });
    }
}
