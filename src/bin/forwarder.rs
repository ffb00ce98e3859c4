//! Standalone forwarder (spec.md section 4.8): pulls pre-compressed payloads
//! off a local queue and republishes each as a single-frame message on a
//! PUSH-equivalent TCP connection, with a bounded send queue standing in
//! for the original's send high-water-mark.
//!
//! The original binds an inproc pull socket named `graylog-forwarder-writer`
//! and reads control commands off a parent pipe; here the inproc socket is
//! modeled as a local TCP listener accepting single-frame payload pushes,
//! and the control pipe as newline-delimited commands on stdin.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use logjam_importer::wire::{read_frames, write_frames};

#[derive(Parser, Debug)]
#[command(name = "logjam-forwarder", about = "Pulls compressed payloads and republishes them downstream")]
struct Args {
    /// Local address the forwarder listens on for payloads to relay,
    /// standing in for the inproc `graylog-forwarder-writer` pull socket.
    #[arg(long, default_value = "127.0.0.1:9701")]
    listen: String,

    /// Outbound PUSH-equivalent endpoint.
    #[arg(long, default_value = "127.0.0.1:9702")]
    push_endpoint: String,

    /// Send high-water-mark, enforced as the bounded channel's capacity.
    #[arg(long, default_value_t = 10_000)]
    hwm: usize,
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let args = Args::parse();
    let (tx, rx) = mpsc::channel::<Bytes>(args.hwm);

    let listener = TcpListener::bind(&args.listen).await?;
    info!(addr = %args.listen, "forwarder listening for payloads");
    tokio::spawn(accept_loop(listener, tx));

    let sent = Arc::new(AtomicU64::new(0));
    let push_task = tokio::spawn(push_loop(args.push_endpoint.clone(), rx, sent.clone()));

    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();
    let mut last_tick_count = 0u64;
    while let Ok(Some(line)) = lines.next_line().await {
        match line.trim() {
            "$TERM" => {
                info!("received $TERM, shutting down");
                break;
            }
            "tick" => {
                let total = sent.load(Ordering::Relaxed);
                info!(sent_since_last_tick = total - last_tick_count, total, "tick");
                last_tick_count = total;
            }
            other if !other.is_empty() => warn!(command = other, "unknown control command"),
            _ => {}
        }
    }

    push_task.abort();
    Ok(())
}

async fn accept_loop(listener: TcpListener, tx: mpsc::Sender<Bytes>) {
    loop {
        let (mut socket, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "forwarder accept failed");
                continue;
            }
        };
        let tx = tx.clone();
        tokio::spawn(async move {
            loop {
                match read_frames(&mut socket).await {
                    Ok(Some(mut frames)) if !frames.is_empty() => {
                        let payload = frames.remove(0);
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Ok(Some(_)) => warn!(peer = %peer, "dropping empty payload frame"),
                    Ok(None) => break,
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "forwarder read error");
                        break;
                    }
                }
            }
        });
    }
}

async fn push_loop(endpoint: String, mut rx: mpsc::Receiver<Bytes>, sent: Arc<AtomicU64>) {
    let mut conn: Option<TcpStream> = None;
    while let Some(payload) = rx.recv().await {
        if conn.is_none() {
            conn = TcpStream::connect(&endpoint).await.ok();
            if conn.is_none() {
                warn!(endpoint, "push endpoint unavailable, dropping payload");
                continue;
            }
        }
        let stream = conn.as_mut().expect("checked above");
        if write_frames(stream, &[&payload]).await.is_err() {
            warn!("forwarder push failed, will reconnect");
            conn = None;
        } else {
            sent.fetch_add(1, Ordering::Relaxed);
        }
    }
}
