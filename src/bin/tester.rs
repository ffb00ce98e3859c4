//! Small load generator (spec.md section 4.8 supplement): synthesizes
//! `logs`-topic frames at a configurable rate and publishes them to the
//! subscriber's direct-push ingress port, for manual smoke-testing.

use clap::Parser;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::time::{interval, Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use logjam_importer::wire::write_frames;

#[derive(Parser, Debug)]
#[command(name = "logjam-tester", about = "Synthetic load generator for the importer's ingress port")]
struct Args {
    /// Subscriber direct-push address to connect to.
    #[arg(long, default_value = "127.0.0.1:9605")]
    target: String,

    /// Stream key to publish under, e.g. `shop-production`.
    #[arg(long, default_value = "shop-production")]
    stream: String,

    /// Frames per second.
    #[arg(long, default_value_t = 10)]
    rate: u64,

    /// Stop after this many frames; 0 means run until interrupted.
    #[arg(long, default_value_t = 0)]
    count: u64,
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let args = Args::parse();

    let mut socket = TcpStream::connect(&args.target).await?;
    info!(target = %args.target, rate = args.rate, "tester connected");

    let period = Duration::from_millis((1000 / args.rate.max(1)).max(1));
    let mut ticker = interval(period);
    let mut sent: u64 = 0;

    loop {
        ticker.tick().await;
        let body = synthetic_request(sent);
        let bytes = serde_json::to_vec(&body).expect("synthetic payload always serializes");
        if write_frames(&mut socket, &[args.stream.as_bytes(), b"logs", &bytes]).await.is_err() {
            warn!("tester write failed, reconnecting");
            socket = TcpStream::connect(&args.target).await?;
            continue;
        }
        sent += 1;
        if args.count != 0 && sent >= args.count {
            info!(sent, "tester reached configured count, exiting");
            break;
        }
    }
    Ok(())
}

fn synthetic_request(seq: u64) -> serde_json::Value {
    let now = chrono::Utc::now().naive_utc().format("%Y-%m-%dT%H:%M:%S%.3f").to_string();
    json!({
        "action": "Orders#show",
        "code": 200,
        "started_at": now,
        "total_time": 40.0 + (seq % 50) as f64,
        "db_time": 5.0,
        "view_time": 10.0,
        "request_id": format!("{:032x}", seq),
        "request_info": {"url": "/orders/show"},
    })
}
