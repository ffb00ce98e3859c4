//! Entrypoint: parse CLI flags, load configuration, connect to the document
//! store, wire the worker topology, and serve `/metrics` and `/healthz`.
//!
//! Worker topology (spec.md section 4): one subscriber, four parsers, one
//! indexer, ten stats-updaters, ten request-writers, one live-stream egress
//! worker, and the controller that ticks them all once a second.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser as _;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server};
use prometheus::{Encoder, TextEncoder};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use logjam_importer::config::{Args, Settings};
use logjam_importer::controller::Controller;
use logjam_importer::debug_listener::DebugListener;
use logjam_importer::errors::ImporterError;
use logjam_importer::indexer::Indexer;
use logjam_importer::live_stream::LiveStream;
use logjam_importer::metrics;
use logjam_importer::parser::Parser as TelemetryParser;
use logjam_importer::request_writer::RequestWriter;
use logjam_importer::stats_updater::StatsUpdater;
use logjam_importer::storage::ShardClients;
use logjam_importer::subscriber::Subscriber;

const PARSER_COUNT: usize = 4;
const UPDATER_COUNT: usize = 10;
const WRITER_COUNT: usize = 10;
const CHANNEL_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> Result<(), ImporterError> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();
    info!("starting logjam importer");

    let args = Args::parse();
    let mut settings = Settings::load(&args.config_path)?;
    if !args.pattern.is_empty() {
        settings.stream_subscriptions.retain(|s| s.contains(&args.pattern));
    }
    info!(config = %args.config_path, dry_run = args.dry_run, pattern = %args.pattern, "loaded configuration");

    let registry = Arc::new(settings.build_resource_registry()?);
    let streams = Arc::new(settings.build_stream_registry());

    if args.dry_run {
        info!(streams = streams.iter().count(), "dry run: skipping document store connection and worker startup");
        return Ok(());
    }

    let shards = ShardClients::connect(&settings.database_uris()).await?;
    let cancel = CancellationToken::new();

    let addr: SocketAddr = settings
        .server_bind
        .parse()
        .map_err(|_| ImporterError::InvalidConfig(format!("invalid server_bind {}", settings.server_bind)))?;
    tokio::spawn(serve_metrics(addr));

    // Parser pool: each instance owns its inbound frame queue and its own
    // tick/reply pair with the controller.
    let mut parser_inbound_txs = Vec::with_capacity(PARSER_COUNT);
    let mut parser_tick_txs = Vec::with_capacity(PARSER_COUNT);
    let mut parser_reply_rxs = Vec::with_capacity(PARSER_COUNT);
    let mut parser_handles = Vec::with_capacity(PARSER_COUNT);

    let (indexer_notice_tx, indexer_notice_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (indexer_tick_tx, indexer_tick_rx) = mpsc::channel(1);

    let mut updater_txs = Vec::with_capacity(UPDATER_COUNT);
    let mut updater_rxs = Vec::with_capacity(UPDATER_COUNT);
    for _ in 0..UPDATER_COUNT {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        updater_txs.push(tx);
        updater_rxs.push(rx);
    }

    let mut writer_txs = Vec::with_capacity(WRITER_COUNT);
    let mut writer_rxs = Vec::with_capacity(WRITER_COUNT);
    for _ in 0..WRITER_COUNT {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        writer_txs.push(tx);
        writer_rxs.push(rx);
    }

    let (live_stream_tx, live_stream_rx) = mpsc::channel(CHANNEL_CAPACITY);

    for _ in 0..PARSER_COUNT {
        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (tick_tx, tick_rx) = mpsc::channel(1);
        let (reply_tx, reply_rx) = mpsc::channel(1);

        let parser = TelemetryParser::new(
            registry.clone(),
            streams.clone(),
            inbound_rx,
            tick_rx,
            reply_tx,
            indexer_notice_tx.clone(),
            writer_txs.clone(),
        );
        parser_handles.push(tokio::spawn(parser.run()));
        parser_inbound_txs.push(inbound_tx);
        parser_tick_txs.push(tick_tx);
        parser_reply_rxs.push(reply_rx);
    }
    drop(indexer_notice_tx);

    let debug_tx = match &settings.debug_pub_addr {
        Some(addr) => {
            let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
            let listener = DebugListener::new(addr.clone(), tx.clone());
            tokio::spawn(async move {
                if let Err(e) = listener.run().await {
                    warn!(error = %e, "debug duplication listener exited");
                }
            });
            Some(tx)
        }
        None => None,
    };

    let push_addr = format!("0.0.0.0:{}", settings.push_port);
    let subscriber = Arc::new(Subscriber::new(
        push_addr,
        settings.frontend.endpoints.values().flat_map(|m| m.values().cloned()).collect(),
        settings.stream_subscriptions.clone(),
        parser_inbound_txs,
        debug_tx,
    ));
    tokio::spawn(async move {
        if let Err(e) = subscriber.run().await {
            warn!(error = %e, "subscriber exited");
        }
    });

    let indexer = Indexer::new(shards.clone(), streams.clone(), indexer_notice_rx);
    tokio::spawn(indexer.run(indexer_tick_rx));

    for (id, rx) in updater_rxs.into_iter().enumerate() {
        let updater = StatsUpdater::new(id, registry.clone(), shards.clone(), rx);
        tokio::spawn(updater.run());
    }

    for (id, rx) in writer_rxs.into_iter().enumerate() {
        let writer = RequestWriter::new(id, registry.clone(), shards.clone(), rx, live_stream_tx.clone());
        tokio::spawn(writer.run());
    }

    let live_stream = LiveStream::new(settings.live_stream_addr.clone(), live_stream_rx);
    tokio::spawn(live_stream.run());

    let controller = Controller::new(
        registry.clone(),
        parser_tick_txs,
        parser_reply_rxs,
        indexer_tick_tx,
        updater_txs,
        writer_txs,
        live_stream_tx,
        args.config_path.clone(),
        cancel.clone(),
    );

    tokio::select! {
        _ = controller.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("received interrupt, shutting down");
            cancel.cancel();
        }
    }

    for handle in parser_handles {
        handle.abort();
    }

    Ok(())
}

async fn serve_metrics(addr: SocketAddr) {
    let make_svc = make_service_fn(move |_conn| async move {
        Ok::<_, hyper::Error>(service_fn(move |req: Request<Body>| async move {
            match (req.method(), req.uri().path()) {
                (&Method::GET, "/metrics") => {
                    let metrics_text = metrics::gather_metrics();
                    let encoder = TextEncoder::new();
                    let resp = Response::builder()
                        .header("Content-Type", encoder.format_type())
                        .body(Body::from(metrics_text))
                        .expect("failed to build /metrics response");
                    Ok::<Response<Body>, hyper::Error>(resp)
                }
                (&Method::GET, "/healthz") => Ok::<Response<Body>, hyper::Error>(Response::new(Body::from("OK"))),
                _ => {
                    let not_found = Response::builder().status(404).body(Body::empty()).unwrap();
                    Ok::<Response<Body>, hyper::Error>(not_found)
                }
            }
        }))
    });

    info!(%addr, "starting metrics & health server");
    if let Err(e) = Server::bind(&addr).serve(make_svc).await {
        warn!(error = %e, "metrics server failed");
    }
}
