//! Single ingress worker: fans incoming telemetry frames from the
//! configured publisher endpoints and the direct-push listener into the
//! parser pool (spec.md section 4.1).
//!
//! Pure fan-in, no parsing: each `(stream, topic, body)` triple read off a
//! connection is forwarded round-robin to the parser pool, and optionally
//! duplicated on a debug broadcast channel.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use crate::messages::InboundFrame;
use crate::metrics::MESSAGES_DROPPED;
use crate::wire::read_frames;

/// The subscriber's receive high-water-mark (spec.md section 5): excess
/// frames are dropped at the transport rather than applying backpressure
/// to publishers.
pub const RECEIVE_HWM: usize = 10_000;

pub struct Subscriber {
    push_addr: String,
    publisher_endpoints: Vec<String>,
    stream_subscriptions: Vec<String>,
    parser_txs: Vec<mpsc::Sender<InboundFrame>>,
    debug_tx: Option<broadcast::Sender<InboundFrame>>,
    next_parser: AtomicUsize,
}

impl Subscriber {
    pub fn new(
        push_addr: String,
        publisher_endpoints: Vec<String>,
        stream_subscriptions: Vec<String>,
        parser_txs: Vec<mpsc::Sender<InboundFrame>>,
        debug_tx: Option<broadcast::Sender<InboundFrame>>,
    ) -> Self {
        Self {
            push_addr,
            publisher_endpoints,
            stream_subscriptions,
            parser_txs,
            debug_tx,
            next_parser: AtomicUsize::new(0),
        }
    }

    pub async fn run(self: Arc<Self>) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.push_addr).await?;
        info!(addr = %self.push_addr, "subscriber listening for direct-push connections");

        for endpoint in self.publisher_endpoints.clone() {
            let this = self.clone();
            tokio::spawn(async move { this.subscribe_loop(endpoint).await });
        }

        loop {
            let (socket, peer) = listener.accept().await?;
            let this = self.clone();
            tokio::spawn(async move { this.handle_connection(socket, peer.to_string()).await });
        }
    }

    /// Reconnects with a fixed backoff if a publisher endpoint drops.
    async fn subscribe_loop(&self, endpoint: String) {
        loop {
            match TcpStream::connect(&endpoint).await {
                Ok(socket) => self.handle_connection(socket, endpoint.clone()).await,
                Err(e) => warn!(endpoint, error = %e, "failed to connect to publisher endpoint"),
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    async fn handle_connection(&self, mut socket: TcpStream, peer: String) {
        loop {
            match read_frames(&mut socket).await {
                Ok(Some(frames)) if frames.len() == 3 => {
                    let frame = InboundFrame {
                        stream: String::from_utf8_lossy(&frames[0]).into_owned(),
                        topic: String::from_utf8_lossy(&frames[1]).into_owned(),
                        body: frames[2].clone(),
                    };
                    self.dispatch(frame).await;
                }
                Ok(Some(_)) => {
                    MESSAGES_DROPPED.with_label_values(&["malformed_frame_count"]).inc();
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(peer, error = %e, "connection read error");
                    break;
                }
            }
        }
    }

    fn accepts_stream(&self, stream: &str) -> bool {
        if self.stream_subscriptions.is_empty() {
            return true;
        }
        let bare = stream.strip_prefix("request-stream-").unwrap_or(stream);
        self.stream_subscriptions.iter().any(|s| s == bare)
    }

    async fn dispatch(&self, frame: InboundFrame) {
        if !self.accepts_stream(&frame.stream) {
            return;
        }

        if let Some(tx) = &self.debug_tx {
            let _ = tx.send(frame.clone());
        }

        let idx = self.next_parser.fetch_add(1, Ordering::Relaxed) % self.parser_txs.len();
        if self.parser_txs[idx].send(frame).await.is_err() {
            warn!("parser pipeline closed, dropping frame");
        }
    }
}
