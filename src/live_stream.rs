//! Egress worker for the live-stream channel: a 2-frame `[key, json]`
//! connection to the external live-stream collector (spec.md section 6).
//! Publication is non-blocking in spirit — a down endpoint drops frames
//! with a warning rather than applying backpressure to its callers.

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::warn;

use crate::messages::LiveStreamFrame;
use crate::metrics::LIVE_STREAM_PUBLISHES;
use crate::wire::write_frames;

pub struct LiveStream {
    addr: String,
    inbox: mpsc::Receiver<LiveStreamFrame>,
}

impl LiveStream {
    pub fn new(addr: String, inbox: mpsc::Receiver<LiveStreamFrame>) -> Self {
        Self { addr, inbox }
    }

    pub async fn run(mut self) {
        let mut conn: Option<TcpStream> = None;
        while let Some(frame) = self.inbox.recv().await {
            if conn.is_none() {
                conn = TcpStream::connect(&self.addr).await.ok();
                if conn.is_none() {
                    warn!(addr = %self.addr, "live-stream endpoint unavailable, dropping frame");
                    continue;
                }
            }

            let key = frame.key.into_bytes();
            let json = serde_json::to_vec(&frame.json).unwrap_or_default();
            let stream = conn.as_mut().expect("checked above");
            if write_frames(stream, &[&key, &json]).await.is_err() {
                warn!("live-stream write failed, will reconnect");
                conn = None;
            } else {
                LIVE_STREAM_PUBLISHES.inc();
            }
        }
    }
}
