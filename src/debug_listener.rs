//! Optional duplication endpoint: every accepted ingress frame, mirrored to
//! whichever TCP clients are attached at `tcp://*:9651` (spec.md section 6
//! "Optional PUB socket ... debug"). Each connection gets its own broadcast
//! subscription; a slow reader that falls behind the channel's capacity is
//! dropped rather than allowed to stall duplication for everyone else.

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::messages::InboundFrame;
use crate::wire::write_frames;

pub struct DebugListener {
    addr: String,
    source: broadcast::Sender<InboundFrame>,
}

impl DebugListener {
    pub fn new(addr: String, source: broadcast::Sender<InboundFrame>) -> Self {
        Self { addr, source }
    }

    pub async fn run(self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.addr).await?;
        info!(addr = %self.addr, "debug duplication listener bound");
        loop {
            let (socket, peer) = listener.accept().await?;
            let rx = self.source.subscribe();
            tokio::spawn(async move {
                if let Err(e) = serve(socket, rx).await {
                    warn!(peer = %peer, error = %e, "debug listener connection closed");
                }
            });
        }
    }
}

async fn serve(mut socket: TcpStream, mut rx: broadcast::Receiver<InboundFrame>) -> std::io::Result<()> {
    loop {
        match rx.recv().await {
            Ok(frame) => {
                write_frames(&mut socket, &[frame.stream.as_bytes(), frame.topic.as_bytes(), &frame.body]).await?;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "debug listener subscriber lagged, frames dropped");
            }
            Err(broadcast::error::RecvError::Closed) => return Ok(()),
        }
    }
}
