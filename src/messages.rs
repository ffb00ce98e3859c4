//! Tagged inter-worker messages. The original source multiplexes workers
//! over a single byte tag (`'t' 'm' 'q' 'r' 'j' 'e'`); a Rust enum captures
//! the same dispatch without parsing a byte, per the design notes in
//! spec.md section 9.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::increments::Increments;
use crate::processor::ProcessorState;
use crate::stream_registry::StreamDescriptor;

/// One raw ingress frame triple, `[stream, topic, body]` (spec.md section 6).
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub stream: String,
    pub topic: String,
    pub body: bytes::Bytes,
}

/// Controller -> parser: drain the parser's accumulated state for this
/// tick.
#[derive(Debug)]
pub struct TickRequest;

/// Parser -> controller: the parser's per-database state since the last
/// tick, plus how many messages it accepted.
#[derive(Debug, Default)]
pub struct ParserTickReply {
    pub processors: HashMap<String, ProcessorState>,
    pub parsed_count: u64,
}

/// Parser -> indexer: fire-and-forget notice that a processor (and thus a
/// database) now exists, so indices should be created before the first
/// write (spec.md section 4.2 step 4 / section 5 ordering guarantee c).
#[derive(Debug, Clone)]
pub struct IndexerNotice {
    pub db_name: String,
    pub stream: Arc<StreamDescriptor>,
}

/// Controller -> stats-updater, tagged by aggregation kind.
#[derive(Debug)]
pub enum UpdaterMessage {
    Totals {
        db_name: String,
        stream: Arc<StreamDescriptor>,
        totals: HashMap<String, Increments>,
    },
    Minutes {
        db_name: String,
        stream: Arc<StreamDescriptor>,
        minutes: HashMap<String, Increments>,
    },
    Quants {
        db_name: String,
        stream: Arc<StreamDescriptor>,
        quants: HashMap<String, Vec<u64>>,
    },
    Tick,
    Shutdown,
}

/// Parser -> request-writer.
#[derive(Debug)]
pub enum WriterMessage {
    Request {
        db_name: String,
        stream: Arc<StreamDescriptor>,
        module: String,
        request: Value,
    },
    JsException {
        db_name: String,
        stream: Arc<StreamDescriptor>,
        exception: Value,
    },
    Event {
        db_name: String,
        stream: Arc<StreamDescriptor>,
        event: Value,
    },
    Tick,
    Shutdown,
}

/// A `[key, json]` frame published on the live-stream fan-out channel
/// (spec.md section 6).
#[derive(Debug, Clone)]
pub struct LiveStreamFrame {
    pub key: String,
    pub json: Value,
}
