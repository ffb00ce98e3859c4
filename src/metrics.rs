//! Prometheus metrics registry, generalizing the teacher's feed-fetch
//! counters to the importer's worker topology: messages parsed/dropped,
//! requests written, updater retries, tick duration, live-stream publishes.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

/// Global registry under the crate namespace.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("logjam_importer".into()), None)
        .expect("failed to create Prometheus registry")
});

/// Inbound messages that made it through JSON decoding and topic dispatch.
pub static MESSAGES_PARSED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::with_opts(Opts::new(
        "messages_parsed_total",
        "Total number of inbound messages successfully parsed",
    ))
    .expect("counter opts");
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

/// Drop-and-log messages, labeled by the reason (spec section 7 taxonomy).
pub static MESSAGES_DROPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("messages_dropped_total", "Inbound messages dropped, by reason"),
        &["reason"],
    )
    .expect("counter opts");
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

pub static REQUESTS_WRITTEN: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::with_opts(Opts::new(
        "requests_written_total",
        "Total number of interesting requests inserted",
    ))
    .expect("counter opts");
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

pub static UPDATER_RETRIES: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::with_opts(Opts::new(
        "updater_retries_total",
        "Total number of storage-lock retries issued by stats-updaters",
    ))
    .expect("counter opts");
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

pub static LIVE_STREAM_PUBLISHES: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::with_opts(Opts::new(
        "live_stream_publishes_total",
        "Total number of 2-frame messages published on the live-stream channel",
    ))
    .expect("counter opts");
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

pub static TICK_DURATION: Lazy<Histogram> = Lazy::new(|| {
    let h = Histogram::with_opts(HistogramOpts::new(
        "tick_duration_seconds",
        "Duration of one controller tick",
    ))
    .expect("histogram opts");
    REGISTRY.register(Box::new(h.clone())).unwrap();
    h
});

/// Encode all metrics in Prometheus text exposition format.
pub fn gather_metrics() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    let mf = REGISTRY.gather();
    encoder.encode(&mf, &mut buffer).expect("failed to encode");
    String::from_utf8(buffer).expect("invalid utf8")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gather_contains_registered_metric_names() {
        MESSAGES_PARSED.inc();
        let text = gather_metrics();
        assert!(text.contains("logjam_importer_messages_parsed_total"));
    }

    #[test]
    fn dropped_counter_tracks_by_reason() {
        MESSAGES_DROPPED.with_label_values(&["malformed_json"]).inc();
        assert!(MESSAGES_DROPPED.with_label_values(&["malformed_json"]).get() >= 1);
    }
}
