//! Owns worker lifecycles, drives the 1 Hz tick, merges per-parser state,
//! shards updates to writers, and detects config-file change (spec.md
//! section 4.3).

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::increments::Increments;
use crate::messages::{LiveStreamFrame, ParserTickReply, TickRequest, UpdaterMessage, WriterMessage};
use crate::metrics::TICK_DURATION;
use crate::processor::{ProcessorState, ALL_PAGES};
use crate::resource_registry::ResourceRegistry;

pub struct Controller {
    registry: Arc<ResourceRegistry>,
    parser_tick_txs: Vec<mpsc::Sender<TickRequest>>,
    parser_reply_rxs: Vec<mpsc::Receiver<ParserTickReply>>,
    indexer_tick_tx: mpsc::Sender<()>,
    updater_txs: Vec<mpsc::Sender<UpdaterMessage>>,
    writer_txs: Vec<mpsc::Sender<WriterMessage>>,
    live_stream_tx: mpsc::Sender<LiveStreamFrame>,
    config_path: String,
    config_hash: Option<[u8; 32]>,
    ticks: u64,
    cancel: CancellationToken,
}

impl Controller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<ResourceRegistry>,
        parser_tick_txs: Vec<mpsc::Sender<TickRequest>>,
        parser_reply_rxs: Vec<mpsc::Receiver<ParserTickReply>>,
        indexer_tick_tx: mpsc::Sender<()>,
        updater_txs: Vec<mpsc::Sender<UpdaterMessage>>,
        writer_txs: Vec<mpsc::Sender<WriterMessage>>,
        live_stream_tx: mpsc::Sender<LiveStreamFrame>,
        config_path: String,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            parser_tick_txs,
            parser_reply_rxs,
            indexer_tick_tx,
            updater_txs,
            writer_txs,
            live_stream_tx,
            config_path,
            config_hash: None,
            ticks: 0,
            cancel,
        }
    }

    /// Runs the 1 Hz tick loop until the cancellation token fires or the
    /// config file changes (spec.md section 4.3 step 7).
    pub async fn run(mut self) {
        self.config_hash = hash_config(&self.config_path);
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let tick_start = Instant::now();
            self.ticks += 1;

            let merged = self.drain_and_merge_parsers().await;
            self.publish_live_totals(&merged).await;
            self.tick_indexer_and_updaters().await;
            self.ship_to_updaters(merged).await;
            self.tick_writers().await;

            if self.ticks % 10 == 0 && self.config_changed() {
                info!("config file changed, shutting down");
                self.cancel.cancel();
                break;
            }

            TICK_DURATION.observe(tick_start.elapsed().as_secs_f64());
            let elapsed_ms = tick_start.elapsed().as_millis() as u64;
            let next_tick_ms = 1000u64.saturating_sub(elapsed_ms).max(1);

            tokio::select! {
                _ = sleep(Duration::from_millis(next_tick_ms)) => {}
                _ = self.cancel.cancelled() => break,
            }
        }
    }

    async fn drain_and_merge_parsers(&mut self) -> HashMap<String, ProcessorState> {
        for tx in &self.parser_tick_txs {
            let _ = tx.send(TickRequest).await;
        }

        let mut merged: HashMap<String, ProcessorState> = HashMap::new();
        for rx in &mut self.parser_reply_rxs {
            if let Some(reply) = rx.recv().await {
                for (db_name, state) in reply.processors {
                    match merged.entry(db_name) {
                        Entry::Occupied(mut occupied) => occupied.get_mut().merge(&self.registry, state),
                        Entry::Vacant(vacant) => {
                            vacant.insert(state);
                        }
                    }
                }
            }
        }
        merged
    }

    /// Emits per-module/per-page totals as `[key, json]` frames before the
    /// stats-update shipment, so a live viewer observes the increment
    /// strictly before its durable record (spec.md section 5 ordering
    /// guarantee b).
    async fn publish_live_totals(&self, merged: &HashMap<String, ProcessorState>) {
        for state in merged.values() {
            let Some(stream) = &state.stream else { continue };
            for namespace in state.modules.iter().map(String::as_str).chain(std::iter::once(ALL_PAGES)) {
                let Some(inc) = state.totals.get(namespace) else { continue };
                let key = format!("{}-{},{}", stream.app, stream.env, namespace).to_lowercase();
                let json = live_total_json(inc, &self.registry);
                let _ = self.live_stream_tx.send(LiveStreamFrame { key, json }).await;
            }
        }
    }

    async fn tick_indexer_and_updaters(&self) {
        let _ = self.indexer_tick_tx.send(()).await;
        for tx in &self.updater_txs {
            let _ = tx.send(UpdaterMessage::Tick).await;
        }
    }

    /// Ships totals/minutes/quants for every database to exactly one
    /// updater, selected by hashing the database name, and relinquishes
    /// this function's ownership of each map on send (spec.md section 4.3
    /// step 5 / section 9 "Back-references").
    async fn ship_to_updaters(&self, merged: HashMap<String, ProcessorState>) {
        let shard_count = self.updater_txs.len().max(1);
        for (db_name, state) in merged {
            let Some(stream) = state.stream else { continue };
            let idx = shard_index(&db_name, shard_count);
            let tx = &self.updater_txs[idx];

            if !state.totals.is_empty() {
                let _ = tx
                    .send(UpdaterMessage::Totals { db_name: db_name.clone(), stream: stream.clone(), totals: state.totals })
                    .await;
            }
            if !state.minutes.is_empty() {
                let _ = tx
                    .send(UpdaterMessage::Minutes { db_name: db_name.clone(), stream: stream.clone(), minutes: state.minutes })
                    .await;
            }
            if !state.quants.is_empty() {
                let _ = tx
                    .send(UpdaterMessage::Quants { db_name: db_name.clone(), stream: stream.clone(), quants: state.quants })
                    .await;
            }
        }
    }

    async fn tick_writers(&self) {
        for tx in &self.writer_txs {
            let _ = tx.send(WriterMessage::Tick).await;
        }
    }

    fn config_changed(&mut self) -> bool {
        let current = hash_config(&self.config_path);
        let changed = current != self.config_hash;
        self.config_hash = current;
        changed
    }
}

fn hash_config(path: &str) -> Option<[u8; 32]> {
    match std::fs::read(path) {
        Ok(bytes) => {
            let mut hasher = Sha256::new();
            hasher.update(&bytes);
            Some(hasher.finalize().into())
        }
        Err(e) => {
            warn!(path, error = %e, "could not read config file for change detection");
            None
        }
    }
}

fn shard_index(db_name: &str, shard_count: usize) -> usize {
    let mut hasher = Sha256::new();
    hasher.update(db_name.as_bytes());
    let digest = hasher.finalize();
    let n = u64::from_be_bytes(digest[0..8].try_into().unwrap());
    (n as usize) % shard_count
}

fn live_total_json(inc: &Increments, registry: &ResourceRegistry) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    map.insert("count".to_string(), serde_json::json!(inc.backend_count));
    map.insert("page_count".to_string(), serde_json::json!(inc.page_count));
    map.insert("ajax_count".to_string(), serde_json::json!(inc.ajax_count));
    for (name, sum) in inc.non_zero_metric_sums(registry) {
        map.insert(name.to_string(), serde_json::json!(sum));
    }
    serde_json::Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_index_is_stable_and_in_range() {
        let a = shard_index("logjam-shop-production-2024-06-01", 10);
        let b = shard_index("logjam-shop-production-2024-06-01", 10);
        assert_eq!(a, b);
        assert!(a < 10);
    }

    #[test]
    fn live_total_json_includes_counts() {
        let registry = ResourceRegistry::builder()
            .add_family(crate::resource_registry::ResourceFamily::Time, &["total_time".into()])
            .unwrap()
            .build();
        let mut inc = Increments::new(&registry);
        inc.backend_count = 3;
        inc.add_metric(0, 42.0);
        let json = live_total_json(&inc, &registry);
        assert_eq!(json["count"], 3);
        assert_eq!(json["total_time"], 42.0);
    }
}
