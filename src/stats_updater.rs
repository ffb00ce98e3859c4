//! Applies aggregated increment hashes to the document store via
//! upsert-with-`$inc`. Each of the ten instances owns a distinct inbound
//! queue; the controller picks which instance sees a given database by
//! hashing its name, so all of a database's totals/minutes/quants land on
//! the same instance (spec.md section 4.4).

use std::collections::HashMap;
use std::sync::Arc;

use mongodb::bson::{doc, Bson, Document};
use tokio::sync::mpsc;
use tracing::warn;

use crate::increments::Increments;
use crate::messages::UpdaterMessage;
use crate::resource_registry::ResourceRegistry;
use crate::storage::{cache_rebuild_interval, with_retry, CollectionCache, RetryPolicy, ShardClients};

pub struct StatsUpdater {
    id: usize,
    registry: Arc<ResourceRegistry>,
    shards: ShardClients,
    inbox: mpsc::Receiver<UpdaterMessage>,
    cache: CollectionCache,
    ticks: u64,
}

impl StatsUpdater {
    pub fn new(id: usize, registry: Arc<ResourceRegistry>, shards: ShardClients, inbox: mpsc::Receiver<UpdaterMessage>) -> Self {
        Self { id, registry, shards, inbox, cache: CollectionCache::default(), ticks: 0 }
    }

    pub async fn run(mut self) {
        loop {
            let message = self.inbox.recv().await;
            match message {
                Some(UpdaterMessage::Totals { db_name, stream, totals }) => {
                    self.apply_totals(&db_name, stream.db_shard_index, totals).await;
                }
                Some(UpdaterMessage::Minutes { db_name, stream, minutes }) => {
                    self.apply_minutes(&db_name, stream.db_shard_index, minutes).await;
                }
                Some(UpdaterMessage::Quants { db_name, stream, quants }) => {
                    self.apply_quants(&db_name, stream.db_shard_index, quants).await;
                }
                Some(UpdaterMessage::Tick) => self.on_tick().await,
                Some(UpdaterMessage::Shutdown) | None => break,
            }
        }
    }

    async fn apply_totals(&mut self, db_name: &str, shard_index: usize, totals: HashMap<String, Increments>) {
        let db = self.shards.database_for(shard_index, db_name);
        let coll = self.cache.totals(&db);
        for (namespace, inc) in totals {
            let update = doc! {"$inc": increments_to_inc_doc(&inc, &self.registry)};
            let selector = doc! {"page": &namespace};
            let result = with_retry(RetryPolicy::DATA_WRITE, || {
                let coll = coll.clone();
                let selector = selector.clone();
                let update = update.clone();
                async move { coll.update_one(selector, update).upsert(true).await }
            })
            .await;
            if let Err(e) = result {
                warn!(error = %e, db_name, namespace, "failed to apply totals increment");
            }
        }
    }

    async fn apply_minutes(&mut self, db_name: &str, shard_index: usize, minutes: HashMap<String, Increments>) {
        let db = self.shards.database_for(shard_index, db_name);
        let coll = self.cache.minutes(&db);
        for (key, inc) in minutes {
            let Some((minute, namespace)) = parse_minute_key(&key) else {
                warn!(db_name, key, "malformed minute key, skipping");
                continue;
            };
            let update = doc! {"$inc": increments_to_inc_doc(&inc, &self.registry)};
            let selector = doc! {"page": namespace, "minute": minute as i32};
            let result = with_retry(RetryPolicy::DATA_WRITE, || {
                let coll = coll.clone();
                let selector = selector.clone();
                let update = update.clone();
                async move { coll.update_one(selector, update).upsert(true).await }
            })
            .await;
            if let Err(e) = result {
                warn!(error = %e, db_name, key, "failed to apply minute increment");
            }
        }
    }

    async fn apply_quants(&mut self, db_name: &str, shard_index: usize, quants: HashMap<String, Vec<u64>>) {
        let db = self.shards.database_for(shard_index, db_name);
        let coll = self.cache.quants(&db);
        for (key, counts) in quants {
            let Some((kind, quant, namespace)) = parse_quant_key(&key) else {
                warn!(db_name, key, "malformed quant key, skipping");
                continue;
            };
            let mut inc_doc = Document::new();
            for (id, &count) in counts.iter().enumerate() {
                if count == 0 || id >= self.registry.len() {
                    continue;
                }
                inc_doc.insert(self.registry.name_of(id), Bson::Int64(count as i64));
            }
            if inc_doc.is_empty() {
                continue;
            }
            let update = doc! {"$inc": inc_doc};
            let selector = doc! {"page": namespace, "kind": kind.to_string(), "quant": quant as i64};
            let result = with_retry(RetryPolicy::DATA_WRITE, || {
                let coll = coll.clone();
                let selector = selector.clone();
                let update = update.clone();
                async move { coll.update_one(selector, update).upsert(true).await }
            })
            .await;
            if let Err(e) = result {
                warn!(error = %e, db_name, key, "failed to apply quant increment");
            }
        }
    }

    async fn on_tick(&mut self) {
        self.ticks += 1;
        if self.ticks % 5 == 0 {
            self.shards.ping_all().await;
        }
        if self.ticks % cache_rebuild_interval(self.id) == 0 {
            self.cache.clear();
        }
    }
}

/// Flattens an `Increments` bundle into the `$inc` document shape: counts,
/// per-resource sum/sum-of-squares, and the `others` category counters
/// (which MongoDB interprets as dotted update paths, e.g. `response.200`).
fn increments_to_inc_doc(inc: &Increments, registry: &ResourceRegistry) -> Document {
    let mut doc = Document::new();
    if inc.backend_count != 0 {
        doc.insert("backend_count", inc.backend_count);
    }
    if inc.page_count != 0 {
        doc.insert("page_count", inc.page_count);
    }
    if inc.ajax_count != 0 {
        doc.insert("ajax_count", inc.ajax_count);
    }
    for id in registry.iter() {
        let metric = inc.metrics[id];
        if metric.sum != 0.0 {
            doc.insert(registry.name_of(id), metric.sum);
            doc.insert(registry.sq_name_of(id), metric.sum_of_squares);
        }
    }
    for (key, value) in &inc.others {
        match value {
            crate::increments::OtherValue::Int(v) => {
                doc.insert(key.clone(), *v);
            }
            crate::increments::OtherValue::Float(v) => {
                doc.insert(key.clone(), *v);
            }
        }
    }
    doc
}

fn parse_minute_key(key: &str) -> Option<(u16, &str)> {
    let (minute, namespace) = key.split_once('-')?;
    Some((minute.parse().ok()?, namespace))
}

fn parse_quant_key(key: &str) -> Option<(char, u64, &str)> {
    let mut parts = key.splitn(3, '-');
    let kind = parts.next()?.chars().next()?;
    let quant: u64 = parts.next()?.parse().ok()?;
    let namespace = parts.next()?;
    Some((kind, quant, namespace))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minute_key() {
        assert_eq!(parse_minute_key("754-Orders#show"), Some((754, "Orders#show")));
        assert_eq!(parse_minute_key("malformed"), None);
    }

    #[test]
    fn parses_quant_key_with_hyphenated_namespace() {
        assert_eq!(
            parse_quant_key("t-3100-Orders-Sub#show"),
            Some(('t', 3100, "Orders-Sub#show"))
        );
    }

    #[test]
    fn inc_doc_skips_zero_metrics() {
        let registry = ResourceRegistry::builder()
            .add_family(crate::resource_registry::ResourceFamily::Time, &["total_time".into()])
            .unwrap()
            .build();
        let mut inc = Increments::new(&registry);
        inc.backend_count = 1;
        let doc = increments_to_inc_doc(&inc, &registry);
        assert_eq!(doc.get_i64("backend_count").unwrap(), 1);
        assert!(!doc.contains_key("total_time"));
    }
}
