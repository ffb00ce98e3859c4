//! Inserts individual interesting requests, JS exceptions, and events, and
//! republishes error summaries on the live-stream channel (spec.md section
//! 4.5).

use std::sync::Arc;

use mongodb::bson::oid::ObjectId;
use mongodb::bson::spec::BinarySubtype;
use mongodb::bson::{Binary, Bson};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use crate::bson_convert::json_object_to_document;
use crate::messages::{LiveStreamFrame, WriterMessage};
use crate::metrics::{LIVE_STREAM_PUBLISHES, REQUESTS_WRITTEN};
use crate::resource_registry::ResourceRegistry;
use crate::storage::{cache_rebuild_interval, with_retry, CollectionCache, RetryPolicy, ShardClients};
use crate::stream_registry::StreamDescriptor;

pub struct RequestWriter {
    id: usize,
    registry: Arc<ResourceRegistry>,
    shards: ShardClients,
    inbox: mpsc::Receiver<WriterMessage>,
    live_stream_tx: mpsc::Sender<LiveStreamFrame>,
    cache: CollectionCache,
    ticks: u64,
}

impl RequestWriter {
    pub fn new(
        id: usize,
        registry: Arc<ResourceRegistry>,
        shards: ShardClients,
        inbox: mpsc::Receiver<WriterMessage>,
        live_stream_tx: mpsc::Sender<LiveStreamFrame>,
    ) -> Self {
        Self { id, registry, shards, inbox, live_stream_tx, cache: CollectionCache::default(), ticks: 0 }
    }

    pub async fn run(mut self) {
        loop {
            match self.inbox.recv().await {
                Some(WriterMessage::Request { db_name, stream, module, request }) => {
                    self.handle_request(db_name, stream, module, request).await;
                }
                Some(WriterMessage::JsException { db_name, stream, exception }) => {
                    self.insert_simple(&db_name, stream.db_shard_index, "js_exception", exception).await;
                }
                Some(WriterMessage::Event { db_name, stream, event }) => {
                    self.insert_simple(&db_name, stream.db_shard_index, "event", event).await;
                }
                Some(WriterMessage::Tick) => self.on_tick().await,
                Some(WriterMessage::Shutdown) | None => break,
            }
        }
    }

    async fn handle_request(&mut self, db_name: String, stream: Arc<StreamDescriptor>, module: String, mut request: Value) {
        transform_metrics(&mut request, &self.registry);

        let request_id = request
            .as_object_mut()
            .and_then(|obj| obj.remove("request_id"))
            .and_then(|v| v.as_str().map(str::to_string));

        let id_bson = match &request_id {
            Some(rid) if rid.len() == 32 => Bson::Binary(Binary { subtype: BinarySubtype::UuidOld, bytes: rid.as_bytes().to_vec() }),
            Some(rid) => {
                warn!(request_id = rid, "invalid request_id length, generating object id");
                Bson::ObjectId(ObjectId::new())
            }
            None => Bson::ObjectId(ObjectId::new()),
        };

        let context = format!("{db_name}:{}", request_id.as_deref().unwrap_or("unknown"));
        let mut document = json_object_to_document(&request, &context);
        document.insert("_id", id_bson);

        let db = self.shards.database_for(stream.db_shard_index, &db_name);
        let coll = self.cache.requests(&db);
        let result = with_retry(RetryPolicy::DATA_WRITE, || {
            let coll = coll.clone();
            let document = document.clone();
            async move { coll.insert_one(document).await }
        })
        .await;
        match result {
            Ok(_) => REQUESTS_WRITTEN.inc(),
            Err(e) => warn!(error = %e, context, "failed to insert request"),
        }

        let severity = request.get("severity").and_then(Value::as_i64).unwrap_or(1);
        if severity > 1 {
            self.publish_error(&stream, &module, &request, request_id.as_deref(), severity).await;
        }
    }

    async fn insert_simple(&mut self, db_name: &str, shard_index: usize, context: &str, value: Value) {
        let db = self.shards.database_for(shard_index, db_name);
        let coll = match context {
            "js_exception" => self.cache.js_exceptions(&db),
            _ => self.cache.events(&db),
        };
        let ctx = format!("{db_name}:{context}");
        let document = json_object_to_document(&value, &ctx);
        let result = with_retry(RetryPolicy::DATA_WRITE, || {
            let coll = coll.clone();
            let document = document.clone();
            async move { coll.insert_one(document).await }
        })
        .await;
        if let Err(e) = result {
            warn!(error = %e, context = ctx, "failed to insert document");
        }
    }

    async fn publish_error(&mut self, stream: &Arc<StreamDescriptor>, module: &str, request: &Value, request_id: Option<&str>, severity: i64) {
        let description = request
            .get("lines")
            .and_then(Value::as_array)
            .and_then(|lines| {
                lines
                    .iter()
                    .filter_map(Value::as_array)
                    .find(|line| {
                        line.first()
                            .and_then(Value::as_i64)
                            .map(|s| s >= severity)
                            .unwrap_or(false)
                    })
                    .and_then(|line| line.get(2))
                    .and_then(Value::as_str)
            })
            .unwrap_or("------ unknown ------")
            .to_string();

        let page = request.get("page").and_then(Value::as_str).unwrap_or("").to_string();
        let response_code = request.get("response_code").and_then(Value::as_i64).unwrap_or(500);
        let started_at = request.get("started_at").and_then(Value::as_str).unwrap_or("").to_string();

        let error = serde_json::json!([{
            "request_id": request_id,
            "severity": severity,
            "action": page,
            "response_code": response_code,
            "time": started_at,
            "description": description,
        }]);

        // Only the app/env portion is lowercased here; the module segment
        // is kept verbatim (scenario 6 in spec.md section 8).
        let app_env = format!("{}-{}", stream.app.to_lowercase(), stream.env.to_lowercase());
        for key in [format!("{app_env},all_pages"), format!("{app_env},{module}")] {
            if self.live_stream_tx.send(LiveStreamFrame { key, json: error.clone() }).await.is_ok() {
                LIVE_STREAM_PUBLISHES.inc();
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

/// Moves each non-zero resource field from the top level into
/// `metrics: [{n, v}, ...]`, dropping zeros entirely (spec.md section 4.5
/// step 1).
fn transform_metrics(request: &mut Value, registry: &ResourceRegistry) {
    let Some(obj) = request.as_object_mut() else { return };
    let mut metrics = Vec::new();
    for id in registry.iter() {
        let name = registry.name_of(id);
        if let Some(v) = obj.remove(name) {
            let numeric = v.as_f64().unwrap_or(0.0);
            if numeric != 0.0 {
                metrics.push(serde_json::json!({"n": name, "v": v}));
            }
        }
    }
    if !metrics.is_empty() {
        obj.insert("metrics".to_string(), Value::Array(metrics));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource_registry::{ResourceFamily, ResourceRegistry};

    fn registry() -> ResourceRegistry {
        ResourceRegistry::builder()
            .add_family(ResourceFamily::Time, &["total_time".into(), "db_time".into()])
            .unwrap()
            .build()
    }

    #[test]
    fn transform_metrics_moves_nonzero_and_drops_zero() {
        let reg = registry();
        let mut request = serde_json::json!({"total_time": 120.0, "db_time": 0.0, "action": "Orders#show"});
        transform_metrics(&mut request, &reg);
        let metrics = request.get("metrics").unwrap().as_array().unwrap();
        assert_eq!(metrics.len(), 1);
        assert!(request.get("total_time").is_none());
        assert!(request.get("db_time").is_none());
    }
}
