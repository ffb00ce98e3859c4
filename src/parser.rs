//! Parses inbound frames into per-action/per-module/per-minute increments
//! and quantile buckets, and forwards individual "interesting" requests,
//! JS exceptions, and events to the writer pool (spec.md section 4.2).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use crate::increments::{
    caller_key, exception_key, fill_apdex, fill_frontend_apdex, response_code_key, severity_key,
    Increments,
};
use crate::messages::{IndexerNotice, InboundFrame, ParserTickReply, TickRequest, WriterMessage};
use crate::metrics::{MESSAGES_DROPPED, MESSAGES_PARSED};
use crate::processor::{database_name, minute_of_day, parse_started_at, ProcessorState, ALL_PAGES};
use crate::resource_registry::ResourceRegistry;
use crate::stream_registry::{StreamDescriptor, StreamRegistry};

pub struct Parser {
    registry: Arc<ResourceRegistry>,
    streams: Arc<StreamRegistry>,
    inbox: mpsc::Receiver<InboundFrame>,
    tick_rx: mpsc::Receiver<TickRequest>,
    tick_reply_tx: mpsc::Sender<ParserTickReply>,
    indexer_tx: mpsc::Sender<IndexerNotice>,
    writer_txs: Vec<mpsc::Sender<WriterMessage>>,
    processors: HashMap<String, ProcessorState>,
    parsed_count: u64,
    next_writer: usize,
}

impl Parser {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<ResourceRegistry>,
        streams: Arc<StreamRegistry>,
        inbox: mpsc::Receiver<InboundFrame>,
        tick_rx: mpsc::Receiver<TickRequest>,
        tick_reply_tx: mpsc::Sender<ParserTickReply>,
        indexer_tx: mpsc::Sender<IndexerNotice>,
        writer_txs: Vec<mpsc::Sender<WriterMessage>>,
    ) -> Self {
        Self {
            registry,
            streams,
            inbox,
            tick_rx,
            tick_reply_tx,
            indexer_tx,
            writer_txs,
            processors: HashMap::new(),
            parsed_count: 0,
            next_writer: 0,
        }
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                tick = self.tick_rx.recv() => {
                    match tick {
                        Some(_) => {
                            let reply = ParserTickReply {
                                processors: std::mem::take(&mut self.processors),
                                parsed_count: std::mem::take(&mut self.parsed_count),
                            };
                            if self.tick_reply_tx.send(reply).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                frame = self.inbox.recv() => {
                    match frame {
                        Some(frame) => self.handle_frame(frame).await,
                        None => break,
                    }
                }
            }
        }
    }

    async fn handle_frame(&mut self, frame: InboundFrame) {
        let stripped = frame
            .stream
            .strip_prefix("request-stream-")
            .unwrap_or(&frame.stream);
        let Some(stream) = self.streams.get(stripped) else {
            MESSAGES_DROPPED.with_label_values(&["unknown_stream"]).inc();
            warn!(stream = %frame.stream, "dropping message for unknown stream");
            return;
        };

        let body: Value = match serde_json::from_slice(&frame.body) {
            Ok(v) => v,
            Err(e) => {
                MESSAGES_DROPPED.with_label_values(&["malformed_json"]).inc();
                warn!(error = %e, stream = %frame.stream, "dropping malformed json");
                return;
            }
        };

        let Some(started_at) = body.get("started_at").and_then(Value::as_str).map(str::to_owned) else {
            MESSAGES_DROPPED.with_label_values(&["invalid_started_at"]).inc();
            warn!(stream = %frame.stream, "dropping message with missing started_at");
            return;
        };
        let started_at = started_at.as_str();
        let Some((date, _)) = parse_started_at(started_at, Utc::now()) else {
            MESSAGES_DROPPED.with_label_values(&["invalid_started_at"]).inc();
            warn!(stream = %frame.stream, started_at, "dropping message with invalid or drifted started_at");
            return;
        };

        let db_name = database_name(&stream.app, &stream.env, &date);
        if !self.processors.contains_key(&db_name) {
            self.processors
                .insert(db_name.clone(), ProcessorState::new(db_name.clone(), stream.clone()));
            let _ = self
                .indexer_tx
                .try_send(IndexerNotice { db_name: db_name.clone(), stream: stream.clone() });
        }

        self.parsed_count += 1;
        MESSAGES_PARSED.inc();

        let topic = frame.topic.as_str();
        if topic.starts_with("logs") {
            self.handle_request(&db_name, &stream, started_at, &body).await;
        } else if topic.starts_with("javascript") {
            self.handle_js_exception(&db_name, &stream, &body).await;
        } else if topic.starts_with("events") {
            self.handle_event(&db_name, &stream, started_at, body).await;
        } else if topic.starts_with("frontend.page") || topic.starts_with("frontend.ajax") {
            self.handle_frontend(&body);
        } else {
            MESSAGES_DROPPED.with_label_values(&["unknown_topic"]).inc();
            warn!(topic, "dropping message with unknown topic");
        }
    }

    async fn handle_request(
        &mut self,
        db_name: &str,
        stream: &Arc<StreamDescriptor>,
        started_at: &str,
        body: &Value,
    ) {
        let raw_action = body.get("action").and_then(Value::as_str).unwrap_or("");
        let page = normalize_action(raw_action);
        let module = derive_module(&page);

        let response_code = body
            .get("code")
            .and_then(Value::as_i64)
            .map(|c| c as i32)
            .unwrap_or(500);

        let severity = derive_severity(body);

        let Some(minute) = minute_of_day(started_at) else {
            MESSAGES_DROPPED.with_label_values(&["invalid_started_at"]).inc();
            return;
        };

        let url = body
            .get("request_info")
            .and_then(|ri| ri.get("url"))
            .and_then(Value::as_str)
            .unwrap_or("");
        if stream.is_ignored(url) {
            return;
        }

        let mut total_time = read_metric(body, "total_time").unwrap_or(0.0);
        if total_time <= 0.0 {
            total_time = 1.0;
        }

        let other_time: f64 = self
            .registry
            .other_time_resources()
            .iter()
            .map(|&id| read_metric(body, self.registry.name_of(id)).unwrap_or(0.0))
            .sum();
        let other_time = (total_time - other_time).max(0.0);

        let allocated_objects = read_metric(body, "allocated_objects");
        let allocated_bytes = read_metric(body, "allocated_bytes");
        let allocated_memory = read_metric(body, "allocated_memory").or_else(|| {
            match (allocated_objects, allocated_bytes) {
                (Some(objects), Some(bytes)) => Some(bytes + 40.0 * objects),
                _ => None,
            }
        });

        let heap_growth = read_metric(body, "heap_growth").unwrap_or(0.0);

        let mut inc = Increments::new(&self.registry);
        inc.backend_count = 1;
        for id in self.registry.iter() {
            let name = self.registry.name_of(id);
            let value = match name {
                "total_time" => Some(total_time),
                "other_time" => Some(other_time),
                "allocated_memory" => allocated_memory,
                _ => read_metric(body, name),
            };
            if let Some(v) = value {
                inc.add_metric(id, v);
            }
        }

        fill_apdex(&mut inc, total_time, response_code);
        inc.incr_other(response_code_key(response_code), 1);
        inc.incr_other(severity_key(severity), 1);

        if let Some(caller_id) = body.get("caller_id").and_then(Value::as_str) {
            if let Some((caller_app, caller_env, _rid)) = split_caller_id(caller_id) {
                let _ = caller_env;
                let caller_action = body.get("caller_action").and_then(Value::as_str).unwrap_or("");
                if !caller_action.is_empty() {
                    inc.incr_other(caller_key(caller_app, caller_action), 1);
                }
            } else {
                MESSAGES_DROPPED.with_label_values(&["malformed_caller_id"]).inc();
            }
        }

        let mut exception_classes = Vec::new();
        if let Some(exceptions) = body.get("exceptions").and_then(Value::as_array) {
            for e in exceptions {
                if let Some(name) = e.as_str() {
                    inc.incr_other(exception_key(name), 1);
                    exception_classes.push(name.to_string());
                }
            }
        }

        let threshold = stream.threshold_for_module(&module);
        let interesting = total_time > threshold as f64
            || severity > 1
            || response_code >= 400
            || !exception_classes.is_empty()
            || heap_growth > 0.0;

        {
            let processor = self
                .processors
                .get_mut(db_name)
                .expect("processor created above");
            processor.modules.insert(module.clone());
            processor.request_count += 1;
            processor.add_total(&self.registry, &page, &inc);
            processor.add_total(&self.registry, &module, &inc);
            processor.add_total(&self.registry, ALL_PAGES, &inc);
            processor.add_minute(&self.registry, minute, &page, &inc);
            processor.add_minute(&self.registry, minute, &module, &inc);
            processor.add_minute(&self.registry, minute, ALL_PAGES, &inc);
            processor.add_quants(&self.registry, &page, &inc);
        }

        if interesting {
            let mut request = body.clone();
            if let Some(obj) = request.as_object_mut() {
                obj.remove("action");
                obj.insert("page".to_string(), Value::String(page.clone()));
                obj.remove("code");
                obj.insert("response_code".to_string(), serde_json::json!(response_code));
                obj.insert("severity".to_string(), serde_json::json!(severity));
                obj.insert("minute".to_string(), serde_json::json!(minute));
                obj.insert("other_time".to_string(), serde_json::json!(other_time));
                if let Some(memory) = allocated_memory {
                    obj.insert("allocated_memory".to_string(), serde_json::json!(memory));
                }
            }
            self.forward_to_writer(WriterMessage::Request {
                db_name: db_name.to_string(),
                stream: stream.clone(),
                module,
                request,
            })
            .await;
        }
    }

    async fn handle_js_exception(&mut self, db_name: &str, stream: &Arc<StreamDescriptor>, body: &Value) {
        let description = body.get("description").and_then(Value::as_str).unwrap_or("unknown");
        let key = format!(
            "js_exceptions.{}",
            crate::bson_convert::escape_key_uri(description)
        );
        let raw_action = body
            .get("logjam_action")
            .and_then(Value::as_str)
            .unwrap_or("");
        let page = normalize_action(raw_action);
        let module = derive_module(&page);

        if let Some(processor) = self.processors.get_mut(db_name) {
            let mut inc = Increments::new(&self.registry);
            inc.incr_other(key, 1);
            processor.modules.insert(module);
            processor.add_total(&self.registry, &page, &inc);
            processor.add_total(&self.registry, ALL_PAGES, &inc);
        }

        self.forward_to_writer(WriterMessage::JsException {
            db_name: db_name.to_string(),
            stream: stream.clone(),
            exception: body.clone(),
        })
        .await;
    }

    async fn handle_event(&mut self, db_name: &str, stream: &Arc<StreamDescriptor>, started_at: &str, body: Value) {
        if minute_of_day(started_at).is_none() {
            MESSAGES_DROPPED.with_label_values(&["invalid_started_at"]).inc();
            return;
        }
        self.forward_to_writer(WriterMessage::Event {
            db_name: db_name.to_string(),
            stream: stream.clone(),
            event: body,
        })
        .await;
    }

    /// Frontend/ajax topics are dispatched but never aggregated, per
    /// spec.md section 9 ("Frontend/ajax paths"): compute the fapdex bucket so the
    /// computation path stays exercised, then discard the result.
    fn handle_frontend(&self, body: &Value) {
        if let Some(time) = read_metric(body, "page_time").or_else(|| read_metric(body, "ajax_time")) {
            let mut scratch = Increments::new(&self.registry);
            fill_frontend_apdex(&mut scratch, time);
        }
    }

    async fn forward_to_writer(&mut self, message: WriterMessage) {
        let idx = self.next_writer;
        self.next_writer = (self.next_writer + 1) % self.writer_txs.len();
        if let Err(e) = self.writer_txs[idx].try_send(message) {
            warn!("writer pipeline would block, sending anyway");
            match e {
                mpsc::error::TrySendError::Full(message) => {
                    let _ = self.writer_txs[idx].send(message).await;
                }
                mpsc::error::TrySendError::Closed(_) => {}
            }
        }
    }
}

/// `action` -> `page`: ensures exactly one `#`, appending `unknown_method`
/// when it's missing or trailing (spec.md section 4.2.a).
fn normalize_action(action: &str) -> String {
    if action.is_empty() {
        return "Unknown#unknown_method".to_string();
    }
    match action.find('#') {
        None => format!("{action}#unknown_method"),
        Some(idx) if idx == action.len() - 1 => format!("{action}unknown_method"),
        Some(_) => action.to_string(),
    }
}

/// `::Module` from the substring before `:` if present, else before `#`
/// (spec.md section 4.2.b).
fn derive_module(page: &str) -> String {
    let base = if let Some(idx) = page.find(':') {
        &page[..idx]
    } else if let Some(idx) = page.find('#') {
        &page[..idx]
    } else {
        page
    };
    format!("::{base}")
}

/// Explicit `severity` field, else the maximum `lines[][0]` severity column
/// clamped to `[0,5]`, default 1 (spec.md section 4.2.d).
fn derive_severity(body: &Value) -> i32 {
    if let Some(s) = body.get("severity").and_then(Value::as_i64) {
        return s.clamp(0, 5) as i32;
    }
    let max_line_severity = body
        .get("lines")
        .and_then(Value::as_array)
        .map(|lines| {
            lines
                .iter()
                .filter_map(|line| line.as_array())
                .filter_map(|line| line.first())
                .filter_map(Value::as_i64)
                .max()
                .unwrap_or(1)
        });
    max_line_severity.unwrap_or(1).clamp(0, 5) as i32
}

fn read_metric(body: &Value, name: &str) -> Option<f64> {
    body.get(name).and_then(Value::as_f64)
}

/// Parses `caller_id = "<app>-<env>-<rid>"`, requiring at least two hyphens.
fn split_caller_id(caller_id: &str) -> Option<(&str, &str, &str)> {
    let mut parts = caller_id.splitn(3, '-');
    let app = parts.next()?;
    let env = parts.next()?;
    let rid = parts.next()?;
    if app.is_empty() || env.is_empty() || rid.is_empty() {
        return None;
    }
    Some((app, env, rid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_action_appends_unknown_method_when_missing() {
        assert_eq!(normalize_action("Orders"), "Orders#unknown_method");
        assert_eq!(normalize_action("Orders#"), "Orders#unknown_method");
        assert_eq!(normalize_action("Orders#show"), "Orders#show");
    }

    #[test]
    fn derive_module_prefers_colon_over_hash() {
        assert_eq!(derive_module("Orders::Sub#show"), "::Orders");
        assert_eq!(derive_module("Orders#show"), "::Orders");
    }

    #[test]
    fn severity_falls_back_to_max_line_column() {
        let body = serde_json::json!({"lines": [[4, 0, "a"], [2, 0, "b"]]});
        assert_eq!(derive_severity(&body), 4);
    }

    #[test]
    fn severity_defaults_to_one() {
        let body = serde_json::json!({});
        assert_eq!(derive_severity(&body), 1);
    }

    #[test]
    fn severity_clamped_to_five() {
        let body = serde_json::json!({"severity": 9});
        assert_eq!(derive_severity(&body), 5);
    }

    #[test]
    fn caller_id_splits_into_three_parts() {
        assert_eq!(
            split_caller_id("shop-production-abc123"),
            Some(("shop", "production", "abc123"))
        );
        assert_eq!(split_caller_id("malformed"), None);
    }
}
