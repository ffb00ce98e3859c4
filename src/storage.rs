//! Shared document-store plumbing: one client per configured shard URI, the
//! retry policy for the storage engine's lock-conflict error code, and the
//! per-database collection-handle cache the stats-updater and
//! request-writer pools keep (spec.md section 4.4/section 4.5).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use mongodb::bson::{doc, Document};
use mongodb::{Client, Collection, Database};
use tracing::warn;

use crate::errors::ImporterError;

/// The storage-engine lock-conflict code the original distinguishes from
/// every other write failure.
pub const LOCK_CONFLICT_CODE: i32 = 16759;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Data writes (totals/minutes/quants/requests): retry twice.
    pub const DATA_WRITE: RetryPolicy = RetryPolicy { max_attempts: 2 };
    /// The `logjam-global` metadata upsert: retry five times.
    pub const METADATA_WRITE: RetryPolicy = RetryPolicy { max_attempts: 5 };
}

/// Runs `op` under `policy`, retrying only on a lock conflict; any other
/// error is returned immediately for the caller to log and move on.
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, mut op: F) -> mongodb::error::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = mongodb::error::Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < policy.max_attempts && is_lock_conflict(&e) => {
                crate::metrics::UPDATER_RETRIES.inc();
                attempt += 1;
                warn!(attempt, "storage lock conflict, retrying");
                tokio::time::sleep(Duration::from_millis(50 * attempt as u64)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn is_lock_conflict(err: &mongodb::error::Error) -> bool {
    use mongodb::error::ErrorKind;
    matches!(err.kind.as_ref(), ErrorKind::Command(cmd) if cmd.code == LOCK_CONFLICT_CODE)
}

/// One client per configured shard URI; a stream pins to a shard via its
/// descriptor's `db_shard_index`.
#[derive(Clone)]
pub struct ShardClients {
    clients: Arc<Vec<Client>>,
}

impl ShardClients {
    pub async fn connect(uris: &[String]) -> Result<Self, ImporterError> {
        let mut clients = Vec::with_capacity(uris.len());
        for uri in uris {
            clients.push(Client::with_uri_str(uri).await?);
        }
        Ok(Self { clients: Arc::new(clients) })
    }

    pub fn client_for(&self, shard_index: usize) -> &Client {
        &self.clients[shard_index % self.clients.len()]
    }

    pub fn database_for(&self, shard_index: usize, db_name: &str) -> Database {
        self.client_for(shard_index).database(db_name)
    }

    pub fn global_database(&self) -> Database {
        self.clients[0].database("logjam-global")
    }

    /// No-op ping issued every 5 ticks by the updater/writer pools.
    pub async fn ping_all(&self) {
        for client in self.clients.iter() {
            if let Err(e) = client.database("admin").run_command(doc! {"ping": 1}).await {
                warn!(error = %e, "shard ping failed");
            }
        }
    }
}

/// Per-database collection handles, dropped and rebuilt on the staggered
/// `3600 - (id+1)` tick cadence.
#[derive(Default)]
pub struct CollectionCache {
    totals: HashMap<String, Collection<Document>>,
    minutes: HashMap<String, Collection<Document>>,
    quants: HashMap<String, Collection<Document>>,
    requests: HashMap<String, Collection<Document>>,
    js_exceptions: HashMap<String, Collection<Document>>,
    events: HashMap<String, Collection<Document>>,
}

macro_rules! cached_collection {
    ($name:ident, $field:ident, $coll:literal) => {
        pub fn $name(&mut self, db: &Database) -> Collection<Document> {
            self.$field
                .entry(db.name().to_string())
                .or_insert_with(|| db.collection($coll))
                .clone()
        }
    };
}

impl CollectionCache {
    pub fn clear(&mut self) {
        self.totals.clear();
        self.minutes.clear();
        self.quants.clear();
        self.requests.clear();
        self.js_exceptions.clear();
        self.events.clear();
    }

    cached_collection!(totals, totals, "totals");
    cached_collection!(minutes, minutes, "minutes");
    cached_collection!(quants, quants, "quants");
    cached_collection!(requests, requests, "requests");
    cached_collection!(js_exceptions, js_exceptions, "js_exceptions");
    cached_collection!(events, events, "events");
}

/// Staggered cache-rebuild interval for instance `id` of a 10-member pool,
/// per spec.md section 4.4/section 4.5 ("every `3600 - (id+1)` ticks").
pub fn cache_rebuild_interval(id: usize) -> u64 {
    3600 - (id as u64 + 1)
}
